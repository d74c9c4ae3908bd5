//! Framed slave link
//!
//! Both ends speak the same frames: an 11-byte header (see
//! `protocol_core::FrameHeader`) and a bincode payload. The master
//! side multiplexes concurrent RPCs over one connection by request index.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use super::transport::{
    ConnectInfo, Request, Response, SlaveOp, SlaveReply, SlaveTransport, TransferId,
    TransferProgress, WireError,
};
use crate::error::RemoteError;
use crate::listing::ListingEntry;
use crate::protocol::frame;
use crate::protocol::timeouts::{read_deadline_ms, write_deadline_ms, RPC_MS};
use crate::protocol_core::{validate_frame_size, FrameHeader, HEADER_LEN};

pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, t: u8, payload: &[u8]) -> Result<()> {
    validate_frame_size(payload.len())?;
    let ms = write_deadline_ms(payload.len());
    match timeout(Duration::from_millis(ms), async {
        let hdr = FrameHeader::new(t, payload.len() as u32).encode();
        stream.write_all(&hdr).await?;
        if !payload.is_empty() {
            stream.write_all(payload).await?;
        }
        stream.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(result) => Ok(result?),
        Err(_) => bail!("frame write timeout ({} ms)", ms),
    }
}

/// Read one frame. Waiting for the header is unbounded (links idle between
/// requests); the payload must follow within its deadline.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<(u8, Vec<u8>)> {
    let mut raw = [0u8; HEADER_LEN];
    stream.read_exact(&mut raw).await?;
    let hdr = FrameHeader::decode(&raw)?;
    let len = hdr.len as usize;
    validate_frame_size(len)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        let ms = read_deadline_ms(len);
        match timeout(Duration::from_millis(ms), stream.read_exact(&mut payload)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => bail!("frame payload timeout ({} ms)", ms),
        }
    }
    Ok((hdr.kind, payload))
}

/// How a slave link ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEnd {
    /// The slave said GOODBYE
    Goodbye,
    /// The connection failed or closed without GOODBYE
    Lost(String),
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<SlaveReply, WireError>>>>>;

/// Master-side RPC client for one slave connection
pub struct NetTransport {
    peer: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Pending,
    next_index: AtomicU64,
    closed: Arc<AtomicBool>,
}

/// Complete the HELLO exchange on an accepted slave connection.
///
/// Returns the slave's name, the transport, and the reader task; the task
/// finishes when the link ends. `accept` decides whether the name may
/// register (duplicate live names are refused).
pub async fn accept_slave<F>(
    mut stream: TcpStream,
    accept: F,
) -> Result<(String, Arc<NetTransport>, JoinHandle<LinkEnd>)>
where
    F: FnOnce(&str) -> std::result::Result<(), String>,
{
    let _ = stream.set_nodelay(true);
    let peer = stream.peer_addr().context("slave peer address")?;
    let (typ, payload) = timeout(Duration::from_millis(RPC_MS), read_frame(&mut stream))
        .await
        .context("HELLO timeout")??;
    if typ != frame::HELLO {
        bail!("expected HELLO from {}, got frame {}", peer, typ);
    }
    let name: String = bincode::deserialize(&payload).context("decode HELLO")?;
    if let Err(reason) = accept(&name) {
        let _ = write_frame(&mut stream, frame::REJECT, reason.as_bytes()).await;
        bail!("rejected slave {} from {}: {}", name, peer, reason);
    }
    write_frame(&mut stream, frame::WELCOME, &[]).await?;

    let (mut reader, writer) = stream.into_split();
    let transport = Arc::new(NetTransport {
        peer,
        writer: tokio::sync::Mutex::new(writer),
        pending: Arc::new(Mutex::new(HashMap::new())),
        next_index: AtomicU64::new(1),
        closed: Arc::new(AtomicBool::new(false)),
    });

    let pending = transport.pending.clone();
    let closed = transport.closed.clone();
    let slave_name = name.clone();
    let task = tokio::spawn(async move {
        let end = loop {
            match read_frame(&mut reader).await {
                Ok((frame::RESPONSE, payload)) => match bincode::deserialize::<Response>(&payload) {
                    Ok(resp) => {
                        if let Some(tx) = pending.lock().remove(&resp.index) {
                            let _ = tx.send(resp.result);
                        } else {
                            debug!("late response {} from {}", resp.index, slave_name);
                        }
                    }
                    Err(e) => break LinkEnd::Lost(format!("bad response: {}", e)),
                },
                Ok((frame::GOODBYE, _)) => break LinkEnd::Goodbye,
                Ok((other, _)) => warn!("unexpected frame {} from {}", other, slave_name),
                Err(e) => break LinkEnd::Lost(e.to_string()),
            }
        };
        closed.store(true, Ordering::Release);
        // waiting callers see their sender dropped
        pending.lock().clear();
        end
    });

    Ok((name, transport, task))
}

impl NetTransport {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn call(&self, op: SlaveOp) -> Result<SlaveReply, RemoteError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RemoteError::Communication("slave link closed".into()));
        }
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let payload = bincode::serialize(&Request { index, op })
            .map_err(|e| RemoteError::Communication(format!("encode request: {}", e)))?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(index, tx);

        let written = {
            let mut w = self.writer.lock().await;
            write_frame(&mut *w, frame::REQUEST, &payload).await
        };
        if let Err(e) = written {
            self.pending.lock().remove(&index);
            return Err(RemoteError::Communication(e.to_string()));
        }

        match timeout(Duration::from_millis(RPC_MS), rx).await {
            Ok(Ok(result)) => result.map_err(RemoteError::from),
            Ok(Err(_)) => Err(RemoteError::Communication("slave link closed".into())),
            Err(_) => {
                self.pending.lock().remove(&index);
                Err(RemoteError::Communication(format!("no reply within {} ms", RPC_MS)))
            }
        }
    }
}

fn unexpected(reply: SlaveReply) -> RemoteError {
    RemoteError::Io(format!("unexpected reply {:?}", reply))
}

#[async_trait]
impl SlaveTransport for NetTransport {
    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        match self.call(SlaveOp::Delete { path: path.to_string() }).await? {
            SlaveReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn rename(&self, from: &str, to_dir: &str, to_name: &str) -> Result<(), RemoteError> {
        let op = SlaveOp::Rename {
            from: from.to_string(),
            to_dir: to_dir.to_string(),
            to_name: to_name.to_string(),
        };
        match self.call(op).await? {
            SlaveReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn checksum(&self, path: &str) -> Result<u64, RemoteError> {
        match self.call(SlaveOp::Checksum { path: path.to_string() }).await? {
            SlaveReply::Checksum(sum) => Ok(sum),
            other => Err(unexpected(other)),
        }
    }

    async fn listing(&self, path: &str, recursive: bool) -> Result<ListingEntry, RemoteError> {
        let op = SlaveOp::Listing {
            path: path.to_string(),
            recursive,
        };
        match self.call(op).await? {
            SlaveReply::Listing(l) => Ok(l),
            other => Err(unexpected(other)),
        }
    }

    async fn listen(&self, encrypted: bool, client_mode: bool) -> Result<ConnectInfo, RemoteError> {
        match self.call(SlaveOp::Listen { encrypted, client_mode }).await? {
            SlaveReply::Connect(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    async fn connect(
        &self,
        addr: SocketAddr,
        encrypted: bool,
        client_mode: bool,
    ) -> Result<ConnectInfo, RemoteError> {
        let op = SlaveOp::Connect {
            addr,
            encrypted,
            client_mode,
        };
        match self.call(op).await? {
            SlaveReply::Connect(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    async fn send_file(&self, id: TransferId, path: &str, offset: u64) -> Result<(), RemoteError> {
        let op = SlaveOp::Send {
            id,
            path: path.to_string(),
            offset,
        };
        match self.call(op).await? {
            SlaveReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn receive_file(&self, id: TransferId, path: &str, offset: u64) -> Result<(), RemoteError> {
        let op = SlaveOp::Receive {
            id,
            path: path.to_string(),
            offset,
        };
        match self.call(op).await? {
            SlaveReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn status(&self, id: TransferId) -> Result<TransferProgress, RemoteError> {
        match self.call(SlaveOp::Status { id }).await? {
            SlaveReply::Status(p) => Ok(p),
            other => Err(unexpected(other)),
        }
    }

    async fn abort(&self, id: TransferId, reason: &str) -> Result<(), RemoteError> {
        let op = SlaveOp::Abort {
            id,
            reason: reason.to_string(),
        };
        match self.call(op).await? {
            SlaveReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_over_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, frame::REQUEST, b"hello").await.unwrap();
        write_frame(&mut a, frame::GOODBYE, &[]).await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), (frame::REQUEST, b"hello".to_vec()));
        assert_eq!(read_frame(&mut b).await.unwrap(), (frame::GOODBYE, Vec::new()));
    }

    #[tokio::test]
    async fn read_frame_rejects_garbage() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"NOTAFRAME!!").await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }
}
