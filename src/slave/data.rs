//! Slave-side data channels
//!
//! A transfer is set up in two steps, mirroring the client's PORT/PASV then
//! RETR/STOR: `listen`/`connect` creates it and fixes the address, and
//! `send`/`receive` start moving bytes in a background task. The master polls
//! `status` until the transfer reports finished.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::{timeout, Duration};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::transport::{ConnectInfo, TransferId, TransferProgress};
use crate::checksum::{self, Checksummer};
use crate::protocol::timeouts::DATA_ACCEPT_MS;

const CHUNK: usize = 64 * 1024;

pub trait DataStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DataStream for T {}

enum Endpoint {
    Listening(TcpListener),
    Connecting(SocketAddr),
}

struct DataTransfer {
    endpoint: Mutex<Option<Endpoint>>,
    encrypted: bool,
    /// SSCN ON: the slave takes the TLS client role
    client_mode: bool,
    progress: Mutex<TransferProgress>,
    aborted: AtomicBool,
    abort_notify: Notify,
}

impl DataTransfer {
    fn fail(&self, err: String) {
        let mut p = self.progress.lock();
        p.error = Some(err);
        p.finished = true;
    }
}

/// Registry of the transfers one slave is running
pub struct DataTransfers {
    advertise_ip: IpAddr,
    acceptor: Option<TlsAcceptor>,
    connector: TlsConnector,
    next_id: AtomicU64,
    transfers: Mutex<HashMap<TransferId, Arc<DataTransfer>>>,
}

impl DataTransfers {
    pub fn new(advertise_ip: IpAddr, acceptor: Option<TlsAcceptor>) -> Self {
        Self {
            advertise_ip,
            acceptor,
            connector: crate::tls::data_channel_connector(),
            next_id: AtomicU64::new(1),
            transfers: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, endpoint: Endpoint, encrypted: bool, client_mode: bool) -> TransferId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let t = Arc::new(DataTransfer {
            endpoint: Mutex::new(Some(endpoint)),
            encrypted,
            client_mode,
            progress: Mutex::new(TransferProgress::default()),
            aborted: AtomicBool::new(false),
            abort_notify: Notify::new(),
        });
        self.transfers.lock().insert(id, t);
        id
    }

    fn get(&self, id: TransferId) -> Result<Arc<DataTransfer>> {
        self.transfers
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("no such transfer {}", id))
    }

    /// Open a passive socket on an ephemeral port
    pub async fn listen(&self, encrypted: bool, client_mode: bool) -> Result<ConnectInfo> {
        if encrypted && !client_mode && self.acceptor.is_none() {
            bail!("TLS not configured on this slave");
        }
        let listener = TcpListener::bind((IpAddr::from([0, 0, 0, 0]), 0))
            .await
            .context("bind passive socket")?;
        let port = listener.local_addr()?.port();
        let addr = SocketAddr::new(self.advertise_ip, port);
        let id = self.insert(Endpoint::Listening(listener), encrypted, client_mode);
        debug!("transfer {} listening on {}", id, addr);
        Ok(ConnectInfo { transfer: id, addr })
    }

    /// Record the client's active address; the connection is made on start
    pub fn connect(&self, addr: SocketAddr, encrypted: bool, client_mode: bool) -> Result<ConnectInfo> {
        if encrypted && !client_mode && self.acceptor.is_none() {
            bail!("TLS not configured on this slave");
        }
        let id = self.insert(Endpoint::Connecting(addr), encrypted, client_mode);
        Ok(ConnectInfo { transfer: id, addr })
    }

    pub fn send(self: &Arc<Self>, id: TransferId, path: PathBuf, offset: u64) -> Result<()> {
        if !path.is_file() {
            bail!("{}: not a file", path.display());
        }
        self.start(id, path, offset, true)
    }

    pub fn receive(self: &Arc<Self>, id: TransferId, path: PathBuf, offset: u64) -> Result<()> {
        self.start(id, path, offset, false)
    }

    fn start(self: &Arc<Self>, id: TransferId, path: PathBuf, offset: u64, sending: bool) -> Result<()> {
        let t = self.get(id)?;
        let endpoint = t
            .endpoint
            .lock()
            .take()
            .ok_or_else(|| anyhow!("transfer {} already started", id))?;
        let this = self.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = async {
                let stream = this.open(&t, endpoint).await?;
                if sending {
                    pump_file_out(&t, stream, &path, offset, started).await
                } else {
                    pump_file_in(&t, stream, &path, offset, started).await
                }
            }
            .await;
            match result {
                Ok(()) => {
                    let mut p = t.progress.lock();
                    p.elapsed_ms = started.elapsed().as_millis() as u64;
                    p.finished = true;
                    info!(
                        "transfer {} {} {} done: {} bytes",
                        id,
                        if sending { "send" } else { "receive" },
                        path.display(),
                        p.transferred
                    );
                }
                Err(e) => {
                    warn!("transfer {} on {} failed: {:#}", id, path.display(), e);
                    t.fail(format!("{:#}", e));
                }
            }
        });
        Ok(())
    }

    async fn open(&self, t: &DataTransfer, endpoint: Endpoint) -> Result<Box<dyn DataStream>> {
        let tcp = match endpoint {
            Endpoint::Listening(listener) => {
                let accepted = tokio::select! {
                    r = timeout(Duration::from_millis(DATA_ACCEPT_MS), listener.accept()) => r,
                    _ = t.abort_notify.notified() => bail!("aborted before connect"),
                };
                match accepted {
                    Ok(Ok((s, peer))) => {
                        debug!("data connection from {}", peer);
                        s
                    }
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => bail!("no data connection within {} ms", DATA_ACCEPT_MS),
                }
            }
            Endpoint::Connecting(addr) => {
                timeout(Duration::from_millis(DATA_ACCEPT_MS), TcpStream::connect(addr))
                    .await
                    .map_err(|_| anyhow!("connect to {} timed out", addr))?
                    .with_context(|| format!("connect to {}", addr))?
            }
        };
        let _ = tcp.set_nodelay(true);
        if !t.encrypted {
            return Ok(Box::new(tcp));
        }
        if t.client_mode {
            let peer = tcp.peer_addr()?;
            let name = crate::tls::server_name_for(&peer.ip().to_string())?;
            let tls = self.connector.connect(name, tcp).await.context("TLS connect")?;
            Ok(Box::new(tls))
        } else {
            let acceptor = self
                .acceptor
                .as_ref()
                .ok_or_else(|| anyhow!("TLS not configured on this slave"))?;
            let tls = acceptor.accept(tcp).await.context("TLS accept")?;
            Ok(Box::new(tls))
        }
    }

    /// Progress of a transfer; a finished transfer is forgotten once reported
    pub fn status(&self, id: TransferId) -> Result<TransferProgress> {
        let t = self.get(id)?;
        let p = t.progress.lock().clone();
        if p.finished {
            self.transfers.lock().remove(&id);
        }
        Ok(p)
    }

    pub fn abort(&self, id: TransferId, reason: &str) -> Result<()> {
        let t = self.get(id)?;
        t.aborted.store(true, Ordering::Release);
        t.abort_notify.notify_one();
        if t.endpoint.lock().take().is_some() {
            // never started
            t.fail(format!("aborted: {}", reason));
        }
        debug!("transfer {} aborted: {}", id, reason);
        Ok(())
    }

    pub fn active(&self) -> usize {
        self.transfers.lock().len()
    }
}

async fn pump_file_out(
    t: &DataTransfer,
    mut stream: Box<dyn DataStream>,
    path: &Path,
    offset: u64,
    started: Instant,
) -> Result<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset)).await?;
    }
    let mut sum = Checksummer::new();
    let mut buf = vec![0u8; CHUNK];
    loop {
        if t.aborted.load(Ordering::Acquire) {
            bail!("aborted");
        }
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await?;
        sum.update(&buf[..n]);
        let mut p = t.progress.lock();
        p.transferred += n as u64;
        p.elapsed_ms = started.elapsed().as_millis() as u64;
    }
    stream.shutdown().await.ok();
    t.progress.lock().checksum = if offset == 0 { sum.finalize() } else { checksum::UNKNOWN };
    Ok(())
}

async fn pump_file_in(
    t: &DataTransfer,
    mut stream: Box<dyn DataStream>,
    path: &Path,
    offset: u64,
    started: Instant,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = if offset > 0 {
        let mut f = tokio::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .with_context(|| format!("open {} for resume", path.display()))?;
        f.set_len(offset).await?;
        f.seek(SeekFrom::Start(offset)).await?;
        f
    } else {
        tokio::fs::File::create(path)
            .await
            .with_context(|| format!("create {}", path.display()))?
    };
    let mut sum = Checksummer::new();
    let mut buf = vec![0u8; CHUNK];
    loop {
        if t.aborted.load(Ordering::Acquire) {
            bail!("aborted");
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        sum.update(&buf[..n]);
        let mut p = t.progress.lock();
        p.transferred += n as u64;
        p.elapsed_ms = started.elapsed().as_millis() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    t.progress.lock().checksum = if offset == 0 { sum.finalize() } else { checksum::UNKNOWN };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    async fn wait_finished(reg: &DataTransfers, id: TransferId) -> TransferProgress {
        loop {
            let p = reg.status(id).unwrap();
            if p.finished {
                return p;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn passive_send_streams_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"some file body").unwrap();

        let reg = Arc::new(DataTransfers::new(IpAddr::V4(Ipv4Addr::LOCALHOST), None));
        let info = reg.listen(false, false).await.unwrap();
        reg.send(info.transfer, path.clone(), 5).unwrap();

        let mut client = TcpStream::connect(info.addr).await.unwrap();
        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"file body");

        let p = wait_finished(&reg, info.transfer).await;
        assert_eq!(p.transferred, 9);
        assert!(p.error.is_none());
        // forgotten once reported finished
        assert!(reg.status(info.transfer).is_err());
    }

    #[tokio::test]
    async fn active_receive_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/upload");
        let client = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = client.local_addr().unwrap();

        let reg = Arc::new(DataTransfers::new(IpAddr::V4(Ipv4Addr::LOCALHOST), None));
        let info = reg.connect(addr, false, false).unwrap();
        reg.receive(info.transfer, path.clone(), 0).unwrap();

        let (mut s, _) = client.accept().await.unwrap();
        s.write_all(b"uploaded").await.unwrap();
        drop(s);

        let p = wait_finished(&reg, info.transfer).await;
        assert_eq!(p.transferred, 8);
        assert_eq!(p.checksum, checksum::checksum_bytes(b"uploaded"));
        assert_eq!(std::fs::read(&path).unwrap(), b"uploaded");
    }

    #[tokio::test]
    async fn abort_before_start_fails_transfer() {
        let reg = Arc::new(DataTransfers::new(IpAddr::V4(Ipv4Addr::LOCALHOST), None));
        let info = reg.listen(false, false).await.unwrap();
        reg.abort(info.transfer, "client gone").unwrap();
        let p = reg.status(info.transfer).unwrap();
        assert!(p.finished);
        assert!(p.error.unwrap().contains("client gone"));
    }

    #[tokio::test]
    async fn encrypted_listen_needs_certificate() {
        let reg = DataTransfers::new(IpAddr::V4(Ipv4Addr::LOCALHOST), None);
        assert!(reg.listen(true, false).await.is_err());
        // client role needs no certificate
        assert!(reg.listen(true, true).await.is_ok());
    }
}
