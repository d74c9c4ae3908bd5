//! Slave daemon: serves the master's RPCs against a local storage root

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use super::data::DataTransfers;
use super::net::{read_frame, write_frame};
use super::transport::{Request, Response, SlaveOp, SlaveReply, WireError};
use crate::checksum::checksum_file;
use crate::listing::{enumerate_dir, ListingFilter};
use crate::protocol::frame;
use crate::protocol_core::{ensure_parent_exists, normalize_under_root, split_path};

pub struct SlaveServer {
    root: PathBuf,
    data: Arc<DataTransfers>,
}

fn io_err(e: impl std::fmt::Display) -> WireError {
    WireError::Io(format!("{:#}", e))
}

impl SlaveServer {
    pub fn new(root: &Path, advertise_ip: IpAddr, acceptor: Option<TlsAcceptor>) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("canonicalize root {}", root.display()))?;
        if !root.is_dir() {
            bail!("root {} is not a directory", root.display());
        }
        Ok(Self {
            root,
            data: Arc::new(DataTransfers::new(advertise_ip, acceptor)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn local(&self, path: &str) -> Result<PathBuf, WireError> {
        normalize_under_root(&self.root, Path::new(path)).map_err(io_err)
    }

    fn existing(&self, path: &str) -> Result<PathBuf, WireError> {
        let local = self.local(path)?;
        if !local.exists() {
            return Err(WireError::NotFound(path.to_string()));
        }
        Ok(local)
    }

    /// Execute one operation
    pub async fn handle(&self, op: SlaveOp) -> Result<SlaveReply, WireError> {
        match op {
            SlaveOp::Delete { path } => {
                let local = self.existing(&path)?;
                if local.is_dir() {
                    tokio::fs::remove_dir_all(&local).await.map_err(io_err)?;
                } else {
                    tokio::fs::remove_file(&local).await.map_err(io_err)?;
                }
                self.remove_empty_parents(&local).await;
                info!("deleted {}", path);
                Ok(SlaveReply::Done)
            }
            SlaveOp::Rename { from, to_dir, to_name } => {
                let src = self.existing(&from)?;
                let target = format!("{}/{}", to_dir.trim_end_matches('/'), to_name);
                let dst = self.local(&target)?;
                if dst.exists() {
                    return Err(WireError::Io(format!("{} already exists", target)));
                }
                ensure_parent_exists(&dst).map_err(io_err)?;
                tokio::fs::rename(&src, &dst).await.map_err(io_err)?;
                self.remove_empty_parents(&src).await;
                info!("renamed {} to {}", from, target);
                Ok(SlaveReply::Done)
            }
            SlaveOp::Checksum { path } => {
                let local = self.existing(&path)?;
                let sum = tokio::task::spawn_blocking(move || checksum_file(&local))
                    .await
                    .map_err(io_err)?
                    .map_err(io_err)?;
                Ok(SlaveReply::Checksum(sum))
            }
            SlaveOp::Listing { path, recursive } => {
                let local = self.existing(&path)?;
                if !local.is_dir() {
                    return Err(WireError::Io(format!("{} is not a directory", path)));
                }
                let name = split_path(&path).map(|(_, n)| n.to_string()).unwrap_or_default();
                let listing = tokio::task::spawn_blocking(move || {
                    enumerate_dir(&local, &name, &ListingFilter::default(), recursive)
                })
                .await
                .map_err(io_err)?
                .map_err(io_err)?;
                debug!("listing of {}: {} files", path, listing.file_count());
                Ok(SlaveReply::Listing(listing))
            }
            SlaveOp::Listen { encrypted, client_mode } => {
                let info = self.data.listen(encrypted, client_mode).await.map_err(io_err)?;
                Ok(SlaveReply::Connect(info))
            }
            SlaveOp::Connect {
                addr,
                encrypted,
                client_mode,
            } => {
                let info = self.data.connect(addr, encrypted, client_mode).map_err(io_err)?;
                Ok(SlaveReply::Connect(info))
            }
            SlaveOp::Send { id, path, offset } => {
                let local = self.existing(&path)?;
                self.data.send(id, local, offset).map_err(io_err)?;
                Ok(SlaveReply::Done)
            }
            SlaveOp::Receive { id, path, offset } => {
                let local = self.local(&path)?;
                self.data.receive(id, local, offset).map_err(io_err)?;
                Ok(SlaveReply::Done)
            }
            SlaveOp::Status { id } => Ok(SlaveReply::Status(self.data.status(id).map_err(io_err)?)),
            SlaveOp::Abort { id, reason } => {
                self.data.abort(id, &reason).map_err(io_err)?;
                Ok(SlaveReply::Done)
            }
        }
    }

    /// Directories emptied by a delete or rename go too, up to the root
    async fn remove_empty_parents(&self, path: &Path) {
        let mut cur = path.parent().map(Path::to_path_buf);
        while let Some(dir) = cur {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            if tokio::fs::remove_dir(&dir).await.is_err() {
                break;
            }
            cur = dir.parent().map(Path::to_path_buf);
        }
    }

    /// Register with the master as `name` and serve until the link ends or
    /// ctrl-c, in which case the master is told GOODBYE.
    pub async fn run(self: Arc<Self>, master: &str, name: &str) -> Result<()> {
        let mut stream = TcpStream::connect(master)
            .await
            .with_context(|| format!("connect to master {}", master))?;
        let _ = stream.set_nodelay(true);
        let hello = bincode::serialize(&name.to_string())?;
        write_frame(&mut stream, frame::HELLO, &hello).await?;
        match read_frame(&mut stream).await? {
            (frame::WELCOME, _) => info!("registered with master {} as {}", master, name),
            (frame::REJECT, reason) => {
                bail!("master rejected us: {}", String::from_utf8_lossy(&reason))
            }
            (other, _) => bail!("unexpected frame {} during registration", other),
        }

        let (mut reader, writer) = stream.into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        loop {
            let next = tokio::select! {
                r = read_frame(&mut reader) => r,
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down, saying goodbye to master");
                    let mut w = writer.lock().await;
                    write_frame(&mut *w, frame::GOODBYE, &[]).await?;
                    return Ok(());
                }
            };
            let (typ, payload) = next.context("master link")?;
            if typ != frame::REQUEST {
                warn!("ignoring frame {} from master", typ);
                continue;
            }
            let req: Request = match bincode::deserialize(&payload) {
                Ok(r) => r,
                Err(e) => {
                    error!("undecodable request: {}", e);
                    continue;
                }
            };
            let this = self.clone();
            let writer = writer.clone();
            tokio::spawn(async move {
                let result = this.handle(req.op).await;
                let resp = Response {
                    index: req.index,
                    result,
                };
                match bincode::serialize(&resp) {
                    Ok(bytes) => {
                        let mut w = writer.lock().await;
                        if let Err(e) = write_frame(&mut *w, frame::RESPONSE, &bytes).await {
                            warn!("failed to answer request {}: {:#}", req.index, e);
                        }
                    }
                    Err(e) => error!("cannot encode response {}: {}", req.index, e),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn server(root: &Path) -> SlaveServer {
        SlaveServer::new(root, IpAddr::V4(Ipv4Addr::LOCALHOST), None).unwrap()
    }

    #[tokio::test]
    async fn delete_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let s = server(dir.path());
        let r = s.handle(SlaveOp::Delete { path: "/nope".into() }).await;
        assert!(matches!(r, Err(WireError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_removes_file_and_empty_parents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/f"), b"x").unwrap();
        let s = server(dir.path());
        s.handle(SlaveOp::Delete { path: "/a/b/f".into() }).await.unwrap();
        assert!(!dir.path().join("a").exists());
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn rename_moves_into_new_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/f"), b"x").unwrap();
        let s = server(dir.path());
        s.handle(SlaveOp::Rename {
            from: "/a/f".into(),
            to_dir: "/b".into(),
            to_name: "f.slave1".into(),
        })
        .await
        .unwrap();
        assert!(dir.path().join("b/f.slave1").exists());
        assert!(!dir.path().join("a").exists());
    }

    #[tokio::test]
    async fn checksum_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("section")).unwrap();
        std::fs::write(dir.path().join("section/f"), b"payload").unwrap();
        let s = server(dir.path());
        match s.handle(SlaveOp::Checksum { path: "/section/f".into() }).await.unwrap() {
            SlaveReply::Checksum(sum) => assert_eq!(sum, crate::checksum::checksum_bytes(b"payload")),
            other => panic!("unexpected {:?}", other),
        }
        let listing = |path: &str, recursive| SlaveOp::Listing {
            path: path.into(),
            recursive,
        };
        match s.handle(listing("/", true)).await.unwrap() {
            SlaveReply::Listing(l) => {
                assert_eq!(l.child("section").unwrap().child("f").unwrap().length(), 7)
            }
            other => panic!("unexpected {:?}", other),
        }
        match s.handle(listing("/", false)).await.unwrap() {
            SlaveReply::Listing(l) => assert!(l.child("section").unwrap().entries().is_empty()),
            other => panic!("unexpected {:?}", other),
        }
        match s.handle(listing("/section", true)).await.unwrap() {
            SlaveReply::Listing(l) => {
                assert_eq!(l.name, "section");
                assert_eq!(l.child("f").unwrap().length(), 7);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            s.handle(listing("/gone", true)).await,
            Err(WireError::NotFound(_))
        ));
        assert!(matches!(
            s.handle(listing("/section/f", true)).await,
            Err(WireError::Io(_))
        ));
    }

    #[tokio::test]
    async fn paths_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let s = server(dir.path());
        let r = s.handle(SlaveOp::Checksum { path: "/../etc/passwd".into() }).await;
        assert!(matches!(r, Err(WireError::Io(_))));
    }
}
