//! Shared protocol logic used by both ends of the slave link
//!
//! Frame headers, virtual path helpers and the slave-side mapping of
//! virtual paths onto the local storage root.

use anyhow::{bail, Context, Result};
use std::path::{Component, Path, PathBuf};

use crate::protocol::{MAGIC, MAX_FRAME_SIZE, VERSION};

/// Map a virtual path onto a file below a slave's storage root.
///
/// Virtual paths are absolute, so a leading `/` is fine. `..`, NUL bytes and
/// symlinks that lead out of the root are refused. The target itself need not
/// exist; its closest existing ancestor is what gets canonicalized.
pub fn normalize_under_root(root: &Path, p: &Path) -> Result<PathBuf> {
    if p.as_os_str().to_string_lossy().contains('\0') {
        bail!("NUL byte in path {:?}", p);
    }
    let mut rel = PathBuf::new();
    for part in p.components() {
        match part {
            Component::Normal(s) => rel.push(s),
            Component::CurDir | Component::RootDir => {}
            other => bail!("{:?} not allowed in virtual path {:?}", other, p),
        }
    }

    let canon_root = root
        .canonicalize()
        .with_context(|| format!("storage root {:?}", root))?;
    let full = canon_root.join(&rel);

    // walk up to the deepest ancestor on disk, resolve it, re-append the rest
    let mut existing = full.as_path();
    let mut tail = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_owned());
                existing = parent;
            }
            _ => break,
        }
    }
    let mut resolved = existing
        .canonicalize()
        .with_context(|| format!("resolve {:?}", existing))?;
    resolved.extend(tail.iter().rev());

    if !resolved.starts_with(&canon_root) {
        bail!("{:?} leads outside {:?}", p, root);
    }
    Ok(resolved)
}

/// Payload limit of one slave-link frame
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        bail!("frame of {} bytes exceeds the {} byte limit", size, MAX_FRAME_SIZE);
    }
    Ok(())
}

pub const HEADER_LEN: usize = 11;

/// Slave-link frame header: `MAGIC(4) VERSION(2, le) KIND(1) LEN(4, le)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: u8,
    pub len: u32,
}

impl FrameHeader {
    pub fn new(kind: u8, len: u32) -> Self {
        Self { kind, len }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let (magic, rest) = out.split_at_mut(4);
        magic.copy_from_slice(MAGIC);
        rest[..2].copy_from_slice(&VERSION.to_le_bytes());
        rest[2] = self.kind;
        rest[3..].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(raw: &[u8; HEADER_LEN]) -> Result<Self> {
        if &raw[..4] != MAGIC {
            bail!("not a slave-link frame (magic {:02x?})", &raw[..4]);
        }
        let version = u16::from_le_bytes([raw[4], raw[5]]);
        if version != VERSION {
            bail!("slave link version {} is not supported (want {})", version, VERSION);
        }
        Ok(Self {
            kind: raw[6],
            len: u32::from_le_bytes([raw[7], raw[8], raw[9], raw[10]]),
        })
    }
}

/// A name may be stored in the tree: non-empty, no separator, no wildcard,
/// and not one of the relative components.
pub fn is_legal_file_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('*') && name != "." && name != ".."
}

/// Join a directory path and a child name into an absolute virtual path
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// Split an absolute virtual path into (parent, name); the root has no parent
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    let pos = trimmed.rfind('/')?;
    let name = &trimmed[pos + 1..];
    if name.is_empty() {
        return None;
    }
    let parent = if pos == 0 { "/" } else { &trimmed[..pos] };
    Some((parent, name))
}

/// Create the missing directories above `path`
pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir)
            .with_context(|| format!("create {:?}", dir)),
        _ => Ok(()),
    }
}
