//! Checksum utilities
//!
//! Files are identified by a 64-bit digest: the first 8 bytes of their
//! blake3 hash. `0` is reserved for "unknown" throughout the tree, so a real
//! digest of zero is remapped to one.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

/// Sentinel stored in the tree for "checksum not known"
pub const UNKNOWN: u64 = 0;

/// Incremental checksum over a byte stream
pub struct Checksummer {
    hasher: blake3::Hasher,
}

impl Checksummer {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(&self) -> u64 {
        digest_to_u64(self.hasher.finalize().as_bytes())
    }
}

impl Default for Checksummer {
    fn default() -> Self {
        Self::new()
    }
}

fn digest_to_u64(bytes: &[u8; 32]) -> u64 {
    let mut first = [0u8; 8];
    first.copy_from_slice(&bytes[..8]);
    match u64::from_le_bytes(first) {
        UNKNOWN => 1,
        v => v,
    }
}

/// Compute checksum for an in-memory buffer
pub fn checksum_bytes(data: &[u8]) -> u64 {
    digest_to_u64(blake3::hash(data).as_bytes())
}

/// Compute checksum for a file on local disk (slave side)
pub fn checksum_file(path: &Path) -> Result<u64> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("open {} for checksum", path.display()))?;
    let mut sum = Checksummer::new();
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sum.update(&buf[..n]);
    }
    Ok(sum.finalize())
}

/// Hex representation used in replies and logs
pub fn format_checksum(value: u64) -> String {
    format!("{:016X}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_matches_one_shot() {
        let data = b"Hello, World! Hello, World!";
        let mut sum = Checksummer::new();
        sum.update(&data[..5]);
        sum.update(&data[5..]);
        assert_eq!(sum.finalize(), checksum_bytes(data));
        assert_ne!(sum.finalize(), UNKNOWN);
    }

    #[test]
    fn test_checksum_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"payload").unwrap();
        assert_eq!(checksum_file(&path).unwrap(), checksum_bytes(b"payload"));
        assert!(checksum_file(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_format_checksum() {
        assert_eq!(format_checksum(0xABCD), "000000000000ABCD");
    }
}
