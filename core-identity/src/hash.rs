//! Content hashing for exact-byte track identification.

use crate::error::{IdentifyError, Result};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// SHA-256 of a file's contents as a lowercase hex string
///
/// Reads in chunks so large audio files are never held in memory whole.
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| IdentifyError::Io {
        path: path.display().to_string(),
        source: e,
    })?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf).await.map_err(|e| IdentifyError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(to_hex(&hasher.finalize()))
}

/// SHA-256 of an in-memory buffer as a lowercase hex string
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    to_hex(&hasher.finalize())
}

fn to_hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
