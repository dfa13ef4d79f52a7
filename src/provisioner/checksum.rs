//! SHA-256 helpers for artifact verification

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

const READ_CHUNK: usize = 1024 * 1024;

/// Hex digest of an in-memory buffer
pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hex digest of a file, computed on the blocking pool so multi-gigabyte
/// models never stall the async workers
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; READ_CHUNK];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

/// Compare digests case-insensitively
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}
