use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;

/// SHA-256 of a file's full content as lowercase hex, read `chunk_size`
/// bytes at a time.  Each call starts from a fresh hasher.
pub async fn hash_file(path: &Path, chunk_size: usize) -> io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; chunk_size.max(1)];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn hash_bytes(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}
