//! SHA256 content hashing
//!
//! Hashes are rendered as `sha256-<hex>`, the same form used as blob object
//! keys. The ingest services treat them as opaque strings.

use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_BUF_SIZE: usize = 64 * 1024;

/// Digest and byte count of a fully consumed stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedContent {
    pub hash: String,
    pub size: u64,
}

/// Compute SHA256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format_digest(hasher)
}

fn format_digest(hasher: Sha256) -> String {
    format!("sha256-{}", hex::encode(hasher.finalize()))
}

/// Hash a stream to the end, counting bytes
pub async fn hash_reader<R>(reader: &mut R) -> std::io::Result<HashedContent>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut size = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok(HashedContent {
        hash: format_digest(hasher),
        size,
    })
}

/// Hash a file on disk without loading it into memory
pub async fn hash_file<P: AsRef<Path>>(path: P) -> std::io::Result<HashedContent> {
    let mut file = tokio::fs::File::open(path).await?;
    hash_reader(&mut file).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash() {
        let hash = compute_hash(b"test");
        assert!(hash.starts_with("sha256-"));
        assert_eq!(hash.len(), 7 + 64); // "sha256-" + 64 hex chars
        assert_eq!(
            hash,
            "sha256-9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }

    #[tokio::test]
    async fn test_stream_hash_matches_buffer_hash() {
        let data = vec![7u8; READ_BUF_SIZE * 2 + 13];
        let hashed = hash_reader(&mut &data[..]).await.unwrap();

        assert_eq!(hashed.hash, compute_hash(&data));
        assert_eq!(hashed.size, data.len() as u64);
    }

    #[tokio::test]
    async fn test_hash_file() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), b"hello world").unwrap();

        let hashed = hash_file(temp.path()).await.unwrap();
        assert_eq!(hashed.size, 11);
        assert_eq!(hashed.hash, compute_hash(b"hello world"));
    }
}
