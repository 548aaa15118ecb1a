//! Whole-file SHA-256 for end-to-end verification.
//!
//! The sender digests the source through the handle it already opened, the
//! receiver digests the assembled temp file before renaming it. Input is
//! streamed in 64 KiB blocks.

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

const BLOCK: usize = 64 * 1024;

/// Lowercase hex SHA-256 plus the number of bytes it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub hex: String,
    pub len: u64,
}

/// Digest everything `reader` yields until EOF.
pub async fn digest_reader<R>(reader: &mut R) -> io::Result<FileDigest>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut sha = Sha256::new();
    let mut block = vec![0u8; BLOCK];
    let mut len = 0u64;
    loop {
        let n = reader.read(&mut block).await?;
        if n == 0 {
            break;
        }
        sha.update(&block[..n]);
        len += n as u64;
    }
    Ok(FileDigest {
        hex: to_hex(&sha.finalize()),
        len,
    })
}

pub async fn digest_file(path: &Path) -> io::Result<FileDigest> {
    let mut file = tokio::fs::File::open(path).await?;
    digest_reader(&mut file).await
}

pub fn hash_bytes(data: &[u8]) -> String {
    to_hex(&Sha256::digest(data))
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}
