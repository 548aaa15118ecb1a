//! Data-plane types carried over each paired channel.
//!
//! After the relay says `ok`, the sender writes one length-prefixed JSON
//! [`ChannelHeader`], then exactly `length` raw bytes. The receiver answers
//! with a `done` control frame once the region is on disk.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransferError;

/// Bumped on incompatible header changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted header body. Being below 2^24, the first byte of a
/// length prefix is always zero, which never starts a control frame.
pub const MAX_HEADER_LEN: u32 = 64 * 1024;

/// Describes one channel's share of the file. Every channel carries the
/// whole-file fields too, so the receiver can start from any channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHeader {
    pub version: u32,
    pub channel: u16,
    pub workers: u16,
    pub filename: String,
    pub file_size: u64,
    /// Lowercase hex SHA-256 of the whole file.
    pub file_hash: String,
    pub chunk_size: u64,
    pub offset: u64,
    pub length: u64,
}

impl ChannelHeader {
    /// Whether two headers describe the same transfer.
    pub fn same_transfer(&self, other: &Self) -> bool {
        self.version == other.version
            && self.workers == other.workers
            && self.filename == other.filename
            && self.file_size == other.file_size
            && self.file_hash == other.file_hash
            && self.chunk_size == other.chunk_size
    }
}

/// Write `header` as a 4-byte big-endian length followed by JSON.
pub async fn write_header<W>(writer: &mut W, header: &ChannelHeader) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let body = serde_json::to_vec(header)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|&n| n <= MAX_HEADER_LEN)
        .ok_or_else(|| TransferError::Header(format!("header is {} bytes", body.len())))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one header written by [`write_header`].
pub async fn read_header<R>(reader: &mut R) -> Result<ChannelHeader, TransferError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    read_header_body(reader, u32::from_be_bytes(len_buf)).await
}

/// Read the JSON body of a header whose length prefix was already consumed.
pub async fn read_header_body<R>(reader: &mut R, len: u32) -> Result<ChannelHeader, TransferError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if len > MAX_HEADER_LEN {
        return Err(TransferError::Header(format!(
            "header length {len} exceeds {MAX_HEADER_LEN}"
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let header: ChannelHeader = serde_json::from_slice(&body)?;
    if header.version != PROTOCOL_VERSION {
        return Err(TransferError::Header(format!(
            "unsupported protocol version {}",
            header.version
        )));
    }
    Ok(header)
}

/// Result of a completed send or receive.
#[derive(Debug, Clone)]
pub struct TransferSummary {
    pub filename: String,
    /// Source path for a send, final output path for a receive.
    pub path: PathBuf,
    pub file_size: u64,
    pub file_hash: String,
    pub workers: u16,
    pub elapsed: Duration,
}
