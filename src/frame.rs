//! Fixed-width, sentinel-padded text frames for the rendezvous handshake.
//!
//! Every control message is right-padded with [`SENTINEL`] to a fixed width
//! ([`CONTROL_WIDTH`]; the codec itself takes any width). Decoding strips only the
//! trailing padding, and encoding refuses payloads that contain the sentinel,
//! so any payload that encodes also decodes back unchanged.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;

/// Padding byte. Never valid inside a payload.
pub const SENTINEL: u8 = b':';

/// Width of handshake frames.
pub const CONTROL_WIDTH: usize = 64;

/// Relay prompt sent on connect.
pub const WHO: &str = "who?";
/// Relay to sender: the receiver is present, start streaming.
pub const OK: &str = "ok";
/// Relay: this role is already registered for the key.
pub const NO: &str = "no";
/// Relay: no counterpart arrived before the pairing deadline.
pub const TIMEOUT: &str = "timeout";
/// Receiver to sender: the channel's byte range is written.
pub const DONE: &str = "done";

/// Pad `payload` to exactly `width` bytes.
pub fn encode(payload: &str, width: usize) -> Result<Vec<u8>, FrameError> {
    let bytes = payload.as_bytes();
    if bytes.len() > width {
        return Err(FrameError::TooLong {
            len: bytes.len(),
            width,
        });
    }
    if bytes.contains(&SENTINEL) {
        return Err(FrameError::ContainsSentinel {
            sentinel: SENTINEL as char,
        });
    }
    let mut frame = Vec::with_capacity(width);
    frame.extend_from_slice(bytes);
    frame.resize(width, SENTINEL);
    Ok(frame)
}

/// Strip trailing padding. Invalid UTF-8 is replaced, not rejected.
pub fn decode(frame: &[u8]) -> String {
    let end = frame
        .iter()
        .rposition(|&b| b != SENTINEL)
        .map_or(0, |i| i + 1);
    String::from_utf8_lossy(&frame[..end]).into_owned()
}

/// Encode and write one frame.
pub async fn write_frame<W>(writer: &mut W, payload: &str, width: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode(payload, width)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame of `width` bytes and decode it.
pub async fn read_frame<R>(reader: &mut R, width: usize) -> Result<String, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; width];
    reader.read_exact(&mut buf).await?;
    Ok(decode(&buf))
}
