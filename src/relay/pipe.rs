//! Full-duplex byte forwarder between one matched sender/receiver pair.
//!
//! Each side gets a reader task that pushes what it reads into its own
//! bounded channel. A single `select!` loop writes whatever arrives to the
//! opposite side. A closed channel means that side hit EOF or a read error,
//! and that ends the whole pipe. Channels hold one slice, so a slow writer
//! stalls the opposite reader and, through the socket buffers, its peer.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

/// Default read buffer per direction.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct PipeOptions {
    pub buffer_size: usize,
    /// End the pipe when neither side has sent anything for this long.
    pub idle_timeout: Option<Duration>,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: None,
        }
    }
}

/// Why the pipe stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    /// Side A reached EOF or failed a read.
    AClosed,
    /// Side B reached EOF or failed a read.
    BClosed,
    /// A write to either side failed.
    WriteFailed,
    IdleTimeout,
}

impl PipeEnd {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AClosed => "a_closed",
            Self::BClosed => "b_closed",
            Self::WriteFailed => "write_failed",
            Self::IdleTimeout => "idle_timeout",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipeStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub end: PipeEnd,
}

/// Forward bytes between `a` and `b` until either side closes.
pub async fn pipe<A, B>(a: A, b: B, opts: PipeOptions) -> PipeStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, mut a_write) = tokio::io::split(a);
    let (b_read, mut b_write) = tokio::io::split(b);

    let (a_tx, mut a_rx) = mpsc::channel::<Vec<u8>>(1);
    let (b_tx, mut b_rx) = mpsc::channel::<Vec<u8>>(1);
    let a_reader = tokio::spawn(read_into(a_read, a_tx, opts.buffer_size, "a"));
    let b_reader = tokio::spawn(read_into(b_read, b_tx, opts.buffer_size, "b"));

    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;

    let end = loop {
        tokio::select! {
            chunk = a_rx.recv() => match chunk {
                Some(buf) => {
                    if b_write.write_all(&buf).await.is_err() {
                        break PipeEnd::WriteFailed;
                    }
                    a_to_b += buf.len() as u64;
                }
                None => break PipeEnd::AClosed,
            },
            chunk = b_rx.recv() => match chunk {
                Some(buf) => {
                    if a_write.write_all(&buf).await.is_err() {
                        break PipeEnd::WriteFailed;
                    }
                    b_to_a += buf.len() as u64;
                }
                None => break PipeEnd::BClosed,
            },
            () = idle(opts.idle_timeout) => break PipeEnd::IdleTimeout,
        }
    };

    a_reader.abort();
    b_reader.abort();
    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    PipeStats { a_to_b, b_to_a, end }
}

async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

async fn read_into<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>, buffer_size: usize, side: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(side, "pipe read ended: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data = vec![0u8; len];
        rng.fill_bytes(&mut data);
        data
    }

    #[tokio::test]
    async fn test_byte_exact_both_directions() {
        let (a_client, a_relay) = tokio::io::duplex(4096);
        let (b_client, b_relay) = tokio::io::duplex(4096);
        let relay = tokio::spawn(pipe(
            a_relay,
            b_relay,
            PipeOptions {
                buffer_size: 1000,
                idle_timeout: None,
            },
        ));

        let from_a = random_bytes(1, 300_001);
        let from_b = random_bytes(2, 123_457);

        let (mut a_read, mut a_write) = tokio::io::split(a_client);
        let (mut b_read, mut b_write) = tokio::io::split(b_client);

        let send_a = from_a.clone();
        let wa = tokio::spawn(async move { a_write.write_all(&send_a).await.map(|()| a_write) });
        let send_b = from_b.clone();
        let wb = tokio::spawn(async move { b_write.write_all(&send_b).await.map(|()| b_write) });

        let b_len = from_b.len();
        let ra = tokio::spawn(async move {
            let mut got = vec![0u8; b_len];
            a_read.read_exact(&mut got).await.map(|_| got)
        });
        let a_len = from_a.len();
        let rb = tokio::spawn(async move {
            let mut got = vec![0u8; a_len];
            b_read.read_exact(&mut got).await.map(|_| got)
        });

        let received_by_b = rb.await.unwrap().unwrap();
        let received_by_a = ra.await.unwrap().unwrap();
        assert_eq!(received_by_b, from_a);
        assert_eq!(received_by_a, from_b);

        // Closing A ends the pipe.
        let mut a_write = wa.await.unwrap().unwrap();
        let _b_write = wb.await.unwrap().unwrap();
        a_write.shutdown().await.unwrap();

        let stats = relay.await.unwrap();
        assert_eq!(stats.a_to_b, from_a.len() as u64);
        assert_eq!(stats.b_to_a, from_b.len() as u64);
        assert_eq!(stats.end, PipeEnd::AClosed);
    }

    #[tokio::test]
    async fn test_close_delivers_pending_bytes_then_eof() {
        let (mut a_client, a_relay) = tokio::io::duplex(1024);
        let (mut b_client, b_relay) = tokio::io::duplex(1024);
        let relay = tokio::spawn(pipe(a_relay, b_relay, PipeOptions::default()));

        a_client.write_all(b"last words").await.unwrap();
        drop(a_client);

        let mut got = Vec::new();
        b_client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"last words");

        let stats = relay.await.unwrap();
        assert_eq!(stats.end, PipeEnd::AClosed);
        assert_eq!(stats.a_to_b, 10);
        assert_eq!(stats.b_to_a, 0);
    }

    #[tokio::test]
    async fn test_b_close_ends_pipe() {
        let (mut a_client, a_relay) = tokio::io::duplex(1024);
        let (b_client, b_relay) = tokio::io::duplex(1024);
        let relay = tokio::spawn(pipe(a_relay, b_relay, PipeOptions::default()));

        drop(b_client);
        let stats = relay.await.unwrap();
        assert_eq!(stats.end, PipeEnd::BClosed);

        let mut rest = Vec::new();
        a_client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (_a_client, a_relay) = tokio::io::duplex(64);
        let (_b_client, b_relay) = tokio::io::duplex(64);
        let stats = pipe(
            a_relay,
            b_relay,
            PipeOptions {
                buffer_size: 64,
                idle_timeout: Some(Duration::from_millis(30)),
            },
        )
        .await;
        assert_eq!(stats.end, PipeEnd::IdleTimeout);
    }
}
