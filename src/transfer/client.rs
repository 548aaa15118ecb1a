//! Parallel transfer client: W channels, one byte range each.
//!
//! Channel `i` dials `server:base_port+i` and registers under the shared
//! code phrase, so the relay pairs sender channel `i` with receiver channel
//! `i`. Every channel carries its own [`ChannelHeader`], so the receiver
//! never depends on which channel arrives first.
//!
//! There is no retry: the first failing channel aborts the whole transfer.

use std::future::Future;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::disk::{self, SpaceProbe};
use super::hasher;
use super::plan::{ByteRange, TransferPlan};
use super::types::{self, ChannelHeader, TransferSummary, PROTOCOL_VERSION};
use crate::config::ClientConfig;
use crate::error::{PlanError, TransferError};
use crate::frame::{self, CONTROL_WIDTH, DONE, OK, WHO};
use crate::relay::registry::Role;

/// Prefix of the receiver's pre-allocated output file.
const TEMP_PREFIX: &str = ".rp_tmp_";

// ─── Send ────────────────────────────────────────────────────────────────────

struct SendJob {
    cfg: ClientConfig,
    code_phrase: String,
    path: PathBuf,
    filename: String,
    file_hash: String,
    plan: TransferPlan,
}

/// Send `path` to whoever receives with the same code phrase.
pub async fn send_file(
    cfg: &ClientConfig,
    path: &Path,
    code_phrase: &str,
) -> Result<TransferSummary, TransferError> {
    let started = Instant::now();

    let mut source = File::open(path).await?;
    let meta = source.metadata().await?;
    if !meta.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a regular file", path.display()),
        )
        .into());
    }
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let filename = sanitize_filename(&filename)?;

    let file_size = meta.len();
    let plan = TransferPlan::new(file_size, usize::from(cfg.workers), cfg.chunk_size)?;
    let digest = hasher::digest_reader(&mut source).await?;
    if digest.len != file_size {
        return Err(TransferError::SourceChanged {
            expected: file_size,
            hashed: digest.len,
        });
    }
    let file_hash = digest.hex;

    info!(
        filename = %filename,
        file_size,
        workers = cfg.workers,
        chunks = plan.num_chunks(),
        "Sending"
    );

    let job = Arc::new(SendJob {
        cfg: cfg.clone(),
        code_phrase: code_phrase.to_string(),
        path: path.to_path_buf(),
        filename,
        file_hash,
        plan,
    });

    let mut channels = JoinSet::new();
    for range in plan.ranges() {
        channels.spawn(send_channel(Arc::clone(&job), range));
    }
    join_channels(&mut channels).await?;

    let elapsed = started.elapsed();
    info!(
        filename = %job.filename,
        file_size,
        elapsed_ms = elapsed.as_millis() as u64,
        "Send complete"
    );

    Ok(TransferSummary {
        filename: job.filename.clone(),
        path: job.path.clone(),
        file_size,
        file_hash: job.file_hash.clone(),
        workers: cfg.workers,
        elapsed,
    })
}

async fn send_channel(job: Arc<SendJob>, range: ByteRange) -> Result<u64, TransferError> {
    let channel = range.worker as u16;
    let io_timeout = job.cfg.io_timeout();

    let mut stream = open_channel(&job.cfg, channel, Role::Sender, &job.code_phrase).await?;
    let reply = deadline(
        channel,
        "relay pairing",
        io_timeout,
        frame::read_frame(&mut stream, CONTROL_WIDTH),
    )
    .await?;
    if reply != OK {
        return Err(TransferError::Rejected { channel, reply });
    }

    let header = ChannelHeader {
        version: PROTOCOL_VERSION,
        channel,
        workers: job.cfg.workers,
        filename: job.filename.clone(),
        file_size: job.plan.total_size(),
        file_hash: job.file_hash.clone(),
        chunk_size: job.plan.chunk_size() as u64,
        offset: range.offset,
        length: range.len,
    };
    types::write_header(&mut stream, &header).await?;

    let mut file = File::open(&job.path).await?;
    file.seek(SeekFrom::Start(range.offset)).await?;
    let mut region = file.take(range.len);
    let copied = tokio::io::copy(&mut region, &mut stream).await?;
    if copied != range.len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("source shrank: channel {channel} sent {copied} of {} bytes", range.len),
        )
        .into());
    }
    stream.flush().await?;

    let ack = deadline(
        channel,
        "receiver ack",
        io_timeout,
        frame::read_frame(&mut stream, CONTROL_WIDTH),
    )
    .await?;
    if ack != DONE {
        return Err(TransferError::Rejected {
            channel,
            reply: ack,
        });
    }

    debug!(channel, offset = range.offset, bytes = copied, "Channel sent");
    Ok(copied)
}

// ─── Receive ─────────────────────────────────────────────────────────────────

struct ReceiveJob {
    cfg: ClientConfig,
    code_phrase: String,
    out_dir: PathBuf,
    probe: Arc<dyn SpaceProbe>,
    output: OnceCell<Output>,
}

/// Output file state, created by whichever channel sees a header first.
struct Output {
    header: ChannelHeader,
    filename: String,
    temp_path: PathBuf,
    plan: TransferPlan,
}

/// Receive the file sent under `code_phrase` into `out_dir`.
pub async fn receive_file(
    cfg: &ClientConfig,
    code_phrase: &str,
    out_dir: &Path,
    probe: Arc<dyn SpaceProbe>,
) -> Result<TransferSummary, TransferError> {
    if cfg.workers == 0 {
        return Err(PlanError::ZeroWorkers.into());
    }
    let started = Instant::now();
    tokio::fs::create_dir_all(out_dir).await?;

    let job = Arc::new(ReceiveJob {
        cfg: cfg.clone(),
        code_phrase: code_phrase.to_string(),
        out_dir: out_dir.to_path_buf(),
        probe,
        output: OnceCell::new(),
    });

    info!(workers = cfg.workers, out_dir = %out_dir.display(), "Waiting for sender");

    let mut channels = JoinSet::new();
    for channel in 0..cfg.workers {
        channels.spawn(receive_channel(Arc::clone(&job), channel));
    }
    if let Err(e) = join_channels(&mut channels).await {
        if let Some(out) = job.output.get() {
            let _ = tokio::fs::remove_file(&out.temp_path).await;
        }
        return Err(e);
    }

    let Some(output) = job.output.get() else {
        return Err(TransferError::Header(
            "no channel delivered a header".to_string(),
        ));
    };
    let final_path = finalize(output, &job.out_dir).await?;

    let elapsed = started.elapsed();
    info!(
        filename = %output.filename,
        file_size = output.header.file_size,
        elapsed_ms = elapsed.as_millis() as u64,
        "Receive complete"
    );

    Ok(TransferSummary {
        filename: output.filename.clone(),
        path: final_path,
        file_size: output.header.file_size,
        file_hash: output.header.file_hash.clone(),
        workers: cfg.workers,
        elapsed,
    })
}

async fn receive_channel(job: Arc<ReceiveJob>, channel: u16) -> Result<u64, TransferError> {
    let io_timeout = job.cfg.io_timeout();

    let mut stream = open_channel(&job.cfg, channel, Role::Receiver, &job.code_phrase).await?;
    let header = deadline(
        channel,
        "channel header",
        io_timeout,
        read_first_header(&mut stream, channel),
    )
    .await?;

    if header.channel != channel {
        return Err(TransferError::Header(format!(
            "header for channel {} arrived on channel {channel}",
            header.channel
        )));
    }
    if header.workers != job.cfg.workers {
        return Err(TransferError::Header(format!(
            "sender uses {} channels, receiver {}",
            header.workers, job.cfg.workers
        )));
    }

    let output = job
        .output
        .get_or_try_init(|| prepare_output(&job, &header))
        .await?;
    if !output.header.same_transfer(&header) {
        return Err(TransferError::Header(format!(
            "channel {channel} describes a different transfer"
        )));
    }
    let expected = output.plan.range_for(usize::from(channel));
    if expected.map(|r| (r.offset, r.len)) != Some((header.offset, header.length)) {
        return Err(TransferError::Header(format!(
            "channel {channel} range [{}, +{}) does not match the plan",
            header.offset, header.length
        )));
    }

    let mut file = OpenOptions::new()
        .write(true)
        .open(&output.temp_path)
        .await?;
    file.seek(SeekFrom::Start(header.offset)).await?;
    let copied = {
        let mut region = (&mut stream).take(header.length);
        deadline(
            channel,
            "channel data",
            io_timeout,
            tokio::io::copy(&mut region, &mut file),
        )
        .await?
    };
    if copied != header.length {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "channel {channel} closed after {copied} of {} bytes",
                header.length
            ),
        )
        .into());
    }
    file.flush().await?;
    file.sync_data().await?;

    frame::write_frame(&mut stream, DONE, CONTROL_WIDTH).await?;
    debug!(channel, offset = header.offset, bytes = copied, "Channel received");
    Ok(copied)
}

/// Receivers get no `ok`. The next bytes are either a header, whose length
/// prefix starts with a zero byte, or a relay control frame such as `no`.
async fn read_first_header(
    stream: &mut TcpStream,
    channel: u16,
) -> Result<ChannelHeader, TransferError> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await?;
    if prefix[0] != 0 {
        let mut control = vec![0u8; CONTROL_WIDTH];
        control[..4].copy_from_slice(&prefix);
        stream.read_exact(&mut control[4..]).await?;
        return Err(TransferError::Rejected {
            channel,
            reply: frame::decode(&control),
        });
    }
    types::read_header_body(stream, u32::from_be_bytes(prefix)).await
}

async fn prepare_output(job: &ReceiveJob, header: &ChannelHeader) -> Result<Output, TransferError> {
    let filename = sanitize_filename(&header.filename)?;
    let chunk_size = usize::try_from(header.chunk_size)
        .map_err(|_| TransferError::Header(format!("chunk size {} too large", header.chunk_size)))?;
    let plan = TransferPlan::new(header.file_size, usize::from(header.workers), chunk_size)?;

    disk::ensure_space(job.probe.as_ref(), &job.out_dir, header.file_size)?;

    let temp_path = job.out_dir.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));
    let temp_file = File::create(&temp_path).await?;
    if let Err(e) = temp_file.set_len(header.file_size).await {
        // Clean up orphaned temp file on allocation failure
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }

    info!(
        filename = %filename,
        file_size = header.file_size,
        workers = header.workers,
        "Receiving"
    );

    Ok(Output {
        header: header.clone(),
        filename,
        temp_path,
        plan,
    })
}

/// Verify the whole-file hash and move temp → final.
async fn finalize(output: &Output, out_dir: &Path) -> Result<PathBuf, TransferError> {
    let actual = hasher::digest_file(&output.temp_path).await?.hex;
    if actual != output.header.file_hash {
        let _ = tokio::fs::remove_file(&output.temp_path).await;
        return Err(TransferError::HashMismatch {
            expected: output.header.file_hash.clone(),
            actual,
        });
    }

    let final_path = out_dir.join(&output.filename);
    if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
        warn!(path = %final_path.display(), "Overwriting existing file");
    }
    if let Err(e) = tokio::fs::rename(&output.temp_path, &final_path).await {
        let _ = tokio::fs::remove_file(&output.temp_path).await;
        return Err(e.into());
    }
    Ok(final_path)
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Dial channel `channel`, answer `who?`, and register as `role`.
async fn open_channel(
    cfg: &ClientConfig,
    channel: u16,
    role: Role,
    code_phrase: &str,
) -> Result<TcpStream, TransferError> {
    let port = cfg.base_port.checked_add(channel).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("port {} + {channel} out of range", cfg.base_port),
        )
    })?;
    let addr = format!("{}:{port}", cfg.server);
    let mut stream = deadline(
        channel,
        "connect",
        cfg.connect_timeout(),
        TcpStream::connect(&addr),
    )
    .await?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(channel, "set_nodelay failed: {e}");
    }

    let prompt = deadline(
        channel,
        "relay prompt",
        cfg.io_timeout(),
        frame::read_frame(&mut stream, CONTROL_WIDTH),
    )
    .await?;
    if prompt != WHO {
        return Err(TransferError::Rejected {
            channel,
            reply: prompt,
        });
    }
    let hello = format!("{}.{code_phrase}", role.token());
    frame::write_frame(&mut stream, &hello, CONTROL_WIDTH).await?;
    debug!(channel, addr = %addr, role = %role, "Registered with relay");
    Ok(stream)
}

/// Bound `fut` by `after`, reporting which channel and step timed out.
async fn deadline<T, E, F>(
    channel: u16,
    what: &'static str,
    after: Duration,
    fut: F,
) -> Result<T, TransferError>
where
    F: Future<Output = Result<T, E>>,
    TransferError: From<E>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result.map_err(TransferError::from),
        Err(_) => Err(TransferError::Timeout {
            channel,
            what,
            after,
        }),
    }
}

/// Wait for every channel. The first failure aborts the rest.
async fn join_channels(
    channels: &mut JoinSet<Result<u64, TransferError>>,
) -> Result<u64, TransferError> {
    let mut total = 0;
    while let Some(joined) = channels.join_next().await {
        match joined.map_err(TransferError::from).and_then(|r| r) {
            Ok(bytes) => total += bytes,
            Err(e) => {
                channels.abort_all();
                return Err(e);
            }
        }
    }
    Ok(total)
}

/// Reduce a filename from the wire to its final path component.
pub fn sanitize_filename(name: &str) -> Result<String, TransferError> {
    let base = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or_default();
    if base.is_empty() || base == "." || base == ".." || base.contains('\0') {
        return Err(TransferError::Header(format!("invalid filename: {name:?}")));
    }
    Ok(base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("report.pdf").unwrap(), "report.pdf");
        assert_eq!(sanitize_filename("/etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_filename("..\\..\\boot.ini").unwrap(), "boot.ini");
        assert_eq!(sanitize_filename("a/b/../c.txt").unwrap(), "c.txt");
        for bad in ["", ".", "..", "dir/", "a/..", "nul\0byte"] {
            assert!(sanitize_filename(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[tokio::test]
    async fn test_deadline_reports_channel_and_step() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, io::Error>(())
        };
        match deadline(4, "relay prompt", Duration::from_millis(10), slow).await {
            Err(TransferError::Timeout { channel, what, .. }) => {
                assert_eq!(channel, 4);
                assert_eq!(what, "relay prompt");
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_channels_sums_and_fails_fast() {
        let mut ok = JoinSet::new();
        for n in [10u64, 20, 30] {
            ok.spawn(async move { Ok(n) });
        }
        assert_eq!(join_channels(&mut ok).await.unwrap(), 60);

        let mut failing = JoinSet::new();
        failing.spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(1)
        });
        failing.spawn(async { Err(TransferError::Header("bad".to_string())) });
        let started = Instant::now();
        assert!(matches!(
            join_channels(&mut failing).await,
            Err(TransferError::Header(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_connect_refused_is_io_error() {
        // Bind then drop to find a port with no listener.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let cfg = ClientConfig {
            server: "127.0.0.1".to_string(),
            base_port: port,
            workers: 1,
            connect_timeout_secs: 2,
            ..ClientConfig::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.bin");
        std::fs::write(&file, b"data").unwrap();
        assert!(matches!(
            send_file(&cfg, &file, "nobody").await,
            Err(TransferError::Io(_))
        ));
    }
}
