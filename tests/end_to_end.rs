//! Relay plus clients over loopback TCP.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use relaypipe::config::{ClientConfig, RelayConfig};
use relaypipe::relay::registry::Registry;
use relaypipe::relay::SessionKey;
use relaypipe::transfer::hasher::hash_bytes;
use relaypipe::transfer::{SpaceProbe, StatvfsProbe};
use relaypipe::{receive_file, send_file, Relay, TransferError};

struct TestRelay {
    base_port: u16,
    registry: Registry<TcpStream>,
    _stop: oneshot::Sender<()>,
}

/// Client ports are `base_port + i`, so the relay needs a contiguous block.
async fn start_relay(channels: u16, pairing_timeout_secs: u64) -> TestRelay {
    let mut rng = StdRng::from_entropy();
    for _ in 0..50 {
        let base_port = rng.gen_range(20_000..60_000);
        let relay = Relay::new(RelayConfig {
            host: "127.0.0.1".to_string(),
            base_port,
            channels,
            handshake_timeout_secs: 5,
            pairing_timeout_secs,
            sweep_interval_secs: 1,
            ..RelayConfig::default()
        });
        let Ok(bound) = relay.bind().await else {
            continue;
        };
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(bound.serve(async move {
            let _ = stopped.await;
        }));
        return TestRelay {
            base_port,
            registry: relay.registry().clone(),
            _stop: stop,
        };
    }
    panic!("no free contiguous port block for {channels} channels");
}

fn client(relay: &TestRelay, workers: u16, chunk_size: usize) -> ClientConfig {
    ClientConfig {
        server: "127.0.0.1".to_string(),
        base_port: relay.base_port,
        workers,
        chunk_size,
        connect_timeout_secs: 5,
        io_timeout_secs: 20,
    }
}

fn random_file(dir: &Path, name: &str, len: usize, seed: u64) -> (std::path::PathBuf, Vec<u8>) {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    let path = dir.join(name);
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

/// The relay releases a session only after it sees both ends close.
async fn wait_until_empty(registry: &Registry<TcpStream>) {
    for _ in 0..500 {
        if registry.is_empty().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("relay still holds {} sessions", registry.len().await);
}

fn leftover_temp_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with(".rp_tmp_"))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_channels_reassemble_byte_exact() {
    let relay = start_relay(3, 30).await;
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let (path, data) = random_file(src.path(), "apple.bin", 10_000, 7);
    let cfg = client(&relay, 3, 1024);

    let (sent, received) = tokio::join!(
        send_file(&cfg, &path, "apple"),
        receive_file(&cfg, "apple", dst.path(), Arc::new(StatvfsProbe)),
    );
    let sent = sent.unwrap();
    let received = received.unwrap();

    assert_eq!(received.path, dst.path().join("apple.bin"));
    assert_eq!(std::fs::read(&received.path).unwrap(), data);
    assert_eq!(sent.file_hash, hash_bytes(&data));
    assert_eq!(received.file_hash, sent.file_hash);
    assert_eq!(received.file_size, 10_000);
    assert!(leftover_temp_files(dst.path()).is_empty());
    wait_until_empty(&relay.registry).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_receiver_first_then_sender() {
    let relay = start_relay(4, 30).await;
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let (path, data) = random_file(src.path(), "late-sender.dat", 300_000, 11);
    let cfg = client(&relay, 4, 4096);

    let receiver = {
        let cfg = cfg.clone();
        let out = dst.path().to_path_buf();
        tokio::spawn(async move { receive_file(&cfg, "pear", &out, Arc::new(StatvfsProbe)).await })
    };
    // All receiver channels waiting before the sender dials.
    for channel in 0..4 {
        let key = SessionKey::new("pear", channel);
        while !relay.registry.contains(&key).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    send_file(&cfg, &path, "pear").await.unwrap();
    let received = receiver.await.unwrap().unwrap();
    assert_eq!(std::fs::read(received.path).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sender_first_then_receiver() {
    let relay = start_relay(8, 30).await;
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let (path, data) = random_file(src.path(), "early.bin", 1_048_583, 13);
    let cfg = client(&relay, 8, 1024);

    let sender = {
        let cfg = cfg.clone();
        tokio::spawn(async move { send_file(&cfg, &path, "plum").await })
    };
    for channel in 0..8 {
        let key = SessionKey::new("plum", channel);
        while !relay.registry.contains(&key).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    let received = receive_file(&cfg, "plum", dst.path(), Arc::new(StatvfsProbe))
        .await
        .unwrap();
    sender.await.unwrap().unwrap();
    assert_eq!(std::fs::read(received.path).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_file() {
    let relay = start_relay(2, 30).await;
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let (path, _) = random_file(src.path(), "empty", 0, 0);
    let cfg = client(&relay, 2, 1024);

    let (sent, received) = tokio::join!(
        send_file(&cfg, &path, "void"),
        receive_file(&cfg, "void", dst.path(), Arc::new(StatvfsProbe)),
    );
    sent.unwrap();
    let received = received.unwrap();
    assert_eq!(received.file_size, 0);
    assert!(std::fs::read(received.path).unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_transfers_share_the_relay() {
    let relay = start_relay(2, 30).await;
    let src = tempfile::tempdir().unwrap();
    let dst_a = tempfile::tempdir().unwrap();
    let dst_b = tempfile::tempdir().unwrap();
    let (path_a, data_a) = random_file(src.path(), "a.bin", 50_000, 21);
    let (path_b, data_b) = random_file(src.path(), "b.bin", 70_000, 22);
    let cfg = client(&relay, 2, 1024);

    let (sa, ra, sb, rb) = tokio::join!(
        send_file(&cfg, &path_a, "alpha"),
        receive_file(&cfg, "alpha", dst_a.path(), Arc::new(StatvfsProbe)),
        send_file(&cfg, &path_b, "beta"),
        receive_file(&cfg, "beta", dst_b.path(), Arc::new(StatvfsProbe)),
    );
    sa.unwrap();
    sb.unwrap();
    assert_eq!(std::fs::read(ra.unwrap().path).unwrap(), data_a);
    assert_eq!(std::fs::read(rb.unwrap().path).unwrap(), data_b);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_receiver_told_no() {
    let relay = start_relay(1, 30).await;
    let dst = tempfile::tempdir().unwrap();
    let cfg = client(&relay, 1, 1024);

    let first = {
        let cfg = cfg.clone();
        let out = dst.path().to_path_buf();
        tokio::spawn(async move { receive_file(&cfg, "fig", &out, Arc::new(StatvfsProbe)).await })
    };
    let key = SessionKey::new("fig", 0);
    while !relay.registry.contains(&key).await {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    match receive_file(&cfg, "fig", dst.path(), Arc::new(StatvfsProbe)).await {
        Err(TransferError::Rejected { channel, reply }) => {
            assert_eq!(channel, 0);
            assert_eq!(reply, "no");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    first.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lonely_sender_told_timeout() {
    let relay = start_relay(1, 1).await;
    let src = tempfile::tempdir().unwrap();
    let (path, _) = random_file(src.path(), "alone.bin", 100, 5);
    let cfg = client(&relay, 1, 1024);

    match send_file(&cfg, &path, "nobody-home").await {
        Err(TransferError::Rejected { reply, .. }) => assert_eq!(reply, "timeout"),
        other => panic!("expected timeout reply, got {other:?}"),
    }
    wait_until_empty(&relay.registry).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lonely_receiver_told_timeout() {
    let relay = start_relay(1, 1).await;
    let dst = tempfile::tempdir().unwrap();
    let cfg = client(&relay, 1, 1024);

    match receive_file(&cfg, "ghost", dst.path(), Arc::new(StatvfsProbe)).await {
        Err(TransferError::Rejected { reply, .. }) => assert_eq!(reply, "timeout"),
        other => panic!("expected timeout reply, got {other:?}"),
    }
    wait_until_empty(&relay.registry).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_receiver_that_gave_up_can_retry() {
    let relay = start_relay(2, 30).await;
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let (path, data) = random_file(src.path(), "retry.bin", 40_000, 17);
    let cfg = client(&relay, 2, 1024);

    let first = {
        let cfg = cfg.clone();
        let out = dst.path().to_path_buf();
        tokio::spawn(async move { receive_file(&cfg, "kiwi", &out, Arc::new(StatvfsProbe)).await })
    };
    for channel in 0..2 {
        let key = SessionKey::new("kiwi", channel);
        while !relay.registry.contains(&key).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    // Dropping the task closes its sockets; the relay frees both keys.
    first.abort();
    let _ = first.await;
    wait_until_empty(&relay.registry).await;

    let (sent, received) = tokio::join!(
        send_file(&cfg, &path, "kiwi"),
        receive_file(&cfg, "kiwi", dst.path(), Arc::new(StatvfsProbe)),
    );
    sent.unwrap();
    assert_eq!(std::fs::read(received.unwrap().path).unwrap(), data);
}

struct FullDisk;

impl SpaceProbe for FullDisk {
    fn available(&self, _path: &Path) -> io::Result<u64> {
        Ok(0)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_insufficient_space_aborts_both_ends() {
    let relay = start_relay(2, 30).await;
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let (path, _) = random_file(src.path(), "big.bin", 20_000, 9);
    let cfg = client(&relay, 2, 1024);

    let (sent, received) = tokio::join!(
        send_file(&cfg, &path, "full"),
        receive_file(&cfg, "full", dst.path(), Arc::new(FullDisk)),
    );
    assert!(matches!(
        received,
        Err(TransferError::InsufficientSpace { available: 0, .. })
    ));
    assert!(sent.is_err());
    assert!(leftover_temp_files(dst.path()).is_empty());
    assert!(!dst.path().join("big.bin").exists());
}
