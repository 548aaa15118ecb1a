//! Error types for the relay and the transfer client.
//!
//! Each subsystem has its own enum so callers can match on the failures they
//! can act on. Timeouts are always a distinct variant: a stuck peer must be
//! reported, never waited on forever.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::relay::registry::{Role, SessionKey};

/// Violations of the fixed-width control framing.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Payload does not fit the frame; it is rejected rather than truncated.
    #[error("frame payload is {len} bytes, exceeds width {width}")]
    TooLong { len: usize, width: usize },

    /// Payload contains the padding sentinel and could not round-trip.
    #[error("frame payload contains the sentinel byte {sentinel:?}")]
    ContainsSentinel { sentinel: char },

    #[error("frame I/O: {0}")]
    Io(#[from] io::Error),
}

/// Failures on the relay side: listening, handshaking, pairing, piping.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind channel {channel} on {addr}: {source}")]
    Bind {
        channel: u16,
        addr: String,
        source: io::Error,
    },

    #[error("relay needs at least one channel")]
    NoChannels,

    #[error("accept failed on channel {channel}: {source}")]
    Accept { channel: u16, source: io::Error },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("malformed handshake: {0:?}")]
    MalformedHandshake(String),

    #[error("{role} already registered for {key}")]
    DuplicateRole { key: SessionKey, role: Role },

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: &'static str, after: Duration },

    #[error("relay I/O: {0}")]
    Io(#[from] io::Error),
}

/// Invalid inputs to the chunk planner.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("worker count must be at least 1")]
    ZeroWorkers,

    #[error("chunk size must be at least 1 byte")]
    ZeroChunkSize,
}

/// Failures of a parallel send or receive.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer I/O: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    /// The relay or the peer answered with something other than expected,
    /// e.g. `no` or `timeout` instead of `ok`.
    #[error("channel {channel} rejected: {reply:?}")]
    Rejected { channel: u16, reply: String },

    #[error("channel {channel} timed out after {after:?} waiting for {what}")]
    Timeout {
        channel: u16,
        what: &'static str,
        after: Duration,
    },

    #[error("invalid channel header: {0}")]
    Header(String),

    #[error("header JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("source changed while hashing: {expected} bytes expected, {hashed} read")]
    SourceChanged { expected: u64, hashed: u64 },

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("insufficient disk space: {available} bytes available, {needed} bytes needed")]
    InsufficientSpace { available: u64, needed: u64 },

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Failures loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("invalid config value {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}
