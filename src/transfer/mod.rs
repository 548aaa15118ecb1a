//! Parallel file transfer over relay channels.
//!
//! A file is split into one contiguous range per channel by the
//! [`plan::TransferPlan`]. Each channel carries a small JSON header and its
//! raw bytes, and the receiver reassembles the ranges in a pre-sized temp file
//! and verifies the whole-file SHA-256 before the final rename.

pub mod client;
pub mod disk;
pub mod hasher;
pub mod plan;
pub mod types;

pub use client::{receive_file, send_file};
pub use disk::{SpaceProbe, StatvfsProbe};
pub use plan::{ByteRange, TransferPlan};
pub use types::{ChannelHeader, TransferSummary};
