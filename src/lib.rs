#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! relaypipe library: rendezvous relay and parallel transfer client.
//!
//! - `relay` — channel listeners, code-phrase registry, handshake, pipe
//! - `transfer` — chunk planner, wire header, parallel send/receive
//! - `frame` — fixed-width control frames shared by both sides
//! - `config` — configuration loading
//! - `error` — error types

pub mod config;
pub mod error;
pub mod frame;
pub mod relay;
pub mod transfer;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::{FrameError, PlanError, RelayError, TransferError};
pub use relay::Relay;
pub use transfer::{receive_file, send_file, TransferPlan, TransferSummary};
