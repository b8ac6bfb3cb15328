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
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! rtun library: a multiplexed reverse tunnel between on-prem connectors and a
//! cloud bridge.
//!
//! - `tunnel`: frame codec, handshake, stream multiplexer, sessions,
//!   registry, reconnect backoff, routing, and the bridge/connector roles
//! - `auth`: shared-secret HMAC proofs and the secret provider seam
//! - `config`: configuration loading and validation
//! - `routes`: `/health` and `/metrics`
//! - `metrics`: tunnel counters and text exposition
//! - `supervisor`: restart-on-crash wrapper

pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod supervisor;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::{Config, Role};
pub use error::{ErrorCode, TunnelError};
pub use state::AppState;
pub use tunnel::bridge::BridgeState;
pub use tunnel::{Session, SessionRegistry, StreamHandle};
