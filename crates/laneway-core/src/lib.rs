//! laneway-core library.
//!
//! Work packages move through lanes; every move is an immutable event in a
//! per-feature append-only log. Everything else (the snapshot, drift reports,
//! reconciliation proposals) is derived from that log.
//!
//! # Conventions
//!
//! - **Errors**: `thiserror` enums per module, each with a `code()`;
//!   `anyhow::Result` only at the configuration edge.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `debug!`).

pub mod config;
pub mod emit;
pub mod error;
pub mod event;
pub mod lane;
pub mod lock;
pub mod reconcile;
pub mod snapshot;
pub mod store;
pub mod transition;

pub use emit::{TransitionRequest, emit_transition};
pub use event::{EventId, Evidence, ExecutionMode, StatusEvent};
pub use lane::Lane;
pub use snapshot::{StatusSnapshot, materialize};
pub use store::EventLogStore;
