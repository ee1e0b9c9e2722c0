//! laneway-sync library.
//!
//! Moves locally produced events to the remote authority and keeps causal
//! order across nodes:
//!
//! - [`clock`]: persisted Lamport clock and node identity
//! - [`envelope`]: the versioned wire record, typed per event kind
//! - [`queue`]: SQLite offline queue with explicit backpressure
//! - [`batch`]: gzip batch client applying per-event results
//! - [`emitter`] and [`inbound`]: the local and remote producer paths
//! - [`worker`]: cancellable background sync thread
//!
//! Nothing here is a process-wide singleton. Callers open the clock and
//! queue for a home directory and pass them where they are needed.

pub mod batch;
pub mod clock;
pub mod emitter;
pub mod envelope;
pub mod inbound;
pub mod queue;
pub mod worker;

pub use batch::{BatchSyncResult, SyncClient, batch_sync};
pub use clock::LamportClock;
pub use emitter::SyncEmitter;
pub use envelope::{EventKind, SyncEvent, SyncPayload};
pub use inbound::receive_remote;
pub use queue::{MAX_QUEUE_SIZE, OfflineQueue, QueueEntry, QueueStats};
pub use worker::{SyncWorker, WorkerConfig};
