//! Background sync loop on a dedicated thread.
//!
//! Each pass drains the queue through [`SyncClient::sync_all_until`] and then
//! bumps `retry_count` for the events that failed. Between passes the thread
//! waits on a stop channel with the configured interval as timeout, so a stop
//! request is seen immediately rather than after the next sleep.
//!
//! [`SyncWorker::cancel`] sets a flag checked before every request: no new
//! batch starts, while a request already in flight completes and its response
//! is applied.

use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::batch::{BatchSyncResult, DEFAULT_BATCH_SIZE, SyncClient};
use crate::queue::{OfflineQueue, QueueError};

/// Time between passes unless configured otherwise.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub interval: Duration,
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SYNC_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// One full pass: sync until empty, stalled, or cancelled, then record a
/// retry for every event that failed.
///
/// # Errors
///
/// Returns local queue failures only.
pub fn run_pass(
    client: &SyncClient,
    queue: &mut OfflineQueue,
    batch_size: usize,
    cancel: &AtomicBool,
) -> Result<BatchSyncResult, QueueError> {
    let result = client.sync_all_until(queue, batch_size, cancel)?;
    let failed: Vec<String> = result
        .failed_ids
        .iter()
        .filter(|id| !result.synced_ids.contains(id))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    queue.increment_retry(&failed)?;
    Ok(result)
}

/// Handle to a running sync thread.
#[derive(Debug)]
pub struct SyncWorker {
    handle: JoinHandle<()>,
    stop: mpsc::Sender<()>,
    cancel: Arc<AtomicBool>,
}

impl SyncWorker {
    /// Start the loop. The first pass runs immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to create the thread.
    pub fn spawn(client: SyncClient, queue: OfflineQueue, config: WorkerConfig) -> io::Result<Self> {
        let (stop, stop_rx) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);

        let handle = thread::Builder::new()
            .name("laneway-sync".to_string())
            .spawn(move || run_loop(&client, queue, config, &stop_rx, &flag))?;

        Ok(Self {
            handle,
            stop,
            cancel,
        })
    }

    /// Stop starting new batches. The loop exits after the current pass.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
        let _ = self.stop.send(());
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread without cancelling it.
    ///
    /// # Errors
    ///
    /// Returns the panic payload if the sync thread panicked.
    pub fn join(self) -> thread::Result<()> {
        self.handle.join()
    }

    /// Cancel and wait for the thread to exit.
    ///
    /// # Errors
    ///
    /// Returns the panic payload if the sync thread panicked.
    pub fn stop(self) -> thread::Result<()> {
        self.cancel();
        self.handle.join()
    }
}

fn run_loop(
    client: &SyncClient,
    mut queue: OfflineQueue,
    config: WorkerConfig,
    stop: &mpsc::Receiver<()>,
    cancel: &AtomicBool,
) {
    info!(
        endpoint = %client.endpoint(),
        interval_secs = config.interval.as_secs(),
        "sync worker started"
    );
    loop {
        if cancel.load(Ordering::Acquire) {
            break;
        }
        match run_pass(client, &mut queue, config.batch_size, cancel) {
            Ok(result) if result.total_events == 0 => debug!("sync pass: queue empty"),
            Ok(result) => info!(
                synced = result.synced_count,
                duplicates = result.duplicate_count,
                errors = result.error_count,
                "sync pass complete"
            ),
            Err(err) => warn!(error = %err, code = err.code().code(), "sync pass failed"),
        }
        match stop.recv_timeout(config.interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("sync worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_pass_sends_nothing() {
        let mut queue = OfflineQueue::open_in_memory().unwrap();
        let client = SyncClient::with_timeout("http://127.0.0.1:9", "t", Duration::from_millis(50));
        let cancel = AtomicBool::new(true);
        let result = run_pass(&client, &mut queue, 10, &cancel).unwrap();
        assert_eq!(result, BatchSyncResult::default());
    }

    #[test]
    fn worker_stops_promptly() {
        let queue = OfflineQueue::open_in_memory().unwrap();
        let client = SyncClient::new("http://127.0.0.1:9", "t");
        let worker = SyncWorker::spawn(
            client,
            queue,
            WorkerConfig {
                interval: Duration::from_secs(3600),
                batch_size: 10,
            },
        )
        .unwrap();
        worker.stop().unwrap();
    }
}
