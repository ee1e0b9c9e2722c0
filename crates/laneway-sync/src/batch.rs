//! Batched, gzip-compressed delivery of queued events.
//!
//! # Protocol
//!
//! ```text
//! POST {server}/api/v1/events/batch/
//! Content-Type: application/json
//! Content-Encoding: gzip
//! Authorization: Bearer <token>
//!
//! {"events": [<envelope>, ...]}
//! ```
//!
//! The server answers `200` with one result per event:
//!
//! ```text
//! {"results": [{"event_id": "...", "status": "success" | "duplicate" | "error",
//!               "error_message": "..."}]}
//! ```
//!
//! `success` and `duplicate` both remove the event from the queue. Anything
//! else keeps it queued with its message recorded in the result. Network and
//! HTTP failures are never returned as `Err`: they fail every event of the
//! batch with a message naming the failure class. Only local queue storage
//! errors propagate.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::queue::{OfflineQueue, QueueEntry, QueueError};

/// Events per request unless the caller says otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Per-request bound on connect, send, and response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Path of the batch endpoint, appended to the server URL.
pub const BATCH_ENDPOINT: &str = "/api/v1/events/batch/";

/// Outcome of one or more batch requests.
///
/// Across several batches each event is counted once, under its latest
/// outcome: an event that failed and was then accepted is only synced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSyncResult {
    pub total_events: usize,
    pub synced_count: usize,
    pub duplicate_count: usize,
    pub error_count: usize,
    /// Ids removed from the queue (`success` and `duplicate`).
    pub synced_ids: Vec<String>,
    pub failed_ids: Vec<String>,
    /// Failure message per failed event id.
    pub error_messages: BTreeMap<String, String>,
}

impl BatchSyncResult {
    /// Events the server accepted, new or already known.
    #[must_use]
    pub const fn success_count(&self) -> usize {
        self.synced_count + self.duplicate_count
    }

    fn fail(&mut self, event_id: String, message: String) {
        self.error_count += 1;
        self.error_messages.insert(event_id.clone(), message);
        self.failed_ids.push(event_id);
    }

    fn fail_all(&mut self, event_ids: Vec<String>, message: &str) {
        for event_id in event_ids {
            self.fail(event_id, message.to_string());
        }
    }

    fn absorb(&mut self, other: Self) {
        let accepted: HashSet<&String> = other.synced_ids.iter().collect();
        self.failed_ids.retain(|id| !accepted.contains(id));
        self.error_messages.retain(|id, _| !accepted.contains(id));

        self.synced_count += other.synced_count;
        self.duplicate_count += other.duplicate_count;
        self.synced_ids.extend(other.synced_ids);

        for event_id in other.failed_ids {
            if !self.failed_ids.contains(&event_id) {
                self.failed_ids.push(event_id);
            }
        }
        self.error_messages.extend(other.error_messages);

        self.error_count = self.failed_ids.len();
        self.total_events = self.synced_ids.len() + self.failed_ids.len();
    }
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    results: Vec<EventOutcome>,
}

#[derive(Debug, Deserialize)]
struct EventOutcome {
    event_id: String,
    status: String,
    #[serde(default)]
    error_message: Option<String>,
}

/// HTTP client bound to one server and token.
#[derive(Debug, Clone)]
pub struct SyncClient {
    agent: ureq::Agent,
    server_url: String,
    token: String,
}

impl SyncClient {
    #[must_use]
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_timeout(server_url, token, DEFAULT_REQUEST_TIMEOUT)
    }

    #[must_use]
    pub fn with_timeout(
        server_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(concat!("laneway-sync/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            agent,
            server_url: server_url.into(),
            token: token.into(),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}{BATCH_ENDPOINT}", self.server_url.trim_end_matches('/'))
    }

    /// Send up to `limit` of the oldest queued events in one request and
    /// apply the per-event results.
    ///
    /// An empty queue returns a zero result without touching the network.
    ///
    /// # Errors
    ///
    /// Only local queue failures; see the module docs.
    pub fn batch_sync(
        &self,
        queue: &mut OfflineQueue,
        limit: usize,
    ) -> Result<BatchSyncResult, QueueError> {
        let entries = queue.drain(Some(limit))?;
        let mut result = BatchSyncResult {
            total_events: entries.len(),
            ..BatchSyncResult::default()
        };
        if entries.is_empty() {
            return Ok(result);
        }

        let ids: Vec<String> = entries.iter().map(|e| e.event_id.clone()).collect();
        let outcomes = match self.post(&entries) {
            Ok(outcomes) => outcomes,
            Err(message) => {
                warn!(events = ids.len(), %message, "batch sync failed");
                result.fail_all(ids, &message);
                return Ok(result);
            }
        };

        apply_outcomes(&mut result, ids, outcomes);
        queue.mark_synced(&result.synced_ids)?;

        if result.success_count() == 0 {
            warn!(
                events = result.total_events,
                errors = result.error_count,
                "batch sync accepted no events"
            );
        } else {
            debug!(
                events = result.total_events,
                synced = result.synced_count,
                duplicates = result.duplicate_count,
                errors = result.error_count,
                "batch sync applied"
            );
        }
        Ok(result)
    }

    /// Repeat [`SyncClient::batch_sync`] until the queue is empty or a batch
    /// yields zero successes.
    ///
    /// # Errors
    ///
    /// Only local queue failures.
    pub fn sync_all(
        &self,
        queue: &mut OfflineQueue,
        batch_size: usize,
    ) -> Result<BatchSyncResult, QueueError> {
        self.sync_all_until(queue, batch_size, &AtomicBool::new(false))
    }

    /// [`SyncClient::sync_all`] that also stops once `cancel` is set.
    ///
    /// The flag is checked before each request. A request already in flight
    /// runs to its response or timeout and that response is applied in full.
    ///
    /// # Errors
    ///
    /// Only local queue failures.
    pub fn sync_all_until(
        &self,
        queue: &mut OfflineQueue,
        batch_size: usize,
        cancel: &AtomicBool,
    ) -> Result<BatchSyncResult, QueueError> {
        let mut total = BatchSyncResult::default();
        while !cancel.load(Ordering::Acquire) {
            let batch = self.batch_sync(queue, batch_size.max(1))?;
            let drained = batch.total_events == 0;
            let stalled = !drained && batch.success_count() == 0;
            total.absorb(batch);
            if drained {
                break;
            }
            if stalled {
                warn!(
                    remaining = queue.size()?,
                    "stopping sync: last batch had no successes"
                );
                break;
            }
        }
        Ok(total)
    }

    fn post(&self, entries: &[QueueEntry]) -> Result<Vec<EventOutcome>, String> {
        let body = encode_batch(entries).map_err(|err| format!("Failed to encode batch: {err}"))?;

        let response = self
            .agent
            .post(&self.endpoint())
            .set("Content-Type", "application/json")
            .set("Content-Encoding", "gzip")
            .set("Authorization", &format!("Bearer {}", self.token))
            .send_bytes(&body);

        match response {
            Ok(response) if response.status() == 200 => {
                let parsed: BatchResponse = response
                    .into_json()
                    .map_err(|err| format!("Invalid response body: {err}"))?;
                Ok(parsed.results)
            }
            Ok(response) => Err(format!("HTTP {}", response.status())),
            Err(ureq::Error::Status(401, _)) => Err("Authentication failed".to_string()),
            Err(ureq::Error::Status(400, response)) => {
                Err(format!("Bad request: {}", bad_request_detail(response)))
            }
            Err(ureq::Error::Status(code, _)) => Err(format!("HTTP {code}")),
            Err(ureq::Error::Transport(transport)) => Err(transport_message(&transport)),
        }
    }
}

/// [`SyncClient::batch_sync`] with a one-off client.
///
/// # Errors
///
/// Only local queue failures.
pub fn batch_sync(
    queue: &mut OfflineQueue,
    token: &str,
    server_url: &str,
    limit: usize,
) -> Result<BatchSyncResult, QueueError> {
    SyncClient::new(server_url, token).batch_sync(queue, limit)
}

// ─── private helpers ────────────────────────────────────────────────────────

/// `{"events": [...]}`, gzip-compressed.
fn encode_batch(entries: &[QueueEntry]) -> std::io::Result<Vec<u8>> {
    let events: Vec<&Value> = entries.iter().map(|e| &e.payload).collect();
    let json = serde_json::to_vec(&serde_json::json!({ "events": events }))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    encoder.finish()
}

fn apply_outcomes(result: &mut BatchSyncResult, ids: Vec<String>, outcomes: Vec<EventOutcome>) {
    let mut pending: HashSet<String> = ids.iter().cloned().collect();

    for outcome in outcomes {
        // Results for ids we did not send, or repeats, change nothing.
        if !pending.remove(&outcome.event_id) {
            continue;
        }
        match outcome.status.as_str() {
            "success" => {
                result.synced_count += 1;
                result.synced_ids.push(outcome.event_id);
            }
            "duplicate" => {
                result.duplicate_count += 1;
                result.synced_ids.push(outcome.event_id);
            }
            _ => {
                let message = outcome
                    .error_message
                    .unwrap_or_else(|| format!("server status {}", outcome.status));
                result.fail(outcome.event_id, message);
            }
        }
    }

    for event_id in ids {
        if pending.contains(&event_id) {
            result.fail(event_id, "No result returned for event".to_string());
        }
    }
}

fn bad_request_detail(response: ureq::Response) -> String {
    let body = response.into_string().unwrap_or_default();
    serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|value| {
            ["detail", "error"]
                .into_iter()
                .find_map(|key| value.get(key).map(detail_text))
        })
        .unwrap_or(body)
}

fn detail_text(value: &Value) -> String {
    value
        .as_str()
        .map_or_else(|| value.to_string(), ToString::to_string)
}

fn transport_message(transport: &ureq::Transport) -> String {
    if is_timeout(transport) {
        "Request timed out".to_string()
    } else {
        format!("Connection failed: {transport}")
    }
}

fn is_timeout(transport: &ureq::Transport) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> =
        std::error::Error::source(transport);
    while let Some(err) = source {
        let timed_out = err.downcast_ref::<std::io::Error>().is_some_and(|io| {
            matches!(
                io.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            )
        });
        if timed_out {
            return true;
        }
        source = err.source();
    }
    transport.to_string().contains("timed out")
}
