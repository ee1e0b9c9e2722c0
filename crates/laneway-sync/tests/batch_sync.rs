//! Batch client against a mock HTTP server.

use std::net::TcpListener;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use httpmock::prelude::*;
use laneway_core::event::StatusEvent;
use laneway_core::lane::Lane;
use laneway_sync::batch::{BATCH_ENDPOINT, SyncClient, batch_sync};
use laneway_sync::envelope::SyncEvent;
use laneway_sync::queue::OfflineQueue;
use laneway_sync::worker::run_pass;
use serde_json::{Value, json};

const TOKEN: &str = "test-token";

fn seeded_queue(n: usize) -> (OfflineQueue, Vec<String>) {
    let mut queue = OfflineQueue::open_in_memory().expect("queue");
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let event = StatusEvent::transition(
            "034-auth-retry",
            format!("WP{i:03}"),
            Lane::Planned,
            Lane::Claimed,
            "agent",
        );
        let envelope = SyncEvent::status_changed(&event, "node-a", i as u64 + 1);
        assert!(queue.enqueue(&envelope).expect("enqueue"));
        ids.push(envelope.event_id);
    }
    (queue, ids)
}

fn results(ids: &[String], status: impl Fn(usize) -> &'static str) -> Value {
    let results: Vec<Value> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| match status(i) {
            "error" => json!({"event_id": id, "status": "error", "error_message": format!("rejected {i}")}),
            other => json!({"event_id": id, "status": other}),
        })
        .collect();
    json!({ "results": results })
}

#[test]
fn duplicate_is_removed_like_success() {
    let server = MockServer::start();
    let (mut queue, ids) = seeded_queue(2);
    let body = results(&ids, |i| if i == 0 { "success" } else { "duplicate" });
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path(BATCH_ENDPOINT)
            .header("Content-Encoding", "gzip")
            .header("Content-Type", "application/json")
            .header("Authorization", "Bearer test-token");
        then.status(200).json_body(body);
    });

    let result = batch_sync(&mut queue, TOKEN, &server.base_url(), 1000).expect("sync");

    mock.assert();
    assert_eq!(result.total_events, 2);
    assert_eq!(result.synced_count, 1);
    assert_eq!(result.duplicate_count, 1);
    assert_eq!(result.success_count(), 2);
    assert_eq!(queue.size().unwrap(), 0);
}

#[test]
fn partial_failure_keeps_only_failed_events() {
    let server = MockServer::start();
    let (mut queue, ids) = seeded_queue(100);
    let body = results(&ids, |i| if i >= 90 { "error" } else { "success" });
    server.mock(|when, then| {
        when.method(POST).path(BATCH_ENDPOINT);
        then.status(200).json_body(body);
    });

    let result = batch_sync(&mut queue, TOKEN, &server.base_url(), 1000).expect("sync");

    assert_eq!(result.synced_count, 90);
    assert_eq!(result.error_count, 10);
    assert_eq!(result.failed_ids, ids[90..].to_vec());
    assert_eq!(result.error_messages[&ids[95]], "rejected 95");

    let remaining = queue.drain(None).unwrap();
    assert_eq!(remaining.len(), 10);
    assert!(remaining.iter().all(|entry| entry.retry_count == 0));
    let remaining_ids: Vec<_> = remaining.into_iter().map(|e| e.event_id).collect();
    assert_eq!(remaining_ids, ids[90..].to_vec());
}

#[test]
fn unauthorized_fails_every_event() {
    let server = MockServer::start();
    let (mut queue, _) = seeded_queue(3);
    server.mock(|when, then| {
        when.method(POST).path(BATCH_ENDPOINT);
        then.status(401);
    });

    let result = batch_sync(&mut queue, TOKEN, &server.base_url(), 1000).expect("sync");

    assert_eq!(result.error_count, 3);
    assert!(result.error_messages.values().all(|m| m == "Authentication failed"));
    assert_eq!(queue.size().unwrap(), 3);
}

#[test]
fn bad_request_carries_server_detail() {
    let server = MockServer::start();
    let (mut queue, _) = seeded_queue(1);
    server.mock(|when, then| {
        when.method(POST).path(BATCH_ENDPOINT);
        then.status(400).json_body(json!({"detail": "events must be a list"}));
    });

    let result = batch_sync(&mut queue, TOKEN, &server.base_url(), 1000).expect("sync");

    assert_eq!(
        result.error_messages.values().next().map(String::as_str),
        Some("Bad request: events must be a list")
    );
    assert_eq!(queue.size().unwrap(), 1);
}

#[test]
fn server_error_reports_status_code() {
    let server = MockServer::start();
    let (mut queue, _) = seeded_queue(2);
    server.mock(|when, then| {
        when.method(POST).path(BATCH_ENDPOINT);
        then.status(503);
    });

    let result = batch_sync(&mut queue, TOKEN, &server.base_url(), 1000).expect("sync");

    assert_eq!(result.error_count, 2);
    assert!(result.error_messages.values().all(|m| m == "HTTP 503"));
    assert_eq!(queue.size().unwrap(), 2);
}

#[test]
fn empty_queue_makes_no_request() {
    let server = MockServer::start();
    let mut queue = OfflineQueue::open_in_memory().unwrap();
    let mock = server.mock(|when, then| {
        when.method(POST).path(BATCH_ENDPOINT);
        then.status(200).json_body(json!({"results": []}));
    });

    let result = batch_sync(&mut queue, TOKEN, &server.base_url(), 1000).expect("sync");

    mock.assert_hits(0);
    assert_eq!(result.total_events, 0);
}

#[test]
fn sync_all_drains_in_fixed_batches() {
    let server = MockServer::start();
    let (mut queue, ids) = seeded_queue(5);
    // One canned response covering every id; each request applies its share.
    let body = results(&ids, |_| "success");
    let mock = server.mock(|when, then| {
        when.method(POST).path(BATCH_ENDPOINT);
        then.status(200).json_body(body);
    });

    let client = SyncClient::new(server.base_url(), TOKEN);
    let result = client.sync_all(&mut queue, 2).expect("sync all");

    mock.assert_hits(3);
    assert_eq!(result.synced_count, 5);
    assert_eq!(queue.size().unwrap(), 0);
}

#[test]
fn sync_all_stops_after_a_batch_without_successes() {
    let server = MockServer::start();
    let (mut queue, ids) = seeded_queue(6);
    let body = results(&ids, |_| "error");
    let mock = server.mock(|when, then| {
        when.method(POST).path(BATCH_ENDPOINT);
        then.status(200).json_body(body);
    });

    let client = SyncClient::new(server.base_url(), TOKEN);
    let result = client.sync_all(&mut queue, 2).expect("sync all");

    mock.assert_hits(1);
    assert_eq!(result.error_count, 2);
    assert_eq!(queue.size().unwrap(), 6);
}

#[test]
fn cancel_before_send_leaves_queue_untouched() {
    let server = MockServer::start();
    let (mut queue, _) = seeded_queue(3);
    let mock = server.mock(|when, then| {
        when.method(POST).path(BATCH_ENDPOINT);
        then.status(200).json_body(json!({"results": []}));
    });

    let client = SyncClient::new(server.base_url(), TOKEN);
    let before = queue.drain(None).unwrap();
    let result = client
        .sync_all_until(&mut queue, 10, &AtomicBool::new(true))
        .expect("sync");

    mock.assert_hits(0);
    assert_eq!(result.total_events, 0);
    assert_eq!(queue.drain(None).unwrap(), before);
}

#[test]
fn worker_pass_records_retries_for_failures() {
    let server = MockServer::start();
    let (mut queue, ids) = seeded_queue(3);
    let body = results(&ids, |i| if i == 1 { "error" } else { "success" });
    server.mock(|when, then| {
        when.method(POST).path(BATCH_ENDPOINT);
        then.status(200).json_body(body);
    });

    let client = SyncClient::new(server.base_url(), TOKEN);
    let result = run_pass(&client, &mut queue, 10, &AtomicBool::new(false)).expect("pass");

    assert_eq!(result.synced_count, 2);
    // The failing event went out twice (second batch stalled) but counts once.
    assert_eq!(result.total_events, 3);
    assert_eq!(result.error_count, 1);
    assert_eq!(result.failed_ids, vec![ids[1].clone()]);
    let remaining = queue.drain(None).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].event_id, ids[1]);
    assert_eq!(remaining[0].retry_count, 1);
}

#[test]
fn silent_server_times_out() {
    // Bound but never accepted: the connect succeeds and the read stalls.
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let url = format!("http://{}", listener.local_addr().unwrap());
    let (mut queue, _) = seeded_queue(2);

    let client = SyncClient::with_timeout(url, TOKEN, Duration::from_millis(300));
    let result = client.batch_sync(&mut queue, 10).expect("sync");

    assert_eq!(result.error_count, 2);
    assert!(
        result.error_messages.values().all(|m| m == "Request timed out"),
        "{:?}",
        result.error_messages
    );
    assert_eq!(queue.size().unwrap(), 2);
    drop(listener);
}

#[test]
fn refused_connection_is_reported() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().unwrap().port()
    };
    let (mut queue, _) = seeded_queue(1);

    let client = SyncClient::with_timeout(
        format!("http://127.0.0.1:{port}"),
        TOKEN,
        Duration::from_secs(2),
    );
    let result = client.batch_sync(&mut queue, 10).expect("sync");

    let message = result.error_messages.values().next().expect("one failure");
    assert!(message.starts_with("Connection failed"), "{message}");
    assert_eq!(queue.size().unwrap(), 1);
}
