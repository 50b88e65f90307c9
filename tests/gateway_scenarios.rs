// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end scenarios over the broker/connection/session-store stack,
//! exercised without a live socket or a live LLM.

use mcgw_core::{check_and_compress, count_turns, new_session_id, SessionMetadata, SessionStore, StoredSession};
use mcgw_model::Message;
use mcgw_net::{ChatRequest, Delivery, MessageBroker, QueueFull};

fn chat(conn: &str, content: &str) -> ChatRequest {
    ChatRequest { connection_id: conn.into(), content: content.into(), player_name: None, use_context: true, provider: None, delivery: Delivery::Tellraw }
}

/// Queue overflow: with a one-slot queue and one in-flight request, a
/// second submission fails with `QueueFull` rather than silently queuing.
#[test]
fn queue_overflow_rejects_the_second_request() {
    let broker = MessageBroker::new(1);
    broker.register_connection("c1");
    assert!(broker.submit_request("c1", chat("c1", "first"), 0).is_ok());
    assert_eq!(broker.submit_request("c1", chat("c1", "second"), 0), Err(QueueFull));
    assert_eq!(broker.queue_len(), 1);
}

/// Per-connection ordering: requests submitted to one connection at mixed
/// priorities come back out in submission order when priorities tie, and in
/// priority order otherwise — `get_request` never reorders within a priority.
#[tokio::test]
async fn per_connection_ordering_matches_submission_order_within_priority() {
    let broker = MessageBroker::new(64);
    broker.register_connection("c1");
    for i in 0..20 {
        let mut req = chat("c1", "");
        req.content = format!("turn-{i}");
        broker.submit_request("c1", req, (i % 3) as i64).unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..20 {
        seen.push(broker.get_request().await.payload.content);
    }

    // Within each priority bucket, arrival order must be preserved.
    let mut by_priority: std::collections::BTreeMap<i64, Vec<String>> = std::collections::BTreeMap::new();
    for (i, content) in seen.iter().enumerate() {
        let turn: usize = content.strip_prefix("turn-").unwrap().parse().unwrap();
        let _ = i;
        by_priority.entry((turn % 3) as i64).or_default().push(content.clone());
    }
    for bucket in by_priority.values() {
        let mut sorted = bucket.clone();
        sorted.sort_by_key(|c| c.strip_prefix("turn-").unwrap().parse::<usize>().unwrap());
        assert_eq!(*bucket, sorted, "arrival order within a priority bucket must be preserved");
    }
    // And priorities themselves must come out non-decreasing.
    let priorities_seen: Vec<i64> = seen.iter().map(|c| (c.strip_prefix("turn-").unwrap().parse::<usize>().unwrap() % 3) as i64).collect();
    let mut sorted_priorities = priorities_seen.clone();
    sorted_priorities.sort();
    assert_eq!(priorities_seen, sorted_priorities);
}

/// Context compression: with `max_history_turns=5` and 10 simulated user
/// turns, compression folds the oldest 5 turns into one synthetic summary
/// message, leaving exactly 5 verbatim turns plus the summary (`count_turns`
/// == 6).
#[test]
fn context_compression_keeps_five_verbatim_turns_plus_one_summary() {
    let mut history = Vec::new();
    for i in 0..10 {
        history.push(Message::user(format!("turn {i} question")));
        history.push(Message::assistant(format!("turn {i} answer")));
    }
    assert_eq!(count_turns(&history), 10);

    let compressed = check_and_compress(&mut history, 5, false);
    assert!(compressed, "10 turns against max_history_turns=5 must cross the 0.8 threshold");
    assert_eq!(count_turns(&history), 6);

    let first = &history[0];
    assert_eq!(first.as_text().map(|t| t.starts_with("[历史摘要] ")), Some(true));

    // The 5 verbatim turns are the most recent ones (turns 5..=9).
    let last_user_text = history.iter().rev().find_map(|m| if m.role == mcgw_model::Role::User { m.as_text() } else { None }).unwrap();
    assert_eq!(last_user_text, "turn 9 question");
}

/// Session path safety: an id containing `..` is rejected before any
/// filesystem access, and no file is created.
#[test]
fn session_path_traversal_is_rejected_without_touching_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path());

    let err = store.delete("../escape").unwrap_err();
    assert!(err.to_string().contains("非法会话 ID"));
    assert!(err.to_string().contains("../escape"));

    // No file should exist anywhere near the storage root.
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}

/// Saved-then-loaded sessions round-trip structurally, and `list` surfaces
/// the saved session with its message count.
#[test]
fn saved_session_round_trips_and_is_listed() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path());

    let now = chrono::Utc::now();
    let messages = vec![Message::user("hi"), Message::assistant("hello")];
    let stored = StoredSession {
        connection_id: "conn-1".into(),
        player_name: Some("Steve".into()),
        provider: "mock".into(),
        model: "mock-model".into(),
        created_at: now,
        updated_at: now,
        message_count: messages.len(),
        messages: messages.clone(),
        metadata: SessionMetadata::default(),
    };

    let session_id = new_session_id("conn-1");
    store.save(&session_id, &stored).unwrap();

    let loaded = store.load(&session_id).unwrap();
    assert_eq!(loaded.message_count, 2);
    assert_eq!(loaded.player_name.as_deref(), Some("Steve"));

    let listed = store.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, session_id);
    assert_eq!(listed[0].message_count, 2);

    assert!(store.delete(&session_id).unwrap());
    assert!(store.list().unwrap().is_empty());
}

/// On unregister, a connection's response channel is dropped so the sender
/// loop (driven elsewhere) observes closure rather than hanging forever.
#[tokio::test]
async fn unregister_drops_the_response_channel() {
    let broker = MessageBroker::new(8);
    let mut rx = broker.register_connection("c1").unwrap();
    assert!(broker.send_response("c1", mcgw_net::ResponseItem::RunCommand { command: "say hi".into(), origin: "player", result_tx: None }));
    broker.unregister_connection("c1");
    // The channel is closed: a subsequent recv drains any buffered item then yields None.
    let _ = rx.recv().await;
    assert!(rx.recv().await.is_none());
}
