// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! C1 MessageBroker: the bounded priority request queue, per-connection
//! response channels, per-connection locks, and per-connection history
//! store (§4.1).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use mcgw_model::Message;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::warn;

use crate::protocol::ChatRequest;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("request queue is full")]
pub struct QueueFull;

/// One item on a connection's response channel (§4.6 consumes these by type).
#[derive(Debug)]
pub enum ResponseItem {
    /// A rendered chunk ready for C6 to send to the game client.
    GameMessage(crate::connection::StreamChunk),
    /// A raw MCBE command to dispatch, optionally awaited via `result_future`.
    RunCommand {
        command: String,
        origin: &'static str,
        /// Present when a tool is awaiting this command's `commandResponse`.
        result_tx: Option<tokio::sync::oneshot::Sender<String>>,
    },
}

struct Envelope {
    priority: i64,
    sequence: u64,
    connection_id: String,
    payload: ChatRequest,
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for Envelope {}

impl PartialOrd for Envelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Envelope {
    /// `BinaryHeap` is a max-heap; we want the **lowest** `(priority,
    /// sequence)` pair out first, so the ordering is reversed here.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// The dequeued form of a request envelope, handed to an `AgentWorker`.
pub struct RequestEnvelope {
    pub connection_id: String,
    pub sequence: u64,
    pub payload: ChatRequest,
}

struct ConnectionSlot {
    lock: Arc<Mutex<()>>,
    history: Arc<Mutex<Vec<Message>>>,
    response_tx: mpsc::UnboundedSender<ResponseItem>,
}

struct Inner {
    capacity: usize,
    queue: std::sync::Mutex<BinaryHeap<Envelope>>,
    sequence: AtomicU64,
    notify: Notify,
    connections: std::sync::Mutex<HashMap<String, ConnectionSlot>>,
}

/// C1: bounded priority request queue plus per-connection state (§4.1).
///
/// Cloning is cheap — it shares the same underlying queue and connection map.
#[derive(Clone)]
pub struct MessageBroker {
    inner: Arc<Inner>,
}

impl MessageBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity,
                queue: std::sync::Mutex::new(BinaryHeap::new()),
                sequence: AtomicU64::new(0),
                notify: Notify::new(),
                connections: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Non-blocking enqueue; fails with [`QueueFull`] at capacity (§4.1, §8
    /// scenario 2).
    pub fn submit_request(&self, connection_id: &str, payload: ChatRequest, priority: i64) -> Result<(), QueueFull> {
        let mut queue = self.inner.queue.lock().expect("queue mutex poisoned");
        if queue.len() >= self.inner.capacity {
            return Err(QueueFull);
        }
        let sequence = self.inner.sequence.fetch_add(1, AtomicOrdering::SeqCst);
        queue.push(Envelope { priority, sequence, connection_id: connection_id.to_string(), payload });
        drop(queue);
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Blocks until an envelope is available, then returns it. Ordering is
    /// `(priority asc, sequence asc)` — a strict total order (§4.1 invariant c).
    pub async fn get_request(&self) -> RequestEnvelope {
        loop {
            {
                let mut queue = self.inner.queue.lock().expect("queue mutex poisoned");
                if let Some(env) = queue.pop() {
                    return RequestEnvelope { connection_id: env.connection_id, sequence: env.sequence, payload: env.payload };
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Marks the previous `get_request` as processed. A no-op here: this
    /// broker doesn't expose join semantics, but the method is kept so
    /// callers that do need it (tests, future queue backends) have a place
    /// to hook.
    pub fn request_done(&self) {}

    /// Registers `conn_id`, returning its response-channel receiver (for the
    /// caller's sender task), a fresh history slot, and a per-connection lock.
    ///
    /// Idempotent: a second registration for an already-registered id logs a
    /// warning and returns `None` — the first registration's receiver is
    /// still the one in use; there is no second receiver to hand back.
    pub fn register_connection(&self, conn_id: &str) -> Option<mpsc::UnboundedReceiver<ResponseItem>> {
        let mut connections = self.inner.connections.lock().expect("connections mutex poisoned");
        if connections.contains_key(conn_id) {
            warn!(conn_id, "register_connection called for an already-registered connection");
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        connections.insert(
            conn_id.to_string(),
            ConnectionSlot { lock: Arc::new(Mutex::new(())), history: Arc::new(Mutex::new(Vec::new())), response_tx: tx },
        );
        Some(rx)
    }

    /// Drops the response channel, lock, and history for `conn_id`.
    ///
    /// Any items still queued in the (now-dropped) channel are lost from the
    /// broker's perspective; the caller (C6) is responsible for resolving
    /// outstanding command futures before calling this (§4.6 shutdown
    /// ordering).
    pub fn unregister_connection(&self, conn_id: &str) {
        self.inner.connections.lock().expect("connections mutex poisoned").remove(conn_id);
    }

    /// Enqueues `item` to `conn_id`'s response channel. Returns `false` if
    /// the connection is not registered.
    pub fn send_response(&self, conn_id: &str, item: ResponseItem) -> bool {
        let connections = self.inner.connections.lock().expect("connections mutex poisoned");
        match connections.get(conn_id) {
            Some(slot) => slot.response_tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Returns the per-connection serialization lock, taken by a worker for
    /// the duration of one request to guarantee in-order processing.
    pub fn get_connection_lock(&self, conn_id: &str) -> Option<Arc<Mutex<()>>> {
        self.inner
            .connections
            .lock()
            .expect("connections mutex poisoned")
            .get(conn_id)
            .map(|slot| Arc::clone(&slot.lock))
    }

    /// Value-semantics read of a connection's history (a clone, never an
    /// alias) — `None` if the connection is not registered.
    pub async fn get_conversation_history(&self, conn_id: &str) -> Option<Vec<Message>> {
        let handle = {
            let connections = self.inner.connections.lock().expect("connections mutex poisoned");
            connections.get(conn_id).map(|slot| Arc::clone(&slot.history))
        };
        match handle {
            Some(history) => Some(history.lock().await.clone()),
            None => None,
        }
    }

    pub async fn set_conversation_history(&self, conn_id: &str, messages: Vec<Message>) -> bool {
        let handle = {
            let connections = self.inner.connections.lock().expect("connections mutex poisoned");
            connections.get(conn_id).map(|slot| Arc::clone(&slot.history))
        };
        match handle {
            Some(history) => {
                *history.lock().await = messages;
                true
            }
            None => false,
        }
    }

    pub async fn clear_conversation_history(&self, conn_id: &str) {
        self.set_conversation_history(conn_id, Vec::new()).await;
    }

    pub fn is_registered(&self, conn_id: &str) -> bool {
        self.inner.connections.lock().expect("connections mutex poisoned").contains_key(conn_id)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().expect("connections mutex poisoned").len()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().expect("queue mutex poisoned").len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
