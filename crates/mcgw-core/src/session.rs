// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use mcgw_model::{Message, Role};
use serde::{Deserialize, Serialize};

/// Variables bound to a connection's saved conversation: the template in
/// use and any custom `{placeholder}` values (see [`crate::prompts`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub template: String,
    #[serde(default)]
    pub custom_variables: std::collections::HashMap<String, String>,
}

/// One session as written to / read from the on-disk store by C4's
/// save/load operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub connection_id: String,
    pub player_name: Option<String>,
    pub provider: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub messages: Vec<Message>,
    pub metadata: SessionMetadata,
}

/// Summary record returned by the session list operation — everything
/// except the (possibly large) message list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub player_name: Option<String>,
    pub provider: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

/// In-memory conversation history for one active connection.
#[derive(Debug)]
pub struct Session {
    pub connection_id: String,
    pub player_name: Option<String>,
    pub provider: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    /// Approximate total token count for the current message list.
    pub token_count: usize,
    /// Maximum context tokens (set from model config / provider limits).
    pub max_tokens: usize,
    pub metadata: SessionMetadata,
}

impl Session {
    pub fn new(connection_id: impl Into<String>, provider: impl Into<String>, model: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            connection_id: connection_id.into(),
            player_name: None,
            provider: provider.into(),
            model: model.into(),
            created_at: Utc::now(),
            messages: Vec::new(),
            token_count: 0,
            max_tokens,
            metadata: SessionMetadata::default(),
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
    }

    pub fn push_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs {
            self.push(m);
        }
    }

    /// A turn is one `user-prompt` part; count by scanning messages (§4.4).
    pub fn turn_count(&self) -> usize {
        self.messages.iter().filter(|m| m.role == Role::User).count()
    }

    /// Fraction of context window consumed (0.0–1.0).
    pub fn context_fraction(&self) -> f32 {
        if self.max_tokens == 0 {
            return 0.0;
        }
        (self.token_count as f32) / (self.max_tokens as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Recalculate token count from scratch (call after compaction).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    /// Replace the message list and recalculate token count.
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }

    /// `session_id = <connection_id>_<YYYYmmdd_HHMMSS>` (§4.4 Save).
    pub fn session_id_for(connection_id: &str, at: DateTime<Utc>) -> String {
        format!("{connection_id}_{}", at.format("%Y%m%d_%H%M%S"))
    }

    pub fn to_stored(&self, updated_at: DateTime<Utc>) -> StoredSession {
        StoredSession {
            connection_id: self.connection_id.clone(),
            player_name: self.player_name.clone(),
            provider: self.provider.clone(),
            model: self.model.clone(),
            created_at: self.created_at,
            updated_at,
            message_count: self.messages.len(),
            messages: self.messages.clone(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn from_stored(stored: StoredSession) -> Self {
        let mut session = Session::new(stored.connection_id, stored.provider, stored.model, 0);
        session.player_name = stored.player_name;
        session.created_at = stored.created_at;
        session.metadata = stored.metadata;
        session.replace_messages(stored.messages);
        session
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
