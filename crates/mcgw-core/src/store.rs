// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! C4's file-backed session store: save/load/list/delete under a storage
//! root, with path-safety checks on the `session_id` (§4.4, §6, §8 scenario 4).

use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;

use crate::session::{SessionSummary, StoredSession};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("非法会话 ID: {0}")]
    InvalidSessionId(String),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Reject any `session_id` containing a path separator, `..`, or a filename
/// suffix — and reject one whose resolved path would escape `root` (§6).
fn validate_session_id(root: &Path, session_id: &str) -> Result<PathBuf, StoreError> {
    if session_id.is_empty()
        || session_id.contains('/')
        || session_id.contains('\\')
        || session_id.contains("..")
        || session_id.contains('.')
    {
        return Err(StoreError::InvalidSessionId(session_id.to_string()));
    }
    let path = root.join(format!("{session_id}.json"));
    let resolved_parent = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    // The file itself need not exist yet (save creates it); checking the
    // parent is enough to catch any escape attempt that slipped past the
    // character checks above.
    if !resolved_parent.starts_with(root) {
        return Err(StoreError::InvalidSessionId(session_id.to_string()));
    }
    Ok(path)
}

/// File-backed store for [`StoredSession`]s under `data/conversations/`.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn ensure_root(&self) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Atomically write `session` as `<session_id>.json` under the storage
    /// root (write to a temp file, then rename).
    pub fn save(&self, session_id: &str, session: &StoredSession) -> Result<(), StoreError> {
        let path = validate_session_id(&self.root, session_id)?;
        self.ensure_root()?;
        let json = serde_json::to_string_pretty(session)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load(&self, session_id: &str) -> Result<StoredSession, StoreError> {
        let path = validate_session_id(&self.root, session_id)?;
        if !path.exists() {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Enumerate stored sessions, most-recently-updated first.
    pub fn list(&self) -> Result<Vec<SessionSummary>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut summaries = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            let Ok(stored) = serde_json::from_str::<StoredSession>(&contents) else {
                continue;
            };
            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            summaries.push(SessionSummary {
                id,
                player_name: stored.player_name,
                provider: stored.provider,
                model: stored.model,
                created_at: stored.created_at,
                updated_at: stored.updated_at,
                message_count: stored.message_count,
            });
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    /// Returns `true` if a file was removed, `false` if it did not exist.
    pub fn delete(&self, session_id: &str) -> Result<bool, StoreError> {
        let path = validate_session_id(&self.root, session_id)?;
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        Ok(true)
    }
}

/// `session_id = <connection_id>_<YYYYmmdd_HHMMSS>` in UTC, matching the
/// grammar `^[^/\\]+_\d{8}_\d{6}$` (§6).
pub fn new_session_id(connection_id: &str) -> String {
    crate::session::Session::session_id_for(connection_id, Utc::now())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
