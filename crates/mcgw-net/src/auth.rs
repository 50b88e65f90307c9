// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Login verification and per-connection tokens (§4.7 login command, §6
//! auth collaborator config).
//!
//! Tokens are HMAC-SHA256-signed `<connection_id>.<expiry>.<sig>` strings —
//! there is no JWT library in the dependency stack, so this is a minimal
//! hand-rolled equivalent built from the same RustCrypto primitives the
//! rest of the crate already uses for constant-time comparisons.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use hmac::{Hmac, Mac};
use nonzero_ext::nonzero;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;
type KeyedLimiter = DefaultKeyedRateLimiter<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginError {
    WrongPassword,
    RateLimited,
    NotConfigured,
}

/// Verifies `#登录 <password>` against the configured shared password, and
/// issues/validates per-connection bearer tokens.
pub struct Authenticator {
    password: Option<String>,
    secret: Vec<u8>,
    expiration_secs: u64,
    login_attempts: Arc<KeyedLimiter>,
}

impl Authenticator {
    pub fn new(password: Option<String>, secret: impl Into<String>, expiration_secs: u64) -> Self {
        // 5 login attempts/minute per connection.
        let quota = Quota::per_minute(nonzero!(5u32));
        Self {
            password,
            secret: secret.into().into_bytes(),
            expiration_secs,
            login_attempts: Arc::new(RateLimiter::keyed(quota)),
        }
    }

    /// Checks `attempt` against the configured password. `None` password
    /// means login is not configured (dev mode should be used instead).
    pub fn verify_password(&self, conn_id: &str, attempt: &str) -> Result<String, LoginError> {
        if self.login_attempts.check_key(&conn_id.to_string()).is_err() {
            return Err(LoginError::RateLimited);
        }
        let Some(expected) = &self.password else { return Err(LoginError::NotConfigured) };
        if !constant_time_eq(attempt.as_bytes(), expected.as_bytes()) {
            return Err(LoginError::WrongPassword);
        }
        Ok(self.issue_token(conn_id))
    }

    fn issue_token(&self, conn_id: &str) -> String {
        let expiry = now_secs() + self.expiration_secs;
        let payload = format!("{conn_id}.{expiry}");
        let sig = self.sign(&payload);
        format!("{payload}.{sig}")
    }

    /// Validates a previously issued token for `conn_id`, rejecting expired
    /// or tampered tokens.
    pub fn verify_token(&self, conn_id: &str, token: &str) -> bool {
        let mut parts = token.rsplitn(2, '.');
        let Some(sig) = parts.next() else { return false };
        let Some(payload) = parts.next() else { return false };
        if !constant_time_eq(sig.as_bytes(), self.sign(payload).as_bytes()) {
            return false;
        }
        let Some((id, expiry)) = payload.split_once('.') else { return false };
        if id != conn_id {
            return false;
        }
        let Ok(expiry) = expiry.parse::<u64>() else { return false };
        expiry >= now_secs()
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts a key of any length");
        mac.update(payload.as_bytes());
        hex_encode(&mac.finalize().into_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).into()
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
