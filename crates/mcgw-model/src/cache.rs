// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Caches constructed [`ModelProvider`] handles by provider configuration.
//!
//! Construction (building an HTTP client, resolving auth) is not free, and a
//! gateway with many concurrent connections on the same provider would
//! otherwise redo it on every chat turn. This cache is shared across all
//! connections and workers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use mcgw_config::ModelConfig;
use thiserror::Error;

use crate::provider::ModelProvider;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider not configured: {0}")]
    NotConfigured(String),
    #[error("unknown provider: {0}")]
    NotFound(String),
    #[error(transparent)]
    Construction(#[from] anyhow::Error),
}

/// Cache key: construction is fully determined by these four fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    provider: String,
    model: String,
    base_url: Option<String>,
    timeout_secs: u64,
}

impl CacheKey {
    fn from_config(cfg: &ModelConfig) -> Self {
        Self {
            provider: cfg.provider.clone(),
            model: cfg.name.clone(),
            base_url: cfg.base_url.clone(),
            timeout_secs: cfg.timeout_secs,
        }
    }
}

/// Caches `Model` handles by provider config key (§C2).
///
/// Cloning is cheap: the cache itself is `Arc`-backed internally, so all
/// clones share the same map.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    cache: Arc<Mutex<HashMap<CacheKey, Arc<dyn ModelProvider>>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a cached `Model` handle for `cfg`, constructing and caching one
    /// on first use.
    pub fn get_model(&self, cfg: &ModelConfig) -> Result<Arc<dyn ModelProvider>, ProviderError> {
        if cfg.provider.is_empty() {
            return Err(ProviderError::NotConfigured("<empty>".into()));
        }
        if crate::registry::get_driver(&cfg.provider).is_none() && cfg.provider != "mock" {
            return Err(ProviderError::NotFound(cfg.provider.clone()));
        }

        let key = CacheKey::from_config(cfg);
        let mut cache = self.cache.lock().expect("provider cache poisoned");
        if let Some(model) = cache.get(&key) {
            return Ok(Arc::clone(model));
        }

        let model: Arc<dyn ModelProvider> = Arc::from(crate::from_config(cfg)?);
        cache.insert(key, Arc::clone(&model));
        Ok(model)
    }

    /// Pre-builds the default provider's model so the first chat turn does
    /// not pay construction latency.
    pub fn warmup_models(&self, default_provider: &ModelConfig) -> Result<(), ProviderError> {
        self.get_model(default_provider).map(|_| ())
    }

    /// Drops every cached model handle.
    pub fn shutdown(&self) {
        self.cache.lock().expect("provider cache poisoned").clear();
    }

    /// Number of distinct provider configurations currently cached.
    pub fn len(&self) -> usize {
        self.cache.lock().expect("provider cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
