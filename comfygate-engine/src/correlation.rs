// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Engine-id to caller-id correlation
//!
//! Written when the engine acknowledges a queued prompt, read on every
//! inbound WebSocket event, and evicted shortly after terminal completion
//! to bound memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Delay between terminal completion and eviction; late events that
/// straggle in right after completion still resolve
pub const EVICT_DELAY: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Inner {
    engine_to_caller: HashMap<String, String>,
    caller_to_engine: HashMap<String, String>,
}

/// Process-wide bidirectional id map, guarded by one mutex
#[derive(Default)]
pub struct CorrelationMap {
    inner: Mutex<Inner>,
}

impl CorrelationMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a queued prompt's id pair
    pub fn insert(&self, engine_id: &str, caller_id: &str) {
        let mut inner = self.lock();
        inner
            .engine_to_caller
            .insert(engine_id.to_string(), caller_id.to_string());
        inner
            .caller_to_engine
            .insert(caller_id.to_string(), engine_id.to_string());
    }

    pub fn caller_for(&self, engine_id: &str) -> Option<String> {
        self.lock().engine_to_caller.get(engine_id).cloned()
    }

    pub fn engine_for(&self, caller_id: &str) -> Option<String> {
        self.lock().caller_to_engine.get(caller_id).cloned()
    }

    /// Drop both directions immediately
    pub fn remove(&self, engine_id: &str) {
        let mut inner = self.lock();
        if let Some(caller) = inner.engine_to_caller.remove(engine_id) {
            inner.caller_to_engine.remove(&caller);
        }
    }

    /// Drop both directions after [`EVICT_DELAY`]
    pub fn evict_later(self: &Arc<Self>, engine_id: &str) {
        let map = self.clone();
        let engine_id = engine_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(EVICT_DELAY).await;
            map.remove(&engine_id);
        });
    }

    pub fn len(&self) -> usize {
        self.lock().engine_to_caller.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
