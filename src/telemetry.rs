// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Periodic telemetry aggregator
//!
//! Counts prompt successes/failures and cumulative duration, POSTs the
//! aggregate to a configured sink on an interval, and resets on post.
//! Disabled entirely when no sink URL is configured.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

/// Reset-on-post counters
#[derive(Debug, Default)]
pub struct Telemetry {
    success: AtomicU64,
    failure: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl Telemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_success(&self, duration_ms: u64) {
        self.success.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms.fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failure.fetch_add(1, Ordering::Relaxed);
    }

    /// Read and zero the counters
    pub fn drain(&self) -> (u64, u64, u64) {
        (
            self.success.swap(0, Ordering::Relaxed),
            self.failure.swap(0, Ordering::Relaxed),
            self.total_duration_ms.swap(0, Ordering::Relaxed),
        )
    }

    /// Background post loop; call once at boot when a sink is configured
    pub fn spawn_reporter(self: &Arc<Self>, client: reqwest::Client, url: String, every: Duration) {
        let telemetry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let (success, failure, total_ms) = telemetry.drain();
                if success == 0 && failure == 0 {
                    continue;
                }
                let payload = json!({
                    "prompts_completed": success,
                    "prompts_failed": failure,
                    "cumulative_duration_ms": total_ms,
                });
                if let Err(e) = client.post(&url).json(&payload).send().await {
                    tracing::warn!(url = %url, "telemetry post failed: {e}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_resets() {
        let telemetry = Telemetry::new();
        telemetry.record_success(120);
        telemetry.record_success(80);
        telemetry.record_failure();

        assert_eq!(telemetry.drain(), (2, 1, 200));
        assert_eq!(telemetry.drain(), (0, 0, 0));
    }
}
