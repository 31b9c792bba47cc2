// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Completion tracking
//!
//! Two independent signals per prompt, first one wins: the WebSocket
//! terminal event, and history polling as a liveness safety net. After a
//! WebSocket success the poller is reconfigured fast and bounded; history
//! is the authoritative source of file bytes. Either signal failing
//! terminates the other and fails the prompt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use comfygate_kernel::error::{GatewayError, Result};

use crate::client::EngineClient;
use crate::types::{EngineEvent, EventKind, ExecutionStats, NodeTiming};

/// How long a history-first completion waits for the WebSocket terminal
/// event before giving up on its stats
const LATE_STATS_WINDOW: Duration = Duration::from_secs(2);

/// Outputs and timing for one completed prompt
#[derive(Debug)]
pub struct PromptOutcome {
    pub outputs: HashMap<String, Vec<u8>>,
    pub stats: ExecutionStats,
}

/// Tracks one queued prompt to completion
pub struct CompletionCoordinator {
    client: Arc<EngineClient>,
    engine_id: String,
    rx: mpsc::UnboundedReceiver<EngineEvent>,
    slow_interval: Duration,
    fast_interval: Duration,
    fast_max_tries: u32,
}

impl CompletionCoordinator {
    /// Attach to a prompt previously registered via
    /// [`EngineClient::queue`]. Fails when the prompt is unknown or
    /// already tracked.
    pub fn attach(
        client: Arc<EngineClient>,
        engine_id: &str,
        slow_interval: Duration,
        fast_interval: Duration,
        fast_max_tries: u32,
    ) -> Result<Self> {
        let rx = client
            .take_receiver(engine_id)
            .ok_or_else(|| GatewayError::internal(format!("prompt {engine_id} is not tracked")))?;
        Ok(Self {
            client,
            engine_id: engine_id.to_string(),
            rx,
            slow_interval,
            fast_interval,
            fast_max_tries,
        })
    }

    /// Wait for the prompt to finish and collect `{outputs, stats}`
    pub async fn wait(mut self) -> Result<PromptOutcome> {
        let result = self.run().await;
        self.client.finish(&self.engine_id);
        result
    }

    async fn run(&mut self) -> Result<PromptOutcome> {
        let mut stats = ExecutionStats {
            start: Some(now_ms()),
            ..Default::default()
        };
        let mut ws_success = false;
        let mut fast_tries: u32 = 0;
        let mut poll_interval = self.slow_interval;

        loop {
            tokio::select! {
                maybe_event = self.rx.recv(), if !ws_success => {
                    let event = maybe_event.ok_or_else(|| GatewayError::Network {
                        message: "engine connection lost while prompt was in flight".to_string(),
                        source: None,
                    })?;

                    if self.apply_event(&event, &mut stats)? {
                        // WebSocket success: history turns authoritative,
                        // poll it fast with a bounded budget
                        ws_success = true;
                        poll_interval = self.fast_interval;
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {
                    match self.client.history(&self.engine_id).await? {
                        Some(outputs) => {
                            if !ws_success {
                                // History won the race; harvest stats from
                                // the socket for a bounded moment
                                self.drain_late_stats(&mut stats).await;
                            }
                            finalize(&mut stats);
                            return Ok(PromptOutcome { outputs, stats });
                        }
                        None if ws_success => {
                            fast_tries += 1;
                            if fast_tries >= self.fast_max_tries {
                                return Err(GatewayError::Engine {
                                    message: format!(
                                        "engine signalled success but history never completed for {}",
                                        self.engine_id
                                    ),
                                });
                            }
                        }
                        None => {}
                    }
                }
            }
        }
    }

    /// Update stats from one event; `Ok(true)` on the success terminal,
    /// error on a failure terminal
    fn apply_event(&self, event: &EngineEvent, stats: &mut ExecutionStats) -> Result<bool> {
        match &event.kind {
            EventKind::ExecutionStart => {
                stats.start = Some(now_ms());
                stats.per_node.clear();
            }
            EventKind::Executing => {
                match event.data.get("node") {
                    Some(Value::String(node)) => {
                        stats
                            .per_node
                            .entry(node.clone())
                            .or_insert_with(|| NodeTiming {
                                start: now_ms(),
                                end: None,
                            });
                    }
                    // A null node means the engine moved past the last one
                    _ => {}
                }
            }
            EventKind::Executed => {
                if let Some(node) = event.data.get("node").and_then(Value::as_str) {
                    if let Some(timing) = stats.per_node.get_mut(node) {
                        timing.end = Some(now_ms());
                    }
                }
            }
            EventKind::ExecutionSuccess => {
                stats.end = Some(now_ms());
                return Ok(true);
            }
            EventKind::ExecutionError => {
                return Err(GatewayError::Engine {
                    message: format!("execution failed: {}", terse(&event.data)),
                });
            }
            EventKind::ExecutionInterrupted => {
                return Err(GatewayError::Engine {
                    message: "execution interrupted".to_string(),
                });
            }
            EventKind::Closed => {
                return Err(GatewayError::Network {
                    message: "engine connection closed while prompt was in flight".to_string(),
                    source: None,
                });
            }
            _ => {}
        }
        Ok(false)
    }

    /// History completed before the socket said anything terminal; give
    /// the stats events a short window to arrive
    async fn drain_late_stats(&mut self, stats: &mut ExecutionStats) {
        let deadline = tokio::time::Instant::now() + LATE_STATS_WINDOW;
        loop {
            let event = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return,
                maybe_event = self.rx.recv() => match maybe_event {
                    Some(event) => event,
                    None => return,
                },
            };
            if matches!(self.apply_event(&event, stats), Ok(true)) || event.kind.is_terminal() {
                return;
            }
        }
    }
}

fn finalize(stats: &mut ExecutionStats) {
    if stats.end.is_none() {
        stats.end = Some(now_ms());
    }
    if let (Some(start), Some(end)) = (stats.start, stats.end) {
        let duration = end.saturating_sub(start).max(0) as u64;
        stats.duration = Some(duration);
        stats.engine_ms = duration;
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn terse(data: &Value) -> String {
    let message = data
        .get("exception_message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| data.to_string());
    let node = data.get("node_type").and_then(Value::as_str).unwrap_or("");
    if node.is_empty() {
        message
    } else {
        format!("{node}: {message}")
    }
}
