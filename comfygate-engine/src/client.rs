// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Engine HTTP client and WebSocket event pump
//!
//! Exactly one WebSocket connection exists per gateway process; its URL
//! carries the gateway-generated client id so engine events are routable.
//! The reader task demultiplexes frames into per-prompt channels (keyed by
//! engine id) and fans a caller-id rewritten copy out to subscribers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use comfygate_kernel::config::Config;
use comfygate_kernel::error::{GatewayError, Result};

use crate::correlation::CorrelationMap;
use crate::types::{collect_file_refs, EngineEvent, EventKind};

/// Typed handler for demultiplexed engine events. Handlers run on the
/// WebSocket reader task and must not block; spawn for anything slow.
pub trait EventSubscriber: Send + Sync {
    /// Whether this subscriber wants events of the given kind
    fn wants(&self, kind: &EventKind) -> bool;
    fn on_event(&self, event: &EngineEvent);
}

struct PromptChannel {
    sender: mpsc::UnboundedSender<EngineEvent>,
    receiver: Option<mpsc::UnboundedReceiver<EngineEvent>>,
}

/// Client for the engine's HTTP queue and WebSocket event stream
pub struct EngineClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    output_dir: PathBuf,
    correlation: Arc<CorrelationMap>,
    subscribers: Mutex<Vec<Arc<dyn EventSubscriber>>>,
    channels: Mutex<HashMap<String, PromptChannel>>,
    queue_remaining: AtomicU64,
}

impl EngineClient {
    pub fn new(config: &Config, client_id: &str) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            http: config.http_config.create_client()?,
            base_url: config.engine_url.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            output_dir: config.output_dir.clone(),
            correlation: CorrelationMap::new(),
            subscribers: Mutex::new(Vec::new()),
            channels: Mutex::new(HashMap::new()),
            queue_remaining: AtomicU64::new(0),
        }))
    }

    /// Gateway-generated id the engine routes events back to
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn correlation(&self) -> &Arc<CorrelationMap> {
        &self.correlation
    }

    /// Depth reported by the engine's status events
    pub fn queue_remaining(&self) -> u64 {
        self.queue_remaining.load(Ordering::Relaxed)
    }

    /// Register a subscriber for demultiplexed events
    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.lock_subscribers().push(subscriber);
    }

    /// Queue a prompt. The engine assigns its own id; the correlation map
    /// and the prompt's event channel are registered before this returns,
    /// so no event can slip past the tracker.
    pub async fn queue(&self, prompt: &Value, caller_id: &str) -> Result<String> {
        let url = format!("{}/prompt", self.base_url);
        let body = json!({ "prompt": prompt, "client_id": self.client_id });

        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Engine {
                message: format!("engine rejected prompt ({status}): {text}"),
            });
        }

        let ack: Value = response.json().await?;
        let engine_id = ack
            .get("prompt_id")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Engine {
                message: format!("engine ack missing prompt_id: {ack}"),
            })?
            .to_string();

        self.correlation.insert(&engine_id, caller_id);

        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock_channels().insert(
            engine_id.clone(),
            PromptChannel {
                sender,
                receiver: Some(receiver),
            },
        );

        tracing::debug!(%engine_id, caller_id, "prompt queued");
        Ok(engine_id)
    }

    /// Take the event receiver for a queued prompt (one tracker per prompt)
    pub fn take_receiver(&self, engine_id: &str) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.lock_channels()
            .get_mut(engine_id)
            .and_then(|ch| ch.receiver.take())
    }

    /// Drop the prompt's channel and schedule correlation eviction
    pub fn finish(&self, engine_id: &str) {
        self.lock_channels().remove(engine_id);
        self.correlation.evict_later(engine_id);
    }

    /// Fetch history for a prompt. `None` until the engine has recorded
    /// it; file bytes once it completes; an error when the engine reports
    /// one.
    pub async fn history(&self, engine_id: &str) -> Result<Option<HashMap<String, Vec<u8>>>> {
        let url = format!("{}/history/{}", self.base_url, engine_id);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Engine {
                message: format!("history fetch failed ({status}): {text}"),
            });
        }

        let body: Value = response.json().await?;
        let Some(entry) = body.get(engine_id).filter(|e| !e.is_null()) else {
            return Ok(None);
        };

        let status_obj = entry.get("status");
        let completed = status_obj
            .and_then(|s| s.get("completed"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let status_str = status_obj
            .and_then(|s| s.get("status_str"))
            .and_then(Value::as_str)
            .unwrap_or("");

        if status_str == "error" {
            let messages = status_obj
                .and_then(|s| s.get("messages"))
                .cloned()
                .unwrap_or(Value::Null);
            return Err(GatewayError::Engine {
                message: format!("engine reported execution error: {messages}"),
            });
        }

        if !completed && status_str != "success" {
            return Ok(None);
        }

        let refs = collect_file_refs(entry.get("outputs").unwrap_or(&Value::Null));
        let mut outputs = HashMap::new();
        for file_ref in refs {
            let path = if file_ref.subfolder.is_empty() {
                self.output_dir.join(&file_ref.filename)
            } else {
                self.output_dir
                    .join(&file_ref.subfolder)
                    .join(&file_ref.filename)
            };
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    outputs.insert(file_ref.filename.clone(), bytes);
                }
                Err(e) => {
                    // Nodes legitimately emit optional outputs
                    tracing::warn!(
                        file = %path.display(),
                        "history references a missing output file: {e}"
                    );
                }
            }
        }

        Ok(Some(outputs))
    }

    /// Delete engine-produced output files after they have been read
    pub async fn delete_outputs(&self, filenames: &[String]) {
        for name in filenames {
            let path = self.output_dir.join(name);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::debug!(file = %path.display(), "output cleanup skipped: {e}");
            } else {
                self.emit_synthetic(EventKind::FileDeleted, json!({ "filename": name }));
            }
        }
    }

    /// Interrupt the prompt mapped to a caller id
    pub async fn interrupt(&self, caller_id: &str) -> Result<()> {
        let engine_id = self
            .correlation
            .engine_for(caller_id)
            .ok_or_else(|| GatewayError::NotFound {
                message: format!("no in-flight prompt with id {caller_id}"),
            })?;

        let url = format!("{}/interrupt", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "prompt_id": engine_id }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Engine {
                message: format!("interrupt failed ({status}): {text}"),
            });
        }
        Ok(())
    }

    /// Liveness probe against the engine HTTP endpoint
    pub async fn ping(&self) -> bool {
        let url = format!("{}/history?max_items=1", self.base_url);
        matches!(self.http.get(&url).send().await, Ok(r) if r.status().is_success())
    }

    /// Emit a gateway-synthesized event (storage activity) to subscribers
    pub fn emit_synthetic(&self, kind: EventKind, data: Value) {
        let prompt_id = data
            .get("prompt_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let event = EngineEvent::new(kind, prompt_id, data);
        self.fan_out(&event);
    }

    /// Run the WebSocket pump. Reconnects on unexpected close when
    /// `reconnect` is set; in-flight trackers observe each close as a
    /// terminal failure either way.
    pub async fn run_ws(self: Arc<Self>, ws_url: String, reconnect: bool) {
        loop {
            match connect_async(ws_url.as_str()).await {
                Ok((stream, _)) => {
                    tracing::info!("engine websocket connected");
                    let (_, mut read) = stream.split();
                    while let Some(frame) = read.next().await {
                        match frame {
                            Ok(Message::Text(text)) => self.handle_frame(&text),
                            Ok(Message::Binary(bytes)) => {
                                tracing::debug!(len = bytes.len(), "ignoring binary frame");
                            }
                            Ok(Message::Close(_)) => break,
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!("websocket read error: {e}");
                                break;
                            }
                        }
                    }
                    tracing::warn!("engine websocket closed");
                }
                Err(e) => {
                    tracing::warn!("engine websocket connect failed: {e}");
                }
            }

            self.notify_closed();

            if !reconnect {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Parse one text frame and route it
    fn handle_frame(&self, text: &str) {
        let Ok(frame) = serde_json::from_str::<Value>(text) else {
            tracing::debug!("unparseable websocket frame");
            return;
        };
        let Some(kind_raw) = frame.get("type").and_then(Value::as_str) else {
            return;
        };
        let kind = EventKind::parse(kind_raw);
        let data = frame.get("data").cloned().unwrap_or(Value::Null);
        let engine_prompt_id = data
            .get("prompt_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        if kind == EventKind::Status {
            if let Some(remaining) = data
                .pointer("/status/exec_info/queue_remaining")
                .and_then(Value::as_u64)
            {
                self.queue_remaining.store(remaining, Ordering::Relaxed);
            }
        }

        // Per-prompt channel gets the raw (engine-id) event
        if let Some(engine_id) = &engine_prompt_id {
            if let Some(channel) = self.lock_channels().get(engine_id) {
                let _ = channel.sender.send(EngineEvent::new(
                    kind.clone(),
                    Some(engine_id.clone()),
                    data.clone(),
                ));
            }
        }

        // Subscribers see caller ids only
        let caller_id = engine_prompt_id
            .as_deref()
            .and_then(|id| self.correlation.caller_for(id));
        let mut public_data = data;
        if let (Some(caller), Some(obj)) = (&caller_id, public_data.as_object_mut()) {
            obj.insert("prompt_id".to_string(), Value::String(caller.clone()));
        }
        self.fan_out(&EngineEvent::new(kind, caller_id, public_data));
    }

    /// Tell every in-flight tracker the socket is gone, then drop senders
    fn notify_closed(&self) {
        let mut channels = self.lock_channels();
        for (engine_id, channel) in channels.iter() {
            let _ = channel.sender.send(EngineEvent::new(
                EventKind::Closed,
                Some(engine_id.clone()),
                Value::Null,
            ));
        }
        channels.clear();
    }

    fn fan_out(&self, event: &EngineEvent) {
        for subscriber in self.lock_subscribers().iter() {
            if subscriber.wants(&event.kind) {
                subscriber.on_event(event);
            }
        }
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<Arc<dyn EventSubscriber>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_channels(&self) -> MutexGuard<'_, HashMap<String, PromptChannel>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[cfg(test)]
    pub(crate) fn register_channel_for_tests(
        &self,
        engine_id: &str,
    ) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock_channels().insert(
            engine_id.to_string(),
            PromptChannel {
                sender,
                receiver: None,
            },
        );
        receiver
    }

    #[cfg(test)]
    pub(crate) fn handle_frame_for_tests(&self, text: &str) {
        self.handle_frame(text);
    }
}
