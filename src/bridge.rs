// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! System event bridge
//!
//! Subscribes to the engine client for a configured subset of event kinds
//! and fans each out to the signed system webhook and/or a message-bus
//! publisher. Execution events are namespaced `comfy.*`, storage events
//! `storage.*`. The bridge implements the client's subscriber interface;
//! the client never learns about the bridge's outputs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Value};

use comfygate_engine::{EngineEvent, EventKind, EventSubscriber};
use comfygate_webhooks::WebhookSender;

/// Message-bus seam; implementations must not block
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &Value);
}

/// Publisher that just logs; stands in when no bus is wired up
pub struct LogPublisher;

impl Publisher for LogPublisher {
    fn publish(&self, topic: &str, payload: &Value) {
        tracing::info!(topic, "event published: {payload}");
    }
}

/// Namespaced public name for an event kind
pub fn public_event_name(kind: &EventKind) -> String {
    match kind {
        EventKind::FileDownloaded | EventKind::FileUploaded | EventKind::FileDeleted => {
            format!("storage.{}", kind.as_str())
        }
        other => format!("comfy.{}", other.as_str()),
    }
}

/// Bridge from engine events to webhooks and the publisher
pub struct SystemEventBridge {
    sender: WebhookSender,
    webhook_url: Option<String>,
    webhook_secret: Option<String>,
    /// Public names of forwarded events; empty set forwards nothing
    events: HashSet<String>,
    metadata: HashMap<String, String>,
    publisher: Option<Arc<dyn Publisher>>,
}

impl SystemEventBridge {
    pub fn new(
        sender: WebhookSender,
        webhook_url: Option<String>,
        webhook_secret: Option<String>,
        events: Vec<String>,
        metadata: HashMap<String, String>,
        publisher: Option<Arc<dyn Publisher>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sender,
            webhook_url,
            webhook_secret,
            events: events.into_iter().collect(),
            metadata,
            publisher,
        })
    }

    fn payload_for(&self, name: &str, event: &EngineEvent) -> Value {
        let mut payload = json!({
            "event": name,
            "timestamp": chrono::Utc::now().timestamp_millis(),
            "data": event.data,
        });
        if let Some(prompt_id) = &event.prompt_id {
            payload["prompt_id"] = Value::String(prompt_id.clone());
        }
        if !self.metadata.is_empty() {
            payload["metadata"] = json!(self.metadata);
        }
        payload
    }
}

impl EventSubscriber for SystemEventBridge {
    fn wants(&self, kind: &EventKind) -> bool {
        self.events.contains(&public_event_name(kind))
    }

    /// Runs on the WebSocket reader task; all I/O is spawned
    fn on_event(&self, event: &EngineEvent) {
        let name = public_event_name(&event.kind);
        let payload = self.payload_for(&name, event);

        if let Some(publisher) = &self.publisher {
            let topic = event.prompt_id.clone().unwrap_or_else(|| "system".to_string());
            publisher.publish(&topic, &payload);
        }

        if let Some(url) = &self.webhook_url {
            let sender = self.sender.clone();
            let url = url.clone();
            let secret = self.webhook_secret.clone();
            tokio::spawn(async move {
                if let Err(e) = sender.send_v2(&url, secret.as_deref(), &name, payload).await {
                    tracing::error!(url = %url, event = %name, "system webhook failed: {e}");
                }
            });
        }
    }
}
