// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Graph, event and stats types
//!
//! The prompt graph is heterogeneous JSON; nodes keep their inputs as raw
//! values and only the preprocessor interprets a closed set of them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A prompt: node id -> node
pub type Prompt = BTreeMap<String, Node>;

/// One node of the computation graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub class_type: String,
    #[serde(default)]
    pub inputs: serde_json::Map<String, Value>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Engine event kinds carried over the WebSocket, plus synthetic storage
/// events the gateway emits itself
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Status,
    Progress,
    ProgressState,
    Executing,
    Executed,
    ExecutionStart,
    ExecutionCached,
    ExecutionSuccess,
    ExecutionInterrupted,
    ExecutionError,
    /// Synthetic: a file was downloaded through the cache
    FileDownloaded,
    /// Synthetic: an output file was uploaded
    FileUploaded,
    /// Synthetic: an engine output file was deleted after read
    FileDeleted,
    /// The WebSocket closed; delivered to in-flight trackers
    Closed,
    /// Anything the gateway does not interpret
    Other(String),
}

impl EventKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "status" => Self::Status,
            "progress" => Self::Progress,
            "progress_state" => Self::ProgressState,
            "executing" => Self::Executing,
            "executed" => Self::Executed,
            "execution_start" => Self::ExecutionStart,
            "execution_cached" => Self::ExecutionCached,
            "execution_success" => Self::ExecutionSuccess,
            "execution_interrupted" => Self::ExecutionInterrupted,
            "execution_error" => Self::ExecutionError,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Status => "status",
            Self::Progress => "progress",
            Self::ProgressState => "progress_state",
            Self::Executing => "executing",
            Self::Executed => "executed",
            Self::ExecutionStart => "execution_start",
            Self::ExecutionCached => "execution_cached",
            Self::ExecutionSuccess => "execution_success",
            Self::ExecutionInterrupted => "execution_interrupted",
            Self::ExecutionError => "execution_error",
            Self::FileDownloaded => "file_downloaded",
            Self::FileUploaded => "file_uploaded",
            Self::FileDeleted => "file_deleted",
            Self::Closed => "closed",
            Self::Other(name) => name,
        }
    }

    /// True for events that end a prompt's execution
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ExecutionSuccess | Self::ExecutionInterrupted | Self::ExecutionError | Self::Closed
        )
    }
}

/// One demultiplexed engine event
#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub kind: EventKind,
    /// Prompt id as present on the wire (engine id before rewrite, caller
    /// id after)
    pub prompt_id: Option<String>,
    pub data: Value,
}

impl EngineEvent {
    pub fn new(kind: EventKind, prompt_id: Option<String>, data: Value) -> Self {
        Self {
            kind,
            prompt_id,
            data,
        }
    }
}

/// A file referenced by engine history
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutputFileRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Scan a history `outputs` value for file references. Nodes emit
/// different keys (`images`, `gifs`, `audio`, ...) so any array of objects
/// carrying a string `filename` counts.
pub fn collect_file_refs(outputs: &Value) -> Vec<OutputFileRef> {
    let mut refs = Vec::new();
    let Some(nodes) = outputs.as_object() else {
        return refs;
    };

    for node_outputs in nodes.values() {
        let Some(slots) = node_outputs.as_object() else {
            continue;
        };
        for slot in slots.values() {
            let Some(items) = slot.as_array() else {
                continue;
            };
            for item in items {
                if item.get("filename").map(Value::is_string) == Some(true) {
                    if let Ok(file_ref) = serde_json::from_value::<OutputFileRef>(item.clone()) {
                        refs.push(file_ref);
                    }
                }
            }
        }
    }

    refs
}

/// Per-node execution window (epoch milliseconds)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeTiming {
    pub start: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
}

/// Timing attached to every prompt response and completion webhook
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Execution start, epoch milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    /// Execution end, epoch milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    /// Engine-side wall-clock duration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Per-node execution windows
    #[serde(default)]
    pub per_node: BTreeMap<String, NodeTiming>,
    pub preprocess_ms: u64,
    pub engine_ms: u64,
    pub postprocess_ms: u64,
    pub upload_ms: u64,
    pub total_ms: u64,
}

impl ExecutionStats {
    /// Derived total; components are stamped at stage boundaries and the
    /// total covers them plus routing overhead
    pub fn finalize_total(&mut self, total_ms: u64) {
        self.total_ms =
            total_ms.max(self.preprocess_ms + self.engine_ms + self.postprocess_ms + self.upload_ms);
    }
}
