// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! Engine client
//!
//! Owns the single WebSocket to the engine, demultiplexes its event stream
//! by prompt id, correlates engine-assigned ids with caller-assigned ids,
//! and tracks one prompt to completion by racing the WebSocket terminal
//! signal against history polling.

// API response structs may contain fields we don't use - this is expected for external API contracts
#![allow(dead_code)]

pub mod client;
pub mod correlation;
pub mod tracker;
pub mod types;

pub use client::{EngineClient, EventSubscriber};
pub use correlation::CorrelationMap;
pub use tracker::{CompletionCoordinator, PromptOutcome};
pub use types::{EngineEvent, EventKind, ExecutionStats, Node, NodeTiming, OutputFileRef, Prompt};
