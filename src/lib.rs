// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! Comfygate - HTTP gateway for a ComfyUI-style inference engine
//!
//! The gateway accepts declarative prompt graphs, rewrites remote inputs to
//! local files through a deduplicating cache, dispatches to the engine,
//! tracks execution over a shared WebSocket, post-processes the output
//! files and delivers them inline, by upload, or by signed webhook.

pub mod bridge;
pub mod catalog;
pub mod orchestrator;
pub mod preprocess;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod workflow;

pub use catalog::ModelCatalog;
pub use orchestrator::{Orchestrator, PromptRequest, PromptResponse};
pub use preprocess::Preprocessor;
pub use state::AppState;
