// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! Comfygate Kernel - shared core for the gateway service crates.
//!
//! This crate provides the foundational infrastructure:
//! - Configuration loaded from the environment
//! - Typed gateway errors with HTTP status mapping
//! - HTTP client construction with retry/backoff
//! - Logging initialization and secret redaction
//!
//! The kernel is deliberately small; every service crate depends on it and
//! nothing here depends on a service crate.

pub mod config;
pub mod error;
pub mod http;
pub mod logging;

// Re-exports for convenience
pub use config::Config;
pub use error::{GatewayError, Result};
pub use http::{HttpClientConfig, RetryConfig};
