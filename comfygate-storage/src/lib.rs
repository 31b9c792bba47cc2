// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Blob store registry, upload lifecycle and download cache
//!
//! Providers adapt HTTP(S), S3-compatible, Azure Blob, HuggingFace and
//! local storage behind one interface. The registry dispatches by URL
//! (first provider whose `test_url` accepts wins); the cache dedupes
//! downloads by URL and fans files out to destination directories via
//! hard links.

// API response structs may contain fields we don't use - this is expected for external API contracts
#![allow(dead_code)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod cache;
pub mod provider;
pub mod upload;

mod azure_store;
mod hf_store;
mod http_store;
mod local_store;
mod s3_store;

pub use azure_store::{AzureProvider, AzureSettings};
pub use cache::DownloadCache;
pub use hf_store::HuggingFaceProvider;
pub use http_store::HttpProvider;
pub use local_store::LocalProvider;
pub use provider::{AuthSpec, StorageProvider, StorageRegistry, UploadSource};
pub use s3_store::S3Provider;
pub use upload::{Upload, UploadManager, UploadState};
