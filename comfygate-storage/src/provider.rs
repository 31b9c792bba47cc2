// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Provider trait and the ordered registry
//!
//! A provider claims URLs via `test_url`; the registry walks its list in
//! order and the first claimant wins. Output delivery is keyed by the
//! request-body field (`s3`, `azure_blob_upload`, `http_upload`,
//! `hf_upload`) each provider announces.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use comfygate_kernel::error::{GatewayError, Result};

/// Per-request download authentication
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSpec {
    /// Bearer token
    pub bearer_token: Option<String>,
    /// Basic auth username
    pub username: Option<String>,
    /// Basic auth password
    pub password: Option<String>,
    /// Arbitrary headers sent verbatim
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Query-string token parameter name
    pub query_param: Option<String>,
    /// Query-string token value
    pub query_value: Option<String>,
}

impl AuthSpec {
    /// True when no credential of any kind is present
    pub fn is_empty(&self) -> bool {
        self.bearer_token.is_none()
            && self.username.is_none()
            && self.password.is_none()
            && self.headers.is_empty()
            && self.query_param.is_none()
    }
}

/// Bytes to upload: an on-disk file or an in-memory buffer
#[derive(Debug, Clone)]
pub enum UploadSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl UploadSource {
    /// Read the source fully into memory
    pub async fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Self::Bytes(b) => Ok(b),
            Self::Path(p) => Ok(tokio::fs::read(&p).await?),
        }
    }
}

/// A pluggable blob store backend
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Short provider name for logs
    fn name(&self) -> &'static str;

    /// Whether this provider handles the given URL
    fn test_url(&self, url: &str) -> bool;

    /// Request-body field that selects this provider for output delivery
    fn request_body_upload_key(&self) -> Option<&'static str> {
        None
    }

    /// Download `url` into `dest_dir`. When `filename_override` is given it
    /// is used as the file name (providers append an inferred extension if
    /// the override has none); otherwise the provider derives a name.
    /// Returns the path written.
    async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        filename_override: Option<&str>,
        auth: Option<&AuthSpec>,
    ) -> Result<PathBuf>;

    /// Upload `source` to `url`. Must observe `cancel` and return
    /// `GatewayError::Aborted` promptly when it fires.
    async fn upload(
        &self,
        url: &str,
        source: UploadSource,
        content_type: &str,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Cheap existence/validation check for a URL
    async fn check(&self, _url: &str, _auth: Option<&AuthSpec>) -> Result<()> {
        Ok(())
    }

    /// Compute the destination URL for an output file from the request's
    /// upload fields
    fn create_url(&self, _fields: &Value, _filename: &str) -> Result<String> {
        Err(GatewayError::validation(format!(
            "{} does not support output uploads",
            self.name()
        )))
    }

    /// Pre-signed variant of `url`; identity when unsupported
    async fn signed_url(&self, url: &str) -> Result<String> {
        Ok(url.to_string())
    }
}

/// Ordered provider list; first `test_url` match wins
pub struct StorageRegistry {
    providers: Vec<Arc<dyn StorageProvider>>,
}

impl StorageRegistry {
    pub fn new(providers: Vec<Arc<dyn StorageProvider>>) -> Self {
        Self { providers }
    }

    /// Resolve the provider for a URL
    pub fn provider_for(&self, url: &str) -> Result<Arc<dyn StorageProvider>> {
        self.providers
            .iter()
            .find(|p| p.test_url(url))
            .cloned()
            .ok_or_else(|| GatewayError::validation(format!("no storage provider handles {url}")))
    }

    /// Resolve the provider selected by a request-body upload field
    pub fn by_upload_key(&self, key: &str) -> Option<Arc<dyn StorageProvider>> {
        self.providers
            .iter()
            .find(|p| p.request_body_upload_key() == Some(key))
            .cloned()
    }

    /// Pre-sign a URL through whichever provider claims it; identity when
    /// none does or the provider has no signing support
    pub async fn signed_url(&self, url: &str) -> Result<String> {
        match self.providers.iter().find(|p| p.test_url(url)) {
            Some(p) => p.signed_url(url).await,
            None => Ok(url.to_string()),
        }
    }

    pub fn providers(&self) -> &[Arc<dyn StorageProvider>] {
        &self.providers
    }
}
