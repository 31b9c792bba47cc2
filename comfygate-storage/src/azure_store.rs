// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Azure Blob provider
//!
//! Credential resolution order: connection string, shared key, SAS token,
//! default identity. Accepts both host-style
//! (`https://<acct>.blob.core.windows.net/container/blob`) and path-style
//! (emulator) URLs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use azure_storage::prelude::*;
use azure_storage_blobs::prelude::*;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use comfygate_kernel::error::{GatewayError, Result};

use crate::provider::{AuthSpec, StorageProvider, UploadSource};

const BLOB_HOST_SUFFIX: &str = ".blob.core.windows.net";

/// Azure Blob provider configuration
#[derive(Debug, Clone, Default)]
pub struct AzureSettings {
    pub connection_string: Option<String>,
    pub account: Option<String>,
    pub access_key: Option<String>,
    pub sas_token: Option<String>,
}

/// Azure Blob storage provider
pub struct AzureProvider {
    account: Option<String>,
    credentials: Option<StorageCredentials>,
    /// Shared key retained for SAS generation
    access_key: Option<String>,
}

impl AzureProvider {
    /// Resolve credentials: connection string, shared key, SAS token,
    /// default identity - first available wins
    pub fn new(settings: AzureSettings) -> Self {
        if let Some(raw) = &settings.connection_string {
            if let Ok(conn) = azure_storage::ConnectionString::new(raw) {
                let account = conn.account_name.map(str::to_string);
                let access_key = conn.account_key.map(str::to_string);
                let credentials = conn.storage_credentials().ok();
                return Self {
                    account,
                    credentials,
                    access_key,
                };
            }
            tracing::warn!("azure connection string could not be parsed; falling back");
        }

        if let (Some(account), Some(key)) = (&settings.account, &settings.access_key) {
            return Self {
                account: Some(account.clone()),
                credentials: Some(StorageCredentials::access_key(account.clone(), key.clone())),
                access_key: Some(key.clone()),
            };
        }

        if let (Some(account), Some(sas)) = (&settings.account, &settings.sas_token) {
            return Self {
                account: Some(account.clone()),
                credentials: StorageCredentials::sas_token(sas.clone()).ok(),
                access_key: None,
            };
        }

        let credentials = settings.account.as_ref().and_then(|_| {
            azure_identity::create_default_credential()
                .ok()
                .map(StorageCredentials::token_credential)
        });

        Self {
            account: settings.account,
            credentials,
            access_key: None,
        }
    }

    fn blob_client(&self, url: &str) -> Result<BlobClient> {
        let (account, container, blob) = self.parse_blob_url(url)?;
        let credentials = self
            .credentials
            .clone()
            .ok_or_else(|| GatewayError::Auth {
                message: "no azure credentials configured".to_string(),
            })?;
        Ok(ClientBuilder::new(account, credentials).blob_client(container, blob))
    }

    /// Host-style: `{account}.blob.core.windows.net/{container}/{blob...}`;
    /// path-style (emulator): `{host}/{account}/{container}/{blob...}`
    fn parse_blob_url(&self, url: &str) -> Result<(String, String, String)> {
        let parsed = Url::parse(url)
            .map_err(|e| GatewayError::validation(format!("invalid azure url {url}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| GatewayError::validation(format!("azure url has no host: {url}")))?;
        let segments: Vec<String> = parsed
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();

        if let Some(account) = host.strip_suffix(BLOB_HOST_SUFFIX) {
            if segments.len() < 2 {
                return Err(GatewayError::validation(format!(
                    "azure url must name container and blob: {url}"
                )));
            }
            return Ok((
                account.to_string(),
                segments[0].clone(),
                segments[1..].join("/"),
            ));
        }

        // Path-style: first segment is the account
        if segments.len() < 3 {
            return Err(GatewayError::validation(format!(
                "path-style azure url must be /account/container/blob: {url}"
            )));
        }
        Ok((
            segments[0].clone(),
            segments[1].clone(),
            segments[2..].join("/"),
        ))
    }
}

fn map_azure_error(context: &str, err: azure_core::Error) -> GatewayError {
    use azure_core::StatusCode;

    let message = format!("{context}: {err}");
    match err.as_http_error().map(|http| http.status()) {
        Some(StatusCode::Unauthorized | StatusCode::Forbidden) => GatewayError::Auth { message },
        Some(StatusCode::NotFound) => GatewayError::NotFound { message },
        Some(_) => GatewayError::Api {
            message,
            status: None,
        },
        None => GatewayError::Network {
            message,
            source: None,
        },
    }
}

#[async_trait]
impl StorageProvider for AzureProvider {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn test_url(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        if host.ends_with(BLOB_HOST_SUFFIX) {
            return true;
        }
        // Path-style emulator URLs: /account/container/blob with the
        // configured account as the first segment
        if let Some(account) = &self.account {
            if let Some(mut segments) = parsed.path_segments() {
                return segments.next() == Some(account.as_str());
            }
        }
        false
    }

    fn request_body_upload_key(&self) -> Option<&'static str> {
        Some("azure_blob_upload")
    }

    async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        filename_override: Option<&str>,
        _auth: Option<&AuthSpec>,
    ) -> Result<PathBuf> {
        let (_, _, blob_path) = self.parse_blob_url(url)?;
        let client = self.blob_client(url)?;

        let blob_basename = blob_path
            .rsplit('/')
            .next()
            .unwrap_or(&blob_path)
            .to_string();
        let name = match filename_override {
            Some(n) if n.contains('.') => n.to_string(),
            Some(n) => match Path::new(&blob_basename).extension() {
                Some(ext) => format!("{n}.{}", ext.to_string_lossy()),
                None => n.to_string(),
            },
            None => blob_basename,
        };

        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(&name);
        let mut file = tokio::fs::File::create(&dest).await?;

        let mut stream = client.get().into_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_azure_error("azure get failed", e))?;
            let data = chunk
                .data
                .collect()
                .await
                .map_err(|e| map_azure_error("azure body stream failed", e))?;
            file.write_all(&data).await?;
        }
        file.flush().await?;

        Ok(dest)
    }

    async fn upload(
        &self,
        url: &str,
        source: UploadSource,
        content_type: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        let client = self.blob_client(url)?;
        let bytes = source.into_bytes().await?;

        let request = client
            .put_block_blob(bytes)
            .content_type(content_type.to_string());

        tokio::select! {
            _ = cancel.cancelled() => Err(GatewayError::Aborted),
            result = async move { request.await } => {
                result.map_err(|e| map_azure_error("azure put_block_blob failed", e))?;
                Ok(())
            }
        }
    }

    async fn check(&self, url: &str, _auth: Option<&AuthSpec>) -> Result<()> {
        let client = self.blob_client(url)?;
        client
            .get_properties()
            .await
            .map_err(|e| map_azure_error("azure get_properties failed", e))?;
        Ok(())
    }

    fn create_url(&self, fields: &Value, filename: &str) -> Result<String> {
        let container = fields
            .get("container")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::validation("azure_blob_upload requires container"))?;
        let prefix = fields
            .get("blob_prefix")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim_matches('/');
        let account = self
            .account
            .as_deref()
            .ok_or_else(|| GatewayError::validation("azure account not configured"))?;

        let blob = if prefix.is_empty() {
            filename.to_string()
        } else {
            format!("{prefix}/{filename}")
        };
        Ok(format!(
            "https://{account}{BLOB_HOST_SUFFIX}/{container}/{blob}"
        ))
    }

    async fn signed_url(&self, url: &str) -> Result<String> {
        // SAS generation needs the shared key; identity otherwise
        if self.access_key.is_none() {
            return Ok(url.to_string());
        }

        let client = self.blob_client(url)?;
        let expiry = time::OffsetDateTime::now_utc() + time::Duration::hours(1);
        let permissions = BlobSasPermissions {
            read: true,
            ..Default::default()
        };

        let sas = client
            .shared_access_signature(permissions, expiry)
            .await
            .map_err(|e| map_azure_error("azure sas generation failed", e))?;
        let signed = client
            .generate_signed_blob_url(&sas)
            .map_err(|e| map_azure_error("azure signed url failed", e))?;

        Ok(signed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_with_key() -> AzureProvider {
        AzureProvider::new(AzureSettings {
            connection_string: None,
            account: Some("acct".to_string()),
            access_key: Some(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                b"0123456789abcdef",
            )),
            sas_token: None,
        })
    }

    #[test]
    fn test_parse_host_style_url() {
        let provider = provider_with_key();
        let (account, container, blob) = provider
            .parse_blob_url("https://acct.blob.core.windows.net/outs/run/a.png")
            .expect("parse");
        assert_eq!(account, "acct");
        assert_eq!(container, "outs");
        assert_eq!(blob, "run/a.png");
    }

    #[test]
    fn test_parse_path_style_url() {
        let provider = provider_with_key();
        let (account, container, blob) = provider
            .parse_blob_url("http://127.0.0.1:10000/acct/outs/a.png")
            .expect("parse");
        assert_eq!(account, "acct");
        assert_eq!(container, "outs");
        assert_eq!(blob, "a.png");
    }

    #[test]
    fn test_test_url() {
        let provider = provider_with_key();
        assert!(provider.test_url("https://acct.blob.core.windows.net/c/b.png"));
        assert!(provider.test_url("http://localhost:10000/acct/c/b.png"));
        assert!(!provider.test_url("http://localhost:10000/other/c/b.png"));
        assert!(!provider.test_url("s3://bucket/key"));
    }

    #[test]
    fn test_create_url() {
        let provider = provider_with_key();
        let fields = serde_json::json!({ "container": "outs", "blob_prefix": "run-1" });
        assert_eq!(
            provider.create_url(&fields, "a.png").ok().as_deref(),
            Some("https://acct.blob.core.windows.net/outs/run-1/a.png")
        );
    }

    #[test]
    fn test_rejects_short_urls() {
        let provider = provider_with_key();
        assert!(provider
            .parse_blob_url("https://acct.blob.core.windows.net/only-container")
            .is_err());
    }
}
