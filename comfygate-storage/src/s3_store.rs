// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! S3-compatible provider
//!
//! Handles `s3://bucket/key` URLs with streaming bodies in both directions.
//! Credentials come from the standard AWS environment/profile chain; a
//! configured endpoint override (with path-style addressing) supports
//! MinIO-style deployments.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use comfygate_kernel::error::{GatewayError, Result};

use crate::provider::{AuthSpec, StorageProvider, UploadSource};

/// Validity window for pre-signed download URLs
const PRESIGN_EXPIRY: Duration = Duration::from_secs(60 * 60);

/// S3-compatible blob provider
pub struct S3Provider {
    endpoint: Option<String>,
    client: OnceCell<aws_sdk_s3::Client>,
}

impl S3Provider {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> &aws_sdk_s3::Client {
        self.client
            .get_or_init(|| async {
                let shared = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                let mut builder = aws_sdk_s3::config::Builder::from(&shared);
                if let Some(endpoint) = &self.endpoint {
                    builder = builder.endpoint_url(endpoint).force_path_style(true);
                }
                aws_sdk_s3::Client::from_conf(builder.build())
            })
            .await
    }
}

/// `s3://bucket/key/with/slashes` -> (bucket, key)
fn parse_s3_url(url: &str) -> Result<(String, String)> {
    let rest = url
        .strip_prefix("s3://")
        .ok_or_else(|| GatewayError::validation(format!("not an s3 url: {url}")))?;
    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
            Ok((bucket.to_string(), key.to_string()))
        }
        _ => Err(GatewayError::validation(format!(
            "s3 url must be s3://bucket/key: {url}"
        ))),
    }
}

/// Flatten an SDK error chain into one line, classifying auth failures
fn map_sdk_error(context: &str, err: impl std::error::Error) -> GatewayError {
    let mut message = format!("{context}: {err}");
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(&format!(": {cause}"));
        source = cause.source();
    }

    if message.contains("AccessDenied")
        || message.contains("InvalidAccessKeyId")
        || message.contains("SignatureDoesNotMatch")
        || message.contains("403")
    {
        GatewayError::Auth { message }
    } else {
        GatewayError::Api {
            message,
            status: None,
        }
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn test_url(&self, url: &str) -> bool {
        url.starts_with("s3://")
    }

    fn request_body_upload_key(&self) -> Option<&'static str> {
        Some("s3")
    }

    async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        filename_override: Option<&str>,
        _auth: Option<&AuthSpec>,
    ) -> Result<PathBuf> {
        let (bucket, key) = parse_s3_url(url)?;

        let response = self
            .client()
            .await
            .get_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| map_sdk_error("s3 get_object failed", e))?;

        let key_basename = key.rsplit('/').next().unwrap_or(&key).to_string();
        let name = match filename_override {
            Some(n) if n.contains('.') => n.to_string(),
            Some(n) => match Path::new(&key_basename).extension() {
                Some(ext) => format!("{n}.{}", ext.to_string_lossy()),
                None => n.to_string(),
            },
            None => key_basename,
        };

        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(&name);
        let mut file = tokio::fs::File::create(&dest).await?;

        let mut body = response.body;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| map_sdk_error("s3 body stream failed", e))?
        {
            file.write_all(&chunk).await?;
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
        let (bucket, key) = parse_s3_url(url)?;

        let body = match source {
            UploadSource::Bytes(bytes) => ByteStream::from(bytes),
            UploadSource::Path(path) => ByteStream::from_path(&path)
                .await
                .map_err(|e| map_sdk_error("s3 body from path failed", e))?,
        };

        let request = self
            .client()
            .await
            .put_object()
            .bucket(&bucket)
            .key(&key)
            .content_type(content_type)
            .body(body);

        tokio::select! {
            _ = cancel.cancelled() => Err(GatewayError::Aborted),
            result = request.send() => {
                result.map_err(|e| map_sdk_error("s3 put_object failed", e))?;
                Ok(())
            }
        }
    }

    async fn check(&self, url: &str, _auth: Option<&AuthSpec>) -> Result<()> {
        let (bucket, key) = parse_s3_url(url)?;
        self.client()
            .await
            .head_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| map_sdk_error("s3 head_object failed", e))?;
        Ok(())
    }

    fn create_url(&self, fields: &Value, filename: &str) -> Result<String> {
        let bucket = fields
            .get("bucket")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::validation("s3 upload requires bucket"))?;
        let prefix = fields
            .get("prefix")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim_matches('/');

        if prefix.is_empty() {
            Ok(format!("s3://{bucket}/{filename}"))
        } else {
            Ok(format!("s3://{bucket}/{prefix}/{filename}"))
        }
    }

    async fn signed_url(&self, url: &str) -> Result<String> {
        let (bucket, key) = parse_s3_url(url)?;
        let presign = PresigningConfig::expires_in(PRESIGN_EXPIRY)
            .map_err(|e| GatewayError::internal(format!("presign config: {e}")))?;

        let presigned = self
            .client()
            .await
            .get_object()
            .bucket(&bucket)
            .key(&key)
            .presigned(presign)
            .await
            .map_err(|e| map_sdk_error("s3 presign failed", e))?;

        Ok(presigned.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3_url() {
        let (bucket, key) = parse_s3_url("s3://my-bucket/some/deep/key.png").expect("parse");
        assert_eq!(bucket, "my-bucket");
        assert_eq!(key, "some/deep/key.png");
    }

    #[test]
    fn test_parse_s3_url_rejects_bad_forms() {
        assert!(parse_s3_url("https://host/key").is_err());
        assert!(parse_s3_url("s3://bucket-only").is_err());
        assert!(parse_s3_url("s3:///key").is_err());
    }

    #[test]
    fn test_test_url() {
        let provider = S3Provider::new(None);
        assert!(provider.test_url("s3://bucket/key"));
        assert!(!provider.test_url("https://bucket/key"));
    }

    #[test]
    fn test_create_url_with_and_without_prefix() {
        let provider = S3Provider::new(None);
        let fields = serde_json::json!({ "bucket": "outs", "prefix": "run-7/" });
        assert_eq!(
            provider.create_url(&fields, "a.png").ok().as_deref(),
            Some("s3://outs/run-7/a.png")
        );

        let fields = serde_json::json!({ "bucket": "outs" });
        assert_eq!(
            provider.create_url(&fields, "a.png").ok().as_deref(),
            Some("s3://outs/a.png")
        );
    }

    #[test]
    fn test_map_sdk_error_classifies_auth() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "AccessDenied: nope");
        assert!(map_sdk_error("ctx", io).is_auth());

        let io = std::io::Error::new(std::io::ErrorKind::Other, "NoSuchBucket");
        assert!(!map_sdk_error("ctx", io).is_auth());
    }
}
