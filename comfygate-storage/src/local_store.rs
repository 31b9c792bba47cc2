// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Local filesystem provider
//!
//! Handles `file://` URLs; "downloading" is a copy into the destination
//! directory, uploads write the file at the URL's path.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use comfygate_kernel::error::{GatewayError, Result};

use crate::provider::{AuthSpec, StorageProvider, UploadSource};

/// `file://` provider
pub struct LocalProvider;

fn parse_file_url(url: &str) -> Result<PathBuf> {
    let parsed = Url::parse(url)
        .map_err(|e| GatewayError::validation(format!("invalid file url {url}: {e}")))?;
    parsed
        .to_file_path()
        .map_err(|_| GatewayError::validation(format!("file url has no local path: {url}")))
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    fn test_url(&self, url: &str) -> bool {
        url.starts_with("file://")
    }

    async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        filename_override: Option<&str>,
        _auth: Option<&AuthSpec>,
    ) -> Result<PathBuf> {
        let source = parse_file_url(url)?;
        if !source.is_file() {
            return Err(GatewayError::NotFound {
                message: format!("{} does not exist", source.display()),
            });
        }

        let source_name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let name = match filename_override {
            Some(n) if n.contains('.') => n.to_string(),
            Some(n) => match source.extension() {
                Some(ext) => format!("{n}.{}", ext.to_string_lossy()),
                None => n.to_string(),
            },
            None => source_name,
        };

        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(&name);
        tokio::fs::copy(&source, &dest).await?;
        Ok(dest)
    }

    async fn upload(
        &self,
        url: &str,
        source: UploadSource,
        _content_type: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(GatewayError::Aborted);
        }
        let dest = parse_file_url(url)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = source.into_bytes().await?;
        tokio::fs::write(&dest, &bytes).await?;
        Ok(())
    }

    async fn check(&self, url: &str, _auth: Option<&AuthSpec>) -> Result<()> {
        let path = parse_file_url(url)?;
        if path.is_file() {
            Ok(())
        } else {
            Err(GatewayError::NotFound {
                message: format!("{} does not exist", path.display()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_download_copies_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("model.bin");
        tokio::fs::write(&source, b"weights").await.expect("write");

        let provider = LocalProvider;
        let url = format!("file://{}", source.display());
        let dest_dir = dir.path().join("out");
        let dest = provider
            .download(&url, &dest_dir, None, None)
            .await
            .expect("download");

        assert_eq!(dest, dest_dir.join("model.bin"));
        assert_eq!(std::fs::read(&dest).expect("read"), b"weights");
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let provider = LocalProvider;
        let err = provider
            .download("file:///nope/missing.bin", Path::new("/tmp"), None, None)
            .await
            .err();
        assert_eq!(err.map(|e| e.http_status()), Some(404));
    }

    #[tokio::test]
    async fn test_upload_writes_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("out/result.png");
        let url = format!("file://{}", dest.display());

        let provider = LocalProvider;
        provider
            .upload(
                &url,
                UploadSource::Bytes(vec![1, 2, 3]),
                "image/png",
                CancellationToken::new(),
            )
            .await
            .expect("upload");

        assert_eq!(std::fs::read(&dest).expect("read"), vec![1, 2, 3]);
    }

    #[test]
    fn test_test_url() {
        let provider = LocalProvider;
        assert!(provider.test_url("file:///a/b.png"));
        assert!(!provider.test_url("https://host/a.png"));
    }
}
