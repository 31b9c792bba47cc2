// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! HuggingFace provider
//!
//! Active only when the platform CLI is present on PATH. Downloads shell
//! out to the CLI (which brings its own caching and auth) and the
//! resulting file is moved into place.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use url::Url;

use comfygate_kernel::error::{GatewayError, Result};

use crate::provider::{AuthSpec, StorageProvider, UploadSource};

/// Parsed canonical HuggingFace URL
#[derive(Debug, Clone, PartialEq, Eq)]
struct HfRef {
    repo: String,
    repo_type: String,
    revision: String,
    path: String,
}

/// HuggingFace Hub provider (CLI-backed)
pub struct HuggingFaceProvider {
    cli: String,
}

impl HuggingFaceProvider {
    /// Returns `None` when the CLI binary cannot be found on PATH
    pub fn new(cli: &str) -> Option<Self> {
        if !cli_on_path(cli) {
            return None;
        }
        Some(Self {
            cli: cli.to_string(),
        })
    }

    async fn run_cli(&self, args: &[&str], cancel: Option<&CancellationToken>) -> Result<()> {
        tracing::debug!(cli = %self.cli, ?args, "running huggingface cli");
        let mut child = Command::new(&self.cli)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::internal(format!("failed to spawn {}: {e}", self.cli)))?;

        let stderr = child.stderr.take();

        let status = match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => {
                    let _ = child.kill().await;
                    return Err(GatewayError::Aborted);
                }
                status = child.wait() => status?,
            },
            None => child.wait().await?,
        };

        if !status.success() {
            let mut detail = String::new();
            if let Some(mut stderr) = stderr {
                use tokio::io::AsyncReadExt;
                let _ = stderr.read_to_string(&mut detail).await;
            }
            let detail = detail.trim();
            if detail.contains("401") || detail.contains("403") || detail.contains("Unauthorized") {
                return Err(GatewayError::Auth {
                    message: format!("huggingface cli denied: {detail}"),
                });
            }
            return Err(GatewayError::Api {
                message: format!("huggingface cli exited with {status}: {detail}"),
                status: None,
            });
        }

        Ok(())
    }
}

/// `https://huggingface.co/[datasets/]{owner}/{name}/resolve/{rev}/{path}`
fn parse_hf_url(url: &str) -> Option<HfRef> {
    let parsed = Url::parse(url).ok()?;
    if parsed.host_str() != Some("huggingface.co") {
        return None;
    }
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();

    let (repo_type, rest) = match segments.first() {
        Some(&"datasets") => ("dataset", &segments[1..]),
        _ => ("model", &segments[..]),
    };

    // owner/name/resolve/revision/path...
    if rest.len() < 5 || rest[2] != "resolve" {
        return None;
    }

    Some(HfRef {
        repo: format!("{}/{}", rest[0], rest[1]),
        repo_type: repo_type.to_string(),
        revision: rest[3].to_string(),
        path: rest[4..].join("/"),
    })
}

fn cli_on_path(cli: &str) -> bool {
    if cli.contains('/') {
        return Path::new(cli).exists();
    }
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| {
                let candidate = dir.join(cli);
                candidate.is_file()
            })
        })
        .unwrap_or(false)
}

#[async_trait]
impl StorageProvider for HuggingFaceProvider {
    fn name(&self) -> &'static str {
        "huggingface"
    }

    fn test_url(&self, url: &str) -> bool {
        parse_hf_url(url).is_some()
    }

    fn request_body_upload_key(&self) -> Option<&'static str> {
        Some("hf_upload")
    }

    async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        filename_override: Option<&str>,
        _auth: Option<&AuthSpec>,
    ) -> Result<PathBuf> {
        let hf = parse_hf_url(url)
            .ok_or_else(|| GatewayError::validation(format!("not a huggingface url: {url}")))?;

        let staging = tempfile_dir(dest_dir)?;
        self.run_cli(
            &[
                "download",
                &hf.repo,
                &hf.path,
                "--repo-type",
                &hf.repo_type,
                "--revision",
                &hf.revision,
                "--local-dir",
                &staging.to_string_lossy(),
            ],
            None,
        )
        .await?;

        let downloaded = staging.join(&hf.path);
        if !downloaded.exists() {
            return Err(GatewayError::Api {
                message: format!("huggingface cli did not produce {}", downloaded.display()),
                status: None,
            });
        }

        let path_basename = hf.path.rsplit('/').next().unwrap_or(&hf.path).to_string();
        let name = match filename_override {
            Some(n) if n.contains('.') => n.to_string(),
            Some(n) => match Path::new(&path_basename).extension() {
                Some(ext) => format!("{n}.{}", ext.to_string_lossy()),
                None => n.to_string(),
            },
            None => path_basename,
        };

        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(&name);
        move_file(&downloaded, &dest).await?;
        let _ = tokio::fs::remove_dir_all(&staging).await;

        Ok(dest)
    }

    async fn upload(
        &self,
        url: &str,
        source: UploadSource,
        _content_type: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        let hf = parse_hf_url(url)
            .ok_or_else(|| GatewayError::validation(format!("not a huggingface url: {url}")))?;

        // The CLI uploads from disk; buffer in-memory sources first
        let (local, _guard) = match source {
            UploadSource::Path(p) => (p, None),
            UploadSource::Bytes(bytes) => {
                let dir = std::env::temp_dir();
                let path = dir.join(format!("comfygate-hf-{}", uuid::Uuid::new_v4()));
                tokio::fs::write(&path, &bytes).await?;
                (path.clone(), Some(path))
            }
        };

        let result = self
            .run_cli(
                &[
                    "upload",
                    &hf.repo,
                    &local.to_string_lossy(),
                    &hf.path,
                    "--repo-type",
                    &hf.repo_type,
                    "--revision",
                    &hf.revision,
                ],
                Some(&cancel),
            )
            .await;

        if let Some(tmp) = _guard {
            let _ = tokio::fs::remove_file(&tmp).await;
        }

        result
    }

    fn create_url(&self, fields: &Value, filename: &str) -> Result<String> {
        let repo = fields
            .get("repo")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::validation("hf_upload requires repo"))?;
        let repo_type = fields
            .get("repo_type")
            .and_then(Value::as_str)
            .unwrap_or("model");
        let directory = fields
            .get("directory")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim_matches('/');

        let path = if directory.is_empty() {
            filename.to_string()
        } else {
            format!("{directory}/{filename}")
        };

        match repo_type {
            "dataset" => Ok(format!(
                "https://huggingface.co/datasets/{repo}/resolve/main/{path}"
            )),
            _ => Ok(format!("https://huggingface.co/{repo}/resolve/main/{path}")),
        }
    }
}

fn tempfile_dir(base: &Path) -> Result<PathBuf> {
    let staging = base.join(format!(".hf-staging-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&staging)?;
    Ok(staging)
}

/// Rename, falling back to copy+remove across filesystems
async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await?;
    Ok(())
}
