// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! HTTP(S) provider
//!
//! Downloads with GET, uploads with PUT. Auth comes from (in order) the
//! URL's embedded userinfo, the per-request [`AuthSpec`], then the
//! process-global auth header map keyed by host. File extensions are
//! inferred from Content-Disposition, then the URL path, then a
//! Content-Type table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use comfygate_kernel::error::{GatewayError, Result};

use crate::provider::{AuthSpec, StorageProvider, UploadSource};

/// HTTP(S) blob provider
pub struct HttpProvider {
    transfer: reqwest::Client,
    global_auth: HashMap<String, HashMap<String, String>>,
}

impl HttpProvider {
    pub fn new(
        transfer: reqwest::Client,
        global_auth: HashMap<String, HashMap<String, String>>,
    ) -> Self {
        Self {
            transfer,
            global_auth,
        }
    }

    /// Apply auth in precedence order: URL userinfo, per-request spec,
    /// process-global host map. Returns the possibly rewritten URL.
    fn authed_request(
        &self,
        method: reqwest::Method,
        url: &str,
        auth: Option<&AuthSpec>,
    ) -> Result<reqwest::RequestBuilder> {
        let mut parsed = Url::parse(url)
            .map_err(|e| GatewayError::validation(format!("invalid url {url}: {e}")))?;

        // URL-embedded user:pass wins
        let userinfo = if !parsed.username().is_empty() {
            let user = parsed.username().to_string();
            let pass = parsed.password().map(str::to_string);
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            Some((user, pass))
        } else {
            None
        };

        // Query-token auth rewrites the URL
        if let Some(spec) = auth {
            if let (Some(param), Some(value)) = (&spec.query_param, &spec.query_value) {
                parsed.query_pairs_mut().append_pair(param, value);
            }
        }

        let host = parsed.host_str().map(str::to_string);
        let mut request = self.transfer.request(method, parsed);

        if let Some((user, pass)) = userinfo {
            request = request.basic_auth(user, pass);
        } else if let Some(spec) = auth.filter(|s| !s.is_empty()) {
            if let Some(token) = &spec.bearer_token {
                request = request.bearer_auth(token);
            } else if let Some(user) = &spec.username {
                request = request.basic_auth(user, spec.password.as_deref());
            }
            for (name, value) in &spec.headers {
                request = request.header(name, value);
            }
        } else if let Some(host) = host {
            if let Some(headers) = self.global_auth.get(&host) {
                for (name, value) in headers {
                    request = request.header(name, value);
                }
            }
        }

        Ok(request)
    }
}

#[async_trait]
impl StorageProvider for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    fn test_url(&self, url: &str) -> bool {
        url.starts_with("http://") || url.starts_with("https://")
    }

    fn request_body_upload_key(&self) -> Option<&'static str> {
        Some("http_upload")
    }

    async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        filename_override: Option<&str>,
        auth: Option<&AuthSpec>,
    ) -> Result<PathBuf> {
        let response = self
            .authed_request(reqwest::Method::GET, url, auth)?
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status.as_u16(), &body));
        }

        let disposition = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_disposition_filename);
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        let name = resolve_filename(
            filename_override,
            disposition.as_deref(),
            url,
            content_type.as_deref(),
        );

        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(&name);
        let mut file = tokio::fs::File::create(&dest).await?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| GatewayError::Network {
                message: format!("download interrupted: {e}"),
                source: Some(e),
            })?;
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
        let body = match source {
            UploadSource::Bytes(bytes) => reqwest::Body::from(bytes),
            UploadSource::Path(path) => {
                let file = tokio::fs::File::open(&path).await?;
                let stream = tokio_util::codec::FramedRead::new(
                    file,
                    tokio_util::codec::BytesCodec::new(),
                );
                reqwest::Body::wrap_stream(stream)
            }
        };

        let request = self
            .authed_request(reqwest::Method::PUT, url, None)?
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Aborted),
            result = request.send() => result?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status.as_u16(), &body));
        }

        Ok(())
    }

    async fn check(&self, url: &str, auth: Option<&AuthSpec>) -> Result<()> {
        let response = self
            .authed_request(reqwest::Method::HEAD, url, auth)?
            .send()
            .await?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            return Ok(());
        }

        // Some servers reject HEAD; probe with a one-byte ranged GET
        if status == 405 {
            let response = self
                .authed_request(reqwest::Method::GET, url, auth)?
                .header(reqwest::header::RANGE, "bytes=0-0")
                .send()
                .await?;
            if response.status().is_success() {
                return Ok(());
            }
            let code = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(code, &body));
        }

        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::from_status(status, &body))
    }

    fn create_url(&self, fields: &Value, filename: &str) -> Result<String> {
        let prefix = fields
            .get("url_prefix")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::validation("http_upload requires url_prefix"))?;
        Ok(format!("{}/{}", prefix.trim_end_matches('/'), filename))
    }
}

/// `attachment; filename="model.safetensors"` -> `model.safetensors`
fn parse_disposition_filename(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(rest) = part
            .strip_prefix("filename*=")
            .and_then(|r| r.split("''").nth(1))
        {
            return urlencoding::decode(rest).ok().map(|s| s.to_string());
        }
        if let Some(rest) = part.strip_prefix("filename=") {
            return Some(rest.trim_matches('"').to_string());
        }
    }
    None
}

/// Name resolution: override (extension appended if missing), disposition,
/// URL path, UUID + Content-Type extension
fn resolve_filename(
    override_name: Option<&str>,
    disposition: Option<&str>,
    url: &str,
    content_type: Option<&str>,
) -> String {
    let inferred_ext = disposition
        .and_then(extension_of)
        .or_else(|| url_path_extension(url))
        .or_else(|| content_type.and_then(ext_for_content_type));

    if let Some(name) = override_name {
        if name.contains('.') {
            return name.to_string();
        }
        return match inferred_ext {
            Some(ext) => format!("{name}.{ext}"),
            None => name.to_string(),
        };
    }

    if let Some(name) = disposition {
        return name.to_string();
    }

    if let Some(name) = url_basename(url) {
        if name.contains('.') {
            return name;
        }
        if let Some(ext) = inferred_ext {
            return format!("{name}.{ext}");
        }
        return name;
    }

    match inferred_ext {
        Some(ext) => format!("{}.{}", uuid::Uuid::new_v4(), ext),
        None => uuid::Uuid::new_v4().to_string(),
    }
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_string())
}

fn url_basename(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.last()?.to_string();
    if segment.is_empty() {
        return None;
    }
    urlencoding::decode(&segment)
        .ok()
        .map(|s| s.to_string())
        .or(Some(segment))
}

fn url_path_extension(url: &str) -> Option<String> {
    url_basename(url).and_then(|name| extension_of(&name))
}

/// Content-Type -> extension table for the formats the engine produces and
/// consumes
fn ext_for_content_type(content_type: &str) -> Option<String> {
    let ext = match content_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "audio/mpeg" => "mp3",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/ogg" | "application/ogg" => "ogg",
        "application/zip" => "zip",
        "application/json" => "json",
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        _ => return None,
    };
    Some(ext.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_url() {
        let provider = HttpProvider::new(reqwest::Client::new(), HashMap::new());
        assert!(provider.test_url("https://example.com/a.png"));
        assert!(provider.test_url("http://example.com/a.png"));
        assert!(!provider.test_url("s3://bucket/key"));
        assert!(!provider.test_url("/local/path"));
    }

    #[test]
    fn test_parse_disposition_filename() {
        assert_eq!(
            parse_disposition_filename(r#"attachment; filename="model.safetensors""#),
            Some("model.safetensors".to_string())
        );
        assert_eq!(
            parse_disposition_filename("attachment; filename=plain.bin"),
            Some("plain.bin".to_string())
        );
        assert_eq!(
            parse_disposition_filename("attachment; filename*=UTF-8''sp%20ace.png"),
            Some("sp ace.png".to_string())
        );
        assert_eq!(parse_disposition_filename("inline"), None);
    }

    #[test]
    fn test_resolve_filename_override_gets_extension() {
        let name = resolve_filename(
            Some("0a1b2c"),
            None,
            "https://host/files/model.safetensors",
            None,
        );
        assert_eq!(name, "0a1b2c.safetensors");
    }

    #[test]
    fn test_resolve_filename_disposition_beats_url() {
        let name = resolve_filename(
            None,
            Some("real-name.png"),
            "https://host/download?id=9",
            Some("image/png"),
        );
        assert_eq!(name, "real-name.png");
    }

    #[test]
    fn test_resolve_filename_content_type_fallback() {
        let name = resolve_filename(None, None, "https://host/fetch", Some("image/webp"));
        assert!(name.ends_with(".webp"));
    }

    #[test]
    fn test_ext_for_content_type_table() {
        assert_eq!(ext_for_content_type("image/png").as_deref(), Some("png"));
        assert_eq!(ext_for_content_type("audio/mpeg").as_deref(), Some("mp3"));
        assert_eq!(ext_for_content_type("application/octet-stream"), None);
    }

    #[test]
    fn test_create_url_joins_prefix() {
        let provider = HttpProvider::new(reqwest::Client::new(), HashMap::new());
        let fields = serde_json::json!({ "url_prefix": "https://cdn.example.com/out/" });
        assert_eq!(
            provider.create_url(&fields, "a.png").ok().as_deref(),
            Some("https://cdn.example.com/out/a.png")
        );
    }

    #[test]
    fn test_create_url_requires_prefix() {
        let provider = HttpProvider::new(reqwest::Client::new(), HashMap::new());
        let fields = serde_json::json!({});
        assert!(provider.create_url(&fields, "a.png").is_err());
    }
}
