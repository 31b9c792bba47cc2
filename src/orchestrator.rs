// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Prompt orchestration
//!
//! One request end to end: preprocess, dispatch, await outputs,
//! post-process, deliver. Delivery is exactly one of inline base64,
//! per-file v1 webhook, or provider upload; a v2 completion webhook (when
//! configured) follows delivery, and every failure on the way notifies the
//! same webhook with `prompt.failed`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use comfygate_engine::{CompletionCoordinator, EngineClient, EventKind, ExecutionStats, Prompt};
use comfygate_kernel::config::Config;
use comfygate_kernel::error::{GatewayError, Result};
use comfygate_media::{
    is_media_extension, transcode_image, zip_outputs, EncodeOptions, ImageTarget, MediaEncoder,
};
use comfygate_storage::{StorageRegistry, UploadManager, UploadSource};
use comfygate_webhooks::{OutputCompleteV1, WebhookSender};

use crate::preprocess::Preprocessor;
use crate::telemetry::Telemetry;

/// Output conversion request
#[derive(Debug, Clone, Deserialize)]
pub struct ConvertOutput {
    pub format: String,
    #[serde(default)]
    pub options: EncodeOptions,
}

/// Body of `POST /prompt`
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRequest {
    pub prompt: Prompt,
    #[serde(default)]
    pub id: Option<String>,
    /// Deprecated per-file webhook
    #[serde(default)]
    pub webhook: Option<String>,
    #[serde(default)]
    pub webhook_v2: Option<String>,
    #[serde(default)]
    pub convert_output: Option<ConvertOutput>,
    #[serde(default)]
    pub compress_outputs: bool,
    #[serde(default)]
    pub signed_url: bool,
    #[serde(default)]
    pub s3: Option<Value>,
    #[serde(default)]
    pub azure_blob_upload: Option<Value>,
    #[serde(default)]
    pub http_upload: Option<Value>,
    #[serde(default)]
    pub hf_upload: Option<Value>,
}

impl PromptRequest {
    /// Caller id, assigned when absent
    pub fn ensure_id(&mut self) -> String {
        if let Some(id) = &self.id {
            return id.clone();
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.id = Some(id.clone());
        id
    }

    /// The upload fields present in the request, by provider key.
    /// At most one may be set.
    fn upload_selection(&self) -> Result<Option<(&'static str, &Value)>> {
        let mut present: Vec<(&'static str, &Value)> = Vec::new();
        if let Some(fields) = &self.s3 {
            present.push(("s3", fields));
        }
        if let Some(fields) = &self.azure_blob_upload {
            present.push(("azure_blob_upload", fields));
        }
        if let Some(fields) = &self.http_upload {
            present.push(("http_upload", fields));
        }
        if let Some(fields) = &self.hf_upload {
            present.push(("hf_upload", fields));
        }

        match present.len() {
            0 => Ok(None),
            1 => Ok(Some(present.remove(0))),
            _ => Err(GatewayError::validation(
                "at most one upload destination may be specified",
            )),
        }
    }

    /// Whether the caller gets a 202 and results flow out of band
    pub fn is_fire_and_forget(&self) -> bool {
        self.webhook.is_some() || self.webhook_v2.is_some()
    }
}

/// Result of one orchestrated prompt
#[derive(Debug, Serialize)]
pub struct PromptResponse {
    pub id: String,
    pub prompt: Prompt,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    pub filenames: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    pub stats: ExecutionStats,
    /// Uploads continue in the background; the surface answers 202
    #[serde(skip)]
    pub async_uploads: bool,
}

/// End-to-end prompt pipeline
pub struct Orchestrator {
    config: Config,
    engine: Arc<EngineClient>,
    preprocessor: Preprocessor,
    registry: Arc<StorageRegistry>,
    uploads: Arc<UploadManager>,
    encoder: MediaEncoder,
    webhooks: WebhookSender,
    telemetry: Arc<Telemetry>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        engine: Arc<EngineClient>,
        preprocessor: Preprocessor,
        registry: Arc<StorageRegistry>,
        uploads: Arc<UploadManager>,
        encoder: MediaEncoder,
        webhooks: WebhookSender,
        telemetry: Arc<Telemetry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            engine,
            preprocessor,
            registry,
            uploads,
            encoder,
            webhooks,
            telemetry,
        })
    }

    pub fn engine(&self) -> &Arc<EngineClient> {
        &self.engine
    }

    /// Run one prompt; failures notify the request's v2 webhook
    pub async fn run(self: &Arc<Self>, mut request: PromptRequest) -> Result<PromptResponse> {
        let id = request.ensure_id();
        let started = Instant::now();

        match self.execute(&mut request, &id, started).await {
            Ok(response) => {
                self.telemetry.record_success(response.stats.total_ms);
                if let Some(url) = &request.webhook_v2 {
                    self.send_completion(url, &response).await;
                }
                Ok(response)
            }
            Err(err) => {
                self.telemetry.record_failure();
                if let Some(url) = &request.webhook_v2 {
                    self.send_failure(url, &id, &err).await;
                }
                Err(err)
            }
        }
    }

    async fn execute(
        self: &Arc<Self>,
        request: &mut PromptRequest,
        id: &str,
        started: Instant,
    ) -> Result<PromptResponse> {
        // Preprocess
        let preprocess_started = Instant::now();
        let has_saver = self.preprocessor.prepare(&mut request.prompt, id).await?;
        if !has_saver {
            return Err(GatewayError::validation(
                "prompt has no output saver: a node with a string filename_prefix is required",
            ));
        }
        let preprocess_ms = preprocess_started.elapsed().as_millis() as u64;

        // Dispatch and await
        let prompt_value = serde_json::to_value(&request.prompt)?;
        let engine_id = self.engine.queue(&prompt_value, id).await?;
        let coordinator = CompletionCoordinator::attach(
            self.engine.clone(),
            &engine_id,
            self.config.poll_interval,
            self.config.fast_poll_interval,
            self.config.fast_poll_max_tries,
        )?;
        let outcome = coordinator.wait().await?;

        let mut stats = outcome.stats;
        stats.preprocess_ms = preprocess_ms;

        // Post-process
        let postprocess_started = Instant::now();
        let original_names: Vec<String> = outcome.outputs.keys().cloned().collect();
        let mut files = self
            .convert_outputs(outcome.outputs, request.convert_output.as_ref())
            .await?;
        self.engine.delete_outputs(&original_names).await;

        if request.compress_outputs {
            let archive = zip_outputs(files).await?;
            files = BTreeMap::from([(comfygate_media::archive::ARCHIVE_NAME.to_string(), archive)]);
        }
        stats.postprocess_ms = postprocess_started.elapsed().as_millis() as u64;

        let filenames: Vec<String> = files.keys().cloned().collect();

        // Deliver
        let mut images = Vec::new();
        let mut urls = None;
        let mut async_uploads = false;

        if let Some((key, fields)) = request.upload_selection()? {
            let provider = self.registry.by_upload_key(key).ok_or_else(|| {
                GatewayError::validation(format!("no provider configured for {key}"))
            })?;
            let async_mode = fields
                .get("async")
                .and_then(Value::as_bool)
                .unwrap_or(false);

            let upload_started = Instant::now();
            let mut destinations = Vec::with_capacity(files.len());
            let mut tasks = Vec::with_capacity(files.len());

            for (filename, bytes) in &files {
                let dest = provider.create_url(fields, filename)?;
                let upload = self.uploads.begin(&dest, &content_type_for(filename));
                let manager = self.uploads.clone();
                let provider = provider.clone();
                let source = UploadSource::Bytes(bytes.clone());
                let engine = self.engine.clone();
                let dest_for_event = dest.clone();
                let caller_id = id.to_string();

                tasks.push(tokio::spawn(async move {
                    let result = manager.run(provider, upload, source).await;
                    match &result {
                        Ok(()) => engine.emit_synthetic(
                            EventKind::FileUploaded,
                            json!({ "url": dest_for_event, "prompt_id": caller_id }),
                        ),
                        Err(e) => {
                            tracing::error!(url = %dest_for_event, "output upload failed: {e}")
                        }
                    }
                    result
                }));
                destinations.push(dest);
            }

            if async_mode {
                async_uploads = true;
            } else {
                for task in tasks {
                    task.await
                        .map_err(|e| GatewayError::internal(format!("upload task failed: {e}")))??;
                }
                stats.upload_ms = upload_started.elapsed().as_millis() as u64;
            }

            if request.signed_url {
                let mut signed = Vec::with_capacity(destinations.len());
                for dest in &destinations {
                    signed.push(self.registry.signed_url(dest).await?);
                }
                destinations = signed;
            }
            urls = Some(destinations);
        } else if let Some(webhook_url) = &request.webhook {
            // Deprecated v1 flow: one unsigned POST per file, best effort
            let stats_value = serde_json::to_value(&stats)?;
            for (filename, bytes) in &files {
                let payload = OutputCompleteV1::new(
                    id,
                    filename,
                    bytes,
                    serde_json::to_value(&request.prompt)?,
                    stats_value.clone(),
                );
                if let Err(e) = self.webhooks.send_v1(webhook_url, &payload).await {
                    tracing::error!(url = %webhook_url, filename = %filename, "v1 webhook failed: {e}");
                }
            }
        } else {
            images = files
                .values()
                .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes))
                .collect();
        }

        stats.finalize_total(started.elapsed().as_millis() as u64);

        Ok(PromptResponse {
            id: id.to_string(),
            prompt: request.prompt.clone(),
            images,
            filenames,
            urls,
            stats,
            async_uploads,
        })
    }

    /// Transcode each output per the requested format. AV targets and AV
    /// inputs route to the media encoder; image targets to the image
    /// encoder. Filename extensions follow the result.
    async fn convert_outputs(
        &self,
        outputs: std::collections::HashMap<String, Vec<u8>>,
        convert: Option<&ConvertOutput>,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut files: BTreeMap<String, Vec<u8>> = BTreeMap::new();

        let Some(convert) = convert else {
            files.extend(outputs);
            return Ok(files);
        };

        let format = convert.format.to_lowercase();
        let media_target = matches!(format.as_str(), "mp4" | "webm" | "mp3" | "wav" | "ogg");

        for (filename, bytes) in outputs {
            let ext = extension_of(&filename);

            if ext.eq_ignore_ascii_case(&format)
                || (format == "jpeg" && ext.eq_ignore_ascii_case("jpg"))
            {
                files.insert(filename, bytes);
                continue;
            }

            let (new_name, converted) = if media_target || is_media_extension(&ext) {
                let converted = self
                    .encoder
                    .transcode(bytes, &ext, &format, &convert.options)
                    .await?;
                (rename_extension(&filename, &format), converted)
            } else {
                let target = ImageTarget::from_format(&format).ok_or_else(|| {
                    GatewayError::validation(format!("unsupported output format {format}"))
                })?;
                let quality = 90;
                let converted = transcode_image(bytes, target, quality).await?;
                (rename_extension(&filename, target.extension()), converted)
            };

            files.insert(new_name, converted);
        }

        Ok(files)
    }

    /// `prompt.complete` to the request's v2 webhook
    async fn send_completion(&self, url: &str, response: &PromptResponse) {
        let payload = json!({
            "id": response.id,
            "prompt": response.prompt,
            "filenames": response.filenames,
            "images": response.images,
            "urls": response.urls,
            "stats": response.stats,
        });
        if let Err(e) = self
            .webhooks
            .send_v2(
                url,
                self.config.webhook_secret.as_deref(),
                "prompt.complete",
                payload,
            )
            .await
        {
            tracing::error!(url, "prompt.complete webhook failed: {e}");
        }
    }

    /// `prompt.failed` to the request's v2 webhook
    async fn send_failure(&self, url: &str, id: &str, err: &GatewayError) {
        let payload = json!({
            "id": id,
            "error": err.to_string(),
            "location": err.location(),
        });
        if let Err(e) = self
            .webhooks
            .send_v2(
                url,
                self.config.webhook_secret.as_deref(),
                "prompt.failed",
                payload,
            )
            .await
        {
            tracing::error!(url, "prompt.failed webhook failed: {e}");
        }
    }
}

fn extension_of(filename: &str) -> String {
    std::path::Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn rename_extension(filename: &str, new_ext: &str) -> String {
    let stem = std::path::Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| filename.to_string());
    format!("{stem}.{new_ext}")
}

/// Extension -> content type for delivery headers
pub fn content_type_for(filename: &str) -> String {
    let content_type = match extension_of(filename).as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "zip" => "application/zip",
        "json" => "application/json",
        _ => "application/octet-stream",
    };
    content_type.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_id_stable() {
        let mut request: PromptRequest =
            serde_json::from_value(json!({ "prompt": {}, "id": "T1" })).expect("decode");
        assert_eq!(request.ensure_id(), "T1");

        let mut request: PromptRequest =
            serde_json::from_value(json!({ "prompt": {} })).expect("decode");
        let id = request.ensure_id();
        assert_eq!(request.ensure_id(), id);
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn test_upload_selection_single() {
        let request: PromptRequest = serde_json::from_value(json!({
            "prompt": {},
            "s3": { "bucket": "outs", "prefix": "x" }
        }))
        .expect("decode");
        let selection = request.upload_selection().expect("selection");
        assert_eq!(selection.map(|(key, _)| key), Some("s3"));
    }

    #[test]
    fn test_upload_selection_conflict() {
        let request: PromptRequest = serde_json::from_value(json!({
            "prompt": {},
            "s3": { "bucket": "outs" },
            "http_upload": { "url_prefix": "https://x" }
        }))
        .expect("decode");
        assert!(request.upload_selection().is_err());
    }

    #[test]
    fn test_fire_and_forget_flags() {
        let request: PromptRequest = serde_json::from_value(json!({
            "prompt": {},
            "webhook_v2": "https://hooks.example.com"
        }))
        .expect("decode");
        assert!(request.is_fire_and_forget());

        let request: PromptRequest =
            serde_json::from_value(json!({ "prompt": {} })).expect("decode");
        assert!(!request.is_fire_and_forget());
    }

    #[test]
    fn test_rename_extension() {
        assert_eq!(rename_extension("T1_00001_.png", "webp"), "T1_00001_.webp");
        assert_eq!(rename_extension("clip.mp4", "webm"), "clip.webm");
        assert_eq!(rename_extension("noext", "png"), "noext.png");
    }

    #[test]
    fn test_content_type_table() {
        assert_eq!(content_type_for("a.png"), "image/png");
        assert_eq!(content_type_for("a.JPG"), "image/jpeg");
        assert_eq!(content_type_for("outputs.zip"), "application/zip");
        assert_eq!(content_type_for("weights.safetensors"), "application/octet-stream");
    }
}
