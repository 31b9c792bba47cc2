// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Prompt preprocessing
//!
//! Walks the graph and rewrites a closed set of node classes: model
//! loaders get URL inputs downloaded into the right model directory and
//! replaced by the bare filename; media loaders get URLs downloaded and
//! base64 payloads decoded into the engine input directory; saver nodes
//! get a caller-scoped `filename_prefix`. Everything else passes through
//! opaquely. All fetches for one prompt run concurrently and the first
//! failure fails the preprocess.

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::try_join_all;
use serde_json::{json, Value};

use comfygate_engine::{EngineClient, EventKind, Prompt};
use comfygate_kernel::error::{GatewayError, Result};
use comfygate_media::sniff::decode_base64_payload;
use comfygate_storage::DownloadCache;

use crate::catalog::ModelCatalog;

/// Model-loading classes: the inputs holding a model name, and the model
/// subdirectory those names resolve against
const MODEL_LOADERS: &[(&str, &[&str], &str)] = &[
    ("CheckpointLoader", &["ckpt_name"], "checkpoints"),
    ("CheckpointLoaderSimple", &["ckpt_name"], "checkpoints"),
    ("unCLIPCheckpointLoader", &["ckpt_name"], "checkpoints"),
    ("ImageOnlyCheckpointLoader", &["ckpt_name"], "checkpoints"),
    ("LoraLoader", &["lora_name"], "loras"),
    ("LoraLoaderModelOnly", &["lora_name"], "loras"),
    ("VAELoader", &["vae_name"], "vae"),
    ("ControlNetLoader", &["control_net_name"], "controlnet"),
    ("DiffControlNetLoader", &["control_net_name"], "controlnet"),
    ("UNETLoader", &["unet_name"], "unet"),
    ("CLIPLoader", &["clip_name"], "clip"),
    ("DualCLIPLoader", &["clip_name1", "clip_name2"], "clip"),
    ("CLIPVisionLoader", &["clip_name"], "clip_vision"),
    ("StyleModelLoader", &["style_model_name"], "style_models"),
    ("GLIGENLoader", &["gligen_name"], "gligen"),
    ("UpscaleModelLoader", &["model_name"], "upscale_models"),
    ("DiffusersLoader", &["model_path"], "diffusers"),
];

/// Media-loading classes: every string input that is a URL or base64
/// payload is materialized into the engine input directory
const MEDIA_LOADERS: &[&str] = &[
    "LoadImage",
    "LoadImageMask",
    "LoadAudio",
    "LoadVideo",
    "VHS_LoadVideo",
    "VHS_LoadAudioUpload",
];

/// Directory-loading classes: a list input becomes a shared per-request
/// subdirectory
const DIRECTORY_LOADERS: &[&str] = &["VHS_LoadImages", "LoadImageSetFromFolderNode"];

/// URL schemes routed through the download cache
const URL_SCHEMES: &[&str] = &["http", "https", "s3", "file"];

fn model_loader(class_type: &str) -> Option<(&'static [&'static str], &'static str)> {
    MODEL_LOADERS
        .iter()
        .find(|(class, _, _)| *class == class_type)
        .map(|(_, fields, dir)| (*fields, *dir))
}

fn is_url(value: &str) -> bool {
    url::Url::parse(value)
        .map(|u| URL_SCHEMES.contains(&u.scheme()))
        .unwrap_or(false)
}

enum Rewrite {
    /// Fetch a model by URL into its model-type directory
    Model { url: String, model_type: String },
    /// Fetch media by URL into the input directory
    MediaUrl { url: String },
    /// Decode a base64 payload into the input directory
    MediaPayload { bytes: Vec<u8>, ext: String },
    /// Process each list element into the per-request subdirectory
    MediaList { values: Vec<String> },
}

struct Job {
    node_id: String,
    field: String,
    rewrite: Rewrite,
}

impl Job {
    fn location(&self) -> String {
        format!("/{}/inputs/{}", self.node_id, self.field)
    }
}

/// Graph preprocessor
pub struct Preprocessor {
    cache: Arc<DownloadCache>,
    catalog: Arc<ModelCatalog>,
    engine: Arc<EngineClient>,
    model_root: PathBuf,
    input_dir: PathBuf,
    prepend_filenames: bool,
}

impl Preprocessor {
    pub fn new(
        cache: Arc<DownloadCache>,
        catalog: Arc<ModelCatalog>,
        engine: Arc<EngineClient>,
        model_root: PathBuf,
        input_dir: PathBuf,
        prepend_filenames: bool,
    ) -> Self {
        Self {
            cache,
            catalog,
            engine,
            model_root,
            input_dir,
            prepend_filenames,
        }
    }

    /// Rewrite the prompt in place. Returns whether the graph has at least
    /// one active output saver.
    pub async fn prepare(&self, prompt: &mut Prompt, prompt_id: &str) -> Result<bool> {
        let mut has_saver = false;
        let mut jobs = Vec::new();

        for (node_id, node) in prompt.iter_mut() {
            // Output savers: a string filename_prefix marks one, unless
            // save_output is explicitly false
            if let Some(Value::String(prefix)) = node.inputs.get("filename_prefix") {
                let save_output = node
                    .inputs
                    .get("save_output")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                if save_output {
                    has_saver = true;
                    let stamped = if self.prepend_filenames {
                        format!("{prompt_id}_{prefix}")
                    } else {
                        prompt_id.to_string()
                    };
                    node.inputs
                        .insert("filename_prefix".to_string(), Value::String(stamped));
                }
            }

            if let Some((fields, model_type)) = model_loader(&node.class_type) {
                for field in fields {
                    if let Some(Value::String(value)) = node.inputs.get(*field) {
                        if is_url(value) {
                            jobs.push(Job {
                                node_id: node_id.clone(),
                                field: (*field).to_string(),
                                rewrite: Rewrite::Model {
                                    url: value.clone(),
                                    model_type: model_type.to_string(),
                                },
                            });
                        }
                    }
                }
                continue;
            }

            if DIRECTORY_LOADERS.contains(&node.class_type.as_str()) {
                for (field, value) in node.inputs.iter() {
                    if let Value::Array(items) = value {
                        let strings: Vec<String> = items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect();
                        if strings.len() == items.len() && !strings.is_empty() {
                            jobs.push(Job {
                                node_id: node_id.clone(),
                                field: field.clone(),
                                rewrite: Rewrite::MediaList { values: strings },
                            });
                        }
                    }
                }
                continue;
            }

            if MEDIA_LOADERS.contains(&node.class_type.as_str()) {
                for (field, value) in node.inputs.iter() {
                    let Value::String(raw) = value else { continue };
                    if is_url(raw) {
                        jobs.push(Job {
                            node_id: node_id.clone(),
                            field: field.clone(),
                            rewrite: Rewrite::MediaUrl { url: raw.clone() },
                        });
                    } else if let Some((bytes, ext)) = decode_base64_payload(raw) {
                        jobs.push(Job {
                            node_id: node_id.clone(),
                            field: field.clone(),
                            rewrite: Rewrite::MediaPayload { bytes, ext },
                        });
                    }
                    // Anything else is a filesystem path, passed verbatim
                }
            }
        }

        // All fetches in parallel; the first failure cancels the rest
        let results = try_join_all(jobs.into_iter().map(|job| self.run_job(job, prompt_id))).await?;

        for (node_id, field, replacement) in results {
            if let Some(node) = prompt.get_mut(&node_id) {
                node.inputs.insert(field, replacement);
            }
        }

        Ok(has_saver)
    }

    async fn run_job(&self, job: Job, prompt_id: &str) -> Result<(String, String, Value)> {
        let location = job.location();
        let replacement = match &job.rewrite {
            Rewrite::Model { url, model_type } => {
                let dir = self
                    .catalog
                    .dir_for(model_type)
                    .unwrap_or_else(|| self.model_root.join(model_type));
                let path = self
                    .cache
                    .get(url, &dir, None, None)
                    .await
                    .map_err(|e| locate(e, &location))?;
                let filename = file_name_of(&path);
                self.catalog.add(model_type, &dir, &filename);
                self.engine.emit_synthetic(
                    EventKind::FileDownloaded,
                    json!({ "url": url, "filename": filename, "model_type": model_type }),
                );
                Value::String(filename)
            }
            Rewrite::MediaUrl { url } => {
                let path = self
                    .cache
                    .get(url, &self.input_dir, None, None)
                    .await
                    .map_err(|e| locate(e, &location))?;
                self.engine.emit_synthetic(
                    EventKind::FileDownloaded,
                    json!({ "url": url, "filename": file_name_of(&path) }),
                );
                Value::String(file_name_of(&path))
            }
            Rewrite::MediaPayload { bytes, ext } => {
                let filename = format!("{}.{ext}", uuid::Uuid::new_v4());
                tokio::fs::create_dir_all(&self.input_dir)
                    .await
                    .map_err(|e| locate(e.into(), &location))?;
                tokio::fs::write(self.input_dir.join(&filename), bytes)
                    .await
                    .map_err(|e| locate(e.into(), &location))?;
                Value::String(filename)
            }
            Rewrite::MediaList { values } => {
                let subdir = self.input_dir.join(prompt_id);
                tokio::fs::create_dir_all(&subdir)
                    .await
                    .map_err(|e| locate(e.into(), &location))?;

                for value in values {
                    if is_url(value) {
                        self.cache
                            .get(value, &subdir, None, None)
                            .await
                            .map_err(|e| locate(e, &location))?;
                    } else if let Some((bytes, ext)) = decode_base64_payload(value) {
                        let filename = format!("{}.{ext}", uuid::Uuid::new_v4());
                        tokio::fs::write(subdir.join(&filename), bytes)
                            .await
                            .map_err(|e| locate(e.into(), &location))?;
                    } else {
                        return Err(GatewayError::validation_at(
                            "directory loader entries must be URLs or base64 payloads",
                            location.clone(),
                        ));
                    }
                }
                Value::String(subdir.to_string_lossy().to_string())
            }
        };

        Ok((job.node_id, job.field, replacement))
    }
}

/// Every preprocess failure surfaces to the caller as a 400 with a JSON
/// pointer to the offending input, whatever the underlying cause was
fn locate(err: GatewayError, location: &str) -> GatewayError {
    let message = match &err {
        GatewayError::Validation { message, .. } => message.clone(),
        other => other.to_string(),
    };
    GatewayError::Validation {
        message,
        location: Some(location.to_string()),
    }
}

fn file_name_of(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use comfygate_kernel::config::Config;
    use comfygate_storage::{LocalProvider, StorageRegistry};
    use serde_json::json;

    fn test_prompt(raw: Value) -> Prompt {
        serde_json::from_value(raw).expect("prompt")
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        pre: Preprocessor,
        model_root: PathBuf,
        input_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let model_root = dir.path().join("models");
        std::fs::create_dir_all(model_root.join("checkpoints")).expect("mkdir");
        let input_dir = dir.path().join("input");
        std::fs::create_dir_all(&input_dir).expect("mkdir");

        let registry = Arc::new(StorageRegistry::new(vec![Arc::new(LocalProvider)]));
        let cache = Arc::new(DownloadCache::new(dir.path().join("cache"), registry, None));
        let catalog = Arc::new(ModelCatalog::scan(&model_root));
        let engine = EngineClient::new(&Config::default(), "gw-test").expect("engine");

        Fixture {
            pre: Preprocessor::new(
                cache,
                catalog.clone(),
                engine,
                model_root.clone(),
                input_dir.clone(),
                true,
            ),
            _dir: dir,
            model_root,
            input_dir,
        }
    }

    #[tokio::test]
    async fn test_saver_prefix_prepended() {
        let fx = fixture();
        let mut prompt = test_prompt(json!({
            "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "render", "images": ["8", 0] } }
        }));

        let has_saver = fx.pre.prepare(&mut prompt, "T1").await.expect("prepare");
        assert!(has_saver);
        assert_eq!(
            prompt["9"].inputs.get("filename_prefix"),
            Some(&json!("T1_render"))
        );
    }

    #[tokio::test]
    async fn test_save_output_false_is_skipped() {
        let fx = fixture();
        let mut prompt = test_prompt(json!({
            "9": { "class_type": "VHS_VideoCombine",
                   "inputs": { "filename_prefix": "render", "save_output": false } }
        }));

        let has_saver = fx.pre.prepare(&mut prompt, "T1").await.expect("prepare");
        assert!(!has_saver);
        // Prefix left untouched
        assert_eq!(
            prompt["9"].inputs.get("filename_prefix"),
            Some(&json!("render"))
        );
    }

    #[tokio::test]
    async fn test_bare_prompt_id_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(StorageRegistry::new(vec![Arc::new(LocalProvider)]));
        let cache = Arc::new(DownloadCache::new(dir.path().join("cache"), registry, None));
        let catalog = Arc::new(ModelCatalog::default());
        let engine = EngineClient::new(&Config::default(), "gw-test").expect("engine");
        let pre = Preprocessor::new(
            cache,
            catalog,
            engine,
            dir.path().join("models"),
            dir.path().join("input"),
            false,
        );

        let mut prompt = test_prompt(json!({
            "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "render" } }
        }));
        pre.prepare(&mut prompt, "T1").await.expect("prepare");
        assert_eq!(prompt["9"].inputs.get("filename_prefix"), Some(&json!("T1")));
    }

    #[tokio::test]
    async fn test_model_url_downloaded_and_catalog_updated() {
        let fx = fixture();
        let source = fx._dir.path().join("sd15.safetensors");
        std::fs::write(&source, b"weights").expect("write");

        let mut prompt = test_prompt(json!({
            "1": { "class_type": "CheckpointLoaderSimple",
                   "inputs": { "ckpt_name": format!("file://{}", source.display()) } },
            "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "x" } }
        }));

        fx.pre.prepare(&mut prompt, "T1").await.expect("prepare");

        assert_eq!(
            prompt["1"].inputs.get("ckpt_name"),
            Some(&json!("sd15.safetensors"))
        );
        assert!(fx
            .model_root
            .join("checkpoints/sd15.safetensors")
            .exists());
        assert!(fx.pre.catalog.contains("checkpoints", "sd15.safetensors"));
    }

    #[tokio::test]
    async fn test_base64_payload_written_to_input_dir() {
        let fx = fixture();
        let png_magic = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR\x00\x00";
        let encoded = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            png_magic,
        );

        let mut prompt = test_prompt(json!({
            "5": { "class_type": "LoadImage", "inputs": { "image": encoded, "upload": "image" } },
            "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "x" } }
        }));

        fx.pre.prepare(&mut prompt, "T2").await.expect("prepare");

        let rewritten = prompt["5"]
            .inputs
            .get("image")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default();
        assert!(rewritten.ends_with(".png"), "got {rewritten}");
        assert!(fx.input_dir.join(&rewritten).exists());
        // The widget selector string is not a payload and stays put
        assert_eq!(prompt["5"].inputs.get("upload"), Some(&json!("image")));
    }

    #[tokio::test]
    async fn test_plain_filename_passes_through() {
        let fx = fixture();
        let mut prompt = test_prompt(json!({
            "5": { "class_type": "LoadImage", "inputs": { "image": "example.png" } },
            "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "x" } }
        }));

        fx.pre.prepare(&mut prompt, "T3").await.expect("prepare");
        assert_eq!(prompt["5"].inputs.get("image"), Some(&json!("example.png")));
    }

    #[tokio::test]
    async fn test_failed_fetch_carries_location() {
        let fx = fixture();
        let mut prompt = test_prompt(json!({
            "5": { "class_type": "LoadImage",
                   "inputs": { "image": "file:///definitely/missing.png" } },
            "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "x" } }
        }));

        let err = fx.pre.prepare(&mut prompt, "T4").await.err().expect("error");
        assert_eq!(err.http_status(), 400);
        assert_eq!(err.location(), Some("/5/inputs/image"));
    }

    #[tokio::test]
    async fn test_directory_loader_builds_shared_subdir() {
        let fx = fixture();
        let a = fx._dir.path().join("a.png");
        let b = fx._dir.path().join("b.png");
        std::fs::write(&a, b"a").expect("write");
        std::fs::write(&b, b"b").expect("write");

        let mut prompt = test_prompt(json!({
            "3": { "class_type": "VHS_LoadImages",
                   "inputs": { "directory": [
                       format!("file://{}", a.display()),
                       format!("file://{}", b.display())
                   ] } },
            "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "x" } }
        }));

        fx.pre.prepare(&mut prompt, "T5").await.expect("prepare");

        let rewritten = prompt["3"]
            .inputs
            .get("directory")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default();
        assert!(rewritten.ends_with("T5"), "got {rewritten}");
        assert!(fx.input_dir.join("T5/a.png").exists());
        assert!(fx.input_dir.join("T5/b.png").exists());
    }

    #[tokio::test]
    async fn test_no_saver_reported() {
        let fx = fixture();
        let mut prompt = test_prompt(json!({
            "4": { "class_type": "KSampler", "inputs": { "seed": 1 } }
        }));
        let has_saver = fx.pre.prepare(&mut prompt, "T6").await.expect("prepare");
        assert!(!has_saver);
    }
}
