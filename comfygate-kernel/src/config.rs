// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Configuration module for the gateway
//!
//! Everything is driven by environment variables (a `.env` file is honored
//! when present). Paths point into the engine's own directory layout; the
//! gateway never relocates engine files, it only reads and writes inside
//! the configured directories.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::http::HttpClientConfig;

/// Default port the gateway listens on
pub const DEFAULT_PORT: u16 = 3000;

/// Default engine HTTP endpoint
pub const DEFAULT_ENGINE_URL: &str = "http://127.0.0.1:8188";

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen host
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Engine HTTP base URL
    pub engine_url: String,
    /// Engine WebSocket URL (derived from `engine_url` unless overridden)
    pub engine_ws_url: String,
    /// Root of the engine's model directories (`checkpoints/`, `loras/`, ...)
    pub model_dir: PathBuf,
    /// Engine input directory (media rewrites land here)
    pub input_dir: PathBuf,
    /// Engine output directory (saver nodes write here)
    pub output_dir: PathBuf,
    /// Download cache directory (UUID-named canonical copies)
    pub cache_dir: PathBuf,
    /// Soft byte quota for the cache; logged, not enforced
    pub cache_max_bytes: Option<u64>,
    /// How long to wait for the engine to answer at boot
    pub startup_timeout: Duration,
    /// Optional warmup prompt: local file path
    pub warmup_prompt_file: Option<PathBuf>,
    /// Optional warmup prompt: URL
    pub warmup_prompt_url: Option<String>,
    /// System webhook URL (v2, signed) for engine/storage events
    pub system_webhook_url: Option<String>,
    /// Base64-encoded webhook signing secret
    pub webhook_secret: Option<String>,
    /// Event kinds forwarded by the system event bridge
    pub system_events: Vec<String>,
    /// Static metadata merged into every bridged event
    pub system_metadata: HashMap<String, String>,
    /// Readiness gate: 503 once `queue_remaining` reaches this depth (0 = no gate)
    pub max_queue_depth: u64,
    /// true: saver prefixes become `<id>_<original>`; false: bare `<id>`
    pub prepend_filenames: bool,
    /// External media encoder binary
    pub encoder_bin: String,
    /// Wall-clock limit for one encoder invocation
    pub encoder_timeout: Duration,
    /// Reconnect the engine WebSocket after an unexpected close
    pub ws_reconnect: bool,
    /// Slow history poll interval (liveness safety net)
    pub poll_interval: Duration,
    /// Fast history poll interval (after WebSocket success)
    pub fast_poll_interval: Duration,
    /// Bounded retry count for the fast poll phase
    pub fast_poll_max_tries: u32,
    /// Webhook retry budget
    pub webhook_retries: u32,
    /// Base delay between webhook retries
    pub webhook_retry_delay: Duration,
    /// S3 endpoint override (MinIO and friends)
    pub s3_endpoint: Option<String>,
    /// Azure connection string, if any
    pub azure_connection_string: Option<String>,
    /// Azure account name for shared-key or SAS credentials
    pub azure_account: Option<String>,
    /// Azure shared access key
    pub azure_access_key: Option<String>,
    /// Azure SAS token
    pub azure_sas_token: Option<String>,
    /// HuggingFace CLI binary name
    pub hf_cli: String,
    /// Process-global auth headers keyed by host, used when a download
    /// request carries no auth of its own
    pub global_auth_headers: HashMap<String, HashMap<String, String>>,
    /// Directory of workflow template files
    pub workflow_dir: Option<PathBuf>,
    /// Telemetry sink URL; aggregator disabled when unset
    pub telemetry_url: Option<String>,
    /// Telemetry post interval
    pub telemetry_interval: Duration,
    /// Control-plane HTTP client settings
    pub http_config: HttpClientConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            engine_url: DEFAULT_ENGINE_URL.to_string(),
            engine_ws_url: derive_ws_url(DEFAULT_ENGINE_URL),
            model_dir: PathBuf::from("/opt/ComfyUI/models"),
            input_dir: PathBuf::from("/opt/ComfyUI/input"),
            output_dir: PathBuf::from("/opt/ComfyUI/output"),
            cache_dir: PathBuf::from("/tmp/comfygate-cache"),
            cache_max_bytes: None,
            startup_timeout: Duration::from_secs(120),
            warmup_prompt_file: None,
            warmup_prompt_url: None,
            system_webhook_url: None,
            webhook_secret: None,
            system_events: Vec::new(),
            system_metadata: HashMap::new(),
            max_queue_depth: 0,
            prepend_filenames: true,
            encoder_bin: "ffmpeg".to_string(),
            encoder_timeout: Duration::from_millis(5_000),
            ws_reconnect: true,
            poll_interval: Duration::from_millis(1_000),
            fast_poll_interval: Duration::from_millis(30),
            fast_poll_max_tries: 100,
            webhook_retries: 3,
            webhook_retry_delay: Duration::from_millis(500),
            s3_endpoint: None,
            azure_connection_string: None,
            azure_account: None,
            azure_access_key: None,
            azure_sas_token: None,
            hf_cli: "huggingface-cli".to_string(),
            global_auth_headers: HashMap::new(),
            workflow_dir: None,
            telemetry_url: None,
            telemetry_interval: Duration::from_secs(60),
            http_config: HttpClientConfig::default(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl Config {
    /// Load configuration from the environment
    pub fn from_env() -> Result<Self> {
        // Load .env if present (silently ignore if not found)
        let _ = dotenvy::dotenv();

        let engine_url = env_or("COMFY_URL", DEFAULT_ENGINE_URL);
        let engine_ws_url = env_opt("COMFY_WS_URL").unwrap_or_else(|| derive_ws_url(&engine_url));

        let global_auth_headers = match env_opt("GLOBAL_AUTH_HEADERS") {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| GatewayError::Validation {
                message: format!("GLOBAL_AUTH_HEADERS is not a JSON object of host -> headers: {e}"),
                location: None,
            })?,
            None => HashMap::new(),
        };

        let system_metadata = match env_opt("SYSTEM_META_JSON") {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| GatewayError::Validation {
                message: format!("SYSTEM_META_JSON is not a JSON string map: {e}"),
                location: None,
            })?,
            None => HashMap::new(),
        };

        let system_events = env_opt("SYSTEM_WEBHOOK_EVENTS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let defaults = Self::default();

        Ok(Self {
            host: env_or("HOST", &defaults.host),
            port: env_parse("PORT", defaults.port),
            engine_url,
            engine_ws_url,
            model_dir: PathBuf::from(env_or("MODEL_DIR", "/opt/ComfyUI/models")),
            input_dir: PathBuf::from(env_or("INPUT_DIR", "/opt/ComfyUI/input")),
            output_dir: PathBuf::from(env_or("OUTPUT_DIR", "/opt/ComfyUI/output")),
            cache_dir: PathBuf::from(env_or("CACHE_DIR", "/tmp/comfygate-cache")),
            cache_max_bytes: env_opt("CACHE_MAX_BYTES").and_then(|v| v.parse().ok()),
            startup_timeout: Duration::from_secs(env_parse("STARTUP_TIMEOUT", 120u64)),
            warmup_prompt_file: env_opt("WARMUP_PROMPT_FILE").map(PathBuf::from),
            warmup_prompt_url: env_opt("WARMUP_PROMPT_URL"),
            system_webhook_url: env_opt("WEBHOOK_URL"),
            webhook_secret: env_opt("WEBHOOK_SECRET"),
            system_events,
            system_metadata,
            max_queue_depth: env_parse("MAX_QUEUE_DEPTH", 0u64),
            prepend_filenames: env_bool("PREPEND_FILENAMES", true),
            encoder_bin: env_or("ENCODER_BIN", "ffmpeg"),
            encoder_timeout: Duration::from_millis(env_parse("ENCODER_TIMEOUT_MS", 5_000u64)),
            ws_reconnect: env_bool("WS_RECONNECT", true),
            poll_interval: Duration::from_millis(env_parse("POLL_INTERVAL_MS", 1_000u64)),
            fast_poll_interval: Duration::from_millis(env_parse("FAST_POLL_INTERVAL_MS", 30u64)),
            fast_poll_max_tries: env_parse("FAST_POLL_MAX_TRIES", 100u32),
            webhook_retries: env_parse("WEBHOOK_RETRIES", 3u32),
            webhook_retry_delay: Duration::from_millis(env_parse("WEBHOOK_RETRY_DELAY_MS", 500u64)),
            s3_endpoint: env_opt("S3_ENDPOINT"),
            azure_connection_string: env_opt("AZURE_STORAGE_CONNECTION_STRING"),
            azure_account: env_opt("AZURE_STORAGE_ACCOUNT"),
            azure_access_key: env_opt("AZURE_STORAGE_ACCESS_KEY"),
            azure_sas_token: env_opt("AZURE_STORAGE_SAS_TOKEN"),
            hf_cli: env_or("HF_CLI", "huggingface-cli"),
            global_auth_headers,
            workflow_dir: env_opt("WORKFLOW_DIR").map(PathBuf::from),
            telemetry_url: env_opt("TELEMETRY_URL"),
            telemetry_interval: Duration::from_secs(env_parse("TELEMETRY_INTERVAL_SECS", 60u64)),
            http_config: HttpClientConfig::default(),
        })
    }

    /// Listen address for the HTTP server
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Engine WebSocket URL including the gateway client id
    pub fn ws_url_for(&self, client_id: &str) -> String {
        format!("{}/ws?clientId={}", self.engine_ws_url, client_id)
    }

    /// Model subdirectory for a model type (`checkpoints`, `loras`, ...)
    pub fn model_type_dir(&self, model_type: &str) -> PathBuf {
        self.model_dir.join(model_type)
    }
}

/// Derive `ws://.../ws`-style URL from the engine HTTP URL
fn derive_ws_url(engine_url: &str) -> String {
    let stripped = engine_url.trim_end_matches('/');
    if let Some(rest) = stripped.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = stripped.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{stripped}")
    }
}
