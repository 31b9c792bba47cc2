// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Shared application state and its wiring
//!
//! Every collaborator is an explicit `Arc` handed through constructors;
//! the only shared mutability lives inside the cache, the correlation map
//! and the upload manager, each behind its own guard.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use comfygate_engine::EngineClient;
use comfygate_kernel::config::Config;
use comfygate_kernel::error::Result;
use comfygate_media::MediaEncoder;
use comfygate_storage::{
    AzureProvider, AzureSettings, DownloadCache, HttpProvider, HuggingFaceProvider, LocalProvider,
    S3Provider, StorageProvider, StorageRegistry, UploadManager,
};
use comfygate_webhooks::{WebhookRetry, WebhookSender};

use crate::bridge::SystemEventBridge;
use crate::catalog::ModelCatalog;
use crate::orchestrator::Orchestrator;
use crate::preprocess::Preprocessor;
use crate::telemetry::Telemetry;
use crate::workflow::WorkflowRegistry;

/// Everything the HTTP surface needs
pub struct AppState {
    pub config: Config,
    pub orchestrator: Arc<Orchestrator>,
    pub engine: Arc<EngineClient>,
    pub cache: Arc<DownloadCache>,
    pub catalog: Arc<ModelCatalog>,
    pub workflows: Arc<WorkflowRegistry>,
    pub telemetry: Arc<Telemetry>,
    warm: AtomicBool,
}

impl AppState {
    /// Wire the full collaborator graph from configuration
    pub fn build(config: Config) -> Result<Arc<Self>> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let engine = EngineClient::new(&config, &client_id)?;

        let transfer_client = config.http_config.create_transfer_client()?;
        let control_client = config.http_config.create_client()?;

        // Provider order matters: specific claims before the catch-all HTTP
        let mut providers: Vec<Arc<dyn StorageProvider>> = Vec::new();
        providers.push(Arc::new(S3Provider::new(config.s3_endpoint.clone())));
        providers.push(Arc::new(AzureProvider::new(AzureSettings {
            connection_string: config.azure_connection_string.clone(),
            account: config.azure_account.clone(),
            access_key: config.azure_access_key.clone(),
            sas_token: config.azure_sas_token.clone(),
        })));
        if let Some(hf) = HuggingFaceProvider::new(&config.hf_cli) {
            providers.push(Arc::new(hf));
        } else {
            tracing::info!(cli = %config.hf_cli, "huggingface cli not found; provider disabled");
        }
        providers.push(Arc::new(HttpProvider::new(
            transfer_client,
            config.global_auth_headers.clone(),
        )));
        providers.push(Arc::new(LocalProvider));

        let registry = Arc::new(StorageRegistry::new(providers));
        let cache = Arc::new(DownloadCache::new(
            config.cache_dir.clone(),
            registry.clone(),
            config.cache_max_bytes,
        ));
        let catalog = Arc::new(ModelCatalog::scan(&config.model_dir));
        let uploads = Arc::new(UploadManager::new());
        let telemetry = Telemetry::new();

        let webhooks = WebhookSender::new(
            control_client,
            WebhookRetry {
                max_attempts: config.webhook_retries,
                base_delay: config.webhook_retry_delay,
            },
        );

        // The bridge subscribes to the client; the client only ever sees
        // the subscriber interface
        let bridge = SystemEventBridge::new(
            webhooks.clone(),
            config.system_webhook_url.clone(),
            config.webhook_secret.clone(),
            config.system_events.clone(),
            config.system_metadata.clone(),
            None,
        );
        engine.subscribe(bridge);

        let preprocessor = Preprocessor::new(
            cache.clone(),
            catalog.clone(),
            engine.clone(),
            config.model_dir.clone(),
            config.input_dir.clone(),
            config.prepend_filenames,
        );

        let encoder = MediaEncoder::new(&config.encoder_bin, config.encoder_timeout);

        let orchestrator = Orchestrator::new(
            config.clone(),
            engine.clone(),
            preprocessor,
            registry,
            uploads,
            encoder,
            webhooks,
            telemetry.clone(),
        );

        let workflows = Arc::new(match &config.workflow_dir {
            Some(dir) => WorkflowRegistry::load_dir(dir),
            None => WorkflowRegistry::default(),
        });

        Ok(Arc::new(Self {
            config,
            orchestrator,
            engine,
            cache,
            catalog,
            workflows,
            telemetry,
            warm: AtomicBool::new(false),
        }))
    }

    /// Flip once boot (and the optional warmup prompt) finished
    pub fn mark_warm(&self) {
        self.warm.store(true, Ordering::Release);
    }

    pub fn is_warm(&self) -> bool {
        self.warm.load(Ordering::Acquire)
    }

    /// Readiness gate: warm, and below the configured queue depth
    pub fn is_ready(&self) -> bool {
        if !self.is_warm() {
            return false;
        }
        let max = self.config.max_queue_depth;
        max == 0 || self.engine.queue_remaining() < max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built_state() -> Arc<AppState> {
        let dir = std::env::temp_dir().join(format!("comfygate-state-{}", uuid::Uuid::new_v4()));
        let config = Config {
            model_dir: dir.join("models"),
            input_dir: dir.join("input"),
            output_dir: dir.join("output"),
            cache_dir: dir.join("cache"),
            ..Default::default()
        };
        AppState::build(config).expect("state")
    }

    #[tokio::test]
    async fn test_not_ready_until_warm() {
        let state = built_state();
        assert!(!state.is_ready());
        state.mark_warm();
        assert!(state.is_ready());
    }

    #[tokio::test]
    async fn test_ready_gate_respects_queue_depth() {
        let dir = std::env::temp_dir().join(format!("comfygate-state-{}", uuid::Uuid::new_v4()));
        let config = Config {
            model_dir: dir.join("models"),
            input_dir: dir.join("input"),
            output_dir: dir.join("output"),
            cache_dir: dir.join("cache"),
            max_queue_depth: 2,
            ..Default::default()
        };
        let state = AppState::build(config).expect("state");
        state.mark_warm();

        // queue_remaining starts at 0, below the limit of 2
        assert!(state.is_ready());
    }
}
