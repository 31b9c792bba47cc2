// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Upload lifecycle
//!
//! An [`Upload`] is a finite-state object: `InProgress` transitions once to
//! `Completed`, `Failed` or `Aborted`. Abort is idempotent from
//! `InProgress` and a no-op from any terminal state. The [`UploadManager`]
//! enforces supersession: registering a new upload for a URL aborts the
//! previous active one silently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use comfygate_kernel::error::{GatewayError, Result};

use crate::provider::{StorageProvider, UploadSource};

/// Upload lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    InProgress,
    Completed,
    Failed,
    Aborted,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        self != Self::InProgress
    }
}

/// One tracked upload
pub struct Upload {
    url: String,
    content_type: String,
    state_tx: watch::Sender<UploadState>,
    cancel: CancellationToken,
}

impl Upload {
    fn new(url: &str, content_type: &str) -> Arc<Self> {
        let (state_tx, _) = watch::channel(UploadState::InProgress);
        Arc::new(Self {
            url: url.to_string(),
            content_type: content_type.to_string(),
            state_tx,
            cancel: CancellationToken::new(),
        })
    }

    /// Destination URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Content type sent with the upload
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Current state
    pub fn state(&self) -> UploadState {
        *self.state_tx.borrow()
    }

    /// Cancellation token handed to the provider
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Abort: only meaningful while `InProgress`; never an error
    pub fn abort(&self) {
        self.state_tx.send_if_modified(|state| {
            if *state == UploadState::InProgress {
                *state = UploadState::Aborted;
                true
            } else {
                false
            }
        });
        // Fire the token regardless; cancelling a finished token is harmless
        if self.state() == UploadState::Aborted {
            self.cancel.cancel();
        }
    }

    fn transition(&self, to: UploadState) {
        self.state_tx.send_if_modified(|state| {
            if *state == UploadState::InProgress {
                *state = to;
                true
            } else {
                false
            }
        });
    }

    /// Wait for a terminal state
    pub async fn wait(&self) -> UploadState {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return *self.state_tx.borrow();
            }
        }
    }
}

/// Tracks active uploads by destination URL
#[derive(Default)]
pub struct UploadManager {
    active: Mutex<HashMap<String, Arc<Upload>>>,
}

impl UploadManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new upload for `url`, aborting any active one to the same
    /// URL (supersession is silent by contract)
    pub fn begin(&self, url: &str, content_type: &str) -> Arc<Upload> {
        let upload = Upload::new(url, content_type);
        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(prev) = active.get(url) {
            prev.abort();
        }
        active.insert(url.to_string(), upload.clone());
        upload
    }

    /// Drive one upload through a provider, translating abort into a silent
    /// terminal state rather than an error
    pub async fn run(
        &self,
        provider: Arc<dyn StorageProvider>,
        upload: Arc<Upload>,
        source: UploadSource,
    ) -> Result<()> {
        let result = provider
            .upload(
                upload.url(),
                source,
                upload.content_type(),
                upload.cancel_token(),
            )
            .await;

        let outcome = match result {
            Ok(()) => {
                upload.transition(UploadState::Completed);
                Ok(())
            }
            Err(GatewayError::Aborted) => {
                upload.transition(UploadState::Aborted);
                Ok(())
            }
            Err(e) => {
                upload.transition(UploadState::Failed);
                Err(e)
            }
        };

        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Only remove if this is still the registered upload; a superseding
        // upload may have replaced the slot already
        if let Some(current) = active.get(upload.url()) {
            if Arc::ptr_eq(current, &upload) {
                active.remove(upload.url());
            }
        }

        outcome
    }

    /// Number of uploads currently in progress
    pub fn in_progress(&self) -> usize {
        let active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        active
            .values()
            .filter(|u| u.state() == UploadState::InProgress)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};

    use crate::provider::AuthSpec;

    struct SlowProvider;

    #[async_trait]
    impl StorageProvider for SlowProvider {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn test_url(&self, _url: &str) -> bool {
            true
        }

        async fn download(
            &self,
            _url: &str,
            _dest_dir: &Path,
            _filename_override: Option<&str>,
            _auth: Option<&AuthSpec>,
        ) -> Result<PathBuf> {
            Ok(PathBuf::new())
        }

        async fn upload(
            &self,
            _url: &str,
            _source: UploadSource,
            _content_type: &str,
            cancel: CancellationToken,
        ) -> Result<()> {
            tokio::select! {
                _ = cancel.cancelled() => Err(GatewayError::Aborted),
                _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => Ok(()),
            }
        }
    }

    #[test]
    fn test_abort_is_idempotent() {
        let upload = Upload::new("https://example.com/a", "image/png");
        upload.abort();
        assert_eq!(upload.state(), UploadState::Aborted);
        upload.abort();
        assert_eq!(upload.state(), UploadState::Aborted);
    }

    #[test]
    fn test_abort_noop_after_completion() {
        let upload = Upload::new("https://example.com/a", "image/png");
        upload.transition(UploadState::Completed);
        upload.abort();
        assert_eq!(upload.state(), UploadState::Completed);
    }

    #[tokio::test]
    async fn test_supersession_aborts_previous() {
        let manager = UploadManager::new();
        let first = manager.begin("https://example.com/out.png", "image/png");
        let second = manager.begin("https://example.com/out.png", "image/png");

        assert_eq!(first.state(), UploadState::Aborted);
        assert_eq!(second.state(), UploadState::InProgress);
    }

    #[tokio::test]
    async fn test_run_completes() {
        let manager = UploadManager::new();
        let upload = manager.begin("https://example.com/out.png", "image/png");
        let result = manager
            .run(
                Arc::new(SlowProvider),
                upload.clone(),
                UploadSource::Bytes(vec![1, 2, 3]),
            )
            .await;
        assert!(result.is_ok());
        assert_eq!(upload.state(), UploadState::Completed);
        assert_eq!(manager.in_progress(), 0);
    }

    #[tokio::test]
    async fn test_run_aborted_is_silent() {
        let manager = UploadManager::new();
        let upload = manager.begin("https://example.com/out.png", "image/png");
        let task = tokio::spawn({
            let upload = upload.clone();
            let provider: Arc<dyn StorageProvider> = Arc::new(SlowProvider);
            let manager = UploadManager::new();
            async move {
                manager
                    .run(provider, upload, UploadSource::Bytes(vec![0]))
                    .await
            }
        });

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        upload.abort();

        let result = task.await.unwrap_or(Ok(()));
        assert!(result.is_ok());
        assert_eq!(upload.wait().await, UploadState::Aborted);
    }
}
