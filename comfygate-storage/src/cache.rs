// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Deduplicating download cache
//!
//! Canonical copies live under the cache directory with UUID names and are
//! never deleted for the lifetime of the process. A second request for a
//! URL that is already being fetched awaits the first fetch's shared
//! future; at most one network fetch per URL is ever in flight. Files are
//! exposed to destination directories via hard links (symlink, then copy,
//! as fallbacks).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::future::{BoxFuture, FutureExt, Shared};

use comfygate_kernel::error::{GatewayError, Result};
use comfygate_kernel::logging::redact_secrets;

use crate::provider::{AuthSpec, StorageRegistry};

type FetchFuture = Shared<BoxFuture<'static, std::result::Result<PathBuf, Arc<GatewayError>>>>;

/// URL-keyed download cache with at-most-one in-flight fetch per URL
pub struct DownloadCache {
    cache_dir: PathBuf,
    registry: Arc<StorageRegistry>,
    entries: Mutex<HashMap<String, PathBuf>>,
    in_flight: Mutex<HashMap<String, FetchFuture>>,
    used_bytes: AtomicU64,
    max_bytes: Option<u64>,
    quota_warned: AtomicBool,
}

impl DownloadCache {
    pub fn new(cache_dir: PathBuf, registry: Arc<StorageRegistry>, max_bytes: Option<u64>) -> Self {
        Self {
            cache_dir,
            registry,
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            used_bytes: AtomicU64::new(0),
            max_bytes,
            quota_warned: AtomicBool::new(false),
        }
    }

    /// Fetch `url` (or reuse the cached copy) and expose it under
    /// `dest_dir/filename?`. Returns the destination path.
    pub async fn get(
        &self,
        url: &str,
        dest_dir: &Path,
        filename: Option<&str>,
        auth: Option<&AuthSpec>,
    ) -> Result<PathBuf> {
        // Fast path: already cached
        let cached = self.lock_entries().get(url).cloned();
        if let Some(canonical) = cached {
            return link_into(&canonical, dest_dir, filename, url);
        }

        let (fut, leader) = {
            let mut in_flight = self.lock_in_flight();
            match in_flight.get(url) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let fut = self.spawn_fetch(url.to_string(), auth.cloned());
                    in_flight.insert(url.to_string(), fut.clone());
                    (fut, true)
                }
            }
        };

        let result = fut.await;

        if leader {
            // Publish to `entries` before clearing `in_flight`: the URL must
            // stay discoverable through at least one of the two maps at every
            // instant, or a racing get() would dispatch a second fetch
            if let Ok(canonical) = &result {
                self.lock_entries()
                    .insert(url.to_string(), canonical.clone());
                self.account_usage(canonical);
            }
            self.lock_in_flight().remove(url);
        }

        let canonical = result.map_err(|e| e.shallow_clone())?;
        link_into(&canonical, dest_dir, filename, url)
    }

    /// Whether a URL is already cached
    pub fn contains(&self, url: &str) -> bool {
        self.lock_entries().contains_key(url)
    }

    fn spawn_fetch(&self, url: String, auth: Option<AuthSpec>) -> FetchFuture {
        let registry = self.registry.clone();
        let cache_dir = self.cache_dir.clone();

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            tokio::fs::create_dir_all(&cache_dir).await?;
            let provider = registry.provider_for(&url)?;
            let tmp_name = uuid::Uuid::new_v4().to_string();
            let path = provider
                .download(&url, &cache_dir, Some(&tmp_name), auth.as_ref())
                .await?;
            let bytes = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            tracing::info!(
                url = %redact_secrets(&url),
                bytes,
                duration_ms = started.elapsed().as_millis() as u64,
                provider = provider.name(),
                "download cached"
            );
            Ok::<_, GatewayError>(path)
        });

        async move {
            match handle.await {
                Ok(Ok(path)) => Ok(path),
                Ok(Err(e)) => Err(Arc::new(e)),
                Err(e) => Err(Arc::new(GatewayError::internal(format!(
                    "download task failed: {e}"
                )))),
            }
        }
        .boxed()
        .shared()
    }

    fn account_usage(&self, canonical: &Path) {
        let size = std::fs::metadata(canonical).map(|m| m.len()).unwrap_or(0);
        let used = self.used_bytes.fetch_add(size, Ordering::Relaxed) + size;
        if let Some(max) = self.max_bytes {
            if used > max && !self.quota_warned.swap(true, Ordering::Relaxed) {
                tracing::warn!(used, max, "download cache exceeds configured byte quota");
            }
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, PathBuf>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, FetchFuture>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Expose a canonical file under `dest_dir` with an optional rename.
/// Overwriting an existing link at the destination is idempotent.
fn link_into(
    canonical: &Path,
    dest_dir: &Path,
    filename: Option<&str>,
    url: &str,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dest_dir)?;

    let name = match filename {
        Some(n) => n.to_string(),
        None => derive_filename(url, canonical),
    };
    let dest = dest_dir.join(&name);

    if dest == canonical {
        return Ok(dest);
    }

    if std::fs::symlink_metadata(&dest).is_ok() {
        std::fs::remove_file(&dest)?;
    }

    if std::fs::hard_link(canonical, &dest).is_err() {
        #[cfg(unix)]
        let linked = std::os::unix::fs::symlink(canonical, &dest).is_ok();
        #[cfg(not(unix))]
        let linked = false;

        if !linked {
            std::fs::copy(canonical, &dest)?;
        }
    }

    Ok(dest)
}

/// Derive a destination file name from the URL path, falling back to the
/// canonical name; inherit the canonical extension when the URL has none
fn derive_filename(url: &str, canonical: &Path) -> String {
    let canonical_name = canonical
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let from_url = url::Url::parse(url).ok().and_then(|u| {
        u.path_segments()
            .and_then(|segments| segments.last().map(str::to_string))
            .map(|s| urlencoding::decode(&s).map(|d| d.to_string()).unwrap_or(s))
            .filter(|s| !s.is_empty())
    });

    match from_url {
        Some(mut name) => {
            if !name.contains('.') {
                if let Some(ext) = canonical.extension() {
                    name = format!("{}.{}", name, ext.to_string_lossy());
                }
            }
            name
        }
        None => canonical_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use tokio_util::sync::CancellationToken;

    use crate::provider::{StorageProvider, UploadSource};

    /// Counts real fetches; writes the URL as file content
    struct CountingProvider {
        fetches: AtomicU32,
        delay_ms: u64,
    }

    #[async_trait]
    impl StorageProvider for CountingProvider {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn test_url(&self, url: &str) -> bool {
            url.starts_with("test://")
        }

        async fn download(
            &self,
            url: &str,
            dest_dir: &Path,
            filename_override: Option<&str>,
            _auth: Option<&AuthSpec>,
        ) -> Result<PathBuf> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            let name = filename_override.unwrap_or("file.bin");
            let path = dest_dir.join(name);
            tokio::fs::write(&path, url.as_bytes()).await?;
            Ok(path)
        }

        async fn upload(
            &self,
            _url: &str,
            _source: UploadSource,
            _content_type: &str,
            _cancel: CancellationToken,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn cache_with(delay_ms: u64) -> (tempfile::TempDir, Arc<DownloadCache>, Arc<CountingProvider>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = Arc::new(CountingProvider {
            fetches: AtomicU32::new(0),
            delay_ms,
        });
        let registry = Arc::new(StorageRegistry::new(vec![provider.clone()]));
        let cache = Arc::new(DownloadCache::new(
            dir.path().join("cache"),
            registry,
            None,
        ));
        (dir, cache, provider)
    }

    #[tokio::test]
    async fn test_concurrent_gets_fetch_once() {
        let (dir, cache, provider) = cache_with(20);
        let dest = dir.path().join("dest");

        let mut tasks = Vec::new();
        for i in 0..8 {
            let cache = cache.clone();
            let dest = dest.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get(
                        "test://host/model.bin",
                        &dest,
                        Some(&format!("copy-{i}.bin")),
                        None,
                    )
                    .await
            }));
        }

        for task in tasks {
            let path = task.await.expect("join").expect("get");
            let content = std::fs::read_to_string(&path).expect("read");
            assert_eq!(content, "test://host/model.bin");
        }

        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_staggered_gets_across_completion_fetch_once() {
        // Arrivals straddle the moment the fetch resolves; the URL must be
        // discoverable via `entries` or `in_flight` at every instant, so
        // late joiners never become a second leader
        let (dir, cache, provider) = cache_with(10);
        let dest = dir.path().join("dest");

        let mut tasks = Vec::new();
        for i in 0..12 {
            let cache = cache.clone();
            let dest = dest.clone();
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(i * 2)).await;
                cache
                    .get("test://host/model.bin", &dest, Some(&format!("s-{i}.bin")), None)
                    .await
            }));
        }

        for task in tasks {
            let path = task.await.expect("join").expect("get");
            let content = std::fs::read_to_string(&path).expect("read");
            assert_eq!(content, "test://host/model.bin");
        }

        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_fetch() {
        let (dir, cache, provider) = cache_with(0);
        let dest = dir.path().join("dest");

        let first = cache.get("test://host/a.bin", &dest, None, None).await;
        assert!(first.is_ok());
        let second = cache.get("test://host/a.bin", &dest, None, None).await;
        assert!(second.is_ok());
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
        assert!(cache.contains("test://host/a.bin"));
    }

    #[tokio::test]
    async fn test_failed_download_clears_in_flight() {
        struct FailingProvider;

        #[async_trait]
        impl StorageProvider for FailingProvider {
            fn name(&self) -> &'static str {
                "failing"
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
                Err(GatewayError::Network {
                    message: "refused".to_string(),
                    source: None,
                })
            }

            async fn upload(
                &self,
                _url: &str,
                _source: UploadSource,
                _content_type: &str,
                _cancel: CancellationToken,
            ) -> Result<()> {
                Ok(())
            }
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(StorageRegistry::new(vec![Arc::new(FailingProvider)]));
        let cache = DownloadCache::new(dir.path().join("cache"), registry, None);

        let result = cache
            .get("test://host/x.bin", dir.path(), None, None)
            .await;
        assert!(result.is_err());
        assert!(!cache.contains("test://host/x.bin"));
        // In-flight entry must be gone so a retry dispatches a new fetch
        assert!(cache.lock_in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_link_overwrite_is_idempotent() {
        let (dir, cache, _provider) = cache_with(0);
        let dest = dir.path().join("dest");

        let a = cache
            .get("test://host/a.bin", &dest, Some("same.bin"), None)
            .await
            .expect("first");
        let b = cache
            .get("test://host/a.bin", &dest, Some("same.bin"), None)
            .await
            .expect("second");
        assert_eq!(a, b);
    }

    #[test]
    fn test_derive_filename_from_url() {
        let canonical = Path::new("/cache/0a1b.safetensors");
        assert_eq!(
            derive_filename("https://host/models/sd15.safetensors?x=1", canonical),
            "sd15.safetensors"
        );
        // Extensionless URL inherits the canonical extension
        assert_eq!(
            derive_filename("https://host/models/sd15", canonical),
            "sd15.safetensors"
        );
    }
}
