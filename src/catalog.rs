// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Model catalog
//!
//! One entry per model type (the subdirectories of the engine's model
//! root), each an ordered set of filenames. The preprocessor grows the
//! catalog when it downloads a new model mid-request so the filename
//! validates immediately afterwards. Readers get consistent snapshots;
//! they tolerate growth.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// One model type: its directory and the known filenames
#[derive(Debug, Clone, Default)]
pub struct ModelType {
    pub dir: PathBuf,
    pub all: BTreeSet<String>,
}

/// Per-type model filename catalog
#[derive(Debug, Default)]
pub struct ModelCatalog {
    types: RwLock<BTreeMap<String, ModelType>>,
}

impl ModelCatalog {
    /// Scan the engine's model root; every subdirectory becomes a type
    pub fn scan(model_root: &Path) -> Self {
        let mut types = BTreeMap::new();

        if let Ok(entries) = std::fs::read_dir(model_root) {
            for entry in entries.flatten() {
                let dir = entry.path();
                if !dir.is_dir() {
                    continue;
                }
                let Some(name) = dir.file_name().map(|n| n.to_string_lossy().to_string()) else {
                    continue;
                };

                let mut all = BTreeSet::new();
                if let Ok(files) = std::fs::read_dir(&dir) {
                    for file in files.flatten() {
                        if file.path().is_file() {
                            all.insert(file.file_name().to_string_lossy().to_string());
                        }
                    }
                }
                types.insert(name, ModelType { dir, all });
            }
        } else {
            tracing::warn!(root = %model_root.display(), "model root is not readable");
        }

        Self {
            types: RwLock::new(types),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, ModelType>> {
        match self.types.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, ModelType>> {
        match self.types.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Directory for a model type; `None` when the type is unknown
    pub fn dir_for(&self, model_type: &str) -> Option<PathBuf> {
        self.read().get(model_type).map(|t| t.dir.clone())
    }

    /// Record a filename under a type. Unknown types are created on the
    /// fly with the given directory so `/download` into a fresh layout
    /// works.
    pub fn add(&self, model_type: &str, dir: &Path, filename: &str) {
        let mut types = self.write();
        let entry = types.entry(model_type.to_string()).or_insert_with(|| ModelType {
            dir: dir.to_path_buf(),
            all: BTreeSet::new(),
        });
        entry.all.insert(filename.to_string());
    }

    /// Remove a filename (failed async download rollback)
    pub fn remove(&self, model_type: &str, filename: &str) {
        if let Some(entry) = self.write().get_mut(model_type) {
            entry.all.remove(filename);
        }
    }

    pub fn contains(&self, model_type: &str, filename: &str) -> bool {
        self.read()
            .get(model_type)
            .map(|t| t.all.contains(filename))
            .unwrap_or(false)
    }

    /// Consistent snapshot: type -> ordered filename list
    pub fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.read()
            .iter()
            .map(|(name, t)| (name.clone(), t.all.iter().cloned().collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_catalog() -> (tempfile::TempDir, ModelCatalog) {
        let root = tempfile::tempdir().expect("tempdir");
        let checkpoints = root.path().join("checkpoints");
        std::fs::create_dir_all(&checkpoints).expect("mkdir");
        std::fs::write(checkpoints.join("sd15.safetensors"), b"w").expect("write");
        std::fs::create_dir_all(root.path().join("loras")).expect("mkdir");
        let catalog = ModelCatalog::scan(root.path());
        (root, catalog)
    }

    #[test]
    fn test_scan_discovers_types_and_files() {
        let (_root, catalog) = seeded_catalog();
        assert!(catalog.dir_for("checkpoints").is_some());
        assert!(catalog.dir_for("loras").is_some());
        assert!(catalog.dir_for("vae").is_none());
        assert!(catalog.contains("checkpoints", "sd15.safetensors"));
    }

    #[test]
    fn test_add_grows_snapshot() {
        let (root, catalog) = seeded_catalog();
        let dir = root.path().join("checkpoints");
        catalog.add("checkpoints", &dir, "turbo.safetensors");

        assert!(catalog.contains("checkpoints", "turbo.safetensors"));
        let snapshot = catalog.snapshot();
        assert_eq!(
            snapshot.get("checkpoints").map(Vec::len),
            Some(2),
            "snapshot: {snapshot:?}"
        );
    }

    #[test]
    fn test_remove_rolls_back() {
        let (root, catalog) = seeded_catalog();
        let dir = root.path().join("checkpoints");
        catalog.add("checkpoints", &dir, "broken.safetensors");
        catalog.remove("checkpoints", "broken.safetensors");
        assert!(!catalog.contains("checkpoints", "broken.safetensors"));
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let (root, catalog) = seeded_catalog();
        let dir = root.path().join("checkpoints");
        catalog.add("checkpoints", &dir, "a.safetensors");
        catalog.add("checkpoints", &dir, "z.safetensors");

        let snapshot = catalog.snapshot();
        let files = snapshot.get("checkpoints").cloned().unwrap_or_default();
        let mut sorted = files.clone();
        sorted.sort();
        assert_eq!(files, sorted);
    }
}
