// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Zip archiving of output file sets

use std::collections::BTreeMap;
use std::io::{Cursor, Write};

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use comfygate_kernel::error::{GatewayError, Result};

/// Archive name used when `compress_outputs` is requested
pub const ARCHIVE_NAME: &str = "outputs.zip";

/// Pack all output files into one deflate archive at maximum compression.
/// Entries are written in filename order so identical inputs produce
/// identical archives.
pub async fn zip_outputs(files: BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(9));

        for (name, bytes) in &files {
            writer
                .start_file(name.as_str(), options)
                .map_err(|e| GatewayError::internal(format!("zip entry {name} failed: {e}")))?;
            writer
                .write_all(bytes)
                .map_err(|e| GatewayError::internal(format!("zip write {name} failed: {e}")))?;
        }

        let cursor = writer
            .finish()
            .map_err(|e| GatewayError::internal(format!("zip finish failed: {e}")))?;
        Ok(cursor.into_inner())
    })
    .await
    .map_err(|e| GatewayError::internal(format!("zip task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[tokio::test]
    async fn test_zip_contains_all_entries() {
        let mut files = BTreeMap::new();
        files.insert("a.png".to_string(), vec![1u8; 256]);
        files.insert("b.png".to_string(), vec![2u8; 256]);

        let bytes = zip_outputs(files).await.expect("zip");
        assert_eq!(&bytes[..2], b"PK");

        let mut archive =
            zip::ZipArchive::new(Cursor::new(bytes)).expect("read archive");
        assert_eq!(archive.len(), 2);

        let mut entry = archive.by_name("a.png").expect("entry a");
        let mut content = Vec::new();
        entry.read_to_end(&mut content).expect("read entry");
        assert_eq!(content, vec![1u8; 256]);
    }

    #[tokio::test]
    async fn test_empty_set_yields_empty_archive() {
        let bytes = zip_outputs(BTreeMap::new()).await.expect("zip");
        let archive = zip::ZipArchive::new(Cursor::new(bytes)).expect("read archive");
        assert_eq!(archive.len(), 0);
    }

    #[tokio::test]
    async fn test_deterministic_output() {
        let mut files = BTreeMap::new();
        files.insert("z.png".to_string(), vec![9u8; 64]);
        files.insert("a.png".to_string(), vec![3u8; 64]);

        let first = zip_outputs(files.clone()).await.expect("zip");
        let second = zip_outputs(files).await.expect("zip");
        assert_eq!(first, second);
    }
}
