// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Image transcoding
//!
//! PNG in both directions plus JPEG and WebP targets. Decoding and
//! encoding are CPU-bound and run under `spawn_blocking`.

use std::io::Cursor;

use image::ImageOutputFormat;

use comfygate_kernel::error::{GatewayError, Result};

/// Image output targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageTarget {
    Png,
    Jpeg,
    Webp,
}

impl ImageTarget {
    /// Parse a requested format name; `jpg` and `jpeg` are synonyms
    pub fn from_format(format: &str) -> Option<Self> {
        match format.to_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpeg" | "jpg" => Some(Self::Jpeg),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }

    /// File extension for the target
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Webp => "webp",
        }
    }

    fn output_format(&self, quality: u8) -> ImageOutputFormat {
        match self {
            Self::Png => ImageOutputFormat::Png,
            Self::Jpeg => ImageOutputFormat::Jpeg(quality),
            Self::Webp => ImageOutputFormat::WebP,
        }
    }
}

/// Re-encode image bytes into the target format
pub async fn transcode_image(bytes: Vec<u8>, target: ImageTarget, quality: u8) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let decoded = image::load_from_memory(&bytes).map_err(|e| {
            GatewayError::validation(format!("output is not a decodable image: {e}"))
        })?;

        // JPEG has no alpha channel
        let decoded = match target {
            ImageTarget::Jpeg => image::DynamicImage::ImageRgb8(decoded.to_rgb8()),
            _ => decoded,
        };

        let mut out = Cursor::new(Vec::new());
        decoded
            .write_to(&mut out, target.output_format(quality))
            .map_err(|e| GatewayError::internal(format!("image encode failed: {e}")))?;
        Ok(out.into_inner())
    })
    .await
    .map_err(|e| GatewayError::internal(format!("image transcode task failed: {e}")))?
}
