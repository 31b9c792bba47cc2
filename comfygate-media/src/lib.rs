// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! Media I/O for the gateway
//!
//! Base64 payload sniffing, image transcoding, audio/video transcoding via
//! an external encoder subprocess, and zip archiving of output sets.

pub mod archive;
pub mod encode;
pub mod image_ops;
pub mod sniff;

pub use archive::zip_outputs;
pub use encode::{is_media_extension, EncodeOptions, MediaEncoder};
pub use image_ops::{transcode_image, ImageTarget};
pub use sniff::{decode_base64_payload, sniff_extension};
