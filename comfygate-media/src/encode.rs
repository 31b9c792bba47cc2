// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Audio/video transcoding via an external encoder subprocess
//!
//! The encoder binary (ffmpeg-compatible) is configured, not bundled. One
//! invocation per file, input and output through temp files, killed when
//! the wall-clock budget runs out.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;

use comfygate_kernel::error::{GatewayError, Result};

/// Extensions routed to the media encoder rather than the image encoder
const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "webm", "mov", "avi", "mkv", "m4v", "mp3", "wav", "ogg", "flac", "m4a", "aac", "opus",
];

/// True when a filename extension names an audio/video container
pub fn is_media_extension(ext: &str) -> bool {
    MEDIA_EXTENSIONS.contains(&ext.to_lowercase().as_str())
}

/// Requested encoder options (all optional)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EncodeOptions {
    /// Output frame rate
    pub fps: Option<u32>,
    /// Codec override (`libx264`, `libvpx-vp9`, ...)
    pub codec: Option<String>,
    /// Target bitrate (`2M`, `192k`, ...)
    pub bitrate: Option<String>,
    /// Constant rate factor
    pub crf: Option<u32>,
    /// Encoder preset (`fast`, `veryslow`, ...)
    pub preset: Option<String>,
    /// Audio sample frequency in Hz
    pub frequency: Option<u32>,
}

/// External encoder wrapper
#[derive(Debug, Clone)]
pub struct MediaEncoder {
    bin: String,
    timeout: Duration,
}

impl MediaEncoder {
    pub fn new(bin: &str, timeout: Duration) -> Self {
        Self {
            bin: bin.to_string(),
            timeout,
        }
    }

    /// Transcode `bytes` (with original extension `input_ext`) into
    /// `target_format`, returning the re-encoded bytes
    pub async fn transcode(
        &self,
        bytes: Vec<u8>,
        input_ext: &str,
        target_format: &str,
        options: &EncodeOptions,
    ) -> Result<Vec<u8>> {
        let work_dir = std::env::temp_dir();
        let stem = uuid::Uuid::new_v4();
        let input_path = work_dir.join(format!("comfygate-enc-{stem}.{input_ext}"));
        let output_path = work_dir.join(format!("comfygate-enc-{stem}-out.{target_format}"));

        tokio::fs::write(&input_path, &bytes).await?;

        let result = self
            .run_encoder(&input_path, &output_path, target_format, options)
            .await;

        let _ = tokio::fs::remove_file(&input_path).await;

        let output = match result {
            Ok(()) => tokio::fs::read(&output_path).await.map_err(|e| {
                GatewayError::internal(format!("encoder produced no output: {e}"))
            }),
            Err(e) => Err(e),
        };
        let _ = tokio::fs::remove_file(&output_path).await;

        output
    }

    async fn run_encoder(
        &self,
        input: &PathBuf,
        output: &PathBuf,
        target_format: &str,
        options: &EncodeOptions,
    ) -> Result<()> {
        let mut args: Vec<String> = vec![
            "-y".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
        ];
        args.extend(codec_args(target_format, options));
        args.push(output.to_string_lossy().to_string());

        tracing::debug!(bin = %self.bin, ?args, "running media encoder");

        let mut child = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::internal(format!("failed to spawn {}: {e}", self.bin)))?;

        let stderr = child.stderr.take();

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(GatewayError::internal(format!(
                    "encoder exceeded {}ms budget",
                    self.timeout.as_millis()
                )));
            }
        };

        if !status.success() {
            let mut detail = String::new();
            if let Some(mut stderr) = stderr {
                use tokio::io::AsyncReadExt;
                let _ = stderr.read_to_string(&mut detail).await;
            }
            // ffmpeg stderr is verbose; keep the tail
            let tail: String = detail
                .lines()
                .rev()
                .take(4)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join(" | ");
            return Err(GatewayError::internal(format!(
                "encoder exited with {status}: {tail}"
            )));
        }

        Ok(())
    }
}

/// Encoder arguments per target container
fn codec_args(target_format: &str, options: &EncodeOptions) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    match target_format {
        "mp4" => {
            args.push("-c:v".to_string());
            args.push(options.codec.clone().unwrap_or_else(|| "libx264".to_string()));
            args.push("-pix_fmt".to_string());
            args.push("yuv420p".to_string());
        }
        "webm" => {
            args.push("-c:v".to_string());
            args.push(
                options
                    .codec
                    .clone()
                    .unwrap_or_else(|| "libvpx-vp9".to_string()),
            );
        }
        "mp3" => {
            args.push("-c:a".to_string());
            args.push(
                options
                    .codec
                    .clone()
                    .unwrap_or_else(|| "libmp3lame".to_string()),
            );
        }
        "wav" => {
            args.push("-c:a".to_string());
            args.push(options.codec.clone().unwrap_or_else(|| "pcm_s16le".to_string()));
        }
        "ogg" => {
            args.push("-c:a".to_string());
            args.push(
                options
                    .codec
                    .clone()
                    .unwrap_or_else(|| "libvorbis".to_string()),
            );
        }
        _ => {
            if let Some(codec) = &options.codec {
                args.push("-c".to_string());
                args.push(codec.clone());
            }
        }
    }

    if let Some(fps) = options.fps {
        args.push("-r".to_string());
        args.push(fps.to_string());
    }
    if let Some(crf) = options.crf {
        args.push("-crf".to_string());
        args.push(crf.to_string());
    }
    if let Some(preset) = &options.preset {
        args.push("-preset".to_string());
        args.push(preset.clone());
    }
    if let Some(bitrate) = &options.bitrate {
        let flag = if matches!(target_format, "mp3" | "wav" | "ogg") {
            "-b:a"
        } else {
            "-b:v"
        };
        args.push(flag.to_string());
        args.push(bitrate.clone());
    }
    if let Some(frequency) = options.frequency {
        args.push("-ar".to_string());
        args.push(frequency.to_string());
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_media_extension() {
        assert!(is_media_extension("mp4"));
        assert!(is_media_extension("WAV"));
        assert!(is_media_extension("webm"));
        assert!(!is_media_extension("png"));
        assert!(!is_media_extension("jpeg"));
    }

    #[test]
    fn test_codec_args_mp4_defaults() {
        let args = codec_args("mp4", &EncodeOptions::default());
        assert!(args.contains(&"libx264".to_string()));
        assert!(args.contains(&"yuv420p".to_string()));
    }

    #[test]
    fn test_codec_args_respects_overrides() {
        let options = EncodeOptions {
            fps: Some(24),
            codec: Some("libx265".to_string()),
            bitrate: Some("2M".to_string()),
            crf: Some(23),
            preset: Some("fast".to_string()),
            frequency: None,
        };
        let args = codec_args("mp4", &options);
        assert!(args.contains(&"libx265".to_string()));
        assert!(args.windows(2).any(|w| w == ["-r", "24"]));
        assert!(args.windows(2).any(|w| w == ["-crf", "23"]));
        assert!(args.windows(2).any(|w| w == ["-b:v", "2M"]));
        assert!(args.windows(2).any(|w| w == ["-preset", "fast"]));
    }

    #[test]
    fn test_codec_args_audio_bitrate_flag() {
        let options = EncodeOptions {
            bitrate: Some("192k".to_string()),
            frequency: Some(44_100),
            ..Default::default()
        };
        let args = codec_args("mp3", &options);
        assert!(args.windows(2).any(|w| w == ["-b:a", "192k"]));
        assert!(args.windows(2).any(|w| w == ["-ar", "44100"]));
        assert!(args.contains(&"libmp3lame".to_string()));
    }

    #[tokio::test]
    async fn test_missing_encoder_binary_errors() {
        let encoder = MediaEncoder::new(
            "definitely-not-a-real-encoder",
            Duration::from_millis(1_000),
        );
        let result = encoder
            .transcode(vec![0u8; 16], "mp4", "webm", &EncodeOptions::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_timeout_kills_encoder() {
        // `sleep` stands in for a hung encoder; args are nonsense to it but
        // it ignores them and blocks past the budget
        let encoder = MediaEncoder::new("sleep", Duration::from_millis(50));
        let result = encoder
            .transcode(vec![0u8; 16], "mp4", "webm", &EncodeOptions::default())
            .await;
        let message = result.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(message.contains("budget") || message.contains("exited"));
    }
}
