// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Base64 payload decoding and magic-byte format detection
//!
//! Inline graph inputs arrive as raw base64 or `data:` URLs. The decoded
//! bytes are sniffed against magic-byte signatures (images, video, audio,
//! archives, documents, fonts) with an ASCII-printability heuristic as the
//! text fallback.

use base64::Engine;

/// Minimum decoded size considered a real payload rather than a short
/// string that happens to decode
const MIN_PAYLOAD_BYTES: usize = 8;

/// Decode a base64 (or `data:` URL) payload and sniff its extension.
/// Returns `None` when the string is not a plausible payload - callers
/// treat those values as filesystem paths.
pub fn decode_base64_payload(value: &str) -> Option<(Vec<u8>, String)> {
    let raw = match value.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => value,
    };

    // Cheap rejection before attempting a decode
    if raw.len() < 16 || raw.contains('.') || raw.contains('/') && raw.contains(' ') {
        return None;
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(raw.trim()))
        .ok()?;

    if bytes.len() < MIN_PAYLOAD_BYTES {
        return None;
    }

    let ext = sniff_extension(&bytes)?;
    Some((bytes, ext))
}

/// Infer a file extension from leading bytes
pub fn sniff_extension(bytes: &[u8]) -> Option<String> {
    if let Some(kind) = infer::get(bytes) {
        return Some(kind.extension().to_string());
    }

    // WAV/AVI share the RIFF prefix; infer handles them, but a bare RIFF
    // header without a known subtype still deserves a name
    if bytes.starts_with(b"RIFF") {
        return Some("bin".to_string());
    }

    if is_printable_ascii(bytes) {
        return Some("txt".to_string());
    }

    None
}

/// Printable-ASCII heuristic for text payloads: everything is either a
/// printable byte or common whitespace
fn is_printable_ascii(bytes: &[u8]) -> bool {
    !bytes.is_empty()
        && bytes
            .iter()
            .all(|&b| (0x20..=0x7e).contains(&b) || b == b'\n' || b == b'\r' || b == b'\t')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    /// Canonical magic prefixes round-trip through base64 to their format
    #[test]
    fn test_magic_prefix_round_trip() {
        let cases: &[(&[u8], &str)] = &[
            (b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR\x00\x00", "png"),
            (b"\xff\xd8\xff\xe0\x00\x10JFIF\x00\x01\x02\x03", "jpg"),
            (b"GIF89a\x01\x00\x01\x00\x80\x00\x00\xff\xff\xff", "gif"),
            (b"RIFF\x24\x00\x00\x00WEBPVP8 \x00\x00\x00\x00", "webp"),
            (b"RIFF\x24\x00\x00\x00WAVEfmt \x10\x00\x00\x00", "wav"),
            (b"\x1aE\xdf\xa3\x42\x82\x88matroska\x00\x00\x00", "mkv"),
            (b"OggS\x00\x02\x00\x00\x00\x00\x00\x00\x00\x00", "ogg"),
            (b"PK\x03\x04\x14\x00\x00\x00\x08\x00\x00\x00", "zip"),
            (b"%PDF-1.7\n%\xe2\xe3\xcf\xd3\n1 0 obj", "pdf"),
            (b"ID3\x04\x00\x00\x00\x00\x00\x00\x00\x00", "mp3"),
        ];

        for (magic, expected) in cases {
            let encoded = b64(magic);
            let (bytes, ext) = decode_base64_payload(&encoded)
                .unwrap_or_else(|| panic!("no sniff for {expected}"));
            assert_eq!(&ext, expected, "wrong extension for {expected}");
            assert_eq!(&bytes, magic);
        }
    }

    #[test]
    fn test_mp4_ftyp_detected() {
        let bytes = b"\x00\x00\x00\x18ftypisom\x00\x00\x02\x00isomiso2";
        assert_eq!(sniff_extension(bytes).as_deref(), Some("mp4"));
    }

    #[test]
    fn test_data_url_prefix_stripped() {
        let payload = format!(
            "data:image/png;base64,{}",
            b64(b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR")
        );
        let (_, ext) = decode_base64_payload(&payload).expect("decode");
        assert_eq!(ext, "png");
    }

    #[test]
    fn test_printable_text_heuristic() {
        let encoded = b64(b"a plain prompt with words and punctuation, nothing binary.");
        let (_, ext) = decode_base64_payload(&encoded).expect("decode");
        assert_eq!(ext, "txt");
    }

    #[test]
    fn test_filenames_are_not_payloads() {
        assert!(decode_base64_payload("example.png").is_none());
        assert!(decode_base64_payload("subdir/example.png").is_none());
        assert!(decode_base64_payload("short").is_none());
    }

    #[test]
    fn test_binary_garbage_without_signature() {
        let encoded = b64(&[0x01, 0x02, 0x03, 0x80, 0x81, 0x82, 0x90, 0x91, 0x92, 0xa0]);
        assert!(decode_base64_payload(&encoded).is_none());
    }
}
