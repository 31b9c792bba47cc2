// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! Outbound webhooks
//!
//! v1 webhooks (deprecated) POST one unsigned payload per output file.
//! v2 webhooks POST one payload per lifecycle event, signed with
//! HMAC-SHA256 over `<id>.<timestamp>.<body>` keyed by the base64-decoded
//! secret, carried in `webhook-id` / `webhook-timestamp` /
//! `webhook-signature` headers. Both retry on a monotonic backoff with a
//! fixed budget and log-only on final failure.

use std::time::Duration;

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;

use comfygate_kernel::error::{GatewayError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Signature header scheme tag
const SIGNATURE_VERSION: &str = "v1";

/// Payload of a v1 per-file webhook
#[derive(Debug, Clone, Serialize)]
pub struct OutputCompleteV1 {
    pub event: &'static str,
    /// Base64 of the file bytes
    pub image: String,
    pub id: String,
    pub filename: String,
    pub prompt: Value,
    pub stats: Value,
}

impl OutputCompleteV1 {
    pub fn new(id: &str, filename: &str, bytes: &[u8], prompt: Value, stats: Value) -> Self {
        Self {
            event: "output.complete",
            image: base64::engine::general_purpose::STANDARD.encode(bytes),
            id: id.to_string(),
            filename: filename.to_string(),
            prompt,
            stats,
        }
    }
}

/// Retry budget for webhook POSTs
#[derive(Debug, Clone)]
pub struct WebhookRetry {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for WebhookRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Webhook sender shared by the orchestrator and the event bridge
#[derive(Clone)]
pub struct WebhookSender {
    client: reqwest::Client,
    retry: WebhookRetry,
}

impl WebhookSender {
    pub fn new(client: reqwest::Client, retry: WebhookRetry) -> Self {
        Self { client, retry }
    }

    /// POST a v1 payload; unsigned by design
    pub async fn send_v1(&self, url: &str, payload: &OutputCompleteV1) -> Result<()> {
        let body = serde_json::to_string(payload)?;
        self.post_with_retry(url, body, None).await
    }

    /// POST a v2 payload with signature headers. `event` lands in the body
    /// as `"event"`, merged over the payload object.
    pub async fn send_v2(
        &self,
        url: &str,
        secret_b64: Option<&str>,
        event: &str,
        payload: Value,
    ) -> Result<()> {
        let mut body_value = payload;
        if let Some(obj) = body_value.as_object_mut() {
            obj.insert("event".to_string(), Value::String(event.to_string()));
        }
        let body = serde_json::to_string(&body_value)?;

        let headers = match secret_b64 {
            Some(secret) => {
                let id = uuid::Uuid::new_v4().to_string();
                let timestamp = chrono::Utc::now().timestamp();
                let signature = sign_payload(secret, &id, timestamp, &body)?;
                Some((id, timestamp, signature))
            }
            None => None,
        };

        self.post_with_retry(url, body, headers).await
    }

    async fn post_with_retry(
        &self,
        url: &str,
        body: String,
        signature: Option<(String, i64, String)>,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut request = self
                .client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
            if let Some((id, timestamp, sig)) = &signature {
                request = request
                    .header("webhook-id", id)
                    .header("webhook-timestamp", timestamp.to_string())
                    .header("webhook-signature", format!("{SIGNATURE_VERSION},{sig}"));
            }

            let outcome = match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let text = response.text().await.unwrap_or_default();
                    GatewayError::Api {
                        message: format!("webhook endpoint answered {status}: {text}"),
                        status: Some(status),
                    }
                }
                Err(e) => GatewayError::Network {
                    message: format!("webhook delivery failed: {e}"),
                    source: Some(e),
                },
            };

            if attempt >= self.retry.max_attempts {
                tracing::error!(url, attempt, "webhook delivery gave up: {outcome}");
                return Err(outcome);
            }

            // Monotonic backoff: base, 2x base, 3x base, ...
            let delay = self.retry.base_delay * attempt;
            tracing::debug!(url, attempt, delay_ms = delay.as_millis() as u64, "webhook retry");
            tokio::time::sleep(delay).await;
        }
    }
}

/// HMAC-SHA256 over `<id>.<timestamp>.<body>`, keyed by the
/// base64-decoded secret, base64-encoded
pub fn sign_payload(secret_b64: &str, id: &str, timestamp: i64, body: &str) -> Result<String> {
    let key = base64::engine::general_purpose::STANDARD
        .decode(secret_b64)
        .map_err(|e| GatewayError::validation(format!("webhook secret is not base64: {e}")))?;

    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| GatewayError::internal(format!("hmac key rejected: {e}")))?;
    mac.update(format!("{id}.{timestamp}.{body}").as_bytes());

    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_matches_reference() {
        // Known-answer check computed with the same primitives: the point
        // here is stability of the <id>.<ts>.<body> layout and key decode
        let secret = base64::engine::general_purpose::STANDARD.encode(b"super-secret-key");
        let signature = sign_payload(&secret, "X", 1_700_000_000, r#"{"a":1}"#).expect("sign");

        let mut mac = HmacSha256::new_from_slice(b"super-secret-key").expect("mac");
        mac.update(br#"X.1700000000.{"a":1}"#);
        let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        assert_eq!(signature, expected);
    }

    #[test]
    fn test_signature_depends_on_every_part() {
        let secret = base64::engine::general_purpose::STANDARD.encode(b"k");
        let base = sign_payload(&secret, "id", 1, "body").expect("sign");
        assert_ne!(base, sign_payload(&secret, "id2", 1, "body").expect("sign"));
        assert_ne!(base, sign_payload(&secret, "id", 2, "body").expect("sign"));
        assert_ne!(base, sign_payload(&secret, "id", 1, "body2").expect("sign"));
    }

    #[test]
    fn test_bad_secret_is_validation_error() {
        let err = sign_payload("not//valid base64!!", "id", 1, "body").err();
        assert_eq!(err.map(|e| e.http_status()), Some(400));
    }

    #[test]
    fn test_v1_payload_shape() {
        let payload = OutputCompleteV1::new(
            "T1",
            "T1_00001_.png",
            &[1, 2, 3],
            serde_json::json!({}),
            serde_json::json!({"total_ms": 10}),
        );
        let value = serde_json::to_value(&payload).expect("encode");
        assert_eq!(
            value.get("event").and_then(Value::as_str),
            Some("output.complete")
        );
        assert_eq!(value.get("filename").and_then(Value::as_str), Some("T1_00001_.png"));
        assert_eq!(
            value.get("image").and_then(Value::as_str),
            Some(base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]).as_str())
        );
    }

    #[test]
    fn test_retry_defaults() {
        let retry = WebhookRetry::default();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.base_delay.as_millis(), 500);
    }
}
