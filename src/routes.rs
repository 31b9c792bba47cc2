// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! HTTP surface
//!
//! `POST /prompt` and `POST /workflow/{name}` enter the orchestrator,
//! `POST /download` feeds the cache directly, and the probes gate
//! readiness on warmth plus engine queue depth. Errors serialize as
//! `{error, message, location?}` with the status the error kind maps to.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use comfygate_kernel::error::GatewayError;

use crate::orchestrator::PromptRequest;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/prompt", post(prompt_handler))
        .route("/workflow/:name", post(workflow_handler))
        .route("/download", post(download_handler))
        .route("/models", get(models_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Short machine-readable tag per error kind
fn error_tag(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::Validation { .. } => "validation",
        GatewayError::Auth { .. } => "auth",
        GatewayError::NotFound { .. } => "not_found",
        GatewayError::Network { .. } => "network",
        GatewayError::Api { .. } => "remote",
        GatewayError::Engine { .. } => "engine",
        GatewayError::Aborted => "aborted",
        GatewayError::Internal { .. } => "internal",
    }
}

fn error_response(err: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = json!({
        "error": error_tag(err),
        "message": err.to_string(),
    });
    if let Some(location) = err.location() {
        body["location"] = Value::String(location.to_string());
    }
    (status, Json(body)).into_response()
}

async fn run_prompt(state: Arc<AppState>, mut request: PromptRequest) -> Response {
    let id = request.ensure_id();

    if request.is_fire_and_forget() {
        // Results flow by webhook; acknowledge and run in the background
        let orchestrator = state.orchestrator.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.run(request).await {
                tracing::error!(id = %task_id, "background prompt failed: {e}");
            }
        });
        return (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "ok", "id": id })),
        )
            .into_response();
    }

    match state.orchestrator.run(request).await {
        Ok(response) => {
            if response.async_uploads {
                let mut body = serde_json::to_value(&response).unwrap_or_else(|_| json!({}));
                body["status"] = Value::String("ok".to_string());
                (StatusCode::ACCEPTED, Json(body)).into_response()
            } else {
                (StatusCode::OK, Json(response)).into_response()
            }
        }
        Err(err) => error_response(&err),
    }
}

async fn prompt_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PromptRequest>,
) -> Response {
    run_prompt(state, request).await
}

/// Body: the template's `input` object plus the usual delivery fields
async fn workflow_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(mut body): Json<Value>,
) -> Response {
    let Some(template) = state.workflows.get(&name) else {
        return error_response(&GatewayError::NotFound {
            message: format!("no workflow named {name}"),
        });
    };

    let input = body
        .as_object_mut()
        .and_then(|obj| obj.remove("input"))
        .unwrap_or(Value::Null);

    let prompt = match template.apply(&input) {
        Ok(prompt) => prompt,
        Err(err) => return error_response(&err),
    };

    let prompt_value = match serde_json::to_value(&prompt) {
        Ok(value) => value,
        Err(e) => return error_response(&GatewayError::internal(e.to_string())),
    };
    if let Some(obj) = body.as_object_mut() {
        obj.insert("prompt".to_string(), prompt_value);
    }

    match serde_json::from_value::<PromptRequest>(body) {
        Ok(request) => run_prompt(state, request).await,
        Err(e) => error_response(&GatewayError::validation(format!("invalid request: {e}"))),
    }
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: String,
    model_type: String,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    wait: bool,
}

async fn download_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DownloadRequest>,
) -> Response {
    let Some(dir) = state.catalog.dir_for(&request.model_type) else {
        return error_response(&GatewayError::validation(format!(
            "unknown model type {}",
            request.model_type
        )));
    };

    if request.wait {
        let started = Instant::now();
        match state
            .cache
            .get(&request.url, &dir, request.filename.as_deref(), None)
            .await
        {
            Ok(path) => {
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                state.catalog.add(&request.model_type, &dir, &filename);
                let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
                (
                    StatusCode::OK,
                    Json(json!({
                        "status": "completed",
                        "filename": filename,
                        "size": size,
                        "duration_ms": started.elapsed().as_millis() as u64,
                    })),
                )
                    .into_response()
            }
            // Download failures answer 400 whatever the underlying cause
            Err(err) => error_response(&GatewayError::validation(err.to_string())),
        }
    } else {
        // The filename must be known up front so the catalog can accept it
        // before the download lands
        let filename = match &request.filename {
            Some(name) => name.clone(),
            None => match url_basename(&request.url) {
                Some(name) => name,
                None => {
                    return error_response(&GatewayError::validation(
                        "filename is required when the URL path has none",
                    ))
                }
            },
        };

        state.catalog.add(&request.model_type, &dir, &filename);

        let cache = state.cache.clone();
        let catalog = state.catalog.clone();
        let url = request.url.clone();
        let model_type = request.model_type.clone();
        let filename_for_task = filename.clone();
        tokio::spawn(async move {
            if let Err(e) = cache.get(&url, &dir, Some(&filename_for_task), None).await {
                tracing::error!(url = %url, "background model download failed: {e}");
                catalog.remove(&model_type, &filename_for_task);
            }
        });

        (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "started", "filename": filename })),
        )
            .into_response()
    }
}

fn url_basename(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let name = parsed.path_segments()?.last()?.to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

async fn models_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.catalog.snapshot()).into_response()
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn ready_handler(State(state): State<Arc<AppState>>) -> Response {
    let queue_remaining = state.engine.queue_remaining();
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(json!({ "status": "ready", "queue_remaining": queue_remaining })),
        )
            .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not ready", "queue_remaining": queue_remaining })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_shapes() {
        let err = GatewayError::validation_at("bad input", "/3/inputs/image");
        let response = error_response(&err);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let err = GatewayError::Engine {
            message: "boom".to_string(),
        };
        assert_eq!(error_response(&err).status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_url_basename() {
        assert_eq!(
            url_basename("https://host/models/sd15.safetensors").as_deref(),
            Some("sd15.safetensors")
        );
        assert_eq!(url_basename("https://host/"), None);
    }

    #[test]
    fn test_error_tags() {
        assert_eq!(error_tag(&GatewayError::validation("x")), "validation");
        assert_eq!(
            error_tag(&GatewayError::Engine {
                message: "x".to_string()
            }),
            "engine"
        );
        assert_eq!(error_tag(&GatewayError::Aborted), "aborted");
    }
}
