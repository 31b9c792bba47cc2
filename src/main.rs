// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2025 Comfygate Contributors

//! Gateway entry point
//!
//! Boot order: config, engine liveness wait, collaborator wiring,
//! WebSocket pump, optional warmup prompt, HTTP server. Exit code 0 on
//! clean shutdown, 1 when startup fails.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use comfygate::orchestrator::PromptRequest;
use comfygate::state::AppState;
use comfygate_kernel::config::Config;
use comfygate_kernel::logging;

/// HTTP gateway for a ComfyUI-style inference engine
#[derive(Debug, Parser)]
#[command(name = "comfygate", version, about)]
struct Args {
    /// Listen host
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Listen port
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Engine HTTP base URL
    #[arg(long, env = "COMFY_URL")]
    engine_url: Option<String>,
}

fn main() {
    logging::init_logging();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run()) {
        tracing::error!("gateway failed to start: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::from_env().context("configuration")?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(engine_url) = args.engine_url {
        config.engine_url = engine_url;
    }

    let state = AppState::build(config.clone()).context("wiring collaborators")?;

    // The engine boots slower than we do
    wait_for_engine(&state, config.startup_timeout)
        .await
        .context("engine did not come up")?;

    // One socket for the process lifetime
    let ws_url = config.ws_url_for(state.engine.client_id());
    tokio::spawn(
        state
            .engine
            .clone()
            .run_ws(ws_url, config.ws_reconnect),
    );

    if let Some(url) = &config.telemetry_url {
        let client = config.http_config.create_client()?;
        state
            .telemetry
            .spawn_reporter(client, url.clone(), config.telemetry_interval);
    }

    warmup(&state).await;
    state.mark_warm();

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(addr = %addr, "gateway listening");

    axum::serve(listener, comfygate::routes::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("gateway stopped");
    Ok(())
}

/// Poll the engine's HTTP endpoint until it answers or the budget runs out
async fn wait_for_engine(state: &Arc<AppState>, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if state.engine.ping().await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            anyhow::bail!("engine unreachable after {}s", timeout.as_secs());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Run the configured warmup prompt through the full pipeline so the first
/// real request doesn't pay model-load time. Failures are logged, not
/// fatal.
async fn warmup(state: &Arc<AppState>) {
    let raw = if let Some(path) = &state.config.warmup_prompt_file {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Some(raw),
            Err(e) => {
                tracing::warn!(file = %path.display(), "warmup prompt unreadable: {e}");
                None
            }
        }
    } else if let Some(url) = &state.config.warmup_prompt_url {
        match reqwest::get(url).await.and_then(|r| r.error_for_status()) {
            Ok(response) => response.text().await.ok(),
            Err(e) => {
                tracing::warn!(url = %url, "warmup prompt fetch failed: {e}");
                None
            }
        }
    } else {
        None
    };

    let Some(raw) = raw else { return };

    let request = match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(prompt) => serde_json::from_value::<PromptRequest>(serde_json::json!({
            "prompt": prompt
        })),
        Err(e) => {
            tracing::warn!("warmup prompt is not valid json: {e}");
            return;
        }
    };

    match request {
        Ok(request) => {
            tracing::info!("running warmup prompt");
            let started = Instant::now();
            match state.orchestrator.run(request).await {
                Ok(_) => tracing::info!(
                    duration_ms = started.elapsed().as_millis() as u64,
                    "warmup complete"
                ),
                Err(e) => tracing::warn!("warmup prompt failed: {e}"),
            }
        }
        Err(e) => tracing::warn!("warmup prompt does not parse as a graph: {e}"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
