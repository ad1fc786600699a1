//! HTTP surface for the pipeline.
//!
//! One endpoint matters: `POST /api/optimize` starts (or resumes) a run and
//! replies with a Server-Sent-Events stream of pipeline events, terminating
//! in exactly one terminal event. Request-shape problems are 4xx client
//! errors — absence of usable input text is the caller's bug, not a
//! pipeline failure.
//!
//! Only one active run per subject is permitted; a second request for a busy
//! subject is rejected with 409 before it can race on the persisted artifact.

use std::collections::HashSet;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::config::AnvilConfig;
use crate::continuation::ContinuationStore;
use crate::model::HttpModelClient;
use crate::orchestrator::{Orchestrator, RunRequest};
use crate::progress::{OverflowPolicy, ProgressEmitter};
use crate::stages::StageContracts;
use crate::subject::MemorySubjectStore;

/// Shared server state.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Subjects with a run in flight.
    pub active_subjects: Mutex<HashSet<String>>,
    /// Capacity of each run's event buffer.
    pub event_buffer: usize,
}

/// The optimize request body (§6 external interface).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeRequest {
    #[serde(default)]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub raw_text: Option<String>,
    pub target_role: String,
    #[serde(default)]
    pub location_hint: Option<String>,
    #[serde(default)]
    pub continuation_id: Option<String>,
    #[serde(default)]
    pub manual_mode: bool,
}

/// Build the application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/optimize", post(optimize_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "anvil"}))
}

fn client_error(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

async fn optimize_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OptimizeRequest>,
) -> Response {
    if request.target_role.trim().is_empty() {
        return client_error("targetRole is required");
    }

    let has_text = request
        .raw_text
        .as_deref()
        .is_some_and(|t| !t.trim().is_empty());
    if !has_text && request.subject_id.is_none() {
        return client_error("rawText or a resolvable subjectId is required");
    }

    let subject_id = request
        .subject_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    {
        let mut active = state.active_subjects.lock().await;
        if !active.insert(subject_id.clone()) {
            return (
                StatusCode::CONFLICT,
                Json(json!({"error": format!("a run is already active for subject '{}'", subject_id)})),
            )
                .into_response();
        }
    }

    let run_request = RunRequest {
        subject_id: subject_id.clone(),
        target_role: request.target_role.clone(),
        raw_text: request.raw_text.clone(),
        location_hint: request.location_hint.clone(),
        continuation_id: request.continuation_id.clone(),
        manual_mode: request.manual_mode,
    };

    let (emitter, rx) = ProgressEmitter::channel(state.event_buffer, OverflowPolicy::Block);
    let orchestrator = Arc::clone(&state.orchestrator);
    let app_state = Arc::clone(&state);

    tokio::spawn(async move {
        let _outcome = orchestrator.run(run_request, &emitter).await;
        info!(subject_id = %subject_id, "run finished");
        let mut active = app_state.active_subjects.lock().await;
        active.remove(&subject_id);
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        Ok::<Event, Infallible>(
            Event::default().event(event.name()).data(
                serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string()),
            ),
        )
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Server launch settings.
pub struct ServerConfig {
    pub config: AnvilConfig,
    pub db_path: PathBuf,
    pub dev_mode: bool,
}

/// Start the server and run until Ctrl+C.
pub async fn start_server(server_config: ServerConfig) -> Result<()> {
    let ServerConfig {
        config,
        db_path,
        dev_mode,
    } = server_config;

    let client = HttpModelClient::new(config.model.clone())
        .map_err(|e| anyhow::anyhow!("failed to build model client: {}", e))?;
    let continuations = ContinuationStore::open(&db_path)
        .map_err(|e| anyhow::anyhow!("failed to open continuation store: {}", e))?;
    let subjects = Arc::new(MemorySubjectStore::new());

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(client),
        StageContracts::standard(config.pipeline.temperatures),
        continuations,
        subjects,
        config.pipeline.clone(),
    ));

    let state = Arc::new(AppState {
        orchestrator,
        active_subjects: Mutex::new(HashSet::new()),
        event_buffer: config.server.event_buffer,
    });

    let mut app = build_router(state);
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    println!("Anvil running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("Failed to install Ctrl+C handler");
        return;
    }
    println!("\nShutting down...");
}
