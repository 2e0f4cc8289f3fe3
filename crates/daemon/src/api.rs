// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Registry Contributors

// Tunnel Registry - REST API Module
// Handles HTTP API endpoints for the tunnel registry

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use tunnel_registry_common::{CreateTunnelRequest, Error, MatchMode, TunnelEvent, Utc};

use crate::service::TunnelService;

/// Shared application state
pub struct AppState {
    pub service: TunnelService,
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

/// API error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    candidates: Vec<String>,
}

/// API success response
#[derive(Serialize)]
struct SuccessResponse {
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct DeleteParams {
    #[serde(default)]
    exact: bool,
}

/// Registry errors rendered as HTTP responses
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Ambiguous { .. } => StatusCode::CONFLICT,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::Provider(_) => StatusCode::BAD_GATEWAY,
            Error::CorruptState { .. }
            | Error::StorageRead { .. }
            | Error::StorageWrite { .. }
            | Error::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if !self.0.is_client_error() {
            error!("API request failed: {}", self.0);
        }

        let candidates = match &self.0 {
            Error::Ambiguous { candidates, .. } => candidates.clone(),
            _ => Vec::new(),
        };

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                candidates,
            }),
        )
            .into_response()
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tunnels", get(list_tunnels).post(create_tunnel))
        .route("/tunnels/*key", delete(delete_tunnel))
        .route("/reconcile", post(reconcile))
        .route("/events", get(event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health() -> &'static str {
    "OK"
}

/// List all registered tunnels
async fn list_tunnels(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.service.list().await)
}

/// Open a new tunnel
async fn create_tunnel(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateTunnelRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    // Malformed bodies are a 400 here, not axum's default 422
    let Json(request) = body.map_err(|e| Error::InvalidRequest(e.body_text()))?;

    info!(
        "API: Create {} tunnel request for {}",
        request.protocol, request.forwards_to
    );
    let entry = state.service.create(request).await?;
    Ok(Json(entry))
}

/// Delete a tunnel by URL or unique URL substring
async fn delete_tunnel(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<impl IntoResponse, ApiError> {
    info!("API: Delete tunnel request for {}", key);

    let mode = if params.exact {
        MatchMode::Exact
    } else {
        MatchMode::Fuzzy
    };
    let entry = state.service.delete(&key, mode).await?;

    Ok(Json(SuccessResponse {
        message: format!("Tunnel {} deleted", entry.url),
    }))
}

/// Retry reconciliation of entries without a live listener
async fn reconcile(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    info!("API: Reconcile request");
    let report = state.service.reconcile().await?;
    Ok(Json(report))
}

/// GET /events  → SSE stream of registry events
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.service.subscribe();
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    let registry_events = BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(event) => event_payload(&event).map(|json| Ok(Event::default().data(json))),
            Err(lagged) => {
                // Slow client; skip what was missed and keep streaming
                tracing::debug!("Event stream lagged: {:?}, continuing", lagged);
                None
            }
        }
    });

    let merged = stream::select(registry_events, heartbeat_stream());

    let shutdown_aware = merged.take_until(async move {
        let _ = shutdown_rx.recv().await;
    });

    Sse::new(shutdown_aware)
}

fn event_payload(event: &TunnelEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!("Failed to serialize TunnelEvent: {e}");
            None
        }
    }
}

fn heartbeat_stream(
) -> impl futures::Stream<Item = Result<Event, Infallible>> + Send + Sync + 'static {
    tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(heartbeat_interval())).map(
        |_| {
            let json = event_payload(&TunnelEvent::Heartbeat {
                timestamp: Utc::now(),
            })
            .unwrap_or_else(|| "{}".to_string());
            Ok(Event::default().data(json))
        },
    )
}

#[cfg(not(test))]
fn heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
fn heartbeat_interval() -> Duration {
    Duration::from_millis(100)
}
