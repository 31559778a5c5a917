//! REST API and SSE routes

use crate::instance::{InstanceCommand, InstanceHandle};
use crate::state::{AppState, StampedSample};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{Stream, StreamExt as FuturesStreamExt};
use pitboard_core::state::GatePhase;
use pitboard_core::{InstanceId, MetricsRecord, PeerMessage, RawSample, SessionInfo};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;

const MSGPACK: &str = "application/msgpack";

/// Origin used for control messages when no local instance can send them
const CONTROL_ORIGIN: &str = "control";

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/sources", get(list_sources))
        .route("/api/instances", get(list_instances))
        .route("/api/instances/:id/metrics", get(instance_metrics))
        .route("/api/instances/:id/stream", get(instance_stream))
        .route("/api/samples", post(push_sample))
        .route("/api/session", post(push_session))
        .route("/api/peer/messages", post(push_peer_message))
        .route("/api/peer/stream", get(peer_stream))
        .route("/api/control/reset", post(reset))
        .route(
            "/api/control/persistence",
            get(get_persistence).post(set_persistence),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// === Source Endpoints ===

#[derive(Serialize)]
struct SourceInfo {
    key: String,
    name: String,
    detected: bool,
    active: bool,
}

async fn list_sources(State(state): State<AppState>) -> Json<Vec<SourceInfo>> {
    let sources = state.sources.read().await;
    let active_key = state.active_source.read().await;

    let info: Vec<SourceInfo> = sources
        .iter()
        .map(|source| SourceInfo {
            key: source.key().to_string(),
            name: source.name().to_string(),
            detected: source.detect(),
            active: source.is_active()
                || active_key
                    .as_ref()
                    .map(|k| k == source.key())
                    .unwrap_or(false),
        })
        .collect();

    Json(info)
}

// === Instance Endpoints ===

#[derive(Serialize)]
struct InstanceSummary {
    id: InstanceId,
    phase: GatePhase,
    buffer_frozen: bool,
    last_lap_completed: Option<i32>,
}

async fn list_instances(State(state): State<AppState>) -> Json<Vec<InstanceSummary>> {
    let handles: Vec<InstanceHandle> = state.instances.read().await.values().cloned().collect();

    let mut summaries = Vec::with_capacity(handles.len());
    for handle in handles {
        let metrics = handle.metrics().await;
        summaries.push(InstanceSummary {
            id: metrics.instance,
            phase: metrics.gate.phase,
            buffer_frozen: metrics.gate.buffer_frozen,
            last_lap_completed: metrics.last_lap_completed,
        });
    }
    Json(summaries)
}

async fn find_instance(state: &AppState, id: String) -> Result<InstanceHandle, (StatusCode, String)> {
    state
        .instances
        .read()
        .await
        .get(&InstanceId::new(id.clone()))
        .cloned()
        .ok_or((StatusCode::NOT_FOUND, format!("No instance {}", id)))
}

async fn instance_metrics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MetricsRecord>, (StatusCode, String)> {
    let handle = find_instance(&state, id).await?;
    Ok(Json(handle.metrics().await))
}

async fn instance_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let handle = find_instance(&state, id).await?;
    let rx = handle.subscribe_metrics();
    Ok(Sse::new(json_events(BroadcastStream::new(rx))).keep_alive(KeepAlive::default()))
}

// === Inbound Channels ===

async fn push_sample(State(state): State<AppState>, Json(raw): Json<RawSample>) -> StatusCode {
    // No instances listening is not the sender's problem
    let _ = state.samples_tx.send(StampedSample::now(raw));
    StatusCode::ACCEPTED
}

async fn push_session(State(state): State<AppState>, Json(info): Json<SessionInfo>) -> StatusCode {
    let _ = state.session_tx.send(info);
    StatusCode::ACCEPTED
}

// === Peer Channel ===

/// Accepts a `PeerMessage` as JSON, or as MessagePack with
/// `content-type: application/msgpack`
async fn push_peer_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let is_msgpack = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with(MSGPACK))
        .unwrap_or(false);

    let message: PeerMessage = if is_msgpack {
        rmp_serde::from_slice(&body)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid MessagePack peer message: {}", e)))?
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid JSON peer message: {}", e)))?
    };

    state.publish(message);
    Ok(StatusCode::ACCEPTED)
}

async fn peer_stream(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(json_events(BroadcastStream::new(state.subscribe_peer()))).keep_alive(KeepAlive::default())
}

/// Serialize each broadcast item as an SSE `data:` line, skipping lag errors
fn json_events<T>(stream: BroadcastStream<T>) -> impl Stream<Item = Result<Event, Infallible>>
where
    T: Serialize + Clone + Send + 'static,
{
    stream.filter_map(|result| async move {
        match result {
            Ok(item) => match serde_json::to_string(&item) {
                Ok(json) => Some(Ok(Event::default().data(json))),
                Err(e) => {
                    tracing::error!("Failed to serialize event: {}", e);
                    None
                }
            },
            Err(e) => {
                tracing::warn!("Broadcast stream error: {}", e);
                None
            }
        }
    })
}

// === Control Endpoints ===

/// First hosted instance, which performs control actions on everyone's behalf
async fn primary_instance(state: &AppState) -> Option<InstanceHandle> {
    state.instances.read().await.values().next().cloned()
}

async fn dispatch(state: &AppState, command: InstanceCommand, fallback: PeerMessage) {
    if let Some(handle) = primary_instance(state).await {
        match handle.send(command).await {
            Ok(()) => return,
            Err(e) => tracing::warn!("{}", e),
        }
    }
    state.publish(fallback);
}

async fn reset(State(state): State<AppState>) -> StatusCode {
    let fallback = PeerMessage::Reset {
        origin: InstanceId::new(CONTROL_ORIGIN),
    };
    dispatch(&state, InstanceCommand::Reset, fallback).await;
    StatusCode::ACCEPTED
}

#[derive(Debug, Serialize, Deserialize)]
struct Persistence {
    enabled: bool,
}

async fn get_persistence(State(state): State<AppState>) -> Json<Persistence> {
    Json(Persistence {
        enabled: *state.persistence_enabled.read().await,
    })
}

async fn set_persistence(
    State(state): State<AppState>,
    Json(request): Json<Persistence>,
) -> impl IntoResponse {
    *state.persistence_enabled.write().await = request.enabled;

    let fallback = PeerMessage::SetPersistence {
        origin: InstanceId::new(CONTROL_ORIGIN),
        enabled: request.enabled,
    };
    dispatch(&state, InstanceCommand::SetPersistence(request.enabled), fallback).await;
    (StatusCode::ACCEPTED, Json(request))
}
