//! HTTP server and WebSocket fan-out for echolocate

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::detector::Sample;
use crate::dispatcher::{self, PacketOutcome};
use crate::error::{Error, Result};
use crate::events::BroadcastMessage;
use crate::state::{Mode, SharedState};
use crate::sync::SyncProgress;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub state: Arc<SharedState>,
}

/// Build the application router
pub fn build_router(app: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/packet", post(submit_packet))
        .route("/mode", get(get_mode).post(set_mode))
        .route("/results", get(get_results))
        .route("/results/latest", get(get_latest_result))
        .route("/status", get(get_status))
        .route("/ws", get(ws_handler))
        .with_state(app)
}

/// Start the HTTP server
pub async fn start(bind_addr: &str, app: AppState) -> anyhow::Result<()> {
    let router = build_router(app);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("HTTP server listening on {}", bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}

/// Health check endpoint
async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "module": "echolocate",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ============================================================================
// Packet intake
// ============================================================================

/// POST /packet - one listener's loudness samples around a suspected clap
async fn submit_packet(
    State(app): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let (listener_id, samples) = validate_packet(&app.config, &body)?;
    debug!(listener_id = %listener_id, samples = samples.len(), "packet received");

    let outcome = dispatcher::dispatch(&app.state, &app.config, &listener_id, &samples).await;
    Ok(Json(shape_outcome(&app.config, outcome)))
}

/// Validate the packet body: nonempty array, numeric fields, one known
/// device id shared by every sample.
fn validate_packet(config: &Config, body: &Value) -> Result<(String, Vec<Sample>)> {
    let entries = body
        .as_array()
        .ok_or_else(|| Error::BadRequest("body must be an array of samples".to_string()))?;
    if entries.is_empty() {
        return Err(Error::BadRequest("body must be a nonempty array".to_string()));
    }

    let mut listener_id: Option<String> = None;
    let mut samples = Vec::with_capacity(entries.len());

    for entry in entries {
        let device_id = entry
            .get("deviceId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BadRequest("sample missing string deviceId".to_string()))?;
        let timestamp = entry
            .get("timestamp")
            .and_then(Value::as_f64)
            .ok_or_else(|| Error::BadRequest("sample missing numeric timestamp".to_string()))?;
        let loudness = entry
            .get("loudnessDb")
            .and_then(Value::as_f64)
            .ok_or_else(|| Error::BadRequest("sample missing numeric loudnessDb".to_string()))?;

        if !timestamp.is_finite() || !loudness.is_finite() {
            return Err(Error::BadRequest("timestamp and loudnessDb must be finite".to_string()));
        }
        if config.listener(device_id).is_none() {
            return Err(Error::BadRequest(format!("unknown deviceId: {}", device_id)));
        }
        match &listener_id {
            None => listener_id = Some(device_id.to_string()),
            Some(first) if first != device_id => {
                return Err(Error::BadRequest(
                    "all samples in a packet must share one deviceId".to_string(),
                ));
            }
            Some(_) => {}
        }

        samples.push(Sample { timestamp_ms: timestamp, loudness });
    }

    // Nonempty array guarantees the id was set
    let listener_id = listener_id
        .ok_or_else(|| Error::Internal("packet validation lost the device id".to_string()))?;
    Ok((listener_id, samples))
}

fn shape_outcome(config: &Config, outcome: PacketOutcome) -> Value {
    match outcome {
        PacketOutcome::NoClap { mode } => json!({
            "mode": mode,
            "status": "no_clap",
            "message": "no clap detected in packet",
        }),
        PacketOutcome::Sync(progress) => shape_sync_progress(config, progress),
        PacketOutcome::Pending { reported, waiting } => json!({
            "mode": "localize",
            "status": "pending",
            "reportedDevices": reported,
            "waitingFor": waiting,
            "message": format!("waiting for claps from: {}", waiting.join(", ")),
        }),
        PacketOutcome::Localized { event } => json!({
            "mode": "localize",
            "status": "localized",
            "event": event,
        }),
        PacketOutcome::Rejected { event, reason } => json!({
            "mode": "localize",
            "status": "rejected",
            "message": reason.message(),
            "event": event,
        }),
    }
}

fn shape_sync_progress(config: &Config, progress: SyncProgress) -> Value {
    let target_rounds = config.sync_rounds;
    match progress {
        SyncProgress::Waiting { reported, waiting, round } => json!({
            "mode": "sync",
            "status": "waiting",
            "reported": reported,
            "waiting": waiting,
            "round": round,
            "targetRounds": target_rounds,
            "message": format!("round {}: waiting for claps from: {}", round, waiting.join(", ")),
        }),
        SyncProgress::RoundComplete { round, offsets } => json!({
            "mode": "sync",
            "status": "round_complete",
            "round": round,
            "targetRounds": target_rounds,
            "roundOffsets": offsets,
            "message": format!("round {}/{} complete", round, target_rounds),
        }),
        SyncProgress::SessionComplete { offsets, std_devs, rounds } => json!({
            "mode": "sync",
            "status": "complete",
            "offsets": offsets,
            "stdDevs": std_devs,
            "rounds": rounds,
            "message": "synchronization complete, switching to localize mode",
        }),
    }
}

// ============================================================================
// Mode, results, status
// ============================================================================

/// GET /mode
async fn get_mode(State(app): State<AppState>) -> Json<Value> {
    let core = app.state.core.read().await;
    Json(json!({
        "mode": core.mode,
        "offsets": core.offsets,
        "isSynced": core.is_synced(),
    }))
}

/// POST /mode - switch between sync and localize
async fn set_mode(
    State(app): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let mode = match body.get("mode").and_then(Value::as_str) {
        Some("sync") => Mode::Sync,
        Some("localize") => Mode::Localize,
        _ => {
            return Err(Error::BadRequest(
                "mode must be \"sync\" or \"localize\"".to_string(),
            ))
        }
    };

    let mut core = app.state.core.write().await;
    core.set_mode(mode);
    info!(%mode, "mode switched");
    Ok(Json(json!({
        "mode": core.mode,
        "offsets": core.offsets,
        "isSynced": core.is_synced(),
    })))
}

/// GET /results - retained events, oldest first
async fn get_results(State(app): State<AppState>) -> Json<Value> {
    let events = app.state.events_snapshot().await;
    Json(json!({
        "count": events.len(),
        "events": events,
    }))
}

/// GET /results/latest
async fn get_latest_result(State(app): State<AppState>) -> Json<Value> {
    Json(json!({ "event": app.state.latest_event().await }))
}

/// GET /status
async fn get_status(State(app): State<AppState>) -> Json<Value> {
    let core = app.state.core.read().await;
    Json(json!({
        "mode": core.mode,
        "config": {
            "devices": app.config.listeners,
            "eventWindowMs": app.config.event_window_ms,
            "speedOfSound": app.config.speed_of_sound,
        },
        "sync": {
            "offsets": core.offsets,
            "isSynced": core.is_synced(),
        },
        "pendingPackets": core.pending.len(),
        "totalEvents": core.total_events(),
        "wsClients": app.state.client_count(),
    }))
}

// ============================================================================
// WebSocket fan-out
// ============================================================================

/// GET /ws - upgrade and stream committed events
async fn ws_handler(
    State(app): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app.state))
}

async fn handle_socket(socket: WebSocket, state: Arc<SharedState>) {
    info!("WebSocket client connected, total clients: {}", state.client_count() + 1);
    let (mut sender, mut receiver) = socket.split();

    let connected = BroadcastMessage::Connected {
        message: "connected to echolocate event stream".to_string(),
    };
    if send_json(&mut sender, &connected).await.is_err() {
        return;
    }

    let mut rx = state.subscribe();
    loop {
        tokio::select! {
            broadcast = rx.recv() => match broadcast {
                Ok(message) => {
                    if send_json(&mut sender, &message).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "WebSocket client lagged, events skipped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                // Inbound text/ping is ignored; the stream is one-way
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("WebSocket client disconnected");
}

async fn send_json(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    message: &BroadcastMessage,
) -> std::result::Result<(), ()> {
    let text = serde_json::to_string(message).map_err(|_| ())?;
    sender.send(Message::Text(text)).await.map_err(|_| ())
}
