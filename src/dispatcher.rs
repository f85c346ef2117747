//! Duplex command channel.
//!
//! Serves the WebSocket endpoint, frames every request as
//! `{operationId, command, payload}`, deduplicates operation identifiers
//! process-wide, and fans broadcast events out to all connected clients.
//!
//! **Rules:**
//! - a frame without an operation id gets an inline error, never execution
//! - a duplicate operation id within the TTL answers `already_processed`
//!   and executes nothing, regardless of which connection sent it
//! - command handlers run on the blocking pool; the socket task only parses
//!   and forwards

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::commands;
use crate::error::{PosError, PosResult};
use crate::models::now_utc;
use crate::AppState;

/// How long a processed operation id short-circuits retransmissions.
const PROCESSED_OP_TTL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Operation dedup
// ---------------------------------------------------------------------------

/// Process-wide set of recently seen operation identifiers.
pub struct ProcessedOps {
    entries: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl ProcessedOps {
    pub fn new() -> Self {
        Self::with_ttl(PROCESSED_OP_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        ProcessedOps {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Record `operation_id`; returns false when it was already seen within
    /// the TTL. Expired entries are pruned on the way.
    pub fn first_sighting(&self, operation_id: &str) -> PosResult<bool> {
        let mut entries = self.entries.lock()?;
        let now = Instant::now();
        entries.retain(|_, seen| now.duration_since(*seen) < self.ttl);

        if entries.contains_key(operation_id) {
            return Ok(false);
        }
        entries.insert(operation_id.to_string(), now);
        Ok(true)
    }
}

impl Default for ProcessedOps {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Frame execution
// ---------------------------------------------------------------------------

/// Execute one parsed frame and build the reply envelope. Runs on the
/// blocking pool; everything here is synchronous.
pub fn execute_frame(state: &AppState, frame: &Value) -> Value {
    let command = frame
        .get("command")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let operation_id = frame
        .get("operationId")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let Some(operation_id) = operation_id else {
        return reply_envelope(
            Value::Null,
            &commands::response_command(&command),
            "error",
            json!({ "error": "operationId is required", "kind": "ValidationError" }),
        );
    };

    match state.processed_ops.first_sighting(operation_id) {
        Ok(true) => {}
        Ok(false) => {
            debug!(operation_id, command, "Duplicate operation short-circuited");
            return reply_envelope(
                json!(operation_id),
                &commands::response_command(&command),
                "already_processed",
                json!({}),
            );
        }
        Err(e) => {
            return reply_envelope(
                json!(operation_id),
                &commands::response_command(&command),
                "error",
                json!({ "error": e.to_string(), "kind": e.kind() }),
            )
        }
    }

    if command.is_empty() {
        return reply_envelope(
            json!(operation_id),
            "unknownResponse",
            "error",
            json!({ "error": "command is required", "kind": "ValidationError" }),
        );
    }

    // Day rollover: the first command of a new business day re-arms the
    // storno credit reset. Idempotent per day, cheap otherwise.
    if let Err(e) = state
        .storno
        .reset_daily_storno_credits(&crate::models::business_date_today())
    {
        warn!("Daily storno credit reset failed: {e}");
    }

    let payload = frame.get("payload").cloned().unwrap_or_else(|| json!({}));
    let result = commands::dispatch(state, &command, payload);
    build_reply(operation_id, &command, result)
}

fn build_reply(operation_id: &str, command: &str, result: PosResult<Value>) -> Value {
    match result {
        Ok(payload) => reply_envelope(
            json!(operation_id),
            &commands::response_command(command),
            "success",
            payload,
        ),
        Err(e) => {
            warn!(operation_id, command, kind = e.kind(), "Command failed: {e}");
            reply_envelope(
                json!(operation_id),
                &commands::response_command(command),
                "error",
                json!({ "error": e.to_string(), "kind": e.kind() }),
            )
        }
    }
}

fn reply_envelope(operation_id: Value, command: &str, status: &str, payload: Value) -> Value {
    json!({
        "operationId": operation_id,
        "command": command,
        "status": status,
        "payload": payload,
        "channel": "websocket",
        "serverTime": now_utc(),
    })
}

/// Build an unsolicited push message.
pub fn push_envelope(command: &str, payload: Value) -> Value {
    json!({
        "command": command,
        "status": "success",
        "payload": payload,
        "channel": "websocket",
        "serverTime": now_utc(),
    })
}

/// The initial push for a fresh connection: the recovery queue when it is
/// non-empty, otherwise the app bootstrap payload.
pub fn initial_push(state: &AppState) -> Value {
    match state.engine.pending_transactions() {
        Ok(pending) if !pending.is_empty() => push_envelope(
            "recoveryPendingTransactions",
            json!({
                "transactions": pending
                    .into_iter()
                    .map(|o| json!({ "transaction": o.transaction, "items": o.items }))
                    .collect::<Vec<_>>(),
            }),
        ),
        Ok(_) => push_envelope("initialAppData", json!({ "ready": true })),
        Err(e) => {
            warn!("Initial push failed: {e}");
            push_envelope("initialAppData", json!({ "ready": false }))
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket plumbing
// ---------------------------------------------------------------------------

/// Build the axum router serving the duplex channel.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = uuid::Uuid::new_v4().to_string();
    info!(client_id, "Client connected");

    let (mut sink, mut stream) = socket.split();

    // All outbound traffic funnels through one writer task.
    let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Forward process-wide broadcasts to this client.
    let mut broadcast_rx = state.broadcast.subscribe();
    let broadcast_tx = tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Ok(message) = broadcast_rx.recv().await {
            if broadcast_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    // Greet the client with the recovery queue or bootstrap data.
    {
        let state = state.clone();
        let initial =
            tokio::task::spawn_blocking(move || initial_push(&state).to_string()).await;
        if let Ok(message) = initial {
            let _ = tx.send(message).await;
        }
    }

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };

        let frame: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                let reply = reply_envelope(
                    Value::Null,
                    "errorResponse",
                    "error",
                    json!({
                        "error": format!("malformed frame: {e}"),
                        "kind": PosError::Validation(String::new()).kind(),
                    }),
                );
                let _ = tx.send(reply.to_string()).await;
                continue;
            }
        };

        let command = frame
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        // Commands run in order within a connection; other connections
        // proceed in parallel and serialize inside the database.
        let reply = {
            let state = state.clone();
            let frame = frame.clone();
            tokio::task::spawn_blocking(move || execute_frame(&state, &frame)).await
        };

        let Ok(reply) = reply else {
            warn!(client_id, "Command task panicked");
            continue;
        };

        let succeeded = reply.get("status").and_then(Value::as_str) == Some("success");
        if tx.send(reply.to_string()).await.is_err() {
            // Client went away mid-command; state is committed regardless.
            break;
        }

        if succeeded {
            if let Some(event) = commands::broadcast_for(&command) {
                let push = push_envelope(event, json!({}));
                let _ = state.broadcast.send(push.to_string());
            }
        }
    }

    forwarder.abort();
    writer.abort();
    info!(client_id, "Client disconnected");
}

// ===========================================================================
// Tests
// ===========================================================================
