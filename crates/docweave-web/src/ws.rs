//! WebSocket upgrade handler: one session per connection.
//!
//! Each connected client receives:
//! 1. `{"type":"ready","sessionId":..}` on connect.
//! 2. The session's events (`content`, `tool_use`, `complete`, `error`) in
//!    emission order.
//!
//! Clients send `chat` messages to start turns and `tool_result` messages to
//! answer `tool_use` events. Turns run one at a time; a `chat` that arrives
//! mid-turn waits for the current turn to finish.

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use docweave::api::generate_call_id;
use docweave::bridge::{ToolBridge, ToolCallEvent, ToolResultEvent};
use docweave::document::DocumentExecutor;
use docweave::session::{SessionController, SessionDeps, SessionEvent};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::AppState;

/// GET /ws: WebSocket upgrade handler.
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Chat { message: String },
    ToolResult(ToolResultEvent),
}

/// Handle a single WebSocket connection.
async fn handle_socket(socket: WebSocket, app: AppState) {
    let (mut sink, mut stream) = socket.split();

    let session_id = format!("ws-{}", generate_call_id());
    let deps = SessionDeps::new(app.model.clone(), app.bridge.clone());
    let (mut session, events) = SessionController::start(session_id.clone(), deps, app.config.clone());

    let ready = json!({"type": "ready", "sessionId": session_id}).to_string();
    if sink.send(Message::Text(ready.into())).await.is_err() {
        return;
    }
    info!(session_id, "WebSocket session connected");

    let forward_task = tokio::spawn(forward_events(events, sink, app.bridge.clone(), app.executor.clone()));

    // Turns run on their own task so tool results can arrive on this socket
    // while a turn waits for them.
    let (chat_tx, mut chat_rx) = mpsc::unbounded_channel::<String>();
    let turn_session_id = session_id.clone();
    let turn_task = tokio::spawn(async move {
        while let Some(message) = chat_rx.recv().await {
            if let Err(e) = session.run_turn(&message).await {
                debug!(session_id = turn_session_id, code = e.code(), "Turn ended with error: {e}");
                if !session.is_emitting() {
                    break;
                }
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => handle_client_message(text.as_str(), &chat_tx, &app.bridge),
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!(session_id, "WebSocket session disconnected");
    // Aborting the forwarder closes the event stream, so the current turn
    // drops its listener at once; an in-flight bridge call still times out.
    drop(chat_tx);
    forward_task.abort();
    drop(turn_task);
}

/// Send session events to the client, answering document tools locally
/// when an executor is attached.
async fn forward_events(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut sink: SplitSink<WebSocket, Message>,
    bridge: Arc<ToolBridge>,
    executor: Option<Arc<Mutex<DocumentExecutor>>>,
) {
    while let Some(event) = events.recv().await {
        if ws_send(&mut sink, &event).await.is_err() {
            break;
        }
        if let (Some(executor), SessionEvent::ToolUse { id, tool, payload }) = (&executor, &event) {
            let call = ToolCallEvent {
                id: id.clone(),
                tool: tool.clone(),
                payload: payload.clone(),
            };
            let result = executor
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .handle_tool_call(&call);
            bridge.resolve(result);
        }
    }
}

/// Process a JSON message received from a client.
fn handle_client_message(text: &str, chat_tx: &mpsc::UnboundedSender<String>, bridge: &ToolBridge) {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("Ignoring malformed WebSocket message: {e}");
            return;
        }
    };

    match msg {
        ClientMessage::Chat { message } => {
            let _ = chat_tx.send(message);
        }
        ClientMessage::ToolResult(result) => {
            let id = result.id.clone();
            if !bridge.resolve(result) {
                warn!(id, "Tool result arrived with no waiter");
            }
        }
    }
}

/// Serialize an event and send it over the WebSocket sink.
async fn ws_send(sink: &mut SplitSink<WebSocket, Message>, event: &SessionEvent) -> Result<(), ()> {
    let json = serde_json::to_string(event).map_err(|_| ())?;
    sink.send(Message::Text(json.into())).await.map_err(|_| ())
}
