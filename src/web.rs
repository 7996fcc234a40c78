//! Browser-facing HTTP and WebSocket surface.
//!
//! One pump task forwards a session's output fan-out to the socket; the
//! socket's own read loop turns inbound frames into dispatcher submissions,
//! resizes, and signals. There is no separate "spawn on first connect" step
//! here, since the MCP side already owns session lifetime — connecting just
//! attaches a listener and replays history.

use crate::dispatcher::{CancelReason, Initiator};
use crate::history::{HistoryEntry, SourceTag};
use crate::registry::SessionRegistry;
use crate::session::SubmitRequest;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct WebState {
    pub registry: SessionRegistry,
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/session/:name", get(session_page))
        .route("/ws/session/:name", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    Html(include_str!("../static/index.html"))
}

async fn session_page(Path(name): Path<String>) -> impl IntoResponse {
    let name_json = serde_json::to_string(&name).unwrap_or_else(|_| "\"\"".to_string());
    let page = include_str!("../static/session.html")
        .replace("{{SESSION_NAME_JSON}}", &name_json)
        .replace("{{SESSION_NAME}}", &escape_html(&name));
    Html(page)
}

/// Minimal HTML escaping for interpolating the session name into the static
/// shell page — there is no templating engine in the dependency stack for
/// one interpolated string.
fn escape_html(name: &str) -> String {
    name.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(name): Path<String>,
    State(state): State<WebState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, name, state))
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundFrame<'a> {
    TerminalOutput {
        sequence: u64,
        source: &'a str,
        data: String,
    },
    Error {
        message: String,
    },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundFrame {
    TerminalInput { command: String, command_id: Option<String> },
    TerminalSignal { signal: String },
    TerminalResize { cols: u32, rows: u32 },
}

fn source_label(tag: SourceTag) -> &'static str {
    match tag {
        SourceTag::System => "system",
        SourceTag::UserCommandEcho => "user_command_echo",
        SourceTag::ClaudeCommandEcho => "claude_command_echo",
        SourceTag::CommandOutput => "command_output",
        SourceTag::Prompt => "prompt",
    }
}

fn encode_entry(entry: &HistoryEntry) -> String {
    let frame = OutboundFrame::TerminalOutput {
        sequence: entry.sequence,
        source: source_label(entry.source),
        data: String::from_utf8_lossy(&entry.data).into_owned(),
    };
    serde_json::to_string(&frame).unwrap_or_default()
}

async fn handle_socket(socket: WebSocket, session_name: String, state: WebState) {
    let session = match state.registry.get(&session_name).await {
        Ok(session) => session,
        Err(err) => {
            let mut socket = socket;
            let frame = OutboundFrame::Error { message: err.to_string() };
            if let Ok(json) = serde_json::to_string(&frame) {
                let _ = socket.send(Message::Text(json.into())).await;
            }
            return;
        }
    };

    let (history, mut listener) = session.attach_listener().await;
    let (mut ws_sink, mut ws_stream) = socket.split();

    let outbound = tokio::spawn(async move {
        for entry in &history {
            if ws_sink.send(Message::Text(encode_entry(entry).into())).await.is_err() {
                return;
            }
        }
        while let Some(entry) = listener.receiver.recv().await {
            if ws_sink.send(Message::Text(encode_entry(&entry).into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                if let Ok(frame) = serde_json::from_str::<InboundFrame>(&text) {
                    handle_inbound(&session, frame).await;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    outbound.abort();
    session.detach_listener(listener.id).await;
    tracing::info!(session = %session_name, "terminal websocket disconnected");
}

async fn handle_inbound(session: &crate::session::Session, frame: InboundFrame) {
    match frame {
        InboundFrame::TerminalInput { command, command_id } => {
            let result = session
                .submit(SubmitRequest {
                    command,
                    initiator: Initiator::Browser,
                    command_id,
                    wait_ms: None,
                    cancel: false,
                    timeout: None,
                })
                .await;
            if let Err(err) = result {
                tracing::debug!(%err, "browser command submission rejected");
            }
        }
        InboundFrame::TerminalSignal { signal } => {
            if signal != "SIGINT" {
                return;
            }
            if let Some(id) = session.current_command_id().await {
                let _ = session.cancel(&id, CancelReason::BrowserSignal).await;
            }
        }
        InboundFrame::TerminalResize { cols, rows } => {
            let _ = session.resize(cols, rows).await;
        }
    }
}
