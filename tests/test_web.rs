//! Integration tests for the browser-facing HTTP and WebSocket surface.
//!
//! The plain HTTP routes are exercised in-process via `tower::ServiceExt::oneshot`.
//! The WebSocket upgrade needs a real handshake, so that case binds the
//! router to an ephemeral loopback port and drives it with `tokio-tungstenite`,
//! per the test-tooling approach this module follows.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use sshmux_core::config::Config;
use sshmux_core::registry::SessionRegistry;
use sshmux_core::web::{self, WebState};
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

fn state() -> WebState {
    WebState {
        registry: SessionRegistry::new(&Config::default()),
    }
}

#[tokio::test]
async fn index_page_mentions_session_route() {
    let app = web::router(state());
    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("/session/"));
}

#[tokio::test]
async fn session_page_embeds_the_requested_name() {
    let app = web::router(state());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/session/build-box")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("build-box"));
}

#[tokio::test]
async fn websocket_for_an_unknown_session_receives_an_error_frame() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = web::router(state());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let url = format!("ws://{addr}/ws/session/ghost");
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let msg = ws.next().await.unwrap().unwrap();
    let Message::Text(text) = msg else {
        panic!("expected a text frame, got {msg:?}");
    };
    let frame: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(frame["type"], "error");
    assert!(frame["message"].as_str().unwrap().contains("ghost"));

    ws.close(None).await.ok();
}
