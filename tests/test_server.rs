//! Integration tests for the MCP tool surface via duplex transport.
//!
//! Uses `tokio::io::duplex` to create an in-process transport, connects a
//! test client to the server, and drives tools through the real MCP
//! protocol. `ssh_connect` itself requires a live SSH server, so the cases
//! here exercise tool routing, error-envelope shape, and every registry
//! error path reachable without one; the dispatcher/session state machine
//! is covered by the `#[cfg(test)]` units in `session.rs` and
//! `dispatcher.rs` against a fake PTY transport instead.

use rmcp::model::*;
use rmcp::{ClientHandler, ServiceExt};
use serde_json::Value;
use sshmux_core::config::Config;
use sshmux_core::server::SshMuxServer;

#[derive(Default, Clone)]
struct TestClient;

impl ClientHandler for TestClient {}

async fn setup() -> rmcp::service::RunningService<
    rmcp::service::RoleClient,
    impl rmcp::service::Service<rmcp::service::RoleClient>,
> {
    let (server_transport, client_transport) = tokio::io::duplex(65536);

    let server = SshMuxServer::new(&Config::default());
    tokio::spawn(async move {
        let service = server.serve(server_transport).await.unwrap();
        let _ = service.waiting().await;
    });

    let client = TestClient::default();
    client.serve(client_transport).await.unwrap()
}

async fn call_tool(
    client: &rmcp::service::RunningService<
        rmcp::service::RoleClient,
        impl rmcp::service::Service<rmcp::service::RoleClient>,
    >,
    name: &str,
    args: Value,
) -> Value {
    let params = CallToolRequestParams {
        meta: None,
        name: name.to_string().into(),
        arguments: Some(serde_json::from_value(args).unwrap()),
        task: None,
    };
    let request = ClientRequest::CallToolRequest(Request::new(params));
    let response = client.send_request(request).await.unwrap();

    let ServerResult::CallToolResult(result) = response else {
        panic!("expected CallToolResult, got {response:?}");
    };

    let text = result
        .content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("");

    serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text))
}

#[tokio::test]
async fn list_sessions_starts_empty() {
    let client = setup().await;
    let result = call_tool(&client, "ssh_list_sessions", serde_json::json!({})).await;
    assert_eq!(result["success"], true);
    assert_eq!(result["sessions"].as_array().unwrap().len(), 0);
    client.cancel().await.unwrap();
}

#[tokio::test]
async fn ssh_exec_against_unknown_session_fails_without_touching_pty() {
    let client = setup().await;
    let result = call_tool(
        &client,
        "ssh_exec",
        serde_json::json!({"sessionName": "ghost", "command": "echo hi"}),
    )
    .await;
    assert_eq!(result["success"], false);
    assert_eq!(result["error"], "SESSION_NOT_FOUND");
    client.cancel().await.unwrap();
}

#[tokio::test]
async fn ssh_cancel_command_against_unknown_session_fails() {
    let client = setup().await;
    let result = call_tool(
        &client,
        "ssh_cancel_command",
        serde_json::json!({"sessionName": "ghost"}),
    )
    .await;
    assert_eq!(result["success"], false);
    assert_eq!(result["error"], "SESSION_NOT_FOUND");
    client.cancel().await.unwrap();
}

#[tokio::test]
async fn ssh_disconnect_against_unknown_session_fails() {
    let client = setup().await;
    let result = call_tool(
        &client,
        "ssh_disconnect",
        serde_json::json!({"sessionName": "ghost"}),
    )
    .await;
    assert_eq!(result["success"], false);
    assert_eq!(result["error"], "SESSION_NOT_FOUND");
    client.cancel().await.unwrap();
}

#[tokio::test]
async fn ssh_get_monitoring_url_against_unknown_session_fails() {
    let client = setup().await;
    let result = call_tool(
        &client,
        "ssh_get_monitoring_url",
        serde_json::json!({"sessionName": "ghost"}),
    )
    .await;
    assert_eq!(result["success"], false);
    assert_eq!(result["error"], "SESSION_NOT_FOUND");
    client.cancel().await.unwrap();
}

#[tokio::test]
async fn ssh_acknowledge_browser_commands_against_unknown_session_fails() {
    let client = setup().await;
    let result = call_tool(
        &client,
        "ssh_acknowledge_browser_commands",
        serde_json::json!({"sessionName": "ghost"}),
    )
    .await;
    assert_eq!(result["success"], false);
    assert_eq!(result["error"], "SESSION_NOT_FOUND");
    client.cancel().await.unwrap();
}

#[tokio::test]
async fn ssh_connect_rejects_a_second_session_with_the_same_name_after_a_failed_dial() {
    let client = setup().await;
    // No SSH server is listening on this port, so the connect attempt fails
    // fast with SSH_TRANSPORT_ERROR and never registers the session name --
    // a subsequent attempt with the same name should fail the same way, not
    // with SESSION_ALREADY_EXISTS.
    let args = serde_json::json!({
        "name": "s1",
        "host": "127.0.0.1",
        "port": 1,
        "username": "nobody",
        "password": "x",
    });
    let first = call_tool(&client, "ssh_connect", args.clone()).await;
    assert_eq!(first["success"], false);
    assert_eq!(first["error"], "SSH_TRANSPORT_ERROR");

    let second = call_tool(&client, "ssh_connect", args).await;
    assert_eq!(second["success"], false);
    assert_eq!(second["error"], "SSH_TRANSPORT_ERROR");

    client.cancel().await.unwrap();
}
