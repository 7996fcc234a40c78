//! MCP server: tool definitions using rmcp macros.
//!
//! Defines `SshMuxServer` with the agent-facing tool surface for opening,
//! driving, and tearing down SSH sessions shared with browser terminal
//! clients: `ssh_connect`, `ssh_exec`, `ssh_cancel_command`,
//! `ssh_list_sessions`, `ssh_disconnect`, `ssh_get_monitoring_url`,
//! `ssh_acknowledge_browser_commands`.

use crate::config::Config;
use crate::dispatcher::{CancelReason, Initiator};
use crate::error::CoreError;
use crate::port::monitoring_url;
use crate::registry::SessionRegistry;
use crate::session::SubmitRequest;
use crate::ssh::ConnectParams;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::schemars;
use rmcp::tool;
use rmcp::tool_handler;
use rmcp::tool_router;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde::Serialize;

/// Default SSH port when `ssh_connect` doesn't specify one.
const DEFAULT_SSH_PORT: u16 = 22;

// ---------------------------------------------------------------------------
// Parameter structs (deserialized from MCP tool call arguments)
// ---------------------------------------------------------------------------

/// Parameters for the `ssh_connect` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshConnectParams {
    /// Caller-assigned name this session will be addressed by in every other tool.
    pub name: String,
    pub host: String,
    /// SSH port. Defaults to 22.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub username: String,
    /// Password authentication. Mutually exclusive with `key_file_path`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Private key path for public-key authentication. A leading `~` is
    /// expanded to the process user's home directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file_path: Option<String>,
}

/// Parameters for the `ssh_exec` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshExecParams {
    pub session_name: String,
    pub command: String,
    /// Caller-supplied id for this command. Auto-generated if omitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    /// When true, auto-cancel the command after `wait_to_cancel_ms` if it
    /// hasn't completed by then. Requires `wait_to_cancel_ms >= 1000`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_to_cancel_ms: Option<u64>,
}

/// Parameters for the `ssh_cancel_command` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshCancelCommandParams {
    pub session_name: String,
}

/// Parameters for the `ssh_disconnect` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshDisconnectParams {
    pub session_name: String,
}

/// Parameters for the `ssh_get_monitoring_url` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshGetMonitoringUrlParams {
    pub session_name: String,
}

/// Parameters for the `ssh_acknowledge_browser_commands` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshAcknowledgeBrowserCommandsParams {
    pub session_name: String,
}

// ---------------------------------------------------------------------------
// Result structs (serialized to JSON and returned as tool content)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecResult {
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionListEntry {
    name: String,
    host: String,
    username: String,
    status: &'static str,
}

fn json_content<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("JSON serialization error: {e}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

/// `{success:true}` with no other fields, for tools whose happy path carries
/// no payload beyond success itself (`ssh_connect`, `ssh_cancel_command`,
/// `ssh_disconnect`, `ssh_acknowledge_browser_commands`).
fn ok_bare() -> Result<CallToolResult, McpError> {
    json_content(&serde_json::json!({ "success": true }))
}

/// `{success:true}` merged with an additional payload object, for tools whose
/// happy path carries a result (`ssh_exec`'s `result`, `ssh_list_sessions`'s
/// `sessions`, `ssh_get_monitoring_url`'s `monitoringUrl`).
fn ok_with(payload: serde_json::Value) -> Result<CallToolResult, McpError> {
    let mut body = serde_json::json!({ "success": true });
    if let (Some(body_map), Some(payload_map)) = (body.as_object_mut(), payload.as_object()) {
        body_map.extend(payload_map.clone());
    }
    json_content(&body)
}

/// Converts a `CoreError` into the `{success:false, error, browserCommands?}`
/// shape every tool returns for a tool-level failure -- never as an MCP
/// protocol-level error (the error taxonomy's propagation policy: tool
/// failures are values, not JSON-RPC errors).
fn err_result(e: CoreError) -> Result<CallToolResult, McpError> {
    let browser_commands = match &e {
        CoreError::BrowserCommandsExecuted { browser_commands } => Some(browser_commands.clone()),
        _ => None,
    };
    json_content(&serde_json::json!({
        "success": false,
        "error": e.code(),
        "browserCommands": browser_commands,
    }))
}

// ---------------------------------------------------------------------------
// MCP Server
// ---------------------------------------------------------------------------

/// The sshmux-core MCP server: one tool surface shared by every open session.
#[derive(Clone)]
pub struct SshMuxServer {
    registry: SessionRegistry,
    tool_router: ToolRouter<SshMuxServer>,
}

impl SshMuxServer {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            registry: SessionRegistry::new(config),
            tool_router: Self::tool_router(),
        }
    }

    /// The registry backing this server's tools, shared with the HTTP/WS
    /// surface so both speak to the same live sessions.
    #[must_use]
    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }
}

#[tool_router]
impl SshMuxServer {
    #[tool(
        description = "Open a persistent SSH session against a remote host and drive it to ready. The session is addressed by `name` in every other ssh_* tool call. Authenticate with either `password` or `keyFilePath` (a leading `~` is expanded). The session installs a fixed-format prompt so command completion can be detected reliably; this is transparent to callers."
    )]
    async fn ssh_connect(
        &self,
        Parameters(params): Parameters<SshConnectParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(name = %params.name, host = %params.host, "ssh_connect");
        let connect_params = ConnectParams {
            host: params.host,
            port: params.port.unwrap_or(DEFAULT_SSH_PORT),
            username: params.username,
            password: params.password,
            key_file_path: params.key_file_path,
        };
        match self.registry.connect(params.name, connect_params).await {
            Ok(()) => ok_bare(),
            Err(e) => err_result(e),
        }
    }

    #[tool(
        description = "Execute a command in a previously connected session. The same PTY is shared with any browser terminal attached to this session, so output is visible to both. Returns structured stdout/stderr/exitCode on completion. If browser-initiated commands have run since the last acknowledgement, this call fails with error BROWSER_COMMANDS_EXECUTED and a browserCommands payload describing them -- call ssh_acknowledge_browser_commands to clear the gate and resubmit. Set cancel=true with waitToCancelMs (>= 1000) to auto-interrupt a long-running command after a deadline."
    )]
    async fn ssh_exec(
        &self,
        Parameters(params): Parameters<SshExecParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(session = %params.session_name, command = %params.command, "ssh_exec");
        let session = match self.registry.get(&params.session_name).await {
            Ok(session) => session,
            Err(e) => return err_result(e),
        };

        let rx = match session
            .submit(SubmitRequest {
                command: params.command,
                initiator: Initiator::Mcp,
                command_id: params.command_id,
                wait_ms: params.wait_to_cancel_ms,
                cancel: params.cancel.unwrap_or(false),
                timeout: None,
            })
            .await
        {
            Ok(rx) => rx,
            Err(e) => return err_result(e),
        };

        match rx.await {
            Ok(outcome) => {
                tracing::info!(
                    session = %params.session_name,
                    exit_code = ?outcome.exit_code,
                    status = ?outcome.status,
                    "ssh_exec completed"
                );
                let result = serde_json::to_value(ExecResult {
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    exit_code: outcome.exit_code,
                })
                .unwrap_or(serde_json::Value::Null);
                ok_with(serde_json::json!({ "result": result }))
            }
            Err(_) => err_result(CoreError::SessionDisposing),
        }
    }

    #[tool(
        description = "Interrupt the command currently executing in a session (sends ^C). Returns NO_ACTIVE_MCP_COMMAND if nothing is running -- this is informational, not fatal."
    )]
    async fn ssh_cancel_command(
        &self,
        Parameters(params): Parameters<SshCancelCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        let session = match self.registry.get(&params.session_name).await {
            Ok(session) => session,
            Err(e) => return err_result(e),
        };
        let Some(id) = session.current_command_id().await else {
            return err_result(CoreError::NoActiveMcpCommand);
        };
        match session.cancel(&id, CancelReason::McpCancel).await {
            Ok(()) => ok_bare(),
            Err(e) => err_result(e),
        }
    }

    #[tool(description = "List every connected session with its name, host, username, and lifecycle status.")]
    async fn ssh_list_sessions(&self) -> Result<CallToolResult, McpError> {
        let sessions = self
            .registry
            .list()
            .await
            .into_iter()
            .map(|s| SessionListEntry {
                name: s.name,
                host: s.host,
                username: s.user,
                status: s.lifecycle,
            })
            .collect::<Vec<_>>();
        ok_with(serde_json::json!({ "sessions": sessions }))
    }

    #[tool(description = "Disconnect a session, closing its PTY and SSH transport and draining any in-flight or queued commands.")]
    async fn ssh_disconnect(
        &self,
        Parameters(params): Parameters<SshDisconnectParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(session = %params.session_name, "ssh_disconnect");
        match self.registry.disconnect(&params.session_name).await {
            Ok(()) => ok_bare(),
            Err(e) => err_result(e),
        }
    }

    #[tool(
        description = "Get the browser-facing URL for watching and interacting with a session's live terminal."
    )]
    async fn ssh_get_monitoring_url(
        &self,
        Parameters(params): Parameters<SshGetMonitoringUrlParams>,
    ) -> Result<CallToolResult, McpError> {
        if let Err(e) = self.registry.get(&params.session_name).await {
            return err_result(e);
        }
        let url = monitoring_url(self.registry.web_port(), &params.session_name);
        ok_with(serde_json::json!({ "monitoringUrl": url }))
    }

    #[tool(
        description = "Clear the BROWSER_COMMANDS_EXECUTED gate on a session, acknowledging every browser-initiated command captured so far so ssh_exec submissions are accepted again. A no-op (still success) if the session isn't currently gated."
    )]
    async fn ssh_acknowledge_browser_commands(
        &self,
        Parameters(params): Parameters<SshAcknowledgeBrowserCommandsParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.registry.get(&params.session_name).await {
            Ok(session) => {
                session.acknowledge_browser_commands().await;
                ok_bare()
            }
            Err(e) => err_result(e),
        }
    }
}

#[tool_handler]
impl ServerHandler for SshMuxServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "sshmux-core".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "sshmux-core bridges an AI agent and one or more browser terminals onto the \
                 same live SSH shell session.\n\n\
                 Call ssh_connect to open a named session, then ssh_exec to run commands in it. \
                 The same shell is visible to any browser terminal watching the session's \
                 ssh_get_monitoring_url -- output from either side is broadcast to both.\n\n\
                 If a human runs commands in the browser terminal while you weren't looking, \
                 your next ssh_exec fails with error BROWSER_COMMANDS_EXECUTED and a \
                 browserCommands payload listing what ran and its output. Review it, then call \
                 ssh_acknowledge_browser_commands to resume.\n\n\
                 Use ssh_cancel_command to interrupt a stuck command, or pass cancel=true and \
                 waitToCancelMs on ssh_exec to auto-interrupt after a deadline. ssh_disconnect \
                 closes a session when you're done with it."
                    .to_string(),
            ),
        }
    }
}
