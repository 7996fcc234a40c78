//! Wires one session's PTY transport, Command Dispatcher, Output
//! Broadcaster, and Browser Command Buffer together into the orchestration
//! loop: one shared PTY, two independent callers, one completion detector.

use crate::browser_buffer::{BrowserCommandBuffer, BrowserCommandRecord, CommandOutcome as BrowserOutcome};
use crate::broadcaster::OutputBroadcaster;
use crate::dispatcher::{
    CancelReason, CommandOutcome, CommandRequest, CommandStatus, Dispatcher, FinalizedCommand, Initiator,
    LineEffect, DEFAULT_TIMEOUT, MIN_AUTO_CANCEL_MS,
};
use crate::error::{CoreError, CoreResult};
use crate::history::{HistoryEntry, SourceTag};
use crate::listener::{ListenerHandle, ListenerId};
use crate::ssh::{ConnectParams, IngressEvent, PtyTransport, SshPty, IDLE_GRACE};
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Where a session sits in its connect/execute/teardown lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Connecting,
    Ready,
    Busy,
    Disposing,
    Gone,
}

struct SessionShared {
    dispatcher: Dispatcher,
    broadcaster: OutputBroadcaster,
    browser_buffer: BrowserCommandBuffer,
    lifecycle: LifecycleState,
}

enum TransportCommand {
    Write(Vec<u8>),
    Resize(u32, u32),
}

/// Cheap, cloneable handle to the task that owns the real PTY transport.
#[derive(Clone)]
struct TransportHandle {
    cmd_tx: mpsc::Sender<TransportCommand>,
}

impl TransportHandle {
    async fn write_all(&self, data: Vec<u8>) -> CoreResult<()> {
        self.cmd_tx
            .send(TransportCommand::Write(data))
            .await
            .map_err(|_| CoreError::SshTransport("transport pump has shut down".into()))
    }

    async fn resize(&self, cols: u32, rows: u32) -> CoreResult<()> {
        self.cmd_tx
            .send(TransportCommand::Resize(cols, rows))
            .await
            .map_err(|_| CoreError::SshTransport("transport pump has shut down".into()))
    }
}

/// Public submission surface used by both `ssh_exec` (MCP) and
/// `terminal_input` (browser WebSocket frames).
pub struct SubmitRequest {
    pub command: String,
    pub initiator: Initiator,
    pub command_id: Option<String>,
    pub wait_ms: Option<u64>,
    pub cancel: bool,
    pub timeout: Option<Duration>,
}

pub struct Session {
    pub name: String,
    pub user: String,
    pub host: String,
    shared: Arc<Mutex<SessionShared>>,
    transport: TransportHandle,
    pump_task: JoinHandle<()>,
    ingress_task: JoinHandle<()>,
    closed: Arc<AtomicBool>,
    default_timeout: Duration,
}

impl Session {
    /// Open a real SSH-backed session: connect, authenticate, allocate a
    /// PTY, install the fixed prompt, and start the ingress/dispatch loop.
    pub async fn connect(
        name: String,
        params: ConnectParams,
        default_timeout: Duration,
    ) -> CoreResult<Self> {
        let transport = SshPty::connect(&params).await?;
        let prompt_regex = crate::ssh::prompt_regex(&params.username, &params.host);
        let session = Self::from_transport(
            name,
            params.username.clone(),
            params.host.clone(),
            prompt_regex,
            Box::new(transport),
            default_timeout,
        );
        session
            .transport
            .write_all(crate::ssh::shell_setup_command(&params.username, &params.host).into_bytes())
            .await?;
        Ok(session)
    }

    fn from_transport(
        name: String,
        user: String,
        host: String,
        prompt_regex: Regex,
        transport: Box<dyn PtyTransport>,
        default_timeout: Duration,
    ) -> Self {
        let shared = Arc::new(Mutex::new(SessionShared {
            dispatcher: Dispatcher::new(prompt_regex),
            broadcaster: OutputBroadcaster::new(),
            browser_buffer: BrowserCommandBuffer::new(),
            lifecycle: LifecycleState::Connecting,
        }));

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (ingress_tx, ingress_rx) = mpsc::channel(256);
        let pump_task = tokio::spawn(run_transport_pump(transport, cmd_rx, ingress_tx));

        let transport_handle = TransportHandle { cmd_tx };
        let closed = Arc::new(AtomicBool::new(false));

        let ingress_task = tokio::spawn(run_ingress_loop(
            shared.clone(),
            transport_handle.clone(),
            ingress_rx,
            closed.clone(),
            name.clone(),
        ));

        Self {
            name,
            user,
            host,
            shared,
            transport: transport_handle,
            pump_task,
            ingress_task,
            closed,
            default_timeout,
        }
    }

    /// Submit a command from either initiator. Resolves the gating check,
    /// the FIFO queue, and staleness before ever touching the PTY.
    pub async fn submit(&self, req: SubmitRequest) -> CoreResult<oneshot::Receiver<CommandOutcome>> {
        if req.cancel {
            let wait_ms = req.wait_ms.unwrap_or(0);
            if wait_ms < MIN_AUTO_CANCEL_MS {
                return Err(CoreError::Validation(format!(
                    "wait_ms must be >= {MIN_AUTO_CANCEL_MS} when cancel=true"
                )));
            }
        }
        let auto_cancel_after = if req.cancel {
            req.wait_ms.map(Duration::from_millis)
        } else {
            None
        };

        let mut guard = self.shared.lock().await;
        let pending = guard.browser_buffer.snapshot();
        let (_id, rx) = guard.dispatcher.enqueue(
            CommandRequest {
                command: req.command,
                initiator: req.initiator,
                command_id: req.command_id,
                auto_cancel_after,
                timeout: req.timeout.unwrap_or(self.default_timeout),
            },
            || pending,
        )?;
        guard.lifecycle = LifecycleState::Busy;
        pump_next(&self.shared, &self.transport, &mut guard).await;
        Ok(rx)
    }

    /// The id of the command currently executing, if any — used by
    /// `terminal_signal` frames, which target "whatever is running" rather
    /// than a specific id.
    pub async fn current_command_id(&self) -> Option<String> {
        self.shared
            .lock()
            .await
            .dispatcher
            .executing_id()
            .map(str::to_string)
    }

    pub async fn cancel(&self, id: &str, reason: CancelReason) -> CoreResult<()> {
        let mut guard = self.shared.lock().await;
        let bytes = guard.dispatcher.request_cancel(id, reason)?;
        drop(guard);
        if !bytes.is_empty() {
            self.transport.write_all(bytes).await?;
        }
        Ok(())
    }

    pub async fn resize(&self, cols: u32, rows: u32) -> CoreResult<()> {
        self.transport.resize(cols, rows).await
    }

    pub async fn attach_listener(&self) -> (Vec<HistoryEntry>, ListenerHandle) {
        let mut guard = self.shared.lock().await;
        guard.broadcaster.attach()
    }

    pub async fn detach_listener(&self, id: ListenerId) {
        let mut guard = self.shared.lock().await;
        guard.broadcaster.detach(id);
    }

    pub async fn acknowledge_browser_commands(&self) {
        let mut guard = self.shared.lock().await;
        guard.dispatcher.acknowledge_browser_commands();
        guard.browser_buffer.clear();
    }

    pub async fn pending_browser_commands(&self) -> Vec<BrowserCommandRecord> {
        let guard = self.shared.lock().await;
        guard.browser_buffer.snapshot()
    }

    pub async fn lifecycle(&self) -> LifecycleState {
        self.shared.lock().await.lifecycle
    }

    /// Drain every in-flight and queued command and tear down the session's
    /// background tasks.
    pub async fn shutdown(&self) {
        {
            let mut guard = self.shared.lock().await;
            guard.lifecycle = LifecycleState::Disposing;
            guard.dispatcher.drain_shutdown();
        }
        self.closed.store(true, Ordering::SeqCst);
        self.ingress_task.abort();
        self.pump_task.abort();
    }
}

async fn pump_next(shared: &Arc<Mutex<SessionShared>>, transport: &TransportHandle, guard: &mut SessionShared) {
    if let Some(started) = guard.dispatcher.try_start_next() {
        if let Some(echo) = started.synthetic_echo {
            guard.broadcaster.broadcast(echo, SourceTag::ClaudeCommandEcho);
        }
        if transport.write_all(started.write_bytes).await.is_err() {
            tracing::warn!("failed to write command to PTY");
        }
        spawn_watchdogs(
            shared.clone(),
            transport.clone(),
            started.id,
            started.timeout,
            started.auto_cancel_after,
        );
    } else {
        guard.lifecycle = LifecycleState::Ready;
    }
}

/// Arms the two alarms a just-started command can carry: its own timeout
/// (default 15s) and, when declared, an auto-cancel at `wait_ms`.
/// Both race the command's real completion; whichever fires first against a
/// command id that's still executing sends one `^C` and lets the resulting
/// prompt resolve the command as `TimedOut`/`Cancelled` normally. A watchdog
/// firing after the command already finished is a silent no-op: the
/// dispatcher only honors a cancel request against the id it's currently
/// executing.
fn spawn_watchdogs(
    shared: Arc<Mutex<SessionShared>>,
    transport: TransportHandle,
    id: String,
    timeout: Duration,
    auto_cancel_after: Option<Duration>,
) {
    let shared_timeout = shared.clone();
    let transport_timeout = transport.clone();
    let id_timeout = id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        fire_cancel(&shared_timeout, &transport_timeout, &id_timeout, CancelReason::Timeout).await;
    });

    if let Some(delay) = auto_cancel_after {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire_cancel(&shared, &transport, &id, CancelReason::AutoCancel).await;
        });
    }
}

async fn fire_cancel(
    shared: &Arc<Mutex<SessionShared>>,
    transport: &TransportHandle,
    id: &str,
    reason: CancelReason,
) {
    let bytes = {
        let mut guard = shared.lock().await;
        guard.dispatcher.request_cancel(id, reason)
    };
    if let Ok(bytes) = bytes {
        if !bytes.is_empty() {
            let _ = transport.write_all(bytes).await;
        }
    }
}

async fn run_transport_pump(
    mut transport: Box<dyn PtyTransport>,
    mut cmd_rx: mpsc::Receiver<TransportCommand>,
    ingress_tx: mpsc::Sender<IngressEvent>,
) {
    loop {
        tokio::select! {
            event = transport.recv() => {
                let closing = matches!(event, IngressEvent::Closed | IngressEvent::Eof);
                if ingress_tx.send(event).await.is_err() || closing {
                    break;
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(TransportCommand::Write(data)) => {
                        if let Err(err) = transport.write_all(&data).await {
                            tracing::warn!(%err, "pty write failed");
                        }
                    }
                    Some(TransportCommand::Resize(cols, rows)) => {
                        if let Err(err) = transport.resize(cols, rows).await {
                            tracing::warn!(%err, "pty resize failed");
                        }
                    }
                    None => break,
                }
            }
        }
    }
}

fn find_line_end(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn record_if_browser(guard: &mut SessionShared, finalized: FinalizedCommand) {
    if finalized.initiator != Initiator::Browser {
        return;
    }
    guard.browser_buffer.push(BrowserCommandRecord {
        command_string: finalized.command,
        command_id: finalized.id,
        timestamp_ms: now_ms(),
        source: "user",
        result: BrowserOutcome {
            stdout: finalized.outcome.stdout,
            stderr: finalized.outcome.stderr,
            exit_code: finalized.outcome.exit_code,
        },
    });
}

/// Consumes raw PTY bytes: splits them into lines, routes each through the
/// dispatcher for echo/exit-sentinel handling and the broadcaster for fan
/// out, filters the connect-time shell banner, and debounces prompt matches
/// with an idle-grace window before declaring a command complete.
async fn run_ingress_loop(
    shared: Arc<Mutex<SessionShared>>,
    transport: TransportHandle,
    mut ingress_rx: mpsc::Receiver<IngressEvent>,
    closed: Arc<AtomicBool>,
    session_name: String,
) {
    let mut pending_line: Vec<u8> = Vec::new();
    let mut suppressing_banner = true;
    let mut idle_deadline: Option<Instant> = None;

    loop {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        let sleep_duration = idle_deadline.map(|d| d.saturating_duration_since(Instant::now()));
        tokio::select! {
            biased;
            maybe_event = ingress_rx.recv() => {
                match maybe_event {
                    None => break,
                    Some(IngressEvent::Closed) | Some(IngressEvent::Eof) => {
                        let mut guard = shared.lock().await;
                        guard.lifecycle = LifecycleState::Gone;
                        guard.dispatcher.drain_shutdown();
                        break;
                    }
                    Some(IngressEvent::Data(bytes)) => {
                        pending_line.extend_from_slice(&bytes);
                        while let Some(pos) = find_line_end(&pending_line) {
                            let line: Vec<u8> = pending_line.drain(..=pos).collect();
                            if suppressing_banner {
                                continue;
                            }
                            let mut guard = shared.lock().await;
                            match guard.dispatcher.ingest_line(&line) {
                                Some(LineEffect::Suppress) => {}
                                Some(LineEffect::Broadcast(tag)) => {
                                    guard.broadcaster.broadcast(line, tag);
                                }
                                None => {
                                    guard.broadcaster.broadcast(line, SourceTag::CommandOutput);
                                }
                            }
                        }

                        let mut guard = shared.lock().await;
                        if suppressing_banner {
                            if guard.dispatcher.prompt_tail_matches(&pending_line) {
                                suppressing_banner = false;
                                pending_line.clear();
                                guard.lifecycle = LifecycleState::Ready;
                            }
                            idle_deadline = None;
                        } else if guard.dispatcher.looks_like_prompt(&pending_line) {
                            idle_deadline = Some(Instant::now() + IDLE_GRACE);
                        } else {
                            idle_deadline = None;
                        }
                    }
                }
            }
            _ = tokio::time::sleep(sleep_duration.unwrap_or_default()), if sleep_duration.is_some() => {
                let mut guard = shared.lock().await;
                if !pending_line.is_empty() {
                    let tail = std::mem::take(&mut pending_line);
                    guard.broadcaster.broadcast(tail, SourceTag::Prompt);
                }
                if let Some(finalized) = guard.dispatcher.finalize_completion() {
                    tracing::debug!(session = %session_name, command = %finalized.command, "command finalized");
                    record_if_browser(&mut guard, finalized);
                }
                pump_next(&shared, &transport, &mut guard).await;
                idle_deadline = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct DuplexPty {
        write_half: tokio::io::WriteHalf<DuplexStream>,
        read_half: tokio::io::ReadHalf<DuplexStream>,
    }

    impl PtyTransport for DuplexPty {
        fn write_all<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, CoreResult<()>> {
            Box::pin(async move {
                self.write_half
                    .write_all(data)
                    .await
                    .map_err(|e| CoreError::SshTransport(e.to_string()))
            })
        }

        fn resize(&mut self, _cols: u32, _rows: u32) -> BoxFuture<'_, CoreResult<()>> {
            Box::pin(async { Ok(()) })
        }

        fn recv(&mut self) -> BoxFuture<'_, IngressEvent> {
            Box::pin(async move {
                let mut buf = [0u8; 4096];
                match self.read_half.read(&mut buf).await {
                    Ok(0) => IngressEvent::Eof,
                    Ok(n) => IngressEvent::Data(buf[..n].to_vec()),
                    Err(_) => IngressEvent::Closed,
                }
            })
        }
    }

    fn test_prompt_regex() -> Regex {
        Regex::new(r"^\[user@host [^\]]*\]\$ $").unwrap()
    }

    fn new_test_session() -> (Session, tokio::io::ReadHalf<DuplexStream>, tokio::io::WriteHalf<DuplexStream>) {
        new_test_session_with_timeout(DEFAULT_TIMEOUT)
    }

    fn new_test_session_with_timeout(
        default_timeout: Duration,
    ) -> (Session, tokio::io::ReadHalf<DuplexStream>, tokio::io::WriteHalf<DuplexStream>) {
        let (server_side, client_side) = tokio::io::duplex(8192);
        let (read_half, write_half) = tokio::io::split(client_side);
        let transport = DuplexPty { write_half, read_half };
        let session = Session::from_transport(
            "t1".into(),
            "user".into(),
            "host".into(),
            test_prompt_regex(),
            Box::new(transport),
            default_timeout,
        );
        let (fake_read, fake_write) = tokio::io::split(server_side);
        (session, fake_read, fake_write)
    }

    #[tokio::test]
    async fn submitted_browser_command_completes_after_prompt_reappears() {
        let (session, _fake_read, mut fake_write) = new_test_session();

        // Clear the startup banner-suppression window before exercising a
        // real command, mirroring what the installed PS1 would produce.
        fake_write.write_all(b"Welcome\r\n[user@host ~]$ ").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(session.lifecycle().await, LifecycleState::Ready);

        let rx = session
            .submit(SubmitRequest {
                command: "echo hi".into(),
                initiator: Initiator::Browser,
                command_id: None,
                wait_ms: None,
                cancel: false,
                timeout: None,
            })
            .await
            .unwrap();

        fake_write
            .write_all(b"echo hi\r\nhi\r\n__sshmux_exit:0__\r\n[user@host ~]$ ")
            .await
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("completion did not arrive in time")
            .unwrap();
        assert_eq!(outcome.stdout, "hi\r\n");
        assert_eq!(outcome.exit_code, Some(0));

        session.shutdown().await;
    }

    #[tokio::test]
    async fn submission_with_no_explicit_timeout_uses_the_session_default() {
        let (session, _fake_read, mut fake_write) = new_test_session_with_timeout(Duration::from_millis(50));

        fake_write.write_all(b"[user@host ~]$ ").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(session.lifecycle().await, LifecycleState::Ready);

        let rx = session
            .submit(SubmitRequest {
                command: "sleep 10".into(),
                initiator: Initiator::Mcp,
                command_id: None,
                wait_ms: None,
                cancel: false,
                timeout: None,
            })
            .await
            .unwrap();

        // No completing prompt is ever written back, so the only way this
        // resolves within the assertion's own timeout is the session's
        // configured default deadline firing.
        let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("command did not time out using the session default")
            .unwrap();
        assert_eq!(outcome.status, CommandStatus::TimedOut);

        session.shutdown().await;
    }

    #[tokio::test]
    async fn browser_command_is_recorded_and_gates_mcp_submissions() {
        let (session, _fake_read, mut fake_write) = new_test_session();
        fake_write.write_all(b"[user@host ~]$ ").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let _rx = session
            .submit(SubmitRequest {
                command: "ls".into(),
                initiator: Initiator::Browser,
                command_id: None,
                wait_ms: None,
                cancel: false,
                timeout: None,
            })
            .await
            .unwrap();
        fake_write
            .write_all(b"ls\r\nfile.txt\r\n__sshmux_exit:0__\r\n[user@host ~]$ ")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let pending = session.pending_browser_commands().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].command_string, "ls");

        let err = session
            .submit(SubmitRequest {
                command: "echo from-agent".into(),
                initiator: Initiator::Mcp,
                command_id: None,
                wait_ms: None,
                cancel: false,
                timeout: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BROWSER_COMMANDS_EXECUTED");

        session.acknowledge_browser_commands().await;
        assert!(session.pending_browser_commands().await.is_empty());

        session.shutdown().await;
    }
}
