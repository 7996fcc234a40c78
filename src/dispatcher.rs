//! Command Dispatcher: the single point of serialization between the MCP
//! agent channel and the browser terminal channel for one session's PTY.
//!
//! This module is the pure state machine only: it decides what bytes to
//! write, what to broadcast, and when a command has finished, but it never
//! touches a socket. The async orchestration (writing to the PTY, timing
//! idle grace, racing timeouts) lives in `session.rs`, which holds a session
//! lock around every call into a `Dispatcher`.

use crate::browser_buffer::BrowserCommandRecord;
use crate::error::{CoreError, CoreResult};
use crate::history::SourceTag;
use regex::Regex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// FIFO submission queue depth.
pub const QUEUE_CAPACITY: usize = 100;

/// A command is discarded unexecuted if it sits in the queue this long.
pub const STALE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Default per-command timeout when a session doesn't override it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Smallest accepted `wait_ms` for a declared auto-cancel.
pub const MIN_AUTO_CANCEL_MS: u64 = 1000;

/// Signal byte written to the PTY to interrupt the running command (`^C`).
pub const INTERRUPT_BYTE: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    Browser,
    Mcp,
}

impl Initiator {
    fn user_echo_tag(self) -> SourceTag {
        match self {
            Initiator::Browser => SourceTag::UserCommandEcho,
            Initiator::Mcp => SourceTag::ClaudeCommandEcho,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Completed,
    Interrupted,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    BrowserSignal,
    McpCancel,
    AutoCancel,
    Timeout,
}

impl CancelReason {
    fn status(self) -> CommandStatus {
        match self {
            CancelReason::BrowserSignal => CommandStatus::Interrupted,
            CancelReason::McpCancel | CancelReason::AutoCancel => CommandStatus::Cancelled,
            CancelReason::Timeout => CommandStatus::TimedOut,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub id: String,
    pub stdout: String,
    /// Always empty: a PTY multiplexes stdout/stderr onto one stream.
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub status: CommandStatus,
}

/// A submission from either channel, not yet admitted to the queue.
pub struct CommandRequest {
    pub command: String,
    pub initiator: Initiator,
    /// Browser-supplied id, if any; MCP submissions always get a generated one.
    pub command_id: Option<String>,
    /// Validated `wait_ms` auto-cancel declaration (>= `MIN_AUTO_CANCEL_MS`).
    pub auto_cancel_after: Option<Duration>,
    pub timeout: Duration,
}

struct QueuedCommand {
    id: String,
    command: String,
    initiator: Initiator,
    queued_at: Instant,
    auto_cancel_after: Option<Duration>,
    timeout: Duration,
    completion: oneshot::Sender<CommandOutcome>,
}

/// Bytes the caller must actually perform as a result of a dispatcher call.
pub struct StartedCommand {
    pub id: String,
    pub initiator: Initiator,
    pub timeout: Duration,
    pub auto_cancel_after: Option<Duration>,
    /// Bytes to write to the PTY stdin.
    pub write_bytes: Vec<u8>,
    /// When `Some`, the caller must broadcast this as a `ClaudeCommandEcho`
    /// frame *before* writing `write_bytes`, so browsers see what the agent
    /// typed. `None` for browser-initiated commands, whose own echo will
    /// arrive naturally through the PTY's remote echo.
    pub synthetic_echo: Option<Vec<u8>>,
}

/// What the caller should do with one already line-delimited chunk of raw
/// ingress (a full line including its trailing `\r\n`, or the still-open
/// tail with no terminator yet).
pub enum LineEffect {
    /// Fan this line out to listeners and the History Store under `tag`.
    Broadcast(SourceTag),
    /// Drop this line entirely: either it is the real PTY echo of an
    /// MCP-submitted command (already covered by a synthetic echo) or it is
    /// the hidden exit-code sentinel line.
    Suppress,
}

struct ExecutingState {
    id: String,
    command: String,
    initiator: Initiator,
    stdout: Vec<u8>,
    echo_consumed: bool,
    timeout: Duration,
    auto_cancel_after: Option<Duration>,
    cancel_reason: Option<CancelReason>,
    exit_code: Option<i32>,
    completion: oneshot::Sender<CommandOutcome>,
}

/// Bookkeeping handed back to the caller when a command finishes, alongside
/// the `CommandOutcome` already delivered through its own completion channel
/// (the caller needs this copy to decide whether to record it in the Browser
/// Command Buffer and whether to flip the gating flag's visible state).
pub struct FinalizedCommand {
    pub id: String,
    pub command: String,
    pub initiator: Initiator,
    pub outcome: CommandOutcome,
}

static EXIT_SENTINEL: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();

fn exit_sentinel_regex() -> &'static Regex {
    EXIT_SENTINEL.get_or_init(|| Regex::new(r"^__sshmux_exit:(-?\d+)__\s*$").unwrap())
}

/// Serializes command execution over one session's PTY and detects
/// completion via the installed prompt regex.
pub struct Dispatcher {
    prompt_regex: Regex,
    queue: VecDeque<QueuedCommand>,
    executing: Option<ExecutingState>,
    browser_commands_executed: bool,
}

impl Dispatcher {
    #[must_use]
    pub fn new(prompt_regex: Regex) -> Self {
        Self {
            prompt_regex,
            queue: VecDeque::new(),
            executing: None,
            browser_commands_executed: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.executing.is_none()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn browser_commands_executed(&self) -> bool {
        self.browser_commands_executed
    }

    pub fn acknowledge_browser_commands(&mut self) {
        self.browser_commands_executed = false;
    }

    /// Admit a command to the FIFO queue. Rejects MCP submissions while
    /// unacknowledged browser commands are outstanding, and rejects any
    /// submission once the queue is at capacity.
    pub fn enqueue(
        &mut self,
        req: CommandRequest,
        pending_browser_commands: impl FnOnce() -> Vec<BrowserCommandRecord>,
    ) -> CoreResult<(String, oneshot::Receiver<CommandOutcome>)> {
        if req.initiator == Initiator::Mcp && self.browser_commands_executed {
            return Err(CoreError::BrowserCommandsExecuted {
                browser_commands: pending_browser_commands(),
            });
        }
        if self.queue.len() >= QUEUE_CAPACITY {
            return Err(CoreError::QueueFull);
        }
        let id = req
            .command_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (tx, rx) = oneshot::channel();
        self.queue.push_back(QueuedCommand {
            id: id.clone(),
            command: req.command,
            initiator: req.initiator,
            queued_at: Instant::now(),
            auto_cancel_after: req.auto_cancel_after,
            timeout: req.timeout,
            completion: tx,
        });
        Ok((id, rx))
    }

    /// Pop the next non-stale command off the queue and begin executing it.
    /// Stale commands (queued longer than `STALE_THRESHOLD`) are resolved in
    /// place with `CommandStatus::Cancelled` and skipped. Returns `None` if
    /// the queue is empty or a command is already executing.
    pub fn try_start_next(&mut self) -> Option<StartedCommand> {
        if self.executing.is_some() {
            return None;
        }
        while let Some(next) = self.queue.pop_front() {
            if next.queued_at.elapsed() > STALE_THRESHOLD {
                let _ = next.completion.send(CommandOutcome {
                    id: next.id,
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: None,
                    status: CommandStatus::Cancelled,
                });
                continue;
            }
            let synthetic_echo = match next.initiator {
                Initiator::Mcp => Some(format!("{}\r\n", next.command).into_bytes()),
                Initiator::Browser => None,
            };
            let mut write_bytes = next.command.clone().into_bytes();
            write_bytes.push(b'\n');
            self.executing = Some(ExecutingState {
                id: next.id.clone(),
                command: next.command,
                initiator: next.initiator,
                stdout: Vec::new(),
                echo_consumed: false,
                timeout: next.timeout,
                auto_cancel_after: next.auto_cancel_after,
                cancel_reason: None,
                exit_code: None,
                completion: next.completion,
            });
            return Some(StartedCommand {
                id: next.id,
                initiator: next.initiator,
                timeout: next.timeout,
                auto_cancel_after: next.auto_cancel_after,
                write_bytes,
                synthetic_echo,
            });
        }
        None
    }

    /// Classify one complete, newline-terminated line of raw ingress arriving
    /// while a command is executing. Returns `None` if nothing is executing
    /// (the caller should broadcast such lines as plain `CommandOutput`
    /// itself; this only governs lines attributed to a running command).
    pub fn ingest_line(&mut self, line: &[u8]) -> Option<LineEffect> {
        let exec = self.executing.as_mut()?;

        if let Some(caps) = exit_sentinel_regex().captures(strip_crlf(line)) {
            if let Ok(code) = caps[1].parse::<i32>() {
                exec.exit_code = Some(code);
            }
            return Some(LineEffect::Suppress);
        }

        if !exec.echo_consumed {
            exec.echo_consumed = true;
            return Some(match exec.initiator {
                Initiator::Mcp => LineEffect::Suppress,
                Initiator::Browser => LineEffect::Broadcast(exec.initiator.user_echo_tag()),
            });
        }

        exec.stdout.extend_from_slice(line);
        Some(LineEffect::Broadcast(SourceTag::CommandOutput))
    }

    /// Raw prompt-regex match against an unterminated tail, independent of
    /// whether a command is executing. Used to detect the end of the
    /// startup banner, before any command has ever run.
    #[must_use]
    pub fn prompt_tail_matches(&self, tail: &[u8]) -> bool {
        std::str::from_utf8(tail)
            .map(|text| self.prompt_regex.is_match(text))
            .unwrap_or(false)
    }

    /// Test whether an unterminated tail (bytes since the last line
    /// terminator) looks like a freshly rendered prompt, closing out the
    /// currently executing command. The caller debounces this with an
    /// idle-grace timer before treating a match as final: completion is only
    /// declared once the tail is both a prompt match and has gone quiet.
    #[must_use]
    pub fn looks_like_prompt(&self, tail: &[u8]) -> bool {
        self.executing.is_some() && self.prompt_tail_matches(tail)
    }

    /// Finalize the currently executing command as completed (the idle-grace
    /// timer elapsed after a prompt match). No-op if nothing is executing.
    pub fn finalize_completion(&mut self) -> Option<FinalizedCommand> {
        let exec = self.executing.take()?;
        let status = exec
            .cancel_reason
            .map(CancelReason::status)
            .unwrap_or(CommandStatus::Completed);
        let outcome = CommandOutcome {
            id: exec.id.clone(),
            stdout: String::from_utf8_lossy(&exec.stdout).into_owned(),
            stderr: String::new(),
            exit_code: exec.exit_code,
            status,
        };
        if exec.initiator == Initiator::Browser {
            self.browser_commands_executed = true;
        }
        let _ = exec.completion.send(outcome.clone());
        Some(FinalizedCommand {
            id: exec.id,
            command: exec.command,
            initiator: exec.initiator,
            outcome,
        })
    }

    /// Request cancellation of the currently executing command, returning the
    /// bytes to write to the PTY (a single `^C`). Errs with
    /// `NoActiveMcpCommand` if nothing is executing or `id` doesn't match.
    pub fn request_cancel(&mut self, id: &str, reason: CancelReason) -> CoreResult<Vec<u8>> {
        match self.executing.as_mut() {
            Some(exec) if exec.id == id => {
                if exec.cancel_reason.is_some() {
                    return Ok(Vec::new());
                }
                exec.cancel_reason = Some(reason);
                Ok(vec![INTERRUPT_BYTE])
            }
            _ => Err(CoreError::NoActiveMcpCommand),
        }
    }

    /// Currently executing command's id and initiator, if any.
    #[must_use]
    pub fn executing_id(&self) -> Option<&str> {
        self.executing.as_ref().map(|e| e.id.as_str())
    }

    /// Drain every queued and executing command with `CommandStatus::Cancelled`.
    pub fn drain_shutdown(&mut self) {
        while let Some(cmd) = self.queue.pop_front() {
            let _ = cmd.completion.send(CommandOutcome {
                id: cmd.id,
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
                status: CommandStatus::Cancelled,
            });
        }
        if let Some(exec) = self.executing.take() {
            let _ = exec.completion.send(CommandOutcome {
                id: exec.id,
                stdout: String::from_utf8_lossy(&exec.stdout).into_owned(),
                stderr: String::new(),
                exit_code: exec.exit_code,
                status: CommandStatus::Cancelled,
            });
        }
    }
}

fn strip_crlf(line: &[u8]) -> &str {
    let text = std::str::from_utf8(line).unwrap_or("");
    text.trim_end_matches(['\r', '\n'])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt_regex() -> Regex {
        Regex::new(r"^\[user@host [^\]]*\]\$ $").unwrap()
    }

    fn request(command: &str, initiator: Initiator) -> CommandRequest {
        CommandRequest {
            command: command.to_string(),
            initiator,
            command_id: None,
            auto_cancel_after: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[test]
    fn mcp_submission_is_rejected_while_browser_commands_are_unacknowledged() {
        let mut d = Dispatcher::new(prompt_regex());
        d.browser_commands_executed = true;
        let err = d
            .enqueue(request("echo hi", Initiator::Mcp), Vec::new)
            .unwrap_err();
        assert_eq!(err.code(), "BROWSER_COMMANDS_EXECUTED");
    }

    #[test]
    fn browser_submission_is_never_gated() {
        let mut d = Dispatcher::new(prompt_regex());
        d.browser_commands_executed = true;
        assert!(d.enqueue(request("ls", Initiator::Browser), Vec::new).is_ok());
    }

    #[test]
    fn queue_rejects_past_capacity() {
        let mut d = Dispatcher::new(prompt_regex());
        for _ in 0..QUEUE_CAPACITY {
            d.enqueue(request("true", Initiator::Browser), Vec::new)
                .unwrap();
        }
        let err = d
            .enqueue(request("true", Initiator::Browser), Vec::new)
            .unwrap_err();
        assert_eq!(err.code(), "QUEUE_FULL");
    }

    #[test]
    fn mcp_echo_is_suppressed_and_browser_echo_is_not() {
        let mut d = Dispatcher::new(prompt_regex());
        let (id, _rx) = d
            .enqueue(request("echo hi", Initiator::Mcp), Vec::new)
            .unwrap();
        let started = d.try_start_next().unwrap();
        assert_eq!(started.id, id);
        assert!(started.synthetic_echo.is_some());
        assert!(matches!(
            d.ingest_line(b"echo hi\r\n"),
            Some(LineEffect::Suppress)
        ));

        let mut d2 = Dispatcher::new(prompt_regex());
        d2.enqueue(request("echo hi", Initiator::Browser), Vec::new)
            .unwrap();
        let started2 = d2.try_start_next().unwrap();
        assert!(started2.synthetic_echo.is_none());
        assert!(matches!(
            d2.ingest_line(b"echo hi\r\n"),
            Some(LineEffect::Broadcast(SourceTag::UserCommandEcho))
        ));
    }

    #[test]
    fn exit_sentinel_is_parsed_and_suppressed() {
        let mut d = Dispatcher::new(prompt_regex());
        d.enqueue(request("false", Initiator::Browser), Vec::new)
            .unwrap();
        d.try_start_next().unwrap();
        d.ingest_line(b"false\r\n"); // echo
        assert!(matches!(
            d.ingest_line(b"__sshmux_exit:1__\r\n"),
            Some(LineEffect::Suppress)
        ));
        d.finalize_completion();
    }

    #[test]
    fn completion_populates_stdout_and_exit_code() {
        let mut d = Dispatcher::new(prompt_regex());
        let (_id, rx) = d
            .enqueue(request("echo hi", Initiator::Browser), Vec::new)
            .unwrap();
        d.try_start_next().unwrap();
        d.ingest_line(b"echo hi\r\n");
        d.ingest_line(b"hi\r\n");
        d.ingest_line(b"__sshmux_exit:0__\r\n");
        assert!(d.looks_like_prompt(b"[user@host ~]$ "));
        d.finalize_completion();
        let outcome = rx.try_recv().unwrap();
        assert_eq!(outcome.stdout, "hi\r\n");
        assert_eq!(outcome.exit_code, Some(0));
        assert!(matches!(outcome.status, CommandStatus::Completed));
    }

    #[test]
    fn stale_command_is_discarded_without_executing() {
        let mut d = Dispatcher::new(prompt_regex());
        let (_id, rx) = d
            .enqueue(request("true", Initiator::Browser), Vec::new)
            .unwrap();
        if let Some(q) = d.queue.front_mut() {
            q.queued_at = Instant::now() - STALE_THRESHOLD - Duration::from_secs(1);
        }
        assert!(d.try_start_next().is_none());
        let outcome = rx.try_recv().unwrap();
        assert!(matches!(outcome.status, CommandStatus::Cancelled));
    }

    #[test]
    fn cancel_targets_only_the_executing_command() {
        let mut d = Dispatcher::new(prompt_regex());
        let (id, _rx) = d
            .enqueue(request("sleep 5", Initiator::Mcp), Vec::new)
            .unwrap();
        d.try_start_next().unwrap();
        assert!(d.request_cancel("not-the-id", CancelReason::McpCancel).is_err());
        let bytes = d.request_cancel(&id, CancelReason::McpCancel).unwrap();
        assert_eq!(bytes, vec![INTERRUPT_BYTE]);
    }

    #[test]
    fn cancelled_command_resolves_with_cancelled_status() {
        let mut d = Dispatcher::new(prompt_regex());
        let (id, rx) = d
            .enqueue(request("sleep 5", Initiator::Mcp), Vec::new)
            .unwrap();
        d.try_start_next().unwrap();
        d.request_cancel(&id, CancelReason::Timeout).unwrap();
        d.finalize_completion();
        let outcome = rx.try_recv().unwrap();
        assert!(matches!(outcome.status, CommandStatus::TimedOut));
    }

    #[test]
    fn browser_completion_sets_gating_flag() {
        let mut d = Dispatcher::new(prompt_regex());
        assert!(!d.browser_commands_executed());
        d.enqueue(request("ls", Initiator::Browser), Vec::new)
            .unwrap();
        d.try_start_next().unwrap();
        d.finalize_completion();
        assert!(d.browser_commands_executed());
        d.acknowledge_browser_commands();
        assert!(!d.browser_commands_executed());
    }

    #[test]
    fn shutdown_drain_resolves_queued_and_executing_commands() {
        let mut d = Dispatcher::new(prompt_regex());
        let (_id1, rx1) = d
            .enqueue(request("one", Initiator::Browser), Vec::new)
            .unwrap();
        let (_id2, rx2) = d
            .enqueue(request("two", Initiator::Browser), Vec::new)
            .unwrap();
        d.try_start_next().unwrap();
        d.drain_shutdown();
        assert!(matches!(
            rx1.try_recv().unwrap().status,
            CommandStatus::Cancelled
        ));
        assert!(matches!(
            rx2.try_recv().unwrap().status,
            CommandStatus::Cancelled
        ));
    }
}
