//! Remote PTY transport: opens an SSH-backed shell channel and installs the
//! prompt this session's Command Dispatcher relies on for completion
//! detection.
//!
//! Connect, authenticate, `request_pty`, `request_shell`, then drive the
//! channel with `Channel::wait()` rather than a byte stream — a shell
//! running on the far end of a network connection instead of a child
//! process on this host.

use crate::error::{CoreError, CoreResult};
use futures::future::BoxFuture;
use regex::Regex;
use russh::client::{self, Handler};
use russh::ChannelMsg;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// PTY terminal type requested for every session.
pub const TERMINAL_TYPE: &str = "xterm-256color";
pub const DEFAULT_COLS: u32 = 80;
pub const DEFAULT_ROWS: u32 = 24;

/// Installed once, right after the shell starts, ahead of the first real
/// prompt. Produces the clean, fixed-format prompt the dispatcher's regex
/// matches, plus a hidden sentinel line carrying the previous command's exit
/// code, since the prompt alone carries no exit status.
pub fn shell_setup_command(username: &str, host: &str) -> String {
    let user = shell_quote_segment(username);
    let host = shell_quote_segment(host);
    format!(
        "export PS1='[{user}@{host} '\"'\"'$(pwd)'\"'\"']\\$ ' PS2='' 2>/dev/null\n\
         export PROMPT_COMMAND='echo \"__sshmux_exit:$?__\"'\n"
    )
}

/// Escapes a value for embedding inside the single-quoted `PS1` segment
/// above, using the standard `'\''`-close-escape-reopen trick.
fn shell_quote_segment(value: &str) -> String {
    value.replace('\'', "'\\''")
}

/// Matches the fixed prompt installed by [`shell_setup_command`]. Shared
/// between the dispatcher (completion detection) and the ingress banner
/// filter.
#[must_use]
pub fn prompt_regex(username: &str, host: &str) -> Regex {
    let user = regex::escape(username);
    let host = regex::escape(host);
    let pattern = format!(r"^\[{user}@{host} [^\]]*\]\$ $");
    Regex::new(&pattern).unwrap()
}

#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub key_file_path: Option<String>,
}

impl ConnectParams {
    /// Expand a leading `~` or `~/` in `key_file_path` to the process user's
    /// home directory. Any other position of `~` is passed through verbatim.
    fn resolved_key_path(&self) -> Option<String> {
        let raw = self.key_file_path.as_ref()?;
        if let Some(rest) = raw.strip_prefix("~/") {
            let home = dirs::home_dir().unwrap_or_else(|| Path::new("/").to_path_buf());
            return Some(home.join(rest).to_string_lossy().into_owned());
        }
        if raw == "~" {
            return dirs::home_dir().map(|h| h.to_string_lossy().into_owned());
        }
        Some(raw.clone())
    }
}

struct AcceptAllKeys;

impl Handler for AcceptAllKeys {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// One byte-oriented event read off the remote channel.
pub enum IngressEvent {
    Data(Vec<u8>),
    Eof,
    Closed,
}

/// Abstracts the byte-oriented half of a PTY-backed channel so the session
/// orchestration loop in `session.rs` can run against either a real SSH
/// channel or an in-process fake transport in tests.
pub trait PtyTransport: Send {
    fn write_all<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, CoreResult<()>>;
    fn resize(&mut self, cols: u32, rows: u32) -> BoxFuture<'_, CoreResult<()>>;
    fn recv(&mut self) -> BoxFuture<'_, IngressEvent>;
}

/// Production transport: a live SSH channel with an allocated PTY and shell.
pub struct SshPty {
    channel: russh::Channel<client::Msg>,
    /// Kept alive only so the underlying connection isn't dropped; never
    /// used directly once the channel is open.
    _handle: client::Handle<AcceptAllKeys>,
}

impl SshPty {
    pub async fn connect(params: &ConnectParams) -> CoreResult<Self> {
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, (params.host.as_str(), params.port), AcceptAllKeys)
            .await
            .map_err(|e| CoreError::SshTransport(format!("connect failed: {e}")))?;

        Self::authenticate(&mut handle, params).await?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| CoreError::SshTransport(format!("channel open failed: {e}")))?;

        channel
            .request_pty(
                true,
                TERMINAL_TYPE,
                DEFAULT_COLS,
                DEFAULT_ROWS,
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| CoreError::SshTransport(format!("pty request failed: {e}")))?;

        channel
            .request_shell(true)
            .await
            .map_err(|e| CoreError::SshTransport(format!("shell request failed: {e}")))?;

        Ok(Self {
            channel,
            _handle: handle,
        })
    }

    async fn authenticate(
        handle: &mut client::Handle<AcceptAllKeys>,
        params: &ConnectParams,
    ) -> CoreResult<()> {
        if let Some(password) = &params.password {
            let result = handle
                .authenticate_password(&params.username, password)
                .await
                .map_err(|e| CoreError::SshTransport(format!("password auth failed: {e}")))?;
            return match result {
                client::AuthResult::Success => Ok(()),
                _ => Err(CoreError::SshTransport("password authentication rejected".into())),
            };
        }

        let key_path = params
            .resolved_key_path()
            .ok_or_else(|| CoreError::Validation("neither password nor keyFilePath supplied".into()))?;
        let keypair = russh::keys::load_secret_key(&key_path, None)
            .map_err(|e| CoreError::SshTransport(format!("failed to load key '{key_path}': {e}")))?;
        let result = handle
            .authenticate_publickey(
                &params.username,
                russh::keys::PrivateKeyWithHashAlg::new(
                    Arc::new(keypair),
                    Some(russh::keys::HashAlg::Sha256),
                ),
            )
            .await
            .map_err(|e| CoreError::SshTransport(format!("public key auth failed: {e}")))?;
        match result {
            client::AuthResult::Success => Ok(()),
            _ => Err(CoreError::SshTransport("public key authentication rejected".into())),
        }
    }
}

impl PtyTransport for SshPty {
    fn write_all<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, CoreResult<()>> {
        Box::pin(async move {
            self.channel
                .data(data)
                .await
                .map_err(|e| CoreError::SshTransport(format!("write failed: {e}")))
        })
    }

    fn resize(&mut self, cols: u32, rows: u32) -> BoxFuture<'_, CoreResult<()>> {
        Box::pin(async move {
            self.channel
                .window_change(cols, rows, 0, 0)
                .await
                .map_err(|e| CoreError::SshTransport(format!("resize failed: {e}")))
        })
    }

    fn recv(&mut self) -> BoxFuture<'_, IngressEvent> {
        Box::pin(async move {
            loop {
                match self.channel.wait().await {
                    Some(ChannelMsg::Data { data }) => return IngressEvent::Data(data.to_vec()),
                    Some(ChannelMsg::ExtendedData { data, .. }) => {
                        return IngressEvent::Data(data.to_vec())
                    }
                    Some(ChannelMsg::Eof) => return IngressEvent::Eof,
                    Some(ChannelMsg::Close) => return IngressEvent::Closed,
                    Some(_) => continue,
                    None => return IngressEvent::Closed,
                }
            }
        })
    }
}

/// Idle-grace debounce applied after a prompt-regex match before completion
/// is declared final.
pub const IDLE_GRACE: Duration = Duration::from_millis(120);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_regex_matches_the_installed_ps1() {
        let re = prompt_regex("alice", "build-box");
        assert!(re.is_match("[alice@build-box /home/app]$ "));
        assert!(!re.is_match("[user@host /home/app]$ "));
        assert!(!re.is_match("not a prompt"));
    }

    #[test]
    fn prompt_regex_escapes_metacharacters_in_user_and_host() {
        let re = prompt_regex("a.b", "h+1");
        assert!(re.is_match("[a.b@h+1 /x]$ "));
        assert!(!re.is_match("[aXb@h+1 /x]$ "));
    }

    #[test]
    fn shell_setup_command_embeds_user_and_host() {
        let cmd = shell_setup_command("alice", "build-box");
        assert!(cmd.contains("alice@build-box"));
    }

    #[test]
    fn leading_tilde_is_expanded_in_key_path() {
        let params = ConnectParams {
            host: "h".into(),
            port: 22,
            username: "u".into(),
            password: None,
            key_file_path: Some("~/keys/id_ed25519".into()),
        };
        let resolved = params.resolved_key_path().unwrap();
        assert!(!resolved.starts_with('~'));
        assert!(resolved.ends_with("keys/id_ed25519"));
    }

    #[test]
    fn non_leading_tilde_is_passed_through() {
        let params = ConnectParams {
            host: "h".into(),
            port: 22,
            username: "u".into(),
            password: None,
            key_file_path: Some("/opt/~weird/id_rsa".into()),
        };
        assert_eq!(params.resolved_key_path().unwrap(), "/opt/~weird/id_rsa");
    }
}
