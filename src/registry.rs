//! Session registry: tracks every open session by the caller-assigned name
//! passed to `ssh_connect`.
//!
//! Sessions are long-lived and only ever removed by explicit disconnect or
//! process shutdown — there is no automatic expiry or TTL sweep.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::session::Session;
use crate::ssh::ConnectParams;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub name: String,
    pub user: String,
    pub host: String,
    pub lifecycle: &'static str,
}

/// Thread-safe map of session name to live `Session`.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    max_sessions: usize,
    /// Default per-command timeout handed to every session this registry
    /// opens, sourced from `SSH_TIMEOUT`.
    default_timeout: Duration,
    /// Published by `main` once the HTTP/WS port is bound, so
    /// `ssh_get_monitoring_url` can build a URL without the registry needing
    /// to know about port coordination itself.
    web_port: Arc<AtomicU16>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions: config.max_sessions,
            default_timeout: Duration::from_secs(config.ssh_timeout_secs),
            web_port: Arc::new(AtomicU16::new(0)),
        }
    }

    pub fn set_web_port(&self, port: u16) {
        self.web_port.store(port, Ordering::Relaxed);
    }

    #[must_use]
    pub fn web_port(&self) -> u16 {
        self.web_port.load(Ordering::Relaxed)
    }

    /// Open and register a new session under `name`. Errs if the name is
    /// already taken or the session cap has been reached.
    pub async fn connect(&self, name: String, params: ConnectParams) -> CoreResult<()> {
        {
            let sessions = self.sessions.read().await;
            if sessions.contains_key(&name) {
                return Err(CoreError::SessionAlreadyExists(name));
            }
            if sessions.len() >= self.max_sessions {
                return Err(CoreError::Validation(format!(
                    "session cap reached ({}/{})",
                    sessions.len(),
                    self.max_sessions
                )));
            }
        }
        let session = Session::connect(name.clone(), params, self.default_timeout).await?;
        let mut sessions = self.sessions.write().await;
        sessions.insert(name, Arc::new(session));
        Ok(())
    }

    pub async fn get(&self, name: &str) -> CoreResult<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::SessionNotFound(name.to_string()))
    }

    /// Remove and tear down a session. Draining/aborting only needs `&self`
    /// on `Session`, so this runs regardless of how many other `Arc<Session>`
    /// clones a browser WebSocket or in-flight MCP call still holds.
    pub async fn disconnect(&self, name: &str) -> CoreResult<()> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(name)
                .ok_or_else(|| CoreError::SessionNotFound(name.to_string()))?
        };
        session.shutdown().await;
        Ok(())
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut summaries = Vec::with_capacity(sessions.len());
        for (name, session) in sessions.iter() {
            let lifecycle = match session.lifecycle().await {
                crate::session::LifecycleState::Connecting => "connecting",
                crate::session::LifecycleState::Ready => "ready",
                crate::session::LifecycleState::Busy => "busy",
                crate::session::LifecycleState::Disposing => "disposing",
                crate::session::LifecycleState::Gone => "gone",
            };
            summaries.push(SessionSummary {
                name: name.clone(),
                user: session.user.clone(),
                host: session.host.clone(),
                lifecycle,
            });
        }
        summaries
    }

    /// Tear down every session on process shutdown.
    pub async fn shutdown_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, session) in sessions.drain() {
            session.shutdown().await;
        }
    }
}
