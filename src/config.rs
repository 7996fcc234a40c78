//! Process-wide configuration loaded from environment variables.
//!
//! Unknown environment variables are ignored. An invalid value for a
//! recognized variable falls back to the default and logs a warning, rather
//! than failing startup.

/// Default per-command timeout, in seconds, when a session doesn't override it.
pub const DEFAULT_SSH_TIMEOUT_SECS: u64 = 15;

/// Default hard cap on concurrently open sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 32;

/// First port probed during auto-discovery when `WEB_PORT` is unset or `0`.
pub const PORT_DISCOVERY_START: u16 = 8080;

/// How many ports to probe before giving up during auto-discovery.
pub const PORT_DISCOVERY_RANGE: u16 = 100;

/// Name of the discovery file written to the process working directory.
pub const PORT_DISCOVERY_FILE: &str = ".ssh-mcp-server.port";

#[derive(Debug, Clone)]
pub struct Config {
    /// Explicit port request from `WEB_PORT`. `None` means auto-discover.
    pub web_port: Option<u16>,
    pub ssh_timeout_secs: u64,
    pub max_sessions: usize,
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            web_port: parse_env("WEB_PORT", |v| match v.parse::<u16>() {
                Ok(0) => None,
                Ok(p) => Some(p),
                Err(_) => None,
            })
            .flatten(),
            ssh_timeout_secs: parse_env("SSH_TIMEOUT", |v| v.parse::<u64>().ok())
                .flatten()
                .unwrap_or(DEFAULT_SSH_TIMEOUT_SECS),
            max_sessions: parse_env("MAX_SESSIONS", |v| v.parse::<usize>().ok())
                .flatten()
                .unwrap_or(DEFAULT_MAX_SESSIONS),
            log_level: std::env::var("LOG_LEVEL").ok(),
        }
    }
}

/// Read and parse an environment variable, warning and returning `None` on a
/// parse failure rather than treating it as fatal.
fn parse_env<T>(name: &str, parse: impl FnOnce(&str) -> T) -> Option<T> {
    match std::env::var(name) {
        Ok(raw) => Some(parse(&raw)),
        Err(_) => None,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            web_port: None,
            ssh_timeout_secs: DEFAULT_SSH_TIMEOUT_SECS,
            max_sessions: DEFAULT_MAX_SESSIONS,
            log_level: None,
        }
    }
}
