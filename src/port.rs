//! URL/Port Coordinator: picks the single host:port the HTTP/WebSocket
//! server binds to and publishes it for `ssh_get_monitoring_url` and any
//! external process that wants to find this server without being told the
//! port explicitly.
//!
//! When `WEB_PORT` is set and nonzero, that port is used as-is and binding
//! failure is fatal. Otherwise a free port is probed starting at
//! `PORT_DISCOVERY_START`, and its value is written to
//! `PORT_DISCOVERY_FILE` in the process working directory so sibling
//! tooling can discover it.

use crate::config::{Config, PORT_DISCOVERY_FILE, PORT_DISCOVERY_RANGE, PORT_DISCOVERY_START};
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// A bound listener plus the port it ended up on.
pub struct BoundPort {
    pub listener: TcpListener,
    pub port: u16,
}

/// Bind according to `config.web_port`, probing a range when unset.
pub async fn bind(config: &Config) -> io::Result<BoundPort> {
    if let Some(port) = config.web_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await?;
        return Ok(BoundPort { listener, port });
    }

    for offset in 0..PORT_DISCOVERY_RANGE {
        let port = PORT_DISCOVERY_START + offset;
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(BoundPort { listener, port }),
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => continue,
            Err(err) => return Err(err),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        format!(
            "no free port found in {PORT_DISCOVERY_START}..{}",
            PORT_DISCOVERY_START + PORT_DISCOVERY_RANGE
        ),
    ))
}

/// Write the discovery file so other local processes can find this server's
/// port without it being passed on their own command line.
pub async fn write_discovery_file(port: u16) -> io::Result<()> {
    tokio::fs::write(PORT_DISCOVERY_FILE, port.to_string()).await
}

pub async fn remove_discovery_file() {
    if let Err(err) = tokio::fs::remove_file(PORT_DISCOVERY_FILE).await {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::warn!(%err, "failed to remove port discovery file");
        }
    }
}

/// The base URL a browser should open to reach a given session's terminal.
#[must_use]
pub fn monitoring_url(port: u16, session_name: &str) -> String {
    format!("http://localhost:{port}/session/{session_name}")
}
