//! Entry point for the sshmux-core MCP server.
//!
//! Initializes tracing (to stderr, so it doesn't interfere with MCP stdio
//! transport), binds the shared HTTP/WebSocket port, starts the browser
//! terminal surface alongside the MCP stdio surface, and drains every open
//! session on SIGINT/SIGTERM or stdio closure.

use sshmux_core::config::Config;
use sshmux_core::port;
use sshmux_core::server::SshMuxServer;
use sshmux_core::web::{self, WebState};
use anyhow::Result;
use rmcp::{transport::stdio, ServiceExt};
use tracing_subscriber::EnvFilter;

fn init_tracing(config: &Config) {
    let filter = match &config.log_level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    init_tracing(&config);
    tracing::info!("starting sshmux-core v{}", env!("CARGO_PKG_VERSION"));

    let bound = match port::bind(&config).await {
        Ok(bound) => bound,
        Err(err) => {
            tracing::error!(%err, "failed to bind HTTP/WebSocket port");
            std::process::exit(1);
        }
    };
    tracing::info!(port = bound.port, "bound browser terminal port");
    if let Err(err) = port::write_discovery_file(bound.port).await {
        tracing::warn!(%err, "failed to write port discovery file");
    }

    let mcp_server = SshMuxServer::new(&config);
    let registry = mcp_server.registry();
    registry.set_web_port(bound.port);

    let router = web::router(WebState {
        registry: registry.clone(),
    });
    let web_task = tokio::spawn(async move {
        if let Err(err) = axum::serve(bound.listener, router).await {
            tracing::error!(%err, "browser terminal server exited");
        }
    });

    let service = match mcp_server.serve(stdio()).await {
        Ok(service) => service,
        Err(err) => {
            tracing::error!(%err, "failed to start MCP stdio transport");
            web_task.abort();
            port::remove_discovery_file().await;
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = service.waiting() => {
            if let Err(err) = result {
                tracing::error!(%err, "MCP service ended with an error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
        _ = terminate() => {
            tracing::info!("received termination signal");
        }
    }

    web_task.abort();
    registry.shutdown_all().await;
    port::remove_discovery_file().await;
    tracing::info!("sshmux-core shut down");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(err) => {
            tracing::warn!(%err, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
