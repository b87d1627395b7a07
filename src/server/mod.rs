mod router;
mod stats;
mod tunnels;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info};

use crate::auth::AuthManager;

pub use tunnels::MmarServer;
#[cfg(test)]
pub(crate) use router::serialize_request;
#[cfg(test)]
pub(crate) use tunnels::parse_serialized_response;

#[derive(Debug, Clone)]
pub struct ConfigOptions {
    pub http_port: u16,
    pub tcp_port: u16,
    pub api_keys_file: Option<PathBuf>,
}

/// A running server: bound addresses plus the accept-loop tasks, which stop
/// when the handle is dropped.
pub struct ServerHandle {
    pub http_addr: SocketAddr,
    pub tcp_addr: SocketAddr,
    _tasks: Vec<AbortOnDropHandle<()>>,
}

pub async fn run(config: ConfigOptions) -> Result<()> {
    info!(
        "Starting mmar server...\n  Starting HTTP Server on port: {}\n  Starting TCP Server on port: {}",
        config.http_port, config.tcp_port
    );

    let _handle = start(config).await?;

    // Both listeners run until interrupted; no state survives shutdown.
    tokio::signal::ctrl_c().await?;
    info!("Gracefully shutting down server...");
    Ok(())
}

/// Bind both listeners and spawn their accept loops. Failing to bind is the
/// only fatal startup error.
pub async fn start(config: ConfigOptions) -> Result<ServerHandle> {
    if let Some(path) = &config.api_keys_file {
        match AuthManager::load(path) {
            Ok(_) => {}
            Err(err) => info!("Continuing without API keys: {err:#}"),
        }
    }

    let server = Arc::new(MmarServer::new());

    let tcp_listener = TcpListener::bind(("0.0.0.0", config.tcp_port))
        .await
        .with_context(|| format!("Failed to start TCP server on port {}", config.tcp_port))?;
    let tcp_addr = tcp_listener.local_addr()?;
    info!("Listening for TCP Connections on {tcp_addr}...");

    let http_listener = TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("Failed to start HTTP server on port {}", config.http_port))?;
    let http_addr = http_listener.local_addr()?;
    info!("Listening for HTTP Requests on {http_addr}...");

    let tcp_server = server.clone();
    let tcp_task = tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(tunnels::handle_tcp_connection(tcp_server.clone(), stream));
                }
                Err(err) => error!("Failed to accept TCP connection: {err}"),
            }
        }
    });

    let http_server = server.clone();
    let http_task = tokio::spawn(async move {
        loop {
            match http_listener.accept().await {
                Ok((stream, _)) => {
                    let server = http_server.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            router::handle_request(server.clone(), req)
                        });
                        if let Err(err) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!("HTTP connection error: {err}");
                        }
                    });
                }
                Err(err) => error!("Failed to accept HTTP connection: {err}"),
            }
        }
    });

    Ok(ServerHandle {
        http_addr,
        tcp_addr,
        _tasks: vec![AbortOnDropHandle::new(tcp_task), AbortOnDropHandle::new(http_task)],
    })
}
