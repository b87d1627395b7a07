mod forwarder;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::{
    GRACEFUL_SHUTDOWN_TIMEOUT, HEARTBEAT_FROM_CLIENT_TIMEOUT, MAX_TUNNELS_PER_IP,
    SERVER_HTTP_PORT, TUNNEL_CREATE_TIMEOUT, TUNNEL_HTTP_PORT, TUNNEL_RECONNECT_TIMEOUT,
};
use crate::protocol::{MsgType, ProtocolError, Tunnel, TunnelMessage, TunnelSender};

use forwarder::Forwarder;

#[derive(Debug, Clone)]
pub struct ConfigOptions {
    pub local_port: u16,
    pub tunnel_http_port: u16,
    pub tunnel_tcp_port: u16,
    pub tunnel_host: String,
    pub custom_dns: Option<String>,
    pub custom_cert: Option<PathBuf>,
    pub custom_name: Option<String>,
    pub api_key: Option<String>,
}

/// One client session: the tunnel to the server plus the forwarder that
/// re-issues requests against localhost.
pub struct MmarClient {
    tunnel: Tunnel,
    config: ConfigOptions,
    subdomain: String,
    forwarder: Arc<Forwarder>,
}

pub async fn run(config: ConfigOptions) -> Result<()> {
    info!(
        "Starting mmar client...\n  Creating tunnel:\n    Tunnel Host: {}\n    Local Port: {}",
        config.tunnel_host, config.local_port
    );

    let stream = match dial(&config).await {
        Ok(stream) => stream,
        Err(err) => {
            error!(
                "Could not reach mmar server on {}:{}\n {err}\nExiting...",
                config.tunnel_host, config.tunnel_tcp_port
            );
            return Ok(());
        }
    };

    if config.api_key.is_some() {
        debug!("API key provided; limits are enforced by the server deployment");
    }

    let custom_name = config.custom_name.clone().unwrap_or_default();
    let client = MmarClient::new(stream, config)?;
    let sender = client.sender();

    let cancel = CancellationToken::new();
    let mut session = tokio::spawn(client.process_messages(cancel.clone()));

    let create = TunnelMessage::with_data(MsgType::CreateTunnel, custom_name.into_bytes());
    if sender.send(&create).await.is_err() {
        error!("Failed to create Tunnel. Exiting...");
        return Ok(());
    }

    tokio::select! {
        // The session ends itself on terminal protocol messages.
        _ = &mut session => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Gracefully shutting down client...");
            let _ = sender.send(&TunnelMessage::new(MsgType::ClientDisconnect)).await;
            cancel.cancel();
            sleep(GRACEFUL_SHUTDOWN_TIMEOUT).await;
        }
    }
    Ok(())
}

async fn dial(config: &ConfigOptions) -> io::Result<TcpStream> {
    let addr = format!("{}:{}", config.tunnel_host, config.tunnel_tcp_port);
    match timeout(TUNNEL_CREATE_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "timed out dialing mmar server",
        )),
    }
}

impl MmarClient {
    pub fn new(stream: TcpStream, config: ConfigOptions) -> Result<Self> {
        let tunnel = Tunnel::new(stream)?;
        let forwarder = Arc::new(Forwarder::new(&config, tunnel.sender())?);
        Ok(Self { tunnel, config, subdomain: String::new(), forwarder })
    }

    pub fn sender(&self) -> TunnelSender {
        self.tunnel.sender()
    }

    /// Dispatch tunnel messages until cancelled or a terminal state.
    pub async fn process_messages(mut self, cancel: CancellationToken) {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self
                    .tunnel
                    .recv_or_heartbeat(HEARTBEAT_FROM_CLIENT_TIMEOUT, MsgType::HeartbeatFromClient) => result,
            };

            let msg = match received {
                Ok(msg) => msg,
                Err(ProtocolError::InvalidProtocolVersion) => {
                    warn!("The mmar message protocol has been updated, please update mmar.");
                    return;
                }
                Err(err) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    info!("Tunnel connection disconnected: {err}");
                    if !self.reconnect(&cancel).await {
                        return;
                    }
                    continue;
                }
            };

            match msg.msg_type {
                MsgType::TunnelCreated | MsgType::TunnelReclaimed => {
                    self.subdomain = String::from_utf8_lossy(&msg.data).to_string();
                    log_tunnel_created(&self.subdomain, &self.config);
                }
                MsgType::ClientTunnelLimit => {
                    error!(
                        "Maximum limit of Tunnels created reached ({MAX_TUNNELS_PER_IP}/{MAX_TUNNELS_PER_IP}). \
                         Please shutdown existing tunnels to create new ones."
                    );
                    return;
                }
                MsgType::InvalidSubdomainName => {
                    error!(
                        "Invalid subdomain name. Subdomain must be 1-63 characters long, \
                         contain only alphanumeric characters and hyphens, and cannot start \
                         or end with a hyphen."
                    );
                    return;
                }
                MsgType::SubdomainAlreadyTaken => {
                    error!("Subdomain name is already taken. Please choose a different name.");
                    return;
                }
                MsgType::Request => {
                    let forwarder = self.forwarder.clone();
                    tokio::spawn(async move {
                        forwarder.handle_request_message(msg.data).await;
                    });
                }
                MsgType::HeartbeatFromServer => {
                    let ack = TunnelMessage::new(MsgType::HeartbeatAck);
                    if self.tunnel.send(&ack).await.is_err() {
                        error!("Failed to send Heartbeat Ack. Exiting...");
                        return;
                    }
                }
                MsgType::HeartbeatAck => {
                    // Connection is healthy; nothing to do.
                }
                other => debug!("Ignoring unexpected message from server: {other:?}"),
            }
        }
    }

    /// Keep redialing until the tunnel is re-established with its previous
    /// subdomain. Returns false when the session should end instead.
    async fn reconnect(&mut self, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            info!("Attempting to reconnect...");

            let dialed = tokio::select! {
                _ = cancel.cancelled() => return false,
                result = dial(&self.config) => result,
            };
            let stream = match dialed {
                Ok(stream) => stream,
                Err(_) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = sleep(TUNNEL_RECONNECT_TIMEOUT) => {}
                    }
                    continue;
                }
            };

            if self.tunnel.reconnect(stream).await.is_err() {
                continue;
            }

            let reclaim = TunnelMessage::with_data(
                MsgType::ReclaimTunnel,
                self.subdomain.clone().into_bytes(),
            );
            if self.tunnel.send(&reclaim).await.is_err() {
                info!("Tunnel failed to reconnect. Exiting...");
                return false;
            }
            return true;
        }
    }
}

/// Print the public URL banner. This line on stderr is the one contract
/// between the session and anything scripting around the CLI.
fn log_tunnel_created(subdomain: &str, config: &ConfigOptions) {
    let (protocol, shown_port) = if config.tunnel_host == "localhost" {
        let port = if config.tunnel_http_port == TUNNEL_HTTP_PORT {
            SERVER_HTTP_PORT
        } else {
            config.tunnel_http_port
        };
        ("http", port)
    } else {
        ("https", config.tunnel_http_port)
    };
    let port_suffix = if shown_port != TUNNEL_HTTP_PORT {
        format!(":{shown_port}")
    } else {
        String::new()
    };

    eprintln!(
        "\nTunnel created successfully!\n\nA mmar tunnel is now open on:\n\n>>>  {protocol}://{subdomain}.{host}{port_suffix} -> http://localhost:{local_port}\n",
        host = config.tunnel_host,
        local_port = config.local_port,
    );
}
