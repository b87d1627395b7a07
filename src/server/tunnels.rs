use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use hyper::{HeaderMap, StatusCode};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{
    CLIENT_DISCONNECT_ERR_TEXT, FAILED_TO_FORWARD_ERR_TEXT, FAILED_TO_READ_RESP_ERR_TEXT,
    GRACEFUL_SHUTDOWN_TIMEOUT, HEARTBEAT_FROM_SERVER_TIMEOUT, ID_CHARSET, ID_LENGTH,
    MAX_REQ_BODY_SIZE_ERR_TEXT, MAX_TUNNELS_PER_IP, READ_BODY_CHUNK_ERR_TEXT,
    READ_BODY_CHUNK_TIMEOUT_ERR_TEXT, READ_RESP_BODY_ERR_TEXT, REQUEST_ID_SIZE,
    RESERVED_SUBDOMAINS,
};
use crate::protocol::{tunnel_err_state, MsgType, Tunnel, TunnelMessage, TunnelSender};

/// Cancellation cause attached to an inflight request. The router maps each
/// cause to the HTTP status and body the end user sees.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelError {
    #[error("{CLIENT_DISCONNECT_ERR_TEXT}")]
    ClientDisconnected,
    #[error("{READ_BODY_CHUNK_TIMEOUT_ERR_TEXT}")]
    BodyChunkTimeout,
    #[error("{READ_BODY_CHUNK_ERR_TEXT}")]
    BodyChunkRead,
    #[error("{MAX_REQ_BODY_SIZE_ERR_TEXT}")]
    MaxRequestBodySize,
    #[error("{READ_RESP_BODY_ERR_TEXT}")]
    ReadRespBody,
    #[error("{FAILED_TO_FORWARD_ERR_TEXT}")]
    FailedToForwardToMmarClient,
    #[error("{FAILED_TO_READ_RESP_ERR_TEXT}")]
    FailedToReadRespFromMmarClient,
}

impl TunnelError {
    pub fn status(&self) -> StatusCode {
        match self {
            TunnelError::BodyChunkTimeout => StatusCode::REQUEST_TIMEOUT,
            TunnelError::BodyChunkRead | TunnelError::ClientDisconnected => {
                StatusCode::BAD_REQUEST
            }
            TunnelError::MaxRequestBodySize => StatusCode::PAYLOAD_TOO_LARGE,
            TunnelError::ReadRespBody => StatusCode::INTERNAL_SERVER_ERROR,
            TunnelError::FailedToForwardToMmarClient
            | TunnelError::FailedToReadRespFromMmarClient => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Response delivered back to the end-user handler for one tunneled request.
#[derive(Debug, PartialEq)]
pub struct OutgoingResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

pub type InflightResult = Result<OutgoingResponse, TunnelError>;

#[derive(Debug)]
pub struct InflightRequest {
    respond: oneshot::Sender<InflightResult>,
}

impl InflightRequest {
    pub fn deliver(self, result: InflightResult) {
        // The receiver is gone when the end user already hung up.
        let _ = self.respond.send(result);
    }
}

/// Server-side handle for one bound tunnel. Shared between the dispatcher
/// task and the router handlers for its inflight requests.
#[derive(Debug)]
pub struct ClientTunnel {
    pub id: String,
    pub sender: TunnelSender,
    pub created_on: DateTime<Utc>,
    pub peer_ip: IpAddr,
    inflight: DashMap<u32, InflightRequest>,
    closed: AtomicBool,
    closing: CancellationToken,
}

impl ClientTunnel {
    /// Allocate a fresh non-zero request id and its delivery channel. The
    /// entry is inserted atomically so concurrent handlers cannot collide.
    pub fn register_inflight(&self) -> (u32, oneshot::Receiver<InflightResult>) {
        loop {
            let id = fastrand::u32(1..=u32::MAX);
            if let dashmap::Entry::Vacant(slot) = self.inflight.entry(id) {
                let (respond, receiver) = oneshot::channel();
                slot.insert(InflightRequest { respond });
                return (id, receiver);
            }
        }
    }

    pub fn take_inflight(&self, id: u32) -> Option<InflightRequest> {
        self.inflight.remove(&id).map(|(_, inflight)| inflight)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Cancel every inflight request with `ClientDisconnected`.
    fn drain(&self) {
        let ids: Vec<u32> = self.inflight.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, inflight)) = self.inflight.remove(&id) {
                inflight.deliver(Err(TunnelError::ClientDisconnected));
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BindError {
    InvalidSubdomainName,
    SubdomainAlreadyTaken,
    ClientTunnelLimit,
}

#[derive(Default)]
struct Registry {
    clients: HashMap<String, Arc<ClientTunnel>>,
    tunnels_per_ip: HashMap<IpAddr, Vec<String>>,
}

/// Process-wide tunnel state. The registry mutex guards only map updates;
/// all IO happens outside it.
#[derive(Default)]
pub struct MmarServer {
    registry: Mutex<Registry>,
}

impl MmarServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup_tunnel(&self, subdomain: &str) -> Option<Arc<ClientTunnel>> {
        self.registry.lock().unwrap().clients.get(subdomain).cloned()
    }

    pub fn subdomain_bound(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.registry.lock().unwrap().clients.contains_key(&name)
    }

    pub fn tunnel_count(&self) -> usize {
        self.registry.lock().unwrap().clients.len()
    }

    /// Subdomain and creation time of every bound tunnel, for the stats view.
    pub fn tunnels_snapshot(&self) -> Vec<(String, DateTime<Utc>)> {
        let registry = self.registry.lock().unwrap();
        registry
            .clients
            .values()
            .map(|ct| (ct.id.clone(), ct.created_on))
            .collect()
    }

    /// Assign a subdomain to a new tunnel connection. `requested` is the
    /// custom name from the client, or empty for auto-assignment.
    pub fn bind_tunnel(
        &self,
        sender: TunnelSender,
        peer_ip: IpAddr,
        created_on: DateTime<Utc>,
        requested: &str,
    ) -> Result<Arc<ClientTunnel>, BindError> {
        let mut registry = self.registry.lock().unwrap();

        let subdomain = if requested.is_empty() {
            generate_unique_subdomain(&registry.clients)
        } else {
            // Stored lowercased so Host-header routing matches regardless of
            // the case the client asked for.
            let name = requested.to_ascii_lowercase();
            if !is_valid_subdomain(&name) {
                return Err(BindError::InvalidSubdomainName);
            }
            if registry.clients.contains_key(&name) {
                return Err(BindError::SubdomainAlreadyTaken);
            }
            name
        };

        let owned = registry.tunnels_per_ip.entry(peer_ip).or_default();
        if owned.len() >= MAX_TUNNELS_PER_IP {
            return Err(BindError::ClientTunnelLimit);
        }
        owned.push(subdomain.clone());

        let client_tunnel = Arc::new(ClientTunnel {
            id: subdomain.clone(),
            sender,
            created_on,
            peer_ip,
            inflight: DashMap::new(),
            closed: AtomicBool::new(false),
            closing: CancellationToken::new(),
        });
        registry.clients.insert(subdomain, client_tunnel.clone());

        Ok(client_tunnel)
    }

    /// Remove a tunnel from the registry and cancel its inflight requests.
    /// Safe to call from multiple tasks; only the first caller acts.
    pub async fn teardown_tunnel(&self, ct: &Arc<ClientTunnel>, graceful: bool) {
        if ct.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut registry = self.registry.lock().unwrap();
            registry.clients.remove(&ct.id);
            if let Some(owned) = registry.tunnels_per_ip.get_mut(&ct.peer_ip) {
                owned.retain(|subdomain| subdomain != &ct.id);
                if owned.is_empty() {
                    registry.tunnels_per_ip.remove(&ct.peer_ip);
                }
            }
        }

        info!("[{}] Client disconnected: {}, closing tunnel...", ct.id, ct.peer_ip);
        ct.drain();
        if graceful {
            // Leave a final window for responses already on the wire.
            sleep(GRACEFUL_SHUTDOWN_TIMEOUT).await;
        }
        ct.closing.cancel();
        ct.sender.close().await;
        info!("[{}] Tunnel connection closed", ct.id);
    }
}

/// Drive the state machine for one accepted tunnel TCP connection:
/// `AwaitingCreate` until a CREATE/RECLAIM binds a subdomain, then `Bound`
/// until disconnect or error.
pub async fn handle_tcp_connection(server: Arc<MmarServer>, stream: TcpStream) {
    let mut tunnel = match Tunnel::new(stream) {
        Ok(tunnel) => tunnel,
        Err(err) => {
            warn!("Failed to set up tunnel connection: {err}");
            return;
        }
    };
    debug!("Accepted tunnel connection from {}", tunnel.peer_addr());

    let mut bound: Option<Arc<ClientTunnel>> = None;

    loop {
        let received = {
            let recv =
                tunnel.recv_or_heartbeat(HEARTBEAT_FROM_SERVER_TIMEOUT, MsgType::HeartbeatFromServer);
            match &bound {
                // Once bound, a teardown initiated elsewhere must also stop
                // this dispatcher.
                Some(ct) => {
                    let closing = ct.closing.clone();
                    tokio::select! {
                        _ = closing.cancelled() => return,
                        result = recv => result,
                    }
                }
                None => recv.await,
            }
        };

        let msg = match received {
            Ok(msg) => msg,
            Err(err) => {
                debug!("Receive message from client tunnel errored: {err}");
                match &bound {
                    // Transport failures get the graceful drain; protocol
                    // violations are fatal without the grace window.
                    Some(ct) => server.teardown_tunnel(ct, err.is_network()).await,
                    None => tunnel.sender().close().await,
                }
                return;
            }
        };

        match msg.msg_type {
            MsgType::CreateTunnel | MsgType::ReclaimTunnel if bound.is_none() => {
                let reclaim = msg.msg_type == MsgType::ReclaimTunnel;
                let requested = String::from_utf8_lossy(&msg.data).to_string();

                if reclaim && server.subdomain_bound(&requested) {
                    // Still bound elsewhere: refuse by closing so the client
                    // can start over with a fresh tunnel.
                    tunnel.sender().close().await;
                    return;
                }

                match server.bind_tunnel(
                    tunnel.sender(),
                    tunnel.peer_addr().ip(),
                    tunnel.created_on(),
                    &requested,
                ) {
                    Ok(ct) => {
                        let ack = if reclaim {
                            MsgType::TunnelReclaimed
                        } else {
                            MsgType::TunnelCreated
                        };
                        let reply =
                            TunnelMessage::with_data(ack, ct.id.clone().into_bytes());
                        if tunnel.send(&reply).await.is_err() {
                            server.teardown_tunnel(&ct, false).await;
                            return;
                        }
                        info!(
                            "[{}] Tunnel {}: {}",
                            ct.id,
                            if reclaim { "reclaimed" } else { "created" },
                            tunnel.peer_addr()
                        );
                        bound = Some(ct);
                    }
                    Err(bind_err) => {
                        let reply = match bind_err {
                            BindError::InvalidSubdomainName => {
                                Some(MsgType::InvalidSubdomainName)
                            }
                            // A reclaim losing the race to another binder is
                            // handled like a still-bound name: just close.
                            BindError::SubdomainAlreadyTaken if reclaim => None,
                            BindError::SubdomainAlreadyTaken => {
                                Some(MsgType::SubdomainAlreadyTaken)
                            }
                            BindError::ClientTunnelLimit => Some(MsgType::ClientTunnelLimit),
                        };
                        if let Some(kind) = reply {
                            let _ = tunnel.send(&TunnelMessage::new(kind)).await;
                        }
                        tunnel.sender().close().await;
                        return;
                    }
                }
            }
            MsgType::Response => {
                if let Some(ct) = &bound {
                    let server = server.clone();
                    let ct = ct.clone();
                    tokio::spawn(async move {
                        handle_response_message(server, ct, msg.data).await;
                    });
                }
            }
            MsgType::LocalhostNotRunning
            | MsgType::DestRequestTimedout
            | MsgType::InvalidRespFromDest => {
                if let Some(ct) = &bound {
                    // The payload is just the request id; synthesize the
                    // canned response and feed it through the RESPONSE path.
                    let mut data = msg.data;
                    data.extend_from_slice(&canned_response(msg.msg_type));
                    let server = server.clone();
                    let ct = ct.clone();
                    tokio::spawn(async move {
                        handle_response_message(server, ct, data).await;
                    });
                }
            }
            MsgType::ClientDisconnect => {
                match &bound {
                    Some(ct) => server.teardown_tunnel(ct, true).await,
                    None => tunnel.sender().close().await,
                }
                return;
            }
            MsgType::HeartbeatFromClient => {
                let ack = TunnelMessage::new(MsgType::HeartbeatAck);
                if tunnel.send(&ack).await.is_err() {
                    match &bound {
                        Some(ct) => server.teardown_tunnel(ct, true).await,
                        None => tunnel.sender().close().await,
                    }
                    return;
                }
            }
            MsgType::HeartbeatAck => {
                // Connection is healthy; nothing to do.
            }
            other => {
                warn!("Unexpected tunnel message in current state: {other:?}");
            }
        }
    }
}

/// Canned HTTP bytes for destination-side error states, shaped exactly like
/// a client-serialized response.
fn canned_response(msg_type: MsgType) -> Vec<u8> {
    let status_line = match msg_type {
        MsgType::InvalidRespFromDest => "500 Internal Server Error",
        _ => "200 OK",
    };
    let body = tunnel_err_state(msg_type);
    format!(
        "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResponseParseError {
    /// Headers never completed: the serialized response was cut short.
    Truncated,
    /// Headers parsed but the body is shorter than its Content-Length.
    ShortBody,
    Malformed,
}

/// Match a RESPONSE payload to its inflight request and deliver it. A
/// truncated payload means the client-side stream broke mid-serialization,
/// which is fatal to the tunnel.
pub async fn handle_response_message(
    server: Arc<MmarServer>,
    ct: Arc<ClientTunnel>,
    data: Vec<u8>,
) {
    if data.len() < REQUEST_ID_SIZE {
        warn!("[{}] Response payload shorter than a request id", ct.id);
        return;
    }
    let request_id = u32::from_le_bytes(data[..REQUEST_ID_SIZE].try_into().unwrap());

    let Some(inflight) = ct.take_inflight(request_id) else {
        warn!("[{}] Failed to identify inflight request: {}", ct.id, request_id);
        return;
    };

    match parse_serialized_response(&data[REQUEST_ID_SIZE..]) {
        Ok(response) => inflight.deliver(Ok(response)),
        Err(ResponseParseError::Truncated) => {
            inflight.deliver(Err(TunnelError::FailedToReadRespFromMmarClient));
            server.teardown_tunnel(&ct, true).await;
        }
        Err(ResponseParseError::ShortBody) => {
            inflight.deliver(Err(TunnelError::ReadRespBody));
        }
        Err(ResponseParseError::Malformed) => {
            inflight.deliver(Err(TunnelError::FailedToReadRespFromMmarClient));
        }
    }
}

/// Parse the buffered HTTP response a client serialized back to us.
pub fn parse_serialized_response(bytes: &[u8]) -> Result<OutgoingResponse, ResponseParseError> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut header_storage);

    let offset = match parsed.parse(bytes) {
        Ok(httparse::Status::Complete(offset)) => offset,
        Ok(httparse::Status::Partial) => return Err(ResponseParseError::Truncated),
        Err(_) => return Err(ResponseParseError::Malformed),
    };

    let status = parsed
        .code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or(ResponseParseError::Malformed)?;

    let mut headers = HeaderMap::new();
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| ResponseParseError::Malformed)?;
        let value =
            HeaderValue::from_bytes(header.value).map_err(|_| ResponseParseError::Malformed)?;
        headers.append(name, value);
    }

    let mut body = bytes[offset..].to_vec();
    if let Some(content_length) = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok())
    {
        if body.len() < content_length {
            return Err(ResponseParseError::ShortBody);
        }
        body.truncate(content_length);
    }

    Ok(OutgoingResponse { status, headers, body })
}

/// A subdomain name usable as a routing key: 1-63 chars, alphanumeric or
/// hyphen, no leading/trailing hyphen, not reserved (case-insensitive).
pub fn is_valid_subdomain(name: &str) -> bool {
    if name.is_empty() || name.len() > 63 {
        return false;
    }
    let lowered = name.to_ascii_lowercase();
    if RESERVED_SUBDOMAINS.contains(&lowered.as_str()) {
        return false;
    }
    if name.starts_with('-') || name.ends_with('-') {
        return false;
    }
    name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

fn random_id() -> String {
    (0..ID_LENGTH)
        .map(|_| ID_CHARSET[fastrand::usize(..ID_CHARSET.len())] as char)
        .collect()
}

fn generate_unique_subdomain(clients: &HashMap<String, Arc<ClientTunnel>>) -> String {
    loop {
        let id = random_id();
        if RESERVED_SUBDOMAINS.contains(&id.as_str()) || clients.contains_key(&id) {
            continue;
        }
        return id;
    }
}
