use std::error::Error as StdError;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use reqwest::{Method, StatusCode};
use tracing::{error, info, warn};

use crate::constants::{DEST_REQUEST_TIMEOUT, REQUEST_ID_SIZE};
use crate::protocol::{MsgType, TunnelMessage, TunnelSender};

use super::ConfigOptions;

/// Re-issues tunneled requests against the local dev server and frames the
/// outcome back to the mmar server.
pub struct Forwarder {
    client: reqwest::Client,
    local_port: u16,
    sender: TunnelSender,
}

impl Forwarder {
    pub fn new(config: &ConfigOptions, sender: TunnelSender) -> Result<Self> {
        Ok(Self {
            client: build_forward_client(config)?,
            local_port: config.local_port,
            sender,
        })
    }

    /// Process one REQUEST frame: split off the request id, re-issue the
    /// request locally, and send back RESPONSE or the matching error state.
    pub async fn handle_request_message(&self, data: Vec<u8>) {
        if data.len() < REQUEST_ID_SIZE {
            warn!("Request payload shorter than a request id");
            return;
        }
        let (request_id, serialized) = data.split_at(REQUEST_ID_SIZE);

        let reply = match forward(&self.client, self.local_port, serialized).await {
            Ok(response_bytes) => {
                let mut data = request_id.to_vec();
                data.extend_from_slice(&response_bytes);
                TunnelMessage::with_data(MsgType::Response, data)
            }
            Err(err_state) => TunnelMessage::with_data(err_state, request_id.to_vec()),
        };

        if let Err(err) = self.sender.send(&reply).await {
            error!("Failed to send response to mmar server: {err}");
        }
    }
}

fn build_forward_client(config: &ConfigOptions) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(DEST_REQUEST_TIMEOUT)
        // Do not follow redirects, let the end-user's client handle them.
        .redirect(reqwest::redirect::Policy::none());

    if let Some(dns_addr) = &config.custom_dns {
        let addr: SocketAddr = dns_addr
            .parse()
            .with_context(|| format!("Invalid custom DNS address: {dns_addr}"))?;
        builder = builder.dns_resolver(Arc::new(CustomDnsResolver::new(addr)));
    }

    if let Some(cert_path) = &config.custom_cert {
        let der = std::fs::read(cert_path).with_context(|| {
            format!("Could not read certificate from file: {}", cert_path.display())
        })?;
        let cert = reqwest::Certificate::from_der(&der)
            .context("Could not load custom certificate")?;
        builder = builder.add_root_certificate(cert);
    }

    builder.build().context("Failed to build forwarding HTTP client")
}

/// Resolver that answers from a user-supplied UDP DNS server instead of the
/// system configuration.
struct CustomDnsResolver {
    resolver: TokioAsyncResolver,
}

impl CustomDnsResolver {
    fn new(addr: SocketAddr) -> Self {
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
        let mut opts = ResolverOpts::default();
        // The supplied server is authoritative for this client; keep the
        // hosts file from shadowing it for names like `localhost`.
        opts.use_hosts_file = false;
        Self { resolver: TokioAsyncResolver::tokio(config, opts) }
    }
}

impl Resolve for CustomDnsResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.resolver.clone();
        Box::pin(async move {
            let lookup = resolver.lookup_ip(name.as_str()).await?;
            let addrs: Addrs = Box::new(lookup.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}

/// Re-issue one serialized request against localhost and serialize the
/// response. An `Err` is the tunnel error state to report instead.
async fn forward(
    client: &reqwest::Client,
    local_port: u16,
    serialized: &[u8],
) -> Result<Vec<u8>, MsgType> {
    let parsed = match parse_serialized_request(serialized) {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!("Failed to parse tunneled request");
            return Err(MsgType::InvalidRespFromDest);
        }
    };

    // Retarget to the local dev server; everything else travels verbatim.
    let url = format!("http://localhost:{}{}", local_port, parsed.uri);
    let method = Method::from_bytes(parsed.method.as_bytes())
        .map_err(|_| MsgType::InvalidRespFromDest)?;

    let request = client
        .request(method.clone(), &url)
        .headers(parsed.headers)
        .body(parsed.body);

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => return Err(classify_forward_error(&err)),
    };

    let status = response.status();
    let headers = response.headers().clone();
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(err) => return Err(classify_forward_error(&err)),
    };

    info!("\"{} {}\" {} {}", method, parsed.uri, status.as_u16(), body.len());
    Ok(serialize_response(status, &headers, &body))
}

/// Map a failed local re-issue onto the protocol's destination error states.
fn classify_forward_error(err: &reqwest::Error) -> MsgType {
    if err.is_timeout() {
        return MsgType::DestRequestTimedout;
    }
    if err.is_connect() || transport_failure(err) {
        return MsgType::LocalhostNotRunning;
    }
    MsgType::InvalidRespFromDest
}

/// Walk an error's source chain looking for the signatures of a dead local
/// server: refused connections, resets, or a stream cut mid-response.
fn transport_failure(err: &(dyn StdError + 'static)) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(current) = source {
        if let Some(io_err) = current.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            ) {
                return true;
            }
        }
        if let Some(hyper_err) = current.downcast_ref::<hyper::Error>() {
            if hyper_err.is_incomplete_message() {
                return true;
            }
        }
        source = current.source();
    }
    false
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct RequestParseError;

pub(crate) struct ParsedRequest {
    pub method: String,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Parse the buffered HTTP request the server serialized for us.
pub(crate) fn parse_serialized_request(bytes: &[u8]) -> Result<ParsedRequest, RequestParseError> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut header_storage);

    let offset = match parsed.parse(bytes) {
        Ok(httparse::Status::Complete(offset)) => offset,
        _ => return Err(RequestParseError),
    };

    let method = parsed.method.ok_or(RequestParseError)?.to_owned();
    let uri = parsed.path.ok_or(RequestParseError)?.to_owned();

    let mut headers = HeaderMap::new();
    for header in parsed.headers.iter() {
        let name =
            HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| RequestParseError)?;
        let value = HeaderValue::from_bytes(header.value).map_err(|_| RequestParseError)?;
        headers.append(name, value);
    }

    let mut body = bytes[offset..].to_vec();
    if let Some(content_length) = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok())
    {
        body.truncate(content_length);
    }

    Ok(ParsedRequest { method, uri, headers, body })
}

/// Serialize a destination response for the wire: status line, headers with
/// corrected length framing, blank line, buffered body.
pub(crate) fn serialize_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
) -> Vec<u8> {
    let mut buffer = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default()
    )
    .into_bytes();

    for (name, value) in headers.iter() {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        buffer.extend_from_slice(name.as_str().as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }
    buffer.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    buffer.extend_from_slice(body);

    buffer
}
