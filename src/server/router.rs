use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use hyper::{Request, Response, StatusCode};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::constants::{MAX_REQ_BODY_SIZE, REQUEST_ID_SIZE, REQ_BODY_READ_CHUNK_TIMEOUT};
use crate::protocol::{tunnel_err_state, MsgType, TunnelMessage};

use super::stats;
use super::tunnels::{MmarServer, TunnelError};

/// HTTP entrypoint: route one end-user request through the tunnel selected
/// by the Host header's first DNS label.
pub async fn handle_request(
    server: Arc<MmarServer>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let version = req.version();

    let host = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let subdomain = extract_subdomain(&host);

    let response = route_request(&server, &subdomain, req).await;

    let content_length = response.body().size_hint().exact().unwrap_or(0);
    info!(
        "[{}] \"{} {} {:?}\" {} {}",
        subdomain,
        method,
        path,
        version,
        response.status().as_u16(),
        content_length
    );
    Ok(response)
}

async fn route_request(
    server: &Arc<MmarServer>,
    subdomain: &str,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    if subdomain == "stats" {
        return stats::handle_stats(server, &req);
    }

    let Some(client_tunnel) = server.lookup_tunnel(subdomain) else {
        return plain_response(StatusCode::OK, tunnel_err_state(MsgType::ClientDisconnect));
    };

    let serialized = match serialize_request(req).await {
        Ok(bytes) => bytes,
        Err(cause) => return error_response(cause),
    };

    let (request_id, receiver) = client_tunnel.register_inflight();
    if client_tunnel.is_closed() {
        // Torn down between lookup and registration; the drain may have
        // missed this entry, so pull it back out ourselves.
        client_tunnel.take_inflight(request_id);
        return error_response(TunnelError::ClientDisconnected);
    }

    let mut data = Vec::with_capacity(REQUEST_ID_SIZE + serialized.len());
    data.extend_from_slice(&request_id.to_le_bytes());
    data.extend_from_slice(&serialized);

    let request_msg = TunnelMessage::with_data(MsgType::Request, data);
    if let Err(err) = client_tunnel.sender.send(&request_msg).await {
        debug!("Failed to send Request msg to client: {err}");
        client_tunnel.take_inflight(request_id);
        return error_response(TunnelError::FailedToForwardToMmarClient);
    }

    match receiver.await {
        Ok(Ok(outgoing)) => {
            let mut response = Response::new(Full::new(Bytes::from(outgoing.body)));
            *response.status_mut() = outgoing.status;
            *response.headers_mut() = outgoing.headers;
            response
                .headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
            response
        }
        Ok(Err(cause)) => error_response(cause),
        // Sender dropped without a recorded cause: the tunnel went away.
        Err(_) => error_response(TunnelError::ClientDisconnected),
    }
}

/// Serialize an inbound request into the HTTP/1.1 bytes tunneled to the
/// client: request line, headers with Content-Length overwritten by the
/// observed body size, blank line, body. Each body chunk read is bounded by
/// its own timer, and the accumulated size by the body ceiling.
pub(crate) async fn serialize_request<B>(req: Request<B>) -> Result<Vec<u8>, TunnelError>
where
    B: Body<Data = Bytes> + Unpin,
{
    let (parts, mut body) = req.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut buffer = Vec::with_capacity(1024);
    buffer.extend_from_slice(
        format!("{} {} {:?}\r\n", parts.method, path, parts.version).as_bytes(),
    );

    let mut body_bytes: Vec<u8> = Vec::new();
    loop {
        let frame = match timeout(REQ_BODY_READ_CHUNK_TIMEOUT, body.frame()).await {
            Err(_) => return Err(TunnelError::BodyChunkTimeout),
            Ok(None) => break,
            Ok(Some(Err(_))) => return Err(TunnelError::BodyChunkRead),
            Ok(Some(Ok(frame))) => frame,
        };
        if let Ok(data) = frame.into_data() {
            body_bytes.extend_from_slice(&data);
            if body_bytes.len() > MAX_REQ_BODY_SIZE {
                return Err(TunnelError::MaxRequestBodySize);
            }
        }
    }

    // Headers pass through verbatim except the length framing, which now
    // reflects the fully buffered body.
    for (name, value) in parts.headers.iter() {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        buffer.extend_from_slice(name.as_str().as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }
    buffer.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body_bytes.len()).as_bytes());
    buffer.extend_from_slice(&body_bytes);

    Ok(buffer)
}

/// First DNS label of the Host header, lowercased.
pub fn extract_subdomain(host: &str) -> String {
    host.split('.').next().unwrap_or_default().to_ascii_lowercase()
}

pub(crate) fn plain_response(status: StatusCode, text: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::copy_from_slice(text.as_bytes())));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(text.len()));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

fn error_response(cause: TunnelError) -> Response<Full<Bytes>> {
    plain_response(cause.status(), &cause.to_string())
}
