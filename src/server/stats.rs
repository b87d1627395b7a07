use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use tracing::debug;

use crate::auth::valid_credentials;

use super::tunnels::MmarServer;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsView {
    connected_clients_count: usize,
    connected_clients: Vec<ClientView>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientView {
    id: String,
    created_on: String,
}

/// Serves simple stats for the mmar server behind Basic Authentication.
pub fn handle_stats(server: &MmarServer, req: &Request<Incoming>) -> Response<Full<Bytes>> {
    let authorized = basic_auth_credentials(req)
        .map(|(username, password)| valid_credentials(&username, &password))
        .unwrap_or(false);
    if !authorized {
        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::UNAUTHORIZED;
        response.headers_mut().insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"stats\""),
        );
        return response;
    }

    let tunnels = server.tunnels_snapshot();
    let stats = StatsView {
        connected_clients_count: tunnels.len(),
        connected_clients: tunnels
            .into_iter()
            .map(|(id, created_on)| ClientView { id, created_on: created_on.to_rfc3339() })
            .collect(),
    };

    match serde_json::to_vec(&stats) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(err) => {
            debug!("Failed to serialize server stats: {err}");
            let mut response = Response::new(Full::new(Bytes::new()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

/// Decode the username/password pair from a `Basic` Authorization header.
fn basic_auth_credentials<B>(req: &Request<B>) -> Option<(String, String)> {
    let header = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_owned(), password.to_owned()))
}
