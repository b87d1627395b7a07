//! In-process simulations of the full tunnel: a real server, a real client
//! session, and a local dev server, all on ephemeral loopback ports.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use crate::client::{ConfigOptions as ClientConfig, MmarClient};
use crate::constants::{CLIENT_DISCONNECT_ERR_TEXT, LOCALHOST_NOT_RUNNING_ERR_TEXT};
use crate::protocol::{MsgType, Tunnel, TunnelMessage};
use crate::server::{self, ConfigOptions as ServerConfig, ServerHandle};

// ── Dev server ────────────────────────────────────────────────────────────────

async fn handle_dev_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let response = if method == Method::GET && path == "/get" {
        // Echo the request headers back so tests can verify they traveled
        // through the tunnel untouched.
        let mut req_headers = serde_json::Map::new();
        for name in req.headers().keys() {
            let values: Vec<serde_json::Value> = req
                .headers()
                .get_all(name)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .map(|value| serde_json::Value::String(value.to_owned()))
                .collect();
            req_headers.insert(name.as_str().to_owned(), serde_json::Value::Array(values));
        }
        let body = serde_json::json!({
            "success": true,
            "data": "some data",
            "echo": {"reqHeaders": req_headers},
        })
        .to_string();
        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/json")
            .header("Simulation-Header", "devserver-handle-get")
            .header("Set-Cookie", "first=1")
            .header("Set-Cookie", "second=2")
            .body(Full::new(Bytes::from(body)))
            .unwrap()
    } else if method == Method::GET && path == "/redirect" {
        Response::builder()
            .status(StatusCode::FOUND)
            .header("Location", "/get")
            .body(Full::new(Bytes::new()))
            .unwrap()
    } else if method == Method::POST && path == "/post" {
        let body = req.into_body().collect().await.unwrap().to_bytes();
        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/json")
            .header("Simulation-Header", "devserver-handle-post")
            .body(Full::new(body))
            .unwrap()
    } else {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found")))
            .unwrap()
    };
    Ok(response)
}

async fn spawn_dev_server() -> (u16, AbortOnDropHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(handle_dev_request))
                    .await;
            });
        }
    });
    (port, AbortOnDropHandle::new(task))
}

// ── Harness helpers ───────────────────────────────────────────────────────────

async fn start_server() -> ServerHandle {
    server::start(ServerConfig { http_port: 0, tcp_port: 0, api_keys_file: None })
        .await
        .unwrap()
}

fn client_config(handle: &ServerHandle, local_port: u16, name: &str) -> ClientConfig {
    ClientConfig {
        local_port,
        tunnel_http_port: 443,
        tunnel_tcp_port: handle.tcp_addr.port(),
        tunnel_host: "127.0.0.1".to_owned(),
        custom_dns: None,
        custom_cert: None,
        custom_name: Some(name.to_owned()),
        api_key: None,
    }
}

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Session {
    fn kill(&self) {
        // Hard-drop the session and its TCP connection, as if the process
        // died; no CLIENT_DISCONNECT is sent.
        self.task.abort();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// Connect a client session and bind it with CREATE or RECLAIM.
async fn connect_session(handle: &ServerHandle, local_port: u16, name: &str, reclaim: bool) -> Session {
    let config = client_config(handle, local_port, name);
    connect_session_with(handle, config, name, reclaim).await
}

async fn connect_session_with(
    handle: &ServerHandle,
    config: ClientConfig,
    name: &str,
    reclaim: bool,
) -> Session {
    let stream = TcpStream::connect(("127.0.0.1", handle.tcp_addr.port())).await.unwrap();
    let client = MmarClient::new(stream, config).unwrap();
    let sender = client.sender();

    let cancel = CancellationToken::new();
    let task = tokio::spawn(client.process_messages(cancel.clone()));

    let kind = if reclaim { MsgType::ReclaimTunnel } else { MsgType::CreateTunnel };
    sender
        .send(&TunnelMessage::with_data(kind, name.as_bytes().to_vec()))
        .await
        .unwrap();

    Session { cancel, task }
}

fn http_client(name: &str, handle: &ServerHandle) -> reqwest::Client {
    let addr = SocketAddr::from(([127, 0, 0, 1], handle.http_addr.port()));
    reqwest::Client::builder()
        .resolve(&format!("{name}.localhost"), addr)
        .build()
        .unwrap()
}

fn tunnel_url(name: &str, handle: &ServerHandle, path: &str) -> String {
    format!("http://{name}.localhost:{}{path}", handle.http_addr.port())
}

/// Wait until requests for `name` stop answering with the unbound-tunnel
/// page, i.e. the subdomain is routed.
async fn wait_until_bound(name: &str, handle: &ServerHandle) {
    let client = http_client(name, handle);
    for _ in 0..50 {
        if let Ok(resp) = client.get(tunnel_url(name, handle, "/status-probe")).send().await {
            if let Ok(body) = resp.text().await {
                if body != CLIENT_DISCONNECT_ERR_TEXT {
                    return;
                }
            }
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("tunnel {name} never became routable");
}

async fn raw_tunnel(handle: &ServerHandle) -> Tunnel {
    let stream = TcpStream::connect(("127.0.0.1", handle.tcp_addr.port())).await.unwrap();
    Tunnel::new(stream).unwrap()
}

// ── Stub DNS server ───────────────────────────────────────────────────────────

/// Build a minimal RFC 1035 answer for one query: echo the question and
/// answer with loopback (A → 127.0.0.1, AAAA → ::1). Subdomained localhost
/// names do not resolve through system lookup, which is exactly what the
/// custom-dns flag exists for.
fn build_dns_response(query: &[u8]) -> Option<Vec<u8>> {
    if query.len() < 13 {
        return None;
    }

    // Walk the QNAME labels to find the end of the question section.
    let mut i = 12;
    while i < query.len() && query[i] != 0 {
        i += query[i] as usize + 1;
    }
    // The name terminator is followed by type (2 bytes) and class (2 bytes).
    if i + 5 > query.len() {
        return None;
    }
    let question = &query[12..i + 5];
    let qtype = u16::from_be_bytes([query[i + 1], query[i + 2]]);

    let mut resp = Vec::with_capacity(question.len() + 44);
    resp.extend_from_slice(&query[..2]); // transaction id
    resp.extend_from_slice(&[0x81, 0x80]); // response, recursion available
    resp.extend_from_slice(&query[4..6]); // question count
    resp.extend_from_slice(&[0x00, 0x01]); // answer count
    resp.extend_from_slice(&[0x00, 0x00]); // authority RRs
    resp.extend_from_slice(&[0x00, 0x00]); // additional RRs
    resp.extend_from_slice(question);
    resp.extend_from_slice(&[0xC0, 0x0C]); // answer name: pointer to question
    resp.extend_from_slice(&query[i + 1..i + 5]); // type + class
    resp.extend_from_slice(&3600u32.to_be_bytes()); // TTL

    const AAAA: u16 = 28;
    if qtype == AAAA {
        resp.extend_from_slice(&16u16.to_be_bytes());
        let mut rdata = [0u8; 16];
        rdata[15] = 1;
        resp.extend_from_slice(&rdata);
    } else {
        resp.extend_from_slice(&4u16.to_be_bytes());
        resp.extend_from_slice(&[127, 0, 0, 1]);
    }
    Some(resp)
}

async fn spawn_dns_server() -> (SocketAddr, AbortOnDropHandle<()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut buffer = [0u8; 512];
        loop {
            let Ok((read, peer)) = socket.recv_from(&mut buffer).await else { break };
            if let Some(response) = build_dns_response(&buffer[..read]) {
                let _ = socket.send_to(&response, peer).await;
            }
        }
    });
    (addr, AbortOnDropHandle::new(task))
}

// ── Simulations ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn get_request_through_tunnel() {
    let handle = start_server().await;
    let (dev_port, _dev) = spawn_dev_server().await;
    let _session = connect_session(&handle, dev_port, "abc123", false).await;
    wait_until_bound("abc123", &handle).await;

    let resp = http_client("abc123", &handle)
        .get(tunnel_url("abc123", &handle, "/get"))
        .header("Simulation-Test", "verify-get-request-success")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("simulation-header").unwrap(),
        "devserver-handle-get"
    );
    let cookies: Vec<_> = resp.headers().get_all("set-cookie").iter().collect();
    assert_eq!(cookies, vec!["first=1", "second=2"]);

    let body: serde_json::Value = serde_json::from_str(&resp.text().await.unwrap()).unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"], "some data");
    assert_eq!(
        body["echo"]["reqHeaders"]["simulation-test"][0],
        "verify-get-request-success"
    );
}

#[tokio::test]
async fn post_request_through_tunnel_echoes_body() {
    let handle = start_server().await;
    let (dev_port, _dev) = spawn_dev_server().await;
    let _session = connect_session(&handle, dev_port, "post01", false).await;
    wait_until_bound("post01", &handle).await;

    let payload = r#"{"success":true,"payload":{"some":"data","moreData":123}}"#;
    let resp = http_client("post01", &handle)
        .post(tunnel_url("post01", &handle, "/post"))
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(payload)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("simulation-header").unwrap(),
        "devserver-handle-post"
    );
    assert_eq!(resp.text().await.unwrap(), payload);
}

#[tokio::test]
async fn unknown_subdomain_gets_disconnect_page() {
    let handle = start_server().await;

    let resp = http_client("nosuch", &handle)
        .get(tunnel_url("nosuch", &handle, "/get"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(CONTENT_TYPE).unwrap(),
        "text/plain; charset=utf-8"
    );
    assert_eq!(resp.text().await.unwrap(), CLIENT_DISCONNECT_ERR_TEXT);
}

#[tokio::test]
async fn dead_localhost_gets_canned_page() {
    let handle = start_server().await;

    // Find a port with nothing behind it.
    let parked = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = parked.local_addr().unwrap().port();
    drop(parked);

    let _session = connect_session(&handle, dead_port, "dead01", false).await;
    wait_until_bound("dead01", &handle).await;

    let resp = http_client("dead01", &handle)
        .get(tunnel_url("dead01", &handle, "/get"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), LOCALHOST_NOT_RUNNING_ERR_TEXT);
}

#[tokio::test]
async fn reconnecting_client_reclaims_its_subdomain() {
    let handle = start_server().await;
    let (dev_port, _dev) = spawn_dev_server().await;

    let session = connect_session(&handle, dev_port, "keepme", false).await;
    wait_until_bound("keepme", &handle).await;
    session.kill();
    sleep(Duration::from_millis(300)).await;

    // Same subdomain, rebound through RECLAIM, routes again.
    let _session = connect_session(&handle, dev_port, "keepme", true).await;
    wait_until_bound("keepme", &handle).await;

    let resp = http_client("keepme", &handle)
        .get(tunnel_url("keepme", &handle, "/get"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn reclaim_of_still_bound_subdomain_is_refused() {
    let handle = start_server().await;
    let (dev_port, _dev) = spawn_dev_server().await;
    let _session = connect_session(&handle, dev_port, "taken1", false).await;
    wait_until_bound("taken1", &handle).await;

    let mut intruder = raw_tunnel(&handle).await;
    intruder
        .send(&TunnelMessage::with_data(
            MsgType::ReclaimTunnel,
            b"taken1".to_vec(),
        ))
        .await
        .unwrap();

    // The server closes the new connection without binding it.
    let err = intruder.recv().await.unwrap_err();
    assert!(err.is_network());
}

#[tokio::test]
async fn sixth_tunnel_from_one_ip_is_refused() {
    let handle = start_server().await;

    let mut held = Vec::new();
    for _ in 0..5 {
        let mut tunnel = raw_tunnel(&handle).await;
        tunnel.send(&TunnelMessage::new(MsgType::CreateTunnel)).await.unwrap();
        let reply = tunnel.recv().await.unwrap();
        assert_eq!(reply.msg_type, MsgType::TunnelCreated);
        held.push(tunnel);
    }

    let mut over_limit = raw_tunnel(&handle).await;
    over_limit.send(&TunnelMessage::new(MsgType::CreateTunnel)).await.unwrap();
    let reply = over_limit.recv().await.unwrap();
    assert_eq!(reply.msg_type, MsgType::ClientTunnelLimit);
}

#[tokio::test]
async fn custom_subdomain_policy_messages() {
    let handle = start_server().await;

    let mut bad_name = raw_tunnel(&handle).await;
    bad_name
        .send(&TunnelMessage::with_data(MsgType::CreateTunnel, b"-nope-".to_vec()))
        .await
        .unwrap();
    assert_eq!(bad_name.recv().await.unwrap().msg_type, MsgType::InvalidSubdomainName);

    let mut first = raw_tunnel(&handle).await;
    first
        .send(&TunnelMessage::with_data(MsgType::CreateTunnel, b"dibs".to_vec()))
        .await
        .unwrap();
    assert_eq!(first.recv().await.unwrap().msg_type, MsgType::TunnelCreated);

    let mut second = raw_tunnel(&handle).await;
    second
        .send(&TunnelMessage::with_data(MsgType::CreateTunnel, b"dibs".to_vec()))
        .await
        .unwrap();
    assert_eq!(second.recv().await.unwrap().msg_type, MsgType::SubdomainAlreadyTaken);
}

#[tokio::test]
async fn heartbeats_answered_with_ack() {
    let handle = start_server().await;
    let mut tunnel = raw_tunnel(&handle).await;
    tunnel.send(&TunnelMessage::new(MsgType::HeartbeatFromClient)).await.unwrap();
    assert_eq!(tunnel.recv().await.unwrap().msg_type, MsgType::HeartbeatAck);
}

#[tokio::test]
async fn invalid_http_version_is_rejected_at_ingress() {
    let handle = start_server().await;

    let mut stream = TcpStream::connect(("127.0.0.1", handle.http_addr.port())).await.unwrap();
    stream
        .write_all(b"GET / HTTP/2.0.1\r\nHost: abc123.localhost\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 400"), "got: {response}");
}

#[tokio::test]
async fn mismatched_content_length_times_out_request_body() {
    let handle = start_server().await;
    let (dev_port, _dev) = spawn_dev_server().await;
    let _session = connect_session(&handle, dev_port, "short1", false).await;
    wait_until_bound("short1", &handle).await;

    let mut stream = TcpStream::connect(("127.0.0.1", handle.http_addr.port())).await.unwrap();
    stream
        .write_all(
            b"POST /post HTTP/1.1\r\nHost: short1.localhost\r\nContent-Length: 25\r\n\r\n12345678901234567890",
        )
        .await
        .unwrap();

    // 20 of the promised 25 bytes ever arrive; the chunk timer fires.
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 408"), "got: {response}");
    assert!(response.contains("Timeout reading request body"), "got: {response}");
}

#[tokio::test]
async fn oversize_body_is_rejected() {
    let handle = start_server().await;
    let (dev_port, _dev) = spawn_dev_server().await;
    let _session = connect_session(&handle, dev_port, "biggie", false).await;
    wait_until_bound("biggie", &handle).await;

    let total = crate::constants::MAX_REQ_BODY_SIZE + 65_536;
    let mut stream = TcpStream::connect(("127.0.0.1", handle.http_addr.port())).await.unwrap();
    let head = format!(
        "POST /post HTTP/1.1\r\nHost: biggie.localhost\r\nContent-Length: {total}\r\n\r\n"
    );
    stream.write_all(head.as_bytes()).await.unwrap();

    // Keep writing until done or the server cuts us off mid-body.
    let chunk = vec![b'x'; 65_536];
    let mut written = 0;
    let mut write_failed = false;
    while written < total {
        if stream.write_all(&chunk).await.is_err() {
            write_failed = true;
            break;
        }
        written += chunk.len();
    }

    let mut response = Vec::new();
    let read = stream.read_to_end(&mut response).await;
    let response = String::from_utf8_lossy(&response);
    let got_413 = response.contains("413") && response.contains("Request too large");
    // A reset mid-write is also an acceptable refusal.
    assert!(got_413 || write_failed || read.is_err(), "got: {response}");
}

#[tokio::test]
async fn stats_endpoint_requires_and_accepts_basic_auth() {
    let handle = start_server().await;
    let (dev_port, _dev) = spawn_dev_server().await;
    let _session = connect_session(&handle, dev_port, "statme", false).await;
    wait_until_bound("statme", &handle).await;

    let client = http_client("stats", &handle);

    let resp = client.get(tunnel_url("stats", &handle, "/")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        resp.headers().get("www-authenticate").unwrap(),
        "Basic realm=\"stats\""
    );

    let resp = client
        .get(tunnel_url("stats", &handle, "/"))
        .basic_auth("admin", Some("admin"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let stats: serde_json::Value = serde_json::from_str(&resp.text().await.unwrap()).unwrap();
    assert_eq!(stats["connectedClientsCount"], 1);
    assert_eq!(stats["connectedClients"][0]["id"], "statme");
    assert!(stats["connectedClients"][0]["createdOn"].is_string());
}

#[tokio::test]
async fn custom_dns_resolves_the_local_destination() {
    let handle = start_server().await;
    let (dev_port, _dev) = spawn_dev_server().await;
    let (dns_addr, _dns) = spawn_dns_server().await;

    let mut config = client_config(&handle, dev_port, "dnsed1");
    config.custom_dns = Some(dns_addr.to_string());
    let _session = connect_session_with(&handle, config, "dnsed1", false).await;
    wait_until_bound("dnsed1", &handle).await;

    let resp = http_client("dnsed1", &handle)
        .get(tunnel_url("dnsed1", &handle, "/get"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("simulation-header").unwrap(),
        "devserver-handle-get"
    );
}

#[tokio::test]
async fn redirects_pass_through_unfollowed() {
    let handle = start_server().await;
    let (dev_port, _dev) = spawn_dev_server().await;
    let _session = connect_session(&handle, dev_port, "redir1", false).await;
    wait_until_bound("redir1", &handle).await;

    // The forwarder must hand the 3xx back as-is; only the end user's own
    // client may decide to follow it.
    let addr = SocketAddr::from(([127, 0, 0, 1], handle.http_addr.port()));
    let no_follow = reqwest::Client::builder()
        .resolve("redir1.localhost", addr)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    let resp = no_follow
        .get(tunnel_url("redir1", &handle, "/redirect"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(resp.headers().get("location").unwrap(), "/get");
}

#[tokio::test]
async fn concurrent_requests_are_correlated_by_id() {
    let handle = start_server().await;
    let (dev_port, _dev) = spawn_dev_server().await;
    let _session = connect_session(&handle, dev_port, "multi1", false).await;
    wait_until_bound("multi1", &handle).await;

    let client = http_client("multi1", &handle);
    let mut tasks = Vec::new();
    for i in 0..8 {
        let client = client.clone();
        let url = tunnel_url("multi1", &handle, "/post");
        tasks.push(tokio::spawn(async move {
            let payload = format!("{{\"n\":{i}}}");
            let resp = client.post(url).body(payload.clone()).send().await.unwrap();
            (resp.text().await.unwrap(), payload)
        }));
    }
    for task in tasks {
        let (body, payload) = task.await.unwrap();
        assert_eq!(body, payload);
    }
}
