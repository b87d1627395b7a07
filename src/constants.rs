use std::time::Duration;

pub const SERVER_HTTP_PORT: u16 = 3376;
pub const SERVER_TCP_PORT: u16 = 6673;
pub const CLIENT_LOCAL_PORT: u16 = 8000;
pub const TUNNEL_HTTP_PORT: u16 = 443;
pub const TUNNEL_HOST: &str = "mmar.dev";

pub const SERVER_STATS_DEFAULT_USERNAME: &str = "admin";
pub const SERVER_STATS_DEFAULT_PASSWORD: &str = "admin";

pub const TUNNEL_MESSAGE_PROTOCOL_VERSION: u8 = 4;
pub const TUNNEL_MESSAGE_DATA_DELIMITER: u8 = b'\n';

pub const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
pub const ID_LENGTH: usize = 6;

/// REQUEST/RESPONSE payloads are prefixed with a little-endian request id.
pub const REQUEST_ID_SIZE: usize = 4;

pub const MAX_TUNNELS_PER_IP: usize = 5;

pub const MAX_REQ_BODY_SIZE: usize = 10_000_000; // 10mb

/// Frame payloads may exceed the body ceiling by the headroom needed for
/// request lines and headers, never by more.
pub const MAX_TUNNEL_MESSAGE_SIZE: usize = MAX_REQ_BODY_SIZE + 16 * 1024;

pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);
pub const TUNNEL_CREATE_TIMEOUT: Duration = Duration::from_secs(3);
pub const TUNNEL_RECONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const REQ_BODY_READ_CHUNK_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEST_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const HEARTBEAT_FROM_SERVER_TIMEOUT: Duration = Duration::from_secs(5);
pub const HEARTBEAT_FROM_CLIENT_TIMEOUT: Duration = Duration::from_secs(2);
pub const READ_DEADLINE: Duration = Duration::from_secs(3);

pub const CLIENT_DISCONNECT_ERR_TEXT: &str =
    "Tunnel is closed, cannot connect to mmar client.";
pub const LOCALHOST_NOT_RUNNING_ERR_TEXT: &str =
    "Tunneled successfully, but nothing is running on localhost.";
pub const DEST_REQUEST_TIMEDOUT_ERR_TEXT: &str =
    "Destination server took too long to respond";
pub const READ_BODY_CHUNK_ERR_TEXT: &str = "Error reading request body";
pub const READ_BODY_CHUNK_TIMEOUT_ERR_TEXT: &str = "Timeout reading request body";
pub const READ_RESP_BODY_ERR_TEXT: &str =
    "Could not read response from destination server, check your server's logs for any errors.";
pub const MAX_REQ_BODY_SIZE_ERR_TEXT: &str = "Request too large";
pub const FAILED_TO_FORWARD_ERR_TEXT: &str = "Failed to forward request to mmar client.";
pub const FAILED_TO_READ_RESP_ERR_TEXT: &str =
    "Failed to read response for forwarded request from mmar client.";

/// Names that can never be assigned as tunnel subdomains, whether requested
/// or randomly generated. The empty string is rejected separately.
pub const RESERVED_SUBDOMAINS: [&str; 5] = ["admin", "stats", "www", "api", "app"];
