use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::constants::{
    CLIENT_DISCONNECT_ERR_TEXT, DEST_REQUEST_TIMEDOUT_ERR_TEXT, LOCALHOST_NOT_RUNNING_ERR_TEXT,
    MAX_TUNNEL_MESSAGE_SIZE, READ_DEADLINE, READ_RESP_BODY_ERR_TEXT,
    TUNNEL_MESSAGE_DATA_DELIMITER, TUNNEL_MESSAGE_PROTOCOL_VERSION,
};

/// Longest run of ASCII digits accepted for the payload-length field. The
/// largest legal length fits in 8 digits, so 10 leaves room without letting a
/// peer stream garbage into the length buffer.
const MAX_LENGTH_DIGITS: u64 = 10;

/// Kinds of messages exchanged between client and server over the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Request = 1,
    Response = 2,
    CreateTunnel = 3,
    ReclaimTunnel = 4,
    TunnelCreated = 5,
    TunnelReclaimed = 6,
    ClientDisconnect = 7,
    ClientTunnelLimit = 8,
    InvalidSubdomainName = 9,
    SubdomainAlreadyTaken = 10,
    LocalhostNotRunning = 11,
    DestRequestTimedout = 12,
    InvalidRespFromDest = 13,
    HeartbeatFromClient = 14,
    HeartbeatFromServer = 15,
    HeartbeatAck = 16,
}

impl TryFrom<u8> for MsgType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, ProtocolError> {
        Ok(match tag {
            1 => MsgType::Request,
            2 => MsgType::Response,
            3 => MsgType::CreateTunnel,
            4 => MsgType::ReclaimTunnel,
            5 => MsgType::TunnelCreated,
            6 => MsgType::TunnelReclaimed,
            7 => MsgType::ClientDisconnect,
            8 => MsgType::ClientTunnelLimit,
            9 => MsgType::InvalidSubdomainName,
            10 => MsgType::SubdomainAlreadyTaken,
            11 => MsgType::LocalhostNotRunning,
            12 => MsgType::DestRequestTimedout,
            13 => MsgType::InvalidRespFromDest,
            14 => MsgType::HeartbeatFromClient,
            15 => MsgType::HeartbeatFromServer,
            16 => MsgType::HeartbeatAck,
            other => return Err(ProtocolError::InvalidMessageType(other)),
        })
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid message protocol version")]
    InvalidProtocolVersion,
    #[error("invalid tunnel message type: {0}")]
    InvalidMessageType(u8),
    #[error("tunnel message length {0} exceeds maximum")]
    MessageTooLarge(usize),
    #[error("malformed tunnel message length")]
    MalformedLength,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Errors caused by the peer or the network going away, as opposed to a
    /// peer speaking the protocol wrong.
    pub fn is_network(&self) -> bool {
        match self {
            ProtocolError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// One unit on the tunnel wire. The payload is opaque to the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelMessage {
    pub msg_type: MsgType,
    pub data: Vec<u8>,
}

impl TunnelMessage {
    pub fn new(msg_type: MsgType) -> Self {
        Self { msg_type, data: Vec::new() }
    }

    pub fn with_data(msg_type: MsgType, data: Vec<u8>) -> Self {
        Self { msg_type, data }
    }

    // A TunnelMessage is serialized in the following format:
    //
    // +---------+----------+---------------------+-----------+------------------+
    // | Version | Msg Type | Length of Msg Data  | Delimiter | Message Data     |
    // | (1 byte)| (1 byte) | (ASCII decimal)     | (1 byte)  | (Length bytes)   |
    // +---------+----------+---------------------+-----------+------------------+
    pub fn serialize(&self) -> Vec<u8> {
        let length = self.data.len().to_string();
        let mut frame = Vec::with_capacity(2 + length.len() + 1 + self.data.len());
        frame.push(TUNNEL_MESSAGE_PROTOCOL_VERSION);
        frame.push(self.msg_type as u8);
        frame.extend_from_slice(length.as_bytes());
        frame.push(TUNNEL_MESSAGE_DATA_DELIMITER);
        frame.extend_from_slice(&self.data);
        frame
    }

    pub async fn deserialize<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncBufRead + Unpin,
    {
        let version = reader.read_u8().await?;
        Self::deserialize_after_version(version, reader).await
    }

    /// Continues a read whose version byte was already consumed by the
    /// heartbeat-aware receive path.
    async fn deserialize_after_version<R>(
        version: u8,
        reader: &mut R,
    ) -> Result<Self, ProtocolError>
    where
        R: AsyncBufRead + Unpin,
    {
        if version != TUNNEL_MESSAGE_PROTOCOL_VERSION {
            return Err(ProtocolError::InvalidProtocolVersion);
        }

        let msg_type = MsgType::try_from(reader.read_u8().await?)?;

        let mut length_buf = Vec::new();
        let mut limited = (&mut *reader).take(MAX_LENGTH_DIGITS + 1);
        let read = limited
            .read_until(TUNNEL_MESSAGE_DATA_DELIMITER, &mut length_buf)
            .await?;
        if read == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        if length_buf.pop() != Some(TUNNEL_MESSAGE_DATA_DELIMITER) {
            // Ran out of digits without seeing the delimiter.
            return Err(ProtocolError::MalformedLength);
        }

        let length: usize = std::str::from_utf8(&length_buf)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(ProtocolError::MalformedLength)?;
        if length > MAX_TUNNEL_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(length));
        }

        let mut data = vec![0u8; length];
        reader.read_exact(&mut data).await?;

        Ok(TunnelMessage { msg_type, data })
    }
}

/// Canned body text shown to the end user for tunnel-level error states.
pub fn tunnel_err_state(msg_type: MsgType) -> &'static str {
    match msg_type {
        MsgType::ClientDisconnect => CLIENT_DISCONNECT_ERR_TEXT,
        MsgType::LocalhostNotRunning => LOCALHOST_NOT_RUNNING_ERR_TEXT,
        MsgType::DestRequestTimedout => DEST_REQUEST_TIMEDOUT_ERR_TEXT,
        MsgType::InvalidRespFromDest => READ_RESP_BODY_ERR_TEXT,
        _ => "An error occurred while attempting to tunnel.",
    }
}

/// Write handle to a tunnel connection. Cloneable; each `send` writes one
/// whole frame under the mutex so concurrent senders never interleave.
#[derive(Clone, Debug)]
pub struct TunnelSender {
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl TunnelSender {
    pub async fn send(&self, msg: &TunnelMessage) -> io::Result<()> {
        let frame = msg.serialize();
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await
    }

    /// Swap in the write half of a fresh connection (client reconnect).
    async fn replace(&self, write_half: OwnedWriteHalf) {
        *self.writer.lock().await = write_half;
    }

    /// Half-close the connection. Safe to call more than once.
    pub async fn close(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}

/// One client-server TCP link: the buffered read half plus a shareable
/// write handle. The owner of the `Tunnel` is the only reader.
pub struct Tunnel {
    reader: BufReader<OwnedReadHalf>,
    sender: TunnelSender,
    peer_addr: SocketAddr,
    created_on: DateTime<Utc>,
}

impl Tunnel {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            sender: TunnelSender { writer: Arc::new(Mutex::new(write_half)) },
            peer_addr,
            created_on: Utc::now(),
        })
    }

    pub fn sender(&self) -> TunnelSender {
        self.sender.clone()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn created_on(&self) -> DateTime<Utc> {
        self.created_on
    }

    pub async fn send(&self, msg: &TunnelMessage) -> io::Result<()> {
        self.sender.send(msg).await
    }

    pub async fn recv(&mut self) -> Result<TunnelMessage, ProtocolError> {
        TunnelMessage::deserialize(&mut self.reader).await
    }

    /// Receive one message, proactively heartbeating when idle: if no frame
    /// starts within `idle`, send `heartbeat` and allow `READ_DEADLINE` more
    /// for the peer to say anything at all. A second expiry is reported as a
    /// timed-out IO error. Any received byte cancels both timers.
    pub async fn recv_or_heartbeat(
        &mut self,
        idle: Duration,
        heartbeat: MsgType,
    ) -> Result<TunnelMessage, ProtocolError> {
        // read_u8 consumes nothing until a byte is available, so it is safe
        // to drop on timeout.
        let version = match timeout(idle, self.reader.read_u8()).await {
            Ok(read) => read?,
            Err(_) => {
                self.sender.send(&TunnelMessage::new(heartbeat)).await?;
                match timeout(READ_DEADLINE, self.reader.read_u8()).await {
                    Ok(read) => read?,
                    Err(_) => {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "no response to heartbeat within read deadline",
                        )
                        .into())
                    }
                }
            }
        };
        TunnelMessage::deserialize_after_version(version, &mut self.reader).await
    }

    /// Replace both halves with a fresh connection, keeping existing
    /// `TunnelSender` clones valid.
    pub async fn reconnect(&mut self, stream: TcpStream) -> io::Result<()> {
        self.peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        self.reader = BufReader::new(read_half);
        self.sender.replace(write_half).await;
        Ok(())
    }
}
