//! Client for the Minecraft query protocol (the UDP one enabled with
//! `enable-query=true`, not the TCP server list ping).
//!
//! A query is two round-trips on one socket: a handshake that hands us a
//! challenge token, then a full stat request carrying that token.

pub mod packet;

use std::{
    fmt, io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::{UdpSocket, lookup_host};
use tracing::{debug, trace};

pub const DEFAULT_PORT: u16 = 25565;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// The biggest payload a UDP datagram can carry.
const RECV_BUFFER_SIZE: usize = 65535;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTarget {
    pub host: String,
    pub port: u16,
    /// Applies to each of the two round-trips separately.
    pub timeout: Duration,
}

impl QueryTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Display for QueryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Correlates the handshake and stat replies of one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId([u8; 4]);

impl SessionId {
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Vanilla servers only echo the low 4 bits of each byte, so the high
    /// bits are always cleared.
    pub fn random() -> Self {
        let bytes: [u8; 4] = rand::random();
        Self(bytes.map(|b| b & 0x0F))
    }

    pub fn to_bytes(self) -> [u8; 4] {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", u32::from_be_bytes(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStage {
    Handshake,
    Stat,
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryStage::Handshake => f.write_str("handshake"),
            QueryStage::Stat => f.write_str("stat"),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no {stage} reply within {timeout:?}")]
    Timeout { stage: QueryStage, timeout: Duration },
    #[error("reply didn't match our request: {reason}")]
    ProtocolMismatch { reason: String },
    #[error("malformed challenge token: {reason}")]
    MalformedChallenge { reason: String },
    #[error("couldn't find the player count: {reason}")]
    MissingPlayerCount { reason: String },
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl QueryError {
    /// Short name of the failure, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::Timeout { .. } => "QueryTimeout",
            QueryError::ProtocolMismatch { .. } => "ProtocolMismatch",
            QueryError::MalformedChallenge { .. } => "MalformedChallenge",
            QueryError::MissingPlayerCount { .. } => "MissingPlayerCount",
            QueryError::Transport(_) => "TransportError",
        }
    }
}

/// Something that can count the players on a server. [`UdpQuery`] is the real
/// one.
#[async_trait]
pub trait PlayerQuery: Send + Sync {
    async fn player_count(&self, target: &QueryTarget) -> Result<u32, QueryError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UdpQuery;

#[async_trait]
impl PlayerQuery for UdpQuery {
    async fn player_count(&self, target: &QueryTarget) -> Result<u32, QueryError> {
        query_player_count(target).await
    }
}

/// Ask the server at `target` how many players are online.
pub async fn query_player_count(target: &QueryTarget) -> Result<u32, QueryError> {
    query_with_session(target, SessionId::random()).await
}

/// Same as [`query_player_count`] but with a caller-chosen session id.
pub async fn query_with_session(
    target: &QueryTarget,
    session_id: SessionId,
) -> Result<u32, QueryError> {
    debug!("querying {target} (session {session_id}, timeout {:?})", target.timeout);

    let result = run_query(target, session_id).await;
    match &result {
        Ok(count) => debug!("{target} has {count} players online"),
        Err(err) => debug!("query to {target} failed ({}): {err}", err.kind()),
    }
    result
}

async fn run_query(target: &QueryTarget, session_id: SessionId) -> Result<u32, QueryError> {
    let addr = resolve(target).await?;

    let bind_addr: SocketAddr = match addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    // connecting filters out datagrams from anyone else and makes ICMP errors
    // show up on recv
    socket.connect(addr).await?;

    let mut buffer = vec![0; RECV_BUFFER_SIZE];

    let handshake = packet::build_handshake_request(session_id);
    let len = round_trip(&socket, &handshake, &mut buffer, target.timeout, QueryStage::Handshake)
        .await?;
    let challenge_token = packet::parse_handshake_response(&buffer[..len], session_id)?;
    trace!("challenge token from {addr}: {challenge_token}");

    let stat = packet::build_full_stat_request(session_id, challenge_token);
    let len = round_trip(&socket, &stat, &mut buffer, target.timeout, QueryStage::Stat).await?;

    packet::parse_stat_response(&buffer[..len], session_id)
}

async fn resolve(target: &QueryTarget) -> Result<SocketAddr, QueryError> {
    let mut addrs = lookup_host((target.host.as_str(), target.port)).await?;
    addrs.next().ok_or_else(|| {
        QueryError::Transport(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} didn't resolve to any address", target.host),
        ))
    })
}

/// Send one datagram and wait for one reply, returning the reply length.
async fn round_trip(
    socket: &UdpSocket,
    request: &[u8],
    buffer: &mut [u8],
    timeout: Duration,
    stage: QueryStage,
) -> Result<usize, QueryError> {
    trace!("sending {stage} request: {request:02x?}");
    socket.send(request).await?;

    let len = tokio::time::timeout(timeout, socket.recv(buffer))
        .await
        .map_err(|_| QueryError::Timeout { stage, timeout })??;
    trace!("{stage} reply ({len} bytes): {:02x?}", &buffer[..len]);

    Ok(len)
}
