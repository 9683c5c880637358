// Error types and error handling module
// This file defines the error taxonomy shared by the routing table, the
// visor router, the setup node and the wire codecs
//
// Numan Thabit 2025 Nov

use crate::keys::PubKey;
use crate::routing::{RouteDescriptor, RouteId, TransportId};
use crate::transport::frame::PacketType;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Local routing table failures. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("unknown route id {0}")]
    UnknownRouteId(RouteId),
    #[error("rule {0} is expired")]
    ExpiredRule(RouteId),
    #[error("corrupted rule: {0}")]
    CorruptedRule(String),
    #[error("no available route ids")]
    NoAvailableRoutes,
}

/// Framing and packet decoding failures; the offending connection is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("frame of {0} bytes exceeds the maximum size")]
    OversizedFrame(usize),
    #[error("unknown packet type {0:#04x}")]
    UnknownPacketType(u8),
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("unknown transport {0}")]
    UnknownTransport(TransportId),
    #[error("visor {0} is unreachable")]
    Unreachable(PubKey),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable failure codes carried across the setup RPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    Unknown,
    AddRules,
    CreateRoutes,
    RoutesCreated,
    ReserveRtIds,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::Unknown => "unknown",
            FailureCode::AddRules => "add_rules",
            FailureCode::CreateRoutes => "create_routes",
            FailureCode::RoutesCreated => "routes_created",
            FailureCode::ReserveRtIds => "reserve_rt_ids",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error returned in a `RespFailure` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}: {msg}")]
pub struct Failure {
    pub code: FailureCode,
    pub msg: String,
}

impl Failure {
    pub fn new(code: FailureCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("remote failure: {0}")]
    Failure(#[from] Failure),
    #[error("unexpected response type {0:?}")]
    UnexpectedResponse(PacketType),
}

impl From<crate::transport::frame::FrameError> for RpcError {
    fn from(err: crate::transport::frame::FrameError) -> Self {
        match err {
            crate::transport::frame::FrameError::Io(e) => RpcError::Io(e),
            crate::transport::frame::FrameError::Protocol(e) => RpcError::Protocol(e),
        }
    }
}

#[derive(Debug, Error)]
pub enum RouteFinderError {
    #[error("route finder http: {0}")]
    Http(String),
    #[error("route finder returned status {0}")]
    Status(u16),
    #[error("route finder timed out")]
    Timeout,
    #[error("no paths between {0} and {1}")]
    NoPaths(PubKey, PubKey),
}

/// Failures from the hosted-application collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppError {
    #[error("no process bound to port {0}")]
    ProcNotFound(u16),
    #[error("app: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("route finder: {0}")]
    RouteFinder(#[from] RouteFinderError),
    #[error("no setup node reachable")]
    NoSetupNodes,
    #[error("setup: {0}")]
    Setup(#[from] RpcError),
    #[error("table: {0}")]
    Table(#[from] TableError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("app: {0}")]
    App(#[from] AppError),
    #[error("invalid route: {0}")]
    InvalidRoute(String),
    #[error("route group {0} already exists")]
    RouteGroupExists(RouteDescriptor),
    #[error("route group {0} not found")]
    RouteGroupNotFound(RouteDescriptor),
    #[error("route group is closed")]
    RouteGroupClosed,
    #[error("route group has no forward rule")]
    NoForwardRule,
    #[error("accept queue is full")]
    AcceptQueueFull,
    #[error("router is closed")]
    Closed,
}

/// Failures of a single `DialRouteGroup` request on the setup node.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid route: {0}")]
    InvalidRoute(String),
    #[error("reserve route ids on {pk}: {source}")]
    Reserve {
        pk: PubKey,
        #[source]
        source: RpcError,
    },
    #[error("generate rules: {0}")]
    GenerateRules(String),
    #[error("add rules on {pk}: {source}")]
    AddRules {
        pk: PubKey,
        #[source]
        source: RpcError,
    },
    #[error("visor {0} refused the rules")]
    Rejected(PubKey),
    #[error("notify {pk}: {source}")]
    Notify {
        pk: PubKey,
        #[source]
        source: RpcError,
    },
    #[error("setup node is shutting down")]
    Closed,
}

impl SetupError {
    pub fn code(&self) -> FailureCode {
        match self {
            SetupError::InvalidRoute(_) | SetupError::GenerateRules(_) => FailureCode::CreateRoutes,
            SetupError::Reserve { .. } => FailureCode::ReserveRtIds,
            SetupError::AddRules { .. } => FailureCode::AddRules,
            SetupError::Rejected(_) => FailureCode::RoutesCreated,
            SetupError::Notify { .. } | SetupError::Closed => FailureCode::Unknown,
        }
    }
}

impl From<SetupError> for Failure {
    fn from(err: SetupError) -> Self {
        Failure::new(err.code(), err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("bad hex key: {0}")]
    Hex(String),
    #[error("invalid ed25519 public key")]
    InvalidPoint,
}
