// Request/response RPC over setup frames
// This file implements the client side (one outstanding call per connection,
// bounded by a timeout) and the per-connection serving loop
//
// Numan Thabit 2025 Nov

use crate::errors::{Failure, FailureCode, RpcError};
use crate::keys::PubKey;
use crate::metrics::{RPC_ERRORS, RPC_LATENCY};
use crate::routing::Port;
use crate::transport::frame::{read_frame, write_frame, PacketType};
use crate::transport::{Conn, Dialer};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::debug;

pub struct RpcClient {
    conn: Conn,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(conn: Conn, timeout: Duration) -> Self {
        Self { conn, timeout }
    }

    /// Dial `remote` on `port`; the dial shares the call timeout.
    pub async fn dial(
        dialer: &dyn Dialer,
        remote: PubKey,
        port: Port,
        timeout: Duration,
    ) -> Result<Self, RpcError> {
        let conn = tokio::time::timeout(timeout, dialer.dial(remote, port))
            .await
            .map_err(|_| RpcError::Timeout("dial"))??;
        Ok(Self::new(conn, timeout))
    }

    pub fn remote(&self) -> PubKey {
        self.conn.remote
    }

    pub async fn call<Req, Resp>(&mut self, ty: PacketType, req: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let method = ty.method();
        let started = Instant::now();
        let res = match tokio::time::timeout(self.timeout, self.round_trip(ty, req)).await {
            Ok(res) => res,
            Err(_) => Err(RpcError::Timeout(method)),
        };
        RPC_LATENCY
            .with_label_values(&[method])
            .observe(started.elapsed().as_secs_f64());
        if let Err(err) = &res {
            RPC_ERRORS.with_label_values(&[method]).inc();
            debug!(remote = %self.conn.remote, method, error = %err, "rpc call failed");
        }
        res
    }

    async fn round_trip<Req, Resp>(&mut self, ty: PacketType, req: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(req)?;
        write_frame(&mut self.conn.stream, ty, &body).await?;
        match read_frame(&mut self.conn.stream).await? {
            Some((PacketType::RespSuccess, body)) => Ok(serde_json::from_slice(&body)?),
            Some((PacketType::RespFailure, body)) => {
                Err(RpcError::Failure(serde_json::from_slice(&body)?))
            }
            Some((other, _)) => Err(RpcError::UnexpectedResponse(other)),
            None => Err(RpcError::Io(std::io::ErrorKind::UnexpectedEof.into())),
        }
    }
}

/// Server side of one RPC connection.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, remote: PubKey, ty: PacketType, body: &[u8]) -> Result<Vec<u8>, Failure>;
}

/// Answer frames on `conn` until the peer hangs up. Protocol errors end the
/// connection.
pub async fn serve_conn<H>(conn: Conn, handler: &H) -> Result<(), RpcError>
where
    H: RpcHandler + ?Sized,
{
    let Conn { remote, mut stream } = conn;
    while let Some((ty, body)) = read_frame(&mut stream).await? {
        let (resp_ty, resp) = match handler.handle(remote, ty, &body).await {
            Ok(out) => (PacketType::RespSuccess, out),
            Err(failure) => (PacketType::RespFailure, serde_json::to_vec(&failure)?),
        };
        write_frame(&mut stream, resp_ty, &resp).await?;
    }
    Ok(())
}

pub fn decode_body<T: DeserializeOwned>(ty: PacketType, body: &[u8]) -> Result<T, Failure> {
    serde_json::from_slice(body).map_err(|e| {
        Failure::new(FailureCode::Unknown, format!("decode {} request: {e}", ty.method()))
    })
}

pub fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>, Failure> {
    serde_json::to_vec(value)
        .map_err(|e| Failure::new(FailureCode::Unknown, format!("encode response: {e}")))
}

pub fn unsupported(ty: PacketType) -> Failure {
    Failure::new(
        FailureCode::Unknown,
        format!("packet type {ty:?} is not served here"),
    )
}
