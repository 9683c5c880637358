// Transport layer seams
// This file defines the data-plane transport manager, the stream dialer and
// listener used by the setup RPC, and the connection type they exchange
//
// Numan Thabit 2025 Nov

pub mod frame;
pub mod memory;
pub mod packet;
pub mod rpc;
pub mod tcp;

use crate::errors::TransportError;
use crate::keys::PubKey;
use crate::routing::{Port, TransportId};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use memory::MemoryNetwork;
pub use packet::Packet;

/// Port reserved for setup RPC on every visor and setup node.
pub const SETUP_PORT: Port = 36;

pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Reliable, ordered byte stream to a peer identified by its public key.
pub struct Conn {
    pub remote: PubKey,
    pub stream: Box<dyn ByteStream>,
}

impl Conn {
    pub fn new(remote: PubKey, stream: impl ByteStream + 'static) -> Self {
        Self {
            remote,
            stream: Box::new(stream),
        }
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn").field("remote", &self.remote).finish()
    }
}

/// Data-plane packet I/O over the visor's transports.
#[async_trait]
pub trait TransportManager: Send + Sync {
    fn local_pk(&self) -> PubKey;

    /// Next packet from any transport; blocks until one arrives or the manager closes.
    async fn read_packet(&self) -> Result<Packet, TransportError>;

    async fn write_packet(&self, tp: TransportId, packet: Packet) -> Result<(), TransportError>;

    async fn close(&self);
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, remote: PubKey, port: Port) -> Result<Conn, TransportError>;
}

#[async_trait]
pub trait Listener: Send + Sync {
    /// Next inbound connection; `TransportError::Closed` once closed.
    async fn accept(&self) -> Result<Conn, TransportError>;

    async fn close(&self);
}
