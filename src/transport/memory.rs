// In-process transport network
// This file implements the transport manager, dialer and listener seams on top
// of tokio channels and duplex pipes, for tests and single-host meshes
//
// Numan Thabit 2025 Nov

use crate::errors::TransportError;
use crate::keys::PubKey;
use crate::routing::{Port, TransportId};
use crate::transport::{Conn, Dialer, Listener, Packet, TransportManager};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

const INBOX_CAPACITY: usize = 1024;
const DUPLEX_BUFFER: usize = 64 * 1024;

#[derive(Default)]
struct NetInner {
    inboxes: HashMap<PubKey, mpsc::Sender<Vec<u8>>>,
    transports: HashMap<TransportId, (PubKey, PubKey)>,
    listeners: HashMap<(PubKey, Port), mpsc::Sender<Conn>>,
}

/// Shared registry of visors, the transports between them and their listeners.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pk` and return its packet endpoint. Registering again replaces
    /// the previous inbox.
    pub fn transport_manager(&self, pk: PubKey) -> MemoryTransportManager {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.inner.lock().inboxes.insert(pk, tx);
        MemoryTransportManager {
            pk,
            net: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    /// Create a transport between two visors; both ends share the id.
    pub fn connect(&self, a: PubKey, b: PubKey) -> TransportId {
        let id = TransportId::new_random();
        self.inner.lock().transports.insert(id, (a, b));
        id
    }

    pub fn disconnect(&self, tp: TransportId) {
        self.inner.lock().transports.remove(&tp);
    }

    pub fn dialer(&self, pk: PubKey) -> MemoryDialer {
        MemoryDialer {
            pk,
            net: self.clone(),
        }
    }

    pub fn listen(&self, pk: PubKey, port: Port) -> Result<MemoryListener, TransportError> {
        let mut inner = self.inner.lock();
        if inner.listeners.contains_key(&(pk, port)) {
            return Err(TransportError::Io(std::io::ErrorKind::AddrInUse.into()));
        }
        let (tx, rx) = mpsc::channel(64);
        inner.listeners.insert((pk, port), tx);
        Ok(MemoryListener {
            key: (pk, port),
            net: self.clone(),
            rx: tokio::sync::Mutex::new(rx),
        })
    }
}

pub struct MemoryTransportManager {
    pk: PubKey,
    net: MemoryNetwork,
    inbox: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

#[async_trait]
impl TransportManager for MemoryTransportManager {
    fn local_pk(&self) -> PubKey {
        self.pk
    }

    async fn read_packet(&self) -> Result<Packet, TransportError> {
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some(raw) => Ok(Packet::decode(&raw)?),
            None => Err(TransportError::Closed),
        }
    }

    async fn write_packet(&self, tp: TransportId, packet: Packet) -> Result<(), TransportError> {
        let (peer, inbox) = {
            let inner = self.net.inner.lock();
            let (a, b) = inner
                .transports
                .get(&tp)
                .copied()
                .ok_or(TransportError::UnknownTransport(tp))?;
            let peer = if a == self.pk {
                b
            } else if b == self.pk {
                a
            } else {
                return Err(TransportError::UnknownTransport(tp));
            };
            let inbox = inner
                .inboxes
                .get(&peer)
                .cloned()
                .ok_or(TransportError::Unreachable(peer))?;
            (peer, inbox)
        };
        inbox
            .send(packet.encode()?)
            .await
            .map_err(|_| TransportError::Unreachable(peer))
    }

    async fn close(&self) {
        let mut inner = self.net.inner.lock();
        inner.inboxes.remove(&self.pk);
    }
}

pub struct MemoryDialer {
    pk: PubKey,
    net: MemoryNetwork,
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, remote: PubKey, port: Port) -> Result<Conn, TransportError> {
        let listener = self
            .net
            .inner
            .lock()
            .listeners
            .get(&(remote, port))
            .cloned()
            .ok_or(TransportError::Unreachable(remote))?;
        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);
        listener
            .send(Conn::new(self.pk, server))
            .await
            .map_err(|_| TransportError::Unreachable(remote))?;
        Ok(Conn::new(remote, client))
    }
}

pub struct MemoryListener {
    key: (PubKey, Port),
    net: MemoryNetwork,
    rx: tokio::sync::Mutex<mpsc::Receiver<Conn>>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> Result<Conn, TransportError> {
        self.rx.lock().await.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&self) {
        self.net.inner.lock().listeners.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::RouteId;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn packets_cross_a_transport_in_order() {
        let net = MemoryNetwork::new();
        let (a, b) = (PubKey::from_bytes([1; 32]), PubKey::from_bytes([2; 32]));
        let tm_a = net.transport_manager(a);
        let tm_b = net.transport_manager(b);
        let tp = net.connect(a, b);

        for i in 0..5u8 {
            tm_a.write_packet(tp, Packet::new(RouteId(7), vec![i])).await.unwrap();
        }
        for i in 0..5u8 {
            let p = tm_b.read_packet().await.unwrap();
            assert_eq!(p, Packet::new(RouteId(7), vec![i]));
        }

        let stray = TransportId::new_random();
        assert!(matches!(
            tm_a.write_packet(stray, Packet::new(RouteId(1), vec![])).await,
            Err(TransportError::UnknownTransport(_))
        ));
    }

    #[tokio::test]
    async fn dial_reaches_listener_with_caller_identity() {
        let net = MemoryNetwork::new();
        let (a, b) = (PubKey::from_bytes([1; 32]), PubKey::from_bytes([2; 32]));
        let listener = net.listen(b, 36).unwrap();
        assert!(net.listen(b, 36).is_err());

        let mut out = net.dialer(a).dial(b, 36).await.unwrap();
        let mut inc = listener.accept().await.unwrap();
        assert_eq!(out.remote, b);
        assert_eq!(inc.remote, a);

        out.stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        inc.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        listener.close().await;
        assert!(matches!(
            net.dialer(a).dial(b, 36).await,
            Err(TransportError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn closed_manager_reports_closed() {
        let net = MemoryNetwork::new();
        let tm = net.transport_manager(PubKey::from_bytes([1; 32]));
        tm.close().await;
        assert!(matches!(tm.read_packet().await, Err(TransportError::Closed)));
    }
}
