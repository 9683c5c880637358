// TCP transport for setup RPC
// Connections open with a handshake in which the dialer announces its public
// key and target port, then signs a fresh challenge from the listener; peers
// are located through a static key -> address directory
//
// Numan Thabit 2025 Nov

use crate::errors::TransportError;
use crate::keys::{PubKey, PUBKEY_LEN};
use crate::routing::Port;
use crate::transport::{Conn, Dialer, Listener};
use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey};
use rand_core::{OsRng, RngCore};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

pub const PREAMBLE_SIZE: usize = PUBKEY_LEN + 2;
pub const CHALLENGE_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
const HANDSHAKE_CONTEXT: &[u8] = b"meshroute-setup-v1";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_BACKLOG: usize = 64;

/// Bytes the dialer signs: context, the listener's challenge and the port.
fn handshake_message(challenge: &[u8; CHALLENGE_LEN], port: Port) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HANDSHAKE_CONTEXT.len() + CHALLENGE_LEN + 2);
    msg.extend_from_slice(HANDSHAKE_CONTEXT);
    msg.extend_from_slice(challenge);
    msg.extend_from_slice(&port.to_be_bytes());
    msg
}

pub struct TcpDialer {
    key: SigningKey,
    local: PubKey,
    directory: HashMap<PubKey, SocketAddr>,
}

impl TcpDialer {
    pub fn new(key: SigningKey, directory: HashMap<PubKey, SocketAddr>) -> Self {
        let local = PubKey::from(&key);
        Self {
            key,
            local,
            directory,
        }
    }

    async fn handshake(&self, stream: &mut TcpStream, port: Port) -> Result<(), TransportError> {
        let mut preamble = Vec::with_capacity(PREAMBLE_SIZE);
        preamble.extend_from_slice(self.local.as_bytes());
        preamble.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&preamble).await?;

        let mut challenge = [0u8; CHALLENGE_LEN];
        stream.read_exact(&mut challenge).await?;
        let sig = self.key.sign(&handshake_message(&challenge, port));
        stream.write_all(&sig.to_bytes()).await?;
        Ok(())
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, remote: PubKey, port: Port) -> Result<Conn, TransportError> {
        let addr = self
            .directory
            .get(&remote)
            .ok_or(TransportError::Unreachable(remote))?;
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake(&mut stream, port))
            .await
            .map_err(|_| TransportError::Handshake(format!("{remote} did not answer in time")))??;
        Ok(Conn::new(remote, stream))
    }
}

/// Listener whose handshakes run off the accept path; only connections that
/// proved their key reach `accept`.
pub struct TcpSetupListener {
    local_addr: SocketAddr,
    conns: tokio::sync::Mutex<mpsc::Receiver<Conn>>,
    closed: watch::Sender<bool>,
}

impl TcpSetupListener {
    pub async fn bind(addr: SocketAddr, port: Port) -> Result<Self, TransportError> {
        let inner = TcpListener::bind(addr).await?;
        let local_addr = inner.local_addr()?;
        let (closed, _) = watch::channel(false);
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        tokio::spawn(accept_loop(inner, port, tx, closed.subscribe()));
        Ok(Self {
            local_addr,
            conns: tokio::sync::Mutex::new(rx),
            closed,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(
    listener: TcpListener,
    port: Port,
    conns: mpsc::Sender<Conn>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = async { let _ = closed.wait_for(|c| *c).await; } => break,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "tcp accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };
        let conns = conns.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_handshake(stream, port)).await {
                Ok(Ok(conn)) => {
                    debug!(remote = %conn.remote, addr = %addr, "accepted setup connection");
                    let _ = conns.send(conn).await;
                }
                Ok(Err(err)) => warn!(addr = %addr, error = %err, "dropping setup connection"),
                Err(_) => warn!(addr = %addr, "setup handshake timed out"),
            }
        });
    }
    debug!(port, "tcp setup listener stopped");
}

async fn accept_handshake(mut stream: TcpStream, port: Port) -> Result<Conn, TransportError> {
    let mut preamble = [0u8; PREAMBLE_SIZE];
    stream.read_exact(&mut preamble).await?;
    let mut pk = [0u8; PUBKEY_LEN];
    pk.copy_from_slice(&preamble[..PUBKEY_LEN]);
    let remote = PubKey::from_bytes(pk);
    let wanted = Port::from_be_bytes([preamble[PUBKEY_LEN], preamble[PUBKEY_LEN + 1]]);
    if wanted != port {
        return Err(TransportError::Handshake(format!(
            "{remote} asked for port {wanted}, serving {port}"
        )));
    }
    let verifying_key = remote
        .verifying_key()
        .map_err(|e| TransportError::Handshake(format!("{remote}: {e}")))?;

    let mut challenge = [0u8; CHALLENGE_LEN];
    OsRng.fill_bytes(&mut challenge);
    stream.write_all(&challenge).await?;

    let mut sig = [0u8; SIGNATURE_LEN];
    stream.read_exact(&mut sig).await?;
    verifying_key
        .verify_strict(&handshake_message(&challenge, port), &Signature::from_bytes(&sig))
        .map_err(|_| TransportError::Handshake(format!("{remote} failed to prove its key")))?;
    Ok(Conn::new(remote, stream))
}

#[async_trait]
impl Listener for TcpSetupListener {
    async fn accept(&self) -> Result<Conn, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }
        let mut conns = self.conns.lock().await;
        tokio::select! {
            conn = conns.recv() => conn.ok_or(TransportError::Closed),
            _ = closed.wait_for(|c| *c) => Err(TransportError::Closed),
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SETUP_PORT;

    const WAIT: Duration = Duration::from_secs(2);

    async fn listener() -> TcpSetupListener {
        TcpSetupListener::bind("127.0.0.1:0".parse().unwrap(), SETUP_PORT)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn handshake_proves_the_dialer_key() {
        let listener = listener().await;
        let a = SigningKey::from_bytes(&[1; 32]);
        let b = PubKey::from(&SigningKey::from_bytes(&[2; 32]));
        let dialer = TcpDialer::new(a.clone(), HashMap::from([(b, listener.local_addr())]));

        let (out, inc) = tokio::join!(dialer.dial(b, SETUP_PORT), listener.accept());
        assert_eq!(out.unwrap().remote, b);
        assert_eq!(inc.unwrap().remote, PubKey::from(&a));

        assert!(matches!(
            dialer.dial(PubKey::from(&a), SETUP_PORT).await,
            Err(TransportError::Unreachable(_))
        ));
        listener.close().await;
        assert!(matches!(listener.accept().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn forged_and_silent_peers_never_reach_accept() {
        let listener = listener().await;
        let addr = listener.local_addr();
        let honest = SigningKey::from_bytes(&[1; 32]);
        let victim = PubKey::from(&SigningKey::from_bytes(&[7; 32]));

        let _silent = TcpStream::connect(addr).await.unwrap();

        let mut forged = TcpStream::connect(addr).await.unwrap();
        forged.write_all(victim.as_bytes()).await.unwrap();
        forged.write_all(&SETUP_PORT.to_be_bytes()).await.unwrap();
        let mut challenge = [0u8; CHALLENGE_LEN];
        forged.read_exact(&mut challenge).await.unwrap();
        forged.write_all(&[0u8; SIGNATURE_LEN]).await.unwrap();

        let dialer = TcpDialer::new(honest.clone(), HashMap::from([(victim, addr)]));
        let (out, inc) = tokio::join!(
            dialer.dial(victim, SETUP_PORT),
            tokio::time::timeout(WAIT, listener.accept())
        );
        assert!(out.is_ok());
        assert_eq!(inc.unwrap().unwrap().remote, PubKey::from(&honest));

        // The forger is hung up on once its signature fails.
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(WAIT, forged.read(&mut buf)).await.unwrap();
        assert_eq!(read.unwrap_or(0), 0);
    }
}
