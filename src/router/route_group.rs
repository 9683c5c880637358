// Route groups
// A route group is the live, bidirectional end of a route on one visor:
// writes leave through its forward rule, reads come from the router's
// dispatch of consume rules
//
// Numan Thabit 2025 Nov

use crate::errors::RouterError;
use crate::routing::{RouteDescriptor, RouteId, Rule};
use crate::transport::{Packet, TransportManager};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};

use super::Router;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteGroupState {
    /// Route ids requested, rules not confirmed yet.
    Pending,
    Established,
    Closed,
}

pub(crate) enum Egress {
    Remote {
        forward: Vec<Rule>,
        transports: Arc<dyn TransportManager>,
    },
    /// Both ends live on this visor; writes land in the peer's read channel.
    Loopback { peer: mpsc::Sender<Vec<u8>> },
}

struct Links {
    state: RouteGroupState,
    egress: Option<Egress>,
    reverse: Vec<Rule>,
}

struct Inner {
    desc: RouteDescriptor,
    links: Mutex<Links>,
    read_tx: mpsc::Sender<Vec<u8>>,
    read_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: watch::Sender<bool>,
    router: Weak<Router>,
}

/// Cheap handle; clones refer to the same group.
#[derive(Clone)]
pub struct RouteGroup {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RouteGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteGroup")
            .field("desc", &self.inner.desc)
            .field("state", &self.state())
            .finish()
    }
}

impl RouteGroup {
    pub(crate) fn pending(desc: RouteDescriptor, read_buffer: usize, router: Weak<Router>) -> Self {
        let (read_tx, read_rx) = mpsc::channel(read_buffer.max(1));
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                desc,
                links: Mutex::new(Links {
                    state: RouteGroupState::Pending,
                    egress: None,
                    reverse: Vec::new(),
                }),
                read_tx,
                read_rx: tokio::sync::Mutex::new(read_rx),
                closed,
                router,
            }),
        }
    }

    pub(crate) fn establish(&self, egress: Egress, reverse: Vec<Rule>) -> Result<(), RouterError> {
        let mut links = self.inner.links.lock();
        if links.state != RouteGroupState::Pending {
            return Err(RouterError::RouteGroupClosed);
        }
        links.state = RouteGroupState::Established;
        links.egress = Some(egress);
        links.reverse = reverse;
        Ok(())
    }

    pub(crate) fn read_sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.inner.read_tx.clone()
    }

    /// Descriptor seen from this visor.
    pub fn desc(&self) -> RouteDescriptor {
        self.inner.desc
    }

    pub fn state(&self) -> RouteGroupState {
        self.inner.links.lock().state
    }

    pub fn is_loopback(&self) -> bool {
        self.inner.desc.is_loopback()
    }

    pub fn forward_rules(&self) -> Vec<Rule> {
        match &self.inner.links.lock().egress {
            Some(Egress::Remote { forward, .. }) => forward.clone(),
            _ => Vec::new(),
        }
    }

    pub fn reverse_rules(&self) -> Vec<Rule> {
        self.inner.links.lock().reverse.clone()
    }

    /// Ids of the table rules this group writes and reads through.
    pub(crate) fn rule_ids(&self) -> Vec<RouteId> {
        let links = self.inner.links.lock();
        let mut ids: Vec<RouteId> = links.reverse.iter().map(|r| r.key()).collect();
        if let Some(Egress::Remote { forward, .. }) = &links.egress {
            ids.extend(forward.iter().map(|r| r.key()));
        }
        ids
    }

    /// Send one payload to the remote end. Writing counts as activity on
    /// every rule of the group.
    pub async fn write(&self, payload: &[u8]) -> Result<(), RouterError> {
        enum Target {
            Remote(Arc<dyn TransportManager>, Rule),
            Loopback(mpsc::Sender<Vec<u8>>),
        }

        let target = {
            let links = self.inner.links.lock();
            if links.state != RouteGroupState::Established {
                return Err(RouterError::RouteGroupClosed);
            }
            match &links.egress {
                Some(Egress::Remote {
                    forward,
                    transports,
                }) => {
                    let rule = forward.first().cloned().ok_or(RouterError::NoForwardRule)?;
                    Target::Remote(transports.clone(), rule)
                }
                Some(Egress::Loopback { peer }) => Target::Loopback(peer.clone()),
                None => return Err(RouterError::RouteGroupClosed),
            }
        };

        match target {
            Target::Remote(transports, rule) => {
                if let Some(router) = self.inner.router.upgrade() {
                    router.record_activity(self)?;
                }
                let (next_id, next_tp) = match (rule.next_id(), rule.next_tp()) {
                    (Some(id), Some(tp)) => (id, tp),
                    _ => return Err(RouterError::NoForwardRule),
                };
                transports
                    .write_packet(next_tp, Packet::new(next_id, payload.to_vec()))
                    .await?;
            }
            Target::Loopback(peer) => peer
                .send(payload.to_vec())
                .await
                .map_err(|_| RouterError::RouteGroupClosed)?,
        }
        Ok(())
    }

    /// Next payload in arrival order; `None` once closed and drained.
    pub async fn read(&self) -> Option<Vec<u8>> {
        let mut closed = self.inner.closed.subscribe();
        let mut rx = self.inner.read_rx.lock().await;
        tokio::select! {
            biased;
            msg = rx.recv() => msg,
            _ = closed.wait_for(|c| *c) => rx.try_recv().ok(),
        }
    }

    /// Push a payload from the dispatch loop onto the read channel.
    pub(crate) async fn deliver(&self, payload: Vec<u8>) -> Result<(), RouterError> {
        let mut closed = self.inner.closed.subscribe();
        if *closed.borrow() {
            return Err(RouterError::RouteGroupClosed);
        }
        tokio::select! {
            res = self.inner.read_tx.send(payload) => res.map_err(|_| RouterError::RouteGroupClosed),
            _ = closed.wait_for(|c| *c) => Err(RouterError::RouteGroupClosed),
        }
    }

    /// Close this group, release its rules and tell the remote end.
    pub async fn close(&self) -> Result<(), RouterError> {
        match self.inner.router.upgrade() {
            Some(router) => router.close_route_group(self.desc(), true).await,
            None => {
                self.mark_closed();
                Ok(())
            }
        }
    }

    /// Transition to `Closed`; returns the rule ids the group held, or `None`
    /// if it was already closed.
    pub(crate) fn mark_closed(&self) -> Option<Vec<RouteId>> {
        let mut links = self.inner.links.lock();
        if links.state == RouteGroupState::Closed {
            return None;
        }
        links.state = RouteGroupState::Closed;
        let mut ids: Vec<RouteId> = links.reverse.drain(..).map(|r| r.key()).collect();
        if let Some(Egress::Remote { forward, .. }) = links.egress.take() {
            ids.extend(forward.iter().map(|r| r.key()));
        }
        drop(links);
        self.inner.closed.send_replace(true);
        Some(ids)
    }
}
