// Routing data model
// This file defines route identifiers, descriptors, hops and paths, and the
// bidirectional route submitted to the setup node
//
// Numan Thabit 2025 Nov

use crate::keys::PubKey;
use crate::routing::rule::Rule;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Application port on a visor.
pub type Port = u16;

/// Route identifier, unique within one visor's routing table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteId(pub u32);

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local identifier of a transport to a neighbouring visor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportId(pub Uuid);

impl TransportId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Application-level flow endpoints, seen from the source side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteDescriptor {
    pub src_pk: PubKey,
    pub dst_pk: PubKey,
    pub src_port: Port,
    pub dst_port: Port,
}

impl RouteDescriptor {
    pub fn new(src_pk: PubKey, dst_pk: PubKey, src_port: Port, dst_port: Port) -> Self {
        Self {
            src_pk,
            dst_pk,
            src_port,
            dst_port,
        }
    }

    /// Same flow described from the other end.
    pub fn invert(&self) -> Self {
        Self {
            src_pk: self.dst_pk,
            dst_pk: self.src_pk,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.src_pk == self.dst_pk
    }
}

impl fmt::Display for RouteDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.src_pk, self.src_port, self.dst_pk, self.dst_port
        )
    }
}

/// One edge of a physical path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    pub tp_id: TransportId,
    pub from: PubKey,
    pub to: PubKey,
}

impl Hop {
    pub fn new(tp_id: TransportId, from: PubKey, to: PubKey) -> Self {
        Self { tp_id, from, to }
    }
}

/// Ordered hops; `path[0].from` is the originating visor.
pub type Path = Vec<Hop>;

/// Source and destination of a path request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathEdges(pub PubKey, pub PubKey);

/// Unit of work submitted to the setup node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidirectionalRoute {
    pub desc: RouteDescriptor,
    pub keep_alive: Duration,
    pub forward: Path,
    pub reverse: Path,
}

impl BidirectionalRoute {
    /// Validates that both paths are contiguous and connect the descriptor's edges.
    pub fn check(&self) -> Result<(), String> {
        check_path("forward", &self.forward, self.desc.src_pk, self.desc.dst_pk)?;
        check_path("reverse", &self.reverse, self.desc.dst_pk, self.desc.src_pk)
    }
}

fn check_path(name: &str, path: &[Hop], src: PubKey, dst: PubKey) -> Result<(), String> {
    let (first, last) = match (path.first(), path.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(format!("{name} path is empty")),
    };
    if first.from != src {
        return Err(format!("{name} path starts at {} instead of {src}", first.from));
    }
    if last.to != dst {
        return Err(format!("{name} path ends at {} instead of {dst}", last.to));
    }
    for pair in path.windows(2) {
        if pair[0].to != pair[1].from {
            return Err(format!(
                "{name} path is broken between {} and {}",
                pair[0].to, pair[1].from
            ));
        }
    }
    Ok(())
}

/// Rules installed on one edge of a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRules {
    pub desc: RouteDescriptor,
    pub forward: Rule,
    pub reverse: Rule,
}

/// Rules keyed by the visor that must install them.
pub type RulesMap = HashMap<PubKey, Vec<Rule>>;
