// Routing rules and their binary encoding
// This file defines the three rule variants installed on visors along a route
// and the compact tagged encoding used to carry them over the setup RPC
//
// Numan Thabit 2025 Nov

use crate::errors::TableError;
use crate::keys::{PubKey, PUBKEY_LEN};
use crate::routing::types::{Port, RouteDescriptor, RouteId, TransportId};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// keep_alive(8) | type(1) | key(4)
pub const RULE_HEADER_SIZE: usize = 8 + 1 + 4;
const DESC_SIZE: usize = 2 * PUBKEY_LEN + 2 + 2;
const NEXT_SIZE: usize = 4 + 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RuleType {
    Consume = 0,
    Forward = 1,
    IntermediaryForward = 2,
}

impl RuleType {
    fn body_size(&self) -> usize {
        match self {
            RuleType::Consume => DESC_SIZE,
            RuleType::Forward => DESC_SIZE + NEXT_SIZE,
            RuleType::IntermediaryForward => NEXT_SIZE,
        }
    }
}

impl TryFrom<u8> for RuleType {
    type Error = TableError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RuleType::Consume),
            1 => Ok(RuleType::Forward),
            2 => Ok(RuleType::IntermediaryForward),
            other => Err(TableError::CorruptedRule(format!("unknown rule type {other}"))),
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuleType::Consume => "consume",
            RuleType::Forward => "forward",
            RuleType::IntermediaryForward => "intermediary_forward",
        };
        f.write_str(name)
    }
}

/// A per-visor instruction keyed by the route id packets arrive under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    /// Last visor of a path: hand the payload to the local application.
    Consume {
        keep_alive: Duration,
        key: RouteId,
        desc: RouteDescriptor,
    },
    /// First visor of a path: entry point of a flow into the network.
    Forward {
        keep_alive: Duration,
        key: RouteId,
        desc: RouteDescriptor,
        next_id: RouteId,
        next_tp: TransportId,
    },
    /// Interior visor: pure relay.
    IntermediaryForward {
        keep_alive: Duration,
        key: RouteId,
        next_id: RouteId,
        next_tp: TransportId,
    },
}

impl Rule {
    pub fn consume(keep_alive: Duration, key: RouteId, desc: RouteDescriptor) -> Self {
        Rule::Consume {
            keep_alive,
            key,
            desc,
        }
    }

    pub fn forward(
        keep_alive: Duration,
        key: RouteId,
        next_id: RouteId,
        next_tp: TransportId,
        desc: RouteDescriptor,
    ) -> Self {
        Rule::Forward {
            keep_alive,
            key,
            desc,
            next_id,
            next_tp,
        }
    }

    pub fn intermediary_forward(
        keep_alive: Duration,
        key: RouteId,
        next_id: RouteId,
        next_tp: TransportId,
    ) -> Self {
        Rule::IntermediaryForward {
            keep_alive,
            key,
            next_id,
            next_tp,
        }
    }

    pub fn rule_type(&self) -> RuleType {
        match self {
            Rule::Consume { .. } => RuleType::Consume,
            Rule::Forward { .. } => RuleType::Forward,
            Rule::IntermediaryForward { .. } => RuleType::IntermediaryForward,
        }
    }

    pub fn key(&self) -> RouteId {
        match self {
            Rule::Consume { key, .. }
            | Rule::Forward { key, .. }
            | Rule::IntermediaryForward { key, .. } => *key,
        }
    }

    pub fn keep_alive(&self) -> Duration {
        match self {
            Rule::Consume { keep_alive, .. }
            | Rule::Forward { keep_alive, .. }
            | Rule::IntermediaryForward { keep_alive, .. } => *keep_alive,
        }
    }

    pub fn descriptor(&self) -> Option<&RouteDescriptor> {
        match self {
            Rule::Consume { desc, .. } | Rule::Forward { desc, .. } => Some(desc),
            Rule::IntermediaryForward { .. } => None,
        }
    }

    pub fn next_id(&self) -> Option<RouteId> {
        match self {
            Rule::Forward { next_id, .. } | Rule::IntermediaryForward { next_id, .. } => {
                Some(*next_id)
            }
            Rule::Consume { .. } => None,
        }
    }

    pub fn next_tp(&self) -> Option<TransportId> {
        match self {
            Rule::Forward { next_tp, .. } | Rule::IntermediaryForward { next_tp, .. } => {
                Some(*next_tp)
            }
            Rule::Consume { .. } => None,
        }
    }

    pub fn with_key(mut self, id: RouteId) -> Self {
        match &mut self {
            Rule::Consume { key, .. }
            | Rule::Forward { key, .. }
            | Rule::IntermediaryForward { key, .. } => *key = id,
        }
        self
    }

    /// Points a forwarding rule at a route id that was unknown at install time.
    /// Consume rules are returned unchanged.
    pub fn with_next_id(mut self, id: RouteId) -> Self {
        match &mut self {
            Rule::Forward { next_id, .. } | Rule::IntermediaryForward { next_id, .. } => {
                *next_id = id
            }
            Rule::Consume { .. } => {}
        }
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let ty = self.rule_type();
        let mut buf = Vec::with_capacity(RULE_HEADER_SIZE + ty.body_size());
        let nanos = u64::try_from(self.keep_alive().as_nanos()).unwrap_or(u64::MAX);
        buf.extend_from_slice(&nanos.to_be_bytes());
        buf.push(ty as u8);
        buf.extend_from_slice(&self.key().0.to_be_bytes());

        match self {
            Rule::Consume { desc, .. } => put_desc(&mut buf, desc),
            Rule::Forward {
                desc,
                next_id,
                next_tp,
                ..
            } => {
                put_desc(&mut buf, desc);
                put_next(&mut buf, *next_id, next_tp);
            }
            Rule::IntermediaryForward {
                next_id, next_tp, ..
            } => put_next(&mut buf, *next_id, next_tp),
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TableError> {
        if buf.len() < RULE_HEADER_SIZE {
            return Err(TableError::CorruptedRule(format!(
                "rule is {} bytes, header needs {RULE_HEADER_SIZE}",
                buf.len()
            )));
        }
        let keep_alive = Duration::from_nanos(u64::from_be_bytes(read_array(buf, 0)));
        let ty = RuleType::try_from(buf[8])?;
        let key = RouteId(u32::from_be_bytes(read_array(buf, 9)));

        let body = &buf[RULE_HEADER_SIZE..];
        if body.len() != ty.body_size() {
            return Err(TableError::CorruptedRule(format!(
                "{ty} rule body is {} bytes, expected {}",
                body.len(),
                ty.body_size()
            )));
        }

        Ok(match ty {
            RuleType::Consume => Rule::consume(keep_alive, key, get_desc(body)),
            RuleType::Forward => {
                let (next_id, next_tp) = get_next(&body[DESC_SIZE..]);
                Rule::forward(keep_alive, key, next_id, next_tp, get_desc(body))
            }
            RuleType::IntermediaryForward => {
                let (next_id, next_tp) = get_next(body);
                Rule::intermediary_forward(keep_alive, key, next_id, next_tp)
            }
        })
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.rule_type(), self.key())?;
        if let (Some(next), Some(tp)) = (self.next_id(), self.next_tp()) {
            write!(f, " -> {next} via {tp}")?;
        }
        Ok(())
    }
}

fn put_desc(buf: &mut Vec<u8>, desc: &RouteDescriptor) {
    buf.extend_from_slice(desc.src_pk.as_bytes());
    buf.extend_from_slice(desc.dst_pk.as_bytes());
    buf.extend_from_slice(&desc.src_port.to_be_bytes());
    buf.extend_from_slice(&desc.dst_port.to_be_bytes());
}

fn put_next(buf: &mut Vec<u8>, next_id: RouteId, next_tp: &TransportId) {
    buf.extend_from_slice(&next_id.0.to_be_bytes());
    buf.extend_from_slice(next_tp.as_bytes());
}

// Callers check lengths before slicing.
fn read_array<const N: usize>(buf: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[at..at + N]);
    out
}

fn get_desc(body: &[u8]) -> RouteDescriptor {
    RouteDescriptor {
        src_pk: PubKey::from_bytes(read_array(body, 0)),
        dst_pk: PubKey::from_bytes(read_array(body, PUBKEY_LEN)),
        src_port: Port::from_be_bytes(read_array(body, 2 * PUBKEY_LEN)),
        dst_port: Port::from_be_bytes(read_array(body, 2 * PUBKEY_LEN + 2)),
    }
}

fn get_next(body: &[u8]) -> (RouteId, TransportId) {
    (
        RouteId(u32::from_be_bytes(read_array(body, 0))),
        TransportId::from_bytes(read_array(body, 4)),
    )
}

impl Serialize for Rule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&B64.encode(self.encode()))
    }
}

impl<'de> Deserialize<'de> for Rule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = B64.decode(s.as_bytes()).map_err(serde::de::Error::custom)?;
        Rule::decode(&raw).map_err(serde::de::Error::custom)
    }
}
