// Data-plane packet codec
// route_id (4 bytes BE) | payload length (2 bytes BE) | payload
//
// Numan Thabit 2025 Nov

use crate::errors::ProtocolError;
use crate::routing::RouteId;

pub const PACKET_HEADER_SIZE: usize = 4 + 2;
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub route_id: RouteId,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(route_id: RouteId, payload: Vec<u8>) -> Self {
        Self { route_id, payload }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let len = u16::try_from(self.payload.len())
            .map_err(|_| ProtocolError::OversizedFrame(self.payload.len()))?;
        let mut buf = Vec::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.route_id.0.to_be_bytes());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < PACKET_HEADER_SIZE {
            return Err(ProtocolError::MalformedPacket(format!(
                "packet of {} bytes is shorter than its header",
                buf.len()
            )));
        }
        let route_id = RouteId(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]));
        let len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        let payload = &buf[PACKET_HEADER_SIZE..];
        if payload.len() != len {
            return Err(ProtocolError::MalformedPacket(format!(
                "declared payload length {len}, got {}",
                payload.len()
            )));
        }
        Ok(Self::new(route_id, payload.to_vec()))
    }
}
