// Setup wire protocol framing
// type (1 byte) | length (2 bytes BE) | JSON body
//
// Numan Thabit 2025 Nov

use crate::errors::ProtocolError;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_HEADER_SIZE: usize = 3;
pub const MAX_FRAME_BODY: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Install intermediary rules on a visor.
    AddRules = 0x00,
    DeleteRules = 0x01,
    /// Visor asks a setup node to build a route group.
    CreateLoop = 0x02,
    /// Setup node hands edge rules to the responding visor.
    ConfirmLoop = 0x03,
    /// Visor tells a setup node it closed a route group.
    CloseLoop = 0x04,
    /// Setup node tells the remote edge the route group was closed.
    LoopClosed = 0x05,
    ReserveIds = 0x06,
    RespFailure = 0xfe,
    RespSuccess = 0xff,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => PacketType::AddRules,
            0x01 => PacketType::DeleteRules,
            0x02 => PacketType::CreateLoop,
            0x03 => PacketType::ConfirmLoop,
            0x04 => PacketType::CloseLoop,
            0x05 => PacketType::LoopClosed,
            0x06 => PacketType::ReserveIds,
            0xfe => PacketType::RespFailure,
            0xff => PacketType::RespSuccess,
            other => return Err(ProtocolError::UnknownPacketType(other)),
        })
    }
}

impl PacketType {
    /// Method label used in logs and metrics.
    pub fn method(&self) -> &'static str {
        match self {
            PacketType::AddRules => "add_intermediary_rules",
            PacketType::DeleteRules => "delete_rules",
            PacketType::CreateLoop => "dial_route_group",
            PacketType::ConfirmLoop => "add_edge_rules",
            PacketType::CloseLoop => "close_loop",
            PacketType::LoopClosed => "loop_closed",
            PacketType::ReserveIds => "reserve_ids",
            PacketType::RespFailure => "failure",
            PacketType::RespSuccess => "success",
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
}

pub async fn write_frame<W>(w: &mut W, ty: PacketType, body: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if body.is_empty() {
        return Err(ProtocolError::EmptyFrame.into());
    }
    let len = u16::try_from(body.len()).map_err(|_| ProtocolError::OversizedFrame(body.len()))?;
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    buf.push(ty as u8);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(body);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` on a clean end of stream before a header.
pub async fn read_frame<R>(r: &mut R) -> Result<Option<(PacketType, Vec<u8>)>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let ty = PacketType::try_from(header[0])?;
    let len = u16::from_be_bytes([header[1], header[2]]) as usize;
    if len == 0 {
        return Err(ProtocolError::EmptyFrame.into());
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(Some((ty, body)))
}
