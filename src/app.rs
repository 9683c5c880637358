// Hosted application collaborator
// The router reports route lifecycle to the process manager of the apps it
// hosts, and hands it payloads for flows that have no open route group
//
// Numan Thabit 2025 Nov

use crate::errors::AppError;
use crate::routing::{RouteDescriptor, RouteId, TransportId};
use async_trait::async_trait;

/// Descriptors passed here are seen from the local visor (`src_pk` is local).
#[async_trait]
pub trait ProcManager: Send + Sync {
    /// Deliver a payload for `desc`; `AppError::ProcNotFound` when no app owns the port.
    async fn consume_packet(&self, desc: RouteDescriptor, payload: Vec<u8>) -> Result<(), AppError>;

    /// A route group for `desc` is established; `route_id` is the id the
    /// first remote hop expects on `tp`.
    async fn confirm_loop(
        &self,
        desc: RouteDescriptor,
        tp: Option<TransportId>,
        route_id: RouteId,
    ) -> Result<(), AppError>;

    async fn confirm_close_loop(&self, desc: RouteDescriptor) -> Result<(), AppError>;
}
