// Visor RPC gateway
// This file serves the setup node facing RPC surface of a visor and holds
// the client the setup node uses to call it
//
// Numan Thabit 2025 Nov

use crate::errors::{Failure, FailureCode, RpcError};
use crate::keys::PubKey;
use crate::routing::{EdgeRules, RouteDescriptor, RouteId, Rule};
use crate::transport::frame::PacketType;
use crate::transport::rpc::{decode_body, encode_body, unsupported, RpcClient, RpcHandler};
use crate::transport::{Dialer, SETUP_PORT};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::Router;

/// Handles requests from one trusted setup node connection.
pub struct RouterGateway {
    router: Arc<Router>,
}

impl RouterGateway {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

fn rules_failure(err: Failure) -> Failure {
    Failure::new(FailureCode::AddRules, err.msg)
}

#[async_trait]
impl RpcHandler for RouterGateway {
    async fn handle(&self, remote: PubKey, ty: PacketType, body: &[u8]) -> Result<Vec<u8>, Failure> {
        debug!(visor = %self.router.local_pk(), setup_node = %remote, method = ty.method(), "gateway request");
        match ty {
            PacketType::ReserveIds => {
                let n: u8 = decode_body(ty, body)?;
                let ids = self
                    .router
                    .routing_table()
                    .reserve_keys(n as usize)
                    .map_err(|e| Failure::new(FailureCode::ReserveRtIds, e.to_string()))?;
                encode_body(&ids)
            }
            PacketType::AddRules => {
                let rules: Vec<Rule> = decode_body(ty, body).map_err(rules_failure)?;
                self.router
                    .install_intermediary_rules(rules)
                    .map_err(|e| Failure::new(FailureCode::AddRules, e.to_string()))?;
                encode_body(&true)
            }
            PacketType::ConfirmLoop => {
                let rules: EdgeRules = decode_body(ty, body).map_err(rules_failure)?;
                self.router
                    .install_edge_rules(rules)
                    .await
                    .map_err(|e| Failure::new(FailureCode::AddRules, e.to_string()))?;
                encode_body(&true)
            }
            PacketType::DeleteRules => {
                let ids: Vec<RouteId> = decode_body(ty, body)?;
                encode_body(&self.router.routing_table().delete_rules(&ids))
            }
            PacketType::LoopClosed => {
                let desc: RouteDescriptor = decode_body(ty, body)?;
                let closed = match self.router.handle_loop_closed(desc).await {
                    Ok(()) => true,
                    Err(err) => {
                        debug!(desc = %desc, error = %err, "loop closed for unknown group");
                        false
                    }
                };
                encode_body(&closed)
            }
            other => Err(unsupported(other)),
        }
    }
}

/// Setup node side client of a visor gateway.
pub struct VisorClient {
    rpc: RpcClient,
}

impl VisorClient {
    pub async fn dial(dialer: &dyn Dialer, visor: PubKey, timeout: Duration) -> Result<Self, RpcError> {
        Ok(Self {
            rpc: RpcClient::dial(dialer, visor, SETUP_PORT, timeout).await?,
        })
    }

    pub fn visor(&self) -> PubKey {
        self.rpc.remote()
    }

    pub async fn reserve_ids(&mut self, n: u8) -> Result<Vec<RouteId>, RpcError> {
        self.rpc.call(PacketType::ReserveIds, &n).await
    }

    pub async fn add_intermediary_rules(&mut self, rules: &[Rule]) -> Result<bool, RpcError> {
        self.rpc.call(PacketType::AddRules, rules).await
    }

    pub async fn add_edge_rules(&mut self, rules: &EdgeRules) -> Result<bool, RpcError> {
        self.rpc.call(PacketType::ConfirmLoop, rules).await
    }

    pub async fn delete_rules(&mut self, ids: &[RouteId]) -> Result<Vec<RouteId>, RpcError> {
        self.rpc.call(PacketType::DeleteRules, ids).await
    }

    /// Tell the visor that the remote end of `desc` closed.
    pub async fn loop_closed(&mut self, desc: &RouteDescriptor) -> Result<bool, RpcError> {
        self.rpc.call(PacketType::LoopClosed, desc).await
    }
}
