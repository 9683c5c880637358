// Setup node client
// Visor side of the setup node RPC surface
//
// Numan Thabit 2025 Nov

use crate::errors::RpcError;
use crate::keys::PubKey;
use crate::routing::{BidirectionalRoute, EdgeRules, RouteDescriptor};
use crate::transport::frame::PacketType;
use crate::transport::rpc::RpcClient;
use crate::transport::{Dialer, SETUP_PORT};
use std::time::Duration;

pub struct SetupClient {
    rpc: RpcClient,
}

impl SetupClient {
    pub async fn dial(dialer: &dyn Dialer, setup_node: PubKey, timeout: Duration) -> Result<Self, RpcError> {
        Ok(Self {
            rpc: RpcClient::dial(dialer, setup_node, SETUP_PORT, timeout).await?,
        })
    }

    pub fn remote(&self) -> PubKey {
        self.rpc.remote()
    }

    /// Ask the setup node to install `route`; returns the caller's own edge rules.
    pub async fn dial_route_group(&mut self, route: &BidirectionalRoute) -> Result<EdgeRules, RpcError> {
        self.rpc.call(PacketType::CreateLoop, route).await
    }

    /// Report a closed loop so the remote edge can tear down its group.
    pub async fn close_loop(&mut self, desc: &RouteDescriptor) -> Result<bool, RpcError> {
        self.rpc.call(PacketType::CloseLoop, desc).await
    }
}
