// Router module - visor data and control plane
// This file wires the visor router, its route groups and the gateway
// trusted setup nodes talk to
//
// Numan Thabit 2025 Nov

pub mod gateway;
pub mod route_group;

#[allow(clippy::module_inception)]
pub mod router;

pub use gateway::{RouterGateway, VisorClient};
pub use route_group::{RouteGroup, RouteGroupState};
pub use router::{Router, RouterDeps};
