// Routing module - rules, routing table and its manager
// This file wires the routing data model used by both the visor router
// and the setup node
//
// Numan Thabit 2025 Nov

pub mod manager;
pub mod rule;
pub mod table;
pub mod types;

pub use manager::RoutingTableManager;
pub use rule::{Rule, RuleType};
pub use table::RoutingTable;
pub use types::{
    BidirectionalRoute, EdgeRules, Hop, Path, PathEdges, Port, RouteDescriptor, RouteId,
    RulesMap, TransportId,
};
