// Setup module - route installation control plane
// This file wires the setup node, its id reservoir and the client visors
// use to reach it
//
// Numan Thabit 2025 Nov

pub mod client;
pub mod node;
pub mod reservoir;

pub use client::SetupClient;
pub use node::{SetupNode, SetupStats};
pub use reservoir::{generate_rules, GeneratedRules, IdReservoir};
