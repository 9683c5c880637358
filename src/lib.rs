// Library root module for meshroute
// This file defines the public API and module structure for the meshroute
// library: the visor routing engine and the setup node control plane
//
// Numan Thabit 2025 Nov

pub mod api;
pub mod app;
pub mod config;
pub mod control;
pub mod errors;
pub mod keys;
pub mod metrics;
pub mod routefinder;
pub mod router;
pub mod routing;
pub mod setup;
pub mod transport;
