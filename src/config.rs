// Configuration management module
// This file holds the visor router settings and loads the setup node
// daemon settings from an optional config file and environment variables
//
// Numan Thabit 2025 Nov

use crate::keys::{signing_key_from_hex, PubKey};
use ed25519_dalek::SigningKey;
use crate::routefinder::{RouteOptions, DEFAULT_MAX_HOPS, DEFAULT_MIN_HOPS};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Environment variable naming an optional setup node config file.
pub const CONFIG_FILE_ENV: &str = "MESHROUTE_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Setup nodes allowed to push rules to this visor
    pub setup_nodes: Vec<PubKey>,
    pub min_hops: u16,
    pub max_hops: u16,
    /// Nominal lifetime of rules created for routes this visor dials
    pub route_keep_alive_secs: u64,
    /// Grace window during which an expired but recently used rule survives cleanup
    pub rule_keep_alive_window_secs: u64,
    pub rule_gc_interval_secs: u64,
    /// Capacity of the accepted route group queue
    pub accept_buffer: usize,
    /// Capacity of each route group's read channel
    pub read_buffer: usize,
    pub route_finder_timeout_secs: u64,
    /// Bound on a full DialRouteGroup round trip to a setup node
    pub setup_timeout_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            setup_nodes: Vec::new(),
            min_hops: DEFAULT_MIN_HOPS,
            max_hops: DEFAULT_MAX_HOPS,
            route_keep_alive_secs: 10 * 60,
            rule_keep_alive_window_secs: 10 * 60,
            rule_gc_interval_secs: 10 * 60,
            accept_buffer: 1024,
            read_buffer: 1024,
            route_finder_timeout_secs: 10,
            setup_timeout_secs: 60,
        }
    }
}

impl RouterConfig {
    pub fn route_options(&self) -> RouteOptions {
        RouteOptions {
            min_hops: self.min_hops,
            max_hops: self.max_hops,
        }
    }

    pub fn route_keep_alive(&self) -> Duration {
        Duration::from_secs(self.route_keep_alive_secs)
    }

    pub fn rule_keep_alive_window(&self) -> Duration {
        Duration::from_secs(self.rule_keep_alive_window_secs)
    }

    pub fn rule_gc_interval(&self) -> Duration {
        Duration::from_secs(self.rule_gc_interval_secs)
    }

    pub fn route_finder_timeout(&self) -> Duration {
        Duration::from_secs(self.route_finder_timeout_secs)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetupNodeConfig {
    /// Hex-encoded 32-byte Ed25519 seed; the node's public key is derived from it
    pub secret_key_hex: String,
    /// TCP address the setup RPC listener binds to
    pub listen_addr: SocketAddr,
    /// Admin HTTP API address (disabled when absent)
    pub api_addr: Option<SocketAddr>,
    /// Visor directory: hex public key -> setup RPC address
    #[serde(default)]
    pub visors: HashMap<PubKey, SocketAddr>,
    /// Concurrency control
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    pub rate_per_sec: Option<u32>,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
}

fn default_max_inflight() -> usize {
    64
}

fn default_rpc_timeout_secs() -> u64 {
    10
}

impl SetupNodeConfig {
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path));
        }
        let cfg = builder
            .add_source(config::Environment::with_prefix("SETUP").separator("__"))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn signing_key(&self) -> Result<SigningKey> {
        signing_key_from_hex(&self.secret_key_hex).context("invalid setup node secret key")
    }

    pub fn public_key(&self) -> Result<PubKey> {
        self.signing_key().map(|sk| PubKey::from(&sk))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}
