// Route finder client
// This file defines the path lookup seam used when dialing routes and the
// HTTP client for a remote route finder service
//
// Numan Thabit 2025 Nov

use crate::errors::RouteFinderError;
use crate::routing::{Path, PathEdges};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

pub const DEFAULT_MIN_HOPS: u16 = 0;
pub const DEFAULT_MAX_HOPS: u16 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteOptions {
    pub min_hops: u16,
    pub max_hops: u16,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            min_hops: DEFAULT_MIN_HOPS,
            max_hops: DEFAULT_MAX_HOPS,
        }
    }
}

#[async_trait]
pub trait RouteFinder: Send + Sync {
    /// Candidate paths per requested edge pair, best first.
    async fn find_routes(
        &self,
        edges: &[PathEdges],
        opts: RouteOptions,
    ) -> Result<HashMap<PathEdges, Vec<Path>>, RouteFinderError>;
}

#[derive(Debug, Serialize)]
struct FindRoutesRequest<'a> {
    edges: &'a [PathEdges],
    opts: RouteOptions,
}

#[derive(Debug, Deserialize)]
struct FoundPaths {
    edges: PathEdges,
    paths: Vec<Path>,
}

#[derive(Debug, Clone)]
pub struct HttpRouteFinder {
    http: Client,
    url: Url,
    timeout: Duration,
}

impl HttpRouteFinder {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, RouteFinderError> {
        let url = base
            .join("routes")
            .map_err(|e| RouteFinderError::Http(format!("route finder url: {e}")))?;
        Ok(Self {
            http: Client::new(),
            url,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl RouteFinder for HttpRouteFinder {
    async fn find_routes(
        &self,
        edges: &[PathEdges],
        opts: RouteOptions,
    ) -> Result<HashMap<PathEdges, Vec<Path>>, RouteFinderError> {
        let resp = self
            .http
            .post(self.url.clone())
            .timeout(self.timeout)
            .json(&FindRoutesRequest { edges, opts })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RouteFinderError::Timeout
                } else {
                    RouteFinderError::Http(format!("send: {e}"))
                }
            })?;
        if !resp.status().is_success() {
            return Err(RouteFinderError::Status(resp.status().as_u16()));
        }
        let found: Vec<FoundPaths> = resp
            .json()
            .await
            .map_err(|e| RouteFinderError::Http(format!("decode: {e}")))?;
        Ok(found.into_iter().map(|f| (f.edges, f.paths)).collect())
    }
}
