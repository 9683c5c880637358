// Setup node
// This file implements the coordinator that reserves route ids on every
// visor of a route, generates the rule set and pushes it out
//
// Numan Thabit 2025 Nov

use crate::control::AdmissionControl;
use crate::errors::{Failure, FailureCode, RpcError, SetupError, TransportError};
use crate::keys::PubKey;
use crate::metrics::SETUP_REQUESTS;
use crate::router::VisorClient;
use crate::routing::{BidirectionalRoute, EdgeRules, RouteDescriptor, Rule, RulesMap};
use crate::transport::frame::PacketType;
use crate::transport::rpc::{decode_body, encode_body, serve_conn, unsupported, RpcHandler};
use crate::transport::{Dialer, Listener};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::reservoir::{generate_rules, IdReservoir};

/// Setup request statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SetupStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_setup_time_ms: Option<f64>,
    pub success_rate: f64,
    pub closed_loops: u64,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    total_setup_us: AtomicU64,
    closed_loops: AtomicU64,
}

pub struct SetupNode {
    local_pk: PubKey,
    dialer: Arc<dyn Dialer>,
    /// Bound on every individual call to a visor.
    rpc_timeout: Duration,
    admission: AdmissionControl,
    counters: Counters,
}

impl SetupNode {
    pub fn new(
        local_pk: PubKey,
        dialer: Arc<dyn Dialer>,
        rpc_timeout: Duration,
        admission: AdmissionControl,
    ) -> Self {
        Self {
            local_pk,
            dialer,
            rpc_timeout,
            admission,
            counters: Counters::default(),
        }
    }

    pub fn local_pk(&self) -> PubKey {
        self.local_pk
    }

    pub fn stats(&self) -> SetupStats {
        let total = self.counters.total.load(Ordering::Relaxed);
        let successful = self.counters.successful.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let total_ms = self.counters.total_setup_us.load(Ordering::Relaxed) as f64 / 1000.0;
        SetupStats {
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            avg_setup_time_ms: if successful > 0 {
                Some(total_ms / successful as f64)
            } else {
                None
            },
            success_rate: if total > 0 {
                successful as f64 / total as f64
            } else {
                0.0
            },
            closed_loops: self.counters.closed_loops.load(Ordering::Relaxed),
        }
    }

    /// Install `route` on every visor it crosses and return the initiator's
    /// edge rules. Any single remote failure fails the whole request.
    #[tracing::instrument(skip_all, fields(setup_node = %self.local_pk, desc = %route.desc))]
    pub async fn dial_route_group(&self, route: &BidirectionalRoute) -> Result<EdgeRules, SetupError> {
        route.check().map_err(SetupError::InvalidRoute)?;
        if route.desc.is_loopback() {
            return Err(SetupError::InvalidRoute(
                "loopback routes never leave the visor".into(),
            ));
        }
        let desc = route.desc;

        let mut reservoir = IdReservoir::new(&[&route.forward, &route.reverse])?;
        reservoir
            .reserve_ids(|visor, n| async move {
                let mut client = self.visor(visor).await?;
                client.reserve_ids(n).await
            })
            .await?;
        debug!(visors = reservoir.counts().len(), "route ids reserved");

        let mut rules = generate_rules(
            &[(desc, &route.forward), (desc.invert(), &route.reverse)],
            route.keep_alive,
            &mut reservoir,
        )?;
        let init = edge_rules(desc, &mut rules.forward, &mut rules.consume)?;
        let resp = edge_rules(desc.invert(), &mut rules.forward, &mut rules.consume)?;

        self.push_intermediary_rules(rules.intermediary).await?;

        let dst = desc.dst_pk;
        let confirmed = async {
            let mut client = self.visor(dst).await?;
            client.add_edge_rules(&resp).await
        }
        .await
        .map_err(|source| SetupError::AddRules { pk: dst, source })?;
        if !confirmed {
            return Err(SetupError::Rejected(dst));
        }

        info!(forward_rule = %init.forward, "route group set up");
        Ok(init)
    }

    /// Push intermediary rules to every interior visor in parallel. All calls
    /// run to completion; the last failure seen is returned.
    async fn push_intermediary_rules(&self, rules: RulesMap) -> Result<(), SetupError> {
        let pushes = rules.into_iter().map(|(visor, rules)| async move {
            let res = async {
                let mut client = self.visor(visor).await?;
                client.add_intermediary_rules(&rules).await
            }
            .await;
            match res {
                Ok(true) => Ok(()),
                Ok(false) => Err(SetupError::Rejected(visor)),
                Err(source) => Err(SetupError::AddRules { pk: visor, source }),
            }
        });
        let mut final_err = None;
        for res in join_all(pushes).await {
            if let Err(err) = res {
                warn!(error = %err, "intermediary rules push failed");
                final_err = Some(err);
            }
        }
        final_err.map_or(Ok(()), Err)
    }

    /// Relay a closed loop to the remote edge of `desc`.
    pub async fn close_loop(&self, desc: &RouteDescriptor) -> Result<bool, SetupError> {
        let dst = desc.dst_pk;
        let closed = async {
            let mut client = self.visor(dst).await?;
            client.loop_closed(desc).await
        }
        .await
        .map_err(|source| SetupError::Notify { pk: dst, source })?;
        self.counters.closed_loops.fetch_add(1, Ordering::Relaxed);
        Ok(closed)
    }

    async fn visor(&self, visor: PubKey) -> Result<VisorClient, RpcError> {
        VisorClient::dial(self.dialer.as_ref(), visor, self.rpc_timeout).await
    }

    async fn handle_create_loop(&self, remote: PubKey, route: BidirectionalRoute) -> Result<EdgeRules, Failure> {
        if remote != route.desc.src_pk {
            SETUP_REQUESTS.with_label_values(&["refused"]).inc();
            return Err(Failure::new(
                FailureCode::CreateRoutes,
                format!("visor {remote} cannot dial routes for {}", route.desc.src_pk),
            ));
        }
        let Some(_permit) = self.admission.acquire().await else {
            SETUP_REQUESTS.with_label_values(&["refused"]).inc();
            return Err(SetupError::Closed.into());
        };

        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        match self.dial_route_group(&route).await {
            Ok(edge) => {
                self.counters.successful.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .total_setup_us
                    .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
                SETUP_REQUESTS.with_label_values(&["success"]).inc();
                Ok(edge)
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                SETUP_REQUESTS.with_label_values(&[err.code().as_str()]).inc();
                warn!(desc = %route.desc, error = %err, "route setup failed");
                Err(err.into())
            }
        }
    }

    /// Accept visor connections until `shutdown` flips, one task per connection.
    pub async fn serve(self: Arc<Self>, listener: Arc<dyn Listener>, mut shutdown: watch::Receiver<bool>) {
        info!(setup_node = %self.local_pk, "setup node serving");
        let mut conns = JoinSet::new();
        loop {
            let res = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                Some(_) = conns.join_next(), if !conns.is_empty() => continue,
                res = listener.accept() => res,
            };
            let conn = match res {
                Ok(conn) => conn,
                Err(TransportError::Closed) => break,
                Err(err) => {
                    warn!(error = %err, "accept visor connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            let node = self.clone();
            conns.spawn(async move {
                let remote = conn.remote;
                if let Err(err) = serve_conn(conn, node.as_ref()).await {
                    debug!(remote = %remote, error = %err, "visor connection ended");
                }
            });
        }
        self.admission.close();
        listener.close().await;
        conns.shutdown().await;
        info!(setup_node = %self.local_pk, "setup node stopped");
    }
}

fn edge_rules(
    desc: RouteDescriptor,
    forward: &mut std::collections::HashMap<PubKey, Rule>,
    consume: &mut std::collections::HashMap<PubKey, Rule>,
) -> Result<EdgeRules, SetupError> {
    let pk = desc.src_pk;
    match (forward.remove(&pk), consume.remove(&pk)) {
        (Some(forward), Some(reverse)) => Ok(EdgeRules {
            desc,
            forward,
            reverse,
        }),
        _ => Err(SetupError::GenerateRules(format!("no edge rules for visor {pk}"))),
    }
}

#[async_trait]
impl RpcHandler for SetupNode {
    async fn handle(&self, remote: PubKey, ty: PacketType, body: &[u8]) -> Result<Vec<u8>, Failure> {
        match ty {
            PacketType::CreateLoop => {
                let route: BidirectionalRoute = decode_body(ty, body)
                    .map_err(|f| Failure::new(FailureCode::CreateRoutes, f.msg))?;
                let edge = self.handle_create_loop(remote, route).await?;
                encode_body(&edge)
            }
            PacketType::CloseLoop => {
                let desc: RouteDescriptor = decode_body(ty, body)?;
                if remote != desc.src_pk {
                    return Err(Failure::new(
                        FailureCode::Unknown,
                        format!("visor {remote} cannot close loops of {}", desc.src_pk),
                    ));
                }
                let closed = self.close_loop(&desc).await.map_err(|err| {
                    warn!(desc = %desc, error = %err, "loop close relay failed");
                    Failure::from(err)
                })?;
                encode_body(&closed)
            }
            other => Err(unsupported(other)),
        }
    }
}
