// Visor router
// This file implements the per-visor orchestrator: dialing routes through a
// setup node, accepting routes pushed by setup nodes, the packet dispatch
// loop and the trusted setup RPC accept loop
//
// Numan Thabit 2025 Nov

use crate::app::ProcManager;
use crate::config::RouterConfig;
use crate::errors::{RouteFinderError, RouterError, TableError, TransportError};
use crate::keys::{contains_ct, PubKey};
use crate::metrics::PACKETS;
use crate::routefinder::{RouteFinder, RouteOptions};
use crate::routing::{
    BidirectionalRoute, EdgeRules, Path, PathEdges, Port, RouteDescriptor, RouteId, Rule,
    RoutingTableManager,
};
use crate::setup::SetupClient;
use crate::transport::rpc::serve_conn;
use crate::transport::{Dialer, Listener, Packet, TransportManager};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::gateway::RouterGateway;
use super::route_group::{Egress, RouteGroup};

/// Collaborators a router is wired to.
pub struct RouterDeps {
    pub transports: Arc<dyn TransportManager>,
    pub route_finder: Arc<dyn RouteFinder>,
    /// Dials setup nodes on the setup port.
    pub dialer: Arc<dyn Dialer>,
    /// Accepts setup node connections on the setup port.
    pub setup_listener: Arc<dyn Listener>,
    pub procs: Option<Arc<dyn ProcManager>>,
}

pub struct Router {
    me: Weak<Router>,
    config: RouterConfig,
    local_pk: PubKey,
    tm: Arc<dyn TransportManager>,
    route_finder: Arc<dyn RouteFinder>,
    dialer: Arc<dyn Dialer>,
    setup_listener: Arc<dyn Listener>,
    procs: Option<Arc<dyn ProcManager>>,
    rt: RoutingTableManager,
    groups: Mutex<HashMap<RouteDescriptor, RouteGroup>>,
    accept_tx: Mutex<Option<mpsc::Sender<RouteGroup>>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<RouteGroup>>,
    shutdown: watch::Sender<bool>,
    serving: RwLock<()>,
}

impl Router {
    pub fn new(config: RouterConfig, deps: RouterDeps) -> Arc<Self> {
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_buffer.max(1));
        let (shutdown, _) = watch::channel(false);
        let rt = RoutingTableManager::new(config.rule_keep_alive_window(), config.rule_gc_interval());
        let local_pk = deps.transports.local_pk();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            local_pk,
            tm: deps.transports,
            route_finder: deps.route_finder,
            dialer: deps.dialer,
            setup_listener: deps.setup_listener,
            procs: deps.procs,
            rt,
            groups: Mutex::new(HashMap::new()),
            accept_tx: Mutex::new(Some(accept_tx)),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            shutdown,
            serving: RwLock::new(()),
        })
    }

    pub fn local_pk(&self) -> PubKey {
        self.local_pk
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn routing_table(&self) -> &RoutingTableManager {
        &self.rt
    }

    /// Whether `pk` is one of the configured setup nodes.
    pub fn setup_is_trusted(&self, pk: &PubKey) -> bool {
        contains_ct(&self.config.setup_nodes, pk)
    }

    pub fn get_rule(&self, id: RouteId) -> Result<Rule, TableError> {
        self.rt.rule(id)
    }

    /// Delete every rule describing `desc`; returns the removed ids.
    pub fn remove_route_descriptor(&self, desc: &RouteDescriptor) -> Vec<RouteId> {
        self.rt.remove_route_descriptor(desc)
    }

    pub fn routing_rules(&self) -> Vec<Rule> {
        self.rt.all_rules()
    }

    pub fn route_group(&self, desc: &RouteDescriptor) -> Option<RouteGroup> {
        self.groups.lock().get(desc).cloned()
    }

    pub fn route_group_count(&self) -> usize {
        self.groups.lock().len()
    }

    /// Build a route to `remote` and return its local end.
    #[tracing::instrument(skip_all, fields(visor = %self.local_pk, remote = %remote, local_port = local_port, remote_port = remote_port))]
    pub async fn dial_routes(
        &self,
        remote: PubKey,
        local_port: Port,
        remote_port: Port,
        opts: Option<RouteOptions>,
    ) -> Result<RouteGroup, RouterError> {
        if *self.shutdown.borrow() {
            return Err(RouterError::Closed);
        }
        let desc = RouteDescriptor::new(self.local_pk, remote, local_port, remote_port);
        if desc.is_loopback() {
            return self.dial_loopback(desc).await;
        }

        let group = self.register_pending(desc)?;
        let opts = opts.unwrap_or_else(|| self.config.route_options());
        let res = match self.negotiate(desc, opts).await {
            Ok(edge) => self.establish_local(&group, edge),
            Err(err) => Err(err),
        };
        if let Err(err) = res {
            self.groups.lock().remove(&desc);
            group.mark_closed();
            warn!(error = %err, "dial routes failed");
            return Err(err);
        }

        self.confirm_loop(&group).await;
        info!(desc = %desc, "route group established");
        Ok(group)
    }

    /// Next route group a setup node established towards this visor.
    pub async fn accept_routes(&self) -> Result<RouteGroup, RouterError> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(RouterError::Closed)
    }

    /// Run the transport, setup and cleanup loops until `close`.
    pub async fn serve(&self) {
        let _serving = self.serving.read().await;
        let shutdown = self.shutdown.subscribe();
        info!(visor = %self.local_pk, "router serving");
        tokio::join!(
            self.serve_transport(shutdown.clone()),
            self.serve_setup(shutdown.clone()),
            self.serve_cleanup(shutdown),
        );
        debug!(visor = %self.local_pk, "router loops stopped");
    }

    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        self.setup_listener.close().await;
        let groups: Vec<RouteGroup> = self.groups.lock().drain().map(|(_, g)| g).collect();
        for group in &groups {
            group.mark_closed();
        }
        self.accept_tx.lock().take();
        let _idle = self.serving.write().await;
        self.tm.close().await;
        info!(visor = %self.local_pk, closed_groups = groups.len(), "router closed");
    }

    /// Refresh the last-access time of every rule `group` holds. Fails when
    /// one of them has already expired.
    pub(crate) fn record_activity(&self, group: &RouteGroup) -> Result<(), RouterError> {
        for id in group.rule_ids() {
            self.rt.rule(id)?;
        }
        Ok(())
    }

    /// Drop expired rules and close every route group that lost one.
    pub(crate) async fn cleanup_at(&self, now: Instant) -> Vec<RouteId> {
        let removed = self.rt.cleanup_at(now);
        if removed.is_empty() {
            return removed;
        }
        let gone: HashSet<RouteId> = removed.iter().copied().collect();
        let expired: Vec<RouteDescriptor> = self
            .groups
            .lock()
            .values()
            .filter(|group| group.rule_ids().iter().any(|id| gone.contains(id)))
            .map(|group| group.desc())
            .collect();
        for desc in expired {
            match self.close_route_group(desc, false).await {
                Ok(()) => info!(desc = %desc, "route group expired"),
                Err(err) => debug!(desc = %desc, error = %err, "expired route group already gone"),
            }
        }
        removed
    }

    async fn serve_cleanup(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.rt.gc_interval());
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.cleanup_at(Instant::now()).await;
                    if !removed.is_empty() {
                        info!(removed = removed.len(), remaining = self.rt.count(), "routing table cleanup");
                    }
                }
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            }
        }
    }

    async fn negotiate(&self, desc: RouteDescriptor, opts: RouteOptions) -> Result<EdgeRules, RouterError> {
        let forward_edges = PathEdges(desc.src_pk, desc.dst_pk);
        let reverse_edges = PathEdges(desc.dst_pk, desc.src_pk);
        let mut paths = tokio::time::timeout(
            self.config.route_finder_timeout(),
            self.route_finder.find_routes(&[forward_edges, reverse_edges], opts),
        )
        .await
        .map_err(|_| RouteFinderError::Timeout)??;

        let route = BidirectionalRoute {
            desc,
            keep_alive: self.config.route_keep_alive(),
            forward: first_path(&mut paths, forward_edges)?,
            reverse: first_path(&mut paths, reverse_edges)?,
        };
        route.check().map_err(RouterError::InvalidRoute)?;
        debug!(
            forward_hops = route.forward.len(),
            reverse_hops = route.reverse.len(),
            "paths found"
        );

        let mut client = self.dial_setup_node().await?;
        let edge = client.dial_route_group(&route).await?;
        if edge.desc != desc {
            return Err(RouterError::InvalidRoute(format!(
                "setup node {} returned rules for {}",
                client.remote(),
                edge.desc
            )));
        }
        Ok(edge)
    }

    async fn dial_setup_node(&self) -> Result<SetupClient, RouterError> {
        for pk in &self.config.setup_nodes {
            match SetupClient::dial(self.dialer.as_ref(), *pk, self.config.setup_timeout()).await {
                Ok(client) => return Ok(client),
                Err(err) => warn!(setup_node = %pk, error = %err, "setup node unreachable"),
            }
        }
        Err(RouterError::NoSetupNodes)
    }

    async fn dial_loopback(&self, desc: RouteDescriptor) -> Result<RouteGroup, RouterError> {
        if desc.src_port == desc.dst_port {
            return Err(RouterError::InvalidRoute(format!(
                "loopback route on a single port {}",
                desc.src_port
            )));
        }
        let accept_tx = self.accept_tx.lock().clone().ok_or(RouterError::Closed)?;
        let peer_desc = desc.invert();
        let (local, peer) = {
            let mut groups = self.groups.lock();
            for d in [desc, peer_desc] {
                if groups.contains_key(&d) {
                    return Err(RouterError::RouteGroupExists(d));
                }
            }
            let local = RouteGroup::pending(desc, self.config.read_buffer, self.me.clone());
            let peer = RouteGroup::pending(peer_desc, self.config.read_buffer, self.me.clone());
            local.establish(Egress::Loopback { peer: peer.read_sender() }, Vec::new())?;
            peer.establish(Egress::Loopback { peer: local.read_sender() }, Vec::new())?;
            groups.insert(desc, local.clone());
            groups.insert(peer_desc, peer.clone());
            (local, peer)
        };

        if accept_tx.try_send(peer.clone()).is_err() {
            let mut groups = self.groups.lock();
            groups.remove(&desc);
            groups.remove(&peer_desc);
            local.mark_closed();
            peer.mark_closed();
            return Err(RouterError::AcceptQueueFull);
        }
        self.confirm_loop(&local).await;
        self.confirm_loop(&peer).await;
        info!(desc = %desc, "loopback route group established");
        Ok(local)
    }

    fn register_pending(&self, desc: RouteDescriptor) -> Result<RouteGroup, RouterError> {
        let mut groups = self.groups.lock();
        if groups.contains_key(&desc) {
            return Err(RouterError::RouteGroupExists(desc));
        }
        let group = RouteGroup::pending(desc, self.config.read_buffer, self.me.clone());
        groups.insert(desc, group.clone());
        Ok(group)
    }

    /// Save an edge's rules and wire them into `group`; nothing is left
    /// behind on failure.
    fn establish_local(&self, group: &RouteGroup, edge: EdgeRules) -> Result<(), RouterError> {
        let keys = [edge.forward.key(), edge.reverse.key()];
        let saved = self
            .rt
            .save_rule(edge.forward.clone())
            .and_then(|_| self.rt.save_rule(edge.reverse.clone()));
        let res = saved.map_err(RouterError::from).and_then(|_| {
            group.establish(
                Egress::Remote {
                    forward: vec![edge.forward],
                    transports: self.tm.clone(),
                },
                vec![edge.reverse],
            )
        });
        if res.is_err() {
            self.rt.delete_rules(&keys);
        }
        res
    }

    async fn confirm_loop(&self, group: &RouteGroup) {
        let Some(procs) = &self.procs else {
            return;
        };
        let forward = group.forward_rules();
        let (tp, route_id) = match forward.first() {
            Some(rule) => (rule.next_tp(), rule.next_id().unwrap_or_default()),
            None => (None, RouteId::default()),
        };
        if let Err(err) = procs.confirm_loop(group.desc(), tp, route_id).await {
            warn!(desc = %group.desc(), error = %err, "app rejected loop confirmation");
        }
    }

    /// Install the edge of a route dialed by a remote visor and queue its
    /// group for `accept_routes`.
    pub(crate) async fn install_edge_rules(&self, rules: EdgeRules) -> Result<(), RouterError> {
        if rules.desc.src_pk != self.local_pk {
            return Err(RouterError::InvalidRoute(format!(
                "edge rules for {} delivered to {}",
                rules.desc, self.local_pk
            )));
        }
        let accept_tx = self.accept_tx.lock().clone().ok_or(RouterError::Closed)?;
        let desc = rules.desc;
        let group = self.register_pending(desc)?;
        let keys = [rules.forward.key(), rules.reverse.key()];
        let res = self.establish_local(&group, rules).and_then(|_| {
            accept_tx
                .try_send(group.clone())
                .map_err(|_| RouterError::AcceptQueueFull)
        });
        if let Err(err) = res {
            self.groups.lock().remove(&desc);
            group.mark_closed();
            self.rt.delete_rules(&keys);
            return Err(err);
        }
        self.confirm_loop(&group).await;
        info!(desc = %desc, "accepted route group");
        Ok(())
    }

    pub(crate) fn install_intermediary_rules(&self, rules: Vec<Rule>) -> Result<(), RouterError> {
        for rule in rules {
            debug!(rule = %rule, "saving intermediary rule");
            self.rt.save_rule(rule)?;
        }
        Ok(())
    }

    /// The remote end of `desc` closed its group; `desc` is seen from the remote.
    pub(crate) async fn handle_loop_closed(&self, desc: RouteDescriptor) -> Result<(), RouterError> {
        self.close_route_group(desc.invert(), false).await
    }

    pub(crate) async fn close_route_group(
        &self,
        desc: RouteDescriptor,
        notify_remote: bool,
    ) -> Result<(), RouterError> {
        let group = self
            .groups
            .lock()
            .remove(&desc)
            .ok_or(RouterError::RouteGroupNotFound(desc))?;
        let Some(ids) = group.mark_closed() else {
            return Ok(());
        };

        let mut closed = vec![desc];
        if desc.is_loopback() {
            let peer = self.groups.lock().remove(&desc.invert());
            if let Some(peer) = peer {
                peer.mark_closed();
                closed.push(peer.desc());
            }
        } else {
            self.rt.delete_rules(&ids);
            if notify_remote {
                if let Err(err) = self.notify_close(desc).await {
                    warn!(desc = %desc, error = %err, "failed to notify remote of closed loop");
                }
            }
        }

        if let Some(procs) = &self.procs {
            for d in closed {
                if let Err(err) = procs.confirm_close_loop(d).await {
                    warn!(desc = %d, error = %err, "app close notification failed");
                }
            }
        }
        info!(desc = %desc, rules = ids.len(), "route group closed");
        Ok(())
    }

    async fn notify_close(&self, desc: RouteDescriptor) -> Result<(), RouterError> {
        let mut client = self.dial_setup_node().await?;
        if !client.close_loop(&desc).await? {
            debug!(desc = %desc, "remote had no matching route group");
        }
        Ok(())
    }

    /// Dispatch one packet read from a transport.
    pub(crate) async fn handle_packet(&self, packet: Packet) -> Result<(), RouterError> {
        let rule = self.rt.rule(packet.route_id)?;
        match rule {
            Rule::Forward { next_id, next_tp, .. } | Rule::IntermediaryForward { next_id, next_tp, .. } => {
                self.tm
                    .write_packet(next_tp, Packet::new(next_id, packet.payload))
                    .await?;
                PACKETS.with_label_values(&["forward"]).inc();
            }
            Rule::Consume { desc, .. } => {
                let local = desc.invert();
                let group = self.route_group(&local);
                match (group, &self.procs) {
                    (Some(group), _) => {
                        self.record_activity(&group)?;
                        group.deliver(packet.payload).await?
                    }
                    (None, Some(procs)) => procs.consume_packet(local, packet.payload).await?,
                    (None, None) => return Err(RouterError::RouteGroupNotFound(local)),
                }
                PACKETS.with_label_values(&["consume"]).inc();
            }
        }
        Ok(())
    }

    async fn serve_transport(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let res = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                res = self.tm.read_packet() => res,
            };
            match res {
                Ok(packet) => {
                    let route_id = packet.route_id;
                    if let Err(err) = self.handle_packet(packet).await {
                        PACKETS.with_label_values(&["drop"]).inc();
                        warn!(route_id = %route_id, error = %err, "dropping packet");
                    }
                }
                Err(TransportError::Closed) => {
                    info!("transport manager closed");
                    break;
                }
                Err(err) => {
                    PACKETS.with_label_values(&["drop"]).inc();
                    warn!(error = %err, "failed to read packet");
                }
            }
        }
    }

    async fn serve_setup(&self, mut shutdown: watch::Receiver<bool>) {
        let mut conns = JoinSet::new();
        loop {
            let res = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                Some(_) = conns.join_next(), if !conns.is_empty() => continue,
                res = self.setup_listener.accept() => res,
            };
            let conn = match res {
                Ok(conn) => conn,
                Err(TransportError::Closed) => break,
                Err(err) => {
                    warn!(error = %err, "accept setup connection");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    continue;
                }
            };
            let remote = conn.remote;
            if !self.setup_is_trusted(&remote) {
                warn!(remote = %remote, "rejecting untrusted setup connection");
                continue;
            }
            let Some(router) = self.me.upgrade() else {
                break;
            };
            debug!(remote = %remote, "serving setup connection");
            conns.spawn(async move {
                let gateway = RouterGateway::new(router);
                if let Err(err) = serve_conn(conn, &gateway).await {
                    debug!(remote = %remote, error = %err, "setup connection ended");
                }
            });
        }
        conns.shutdown().await;
    }
}

fn first_path(paths: &mut HashMap<PathEdges, Vec<Path>>, edges: PathEdges) -> Result<Path, RouterError> {
    paths
        .remove(&edges)
        .and_then(|found| found.into_iter().next())
        .filter(|path| !path.is_empty())
        .ok_or(RouterError::RouteFinder(RouteFinderError::NoPaths(edges.0, edges.1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use crate::router::RouteGroupState;
    use crate::routing::TransportId;
    use crate::transport::Conn;
    use async_trait::async_trait;
    use std::time::Duration;

    fn pk(b: u8) -> PubKey {
        PubKey::from_bytes([b; 32])
    }

    #[derive(Default)]
    struct RecordingTransports {
        written: Mutex<Vec<(TransportId, Packet)>>,
    }

    #[async_trait]
    impl TransportManager for RecordingTransports {
        fn local_pk(&self) -> PubKey {
            pk(1)
        }
        async fn read_packet(&self) -> Result<Packet, TransportError> {
            std::future::pending().await
        }
        async fn write_packet(&self, tp: TransportId, packet: Packet) -> Result<(), TransportError> {
            self.written.lock().push((tp, packet));
            Ok(())
        }
        async fn close(&self) {}
    }

    struct NoRoutes;

    #[async_trait]
    impl RouteFinder for NoRoutes {
        async fn find_routes(
            &self,
            edges: &[PathEdges],
            _opts: RouteOptions,
        ) -> Result<HashMap<PathEdges, Vec<Path>>, RouteFinderError> {
            Err(RouteFinderError::NoPaths(edges[0].0, edges[0].1))
        }
    }

    struct Offline;

    #[async_trait]
    impl Dialer for Offline {
        async fn dial(&self, remote: PubKey, _port: Port) -> Result<Conn, TransportError> {
            Err(TransportError::Unreachable(remote))
        }
    }

    #[async_trait]
    impl Listener for Offline {
        async fn accept(&self) -> Result<Conn, TransportError> {
            Err(TransportError::Closed)
        }
        async fn close(&self) {}
    }

    #[derive(Default)]
    struct Procs {
        consumed: Mutex<Vec<(RouteDescriptor, Vec<u8>)>>,
    }

    #[async_trait]
    impl ProcManager for Procs {
        async fn consume_packet(&self, desc: RouteDescriptor, payload: Vec<u8>) -> Result<(), AppError> {
            self.consumed.lock().push((desc, payload));
            Ok(())
        }
        async fn confirm_loop(
            &self,
            _desc: RouteDescriptor,
            _tp: Option<TransportId>,
            _route_id: RouteId,
        ) -> Result<(), AppError> {
            Ok(())
        }
        async fn confirm_close_loop(&self, _desc: RouteDescriptor) -> Result<(), AppError> {
            Ok(())
        }
    }

    fn router_with(
        tm: Arc<RecordingTransports>,
        procs: Option<Arc<dyn ProcManager>>,
        config: RouterConfig,
    ) -> Arc<Router> {
        Router::new(
            config,
            RouterDeps {
                transports: tm,
                route_finder: Arc::new(NoRoutes),
                dialer: Arc::new(Offline),
                setup_listener: Arc::new(Offline),
                procs,
            },
        )
    }

    #[tokio::test]
    async fn intermediary_rule_relays_packet_once() {
        let tm = Arc::new(RecordingTransports::default());
        let router = router_with(tm.clone(), None, RouterConfig::default());
        let tp = TransportId::new_random();
        router
            .routing_table()
            .save_rule(Rule::intermediary_forward(Duration::from_secs(60), RouteId(5), RouteId(9), tp))
            .unwrap();

        router
            .handle_packet(Packet::new(RouteId(5), b"opaque".to_vec()))
            .await
            .unwrap();

        let written = tm.written.lock();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0], (tp, Packet::new(RouteId(9), b"opaque".to_vec())));
    }

    #[tokio::test]
    async fn consume_rule_delivers_in_order() {
        let tm = Arc::new(RecordingTransports::default());
        let router = router_with(tm, None, RouterConfig::default());
        let remote_view = RouteDescriptor::new(pk(2), pk(1), 20, 10);
        let local = remote_view.invert();
        let group = router.register_pending(local).unwrap();
        group
            .establish(Egress::Loopback { peer: mpsc::channel(1).0 }, Vec::new())
            .unwrap();
        router
            .routing_table()
            .save_rule(Rule::consume(Duration::from_secs(60), RouteId(5), remote_view))
            .unwrap();

        for i in 0..16u8 {
            router
                .handle_packet(Packet::new(RouteId(5), vec![i; 3]))
                .await
                .unwrap();
        }
        for i in 0..16u8 {
            assert_eq!(group.read().await, Some(vec![i; 3]));
        }
    }

    #[tokio::test]
    async fn consume_without_group_falls_back_to_app_or_fails() {
        let remote_view = RouteDescriptor::new(pk(2), pk(1), 20, 10);
        let rule = Rule::consume(Duration::from_secs(60), RouteId(7), remote_view);

        let bare = router_with(Arc::new(RecordingTransports::default()), None, RouterConfig::default());
        bare.routing_table().save_rule(rule.clone()).unwrap();
        let err = bare
            .handle_packet(Packet::new(RouteId(7), b"p".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::RouteGroupNotFound(d) if d == remote_view.invert()));

        let procs = Arc::new(Procs::default());
        let router = router_with(
            Arc::new(RecordingTransports::default()),
            Some(procs.clone()),
            RouterConfig::default(),
        );
        router.routing_table().save_rule(rule).unwrap();
        router
            .handle_packet(Packet::new(RouteId(7), b"p".to_vec()))
            .await
            .unwrap();
        assert_eq!(*procs.consumed.lock(), vec![(remote_view.invert(), b"p".to_vec())]);
    }

    #[tokio::test]
    async fn unknown_route_id_is_a_table_error() {
        let router = router_with(Arc::new(RecordingTransports::default()), None, RouterConfig::default());
        let err = router
            .handle_packet(Packet::new(RouteId(42), Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Table(TableError::UnknownRouteId(RouteId(42)))));
    }

    #[tokio::test]
    async fn trust_is_limited_to_configured_setup_nodes() {
        let config = RouterConfig {
            setup_nodes: vec![pk(8), pk(9)],
            ..RouterConfig::default()
        };
        let router = router_with(Arc::new(RecordingTransports::default()), None, config);
        assert!(router.setup_is_trusted(&pk(9)));
        assert!(!router.setup_is_trusted(&pk(2)));
    }

    #[tokio::test]
    async fn loopback_dial_skips_network() {
        let router = router_with(Arc::new(RecordingTransports::default()), None, RouterConfig::default());
        let local = router.dial_routes(pk(1), 10, 20, None).await.unwrap();
        assert_eq!(local.state(), RouteGroupState::Established);
        let peer = router.accept_routes().await.unwrap();
        assert_eq!(peer.desc(), local.desc().invert());

        local.write(b"ping").await.unwrap();
        assert_eq!(peer.read().await.as_deref(), Some(&b"ping"[..]));
        peer.write(b"pong").await.unwrap();
        assert_eq!(local.read().await.as_deref(), Some(&b"pong"[..]));

        assert!(matches!(
            router.dial_routes(pk(1), 10, 20, None).await,
            Err(RouterError::RouteGroupExists(_))
        ));
        assert!(matches!(
            router.dial_routes(pk(1), 30, 30, None).await,
            Err(RouterError::InvalidRoute(_))
        ));

        local.close().await.unwrap();
        assert_eq!(peer.state(), RouteGroupState::Closed);
        assert_eq!(router.route_group_count(), 0);
    }

    #[tokio::test]
    async fn failed_dial_leaves_no_group() {
        let router = router_with(Arc::new(RecordingTransports::default()), None, RouterConfig::default());
        let err = router.dial_routes(pk(3), 10, 20, None).await.unwrap_err();
        assert!(matches!(err, RouterError::RouteFinder(RouteFinderError::NoPaths(_, _))));
        assert_eq!(router.route_group_count(), 0);
        assert!(router.routing_rules().is_empty());
    }

    fn expiring_edge(desc: RouteDescriptor, tp: TransportId) -> EdgeRules {
        EdgeRules {
            desc,
            forward: Rule::forward(Duration::ZERO, RouteId(4), RouteId(11), tp, desc),
            reverse: Rule::consume(Duration::ZERO, RouteId(5), desc.invert()),
        }
    }

    #[tokio::test]
    async fn idle_route_group_closes_with_its_rules() {
        let tm = Arc::new(RecordingTransports::default());
        let router = router_with(tm.clone(), None, RouterConfig::default());
        let desc = RouteDescriptor::new(pk(1), pk(3), 10, 20);
        let group = router.register_pending(desc).unwrap();
        router
            .establish_local(&group, expiring_edge(desc, TransportId::new_random()))
            .unwrap();
        for _ in 0..3 {
            group.write(b"x").await.unwrap();
        }

        let window = router.config().rule_keep_alive_window();
        let mut removed = router
            .cleanup_at(Instant::now() + window + Duration::from_secs(1))
            .await;
        removed.sort();
        assert_eq!(removed, vec![RouteId(4), RouteId(5)]);
        assert_eq!(group.state(), RouteGroupState::Closed);
        assert!(router.route_group(&desc).is_none());
        assert!(router.routing_rules().is_empty());
        assert!(matches!(group.write(b"late").await, Err(RouterError::RouteGroupClosed)));
        assert_eq!(tm.written.lock().len(), 3);
    }

    #[tokio::test]
    async fn writes_keep_both_legs_of_a_group_alive() {
        let config = RouterConfig {
            rule_keep_alive_window_secs: 3,
            ..RouterConfig::default()
        };
        let router = router_with(Arc::new(RecordingTransports::default()), None, config);
        let desc = RouteDescriptor::new(pk(1), pk(3), 10, 20);
        let group = router.register_pending(desc).unwrap();
        router
            .establish_local(&group, expiring_edge(desc, TransportId::new_random()))
            .unwrap();
        let installed = Instant::now();

        tokio::time::sleep(Duration::from_secs(1)).await;
        group.write(b"one way").await.unwrap();

        // Stale since installation, fresh since the write.
        let at = installed + Duration::from_millis(3500);
        assert!(router.cleanup_at(at).await.is_empty());
        assert_eq!(group.state(), RouteGroupState::Established);
        assert_eq!(router.routing_rules().len(), 2);
    }

    #[tokio::test]
    async fn close_stops_serve_and_accept() {
        let router = router_with(Arc::new(RecordingTransports::default()), None, RouterConfig::default());
        let serving = tokio::spawn({
            let router = router.clone();
            async move { router.serve().await }
        });
        tokio::task::yield_now().await;
        router.close().await;
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(router.accept_routes().await, Err(RouterError::Closed)));
        assert!(matches!(
            router.dial_routes(pk(1), 1, 2, None).await,
            Err(RouterError::Closed)
        ));
    }
}
