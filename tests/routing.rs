// End-to-end routing over an in-process mesh
// Three visors and a setup node wired through MemoryNetwork
//
// Numan Thabit 2025 Nov

use async_trait::async_trait;
use meshroute::app::ProcManager;
use meshroute::config::RouterConfig;
use meshroute::control::AdmissionControl;
use meshroute::errors::{AppError, Failure, FailureCode, RouteFinderError, RouterError, RpcError};
use meshroute::keys::PubKey;
use meshroute::routefinder::{RouteFinder, RouteOptions};
use meshroute::router::{RouteGroup, RouteGroupState, Router, RouterDeps, VisorClient};
use meshroute::routing::{
    BidirectionalRoute, Hop, Path, PathEdges, RouteDescriptor, RouteId, Rule, RuleType,
    TransportId,
};
use meshroute::setup::{SetupClient, SetupNode};
use meshroute::transport::frame::PacketType;
use meshroute::transport::rpc::{decode_body, encode_body, serve_conn, unsupported, RpcHandler};
use meshroute::transport::{Listener, MemoryNetwork, SETUP_PORT};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(5);

fn pk(b: u8) -> PubKey {
    PubKey::from_bytes([b; 32])
}

struct StaticRouteFinder {
    paths: HashMap<PathEdges, Vec<Path>>,
}

#[async_trait]
impl RouteFinder for StaticRouteFinder {
    async fn find_routes(
        &self,
        edges: &[PathEdges],
        _opts: RouteOptions,
    ) -> Result<HashMap<PathEdges, Vec<Path>>, RouteFinderError> {
        let mut out = HashMap::new();
        for e in edges {
            let paths = self
                .paths
                .get(e)
                .cloned()
                .ok_or(RouteFinderError::NoPaths(e.0, e.1))?;
            out.insert(*e, paths);
        }
        Ok(out)
    }
}

#[derive(Default)]
struct RecordingProcs {
    confirmed: Mutex<Vec<RouteDescriptor>>,
    closed: Mutex<Vec<RouteDescriptor>>,
}

#[async_trait]
impl ProcManager for RecordingProcs {
    async fn consume_packet(&self, desc: RouteDescriptor, _payload: Vec<u8>) -> Result<(), AppError> {
        Err(AppError::ProcNotFound(desc.src_port))
    }

    async fn confirm_loop(
        &self,
        desc: RouteDescriptor,
        _tp: Option<TransportId>,
        _route_id: RouteId,
    ) -> Result<(), AppError> {
        self.confirmed.lock().push(desc);
        Ok(())
    }

    async fn confirm_close_loop(&self, desc: RouteDescriptor) -> Result<(), AppError> {
        self.closed.lock().push(desc);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Reply {
    Accept,
    Refuse,
    Fail,
}

/// Visor gateway stand-in with canned answers to rule installs.
struct ScriptedVisor {
    next_id: AtomicU32,
    intermediary: Reply,
    edge: Reply,
    calls: Mutex<Vec<PacketType>>,
}

impl ScriptedVisor {
    fn new(intermediary: Reply, edge: Reply) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU32::new(100),
            intermediary,
            edge,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn answer(&self, reply: Reply, ty: PacketType) -> Result<Vec<u8>, Failure> {
        match reply {
            Reply::Accept => encode_body(&true),
            Reply::Refuse => encode_body(&false),
            Reply::Fail => Err(Failure::new(
                FailureCode::AddRules,
                format!("{} failed: table full", ty.method()),
            )),
        }
    }
}

#[async_trait]
impl RpcHandler for ScriptedVisor {
    async fn handle(&self, _remote: PubKey, ty: PacketType, body: &[u8]) -> Result<Vec<u8>, Failure> {
        self.calls.lock().push(ty);
        match ty {
            PacketType::ReserveIds => {
                let n: u8 = decode_body(ty, body)?;
                let ids: Vec<RouteId> = (0..n)
                    .map(|_| RouteId(self.next_id.fetch_add(1, Ordering::Relaxed)))
                    .collect();
                encode_body(&ids)
            }
            PacketType::AddRules => self.answer(self.intermediary, ty),
            PacketType::ConfirmLoop => self.answer(self.edge, ty),
            other => Err(unsupported(other)),
        }
    }
}

struct Mesh {
    net: MemoryNetwork,
    setup_pk: PubKey,
    shutdown: watch::Sender<bool>,
}

impl Mesh {
    fn new() -> Self {
        let net = MemoryNetwork::new();
        let setup_pk = pk(0xee);
        let node = Arc::new(SetupNode::new(
            setup_pk,
            Arc::new(net.dialer(setup_pk)),
            Duration::from_secs(2),
            AdmissionControl::new(8, None),
        ));
        let listener = Arc::new(net.listen(setup_pk, SETUP_PORT).unwrap());
        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(node.serve(listener, rx));
        Self {
            net,
            setup_pk,
            shutdown,
        }
    }

    fn visor(
        &self,
        visor: PubKey,
        finder: Arc<dyn RouteFinder>,
        procs: Option<Arc<dyn ProcManager>>,
    ) -> Arc<Router> {
        let config = RouterConfig {
            setup_nodes: vec![self.setup_pk],
            setup_timeout_secs: 5,
            ..RouterConfig::default()
        };
        let router = Router::new(
            config,
            RouterDeps {
                transports: Arc::new(self.net.transport_manager(visor)),
                route_finder: finder,
                dialer: Arc::new(self.net.dialer(visor)),
                setup_listener: Arc::new(self.net.listen(visor, SETUP_PORT).unwrap()),
                procs,
            },
        );
        tokio::spawn({
            let router = router.clone();
            async move { router.serve().await }
        });
        router
    }
}

impl Mesh {
    fn scripted(&self, visor: PubKey, script: Arc<ScriptedVisor>) {
        let listener = self.net.listen(visor, SETUP_PORT).unwrap();
        tokio::spawn(async move {
            while let Ok(conn) = listener.accept().await {
                let script = script.clone();
                tokio::spawn(async move {
                    let _ = serve_conn(conn, script.as_ref()).await;
                });
            }
        });
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Paths along `visors` in order and back, one transport per link.
fn line_finder(net: &MemoryNetwork, visors: &[PubKey]) -> Arc<StaticRouteFinder> {
    let links: Vec<(PubKey, PubKey, TransportId)> = visors
        .windows(2)
        .map(|w| (w[0], w[1], net.connect(w[0], w[1])))
        .collect();
    let forward: Path = links.iter().map(|(a, b, tp)| Hop::new(*tp, *a, *b)).collect();
    let reverse: Path = links.iter().rev().map(|(a, b, tp)| Hop::new(*tp, *b, *a)).collect();
    let (first, last) = (visors[0], visors[visors.len() - 1]);
    let mut paths = HashMap::new();
    paths.insert(PathEdges(first, last), vec![forward]);
    paths.insert(PathEdges(last, first), vec![reverse]);
    Arc::new(StaticRouteFinder { paths })
}

/// A -> B -> C and back, over two transports.
fn chain_finder(net: &MemoryNetwork) -> Arc<StaticRouteFinder> {
    line_finder(net, &[pk(1), pk(2), pk(3)])
}

async fn dial_failure(router: &Router, remote: PubKey) -> Failure {
    let err = tokio::time::timeout(WAIT, router.dial_routes(remote, 10, 20, None))
        .await
        .expect("dial timed out")
        .unwrap_err();
    match err {
        RouterError::Setup(RpcError::Failure(failure)) => failure,
        other => panic!("unexpected error: {other}"),
    }
}

async fn accept(router: &Router) -> RouteGroup {
    tokio::time::timeout(WAIT, router.accept_routes())
        .await
        .expect("accept timed out")
        .expect("router closed")
}

async fn read(group: &RouteGroup) -> Vec<u8> {
    tokio::time::timeout(WAIT, group.read())
        .await
        .expect("read timed out")
        .expect("group closed")
}

fn rules_of(router: &Router, ty: RuleType) -> Vec<Rule> {
    router
        .routing_rules()
        .into_iter()
        .filter(|r| r.rule_type() == ty)
        .collect()
}

#[tokio::test]
async fn route_through_intermediary_carries_payloads_both_ways() {
    let mesh = Mesh::new();
    let finder = chain_finder(&mesh.net);
    let procs_c = Arc::new(RecordingProcs::default());
    let a = mesh.visor(pk(1), finder.clone(), None);
    let b = mesh.visor(pk(2), finder.clone(), None);
    let c = mesh.visor(pk(3), finder, Some(procs_c.clone()));

    let group_a = tokio::time::timeout(WAIT, a.dial_routes(pk(3), 10, 20, None))
        .await
        .unwrap()
        .unwrap();
    let group_c = accept(&c).await;
    let desc = RouteDescriptor::new(pk(1), pk(3), 10, 20);
    assert_eq!(group_a.desc(), desc);
    assert_eq!(group_c.desc(), desc.invert());
    assert_eq!(group_a.state(), RouteGroupState::Established);
    assert_eq!(*procs_c.confirmed.lock(), vec![desc.invert()]);

    let forward = rules_of(&a, RuleType::Forward);
    assert_eq!(forward.len(), 1);
    assert_eq!(forward[0].descriptor(), Some(&desc));
    let next_id = forward[0].next_id().unwrap();
    assert_eq!(
        b.get_rule(next_id).unwrap().rule_type(),
        RuleType::IntermediaryForward
    );
    assert_eq!(rules_of(&b, RuleType::IntermediaryForward).len(), 2);

    let consume = rules_of(&c, RuleType::Consume);
    assert_eq!(consume.len(), 1);
    let consumed = consume[0].descriptor().copied().unwrap();
    assert_eq!(
        (consumed.src_pk, consumed.dst_pk, consumed.src_port, consumed.dst_port),
        (pk(1), pk(3), 10, 20)
    );

    group_a.write(b"hello over the mesh").await.unwrap();
    assert_eq!(read(&group_c).await, b"hello over the mesh");
    group_c.write(b"and back").await.unwrap();
    assert_eq!(read(&group_a).await, b"and back");

    for i in 0..50u8 {
        group_a.write(&[i; 8]).await.unwrap();
    }
    for i in 0..50u8 {
        assert_eq!(read(&group_c).await, vec![i; 8]);
    }

    group_a.close().await.unwrap();
    assert_eq!(group_a.state(), RouteGroupState::Closed);
    assert_eq!(group_c.state(), RouteGroupState::Closed);
    assert!(a.routing_rules().is_empty());
    assert!(c.routing_rules().is_empty());
    assert_eq!(*procs_c.closed.lock(), vec![desc.invert()]);
    assert!(group_a.write(b"late").await.is_err());
}

#[tokio::test]
async fn reservation_failure_names_the_visor() {
    let mesh = Mesh::new();
    let finder = chain_finder(&mesh.net);
    let a = mesh.visor(pk(1), finder.clone(), None);
    let _b = mesh.visor(pk(2), finder, None);

    let failure = dial_failure(&a, pk(3)).await;
    assert_eq!(failure.code, FailureCode::ReserveRtIds);
    assert!(failure.msg.contains(&pk(3).to_string()), "{}", failure.msg);
    assert!(a.routing_rules().is_empty());
    assert!(a.route_group(&RouteDescriptor::new(pk(1), pk(3), 10, 20)).is_none());
}

#[tokio::test]
async fn refused_intermediary_push_fails_the_dial_after_all_pushes() {
    let mesh = Mesh::new();
    let (a_pk, b_pk, d_pk, c_pk) = (pk(1), pk(2), pk(4), pk(3));
    let finder = line_finder(&mesh.net, &[a_pk, b_pk, d_pk, c_pk]);
    let a = mesh.visor(a_pk, finder.clone(), None);
    let c = mesh.visor(c_pk, finder, None);
    let b = ScriptedVisor::new(Reply::Refuse, Reply::Accept);
    let d = ScriptedVisor::new(Reply::Accept, Reply::Accept);
    mesh.scripted(b_pk, b.clone());
    mesh.scripted(d_pk, d.clone());

    let failure = dial_failure(&a, c_pk).await;
    assert_eq!(failure.code, FailureCode::RoutesCreated);
    assert!(failure.msg.contains(&b_pk.to_string()), "{}", failure.msg);

    assert!(b.calls.lock().contains(&PacketType::AddRules));
    assert!(d.calls.lock().contains(&PacketType::AddRules));
    assert!(a.routing_rules().is_empty());
    assert!(a.route_group(&RouteDescriptor::new(a_pk, c_pk, 10, 20)).is_none());
    assert!(c.routing_rules().is_empty());
    assert!(
        tokio::time::timeout(Duration::from_millis(100), c.accept_routes())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn failed_or_refused_edge_push_fails_the_dial() {
    for (edge, code) in [
        (Reply::Fail, FailureCode::AddRules),
        (Reply::Refuse, FailureCode::RoutesCreated),
    ] {
        let mesh = Mesh::new();
        let finder = chain_finder(&mesh.net);
        let a = mesh.visor(pk(1), finder, None);
        let b = ScriptedVisor::new(Reply::Accept, Reply::Accept);
        let c = ScriptedVisor::new(Reply::Accept, edge);
        mesh.scripted(pk(2), b.clone());
        mesh.scripted(pk(3), c.clone());

        let failure = dial_failure(&a, pk(3)).await;
        assert_eq!(failure.code, code, "{edge:?}: {}", failure.msg);
        assert!(failure.msg.contains(&pk(3).to_string()), "{}", failure.msg);
        assert!(b.calls.lock().contains(&PacketType::AddRules));
        assert!(c.calls.lock().contains(&PacketType::ConfirmLoop));
        assert!(a.routing_rules().is_empty());
        assert_eq!(a.route_group_count(), 0);
    }
}

#[tokio::test]
async fn gateway_serves_only_trusted_setup_nodes() {
    let mesh = Mesh::new();
    let finder = chain_finder(&mesh.net);
    let a = mesh.visor(pk(1), finder, None);

    let mut trusted = VisorClient::dial(&mesh.net.dialer(mesh.setup_pk), pk(1), WAIT)
        .await
        .unwrap();
    let ids = trusted.reserve_ids(3).await.unwrap();
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|id| id.0 != 0));
    assert_eq!(trusted.delete_rules(&ids).await.unwrap(), Vec::<RouteId>::new());

    let rogue = pk(0x66);
    assert!(!a.setup_is_trusted(&rogue));
    let mut untrusted = VisorClient::dial(&mesh.net.dialer(rogue), pk(1), WAIT)
        .await
        .unwrap();
    assert!(untrusted.reserve_ids(1).await.is_err());
    let rules = vec![Rule::intermediary_forward(
        Duration::from_secs(60),
        RouteId(77),
        RouteId(1),
        TransportId::new_random(),
    )];
    let mut again = VisorClient::dial(&mesh.net.dialer(rogue), pk(1), WAIT)
        .await
        .unwrap();
    assert!(again.add_intermediary_rules(&rules).await.is_err());
    assert!(a.routing_rules().is_empty());

    assert!(trusted.add_intermediary_rules(&rules).await.unwrap());
    assert_eq!(a.routing_rules(), rules);
}

#[tokio::test]
async fn setup_node_refuses_routes_for_other_visors() {
    let mesh = Mesh::new();
    let finder = chain_finder(&mesh.net);
    let paths = finder
        .find_routes(&[PathEdges(pk(1), pk(3)), PathEdges(pk(3), pk(1))], RouteOptions::default())
        .await
        .unwrap();
    let route = BidirectionalRoute {
        desc: RouteDescriptor::new(pk(1), pk(3), 10, 20),
        keep_alive: Duration::from_secs(60),
        forward: paths[&PathEdges(pk(1), pk(3))][0].clone(),
        reverse: paths[&PathEdges(pk(3), pk(1))][0].clone(),
    };

    let mut impostor = SetupClient::dial(&mesh.net.dialer(pk(2)), mesh.setup_pk, WAIT)
        .await
        .unwrap();
    match impostor.dial_route_group(&route).await {
        Err(RpcError::Failure(failure)) => assert_eq!(failure.code, FailureCode::CreateRoutes),
        other => panic!("unexpected result: {other:?}"),
    }

    let mut broken = route.clone();
    broken.reverse.clear();
    let mut client = SetupClient::dial(&mesh.net.dialer(pk(1)), mesh.setup_pk, WAIT)
        .await
        .unwrap();
    match client.dial_route_group(&broken).await {
        Err(RpcError::Failure(failure)) => assert_eq!(failure.code, FailureCode::CreateRoutes),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn closed_router_rejects_new_work() {
    let mesh = Mesh::new();
    let finder = chain_finder(&mesh.net);
    let a = mesh.visor(pk(1), finder, None);
    let local = a.dial_routes(pk(1), 1, 2, None).await.unwrap();
    let peer = accept(&a).await;
    assert!(local.is_loopback());

    tokio::time::timeout(WAIT, a.close()).await.unwrap();
    assert_eq!(local.state(), RouteGroupState::Closed);
    assert_eq!(peer.read().await, None);
    assert!(matches!(a.accept_routes().await, Err(RouterError::Closed)));
    assert!(matches!(
        a.dial_routes(pk(3), 10, 20, None).await,
        Err(RouterError::Closed)
    ));
}
