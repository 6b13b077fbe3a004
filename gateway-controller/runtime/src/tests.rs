use crate::{
    core::{plan::plan, DeployRequest, DeployStyle, PartitionAction},
    deploy::{DeployMetrics, DeployPipeline},
    index::{NodeFabricCache, SharedCache, SharedNodes, TopologyCache},
    k8s::{
        gateway::{
            AllowedRoutes, BackendRef, FromNamespaces, Gateway, GatewayAddress, GatewayClass,
            GatewayClassSpec, GatewaySpec, HttpRoute, HttpRouteRule, HttpRouteSpec, Listener,
            ParentReference, RouteNamespaces,
        },
        watcher, EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Namespace, Node,
        NodeAddress, NodeCondition, NodeStatus, ObjectMeta, Service,
    },
    render::SnapshotBuilder,
    watch::{impact_of, Deploys, NodeWatch, SyncGate, Watch, Watched},
};
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::{collections::BTreeSet, sync::Arc};
use tokio::{sync::mpsc, time::Duration};

const CONTROLLER: &str = "f5.io/gateway-controller-name";
const OTHER_CONTROLLER: &str = "example.com/other";
const SERVICES: &str = "cis-c-tenant";

#[test]
fn moved_routes_impact_both_classes() {
    let cache = mk_synced_cache();
    cache.set(mk_class("gc-0", CONTROLLER));
    cache.set(mk_class("gc-1", CONTROLLER));
    cache.set(mk_gateway("ns-0", "gw-0", "gc-0", "192.0.2.10"));
    cache.set(mk_gateway("ns-0", "gw-1", "gc-1", "192.0.2.11"));

    let prior = mk_route("ns-0", "r-0", "gw-0", "svc-a");
    let current = mk_route("ns-0", "r-0", "gw-1", "svc-a");
    let impact = impact_of(
        &cache.read(),
        CONTROLLER,
        &[(Some(&prior), Some(&current))],
    )
    .unwrap();
    assert_eq!(
        impact.classes,
        BTreeSet::from(["gc-0".to_string(), "gc-1".to_string()])
    );
    assert!(impact.actions.is_empty());
}

#[test]
fn unowned_classes_are_not_impacted() {
    let cache = mk_synced_cache();
    cache.set(mk_class("gc-x", OTHER_CONTROLLER));
    cache.set(mk_gateway("ns-0", "gw-x", "gc-x", "192.0.2.12"));

    let route = mk_route("ns-0", "r-0", "gw-x", "svc-a");
    let impact = impact_of(&cache.read(), CONTROLLER, &[(None, Some(&route))]).unwrap();
    assert!(impact.is_empty(), "{impact:?}");
}

#[rstest]
#[case(None, Some(CONTROLLER), Some(PartitionAction::Create))]
#[case(Some(CONTROLLER), Some(CONTROLLER), Some(PartitionAction::Create))]
#[case(Some(CONTROLLER), None, Some(PartitionAction::Delete))]
#[case(Some(CONTROLLER), Some(OTHER_CONTROLLER), Some(PartitionAction::Delete))]
#[case(Some(OTHER_CONTROLLER), Some(CONTROLLER), Some(PartitionAction::Create))]
#[case(None, Some(OTHER_CONTROLLER), None)]
#[case(Some(OTHER_CONTROLLER), None, None)]
fn class_changes_imply_partition_actions(
    #[case] prior: Option<&str>,
    #[case] current: Option<&str>,
    #[case] expected: Option<PartitionAction>,
) {
    let cache = mk_synced_cache();
    let prior = prior.map(|controller| mk_class("gc-0", controller));
    let current = current.map(|controller| mk_class("gc-0", controller));
    if let Some(prior) = prior.clone() {
        cache.set(prior);
    }

    let action = GatewayClass::action(prior.as_ref(), current.as_ref(), CONTROLLER);
    assert_eq!(action, expected.map(|action| ("gc-0".to_string(), action)));

    let impact = impact_of(
        &cache.read(),
        CONTROLLER,
        &[(prior.as_ref(), current.as_ref())],
    )
    .unwrap();
    assert_eq!(
        impact.classes.contains("gc-0"),
        expected.is_some(),
        "a class is deployed exactly when its partition is managed"
    );
}

#[test]
fn sync_gate_waits_for_every_token() {
    let cache = TopologyCache::shared(CONTROLLER);
    let gate = SyncGate::new(cache.clone());
    let first = gate.token();
    let second = gate.token();

    assert!(!first.ready());
    assert!(!second.ready(), "the gate itself has not been released");
    assert!(!cache.is_synced());

    assert!(gate.release(), "the gate was the last holder");
    assert!(cache.is_synced());
}

#[test]
fn last_token_opens_a_released_gate() {
    let cache = TopologyCache::shared(CONTROLLER);
    let gate = SyncGate::new(cache.clone());
    let token = gate.token();

    assert!(!gate.release());
    assert!(!cache.is_synced());
    assert!(token.ready());
    assert!(cache.is_synced());
}

/// A direct write racing the last token either lands before the cache is
/// marked synced or is handed back to be deployed. None is lost between the
/// two.
#[test]
fn writes_racing_the_sync_are_ordered() {
    for _ in 0..50 {
        let cache = TopologyCache::shared(CONTROLLER);
        let gate = SyncGate::new(cache.clone());
        let token = gate.token();
        let lock = token.lock();
        assert!(!gate.release());

        let writer = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                let mut handed_back = 0;
                for i in 0..100 {
                    let service = Service {
                        metadata: mk_meta(Some("ns-0"), &format!("svc-{i}")),
                        ..Default::default()
                    };
                    let written = lock.write_unsynced(service, |service| {
                        assert!(!cache.is_synced(), "wrote after the sync");
                        cache.set(service);
                    });
                    if written.is_some() {
                        handed_back += 1;
                    }
                }
                handed_back
            })
        };
        assert!(token.ready());
        let handed_back = writer.join().expect("writer must not panic");
        assert!(cache.is_synced());
        assert_eq!(cache.read().len::<Service>() + handed_back, 100);
    }
}

#[tokio::test]
async fn events_after_the_sync_are_deployed() {
    let cache = TopologyCache::shared(CONTROLLER);
    let (deploys, _nodes, mut rx) = mk_deploys(&cache);
    let gate = SyncGate::new(cache.clone());
    let mut classes = Watch::<GatewayClass>::new(deploys.clone(), gate.token());
    let mut gateways = Watch::<Gateway>::new(deploys, gate.token());
    assert!(!gate.release());

    classes.handle(watcher::Event::Init).await;
    classes.handle(watcher::Event::InitDone).await;
    gateways.handle(watcher::Event::Init).await;
    // The gateway watch has yet to list when the class arrives.
    classes
        .handle(watcher::Event::Apply(mk_class("gc-0", CONTROLLER)))
        .await;
    gateways.handle(watcher::Event::InitDone).await;
    assert!(cache.is_synced());

    let _services = rx.recv().await.unwrap();
    let initial = rx.recv().await.unwrap();
    assert_eq!(initial.partition, "gc-0");
    assert_eq!(initial.meta, "initial sync");
    assert_eq!(initial.action, Some(PartitionAction::Create));

    // Past the sync, the same watch deploys what it sees.
    classes
        .handle(watcher::Event::Delete(mk_class("gc-0", CONTROLLER)))
        .await;
    let _services = rx.recv().await.unwrap();
    let delete = rx.recv().await.unwrap();
    assert_eq!(delete.meta, "delete GatewayClass gc-0");
    assert_eq!(delete.action, Some(PartitionAction::Delete));
    assert_eq!(cache.read().len::<GatewayClass>(), 0);
}

#[tokio::test]
async fn watches_sync_then_deploy_each_event() {
    let cache = TopologyCache::shared(CONTROLLER);
    let (deploys, _nodes, mut rx) = mk_deploys(&cache);

    let gate = SyncGate::new(cache.clone());
    let mut classes = Watch::<GatewayClass>::new(deploys.clone(), gate.token());
    let mut gateways = Watch::<Gateway>::new(deploys.clone(), gate.token());
    let mut nodes = NodeWatch::new(deploys.clone(), gate.token());
    assert!(!gate.release());

    classes.handle(watcher::Event::Init).await;
    classes
        .handle(watcher::Event::InitApply(mk_class("gc-0", CONTROLLER)))
        .await;
    classes
        .handle(watcher::Event::InitApply(mk_class("gc-x", OTHER_CONTROLLER)))
        .await;
    classes.handle(watcher::Event::InitDone).await;
    nodes.handle(watcher::Event::Init).await;
    nodes.handle(watcher::Event::InitDone).await;
    assert_eq!(cache.read().len::<GatewayClass>(), 2);
    assert!(!cache.is_synced());

    // Written straight into the cache until every kind has synced.
    let gw0 = mk_gateway("ns-0", "gw-0", "gc-0", "192.0.2.10");
    gateways.handle(watcher::Event::Apply(gw0.clone())).await;
    assert!(rx.try_recv().is_err());

    gateways.handle(watcher::Event::Init).await;
    gateways.handle(watcher::Event::InitApply(gw0)).await;
    gateways.handle(watcher::Event::InitDone).await;
    assert!(cache.is_synced());

    let services = rx.recv().await.unwrap();
    assert_eq!(services.partition, SERVICES);
    assert_eq!(services.action, None);
    let class = rx.recv().await.unwrap();
    assert_eq!(class.partition, "gc-0");
    assert_eq!(class.meta, "initial sync");
    assert_eq!(class.action, Some(PartitionAction::Create));
    assert!(class.from.is_empty());
    assert!(class.to.get("", "ltm/virtual/gw.ns-0.gw-0.http").is_some());
    assert!(rx.try_recv().is_err(), "unowned classes are not deployed");

    gateways
        .handle(watcher::Event::Apply(mk_gateway(
            "ns-0",
            "gw-1",
            "gc-0",
            "192.0.2.11",
        )))
        .await;
    let _services = rx.recv().await.unwrap();
    let update = rx.recv().await.unwrap();
    assert_eq!(update.meta, "apply Gateway ns-0/gw-1");
    assert_eq!(update.from, class.to);
    assert_eq!(
        paths(&update),
        vec!["ltm/virtual/gw.ns-0.gw-1.http".to_string()]
    );

    classes
        .handle(watcher::Event::Delete(mk_class("gc-0", CONTROLLER)))
        .await;
    let _services = rx.recv().await.unwrap();
    let delete = rx.recv().await.unwrap();
    assert_eq!(delete.meta, "delete GatewayClass gc-0");
    assert_eq!(delete.action, Some(PartitionAction::Delete));
    assert!(delete.to.is_empty());
}

#[tokio::test]
async fn relists_deploy_the_difference() {
    let cache = mk_synced_cache();
    cache.set(mk_class("gc-0", CONTROLLER));
    cache.set(mk_gateway("ns-0", "gw-0", "gc-0", "192.0.2.10"));
    let (deploys, _nodes, mut rx) = mk_deploys(&cache);
    let mut gateways = Watch::<Gateway>::new(deploys, SyncGate::new(cache.clone()).token());

    gateways.handle(watcher::Event::Init).await;
    gateways
        .handle(watcher::Event::InitApply(mk_gateway(
            "ns-0",
            "gw-1",
            "gc-0",
            "192.0.2.11",
        )))
        .await;
    gateways.handle(watcher::Event::InitDone).await;

    let _services = rx.recv().await.unwrap();
    let class = rx.recv().await.unwrap();
    assert_eq!(class.meta, "relist Gateway (1 objects)");
    assert_eq!(
        paths(&class),
        vec![
            "ltm/virtual/gw.ns-0.gw-0.http".to_string(),
            "ltm/virtual/gw.ns-0.gw-1.http".to_string(),
        ]
    );
    assert_eq!(cache.read().len::<Gateway>(), 1);
}

/// Endpoints may name a node before the node has been seen. The deploy is
/// retried until the node shows up.
#[tokio::test(start_paused = true)]
async fn retryable_failures_are_redeployed() {
    let cache = mk_synced_cache();
    mk_route_topology(&cache);
    let (deploys, nodes, mut rx) = mk_deploys(&cache);
    let mut endpoints = Watch::<Endpoints>::new(deploys, SyncGate::new(cache.clone()).token());

    let watch = tokio::spawn(async move {
        endpoints
            .handle(watcher::Event::Apply(mk_endpoints(
                "ns-0", "svc-a", "10.42.0.5", "node-0",
            )))
            .await;
    });
    // Let the first attempt fail and back off.
    tokio::task::yield_now().await;
    assert!(rx.try_recv().is_err());
    assert_eq!(cache.read().len::<Endpoints>(), 1, "the mutation is kept");

    nodes.set(&mk_node("node-0", "10.250.1.17")).unwrap();
    watch.await.unwrap();

    let services = rx.recv().await.unwrap();
    assert_eq!(services.partition, SERVICES);
    assert_eq!(services.meta, "apply Endpoints ns-0/svc-a");
    assert!(services.from.is_empty(), "nothing was enqueued before");
    assert!(services.to.get("", "ltm/pool/ns-0.svc-a").is_some());
    assert_eq!(rx.recv().await.unwrap().partition, "gc-0");
}

#[tokio::test]
async fn policy_failures_are_not_retried() {
    let cache = mk_synced_cache();
    mk_route_topology(&cache);
    let (deploys, _nodes, mut rx) = mk_deploys(&cache);
    let mut gateways = Watch::<Gateway>::new(deploys, SyncGate::new(cache.clone()).token());

    let mut gateway = mk_gateway("ns-0", "gw-0", "gc-0", "192.0.2.10");
    gateway.spec.listeners[0].protocol = "TCP".to_string();
    gateways.handle(watcher::Event::Apply(gateway)).await;

    assert!(rx.try_recv().is_err());
    let cached = cache
        .read()
        .all::<Gateway>()
        .into_iter()
        .map(|gw| gw.spec.listeners[0].protocol.clone())
        .collect::<Vec<_>>();
    assert_eq!(cached, vec!["TCP".to_string()], "the cache follows the event");
}

#[tokio::test]
async fn node_events_deploy_only_the_services_partition() {
    let cache = mk_synced_cache();
    mk_route_topology(&cache);
    cache.set(mk_endpoints("ns-0", "svc-a", "10.42.0.5", "node-0"));
    let (deploys, nodes, mut rx) = mk_deploys(&cache);
    nodes.set(&mk_node("node-0", "10.250.1.17")).unwrap();
    let mut watch = NodeWatch::new(deploys, SyncGate::new(cache.clone()).token());

    // The node's overlay address changes.
    watch
        .handle(watcher::Event::Apply(mk_node("node-0", "10.250.1.18")))
        .await;

    let services = rx.recv().await.unwrap();
    assert_eq!(services.partition, SERVICES);
    assert_eq!(services.meta, "apply Node node-0");
    assert!(!services.is_noop());
    assert!(rx.try_recv().is_err(), "no class is impacted");
}

fn mk_deploys(cache: &SharedCache) -> (Deploys, SharedNodes, mpsc::Receiver<DeployRequest>) {
    let nodes = NodeFabricCache::shared();
    let builder = SnapshotBuilder::new(cache.clone(), nodes.clone(), DeployStyle::Rest, SERVICES);
    let (pipeline, rx) = DeployPipeline::new(builder, 16, false, DeployMetrics::default());
    let deploys = Deploys::new(Arc::new(pipeline), Duration::from_millis(100));
    (deploys, nodes, rx)
}

fn mk_synced_cache() -> SharedCache {
    let cache = TopologyCache::shared(CONTROLLER);
    cache.mark_synced();
    cache
}

/// Class `gc-0` with gateway `gw-0` and route `r-0` to service `svc-a`, all
/// in namespace `ns-0`.
fn mk_route_topology(cache: &SharedCache) {
    cache.set(mk_class("gc-0", CONTROLLER));
    cache.set(Namespace {
        metadata: mk_meta(None, "ns-0"),
        ..Default::default()
    });
    cache.set(mk_gateway("ns-0", "gw-0", "gc-0", "192.0.2.10"));
    cache.set(mk_route("ns-0", "r-0", "gw-0", "svc-a"));
    cache.set(Service {
        metadata: mk_meta(Some("ns-0"), "svc-a"),
        ..Default::default()
    });
}

fn paths(request: &DeployRequest) -> Vec<String> {
    let mut paths = plan(&request.from, &request.to)
        .iter()
        .map(|op| op.path().to_string())
        .collect::<Vec<_>>();
    paths.sort();
    paths
}

fn mk_meta(ns: Option<&str>, name: &str) -> ObjectMeta {
    ObjectMeta {
        namespace: ns.map(Into::into),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

fn mk_class(name: &str, controller: &str) -> GatewayClass {
    GatewayClass::new(
        name,
        GatewayClassSpec {
            controller_name: controller.to_string(),
            ..Default::default()
        },
    )
}

fn mk_gateway(ns: &str, name: &str, class: &str, address: &str) -> Gateway {
    let mut gateway = Gateway::new(
        name,
        GatewaySpec {
            gateway_class_name: class.to_string(),
            listeners: vec![Listener {
                name: "http".to_string(),
                port: 80,
                protocol: "HTTP".to_string(),
                allowed_routes: Some(AllowedRoutes {
                    namespaces: Some(RouteNamespaces {
                        from: Some(FromNamespaces::Same),
                        selector: None,
                    }),
                    kinds: None,
                }),
                ..Default::default()
            }],
            addresses: Some(vec![GatewayAddress {
                value: address.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        },
    );
    gateway.metadata.namespace = Some(ns.to_string());
    gateway
}

fn mk_route(ns: &str, name: &str, gateway: &str, backend: &str) -> HttpRoute {
    let mut route = HttpRoute::new(
        name,
        HttpRouteSpec {
            parent_refs: Some(vec![ParentReference {
                name: gateway.to_string(),
                section_name: Some("http".to_string()),
                ..Default::default()
            }]),
            hostnames: None,
            rules: Some(vec![HttpRouteRule {
                backend_refs: Some(vec![BackendRef {
                    name: backend.to_string(),
                    port: Some(80),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            ..Default::default()
        },
    );
    route.metadata.namespace = Some(ns.to_string());
    route
}

fn mk_endpoints(ns: &str, name: &str, ip: &str, node: &str) -> Endpoints {
    Endpoints {
        metadata: mk_meta(Some(ns), name),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: ip.to_string(),
                node_name: Some(node.to_string()),
                ..Default::default()
            }]),
            ports: Some(vec![EndpointPort {
                port: 8080,
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

/// A Cilium node, whose overlay MAC derives from its address.
fn mk_node(name: &str, ip: &str) -> Node {
    Node {
        metadata: mk_meta(None, name),
        status: Some(NodeStatus {
            addresses: Some(vec![NodeAddress {
                address: ip.to_string(),
                type_: "InternalIP".to_string(),
            }]),
            conditions: Some(vec![NodeCondition {
                reason: Some("CiliumIsUp".to_string()),
                status: "False".to_string(),
                type_: "NetworkUnavailable".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
