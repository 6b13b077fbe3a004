//! Feeds watch events into the caches.
//!
//! Until every watched kind has completed its initial listing, events are
//! written straight into the caches. Once the last listing completes the
//! topology cache is marked synced and every owned class is deployed from
//! scratch. From then on each event is applied through the deploy pipeline
//! so that the partitions it impacts are re-rendered around the mutation.
//!
//! A direct write and the sync are ordered by a [`SyncLock`]: a write either
//! lands before the cache is marked synced, and so before the initial deploy
//! reads it, or it is applied through the pipeline.

use crate::{
    core::{PartitionAction, Result},
    deploy::{DeployPipeline, Impact},
    index::{ImpactSource, ResourceId, SharedCache, SharedNodes, Topology, TopologyKind},
    k8s::{
        gateway::{Gateway, GatewayClass, HttpRoute, ReferenceGrant},
        watcher, Endpoints, Namespace, Node, ResourceExt, Secret, Service,
    },
};
use futures::prelude::*;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

/// Deploys are retried this many times while they fail with a retryable
/// error.
const MAX_RETRIES: usize = 10;

/// A topology kind that is watched and applied through the deploy pipeline.
pub(crate) trait Watched:
    TopologyKind + Clone + std::fmt::Debug + serde::de::DeserializeOwned
{
    /// The classes whose rendering may depend on `obj`.
    fn impacted(topology: &Topology, obj: &Self) -> Result<BTreeSet<String>>;

    /// The partition action implied by a change from `prior` to `current`.
    #[inline]
    fn action(
        _prior: Option<&Self>,
        _current: Option<&Self>,
        _controller_name: &str,
    ) -> Option<(String, PartitionAction)> {
        None
    }
}

/// Delivers impacts to the deploy pipeline, retrying renderings that fail
/// because the topology is not yet complete.
#[derive(Clone, Debug)]
pub(crate) struct Deploys {
    pipeline: Arc<DeployPipeline>,
    retry_delay: Duration,
}

/// Marks the topology cache synced once every watch has listed its kind.
///
/// The gate holds a sync of its own until it is released, so that tokens can
/// be handed out while watches are already running.
#[derive(Debug)]
pub(crate) struct SyncGate {
    pending: Arc<AtomicUsize>,
    lock: SyncLock,
}

#[derive(Debug)]
pub(crate) struct SyncToken {
    pending: Arc<AtomicUsize>,
    lock: SyncLock,
}

/// Serializes direct cache writes with marking the cache synced.
#[derive(Clone, Debug)]
pub(crate) struct SyncLock {
    writes: Arc<Mutex<()>>,
    cache: SharedCache,
}

/// Watches one topology kind.
#[derive(Debug)]
pub(crate) struct Watch<K> {
    deploys: Deploys,
    sync: Option<SyncToken>,
    presync: SyncLock,
    /// Objects listed since the last `Init` event.
    init: Vec<K>,
}

/// Watches nodes. Node changes only impact the services partition.
#[derive(Debug)]
pub(crate) struct NodeWatch {
    deploys: Deploys,
    sync: Option<SyncToken>,
    presync: SyncLock,
    init: Vec<Node>,
}

// === impl Watched ===

impl Watched for GatewayClass {
    fn impacted(topology: &Topology, obj: &Self) -> Result<BTreeSet<String>> {
        topology.impacted_classes(ImpactSource::GatewayClass(&obj.name_any()))
    }

    /// Creates the partition whenever an owned class is applied, and removes
    /// it when the class is deleted or handed to another controller.
    fn action(
        prior: Option<&Self>,
        current: Option<&Self>,
        controller_name: &str,
    ) -> Option<(String, PartitionAction)> {
        let owned = |gc: Option<_>| gc.filter(|gc: &&Self| gc.spec.controller_name == controller_name);
        match (owned(prior), owned(current)) {
            (_, Some(gc)) => Some((gc.name_any(), PartitionAction::Create)),
            (Some(gc), None) => Some((gc.name_any(), PartitionAction::Delete)),
            (None, None) => None,
        }
    }
}

impl Watched for Gateway {
    fn impacted(topology: &Topology, obj: &Self) -> Result<BTreeSet<String>> {
        topology.impacted_classes(ImpactSource::Gateway(obj))
    }
}

impl Watched for HttpRoute {
    fn impacted(topology: &Topology, obj: &Self) -> Result<BTreeSet<String>> {
        topology.impacted_classes(ImpactSource::HttpRoute(obj))
    }
}

impl Watched for ReferenceGrant {
    fn impacted(topology: &Topology, obj: &Self) -> Result<BTreeSet<String>> {
        topology.impacted_classes(ImpactSource::ReferenceGrant(obj))
    }
}

impl Watched for Namespace {
    fn impacted(topology: &Topology, obj: &Self) -> Result<BTreeSet<String>> {
        topology.impacted_classes(ImpactSource::Namespace(&obj.name_any()))
    }
}

impl Watched for Secret {
    fn impacted(topology: &Topology, obj: &Self) -> Result<BTreeSet<String>> {
        match ResourceId::of(obj) {
            Some(id) => topology.impacted_classes(ImpactSource::Secret(&id)),
            None => Ok(BTreeSet::new()),
        }
    }
}

impl Watched for Service {
    fn impacted(topology: &Topology, obj: &Self) -> Result<BTreeSet<String>> {
        match ResourceId::of(obj) {
            Some(id) => topology.impacted_classes(ImpactSource::Services(&[id])),
            None => Ok(BTreeSet::new()),
        }
    }
}

impl Watched for Endpoints {
    fn impacted(topology: &Topology, obj: &Self) -> Result<BTreeSet<String>> {
        match ResourceId::of(obj) {
            Some(id) => topology.impacted_classes(ImpactSource::Services(&[id])),
            None => Ok(BTreeSet::new()),
        }
    }
}

/// Computes the impact of a set of changes against the cached state.
///
/// Both sides of every change are evaluated, so a route moving between
/// gateways impacts the classes of both. Classes not owned by this
/// controller are dropped unless the change hands them to or from it.
pub(crate) fn impact_of<K: Watched>(
    topology: &Topology,
    controller_name: &str,
    changes: &[(Option<&K>, Option<&K>)],
) -> Result<Impact> {
    let owned = topology
        .owned_classes(controller_name)
        .iter()
        .map(|gc| gc.name_any())
        .collect::<BTreeSet<_>>();

    let mut impact = Impact::default();
    for (prior, current) in changes {
        if let Some((class, action)) = K::action(*prior, *current, controller_name) {
            impact.actions.insert(class, action);
        }
        for obj in prior.iter().chain(current.iter()) {
            impact.classes.extend(K::impacted(topology, obj)?);
        }
    }
    let actions = &impact.actions;
    impact
        .classes
        .retain(|class| owned.contains(class) || actions.contains_key(class));
    Ok(impact)
}

// === impl Deploys ===

impl Deploys {
    pub(crate) fn new(pipeline: Arc<DeployPipeline>, retry_delay: Duration) -> Self {
        Self {
            pipeline,
            retry_delay,
        }
    }

    fn cache(&self) -> &SharedCache {
        self.pipeline.builder().cache()
    }

    fn nodes(&self) -> &SharedNodes {
        self.pipeline.builder().nodes()
    }

    /// Applies `mutate` through the pipeline. When the impact could not be
    /// computed the mutation is applied without deploying.
    async fn apply(&self, impact: Result<Impact>, meta: String, mutate: impl FnOnce()) {
        let impact = impact.unwrap_or_else(|error| {
            warn!(%meta, %error, "Failed to compute impacted classes");
            Impact::default()
        });
        let result = self
            .pipeline
            .deploy_for_event(&impact, || {
                mutate();
                meta.clone()
            })
            .await;
        self.settle(&impact, &meta, result).await
    }

    /// Deploys every owned class, and the services partition, from empty
    /// partitions.
    pub(crate) async fn initial(&self) {
        let impact = {
            let topology = self.cache().read();
            let mut impact = Impact::services();
            for gc in topology.owned_classes(self.cache().controller_name()) {
                let class = gc.name_any();
                impact.actions.insert(class.clone(), PartitionAction::Create);
                impact.classes.insert(class);
            }
            impact
        };
        info!(classes = impact.classes.len(), "Deploying synced topology");
        let meta = "initial sync".to_string();
        let result = self.pipeline.redeploy(&impact, meta.clone()).await;
        self.settle(&impact, &meta, result).await
    }

    async fn settle(&self, impact: &Impact, meta: &str, mut result: Result<()>) {
        let mut retries = 0;
        loop {
            match result {
                Ok(()) => return,
                Err(error) if error.is_retryable() && retries < MAX_RETRIES => {
                    retries += 1;
                    debug!(%meta, %error, retries, "Retrying deploy");
                    time::sleep(self.retry_delay).await;
                    result = self.pipeline.redeploy(impact, meta).await;
                }
                Err(error) => {
                    error!(%meta, %error, kind = ?error.kind(), "Failed to deploy");
                    return;
                }
            }
        }
    }
}

// === impl SyncGate ===

impl SyncGate {
    pub(crate) fn new(cache: SharedCache) -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(1)),
            lock: SyncLock {
                writes: Arc::new(Mutex::new(())),
                cache,
            },
        }
    }

    pub(crate) fn token(&self) -> SyncToken {
        self.pending.fetch_add(1, Ordering::AcqRel);
        SyncToken {
            pending: self.pending.clone(),
            lock: self.lock.clone(),
        }
    }

    /// Gives up the gate's own hold. Returns true if every token was already
    /// ready, in which case the caller owns the initial deploy.
    pub(crate) fn release(self) -> bool {
        SyncToken {
            pending: self.pending,
            lock: self.lock,
        }
        .ready()
    }
}

// === impl SyncToken ===

impl SyncToken {
    pub(crate) fn lock(&self) -> SyncLock {
        self.lock.clone()
    }

    /// Returns true for the last token to become ready.
    pub(crate) fn ready(self) -> bool {
        let _writes = self.lock.writes.lock();
        if self.pending.fetch_sub(1, Ordering::AcqRel) != 1 {
            return false;
        }
        self.lock.cache.mark_synced();
        info!("Initial sync complete");
        true
    }
}

// === impl SyncLock ===

impl SyncLock {
    /// Writes `value` directly while the cache has not synced. Once it has,
    /// nothing is written and the value is handed back to be deployed.
    pub(crate) fn write_unsynced<T>(&self, value: T, write: impl FnOnce(T)) -> Option<T> {
        let _writes = self.writes.lock();
        if self.cache.is_synced() {
            return Some(value);
        }
        write(value);
        None
    }
}

// === impl Watch ===

impl<K: Watched> Watch<K> {
    pub(crate) fn new(deploys: Deploys, sync: SyncToken) -> Self {
        Self {
            deploys,
            presync: sync.lock(),
            sync: Some(sync),
            init: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self, events: impl Stream<Item = watcher::Event<K>>) {
        tokio::pin!(events);
        while let Some(event) = events.next().await {
            self.handle(event).await;
        }
        debug!("Watch ended");
    }

    pub(crate) async fn handle(&mut self, event: watcher::Event<K>) {
        let cache = self.deploys.cache().clone();
        match event {
            watcher::Event::Init => self.init.clear(),
            watcher::Event::InitApply(obj) => self.init.push(obj),
            watcher::Event::InitDone => {
                let objs = std::mem::take(&mut self.init);
                if let Some(objs) = self.presync.write_unsynced(objs, |objs| cache.reset(objs)) {
                    self.relist(objs).await;
                }
                if let Some(sync) = self.sync.take() {
                    if sync.ready() {
                        self.deploys.initial().await;
                    }
                }
            }
            watcher::Event::Apply(obj) => {
                if let Some(obj) = self.presync.write_unsynced(obj, |obj| cache.set(obj)) {
                    self.apply(obj).await;
                }
            }
            watcher::Event::Delete(obj) => {
                let unset = |obj: K| {
                    if let Some(id) = ResourceId::of(&obj) {
                        cache.unset::<K>(&id);
                    }
                };
                if let Some(obj) = self.presync.write_unsynced(obj, unset) {
                    self.delete(obj).await;
                }
            }
        }
    }

    async fn apply(&self, obj: K) {
        let Some(id) = ResourceId::of(&obj) else {
            return;
        };
        let cache = self.deploys.cache().clone();
        let impact = {
            let topology = cache.read();
            let prior = topology.get::<K>(&id);
            impact_of(
                &topology,
                cache.controller_name(),
                &[(prior.as_deref(), Some(&obj))],
            )
        };
        let meta = format!("apply {} {id}", K::kind(&()));
        self.deploys
            .apply(impact, meta, || cache.set(obj))
            .await
    }

    async fn delete(&self, obj: K) {
        let Some(id) = ResourceId::of(&obj) else {
            return;
        };
        let cache = self.deploys.cache().clone();
        let impact = {
            let topology = cache.read();
            // Prefer the cached object; the delete may carry a stale copy.
            let prior = topology.get::<K>(&id);
            let prior = prior.as_deref().unwrap_or(&obj);
            impact_of(&topology, cache.controller_name(), &[(Some(prior), None)])
        };
        let meta = format!("delete {} {id}", K::kind(&()));
        self.deploys
            .apply(impact, meta, || {
                cache.unset::<K>(&id);
            })
            .await
    }

    /// Replaces the cached kind after the watch restarted, deploying the
    /// difference.
    async fn relist(&self, objs: Vec<K>) {
        let cache = self.deploys.cache().clone();
        let impact = {
            let topology = cache.read();
            let prior = topology.all::<K>();
            let mut current = objs
                .iter()
                .filter_map(|obj| Some((ResourceId::of(obj)?, obj)))
                .collect::<BTreeMap<_, _>>();
            let mut changes = Vec::with_capacity(prior.len() + current.len());
            for obj in &prior {
                let update = ResourceId::of(&**obj).and_then(|id| current.remove(&id));
                changes.push((Some(&**obj), update));
            }
            changes.extend(current.into_values().map(|obj| (None, Some(obj))));
            impact_of(&topology, cache.controller_name(), &changes)
        };
        let meta = format!("relist {} ({} objects)", K::kind(&()), objs.len());
        self.deploys
            .apply(impact, meta, || cache.reset(objs))
            .await
    }
}

// === impl NodeWatch ===

impl NodeWatch {
    pub(crate) fn new(deploys: Deploys, sync: SyncToken) -> Self {
        Self {
            deploys,
            presync: sync.lock(),
            sync: Some(sync),
            init: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self, events: impl Stream<Item = watcher::Event<Node>>) {
        tokio::pin!(events);
        while let Some(event) = events.next().await {
            self.handle(event).await;
        }
        debug!("Watch ended");
    }

    pub(crate) async fn handle(&mut self, event: watcher::Event<Node>) {
        let nodes = self.deploys.nodes().clone();
        match event {
            watcher::Event::Init => self.init.clear(),
            watcher::Event::InitApply(node) => self.init.push(node),
            watcher::Event::InitDone => {
                let listed = std::mem::take(&mut self.init);
                let reset = |listed: Vec<Node>| nodes.reset(&listed);
                if let Some(listed) = self.presync.write_unsynced(listed, reset) {
                    let meta = format!("relist Node ({} objects)", listed.len());
                    self.deploys
                        .apply(Ok(Impact::services()), meta, || nodes.reset(&listed))
                        .await;
                }
                if let Some(sync) = self.sync.take() {
                    if sync.ready() {
                        self.deploys.initial().await;
                    }
                }
            }
            watcher::Event::Apply(node) => {
                // Fabric errors are logged by the cache, which drops the node.
                let set = |node: &Node| {
                    let _ = nodes.set(node);
                };
                if let Some(node) = self.presync.write_unsynced(node, |node| set(&node)) {
                    let meta = format!("apply Node {}", node.name_any());
                    self.deploys
                        .apply(Ok(Impact::services()), meta, || set(&node))
                        .await;
                }
            }
            watcher::Event::Delete(node) => {
                let unset = |name: String| {
                    nodes.unset(&name);
                };
                if let Some(name) = self.presync.write_unsynced(node.name_any(), unset) {
                    let meta = format!("delete Node {name}");
                    self.deploys
                        .apply(Ok(Impact::services()), meta, || unset(name))
                        .await;
                }
            }
        }
    }
}
