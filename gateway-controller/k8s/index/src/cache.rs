use crate::{grants::ReferenceGrantIndex, ResourceId};
use ahash::AHashMap as HashMap;
use bigip_gateway_controller_core::{Error, Result};
use bigip_gateway_controller_k8s_api::{
    gateway::{Gateway, GatewayClass, HttpRoute, ReferenceGrant},
    Endpoints, Namespace, Resource, Secret, Service,
};
use parking_lot::{RwLock, RwLockReadGuard};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, instrument, trace};

pub type SharedCache = Arc<TopologyCache>;

/// Cached objects of one kind. Values are shared, immutable snapshots: a
/// caller that wants to change an object clones it and sets the copy.
pub type Store<K> = HashMap<ResourceId, Arc<K>>;

/// Holds every cached topology object behind one lock, so that queries
/// spanning several kinds observe a single consistent state.
#[derive(Debug)]
pub struct TopologyCache {
    controller_name: String,
    synced: AtomicBool,
    topology: RwLock<Topology>,
}

/// The cached topology. Read access is obtained through
/// [`TopologyCache::read`] or [`TopologyCache::snapshot`]; all writes go
/// through the cache.
#[derive(Debug, Default)]
pub struct Topology {
    pub(crate) gateway_classes: Store<GatewayClass>,
    pub(crate) gateways: Store<Gateway>,
    pub(crate) http_routes: Store<HttpRoute>,
    pub(crate) reference_grants: Store<ReferenceGrant>,
    pub(crate) secrets: Store<Secret>,
    pub(crate) services: Store<Service>,
    pub(crate) endpoints: Store<Endpoints>,
    pub(crate) namespaces: Store<Namespace>,
    pub(crate) grants: ReferenceGrantIndex,
}

/// A kind of object held by the [`TopologyCache`].
pub trait TopologyKind: Resource<DynamicType = ()> + Send + Sync + Sized + 'static {
    fn store(topology: &Topology) -> &Store<Self>;

    fn store_mut(topology: &mut Topology) -> &mut Store<Self>;

    /// Keeps derived state in step with the store. Runs in the same critical
    /// section as the store update.
    #[inline]
    fn replaced(_topology: &mut Topology, _prior: Option<&Self>, _current: Option<&Self>) {}
}

macro_rules! topology_kind {
    ($kind:ty, $field:ident) => {
        impl TopologyKind for $kind {
            #[inline]
            fn store(topology: &Topology) -> &Store<Self> {
                &topology.$field
            }

            #[inline]
            fn store_mut(topology: &mut Topology) -> &mut Store<Self> {
                &mut topology.$field
            }
        }
    };
}

topology_kind!(GatewayClass, gateway_classes);
topology_kind!(Gateway, gateways);
topology_kind!(HttpRoute, http_routes);
topology_kind!(Secret, secrets);
topology_kind!(Service, services);
topology_kind!(Endpoints, endpoints);
topology_kind!(Namespace, namespaces);

impl TopologyKind for ReferenceGrant {
    #[inline]
    fn store(topology: &Topology) -> &Store<Self> {
        &topology.reference_grants
    }

    #[inline]
    fn store_mut(topology: &mut Topology) -> &mut Store<Self> {
        &mut topology.reference_grants
    }

    fn replaced(topology: &mut Topology, prior: Option<&Self>, current: Option<&Self>) {
        if let Some(prior) = prior {
            topology.grants.unset(prior);
        }
        if let Some(current) = current {
            topology.grants.set(current);
        }
    }
}

// === impl TopologyCache ===

impl TopologyCache {
    pub fn new(controller_name: impl Into<String>) -> Self {
        Self {
            controller_name: controller_name.into(),
            synced: AtomicBool::new(false),
            topology: RwLock::new(Topology::default()),
        }
    }

    pub fn shared(controller_name: impl Into<String>) -> SharedCache {
        Arc::new(Self::new(controller_name))
    }

    /// The GatewayClass `controllerName` this controller renders.
    pub fn controller_name(&self) -> &str {
        &self.controller_name
    }

    /// Inserts or replaces an object. Objects without a name are ignored.
    #[instrument(skip_all, fields(kind = %K::kind(&())))]
    pub fn set<K: TopologyKind>(&self, obj: K) {
        let Some(id) = ResourceId::of(&obj) else {
            debug!("Ignoring object without a name");
            return;
        };
        trace!(%id, "Setting");
        let obj = Arc::new(obj);
        let mut topology = self.topology.write();
        let prior = K::store_mut(&mut topology).insert(id, obj.clone());
        K::replaced(&mut topology, prior.as_deref(), Some(&*obj));
    }

    /// Removes an object, returning it when it was cached.
    #[instrument(skip_all, fields(kind = %K::kind(&()), %id))]
    pub fn unset<K: TopologyKind>(&self, id: &ResourceId) -> Option<Arc<K>> {
        let mut topology = self.topology.write();
        let removed = K::store_mut(&mut topology).remove(id)?;
        K::replaced(&mut topology, Some(&*removed), None);
        trace!("Unset");
        Some(removed)
    }

    pub fn get<K: TopologyKind>(&self, id: &ResourceId) -> Option<Arc<K>> {
        self.topology.read().get(id)
    }

    /// Replaces every object of a kind, as after a relist.
    #[instrument(skip_all, fields(kind = %K::kind(&())))]
    pub fn reset<K: TopologyKind>(&self, objs: Vec<K>) {
        let mut topology = self.topology.write();
        let prior = std::mem::take(K::store_mut(&mut topology));
        for removed in prior.values() {
            K::replaced(&mut topology, Some(&**removed), None);
        }
        for obj in objs {
            let Some(id) = ResourceId::of(&obj) else {
                continue;
            };
            let obj = Arc::new(obj);
            K::store_mut(&mut topology).insert(id, obj.clone());
            K::replaced(&mut topology, None, Some(&*obj));
        }
        debug!(size = K::store(&topology).len(), "Reset");
    }

    /// Read access regardless of sync state. Results may be incomplete
    /// before [`TopologyCache::mark_synced`] has been called.
    pub fn read(&self) -> RwLockReadGuard<'_, Topology> {
        self.topology.read()
    }

    /// Read access for resolution. Fails until the initial listing of every
    /// kind has been applied.
    pub fn snapshot(&self) -> Result<RwLockReadGuard<'_, Topology>> {
        if !self.is_synced() {
            return Err(Error::NotSynced);
        }
        Ok(self.topology.read())
    }

    /// Records that every kind has been listed once.
    pub fn mark_synced(&self) {
        if !self.synced.swap(true, Ordering::AcqRel) {
            debug!("Topology cache synced");
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

// === impl Topology ===

impl Topology {
    pub fn get<K: TopologyKind>(&self, id: &ResourceId) -> Option<Arc<K>> {
        K::store(self).get(id).cloned()
    }

    /// All objects of a kind, ordered by id.
    pub fn all<K: TopologyKind>(&self) -> Vec<Arc<K>> {
        let mut objs = K::store(self).iter().collect::<Vec<_>>();
        objs.sort_by(|(a, _), (b, _)| a.cmp(b));
        objs.into_iter().map(|(_, obj)| obj.clone()).collect()
    }

    pub fn len<K: TopologyKind>(&self) -> usize {
        K::store(self).len()
    }

    pub fn grants(&self) -> &ReferenceGrantIndex {
        &self.grants
    }
}
