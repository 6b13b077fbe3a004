use crate::metrics::DeployMetrics;
use bigip_gateway_controller_core::{ConfigDoc, DeployRequest, Error, PartitionAction, Result};
use bigip_gateway_controller_render::{SnapshotBuilder, Snapshots};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, instrument, warn};

/// The classes whose partitions an event may change, with an optional
/// partition action for each.
///
/// The services partition is deployed with every class. `services` also
/// deploys it when no class is impacted, as for node changes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Impact {
    pub classes: BTreeSet<String>,
    pub actions: BTreeMap<String, PartitionAction>,
    pub services: bool,
}

/// Turns cache mutations into deploy requests.
///
/// Each event is bracketed by two renderings of the classes it impacts, and
/// the difference is queued for the deployer. The renderings and the
/// mutation are separate critical sections, so another event's mutation may
/// land between them and show up in this event's diff. When `serialize` is
/// set, events take a pipeline-wide lock around all three steps instead.
#[derive(Debug)]
pub struct DeployPipeline {
    builder: SnapshotBuilder,
    tx: mpsc::Sender<DeployRequest>,
    serial: Option<Mutex<()>>,
    /// The last document enqueued for each partition.
    enqueued: parking_lot::Mutex<BTreeMap<String, ConfigDoc>>,
    metrics: DeployMetrics,
}

// === impl Impact ===

impl Impact {
    pub fn new(classes: impl IntoIterator<Item = String>) -> Self {
        Self {
            classes: classes.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Impacts a single class and asks for its partition to be created or
    /// removed.
    pub fn with_action(class: impl Into<String>, action: PartitionAction) -> Self {
        let class = class.into();
        Self {
            classes: BTreeSet::from([class.clone()]),
            actions: BTreeMap::from([(class, action)]),
            services: false,
        }
    }

    /// Impacts only the services partition.
    pub fn services() -> Self {
        Self {
            services: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty() && !self.services
    }
}

impl FromIterator<String> for Impact {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self::new(iter)
    }
}

// === impl DeployPipeline ===

impl DeployPipeline {
    /// Builds a pipeline and the receiving end of its queue, which holds at
    /// most `capacity` requests.
    pub fn new(
        builder: SnapshotBuilder,
        capacity: usize,
        serialize: bool,
        metrics: DeployMetrics,
    ) -> (Self, mpsc::Receiver<DeployRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        let pipeline = Self {
            builder,
            tx,
            serial: serialize.then(|| Mutex::new(())),
            enqueued: Default::default(),
            metrics,
        };
        (pipeline, rx)
    }

    pub fn builder(&self) -> &SnapshotBuilder {
        &self.builder
    }

    /// Applies `mutate` to the cache and queues one request per impacted
    /// class plus one for the services partition.
    ///
    /// `mutate` always runs, even when the prior rendering fails, so the
    /// cache never falls behind the events it is fed. Rendering errors are
    /// returned without queueing anything. Enqueueing waits while the queue
    /// is full.
    #[instrument(skip_all, fields(classes = ?impact.classes))]
    pub async fn deploy_for_event<F>(&self, impact: &Impact, mutate: F) -> Result<()>
    where
        F: FnOnce() -> String,
    {
        if impact.is_empty() {
            let meta = mutate();
            debug!(%meta, "No partitions impacted");
            return Ok(());
        }

        let _serial = match self.serial.as_ref() {
            Some(serial) => Some(serial.lock().await),
            None => None,
        };

        let before = self.builder.snapshot(&impact.classes);
        let meta = mutate();
        let before = before.inspect_err(|error| {
            self.metrics.snapshot_failed();
            warn!(%meta, %error, "Failed to render prior snapshots");
        })?;
        let after = self.builder.snapshot(&impact.classes).inspect_err(|error| {
            self.metrics.snapshot_failed();
            warn!(%meta, %error, "Failed to render snapshots");
        })?;

        let requests = self.requests(impact, &meta, before, after);
        self.enqueue(requests).await
    }

    /// Renders the impacted partitions and queues the difference from what
    /// was last enqueued for each.
    ///
    /// Used to retry an event whose rendering failed after its mutation was
    /// applied, when no prior rendering of the event is available.
    #[instrument(skip_all, fields(classes = ?impact.classes))]
    pub async fn redeploy(&self, impact: &Impact, meta: impl Into<String>) -> Result<()> {
        if impact.is_empty() {
            return Ok(());
        }
        let meta = meta.into();

        let _serial = match self.serial.as_ref() {
            Some(serial) => Some(serial.lock().await),
            None => None,
        };

        let after = self.builder.snapshot(&impact.classes).inspect_err(|error| {
            self.metrics.snapshot_failed();
            warn!(%meta, %error, "Failed to render snapshots");
        })?;
        let before = {
            let enqueued = self.enqueued.lock();
            after
                .keys()
                .filter_map(|p| Some((p.clone(), enqueued.get(p)?.clone())))
                .collect()
        };
        info!(%meta, "Redeploying");
        let requests = self.requests(impact, &meta, before, after);
        self.enqueue(requests).await
    }

    async fn enqueue(&self, requests: Vec<DeployRequest>) -> Result<()> {
        for request in requests {
            let partition = request.partition.clone();
            let meta = request.meta.clone();
            let to = request.to.clone();
            self.tx
                .send(request)
                .await
                .map_err(|_| Error::QueueClosed)?;
            self.enqueued.lock().insert(partition.clone(), to);
            self.metrics.enqueued(&partition);
            self.metrics
                .set_queue_depth(self.tx.max_capacity() - self.tx.capacity());
            debug!(%partition, %meta, "Enqueued");
        }
        Ok(())
    }

    /// Orders the services partition first so pools exist before the rules
    /// that select them.
    fn requests(
        &self,
        impact: &Impact,
        meta: &str,
        mut before: Snapshots,
        after: Snapshots,
    ) -> Vec<DeployRequest> {
        let services = self.builder.services_partition();
        let mut requests = Vec::with_capacity(after.len());
        for (partition, to) in after {
            let request = DeployRequest {
                meta: meta.to_string(),
                from: before.remove(&partition).unwrap_or_default(),
                to,
                action: impact.actions.get(&partition).copied(),
                partition,
            };
            if request.partition == services {
                requests.insert(0, request);
            } else {
                requests.push(request);
            }
        }
        requests
    }
}
