use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct DeployMetrics {
    enqueued: Family<PartitionLabels, Counter>,
    delivered: Family<ResultLabels, Counter>,
    queue_depth: Gauge,
    snapshot_failures: Counter,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct PartitionLabels {
    partition: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ResultLabels {
    partition: String,
    result: &'static str,
}

// === impl DeployMetrics ===

impl DeployMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let enqueued = Family::<PartitionLabels, Counter>::default();
        reg.register(
            "requests_enqueued",
            "Total number of deploy requests enqueued per partition",
            enqueued.clone(),
        );

        let delivered = Family::<ResultLabels, Counter>::default();
        reg.register(
            "requests",
            "Total number of deploy requests handed to the deployer, by result",
            delivered.clone(),
        );

        let queue_depth = Gauge::default();
        reg.register(
            "queue_depth",
            "The number of deploy requests waiting for the deployer",
            queue_depth.clone(),
        );

        let snapshot_failures = Counter::default();
        reg.register(
            "snapshot_failures",
            "Total number of events whose snapshots could not be rendered",
            snapshot_failures.clone(),
        );

        Self {
            enqueued,
            delivered,
            queue_depth,
            snapshot_failures,
        }
    }

    pub(crate) fn enqueued(&self, partition: &str) {
        self.enqueued
            .get_or_create(&PartitionLabels {
                partition: partition.to_string(),
            })
            .inc();
    }

    pub(crate) fn delivered(&self, partition: &str, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.delivered
            .get_or_create(&ResultLabels {
                partition: partition.to_string(),
                result,
            })
            .inc();
    }

    pub(crate) fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub(crate) fn snapshot_failed(&self) {
        self.snapshot_failures.inc();
    }
}

impl Default for DeployMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}
