use crate::{cache::SharedCache, node::SharedNodes, TopologyKind};
use bigip_gateway_controller_k8s_api::{
    gateway::{Gateway, GatewayClass, HttpRoute, ReferenceGrant},
    Endpoints, Namespace, Secret, Service,
};
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented {
    cache: SharedCache,
    nodes: SharedNodes,
}

pub fn register(reg: &mut Registry, cache: SharedCache, nodes: SharedNodes) {
    reg.register_collector(Box::new(Instrumented { cache, nodes }));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let topology = self.cache.read();

        let mut size_encoder = encoder.encode_descriptor(
            "topology_index_size",
            "The number of cached objects of each kind",
            None,
            MetricType::Gauge,
        )?;
        let sizes = [
            kind_size::<GatewayClass>(&topology),
            kind_size::<Gateway>(&topology),
            kind_size::<HttpRoute>(&topology),
            kind_size::<ReferenceGrant>(&topology),
            kind_size::<Secret>(&topology),
            kind_size::<Service>(&topology),
            kind_size::<Endpoints>(&topology),
            kind_size::<Namespace>(&topology),
        ];
        for (kind, len) in &sizes {
            let labels = vec![("kind", kind.as_str())];
            let gauge = ConstGauge::new(*len as u32);
            gauge.encode(size_encoder.encode_family(&labels)?)?;
        }

        let grants_encoder = encoder.encode_descriptor(
            "reference_grant_pairs",
            "The number of distinct authorized reference pairs",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(topology.grants().len() as u32).encode(grants_encoder)?;
        drop(topology);

        let nodes_encoder = encoder.encode_descriptor(
            "fabric_nodes",
            "The number of nodes with known fabric addresses",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(self.nodes.len() as u32).encode(nodes_encoder)?;

        Ok(())
    }
}

fn kind_size<K: TopologyKind>(topology: &crate::Topology) -> (String, usize) {
    (K::kind(&()).into_owned(), topology.len::<K>())
}
