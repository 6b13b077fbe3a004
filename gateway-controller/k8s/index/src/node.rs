//! Node -> overlay fabric addresses.
//!
//! Pool members backed by pods are reached through the node hosting them. For
//! VXLAN-style overlays the device also needs the node's tunnel MAC, which
//! each CNI publishes differently.

use ahash::AHashMap as HashMap;
use bigip_gateway_controller_core::{Error, Result};
use bigip_gateway_controller_k8s_api::{Node, ResourceExt};
use parking_lot::RwLock;
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
};
use tracing::{debug, instrument, warn};

pub type SharedNodes = Arc<NodeFabricCache>;

const UNREACHABLE_TAINT: &str = "node.kubernetes.io/unreachable";

const CALICO_IPV4_ANNOTATION: &str = "projectcalico.org/IPv4Address";
const FLANNEL_BACKEND_DATA: &str = "flannel.alpha.coreos.com/backend-data";
const FLANNEL_BACKEND_V6_DATA: &str = "flannel.alpha.coreos.com/backend-v6-data";
const FLANNEL_BACKEND_TYPE: &str = "flannel.alpha.coreos.com/backend-type";
const FLANNEL_PUBLIC_IP: &str = "flannel.alpha.coreos.com/public-ip";
const FLANNEL_PUBLIC_IPV6: &str = "flannel.alpha.coreos.com/public-ipv6";

pub const VXLAN: &str = "vxlan";
pub const CALICO_UNDERLAY: &str = "calico-underlay";

#[derive(Debug, Default)]
pub struct NodeFabricCache {
    nodes: RwLock<HashMap<String, Arc<NodeFabric>>>,
}

/// The overlay network implementations whose node metadata is understood.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Fabric {
    Cilium,
    Flannel,
    Calico,
}

/// The addresses by which the device reaches a node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeFabric {
    pub name: String,
    pub net_type: String,
    pub ipv4: Option<Ipv4Addr>,
    pub mac: Option<String>,
    pub ipv6: Option<Ipv6Addr>,
    pub mac_v6: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct FlannelBackendData {
    #[serde(rename = "VtepMAC")]
    vtep_mac: Option<String>,
}

// === impl NodeFabricCache ===

impl NodeFabricCache {
    pub fn shared() -> SharedNodes {
        Arc::new(Self::default())
    }

    /// Records a node's fabric addresses. An unreachable node is evicted
    /// instead. A node whose fabric cannot be derived is evicted and the
    /// error returned.
    #[instrument(skip_all, fields(name = %node.name_any()))]
    pub fn set(&self, node: &Node) -> Result<()> {
        let name = node.name_any();
        if is_unreachable(node) {
            if self.nodes.write().remove(&name).is_some() {
                debug!("Evicted unreachable node");
            }
            return Ok(());
        }

        match NodeFabric::derive(node) {
            Ok(fabric) => {
                debug!(?fabric, "Setting");
                self.nodes.write().insert(name, Arc::new(fabric));
                Ok(())
            }
            Err(error) => {
                warn!(%error, "Failed to derive node fabric");
                self.nodes.write().remove(&name);
                Err(error)
            }
        }
    }

    pub fn unset(&self, name: &str) -> Option<Arc<NodeFabric>> {
        self.nodes.write().remove(name)
    }

    /// Replaces every node, as after a relist. Nodes whose fabric cannot be
    /// derived are left out.
    pub fn reset(&self, nodes: &[Node]) {
        self.nodes.write().clear();
        for node in nodes {
            // Failures are logged by `set`.
            let _ = self.set(node);
        }
        debug!(size = self.len(), "Reset");
    }

    pub fn get(&self, name: &str) -> Option<Arc<NodeFabric>> {
        self.nodes.read().get(name).cloned()
    }

    /// All nodes, ordered by name.
    pub fn all(&self) -> Vec<Arc<NodeFabric>> {
        let mut nodes = self.nodes.read().values().cloned().collect::<Vec<_>>();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

fn is_unreachable(node: &Node) -> bool {
    node.spec
        .iter()
        .flat_map(|spec| spec.taints.iter().flatten())
        .any(|taint| taint.key == UNREACHABLE_TAINT && taint.effect == "NoSchedule")
}

// === impl Fabric ===

impl Fabric {
    /// Detects the fabric from the CNI's node condition, falling back to the
    /// annotations it writes.
    pub fn detect(node: &Node) -> Option<Self> {
        let by_condition = node
            .status
            .iter()
            .flat_map(|status| status.conditions.iter().flatten())
            .find_map(|condition| match condition.reason.as_deref() {
                Some("CiliumIsUp") => Some(Self::Cilium),
                Some("FlannelIsUp") => Some(Self::Flannel),
                Some("CalicoIsUp") => Some(Self::Calico),
                _ => None,
            });
        if by_condition.is_some() {
            return by_condition;
        }

        let annotations = node.annotations();
        if annotations.contains_key(CALICO_IPV4_ANNOTATION) {
            return Some(Self::Calico);
        }
        if annotations.contains_key(FLANNEL_BACKEND_DATA)
            || annotations.contains_key(FLANNEL_BACKEND_V6_DATA)
        {
            return Some(Self::Flannel);
        }
        None
    }

    fn derive(self, node: &Node) -> std::result::Result<NodeFabric, String> {
        let mut fabric = NodeFabric {
            name: node.name_any(),
            ..NodeFabric::default()
        };
        match self {
            Self::Cilium => {
                let ip = internal_ip(node).ok_or("node has no InternalIP address")?;
                fabric.net_type = VXLAN.to_string();
                match ip {
                    IpAddr::V4(ip) => {
                        fabric.mac = Some(cilium_mac(ip));
                        fabric.ipv4 = Some(ip);
                    }
                    IpAddr::V6(ip) => fabric.ipv6 = Some(ip),
                }
            }

            Self::Flannel => {
                let annotations = node.annotations();
                fabric.net_type = annotations
                    .get(FLANNEL_BACKEND_TYPE)
                    .cloned()
                    .unwrap_or_default();
                if let Some(data) = annotations.get(FLANNEL_BACKEND_DATA) {
                    fabric.mac = vtep_mac(data)?;
                    fabric.ipv4 = annotations
                        .get(FLANNEL_PUBLIC_IP)
                        .map(|ip| ip.parse().map_err(|e| format!("invalid public-ip {ip}: {e}")))
                        .transpose()?;
                }
                if let (Some(data), Some(ip)) = (
                    annotations.get(FLANNEL_BACKEND_V6_DATA),
                    annotations.get(FLANNEL_PUBLIC_IPV6),
                ) {
                    fabric.mac_v6 = vtep_mac(data)?;
                    fabric.ipv6 = Some(
                        ip.parse()
                            .map_err(|e| format!("invalid public-ipv6 {ip}: {e}"))?,
                    );
                }
            }

            Self::Calico => {
                fabric.net_type = CALICO_UNDERLAY.to_string();
                let cidr = node
                    .annotations()
                    .get(CALICO_IPV4_ANNOTATION)
                    .ok_or("node has no calico IPv4 address")?;
                let ip = cidr.split('/').next().unwrap_or_default();
                fabric.ipv4 = Some(
                    ip.parse()
                        .map_err(|e| format!("invalid calico address {cidr}: {e}"))?,
                );
            }
        }
        Ok(fabric)
    }
}

fn internal_ip(node: &Node) -> Option<IpAddr> {
    node.status
        .iter()
        .flat_map(|status| status.addresses.iter().flatten())
        .filter(|addr| addr.type_ == "InternalIP")
        .find_map(|addr| addr.address.parse().ok())
}

/// Cilium derives its tunnel MAC from the node's IPv4 address.
fn cilium_mac(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("0a:0a:{a:02x}:{b:02x}:{c:02x}:{d:02x}")
}

fn vtep_mac(data: &str) -> std::result::Result<Option<String>, String> {
    serde_json::from_str::<FlannelBackendData>(data)
        .map(|data| data.vtep_mac)
        .map_err(|e| format!("invalid flannel backend data: {e}"))
}

// === impl NodeFabric ===

impl NodeFabric {
    pub fn derive(node: &Node) -> Result<Self> {
        let name = node.name_any();
        let fabric = Fabric::detect(node).ok_or_else(|| Error::Fabric {
            node: name.clone(),
            reason: "unknown network fabric".to_string(),
        })?;
        fabric
            .derive(node)
            .map_err(|reason| Error::Fabric { node: name, reason })
    }

    /// The node's address in the given family.
    pub fn ip(&self, v6: bool) -> Option<IpAddr> {
        if v6 {
            return self.ipv6.map(IpAddr::V6);
        }
        self.ipv4.map(IpAddr::V4)
    }

    /// The tunnel MAC for members of the given family, present only on
    /// VXLAN overlays.
    pub fn overlay_mac(&self, v6: bool) -> Option<&str> {
        if self.net_type != VXLAN {
            return None;
        }
        if v6 {
            return self.mac_v6.as_deref();
        }
        self.mac.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigip_gateway_controller_k8s_api::{
        NodeAddress, NodeCondition, NodeSpec, NodeStatus, ObjectMeta, Taint,
    };
    use maplit::btreemap;

    fn mk_node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn mk_cilium_node(name: &str, ip: &str) -> Node {
        let mut node = mk_node(name);
        node.status = Some(NodeStatus {
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
        });
        node
    }

    #[test]
    fn cilium_mac_from_ipv4() {
        let cache = NodeFabricCache::default();
        cache.set(&mk_cilium_node("node-0", "10.250.1.17")).unwrap();
        let fabric = cache.get("node-0").expect("node must be cached");
        assert_eq!(fabric.ipv4, Some(Ipv4Addr::new(10, 250, 1, 17)));
        assert_eq!(fabric.mac.as_deref(), Some("0a:0a:0a:fa:01:11"));
        assert_eq!(fabric.overlay_mac(false), Some("0a:0a:0a:fa:01:11"));
    }

    #[test]
    fn flannel_vtep_macs() {
        let mut node = mk_node("node-1");
        node.metadata.annotations = Some(btreemap! {
            FLANNEL_BACKEND_DATA.to_string() => r#"{"VNI":1,"VtepMAC":"5e:9a:08:bd:22:1c"}"#.to_string(),
            FLANNEL_BACKEND_TYPE.to_string() => "vxlan".to_string(),
            FLANNEL_PUBLIC_IP.to_string() => "10.250.1.18".to_string(),
            FLANNEL_BACKEND_V6_DATA.to_string() => r#"{"VNI":1,"VtepMAC":"aa:9a:08:bd:22:1c"}"#.to_string(),
            FLANNEL_PUBLIC_IPV6.to_string() => "2001:db8::18".to_string(),
        });
        let fabric = NodeFabric::derive(&node).unwrap();
        assert_eq!(fabric.net_type, VXLAN);
        assert_eq!(fabric.mac.as_deref(), Some("5e:9a:08:bd:22:1c"));
        assert_eq!(fabric.ipv6, Some("2001:db8::18".parse().unwrap()));
        assert_eq!(fabric.overlay_mac(true), Some("aa:9a:08:bd:22:1c"));
    }

    #[test]
    fn calico_has_no_overlay_mac() {
        let mut node = mk_node("node-2");
        node.metadata.annotations = Some(btreemap! {
            CALICO_IPV4_ANNOTATION.to_string() => "10.250.1.19/24".to_string(),
        });
        let fabric = NodeFabric::derive(&node).unwrap();
        assert_eq!(fabric.net_type, CALICO_UNDERLAY);
        assert_eq!(fabric.ipv4, Some(Ipv4Addr::new(10, 250, 1, 19)));
        assert_eq!(fabric.overlay_mac(false), None);
    }

    #[test]
    fn unknown_fabric_is_an_error() {
        let cache = NodeFabricCache::default();
        let error = cache.set(&mk_node("node-3")).unwrap_err();
        assert!(matches!(error, Error::Fabric { .. }), "{error}");
        assert!(cache.get("node-3").is_none());
    }

    #[test]
    fn unreachable_taint_evicts_known_node() {
        let cache = NodeFabricCache::default();
        let mut node = mk_cilium_node("node-0", "10.250.1.17");
        cache.set(&node).unwrap();
        assert_eq!(cache.len(), 1);

        node.spec = Some(NodeSpec {
            taints: Some(vec![Taint {
                key: UNREACHABLE_TAINT.to_string(),
                effect: "NoSchedule".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        cache.set(&node).unwrap();
        assert!(cache.get("node-0").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn all_is_ordered_by_name() {
        let cache = NodeFabricCache::default();
        cache.set(&mk_cilium_node("node-b", "10.0.0.2")).unwrap();
        cache.set(&mk_cilium_node("node-a", "10.0.0.1")).unwrap();
        let names = cache.all().iter().map(|n| n.name.clone()).collect::<Vec<_>>();
        assert_eq!(names, vec!["node-a", "node-b"]);
        assert!(cache.unset("node-a").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn reset_drops_absent_and_underivable_nodes() {
        let cache = NodeFabricCache::default();
        cache.set(&mk_cilium_node("node-a", "10.0.0.1")).unwrap();
        cache.reset(&[mk_cilium_node("node-b", "10.0.0.2"), mk_node("node-c")]);
        let names = cache.all().iter().map(|n| n.name.clone()).collect::<Vec<_>>();
        assert_eq!(names, vec!["node-b"]);
    }
}
