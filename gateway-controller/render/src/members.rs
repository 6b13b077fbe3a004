//! Resolves a Service into the addresses the device balances across.

use bigip_gateway_controller_core::{Error, Result};
use bigip_gateway_controller_k8s_api::{Endpoints, ResourceExt, Service};
use bigip_gateway_controller_k8s_index::NodeFabricCache;
use std::net::IpAddr;

/// One pool member. The MAC is only known for members reached over a VXLAN
/// overlay, which need static ARP entries on the device.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Member {
    pub address: IpAddr,
    pub port: u16,
    pub mac: Option<String>,
}

const NODE_PORT: &str = "NodePort";
const CLUSTER_IP: &str = "ClusterIP";
const LOAD_BALANCER: &str = "LoadBalancer";
const EXTERNAL_NAME: &str = "ExternalName";

/// Lists a service's members, ordered by address and port.
///
/// `NodePort` services are reached on every known node. `ClusterIP` services
/// are reached on their endpoints, each of which must name its node.
pub fn resolve(
    service: &Service,
    endpoints: Option<&Endpoints>,
    nodes: &NodeFabricCache,
) -> Result<Vec<Member>> {
    let spec = service.spec.as_ref();
    let service_type = spec
        .and_then(|spec| spec.type_.as_deref())
        .unwrap_or(CLUSTER_IP);

    let mut members = match service_type {
        NODE_PORT => node_port_members(service, nodes)?,
        CLUSTER_IP => match endpoints {
            Some(endpoints) => endpoint_members(endpoints, nodes)?,
            None => Vec::new(),
        },
        LOAD_BALANCER | EXTERNAL_NAME => {
            return Err(Error::UnsupportedServiceType {
                service: service_id(service),
                service_type: service_type.to_string(),
            })
        }
        unknown => {
            return Err(Error::UnsupportedServiceType {
                service: service_id(service),
                service_type: format!("unknown type {unknown}"),
            })
        }
    };
    members.sort();
    members.dedup();
    Ok(members)
}

fn node_port_members(service: &Service, nodes: &NodeFabricCache) -> Result<Vec<Member>> {
    let mut addresses = Vec::new();
    for node in nodes.all() {
        let ip = node
            .ip(false)
            .or_else(|| node.ip(true))
            .ok_or_else(|| Error::NodeIpUnknown(node.name.clone()))?;
        addresses.push(ip);
    }

    let mut members = Vec::new();
    let ports = service.spec.iter().flat_map(|spec| spec.ports.iter().flatten());
    for port in ports {
        let Some(node_port) = port.node_port.and_then(|p| u16::try_from(p).ok()) else {
            continue;
        };
        members.extend(addresses.iter().map(|&address| Member {
            address,
            port: node_port,
            mac: None,
        }));
    }
    Ok(members)
}

fn endpoint_members(endpoints: &Endpoints, nodes: &NodeFabricCache) -> Result<Vec<Member>> {
    let mut members = Vec::new();
    for subset in endpoints.subsets.iter().flatten() {
        for port in subset.ports.iter().flatten() {
            let Ok(port) = u16::try_from(port.port) else {
                continue;
            };
            for addr in subset.addresses.iter().flatten() {
                let address = addr
                    .ip
                    .parse::<IpAddr>()
                    .map_err(|_| Error::InvalidAddress(addr.ip.clone()))?;
                let node_name = addr
                    .node_name
                    .as_deref()
                    .ok_or_else(|| Error::MissingNodeName(addr.ip.clone()))?;
                let node = nodes.get(node_name).ok_or_else(|| Error::NodeNotReady {
                    node: node_name.to_string(),
                    address: addr.ip.clone(),
                })?;
                members.push(Member {
                    address,
                    port,
                    mac: node.overlay_mac(address.is_ipv6()).map(Into::into),
                });
            }
        }
    }
    Ok(members)
}

fn service_id(service: &Service) -> String {
    format!(
        "{}/{}",
        service.namespace().unwrap_or_default(),
        service.name_unchecked()
    )
}
