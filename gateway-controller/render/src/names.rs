//! Device object names. Names embed the namespace and name of the objects
//! they derive from, so they are stable across renderings.

use bigip_gateway_controller_core::DeployStyle;
use bigip_gateway_controller_k8s_api::{
    gateway::{Gateway, HttpRoute, Listener, ParentReference},
    ResourceExt, Secret,
};
use bigip_gateway_controller_k8s_index::ResourceId;
use std::net::IpAddr;

/// The application folder AS3 declarations place their objects in.
pub const AS3_FOLDER: &str = "serviceMain";

/// Names the virtuals, hostname rule and client-ssl profile of a listener.
pub fn listener(gateway: &Gateway, listener: &Listener) -> String {
    format!(
        "gw.{}.{}.{}",
        gateway.namespace().unwrap_or_default(),
        gateway.name_unchecked(),
        listener.name
    )
}

/// The listener name a route's parent reference resolves to.
pub fn parent_listener(route: &HttpRoute, parent: &ParentReference, section: &str) -> String {
    let namespace = parent
        .namespace
        .clone()
        .unwrap_or_else(|| route.namespace().unwrap_or_default());
    format!("gw.{}.{}.{}", namespace, parent.name, section)
}

/// A gateway may carry several addresses; each gets its own virtual.
pub fn virtual_server(listener: &str, address_index: usize) -> String {
    if address_index == 0 {
        return listener.to_string();
    }
    format!("{listener}.{address_index}")
}

pub fn route(route: &HttpRoute) -> String {
    format!(
        "hr.{}.{}",
        route.namespace().unwrap_or_default(),
        route.name_unchecked()
    )
}

pub fn secret(secret: &Secret) -> String {
    format!(
        "scrt.{}.{}",
        secret.namespace().unwrap_or_default(),
        secret.name_unchecked()
    )
}

pub fn pool(service: &ResourceId) -> String {
    format!("{}.{}", service.namespace, service.name)
}

/// The full path of a service's pool as referenced from another partition.
pub fn pool_path(style: DeployStyle, partition: &str, service: &ResourceId) -> String {
    match style {
        DeployStyle::Rest => format!("/{}/{}", partition, pool(service)),
        DeployStyle::As3 => format!("/{}/{}/{}", partition, AS3_FOLDER, pool(service)),
    }
}

/// Formats an address and port the way the device writes destinations.
/// IPv6 addresses use `.` since `:` is ambiguous.
pub fn destination(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(ip) => format!("{ip}:{port}"),
        IpAddr::V6(ip) => format!("{ip}.{port}"),
    }
}

pub fn arp(ip: IpAddr) -> String {
    format!("k8s-{ip}")
}

/// Prefixes a name with its device resource type.
pub fn path(kind: &str, name: &str) -> String {
    format!("{kind}/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destinations() {
        assert_eq!(destination("10.1.1.1".parse().unwrap(), 80), "10.1.1.1:80");
        assert_eq!(destination("2001:db8::1".parse().unwrap(), 443), "2001:db8::1.443");
    }

    #[test]
    fn pool_paths() {
        let svc = ResourceId::new("ns", "svc");
        assert_eq!(pool_path(DeployStyle::Rest, "cis-c-tenant", &svc), "/cis-c-tenant/ns.svc");
        assert_eq!(
            pool_path(DeployStyle::As3, "cis-c-tenant", &svc),
            "/cis-c-tenant/serviceMain/ns.svc"
        );
    }

    #[test]
    fn virtual_names() {
        assert_eq!(virtual_server("gw.ns.g.http", 0), "gw.ns.g.http");
        assert_eq!(virtual_server("gw.ns.g.http", 1), "gw.ns.g.http.1");
    }
}
