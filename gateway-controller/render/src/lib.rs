//! Renders the cached topology into device configuration documents.
//!
//! Each GatewayClass owned by the controller is rendered into its own
//! partition: virtuals, rules and client-ssl profiles for its gateways and
//! the routes attached to them. Pools, and the ARP and node entries their
//! members need, live in one services partition shared by every class.
//!
//! Rendering only reads the cache. Identical topologies render identical
//! documents, which is what makes diffing two renderings meaningful.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod irule;
pub mod members;
pub mod names;
mod shape;


pub use self::{
    members::Member,
    shape::{Certificate, VirtualServer},
};
use bigip_gateway_controller_core::{ConfigDoc, DeployStyle, Error, Result};
use bigip_gateway_controller_k8s_api::{
    gateway::{
        address_type, protocol, Gateway, GatewayClass, HttpRoute, Listener, ParentReference,
        IP_ADDRESS_TYPE,
    },
    Endpoints, ResourceExt, Secret, Service,
};
use bigip_gateway_controller_k8s_index::{
    resolve::{listener_named, parent_targets, HTTP_ROUTE_KIND},
    ResourceId, SharedCache, SharedNodes, Topology,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
    sync::Arc,
};
use tracing::{debug, instrument};

const TLS_CERT_KEY: &str = "tls.crt";
const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

/// Documents keyed by partition.
pub type Snapshots = BTreeMap<String, ConfigDoc>;

#[derive(Clone, Debug)]
pub struct SnapshotBuilder {
    cache: SharedCache,
    nodes: SharedNodes,
    style: DeployStyle,
    services_partition: String,
}

// === impl SnapshotBuilder ===

impl SnapshotBuilder {
    pub fn new(
        cache: SharedCache,
        nodes: SharedNodes,
        style: DeployStyle,
        services_partition: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            nodes,
            style,
            services_partition: services_partition.into(),
        }
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    pub fn nodes(&self) -> &SharedNodes {
        &self.nodes
    }

    pub fn style(&self) -> DeployStyle {
        self.style
    }

    pub fn services_partition(&self) -> &str {
        &self.services_partition
    }

    /// Renders each class and the services partition under a single read of
    /// the cache.
    #[instrument(skip_all, fields(style = %self.style, classes = classes.len()))]
    pub fn snapshot(&self, classes: &BTreeSet<String>) -> Result<Snapshots> {
        let topology = self.cache.snapshot()?;
        let mut docs = Snapshots::new();
        for class in classes {
            docs.insert(class.clone(), self.render_class(&topology, class)?);
        }
        docs.insert(
            self.services_partition.clone(),
            self.render_services(&topology)?,
        );
        debug!(partitions = docs.len(), "Rendered");
        Ok(docs)
    }

    /// Renders one class's partition. A missing class, or one owned by
    /// another controller, renders an empty document.
    pub fn class_snapshot(&self, class: &str) -> Result<ConfigDoc> {
        let topology = self.cache.snapshot()?;
        self.render_class(&topology, class)
    }

    /// Renders the pools of every service referenced from an owned class.
    pub fn services_snapshot(&self) -> Result<ConfigDoc> {
        let topology = self.cache.snapshot()?;
        self.render_services(&topology)
    }

    fn render_class(&self, topology: &Topology, class: &str) -> Result<ConfigDoc> {
        let mut doc = ConfigDoc::default();
        let owned = topology
            .get::<GatewayClass>(&ResourceId::cluster(class))
            .is_some_and(|gc| gc.spec.controller_name == self.cache.controller_name());
        if !owned {
            return Ok(doc);
        }

        let shape = shape::for_style(self.style);
        let pools = irule::PoolLocation {
            style: self.style,
            partition: &self.services_partition,
        };
        let gateways = topology.attached_gateways(class);
        check_parent_refs(topology, &gateways)?;
        for gateway in gateways {
            self.render_gateway(topology, &gateway, &mut doc)?;
            for route in topology.attached_routes(&gateway) {
                let text = irule::route_rule(&route, topology.grants(), pools)?;
                shape.rule(&mut doc, &names::route(&route), text);
            }
        }
        Ok(doc)
    }

    fn render_gateway(
        &self,
        topology: &Topology,
        gateway: &Gateway,
        doc: &mut ConfigDoc,
    ) -> Result<()> {
        let shape = shape::for_style(self.style);
        let gateway_id = ResourceId::of(gateway).unwrap_or_default();

        for listener in &gateway.spec.listeners {
            if listener.protocol != protocol::HTTP && listener.protocol != protocol::HTTPS {
                return Err(Error::UnsupportedProtocol {
                    listener: format!("{gateway_id}/{}", listener.name),
                    protocol: listener.protocol.clone(),
                });
            }
        }

        // Rules per listener: the hostname rule first, then attached routes.
        let mut rules = BTreeMap::<String, Vec<String>>::new();
        for listener in &gateway.spec.listeners {
            let name = names::listener(gateway, listener);
            let listener_rules = rules.entry(name.clone()).or_default();
            if let Some(hostname) = listener.hostname.as_deref() {
                shape.rule(doc, &name, irule::hostname_rule(hostname));
                listener_rules.push(name);
            }
        }
        for route in topology.attached_routes(gateway) {
            self.route_listeners(topology, gateway, &route, &mut rules)?;
        }

        let secrets = topology.attached_secrets(gateway)?;
        let mut client_ssl = BTreeSet::new();
        for listener in &gateway.spec.listeners {
            // Only HTTPS listeners have certificates, and resolution rejects those without.
            let Some(secrets) = secrets.get(&listener.name).filter(|s| !s.is_empty()) else {
                continue;
            };
            let mut certs = Vec::with_capacity(secrets.len());
            for secret in secrets {
                let cert = Certificate {
                    name: names::secret(secret),
                    cert: secret_data(secret, TLS_CERT_KEY),
                    key: secret_data(secret, TLS_PRIVATE_KEY_KEY),
                };
                shape.certificate(doc, &cert);
                certs.push(cert.name);
            }
            let name = names::listener(gateway, listener);
            shape.client_ssl(doc, &name, &certs);
            client_ssl.insert(name);
        }

        let mut ports = BTreeMap::new();
        for listener in &gateway.spec.listeners {
            let port = u16::try_from(listener.port).map_err(|_| Error::InvalidPort {
                listener: format!("{gateway_id}/{}", listener.name),
                port: listener.port,
            })?;
            ports.insert(listener.name.as_str(), port);
        }

        for (i, address) in gateway.spec.addresses.iter().flatten().enumerate() {
            if address_type(address) != IP_ADDRESS_TYPE {
                return Err(Error::UnsupportedAddressType {
                    gateway: gateway_id.to_string(),
                    address_type: address_type(address).to_string(),
                });
            }
            let ip = address
                .value
                .parse::<IpAddr>()
                .map_err(|_| Error::InvalidAddress(address.value.clone()))?;
            for listener in &gateway.spec.listeners {
                let name = names::listener(gateway, listener);
                let vs = VirtualServer {
                    name: names::virtual_server(&name, i),
                    address: ip,
                    port: ports.get(listener.name.as_str()).copied().unwrap_or_default(),
                    client_ssl: client_ssl.get(&name).cloned(),
                    rules: rules.get(&name).cloned().unwrap_or_default(),
                };
                shape.virtual_server(doc, &vs);
            }
        }
        Ok(())
    }

    /// Adds a route's rule to each listener of the gateway it attaches to.
    fn route_listeners(
        &self,
        topology: &Topology,
        gateway: &Gateway,
        route: &HttpRoute,
        rules: &mut BTreeMap<String, Vec<String>>,
    ) -> Result<()> {
        let gateway_namespace = gateway.namespace().unwrap_or_default();
        let route_namespace = route.namespace().unwrap_or_default();
        let route_name = names::route(route);
        for parent in route
            .spec
            .parent_refs
            .iter()
            .flatten()
            .filter(|parent| parent_targets(parent, &route_namespace, gateway))
        {
            let (section, listener) = parent_listener(gateway, route, parent)?;
            if topology.route_matches(
                &gateway_namespace,
                Some(listener),
                &route_namespace,
                HTTP_ROUTE_KIND,
            ) {
                let name = names::parent_listener(route, parent, section);
                let listener_rules = rules.entry(name).or_default();
                if !listener_rules.contains(&route_name) {
                    listener_rules.push(route_name.clone());
                }
            }
        }
        Ok(())
    }

    fn render_services(&self, topology: &Topology) -> Result<ConfigDoc> {
        let shape = shape::for_style(self.style);
        let mut doc = ConfigDoc::default();
        for id in topology.attached_service_keys(self.cache.controller_name()) {
            let members = match topology.get::<Service>(&id) {
                Some(service) => {
                    let endpoints = topology.get::<Endpoints>(&id);
                    members::resolve(&service, endpoints.as_deref(), &self.nodes)?
                }
                None => Vec::new(),
            };
            shape.pool(&mut doc, &names::pool(&id), &members);
            for member in &members {
                if let Some(mac) = member.mac.as_deref() {
                    shape.overlay_member(&mut doc, member.address, mac);
                }
            }
        }
        Ok(doc)
    }
}

/// Every parent reference naming one of the gateways must name one of its
/// listeners. Checked for all routes, since a reference to an unknown
/// listener keeps the route from attaching at all.
fn check_parent_refs(topology: &Topology, gateways: &[Arc<Gateway>]) -> Result<()> {
    if gateways.is_empty() {
        return Ok(());
    }
    for route in topology.all::<HttpRoute>() {
        let route_namespace = route.namespace().unwrap_or_default();
        for gateway in gateways {
            for parent in route
                .spec
                .parent_refs
                .iter()
                .flatten()
                .filter(|parent| parent_targets(parent, &route_namespace, gateway))
            {
                parent_listener(gateway, &route, parent)?;
            }
        }
    }
    Ok(())
}

/// The listener a parent reference names by section.
fn parent_listener<'p, 'g>(
    gateway: &'g Gateway,
    route: &HttpRoute,
    parent: &'p ParentReference,
) -> Result<(&'p str, &'g Listener)> {
    let section = parent
        .section_name
        .as_deref()
        .ok_or_else(|| Error::MissingSectionName {
            route: names::route(route),
            gateway: gateway.name_unchecked(),
        })?;
    let listener = listener_named(gateway, Some(section)).ok_or_else(|| Error::UnknownListener {
        route: names::route(route),
        gateway: gateway.name_unchecked(),
        section: section.to_string(),
    })?;
    Ok((section, listener))
}

fn secret_data(secret: &Secret, key: &str) -> String {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
        .unwrap_or_default()
}
