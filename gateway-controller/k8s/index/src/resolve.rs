//! Side-effect-free queries over a [`Topology`].
//!
//! Results are ordered by resource id so that callers rendering them produce
//! the same output for the same topology.

use crate::{
    cache::Topology,
    grants::{can_refer, ObjectRef},
    ResourceId,
};
use bigip_gateway_controller_core::{Error, Result};
use bigip_gateway_controller_k8s_api::{
    gateway::{
        namespace_selector, protocol, terminates_tls, FromNamespaces, Gateway, GatewayClass,
        HttpRoute, HttpRouteFilterType, Listener, ParentReference, SecretObjectReference, GROUP,
    },
    labels::Labels,
    Namespace, ResourceExt, Secret, Service,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

pub const GATEWAY_KIND: &str = "Gateway";
pub const HTTP_ROUTE_KIND: &str = "HTTPRoute";
pub const SERVICE_KIND: &str = "Service";
pub const SECRET_KIND: &str = "Secret";
pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

/// Certificates per listener name, for every listener of a gateway.
pub type ListenerSecrets = BTreeMap<String, Vec<Arc<Secret>>>;

/// Decides whether a listener admits a route of `route_kind` from
/// `route_namespace`.
///
/// A listener without `allowedRoutes.namespaces.from` admits nothing. With no
/// explicit kinds, HTTP and HTTPS listeners admit HTTPRoutes and other
/// protocols admit nothing. Explicit kinds must belong to the Gateway API
/// group.
pub fn route_matches(
    gateway_namespace: &str,
    listener: Option<&Listener>,
    route_namespace: Option<&Namespace>,
    route_kind: &str,
) -> bool {
    let Some(allowed) = listener.and_then(|l| l.allowed_routes.as_ref()) else {
        return false;
    };
    let Some(namespaces) = allowed.namespaces.as_ref() else {
        return false;
    };
    let (Some(from), Some(route_namespace)) = (namespaces.from.as_ref(), route_namespace) else {
        return false;
    };

    let from_matches = match from {
        FromNamespaces::All => true,
        FromNamespaces::Same => route_namespace.metadata.name.as_deref() == Some(gateway_namespace),
        FromNamespaces::Selector => namespaces
            .selector
            .as_ref()
            .and_then(namespace_selector)
            .is_some_and(|selector| {
                selector.matches(&Labels::from(route_namespace.metadata.labels.clone()))
            }),
    };
    if !from_matches {
        return false;
    }

    match allowed.kinds.as_deref() {
        None | Some([]) => match listener.map(|l| l.protocol.as_str()) {
            Some(protocol::HTTP | protocol::HTTPS) => route_kind == HTTP_ROUTE_KIND,
            _ => false,
        },
        Some(kinds) => {
            for kind in kinds {
                if kind.group.as_deref().is_some_and(|group| group != GROUP) {
                    return false;
                }
                if kind.kind == route_kind {
                    return true;
                }
            }
            false
        }
    }
}

/// Finds a listener by section name.
pub fn listener_named<'g>(gateway: &'g Gateway, section: Option<&str>) -> Option<&'g Listener> {
    let section = section?;
    gateway.spec.listeners.iter().find(|l| l.name == section)
}

/// True when a route's parent reference names the gateway.
pub fn parent_targets(parent: &ParentReference, route_namespace: &str, gateway: &Gateway) -> bool {
    if parent.group.as_deref().unwrap_or(GROUP) != GROUP
        || parent.kind.as_deref().unwrap_or(GATEWAY_KIND) != GATEWAY_KIND
    {
        return false;
    }
    let namespace = parent.namespace.as_deref().unwrap_or(route_namespace);
    gateway.metadata.namespace.as_deref().unwrap_or_default() == namespace
        && gateway.metadata.name.as_deref() == Some(parent.name.as_str())
}

/// Services a route names in backend references and ExtensionRef filters,
/// whether or not they exist.
pub fn service_refs(route: &HttpRoute) -> BTreeSet<ResourceId> {
    let route_namespace = route.namespace().unwrap_or_default();
    let mut refs = BTreeSet::new();
    for rule in route.spec.rules.iter().flatten() {
        for backend in rule.backend_refs.iter().flatten() {
            let group = backend.group.as_deref().unwrap_or_default();
            let kind = backend.kind.as_deref().unwrap_or(SERVICE_KIND);
            if !is_core_group(group) || kind != SERVICE_KIND {
                continue;
            }
            let namespace = backend.namespace.as_deref().unwrap_or(&route_namespace);
            refs.insert(ResourceId::new(namespace, &backend.name));
        }
        for filter in rule.filters.iter().flatten() {
            if !matches!(filter.r#type, HttpRouteFilterType::ExtensionRef) {
                continue;
            }
            if let Some(extension_ref) = filter.extension_ref.as_ref() {
                if is_core_group(&extension_ref.group) && extension_ref.kind == SERVICE_KIND {
                    refs.insert(ResourceId::new(&route_namespace, &extension_ref.name));
                }
            }
        }
    }
    refs
}

fn is_core_group(group: &str) -> bool {
    group.is_empty() || group == "core"
}

/// The certificate references of an HTTPS listener; other listeners have
/// none. An HTTPS listener must terminate TLS with at least one certificate.
fn certificate_refs<'l>(
    gateway_id: &ResourceId,
    listener: &'l Listener,
) -> Result<&'l [SecretObjectReference]> {
    if listener.protocol != protocol::HTTPS {
        return Ok(&[]);
    }
    let invalid = |reason| Error::InvalidTls {
        listener: format!("{gateway_id}/{}", listener.name),
        reason,
    };
    let tls = listener
        .tls
        .as_ref()
        .ok_or_else(|| invalid("no TLS configuration"))?;
    if !terminates_tls(tls) {
        return Err(invalid("passthrough is not supported"));
    }
    match tls.certificate_refs.as_deref() {
        Some(refs) if !refs.is_empty() => Ok(refs),
        _ => Err(invalid("no certificate references")),
    }
}

/// The Secret a certificate reference names. References to anything else
/// are errors.
fn certificate_secret(gateway_id: &ResourceId, cert: &SecretObjectReference) -> Result<ResourceId> {
    let namespace = cert
        .namespace
        .as_deref()
        .unwrap_or(&gateway_id.namespace);
    let id = ResourceId::new(namespace, &cert.name);
    let group = cert.group.as_deref().unwrap_or_default();
    if !is_core_group(group) || cert.kind.as_deref().unwrap_or(SECRET_KIND) != SECRET_KIND {
        return Err(Error::NotSecretType(id.to_string()));
    }
    Ok(id)
}

// === impl Topology ===

impl Topology {
    /// Gateways of a class.
    pub fn attached_gateways(&self, class: &str) -> Vec<Arc<Gateway>> {
        self.all::<Gateway>()
            .into_iter()
            .filter(|gw| gw.spec.gateway_class_name == class)
            .collect()
    }

    /// Routes with a parent reference to the gateway that one of its
    /// listeners admits.
    pub fn attached_routes(&self, gateway: &Gateway) -> Vec<Arc<HttpRoute>> {
        self.all::<HttpRoute>()
            .into_iter()
            .filter(|route| self.route_attaches(gateway, route))
            .collect()
    }

    /// Whether the gateway admits the route through at least one parent
    /// reference.
    pub fn route_attaches(&self, gateway: &Gateway, route: &HttpRoute) -> bool {
        let gateway_namespace = gateway.namespace().unwrap_or_default();
        let route_namespace = route.namespace().unwrap_or_default();
        let namespace = self.get::<Namespace>(&ResourceId::cluster(&route_namespace));
        route
            .spec
            .parent_refs
            .iter()
            .flatten()
            .filter(|parent| parent_targets(parent, &route_namespace, gateway))
            .any(|parent| {
                route_matches(
                    &gateway_namespace,
                    listener_named(gateway, parent.section_name.as_deref()),
                    namespace.as_deref(),
                    HTTP_ROUTE_KIND,
                )
            })
    }

    /// Evaluates [`route_matches`] with the route namespace looked up in the
    /// cache.
    pub fn route_matches(
        &self,
        gateway_namespace: &str,
        listener: Option<&Listener>,
        route_namespace: &str,
        route_kind: &str,
    ) -> bool {
        let namespace = self.get::<Namespace>(&ResourceId::cluster(route_namespace));
        route_matches(gateway_namespace, listener, namespace.as_deref(), route_kind)
    }

    /// Existing Services a route references and is permitted to reference.
    pub fn attached_services(&self, route: &HttpRoute) -> Vec<Arc<Service>> {
        let from = ObjectRef::of(route);
        service_refs(route)
            .into_iter()
            .filter_map(|id| self.get::<Service>(&id))
            .filter(|svc| can_refer(&self.grants, &from, &ObjectRef::of(&**svc)))
            .collect()
    }

    /// Keys of every service referenced by a permitted reference from any
    /// route attached to a gateway of an owned class. Services need not
    /// exist yet.
    pub fn attached_service_keys(&self, controller_name: &str) -> Vec<ResourceId> {
        let mut keys = BTreeSet::new();
        for class in self.owned_classes(controller_name) {
            for gateway in self.attached_gateways(&class.name_unchecked()) {
                for route in self.attached_routes(&gateway) {
                    let from = ObjectRef::of(&*route);
                    keys.extend(service_refs(&route).into_iter().filter(|id| {
                        let to = ObjectRef::named::<Service>(&id.namespace, &id.name);
                        can_refer(&self.grants, &from, &to)
                    }));
                }
            }
        }
        keys.into_iter().collect()
    }

    /// Classes naming the controller.
    pub fn owned_classes(&self, controller_name: &str) -> Vec<Arc<GatewayClass>> {
        self.all::<GatewayClass>()
            .into_iter()
            .filter(|class| class.spec.controller_name == controller_name)
            .collect()
    }

    /// Resolves the certificates of every HTTPS listener.
    ///
    /// An HTTPS listener that does not terminate TLS with certificates is an
    /// error, as is a reference to something other than a Secret, a missing
    /// or unpermitted Secret, and a Secret that is not a TLS secret.
    pub fn attached_secrets(&self, gateway: &Gateway) -> Result<ListenerSecrets> {
        let gateway_id = ResourceId::of(gateway).unwrap_or_default();
        let from = ObjectRef::of(gateway);
        let mut secrets = ListenerSecrets::new();
        for listener in &gateway.spec.listeners {
            let certs = secrets.entry(listener.name.clone()).or_default();
            for cert in certificate_refs(&gateway_id, listener)? {
                let id = certificate_secret(&gateway_id, cert)?;
                let secret = self
                    .get::<Secret>(&id)
                    .ok_or_else(|| Error::SecretNotFound(id.to_string()))?;
                let to = ObjectRef::of(&*secret);
                if !can_refer(&self.grants, &from, &to) {
                    return Err(Error::UnauthorizedReference {
                        from: from.to_string(),
                        to: to.to_string(),
                    });
                }
                let found = secret.type_.clone().unwrap_or_default();
                if found != TLS_SECRET_TYPE {
                    return Err(Error::WrongSecretType {
                        secret: id.to_string(),
                        found,
                    });
                }
                certs.push(secret);
            }
        }
        Ok(secrets)
    }

    /// Existing gateways named by a route's parent references.
    pub fn gateways_of_route(&self, route: &HttpRoute) -> Vec<Arc<Gateway>> {
        let route_namespace = route.namespace().unwrap_or_default();
        let ids = route
            .spec
            .parent_refs
            .iter()
            .flatten()
            .filter(|parent| {
                parent.group.as_deref().unwrap_or(GROUP) == GROUP
                    && parent.kind.as_deref().unwrap_or(GATEWAY_KIND) == GATEWAY_KIND
            })
            .map(|parent| {
                let namespace = parent.namespace.as_deref().unwrap_or(&route_namespace);
                ResourceId::new(namespace, &parent.name)
            })
            .collect::<BTreeSet<_>>();
        ids.iter().filter_map(|id| self.get::<Gateway>(id)).collect()
    }

    /// Gateways sharing an attached route with `gateway`, excluding itself.
    pub fn neighbor_gateways(&self, gateway: &Gateway) -> Vec<Arc<Gateway>> {
        let own = ResourceId::of(gateway);
        let mut neighbors = BTreeMap::new();
        for route in self.attached_routes(gateway) {
            for gw in self.gateways_of_route(&route) {
                let id = ResourceId::of(&*gw);
                if id != own {
                    neighbors.insert(id, gw);
                }
            }
        }
        neighbors.into_values().collect()
    }

    /// Routes referencing any of the services.
    pub fn routes_referencing(&self, services: &[ResourceId]) -> Vec<Arc<HttpRoute>> {
        self.all::<HttpRoute>()
            .into_iter()
            .filter(|route| {
                let refs = service_refs(route);
                services.iter().any(|id| refs.contains(id))
            })
            .collect()
    }

    /// Gateways reachable from the services through the routes that
    /// reference them.
    pub fn root_gateways(&self, services: &[ResourceId]) -> Vec<Arc<Gateway>> {
        let mut gateways = BTreeMap::new();
        for route in self.routes_referencing(services) {
            for gw in self.gateways_of_route(&route) {
                gateways.insert(ResourceId::of(&*gw), gw);
            }
        }
        gateways.into_values().collect()
    }

    /// Gateways whose HTTPS listeners reference the secret.
    ///
    /// Listeners are validated as in [`Topology::attached_secrets`]: an HTTPS
    /// listener that does not terminate TLS with certificates, or a
    /// certificate reference to something other than a Secret, is an error.
    pub fn gateways_using_secret(&self, secret: &ResourceId) -> Result<Vec<Arc<Gateway>>> {
        let mut gateways = Vec::new();
        for gateway in self.all::<Gateway>() {
            let gateway_id = ResourceId::of(&*gateway).unwrap_or_default();
            let mut references = false;
            for listener in &gateway.spec.listeners {
                for cert in certificate_refs(&gateway_id, listener)? {
                    let id = certificate_secret(&gateway_id, cert)?;
                    references |= id == *secret;
                }
            }
            if !references {
                continue;
            }
            let from = ObjectRef::of(&*gateway);
            let to = ObjectRef::named::<Secret>(&secret.namespace, &secret.name);
            if !can_refer(&self.grants, &from, &to) {
                return Err(Error::UnauthorizedReference {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            gateways.push(gateway);
        }
        Ok(gateways)
    }
}

/// Distinct class names of the gateways.
pub fn classes_of<'a>(gateways: impl IntoIterator<Item = &'a Arc<Gateway>>) -> BTreeSet<String> {
    gateways
        .into_iter()
        .map(|gw| gw.spec.gateway_class_name.clone())
        .collect()
}
