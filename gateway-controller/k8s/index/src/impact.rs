//! Impact sets: the classes whose rendering may change when an object does.
//!
//! Impact is always computed against the cached state, so callers evaluate
//! the prior object before a mutation and the new object after it, and
//! deploy the union.

use crate::{
    cache::Topology,
    resolve::{classes_of, GATEWAY_KIND, HTTP_ROUTE_KIND},
    ResourceId,
};
use bigip_gateway_controller_core::Result;
use bigip_gateway_controller_k8s_api::{
    gateway::{Gateway, HttpRoute, ReferenceGrant, GROUP},
    ResourceExt,
};
use std::{collections::BTreeSet, sync::Arc};

/// The object whose change is being evaluated.
#[derive(Clone, Copy, Debug)]
pub enum ImpactSource<'a> {
    GatewayClass(&'a str),
    Gateway(&'a Gateway),
    HttpRoute(&'a HttpRoute),
    ReferenceGrant(&'a ReferenceGrant),
    Namespace(&'a str),
    Secret(&'a ResourceId),
    /// A Service or its Endpoints.
    Services(&'a [ResourceId]),
}

impl Topology {
    pub fn impacted_classes(&self, source: ImpactSource<'_>) -> Result<BTreeSet<String>> {
        let classes = match source {
            ImpactSource::GatewayClass(name) => BTreeSet::from([name.to_string()]),
            ImpactSource::Gateway(gateway) => self.gateway_impacted_classes(gateway),
            ImpactSource::HttpRoute(route) => classes_of(&self.gateways_of_route(route)),
            ImpactSource::ReferenceGrant(grant) => self.grant_impacted_classes(grant),
            ImpactSource::Namespace(name) => self.namespace_impacted_classes(name),
            ImpactSource::Secret(id) => classes_of(&self.gateways_using_secret(id)?),
            ImpactSource::Services(ids) => classes_of(&self.root_gateways(ids)),
        };
        Ok(classes)
    }

    /// The gateway's own class and the classes of gateways sharing routes
    /// with it.
    pub fn gateway_impacted_classes(&self, gateway: &Gateway) -> BTreeSet<String> {
        let mut classes = classes_of(&self.neighbor_gateways(gateway));
        classes.insert(gateway.spec.gateway_class_name.clone());
        classes
    }

    /// Classes of gateways in the grant's `from` namespaces, and of gateways
    /// parenting routes in those namespaces.
    pub fn grant_impacted_classes(&self, grant: &ReferenceGrant) -> BTreeSet<String> {
        let mut gateways = Vec::<Arc<Gateway>>::new();
        for from in grant.spec.from.iter().filter(|from| from.group == GROUP) {
            match from.kind.as_str() {
                GATEWAY_KIND => gateways.extend(
                    self.all::<Gateway>()
                        .into_iter()
                        .filter(|gw| gw.namespace().as_deref() == Some(from.namespace.as_str())),
                ),
                HTTP_ROUTE_KIND => {
                    for route in self.all::<HttpRoute>() {
                        if route.namespace().as_deref() == Some(from.namespace.as_str()) {
                            gateways.extend(self.gateways_of_route(&route));
                        }
                    }
                }
                _ => {}
            }
        }
        classes_of(&gateways)
    }

    /// Classes of gateways parenting routes in the namespace. Namespace
    /// labels only affect selector-based attachment of those routes.
    pub fn namespace_impacted_classes(&self, namespace: &str) -> BTreeSet<String> {
        let mut classes = BTreeSet::new();
        for route in self.all::<HttpRoute>() {
            if route.namespace().as_deref() == Some(namespace) {
                classes.extend(classes_of(&self.gateways_of_route(&route)));
            }
        }
        classes
    }
}
