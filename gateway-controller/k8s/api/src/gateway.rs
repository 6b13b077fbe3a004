//! The Kubernetes Gateway API resources the controller consumes.
//!
//! Types come from the standard channel of the `gateway-api` crate. Several
//! are re-exported under the names the Gateway API documentation uses for
//! them. The helpers below apply the API's defaults for unset fields.

use crate::labels::{Expression, Selector};
pub use gateway_api::apis::standard::{
    gatewayclasses::{GatewayClass, GatewayClassSpec},
    gateways::{
        Gateway, GatewayAddresses as GatewayAddress,
        GatewayListeners as Listener, GatewayListenersAllowedRoutes as AllowedRoutes,
        GatewayListenersAllowedRoutesKinds as RouteGroupKind,
        GatewayListenersAllowedRoutesNamespaces as RouteNamespaces,
        GatewayListenersAllowedRoutesNamespacesFrom as FromNamespaces,
        GatewayListenersAllowedRoutesNamespacesSelector as NamespaceSelector,
        GatewayListenersTls as GatewayTlsConfig,
        GatewayListenersTlsCertificateRefs as SecretObjectReference,
        GatewayListenersTlsMode as TlsMode, GatewaySpec,
    },
    httproutes::{
        HTTPRoute as HttpRoute, HTTPRouteParentRefs as ParentReference,
        HTTPRouteRules as HttpRouteRule, HTTPRouteRulesBackendRefs as BackendRef,
        HTTPRouteRulesFilters as HttpRouteFilter,
        HTTPRouteRulesFiltersExtensionRef as LocalObjectReference,
        HTTPRouteRulesFiltersRequestRedirect as HttpRequestRedirectFilter,
        HTTPRouteRulesFiltersRequestRedirectPathType as PathModifierType,
        HTTPRouteRulesFiltersType as HttpRouteFilterType,
        HTTPRouteRulesMatches as HttpRouteMatch,
        HTTPRouteRulesMatchesHeadersType as HeaderMatchType,
        HTTPRouteRulesMatchesPathType as PathMatchType,
        HTTPRouteRulesMatchesQueryParamsType as QueryParamMatchType, HTTPRouteSpec as HttpRouteSpec,
    },
    referencegrants::{ReferenceGrant, ReferenceGrantFrom, ReferenceGrantSpec, ReferenceGrantTo},
};

pub const GROUP: &str = "gateway.networking.k8s.io";

pub const IP_ADDRESS_TYPE: &str = "IPAddress";

/// Listener protocols as they appear on the wire.
pub mod protocol {
    pub const HTTP: &str = "HTTP";
    pub const HTTPS: &str = "HTTPS";
    pub const TLS: &str = "TLS";
    pub const TCP: &str = "TCP";
    pub const UDP: &str = "UDP";
}

/// Whether the listener terminates TLS. The mode defaults to `Terminate`.
pub fn terminates_tls(tls: &GatewayTlsConfig) -> bool {
    !matches!(tls.mode, Some(TlsMode::Passthrough))
}

/// The address type, `IPAddress` when unset.
pub fn address_type(address: &GatewayAddress) -> &str {
    address.r#type.as_deref().unwrap_or(IP_ADDRESS_TYPE)
}

/// Converts a listener's namespace selector. Fails when an expression uses an
/// operator that cannot be evaluated, in which case no namespace matches.
pub fn namespace_selector(selector: &NamespaceSelector) -> Option<Selector> {
    let match_expressions = selector
        .match_expressions
        .iter()
        .flatten()
        .map(|expr| {
            let operator = expr.operator.parse().ok()?;
            Some(Expression::new(
                expr.key.clone(),
                operator,
                expr.values.iter().flatten().cloned(),
            ))
        })
        .collect::<Option<Vec<_>>>()?;
    Some(Selector::new(
        selector.match_labels.clone().unwrap_or_default(),
        match_expressions,
    ))
}
