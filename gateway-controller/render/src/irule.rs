//! iRule generation.
//!
//! Each route becomes one iRule. Every rule of the route is a branch guarded
//! by its matches; the branch applies request filters and then picks a pool
//! at random, weighted by backend weight. Pool tables are built once in
//! `RULE_INIT`.

use crate::names;
use bigip_gateway_controller_core::{DeployStyle, Error, Result};
use bigip_gateway_controller_k8s_api::{
    gateway::{
        HeaderMatchType, HttpRequestRedirectFilter, HttpRoute, HttpRouteFilterType,
        HttpRouteMatch, PathMatchType, PathModifierType, QueryParamMatchType,
    },
    ResourceExt, Service,
};
use bigip_gateway_controller_k8s_index::{
    can_refer, resolve::SERVICE_KIND, ObjectRef, ReferenceGrantIndex, ResourceId,
};
use std::fmt::Write;

/// Header modifier actions. Request and response modifiers are distinct
/// types with the same fields.
macro_rules! header_actions {
    ($modifier:expr) => {{
        let modifier = $modifier;
        header_actions(
            modifier
                .add
                .iter()
                .flatten()
                .map(|h| (h.name.as_str(), h.value.as_str())),
            modifier.remove.iter().flatten(),
            modifier
                .set
                .iter()
                .flatten()
                .map(|h| (h.name.as_str(), h.value.as_str())),
        )
    }};
}

/// Where a route's pools live.
#[derive(Copy, Clone, Debug)]
pub struct PoolLocation<'a> {
    pub style: DeployStyle,
    pub partition: &'a str,
}

/// Disables the virtual for requests whose Host does not match the
/// listener's hostname, so other rules on the virtual do not fire.
pub fn hostname_rule(hostname: &str) -> String {
    format!(
        r#"when HTTP_REQUEST {{
    if {{ not ([HTTP::host] matches "{hostname}") }} {{
        event HTTP_REQUEST disable
    }}
}}
"#
    )
}

pub fn route_rule(
    route: &HttpRoute,
    grants: &ReferenceGrantIndex,
    pools: PoolLocation<'_>,
) -> Result<String> {
    let route_name = names::route(route);
    let route_namespace = route.namespace().unwrap_or_default();
    let from = ObjectRef::of(route);

    let hostnames = route
        .spec
        .hostnames
        .iter()
        .flatten()
        .map(|host| format!(r#"[HTTP::host] matches "{host}""#))
        .collect::<Vec<_>>();
    let host_condition = or_default(hostnames);

    let mut inits = Vec::new();
    let mut requests = Vec::new();
    let mut responses = Vec::new();
    for (i, rule) in route.spec.rules.iter().flatten().enumerate() {
        let table = format!("{route_name}_{i}").replace(['.', '-'], "_");

        let condition = or_default(
            rule.matches
                .iter()
                .flatten()
                .map(match_condition)
                .collect(),
        );

        let mut actions = Vec::new();
        for filter in rule.filters.iter().flatten() {
            match filter.r#type {
                HttpRouteFilterType::RequestHeaderModifier => {
                    if let Some(modifier) = filter.request_header_modifier.as_ref() {
                        actions.extend(header_actions!(modifier));
                    }
                }
                HttpRouteFilterType::ResponseHeaderModifier => {
                    if let Some(modifier) = filter.response_header_modifier.as_ref() {
                        responses.extend(header_actions!(modifier));
                    }
                }
                HttpRouteFilterType::RequestRedirect => {
                    if let Some(redirect) = filter.request_redirect.as_ref() {
                        actions.push(redirect_action(&route_name, redirect)?);
                    }
                }
                HttpRouteFilterType::ExtensionRef => {
                    let Some(extension_ref) = filter.extension_ref.as_ref() else {
                        continue;
                    };
                    let core = matches!(extension_ref.group.as_str(), "" | "core");
                    if core && extension_ref.kind == SERVICE_KIND {
                        let id = ResourceId::new(&route_namespace, &extension_ref.name);
                        let pool = names::pool_path(pools.style, pools.partition, &id);
                        actions.push(format!("pool {pool}\nreturn"));
                    }
                }
                _ => {
                    return Err(Error::UnsupportedFilter {
                        route: route_name,
                        filter: wire_name(&filter.r#type),
                    })
                }
            }
        }

        let mut weights = Vec::new();
        for backend in rule.backend_refs.iter().flatten() {
            let namespace = backend.namespace.as_deref().unwrap_or(&route_namespace);
            let to = ObjectRef::named::<Service>(namespace, &backend.name);
            if !can_refer(grants, &from, &to) {
                continue;
            }
            let id = ResourceId::new(namespace, &backend.name);
            let pool = names::pool_path(pools.style, pools.partition, &id);
            weights.push(format!("{} {}", pool, backend.weight.unwrap_or(1)));
        }

        if !weights.is_empty() {
            inits.push(pool_table(&table, &weights));
            actions.push(format!(
                "set pool $static::pools_{table}([expr {{int(rand()*$static::pools_{table}_size)}}])\npool $pool\nreturn"
            ));
        }

        let mut branch = String::new();
        let _ = writeln!(branch, "if {{ {condition} }} {{");
        for action in &actions {
            branch.push_str(&indent(action, 1));
        }
        branch.push('}');
        requests.push(branch);
    }

    let mut out = String::new();
    out.push_str("when RULE_INIT {\n");
    for init in &inits {
        out.push_str(&indent(init, 1));
    }
    out.push_str("}\nwhen HTTP_REQUEST {\n");
    let _ = writeln!(out, "    if {{ {host_condition} }} {{");
    for request in &requests {
        out.push_str(&indent(request, 2));
    }
    out.push_str("    }\n}\nwhen HTTP_RESPONSE {\n");
    for response in &responses {
        out.push_str(&indent(response, 1));
    }
    out.push_str("}\n");
    Ok(out)
}

fn match_condition(m: &HttpRouteMatch) -> String {
    let mut conditions = Vec::new();
    if let Some(path) = m.path.as_ref() {
        let value = path.value.as_deref().unwrap_or("/");
        conditions.push(match path.r#type.as_ref() {
            Some(PathMatchType::Exact) => format!(r#"[HTTP::path] eq "{value}""#),
            Some(PathMatchType::RegularExpression) => {
                format!(r#"[HTTP::path] matches "{value}""#)
            }
            _ => format!(r#"[HTTP::path] starts_with "{value}""#),
        });
    }
    for header in m.headers.iter().flatten() {
        let op = match header.r#type.as_ref() {
            Some(HeaderMatchType::RegularExpression) => "matches",
            _ => "eq",
        };
        conditions.push(format!(
            r#"[HTTP::header "{}"] {} "{}""#,
            header.name, op, header.value
        ));
    }
    if let Some(method) = m.method.as_ref() {
        let method = wire_name(method);
        conditions.push(format!(r#"[HTTP::method] eq "{method}""#));
    }
    for param in m.query_params.iter().flatten() {
        let op = match param.r#type.as_ref() {
            Some(QueryParamMatchType::RegularExpression) => "matches",
            _ => "eq",
        };
        conditions.push(format!(
            r#"[URI::query [HTTP::uri] "{}"] {} "{}""#,
            param.name, op, param.value
        ));
    }
    if conditions.is_empty() {
        return "1 eq 1".to_string();
    }
    conditions.join(" and ")
}

fn header_actions<'a>(
    add: impl Iterator<Item = (&'a str, &'a str)>,
    remove: impl Iterator<Item = &'a String>,
    set: impl Iterator<Item = (&'a str, &'a str)>,
) -> Vec<String> {
    let mut actions = Vec::new();
    for (name, value) in add {
        actions.push(format!("HTTP::header insert {name} {value}"));
    }
    for name in remove {
        actions.push(format!("HTTP::header remove {name}"));
    }
    for (name, value) in set {
        actions.push(format!("HTTP::header replace {name} {value}"));
    }
    actions
}

fn redirect_action(route: &str, redirect: &HttpRequestRedirectFilter) -> Result<String> {
    let status = redirect.status_code.map(i64::from).unwrap_or(302);
    if status != 301 && status != 302 {
        return Err(Error::InvalidRedirect {
            route: route.to_string(),
            status,
        });
    }

    let scheme = redirect
        .scheme
        .as_ref()
        .map(wire_name)
        .unwrap_or_else(|| "http".to_string());
    let host = redirect
        .hostname
        .clone()
        .unwrap_or_else(|| "[HTTP::host]".to_string());
    let uri = redirect
        .path
        .as_ref()
        .filter(|path| matches!(path.r#type, PathModifierType::ReplaceFullPath))
        .and_then(|path| path.replace_full_path.clone())
        .unwrap_or_else(|| "[HTTP::uri]".to_string());
    let port = redirect
        .port
        .map(|port| port.to_string())
        .unwrap_or_else(|| "[TCP::local_port]".to_string());

    Ok(format!(
        r#"set rscheme "{scheme}"
set rhostname "{host}"
set ruri "{uri}"
set rport {port}
set url $rscheme://$rhostname:$rport$ruri
HTTP::respond {status} Location $url
return"#
    ))
}

/// Expands weights into a table with one slot per unit of weight, so a
/// uniform pick over slots is a weighted pick over pools.
fn pool_table(table: &str, weights: &[String]) -> String {
    format!(
        r#"array unset weights *
array unset static::pools_{table} *
set index 0
array set weights {{ {weights} }}
foreach name [array names weights] {{
    for {{ set i 0 }} {{ $i < $weights($name) }} {{ incr i }} {{
        set static::pools_{table}($index) $name
        incr index
    }}
}}
set static::pools_{table}_size [array size static::pools_{table}]"#,
        weights = weights.join(" "),
    )
}

/// The value an API enum takes on the wire, such as `GET` or `https`.
fn wire_name<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(name)) => name,
        _ => String::new(),
    }
}

fn or_default(conditions: Vec<String>) -> String {
    if conditions.is_empty() {
        return "1 eq 1".to_string();
    }
    conditions.join(" or ")
}

fn indent(text: &str, depth: usize) -> String {
    let pad = "    ".repeat(depth);
    let mut out = String::new();
    for line in text.lines() {
        if line.is_empty() {
            out.push('\n');
        } else {
            let _ = writeln!(out, "{pad}{line}");
        }
    }
    out
}
