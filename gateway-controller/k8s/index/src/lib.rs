//! BIG-IP Gateway Controller topology index
//!
//! The controller watches the following cluster resources and holds the latest version of each in
//! a single [`TopologyCache`]:
//!
//! - A `GatewayClass` names the controller that renders it. Each class owned by this controller is
//!   rendered into its own device partition.
//! - A `Gateway` belongs to a class and declares listeners. Each listener declares which routes it
//!   admits, by namespace and by kind.
//! - An `HTTPRoute` names its parent gateways (and, optionally, one of their listeners) and
//!   references the `Service`s that back it.
//! - A `ReferenceGrant` authorizes references into its own namespace from another namespace.
//! - `Secret`s hold listener certificates; `Service`s and `Endpoints` provide pool members;
//!   `Namespace` labels feed listener route selectors.
//!
//! ```text
//! [ GatewayClass ] <- [ Gateway ] <- [ HTTPRoute ] -> [ Service ] <- [ Endpoints ]
//!                         |               ^               ^
//!                         v               |               |
//!                    [ Secret ]    [ Namespace ]   [ ReferenceGrant ]
//! ```
//!
//! Every kind lives behind one lock so that resolution, which follows references across kinds,
//! observes a single consistent state. Node fabric addresses are held separately in a
//! [`NodeFabricCache`] since they are only consulted when resolving pool members.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cache;
pub mod grants;
mod impact;
pub mod metrics;
pub mod node;
pub mod resolve;
mod resource_id;


pub use self::{
    cache::{SharedCache, Store, Topology, TopologyCache, TopologyKind},
    grants::{can_refer, GrantFrom, GrantTo, ObjectRef, ReferenceGrantIndex},
    impact::ImpactSource,
    node::{Fabric, NodeFabric, NodeFabricCache, SharedNodes},
    resolve::{classes_of, route_matches, service_refs, ListenerSecrets},
    resource_id::ResourceId,
};
