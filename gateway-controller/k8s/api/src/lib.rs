#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod gateway;
pub mod labels;

pub use self::labels::Labels;
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Namespace, Node,
            NodeAddress, NodeCondition, NodeSpec, NodeStatus, Secret, Service, ServicePort,
            ServiceSpec, Taint,
        },
    },
    apimachinery::pkg::apis::meta::v1::Time,
    ByteString,
};
pub use kube::{
    api::{Api, ObjectMeta, ResourceExt},
    runtime::watcher,
    Client, Resource,
};

