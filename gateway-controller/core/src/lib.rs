#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod deploy;
mod doc;
mod error;
pub mod plan;

pub use self::{
    deploy::{DeployRequest, DeployStyle, Deployer, PartitionAction},
    doc::{ConfigDoc, Folder, Record},
    error::{Error, ErrorKind, Result},
};

/// The GatewayClass `controllerName` claimed when none is configured.
pub const DEFAULT_CONTROLLER_NAME: &str = "f5.io/gateway-controller-name";

/// The partition holding pools, ARP and node entries shared by every class.
pub const DEFAULT_SERVICES_PARTITION: &str = "cis-c-tenant";
