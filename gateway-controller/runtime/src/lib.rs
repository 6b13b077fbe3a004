#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use bigip_gateway_controller_core as core;
pub use bigip_gateway_controller_deploy as deploy;
pub use bigip_gateway_controller_k8s_api as k8s;
pub use bigip_gateway_controller_k8s_index as index;
pub use bigip_gateway_controller_render as render;

mod args;
mod watch;

#[cfg(test)]
mod tests;

pub use self::args::Args;
