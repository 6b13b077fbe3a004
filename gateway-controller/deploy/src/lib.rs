//! Delivers configuration changes to the device.
//!
//! ```text
//!   watch event ──► DeployPipeline ──► bounded queue ──► Controller ──► Deployer
//!                   (render, mutate,                     (one request
//!                    render, diff)                        at a time)
//! ```

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod controller;
mod metrics;
mod pipeline;
mod plan;


pub use self::{
    controller::{Controller, DeployReport},
    metrics::DeployMetrics,
    pipeline::{DeployPipeline, Impact},
    plan::PlanDeployer,
};
