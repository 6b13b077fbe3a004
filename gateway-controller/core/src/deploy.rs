use crate::ConfigDoc;
use anyhow::{anyhow, Error};

/// A before/after pair of documents for one partition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeployRequest {
    /// Describes the event that caused the request.
    pub meta: String,
    pub from: ConfigDoc,
    pub to: ConfigDoc,
    pub partition: String,
    pub action: Option<PartitionAction>,
}

/// Asks the deployer to create or tear down the partition itself.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PartitionAction {
    Create,
    Delete,
}

/// Selects how snapshots are shaped for the device.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum DeployStyle {
    /// One record per device object, applied imperatively.
    #[default]
    Rest,
    /// One declaration per partition, applied in bulk.
    As3,
}

/// Applies deploy requests to the device.
///
/// Implementations own the wire protocol, including any timeout or retry
/// policy. Each request is delivered once.
#[async_trait::async_trait]
pub trait Deployer: Send + Sync + 'static {
    async fn deploy(&self, request: &DeployRequest) -> anyhow::Result<()>;
}

// === impl DeployRequest ===

impl DeployRequest {
    /// True when applying the request cannot change device state.
    pub fn is_noop(&self) -> bool {
        self.action.is_none() && self.from == self.to
    }
}

// === impl DeployStyle ===

impl std::str::FromStr for DeployStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "rest" => Ok(Self::Rest),
            "as3" => Ok(Self::As3),
            s => Err(anyhow!("invalid deploy style: {:?}", s)),
        }
    }
}

impl std::fmt::Display for DeployStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rest => "rest".fmt(f),
            Self::As3 => "as3".fmt(f),
        }
    }
}
