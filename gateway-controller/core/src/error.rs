/// Distinguishes how callers should react to an [`Error`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A referenced object has not been observed yet. Try again later.
    Retryable,
    /// The topology asks for something that cannot or must not be rendered.
    /// Terminal for this operation.
    Policy,
    /// Objects disagree with each other or lack a required field.
    Inconsistent,
    /// The device collaborator or its queue failed.
    Device,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("topology cache has not completed its initial sync")]
    NotSynced,

    #[error("node {node} owning endpoint {address} is not known yet")]
    NodeNotReady { node: String, address: String },

    #[error("node {0} has no address yet")]
    NodeIpUnknown(String),

    #[error("listener {listener}: unsupported protocol {protocol}")]
    UnsupportedProtocol { listener: String, protocol: String },

    #[error("gateway {gateway}: unsupported address type {address_type}")]
    UnsupportedAddressType {
        gateway: String,
        address_type: String,
    },

    #[error("service {service}: unsupported service type {service_type}")]
    UnsupportedServiceType {
        service: String,
        service_type: String,
    },

    #[error("listener {listener}: invalid TLS setting: {reason}")]
    InvalidTls {
        listener: String,
        reason: &'static str,
    },

    #[error("listener {listener}: invalid port {port}")]
    InvalidPort { listener: String, port: i32 },

    #[error("{from} may not refer to {to}")]
    UnauthorizedReference { from: String, to: String },

    #[error("secret {0} does not exist")]
    SecretNotFound(String),

    #[error("certificate reference {0} does not name a Secret")]
    NotSecretType(String),

    #[error("secret {secret} has type {found:?}, expected kubernetes.io/tls")]
    WrongSecretType { secret: String, found: String },

    #[error("route {route}: unsupported filter {filter}")]
    UnsupportedFilter { route: String, filter: String },

    #[error("route {route}: invalid redirect status {status}")]
    InvalidRedirect { route: String, status: i64 },

    #[error("invalid IP address {0:?}")]
    InvalidAddress(String),

    #[error("endpoint address {0} does not name its node")]
    MissingNodeName(String),

    #[error("route {route}: parent reference to {gateway} has no section name")]
    MissingSectionName { route: String, gateway: String },

    #[error("route {route}: gateway {gateway} has no listener {section}")]
    UnknownListener {
        route: String,
        gateway: String,
        section: String,
    },

    #[error("node {node}: {reason}")]
    Fabric { node: String, reason: String },

    #[error("deploy queue is closed")]
    QueueClosed,

    #[error("partition {partition}: deploy failed")]
    Device {
        partition: String,
        #[source]
        source: anyhow::Error,
    },
}

// === impl Error ===

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotSynced | Self::NodeNotReady { .. } | Self::NodeIpUnknown(_) => {
                ErrorKind::Retryable
            }

            Self::UnsupportedProtocol { .. }
            | Self::UnsupportedAddressType { .. }
            | Self::UnsupportedServiceType { .. }
            | Self::InvalidTls { .. }
            | Self::InvalidPort { .. }
            | Self::UnauthorizedReference { .. }
            | Self::SecretNotFound(_)
            | Self::NotSecretType(_)
            | Self::WrongSecretType { .. }
            | Self::UnsupportedFilter { .. }
            | Self::InvalidRedirect { .. } => ErrorKind::Policy,

            Self::InvalidAddress(_)
            | Self::MissingNodeName(_)
            | Self::MissingSectionName { .. }
            | Self::UnknownListener { .. }
            | Self::Fabric { .. } => ErrorKind::Inconsistent,

            Self::QueueClosed | Self::Device { .. } => ErrorKind::Device,
        }
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }
}
