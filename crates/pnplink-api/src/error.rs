use thiserror::Error;

/// Failure of the provisioning round trip.
///
/// Always fatal to the attempt. Nothing here is retried internally; the
/// caller decides whether to register again.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// The service answered, but with a status other than `assigned`.
    #[error("Device was not assigned (status: {status})")]
    NotAssigned { status: String },

    /// The registration credentials were refused.
    #[error("Provisioning service rejected the device credentials (HTTP {status})")]
    Unauthorized { status: u16 },

    /// Any other non-success HTTP answer.
    #[error("Provisioning request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The symmetric key is not valid base64.
    #[error("Invalid symmetric key: {0}")]
    InvalidKey(String),

    /// Connection refused, DNS failure, TLS failure, etc.
    #[error("Provisioning transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid provisioning endpoint: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The registration round trip (including operation polls) took too long.
    #[error("Provisioning timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// Response body did not match the registration result shape.
    #[error("Could not parse provisioning response: {message}")]
    Deserialization { message: String, body: String },
}

/// Failure to establish a session with the assigned hub.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// WebSocket handshake failed.
    #[error("Could not connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("Invalid hub endpoint: {0}")]
    InvalidUrl(String),

    #[error("Invalid symmetric key: {0}")]
    InvalidKey(String),

    /// The hub refused the WebSocket upgrade for auth reasons.
    #[error("Hub rejected the device credentials (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("Connecting to the hub timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// Transport opened but the initial reported-state push failed.
    #[error("Initial property report failed: {0}")]
    InitialReport(#[source] SendError),
}

/// Auth expired or invalid on an established session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("Hub rejected the device credentials (status {status})")]
    Rejected { status: u16 },

    #[error("Hub closed the session: credentials expired ({reason})")]
    Expired { reason: String },
}

/// Failure to hand a frame to the hub.
#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// The hub acknowledged with a non-success status.
    #[error("Hub rejected message (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("No acknowledgment from hub within {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// The link task is gone (disconnect, shutdown, or dropped socket).
    #[error("Session link is closed")]
    Closed,

    #[error("WebSocket write failed: {0}")]
    WebSocket(String),

    #[error("Could not serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SendError {
    /// Returns `true` if re-provisioning might resolve this failure.
    pub fn is_credential(&self) -> bool {
        matches!(self, Self::Credential(_))
    }
}

/// The device model could not execute a command.
#[derive(Debug, Error)]
#[error("Command '{command}' failed: {message}")]
pub struct DispatchError {
    pub command: String,
    pub message: String,
}

impl DispatchError {
    pub fn new(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            message: message.into(),
        }
    }
}

/// The device model refused a desired-property value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PropertyError {
    #[error("Unknown property: {0}")]
    Unknown(String),

    #[error("Property '{0}' is read-only")]
    ReadOnly(String),

    #[error("Invalid value for '{name}': {reason}")]
    InvalidValue { name: String, reason: String },
}

/// A desired-property patch that cannot be acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("desired-property patch is not a JSON object")]
    NotAnObject,

    #[error("desired-property patch has no integer $version")]
    MissingVersion,
}

/// Error from [`PnpClient::auth_and_connect`](crate::PnpClient::auth_and_connect).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl ClientError {
    /// Returns `true` if this is a timeout from either phase.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Provisioning(ProvisioningError::Timeout { .. })
                | Self::Connection(ConnectionError::Timeout { .. })
        )
    }

    /// Returns `true` if the credentials were refused.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::Provisioning(
                ProvisioningError::Unauthorized { .. } | ProvisioningError::InvalidKey(_)
            ) | Self::Connection(
                ConnectionError::Unauthorized { .. } | ConnectionError::InvalidKey(_)
            )
        )
    }
}
