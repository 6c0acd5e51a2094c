//! CLI error types with miette diagnostics.
//!
//! Maps library and settings errors into user-facing errors with
//! actionable help text and stable exit codes.

use miette::Diagnostic;
use thiserror::Error;

use pnplink_api::{ClientError, ConnectionError, ProvisioningError};
use pnplink_config::ConfigError;

/// Process exit codes. Success is `0`.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Settings ─────────────────────────────────────────────────────

    #[error("Settings are invalid")]
    #[diagnostic(
        code(pnplink::settings),
        help(
            "Check the settings file (default: {default_path}) and PNPLINK_* environment variables.\n\
             Run: pnplink check-config"
        )
    )]
    Settings {
        default_path: String,
        #[source]
        source: ConfigError,
    },

    #[error("No device key configured")]
    #[diagnostic(
        code(pnplink::no_credentials),
        help(
            "Set auth.IOTHUB_DEVICE_DPS_DEVICE_KEY in the settings file,\n\
             export PNPLINK_AUTH__IOTHUB_DEVICE_DPS_DEVICE_KEY,\n\
             or store it in the system keyring under service 'pnplink', user '<device id>/device-key'."
        )
    )]
    NoCredentials {
        #[source]
        source: ConfigError,
    },

    // ── Provisioning ─────────────────────────────────────────────────

    #[error("Device provisioning was refused")]
    #[diagnostic(
        code(pnplink::provisioning_refused),
        help(
            "Verify the ID scope, device id and symmetric key match the enrollment\n\
             on the provisioning service."
        )
    )]
    ProvisioningRefused {
        #[source]
        source: ProvisioningError,
    },

    #[error("Could not reach the provisioning service")]
    #[diagnostic(
        code(pnplink::provisioning_unreachable),
        help("Check network access to IOTHUB_DEVICE_DPS_ENDPOINT.")
    )]
    ProvisioningUnreachable {
        #[source]
        source: ProvisioningError,
    },

    // ── Hub session ──────────────────────────────────────────────────

    #[error("Hub rejected the device credentials")]
    #[diagnostic(
        code(pnplink::hub_auth_failed),
        help("The device was assigned but the hub refused its token. Re-check the device key.")
    )]
    HubAuthFailed {
        #[source]
        source: ConnectionError,
    },

    #[error("Could not open a session with the hub")]
    #[diagnostic(code(pnplink::connection_failed))]
    ConnectionFailed {
        #[source]
        source: ConnectionError,
    },

    // ── Timeout ──────────────────────────────────────────────────────

    #[error("{phase} timed out after {seconds}s")]
    #[diagnostic(
        code(pnplink::timeout),
        help("Raise registration_timeout / connect_timeout in the settings file.")
    )]
    Timeout { phase: &'static str, seconds: u64 },

    // ── IO ───────────────────────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Settings { .. } => exit_code::USAGE,
            Self::NoCredentials { .. }
            | Self::ProvisioningRefused { .. }
            | Self::HubAuthFailed { .. } => exit_code::AUTH,
            Self::ProvisioningUnreachable { .. } | Self::ConnectionFailed { .. } => {
                exit_code::CONNECTION
            }
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Io(_) => exit_code::GENERAL,
        }
    }
}

// ── Library error mapping ────────────────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NoCredentials { .. } => Self::NoCredentials { source: err },
            other => Self::Settings {
                default_path: pnplink_config::settings_path().display().to_string(),
                source: other,
            },
        }
    }
}

impl From<ProvisioningError> for CliError {
    fn from(err: ProvisioningError) -> Self {
        match err {
            ProvisioningError::Timeout { timeout_secs } => Self::Timeout {
                phase: "Provisioning",
                seconds: timeout_secs,
            },
            ProvisioningError::Transport(_) | ProvisioningError::InvalidUrl(_) => {
                Self::ProvisioningUnreachable { source: err }
            }
            other => Self::ProvisioningRefused { source: other },
        }
    }
}

impl From<ConnectionError> for CliError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Timeout { timeout_secs } => Self::Timeout {
                phase: "Hub connection",
                seconds: timeout_secs,
            },
            ConnectionError::Unauthorized { .. } | ConnectionError::InvalidKey(_) => {
                Self::HubAuthFailed { source: err }
            }
            other => Self::ConnectionFailed { source: other },
        }
    }
}

impl From<ClientError> for CliError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Provisioning(e) => e.into(),
            ClientError::Connection(e) => e.into(),
        }
    }
}
