// Shared transport configuration for the provisioning HTTP client and the
// hub WebSocket.
//
// Endpoint strings come from configuration as bare hosts
// (`global.azure-devices-provisioning.net`) or, for local hubs and tests,
// as full URLs (`http://127.0.0.1:8080`). `endpoint_url` normalizes both.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::ProvisioningError;

const USER_AGENT: &str = concat!("pnplink/", env!("CARGO_PKG_VERSION"));

/// TLS verification mode for the provisioning client.
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    /// Use the bundled web PKI roots.
    #[default]
    System,
    /// Additionally trust a CA certificate from the given PEM file.
    CustomCa(PathBuf),
}

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsMode,
    /// Per-request timeout. The whole registration round trip is bounded
    /// separately by the provisioning timeout.
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::System,
            timeout: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, ProvisioningError> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT);

        if let TlsMode::CustomCa(path) = &self.tls {
            let cert_pem = std::fs::read(path).map_err(|e| ProvisioningError::Rejected {
                status: 0,
                message: format!("failed to read CA cert {}: {e}", path.display()),
            })?;
            let cert = reqwest::Certificate::from_pem(&cert_pem)?;
            builder = builder.add_root_certificate(cert);
        }

        Ok(builder.build()?)
    }
}

/// Turn a configured endpoint into a base URL.
///
/// Strings that already carry a scheme are parsed verbatim; bare hosts get
/// `default_scheme`. A trailing slash is always present so that `join`
/// appends instead of replacing the last segment.
pub fn endpoint_url(endpoint: &str, default_scheme: &str) -> Result<Url, url::ParseError> {
    let trimmed = endpoint.trim().trim_end_matches('/');
    let full = if trimmed.contains("://") {
        format!("{trimmed}/")
    } else {
        format!("{default_scheme}://{trimmed}/")
    };
    Url::parse(&full)
}

/// Host (and port) portion of an endpoint, used as the SAS resource prefix.
pub fn endpoint_host(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    trimmed
        .split_once("://")
        .map_or(trimmed, |(_, rest)| rest)
        .to_string()
}
