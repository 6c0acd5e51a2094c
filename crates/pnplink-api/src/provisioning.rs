// Provisioning handshake
//
// Symmetric-key registration against the device provisioning REST service.
// A register PUT starts the operation; while the service reports
// `assigning` we poll the operation resource until it settles. The polls
// complete a single registration and are not retries: a settled status
// other than `assigned` is returned to the caller as-is.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ProvisioningError;
use crate::identity::Identity;
use crate::sas::{self, DEFAULT_TOKEN_TTL_SECS, REGISTRATION_KEY_NAME};
use crate::transport::{TransportConfig, endpoint_url};

pub const API_VERSION: &str = "2021-06-01";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Tuning for the registration round trip.
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    pub transport: TransportConfig,
    /// Upper bound on the whole round trip, operation polls included.
    pub timeout: Duration,
    /// Wait between operation polls when the service sends no `Retry-After`.
    pub poll_interval: Duration,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            timeout: Duration::from_secs(30),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Successful registration: where to connect and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Assigned hub host (or URL for local hubs).
    pub endpoint: String,
    /// Device id finalized by the service.
    pub device_id: String,
}

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    registration_id: &'a str,
    payload: RegisterPayload<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterPayload<'a> {
    model_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationStatus {
    #[serde(default)]
    operation_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    registration_state: Option<RegistrationState>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationState {
    #[serde(default)]
    assigned_hub: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

impl OperationStatus {
    /// Top-level status, falling back to the nested registration status.
    fn status(&self) -> &str {
        self.status
            .as_deref()
            .or_else(|| {
                self.registration_state
                    .as_ref()
                    .and_then(|s| s.status.as_deref())
            })
            .unwrap_or("")
    }

    /// Only `assigning` is in progress; every other status is terminal.
    fn is_pending(&self) -> bool {
        self.status() == "assigning"
    }
}

// ── Client ───────────────────────────────────────────────────────────

/// HTTP client for the provisioning service.
pub struct ProvisioningClient {
    http: reqwest::Client,
    config: ProvisioningConfig,
}

impl ProvisioningClient {
    pub fn new(config: ProvisioningConfig) -> Result<Self, ProvisioningError> {
        let http = config.transport.build_client()?;
        Ok(Self { http, config })
    }

    /// Create a client with a pre-built `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, config: ProvisioningConfig) -> Self {
        Self { http, config }
    }

    /// Register `identity` and return the assigned endpoint and device id.
    ///
    /// Only an `assigned` status is success. The round trip is bounded by
    /// [`ProvisioningConfig::timeout`].
    pub async fn register(&self, identity: &Identity) -> Result<Registration, ProvisioningError> {
        let timeout = self.config.timeout;
        match tokio::time::timeout(timeout, self.register_inner(identity)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    registration_id = %identity.registration_id,
                    timeout_secs = timeout.as_secs(),
                    "provisioning timed out"
                );
                Err(ProvisioningError::Timeout {
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }

    async fn register_inner(&self, identity: &Identity) -> Result<Registration, ProvisioningError> {
        let base = endpoint_url(&identity.provisioning_endpoint, "https")?;
        let registration_path = format!(
            "{}/registrations/{}",
            identity.scope_id, identity.registration_id
        );
        let authorization = sas::generate_sas_token(
            &registration_path,
            &identity.symmetric_key,
            Some(REGISTRATION_KEY_NAME),
            sas::expiry_from_now(DEFAULT_TOKEN_TTL_SECS),
        )
        .map_err(|e| ProvisioningError::InvalidKey(e.to_string()))?;

        let register_url = api_url(&base, &format!("{registration_path}/register"))?;

        let body = RegisterRequest {
            registration_id: &identity.registration_id,
            payload: RegisterPayload {
                model_id: &identity.model_id,
            },
        };

        debug!(url = %register_url, "PUT register");
        let resp = self
            .http
            .put(register_url)
            .header(reqwest::header::AUTHORIZATION, &authorization)
            .json(&body)
            .send()
            .await?;
        let (mut operation, mut retry_after) = parse_operation(resp).await?;

        while operation.is_pending() {
            let Some(operation_id) = operation.operation_id.clone() else {
                break;
            };
            let delay = retry_after.unwrap_or(self.config.poll_interval);
            debug!(operation_id = %operation_id, delay_ms = delay.as_millis() as u64, "registration pending");
            tokio::time::sleep(delay.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)).await;

            let poll_url = api_url(&base, &format!("{registration_path}/operations/{operation_id}"))?;

            debug!(url = %poll_url, "GET operation status");
            let resp = self
                .http
                .get(poll_url)
                .header(reqwest::header::AUTHORIZATION, &authorization)
                .send()
                .await?;
            (operation, retry_after) = parse_operation(resp).await?;
        }

        into_registration(operation, &identity.registration_id)
    }
}

/// Parse an operation response and its `Retry-After` hint.
async fn parse_operation(
    resp: reqwest::Response,
) -> Result<(OperationStatus, Option<Duration>), ProvisioningError> {
    let status = resp.status();
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(ProvisioningError::Unauthorized {
            status: status.as_u16(),
        });
    }

    let body = resp.text().await?;

    if !status.is_success() {
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v["message"].as_str().map(String::from))
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());
        return Err(ProvisioningError::Rejected {
            status: status.as_u16(),
            message,
        });
    }

    let operation: OperationStatus =
        serde_json::from_str(&body).map_err(|e| ProvisioningError::Deserialization {
            message: e.to_string(),
            body: body.clone(),
        })?;
    Ok((operation, retry_after))
}

fn into_registration(
    operation: OperationStatus,
    registration_id: &str,
) -> Result<Registration, ProvisioningError> {
    let status = operation.status().to_string();
    if status != "assigned" {
        let detail = operation
            .registration_state
            .as_ref()
            .and_then(|s| s.error_message.as_deref())
            .unwrap_or("");
        warn!(registration_id, status = %status, detail, "could not provision device");
        return Err(ProvisioningError::NotAssigned { status });
    }

    let state = operation.registration_state.unwrap_or_default();
    match (state.assigned_hub, state.device_id) {
        (Some(endpoint), Some(device_id)) if !endpoint.is_empty() && !device_id.is_empty() => {
            info!(endpoint = %endpoint, device_id = %device_id, "device was assigned");
            Ok(Registration { endpoint, device_id })
        }
        _ => Err(ProvisioningError::NotAssigned {
            status: "assigned without hub or device id".into(),
        }),
    }
}

/// Register `identity` with default tuning.
pub async fn register(identity: &Identity) -> Result<Registration, ProvisioningError> {
    ProvisioningClient::new(ProvisioningConfig::default())?
        .register(identity)
        .await
}

fn api_url(base: &Url, path: &str) -> Result<Url, ProvisioningError> {
    let mut url = base.join(path)?;
    url.query_pairs_mut().append_pair("api-version", API_VERSION);
    Ok(url)
}
