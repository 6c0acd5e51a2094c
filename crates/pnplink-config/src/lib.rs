//! Settings for the pnplink gateway.
//!
//! A settings file (TOML, or JSON when the extension says so) layered under
//! `PNPLINK_` environment variables, validated into [`Settings`]. The device
//! key may live in the system keyring instead of the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Json, Toml},
    value::Value as RawValue,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use pnplink_api::identity::DEFAULT_PROVISIONING_ENDPOINT;
use pnplink_api::{ClientOptions, Identity, ProvisioningConfig, SessionConfig};

pub const ENV_PREFIX: &str = "PNPLINK_";
pub const KEYRING_SERVICE: &str = "pnplink";

pub const DEFAULT_SEND_INTERVAL: u64 = 30;
pub const DEFAULT_THERMALSENSE_INTERVAL: u64 = 5;
pub const DEFAULT_TIMEOUT: u64 = 30;

const KEY_SCOPE: &str = "auth.IOTHUB_DEVICE_DPS_ID_SCOPE";
const KEY_DEVICE_ID: &str = "auth.IOTHUB_DEVICE_DPS_DEVICE_ID";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("missing required setting {key}")]
    Missing { key: &'static str },

    #[error("no device key for '{registration_id}' in settings or keyring")]
    NoCredentials { registration_id: String },

    #[error("settings file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to serialize settings: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("settings loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── File shape ──────────────────────────────────────────────────────

/// The `auth` table. Keys keep their upper-case names; the lower-case
/// aliases are what environment variables turn into.
#[derive(Debug, Default, Deserialize)]
pub struct AuthSection {
    #[serde(
        rename = "IOTHUB_DEVICE_DPS_ENDPOINT",
        alias = "iothub_device_dps_endpoint",
        default
    )]
    pub endpoint: Option<String>,

    #[serde(
        rename = "IOTHUB_DEVICE_DPS_ID_SCOPE",
        alias = "iothub_device_dps_id_scope",
        default
    )]
    pub id_scope: Option<String>,

    #[serde(
        rename = "IOTHUB_DEVICE_DPS_DEVICE_ID",
        alias = "iothub_device_dps_device_id",
        default
    )]
    pub device_id: Option<String>,

    #[serde(
        rename = "IOTHUB_DEVICE_DPS_DEVICE_KEY",
        alias = "iothub_device_dps_device_key",
        default
    )]
    pub device_key: Option<String>,
}

/// Settings as read, before validation.
#[derive(Debug, Deserialize)]
pub struct RawSettings {
    #[serde(default)]
    pub auth: Option<AuthSection>,

    #[serde(default = "default_send_interval")]
    pub send_interval: i64,

    #[serde(default = "default_thermalsense_interval")]
    pub thermalsense_interval: i64,

    #[serde(default)]
    pub disable_reboot: bool,

    #[serde(default = "default_timeout")]
    pub registration_timeout: i64,

    #[serde(default = "default_timeout")]
    pub connect_timeout: i64,

    #[serde(default = "default_timeout")]
    pub ack_timeout: i64,

    /// Anything else. Warned about, then ignored.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, RawValue>,
}

#[allow(clippy::cast_possible_wrap)]
fn default_send_interval() -> i64 {
    DEFAULT_SEND_INTERVAL as i64
}
#[allow(clippy::cast_possible_wrap)]
fn default_thermalsense_interval() -> i64 {
    DEFAULT_THERMALSENSE_INTERVAL as i64
}
#[allow(clippy::cast_possible_wrap)]
fn default_timeout() -> i64 {
    DEFAULT_TIMEOUT as i64
}

// ── Settings path ───────────────────────────────────────────────────

/// Default settings file, via platform conventions.
pub fn settings_path() -> PathBuf {
    ProjectDirs::from("", "", "pnplink").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("pnplink");
            p.push("settings.toml");
            p
        },
        |dirs| dirs.config_dir().join("settings.toml"),
    )
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// File layer plus environment overrides.
pub fn figment_for(path: &Path) -> Figment {
    let file = if is_json(path) {
        Figment::from(Json::file(path))
    } else {
        Figment::from(Toml::file(path))
    };
    file.merge(Env::prefixed(ENV_PREFIX).split("__").ignore(&["config", "model_id"]))
}

// ── Settings ────────────────────────────────────────────────────────

/// Validated settings.
///
/// `thermalsense_interval` is the only value that changes after load
/// (a writable device property), so it is atomic and the rest is plain.
#[derive(Debug)]
pub struct Settings {
    provisioning_endpoint: String,
    scope_id: String,
    registration_id: String,
    device_key: SecretString,
    send_interval: u64,
    thermalsense_interval: AtomicU64,
    disable_reboot: bool,
    registration_timeout: u64,
    connect_timeout: u64,
    ack_timeout: u64,
    source: Option<PathBuf>,
}

impl Settings {
    /// Load from `path`, or from [`settings_path`] when `None`.
    ///
    /// An explicit path must exist. The default path may be absent, in
    /// which case everything comes from the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) if !p.exists() => {
                return Err(ConfigError::NotFound {
                    path: p.to_path_buf(),
                });
            }
            Some(p) => p.to_path_buf(),
            None => settings_path(),
        };
        debug!(path = %path.display(), "loading settings");

        let raw: RawSettings = figment_for(&path).extract()?;
        let source = path.exists().then_some(path);
        Self::from_raw(raw, source)
    }

    pub fn from_raw(raw: RawSettings, source: Option<PathBuf>) -> Result<Self, ConfigError> {
        for key in raw.unknown.keys() {
            warn!(key = %key, "ignoring unknown setting");
        }

        let auth = raw.auth.unwrap_or_default();
        let provisioning_endpoint = non_empty(auth.endpoint)
            .unwrap_or_else(|| DEFAULT_PROVISIONING_ENDPOINT.to_string());
        let scope_id = non_empty(auth.id_scope).ok_or(ConfigError::Missing { key: KEY_SCOPE })?;
        let registration_id =
            non_empty(auth.device_id).ok_or(ConfigError::Missing { key: KEY_DEVICE_ID })?;

        let device_key = match non_empty(auth.device_key) {
            Some(key) => SecretString::from(key),
            None => keyring_device_key(&registration_id)?,
        };

        Ok(Self {
            provisioning_endpoint,
            scope_id,
            registration_id,
            device_key,
            send_interval: interval("send_interval", raw.send_interval, DEFAULT_SEND_INTERVAL)?,
            thermalsense_interval: AtomicU64::new(interval(
                "thermalsense_interval",
                raw.thermalsense_interval,
                DEFAULT_THERMALSENSE_INTERVAL,
            )?),
            disable_reboot: raw.disable_reboot,
            registration_timeout: timeout("registration_timeout", raw.registration_timeout)?,
            connect_timeout: timeout("connect_timeout", raw.connect_timeout)?,
            ack_timeout: timeout("ack_timeout", raw.ack_timeout)?,
            source,
        })
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn provisioning_endpoint(&self) -> &str {
        &self.provisioning_endpoint
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn registration_id(&self) -> &str {
        &self.registration_id
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_secs(self.send_interval)
    }

    pub fn thermalsense_interval(&self) -> Duration {
        Duration::from_secs(self.thermalsense_interval_secs())
    }

    pub fn thermalsense_interval_secs(&self) -> u64 {
        self.thermalsense_interval.load(Ordering::Relaxed)
    }

    pub fn send_interval_secs(&self) -> u64 {
        self.send_interval
    }

    pub fn disable_reboot(&self) -> bool {
        self.disable_reboot
    }

    /// File the settings came from, if one existed.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Change the sampling interval. Values `<= 0` keep the current one.
    /// Returns the interval now in effect.
    pub fn set_sense_interval(&self, value: i64) -> u64 {
        let current = self.thermalsense_interval_secs();
        let Ok(new) = u64::try_from(value) else {
            return current;
        };
        if new == 0 {
            return current;
        }
        let old = self.thermalsense_interval.swap(new, Ordering::Relaxed);
        if old != new {
            info!(old, new, "thermalsense interval changed");
        }
        new
    }

    // ── Translation ──────────────────────────────────────────────────

    pub fn identity(&self, model_id: &str) -> Identity {
        Identity::new(
            model_id,
            self.registration_id.clone(),
            self.scope_id.clone(),
            self.device_key.clone(),
        )
        .with_endpoint(self.provisioning_endpoint.clone())
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            provisioning: ProvisioningConfig {
                timeout: Duration::from_secs(self.registration_timeout),
                ..ProvisioningConfig::default()
            },
            session: SessionConfig {
                connect_timeout: Duration::from_secs(self.connect_timeout),
                ack_timeout: Duration::from_secs(self.ack_timeout),
                ..SessionConfig::default()
            },
        }
    }

    /// Effective settings as TOML, with the key redacted.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let effective = Effective {
            auth: EffectiveAuth {
                endpoint: &self.provisioning_endpoint,
                id_scope: &self.scope_id,
                device_id: &self.registration_id,
                device_key: "<redacted>",
            },
            send_interval: self.send_interval,
            thermalsense_interval: self.thermalsense_interval_secs(),
            disable_reboot: self.disable_reboot,
            registration_timeout: self.registration_timeout,
            connect_timeout: self.connect_timeout,
            ack_timeout: self.ack_timeout,
        };
        Ok(toml::to_string_pretty(&effective)?)
    }
}

#[derive(Serialize)]
struct Effective<'a> {
    send_interval: u64,
    thermalsense_interval: u64,
    disable_reboot: bool,
    registration_timeout: u64,
    connect_timeout: u64,
    ack_timeout: u64,
    auth: EffectiveAuth<'a>,
}

#[derive(Serialize)]
struct EffectiveAuth<'a> {
    #[serde(rename = "IOTHUB_DEVICE_DPS_ENDPOINT")]
    endpoint: &'a str,
    #[serde(rename = "IOTHUB_DEVICE_DPS_ID_SCOPE")]
    id_scope: &'a str,
    #[serde(rename = "IOTHUB_DEVICE_DPS_DEVICE_ID")]
    device_id: &'a str,
    #[serde(rename = "IOTHUB_DEVICE_DPS_DEVICE_KEY")]
    device_key: &'a str,
}

// ── Validation helpers ──────────────────────────────────────────────

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `0` falls back to `default` with a warning; negative is an error.
fn interval(field: &str, value: i64, default: u64) -> Result<u64, ConfigError> {
    match u64::try_from(value) {
        Ok(0) => {
            warn!(field, default, "interval is 0; using default");
            Ok(default)
        }
        Ok(secs) => Ok(secs),
        Err(_) => Err(ConfigError::Validation {
            field: field.into(),
            reason: format!("must not be negative, got {value}"),
        }),
    }
}

fn timeout(field: &str, value: i64) -> Result<u64, ConfigError> {
    match u64::try_from(value) {
        Ok(secs) if secs > 0 => Ok(secs),
        _ => Err(ConfigError::Validation {
            field: field.into(),
            reason: format!("must be a positive number of seconds, got {value}"),
        }),
    }
}

fn keyring_device_key(registration_id: &str) -> Result<SecretString, ConfigError> {
    let user = format!("{registration_id}/device-key");
    match keyring::Entry::new(KEYRING_SERVICE, &user).and_then(|entry| entry.get_password()) {
        Ok(secret) if !secret.trim().is_empty() => {
            debug!(registration_id, "device key loaded from keyring");
            Ok(SecretString::from(secret))
        }
        Ok(_) => Err(ConfigError::NoCredentials {
            registration_id: registration_id.into(),
        }),
        Err(e) => {
            debug!(registration_id, error = %e, "no device key in keyring");
            Err(ConfigError::NoCredentials {
                registration_id: registration_id.into(),
            })
        }
    }
}
