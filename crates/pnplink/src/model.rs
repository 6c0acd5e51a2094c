//! Reference gateway device model.
//!
//! Exposes the gateway's own tunables as twin properties, samples the SoC
//! temperature for telemetry, and answers `reboot` and `get_status`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pnplink_api::{CommandOutcome, DeviceModel, DispatchError, PropertyError};
use pnplink_config::Settings;

pub const MODEL_ID: &str = "dtmi:pnplink:gateway;1";
pub const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Linux thermal zone exposing the SoC temperature in millidegrees.
pub const DEFAULT_THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

const PROP_THERMALSENSE_INTERVAL: &str = "thermalsense_interval";
const PROP_SEND_INTERVAL: &str = "send_interval";
const PROP_DISABLE_REBOOT: &str = "disable_reboot";
const PROP_SOFTWARE_VERSION: &str = "software_version";

pub struct GatewayModel {
    model_id: String,
    settings: Arc<Settings>,
    thermal_zone: PathBuf,
    last_temperature: Mutex<Option<f64>>,
    started: Instant,
    restart: CancellationToken,
}

impl GatewayModel {
    /// `restart` is cancelled when a `reboot` command has been answered.
    pub fn new(settings: Arc<Settings>, restart: CancellationToken) -> Self {
        Self {
            model_id: MODEL_ID.into(),
            settings,
            thermal_zone: PathBuf::from(DEFAULT_THERMAL_ZONE),
            last_temperature: Mutex::new(None),
            started: Instant::now(),
            restart,
        }
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn with_thermal_zone(mut self, path: impl Into<PathBuf>) -> Self {
        self.thermal_zone = path.into();
        self
    }

    /// Take a temperature sample. Failures are logged and leave the last
    /// sample in place.
    pub async fn sense(&self) -> Option<f64> {
        match read_celsius(&self.thermal_zone).await {
            Ok(celsius) => {
                debug!(celsius, "temperature sampled");
                *self
                    .last_temperature
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(celsius);
                Some(celsius)
            }
            Err(e) => {
                warn!(path = %self.thermal_zone.display(), error = %e, "temperature read failed");
                None
            }
        }
    }

    pub fn last_temperature(&self) -> Option<f64> {
        *self
            .last_temperature
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Telemetry document for the latest sample.
    pub fn telemetry(&self) -> Option<Value> {
        self.last_temperature().map(|celsius| {
            json!({
                "cpu_temp": celsius,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })
        })
    }

    fn status(&self) -> Value {
        json!({
            "software_version": SOFTWARE_VERSION,
            "uptime_secs": self.started.elapsed().as_secs(),
            "cpu_temp": self.last_temperature(),
            "send_interval": self.settings.send_interval_secs(),
            "thermalsense_interval": self.settings.thermalsense_interval_secs(),
        })
    }
}

#[allow(clippy::cast_precision_loss)]
async fn read_celsius(path: &Path) -> std::io::Result<f64> {
    let raw = tokio::fs::read_to_string(path).await?;
    let milli: i64 = raw
        .trim()
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(milli as f64 / 1000.0)
}

#[async_trait]
impl DeviceModel for GatewayModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn props(&self) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert(
            PROP_THERMALSENSE_INTERVAL.into(),
            json!(self.settings.thermalsense_interval_secs()),
        );
        props.insert(
            PROP_SEND_INTERVAL.into(),
            json!(self.settings.send_interval_secs()),
        );
        props.insert(
            PROP_DISABLE_REBOOT.into(),
            json!(self.settings.disable_reboot()),
        );
        props.insert(PROP_SOFTWARE_VERSION.into(), json!(SOFTWARE_VERSION));
        props
    }

    fn set_prop(&self, name: &str, value: Value) -> Result<Value, PropertyError> {
        match name {
            PROP_THERMALSENSE_INTERVAL => {
                let requested = value.as_i64().ok_or_else(|| PropertyError::InvalidValue {
                    name: name.into(),
                    reason: format!("expected an integer number of seconds, got {value}"),
                })?;
                Ok(json!(self.settings.set_sense_interval(requested)))
            }
            PROP_SEND_INTERVAL | PROP_DISABLE_REBOOT | PROP_SOFTWARE_VERSION => {
                Err(PropertyError::ReadOnly(name.into()))
            }
            other => Err(PropertyError::Unknown(other.into())),
        }
    }

    async fn execute_command(
        &self,
        name: &str,
        _payload: Value,
    ) -> Result<CommandOutcome, DispatchError> {
        match name {
            "reboot" => {
                if self.settings.disable_reboot() {
                    info!("reboot requested but disabled");
                    return Ok(CommandOutcome::data("reboot is disabled"));
                }
                let restart = self.restart.clone();
                Ok(CommandOutcome::succeeded().then(move || {
                    info!("restart requested by hub");
                    restart.cancel();
                }))
            }
            "get_status" => Ok(CommandOutcome::data(self.status())),
            _ => Ok(CommandOutcome::unknown()),
        }
    }
}
