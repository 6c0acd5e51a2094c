//! Desired-property patches.
//!
//! Each patch carries a `$version` and a set of property writes. Every
//! non-reserved entry is applied through [`DeviceModel::set_prop`] and
//! acknowledged in a single reported-property update.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::device::DeviceModel;
use crate::error::{PatchError, SendError};
use crate::link::Link;

/// Patch keys that carry metadata rather than property writes.
pub const RESERVED_KEYS: [&str; 3] = ["$version", "__t", "$metadata"];

pub const ACK_SUCCESS: u16 = 200;
pub const ACK_REJECTED: u16 = 400;
pub const ACK_SUCCESS_DESCRIPTION: &str = "Successfully executed patch";

/// A parsed desired-property patch.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyPatch {
    pub version: i64,
    /// Property writes, reserved keys removed.
    pub entries: Map<String, Value>,
}

impl PropertyPatch {
    pub fn from_value(value: Value) -> Result<Self, PatchError> {
        let Value::Object(mut body) = value else {
            return Err(PatchError::NotAnObject);
        };
        let version = body
            .get("$version")
            .and_then(Value::as_i64)
            .ok_or(PatchError::MissingVersion)?;
        for key in RESERVED_KEYS {
            body.remove(key);
        }
        Ok(Self {
            version,
            entries: body,
        })
    }
}

/// Acknowledgment entry for one property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyAck {
    /// Status code.
    pub ac: u16,
    /// Description.
    pub ad: String,
    /// Patch version being acknowledged.
    pub av: i64,
    pub value: Value,
}

impl PropertyAck {
    pub fn success(version: i64, value: Value) -> Self {
        Self {
            ac: ACK_SUCCESS,
            ad: ACK_SUCCESS_DESCRIPTION.into(),
            av: version,
            value,
        }
    }
}

/// Applies desired-property patches to a device model.
#[derive(Clone)]
pub struct PatchHandler {
    model: Arc<dyn DeviceModel>,
}

impl PatchHandler {
    pub fn new(model: Arc<dyn DeviceModel>) -> Self {
        Self { model }
    }

    /// Apply every entry and build the acknowledgment map.
    ///
    /// A property the model refuses is acknowledged with `ac: 400`, the
    /// error text, and the model's current value for it.
    pub fn apply(&self, patch: PropertyPatch) -> BTreeMap<String, PropertyAck> {
        let version = patch.version;
        let mut acks = BTreeMap::new();
        let mut snapshot: Option<Map<String, Value>> = None;

        for (name, value) in patch.entries {
            let ack = match self.model.set_prop(&name, value) {
                Ok(stored) => PropertyAck::success(version, stored),
                Err(e) => {
                    warn!(property = %name, error = %e, version, "desired property rejected");
                    let current = snapshot
                        .get_or_insert_with(|| self.model.props())
                        .get(&name)
                        .cloned()
                        .unwrap_or(Value::Null);
                    PropertyAck {
                        ac: ACK_REJECTED,
                        ad: e.to_string(),
                        av: version,
                        value: current,
                    }
                }
            };
            acks.insert(name, ack);
        }
        acks
    }

    /// Apply `patch` and report the acknowledgments in one update.
    ///
    /// The update is sent even when the patch held only reserved keys.
    pub async fn handle(&self, link: &Link, patch: PropertyPatch) -> Result<(), SendError> {
        let version = patch.version;
        let acks = self.apply(patch);
        debug!(version, properties = acks.len(), "acknowledging desired properties");
        link.report_properties(&acks).await
    }

    /// Entry point for raw patch bodies off the wire.
    pub(crate) async fn handle_raw(&self, link: &Link, body: Value) {
        let patch = match PropertyPatch::from_value(body) {
            Ok(patch) => patch,
            Err(e) => {
                warn!(error = %e, "dropping desired-property patch");
                return;
            }
        };
        if let Err(e) = self.handle(link, patch).await {
            warn!(error = %e, "could not report property acknowledgments");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::device::CommandOutcome;
    use crate::error::{DispatchError, PropertyError};

    struct Thermostat {
        target: Mutex<i64>,
    }

    #[async_trait]
    impl DeviceModel for Thermostat {
        fn model_id(&self) -> &str {
            "dtmi:test:thermostat;1"
        }

        fn props(&self) -> Map<String, Value> {
            let mut props = Map::new();
            props.insert("target".into(), json!(*self.target.lock().unwrap()));
            props.insert("serial".into(), json!("T-100"));
            props
        }

        fn set_prop(&self, name: &str, value: Value) -> Result<Value, PropertyError> {
            match name {
                "target" => {
                    let v = value.as_i64().ok_or_else(|| PropertyError::InvalidValue {
                        name: name.into(),
                        reason: "expected an integer".into(),
                    })?;
                    let clamped = v.clamp(5, 30);
                    *self.target.lock().unwrap() = clamped;
                    Ok(json!(clamped))
                }
                "serial" => Err(PropertyError::ReadOnly(name.into())),
                other => Err(PropertyError::Unknown(other.into())),
            }
        }

        async fn execute_command(
            &self,
            _name: &str,
            _payload: Value,
        ) -> Result<CommandOutcome, DispatchError> {
            Ok(CommandOutcome::unknown())
        }
    }

    fn handler() -> PatchHandler {
        PatchHandler::new(Arc::new(Thermostat {
            target: Mutex::new(20),
        }))
    }

    #[test]
    fn reserved_keys_are_stripped() {
        let patch = PropertyPatch::from_value(json!({
            "$version": 7,
            "__t": "c",
            "$metadata": {},
            "target": 22
        }))
        .unwrap();
        assert_eq!(patch.version, 7);
        assert_eq!(patch.entries.keys().collect::<Vec<_>>(), vec!["target"]);
    }

    #[test]
    fn patch_without_version_is_refused() {
        assert_eq!(
            PropertyPatch::from_value(json!({"target": 1})),
            Err(PatchError::MissingVersion)
        );
        assert_eq!(
            PropertyPatch::from_value(json!({"$version": "3"})),
            Err(PatchError::MissingVersion)
        );
        assert_eq!(
            PropertyPatch::from_value(json!([1, 2])),
            Err(PatchError::NotAnObject)
        );
    }

    #[test]
    fn accepted_values_echo_what_was_stored() {
        let acks = handler().apply(PropertyPatch::from_value(json!({"$version": 3, "target": 99})).unwrap());
        assert_eq!(acks["target"], PropertyAck::success(3, json!(30)));
    }

    #[test]
    fn refused_values_report_current_state() {
        let acks = handler().apply(
            PropertyPatch::from_value(json!({
                "$version": 4,
                "target": "warm",
                "serial": "X",
                "color": "red"
            }))
            .unwrap(),
        );

        assert_eq!(acks.len(), 3);
        assert_eq!(acks["target"].ac, ACK_REJECTED);
        assert_eq!(acks["target"].value, json!(20));
        assert_eq!(acks["serial"].ad, "Property 'serial' is read-only");
        assert_eq!(acks["serial"].value, json!("T-100"));
        assert_eq!(acks["color"].value, Value::Null);
        assert!(acks.values().all(|ack| ack.av == 4));
    }

    #[test]
    fn ack_wire_shape() {
        let ack = PropertyAck::success(2, json!(10));
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"ac": 200, "ad": "Successfully executed patch", "av": 2, "value": 10})
        );
    }
}
