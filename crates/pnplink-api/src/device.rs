//! The seam between the link and the device it represents.
//!
//! A [`DeviceModel`] owns the device state. The session only reads a
//! property snapshot at connect time, forwards desired-property writes, and
//! forwards direct-method invocations.

use std::fmt;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{DispatchError, PropertyError};

/// Deferred side effect of a command, run after the response is on the wire.
pub type PostAction = Box<dyn FnOnce() + Send + 'static>;

/// What a command produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// No such command (or the model returned a falsy result).
    Unknown,
    /// Completed with no payload of its own.
    Succeeded,
    /// Completed with a payload returned verbatim to the caller.
    Data(Value),
}

impl CommandResult {
    /// Classify a loosely-typed result.
    ///
    /// `null`, `false`, `0`, `""`, `[]` and `{}` mean unknown; `true`
    /// means plain success; anything else is data.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Bool(true) => Self::Succeeded,
            v if is_falsy(&v) => Self::Unknown,
            v => Self::Data(v),
        }
    }

    /// `Data` carrying a falsy value collapses to `Unknown`.
    pub(crate) fn normalized(self) -> Self {
        match self {
            Self::Data(v) => Self::from_value(v),
            other => other,
        }
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

/// A command result plus an optional action to run once the response is sent.
pub struct CommandOutcome {
    pub result: CommandResult,
    pub post_action: Option<PostAction>,
}

impl CommandOutcome {
    pub fn unknown() -> Self {
        Self {
            result: CommandResult::Unknown,
            post_action: None,
        }
    }

    pub fn succeeded() -> Self {
        Self {
            result: CommandResult::Succeeded,
            post_action: None,
        }
    }

    pub fn data(value: impl Into<Value>) -> Self {
        Self {
            result: CommandResult::Data(value.into()),
            post_action: None,
        }
    }

    /// Attach an action that runs strictly after the response is transmitted.
    pub fn then(mut self, action: impl FnOnce() + Send + 'static) -> Self {
        self.post_action = Some(Box::new(action));
        self
    }
}

impl fmt::Debug for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandOutcome")
            .field("result", &self.result)
            .field("post_action", &self.post_action.is_some())
            .finish()
    }
}

/// Capabilities of the device behind the link. Supplied by the caller.
#[async_trait]
pub trait DeviceModel: Send + Sync + 'static {
    /// Digital-twin model identifier, e.g. `dtmi:com:example:Gateway;1`.
    fn model_id(&self) -> &str;

    /// Full snapshot of the current reported properties.
    fn props(&self) -> Map<String, Value>;

    /// Apply a desired value and return what was actually stored, which may
    /// be clamped or defaulted.
    fn set_prop(&self, name: &str, value: Value) -> Result<Value, PropertyError>;

    /// Run a named command.
    async fn execute_command(
        &self,
        name: &str,
        payload: Value,
    ) -> Result<CommandOutcome, DispatchError>;
}
