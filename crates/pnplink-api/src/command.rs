//! Direct-method dispatch.
//!
//! Each method request is routed to [`DeviceModel::execute_command`]. The
//! response always goes back to the hub; a post-action attached to the
//! outcome runs only after the response has been written.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::device::{CommandResult, DeviceModel, PostAction};
use crate::error::SendError;
use crate::link::Link;

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const UNKNOWN_METHOD: &str = "unknown method";

/// A direct-method invocation from the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodRequest {
    pub request_id: String,
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

/// Response payload: `{"result": bool, "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub result: bool,
    pub data: Value,
}

/// Status and payload answering one [`MethodRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct MethodResponse {
    pub request_id: String,
    pub status: u16,
    pub payload: CommandResponse,
}

impl MethodResponse {
    pub fn unknown(request: &MethodRequest) -> Self {
        Self {
            request_id: request.request_id.clone(),
            status: STATUS_BAD_REQUEST,
            payload: CommandResponse {
                result: false,
                data: Value::String(UNKNOWN_METHOD.into()),
            },
        }
    }

    pub fn succeeded(request: &MethodRequest, data: Value) -> Self {
        Self {
            request_id: request.request_id.clone(),
            status: STATUS_OK,
            payload: CommandResponse { result: true, data },
        }
    }
}

/// Routes method requests to a device model.
#[derive(Clone)]
pub struct CommandDispatcher {
    model: Arc<dyn DeviceModel>,
}

impl CommandDispatcher {
    pub fn new(model: Arc<dyn DeviceModel>) -> Self {
        Self { model }
    }

    /// Run the command and decide the response.
    ///
    /// The post-action is returned only for a successful command.
    pub async fn dispatch(&self, request: &MethodRequest) -> (MethodResponse, Option<PostAction>) {
        let outcome = match self
            .model
            .execute_command(&request.name, request.payload.clone())
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(method = %request.name, error = %e, "command failed");
                return (MethodResponse::unknown(request), None);
            }
        };

        match outcome.result.normalized() {
            CommandResult::Unknown => {
                debug!(method = %request.name, "unknown method");
                (MethodResponse::unknown(request), None)
            }
            CommandResult::Succeeded => {
                let data = Value::String(format!("{} is succeeded", request.name));
                (MethodResponse::succeeded(request, data), outcome.post_action)
            }
            CommandResult::Data(data) => {
                (MethodResponse::succeeded(request, data), outcome.post_action)
            }
        }
    }

    /// Dispatch, respond, then run any post-action.
    ///
    /// If the response cannot be sent the post-action is dropped.
    pub async fn handle(&self, link: &Link, request: MethodRequest) -> Result<(), SendError> {
        info!(method = %request.name, request_id = %request.request_id, "method request");
        let (response, post_action) = self.dispatch(&request).await;
        let status = response.status;

        if let Err(e) = link.send_method_response(response).await {
            if post_action.is_some() {
                warn!(method = %request.name, "response not sent; skipping post-action");
            }
            return Err(e);
        }
        debug!(method = %request.name, status, "method response sent");

        if let Some(action) = post_action {
            debug!(method = %request.name, "running post-action");
            action();
        }
        Ok(())
    }

    pub(crate) async fn handle_logged(&self, link: &Link, request: MethodRequest) {
        let method = request.name.clone();
        if let Err(e) = self.handle(link, request).await {
            warn!(method = %method, error = %e, "could not answer method request");
        }
    }
}
