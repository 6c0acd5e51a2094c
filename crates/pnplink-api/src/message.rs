// ── Hub wire frames ──
//
// Every frame on the hub link is a JSON text message tagged by `type`.
// Device → hub: `telemetry`, `reportedPatch`, `methodResponse`.
// Hub → device: `ack`, `desiredPatch`, `methodRequest`.
//
// `telemetry` and `reportedPatch` carry a `requestId` that the hub echoes in
// an `ack`. `methodResponse` is fire-and-forget.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::{MethodRequest, MethodResponse};
use crate::error::{CredentialError, SendError};

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const UTF8_ENCODING: &str = "utf-8";

/// Frames the device writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundFrame {
    #[serde(rename_all = "camelCase")]
    Telemetry {
        request_id: String,
        content_type: String,
        content_encoding: String,
        /// Serialized JSON document.
        body: String,
    },
    #[serde(rename_all = "camelCase")]
    ReportedPatch { request_id: String, body: Value },
    #[serde(rename_all = "camelCase")]
    MethodResponse {
        request_id: String,
        status: u16,
        payload: Value,
    },
}

impl OutboundFrame {
    pub fn request_id(&self) -> &str {
        match self {
            Self::Telemetry { request_id, .. }
            | Self::ReportedPatch { request_id, .. }
            | Self::MethodResponse { request_id, .. } => request_id,
        }
    }

    /// Whether the hub acknowledges this frame.
    pub fn expects_ack(&self) -> bool {
        matches!(self, Self::Telemetry { .. } | Self::ReportedPatch { .. })
    }

    pub(crate) fn from_response(response: MethodResponse) -> Result<Self, SendError> {
        Ok(Self::MethodResponse {
            request_id: response.request_id,
            status: response.status,
            payload: serde_json::to_value(response.payload)?,
        })
    }
}

/// Frames the hub writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundFrame {
    #[serde(rename_all = "camelCase")]
    Ack {
        request_id: String,
        status: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    DesiredPatch { body: Value },
    #[serde(rename_all = "camelCase")]
    MethodRequest {
        request_id: String,
        name: String,
        #[serde(default)]
        payload: Value,
    },
}

/// Map an ack status onto the result handed back to the sender.
pub(crate) fn ack_result(status: u16, message: Option<String>) -> Result<(), SendError> {
    match status {
        200..=299 => Ok(()),
        401 | 403 => Err(CredentialError::Rejected { status }.into()),
        _ => Err(SendError::Rejected {
            status,
            message: message.unwrap_or_default(),
        }),
    }
}

/// Hub-initiated work handed from the link to the handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    DesiredPatch(Value),
    MethodRequest(MethodRequest),
}

impl InboundFrame {
    /// Split off hub-initiated work; acks stay with the link.
    pub(crate) fn into_event(self) -> Option<InboundEvent> {
        match self {
            Self::Ack { .. } => None,
            Self::DesiredPatch { body } => Some(InboundEvent::DesiredPatch(body)),
            Self::MethodRequest {
                request_id,
                name,
                payload,
            } => Some(InboundEvent::MethodRequest(MethodRequest {
                request_id,
                name,
                payload,
            })),
        }
    }
}

// ── Telemetry payload ────────────────────────────────────────────────

/// A telemetry document, already serialized and tagged as UTF-8 JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryMessage {
    pub body: String,
    pub content_type: String,
    pub content_encoding: String,
}

impl TelemetryMessage {
    pub fn json<T: Serialize + ?Sized>(data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            body: serde_json::to_string(data)?,
            content_type: JSON_CONTENT_TYPE.into(),
            content_encoding: UTF8_ENCODING.into(),
        })
    }

    pub(crate) fn into_frame(self, request_id: String) -> OutboundFrame {
        OutboundFrame::Telemetry {
            request_id,
            content_type: self.content_type,
            content_encoding: self.content_encoding,
            body: self.body,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn telemetry_frame_shape() {
        let message = TelemetryMessage::json(&json!({"cpu_temp": 41.5})).unwrap();
        let frame = message.into_frame("r-1".into());
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "type": "telemetry",
                "requestId": "r-1",
                "contentType": "application/json",
                "contentEncoding": "utf-8",
                "body": "{\"cpu_temp\":41.5}"
            })
        );
        assert!(frame.expects_ack());
    }

    #[test]
    fn method_response_is_not_acknowledged() {
        let frame = OutboundFrame::MethodResponse {
            request_id: "m-1".into(),
            status: 200,
            payload: json!({}),
        };
        assert!(!frame.expects_ack());
        assert_eq!(frame.request_id(), "m-1");
    }

    #[test]
    fn inbound_frames_parse() {
        let ack: InboundFrame =
            serde_json::from_str(r#"{"type":"ack","requestId":"r-1","status":204}"#).unwrap();
        assert_eq!(
            ack,
            InboundFrame::Ack {
                request_id: "r-1".into(),
                status: 204,
                message: None
            }
        );
        assert_eq!(ack.into_event(), None);

        let call: InboundFrame = serde_json::from_str(
            r#"{"type":"methodRequest","requestId":"m-9","name":"reboot"}"#,
        )
        .unwrap();
        match call.into_event() {
            Some(InboundEvent::MethodRequest(request)) => {
                assert_eq!(request.name, "reboot");
                assert_eq!(request.payload, Value::Null);
            }
            other => panic!("expected method request, got {other:?}"),
        }
    }

    #[test]
    fn unknown_frame_type_is_an_error() {
        assert!(serde_json::from_str::<InboundFrame>(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn ack_status_classification() {
        assert!(ack_result(200, None).is_ok());
        assert!(ack_result(204, None).is_ok());
        assert!(matches!(
            ack_result(401, None),
            Err(SendError::Credential(CredentialError::Rejected { status: 401 }))
        ));
        assert!(ack_result(403, None).unwrap_err().is_credential());
        match ack_result(429, Some("throttled".into())) {
            Err(SendError::Rejected { status, message }) => {
                assert_eq!(status, 429);
                assert_eq!(message, "throttled");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }
}
