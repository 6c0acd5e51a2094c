// ── Telemetry sender ──
//
// Telemetry is best-effort: a disconnected link skips the send, and a
// credential rejection demotes the link so the caller can re-provision.

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::SendError;
use crate::link::Link;
use crate::message::TelemetryMessage;

/// Send one telemetry document.
///
/// Returns `Ok(true)` once the hub acknowledged it and `Ok(false)` when the
/// link was already down or the hub refused the credentials (the link is
/// then left disconnected). Other failures are returned and leave the link
/// state as is.
pub async fn send_telemetry<T: Serialize + ?Sized>(link: &Link, data: &T) -> Result<bool, SendError> {
    if !link.is_connected() {
        debug!(state = %link.state(), "link down; telemetry skipped");
        return Ok(false);
    }

    let message = TelemetryMessage::json(data)?;
    match link.send_telemetry_message(message).await {
        Ok(()) => {
            debug!("telemetry sent");
            Ok(true)
        }
        Err(SendError::Credential(e)) => {
            warn!(error = %e, "connection has broken; credentials rejected");
            link.demote();
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
