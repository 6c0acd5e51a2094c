//! Handle onto the hub link.
//!
//! A [`Link`] is what handlers and the telemetry sender hold. It queues
//! frames for the IO task that owns the socket and carries the session's
//! [`ConnectionState`]. Cloning is cheap; every clone observes and mutates
//! the same state.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::command::MethodResponse;
use crate::error::SendError;
use crate::message::{OutboundFrame, TelemetryMessage};

/// Queue depth between handles and the IO task.
pub const OUTBOUND_CAPACITY: usize = 64;

/// Lifecycle of a session.
///
/// `Connected` → `Disconnected` on a credential failure, transport loss or
/// [`disconnect`](crate::Session::disconnect). `Shutdown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Shutdown,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => f.write_str("connected"),
            Self::Disconnected => f.write_str("disconnected"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// A frame waiting for the IO task, with the slot its outcome goes to.
#[derive(Debug)]
pub struct Outbound {
    pub frame: OutboundFrame,
    done: oneshot::Sender<Result<(), SendError>>,
}

impl Outbound {
    /// Report the transmit (or ack) outcome back to the sender.
    pub fn complete(self, result: Result<(), SendError>) {
        // The sender may have timed out and gone away.
        let _ = self.done.send(result);
    }

    pub(crate) fn into_parts(self) -> (OutboundFrame, oneshot::Sender<Result<(), SendError>>) {
        (self.frame, self.done)
    }
}

/// Cloneable handle for writing to the hub.
#[derive(Debug, Clone)]
pub struct Link {
    outbound: mpsc::Sender<Outbound>,
    state: Arc<watch::Sender<ConnectionState>>,
    ack_timeout: Duration,
}

impl Link {
    /// A connected link plus the receiving end of its frame queue.
    ///
    /// The session feeds the receiver into its IO task; tests can drive it
    /// directly and answer each [`Outbound`] themselves.
    pub fn channel(ack_timeout: Duration) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Connected);
        let link = Self {
            outbound,
            state: Arc::new(state),
            ack_timeout,
        };
        (link, rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// `Connected` → `Disconnected`. Returns whether this call made the change.
    pub(crate) fn demote(&self) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        if changed {
            debug!("link state -> disconnected");
        }
        changed
    }

    pub(crate) fn mark_shutdown(&self) {
        self.state.send_replace(ConnectionState::Shutdown);
    }

    // ── Sends ────────────────────────────────────────────────────────

    /// Send one telemetry message and wait for the hub's ack.
    pub async fn send_telemetry_message(&self, message: TelemetryMessage) -> Result<(), SendError> {
        self.transmit(message.into_frame(new_request_id())).await
    }

    /// Send a reported-property patch and wait for the hub's ack.
    pub async fn report_properties<T: Serialize + ?Sized>(&self, body: &T) -> Result<(), SendError> {
        let body = serde_json::to_value(body)?;
        self.transmit(OutboundFrame::ReportedPatch {
            request_id: new_request_id(),
            body,
        })
        .await
    }

    /// Send a direct-method response. Resolves once it is written.
    pub async fn send_method_response(&self, response: MethodResponse) -> Result<(), SendError> {
        self.transmit(OutboundFrame::from_response(response)?).await
    }

    pub(crate) fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// Queue `frame` and wait for its outcome. Queueing and the wait share
    /// one `ack_timeout` budget.
    async fn transmit(&self, frame: OutboundFrame) -> Result<(), SendError> {
        let (done, rx) = oneshot::channel();
        let delivery = async {
            self.outbound
                .send(Outbound { frame, done })
                .await
                .map_err(|_| SendError::Closed)?;
            rx.await.unwrap_or(Err(SendError::Closed))
        };

        tokio::time::timeout(self.ack_timeout, delivery)
            .await
            .unwrap_or(Err(SendError::Timeout {
                timeout_secs: self.ack_timeout.as_secs(),
            }))
    }
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn report_properties_round_trips_through_queue() {
        let (link, mut rx) = Link::channel(Duration::from_secs(5));
        let hub = tokio::spawn(async move {
            let outbound = rx.recv().await.unwrap();
            let body = match &outbound.frame {
                OutboundFrame::ReportedPatch { body, .. } => body.clone(),
                other => panic!("unexpected frame {other:?}"),
            };
            outbound.complete(Ok(()));
            body
        });

        link.report_properties(&json!({"send_interval": 30}))
            .await
            .unwrap();
        assert_eq!(hub.await.unwrap(), json!({"send_interval": 30}));
    }

    #[tokio::test]
    async fn dropped_queue_is_closed() {
        let (link, rx) = Link::channel(Duration::from_secs(5));
        drop(rx);
        assert!(matches!(
            link.report_properties(&json!({})).await,
            Err(SendError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_times_out() {
        let (link, mut rx) = Link::channel(Duration::from_secs(3));
        let _keep = tokio::spawn(async move {
            // Hold the frame without answering.
            let outbound = rx.recv().await;
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(outbound);
        });

        let message = TelemetryMessage::json(&json!({"t": 1})).unwrap();
        assert!(matches!(
            link.send_telemetry_message(message).await,
            Err(SendError::Timeout { timeout_secs: 3 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_times_out() {
        let (link, _rx) = Link::channel(Duration::from_secs(3));
        for i in 0..OUTBOUND_CAPACITY {
            let (done, _) = oneshot::channel();
            let frame = TelemetryMessage::json(&json!({}))
                .unwrap()
                .into_frame(format!("queued-{i}"));
            link.outbound.try_send(Outbound { frame, done }).unwrap();
        }

        let message = TelemetryMessage::json(&json!({"t": 1})).unwrap();
        assert!(matches!(
            link.send_telemetry_message(message).await,
            Err(SendError::Timeout { timeout_secs: 3 })
        ));
    }

    #[test]
    fn demote_only_from_connected() {
        let (link, _rx) = Link::channel(Duration::from_secs(1));
        let observer = link.clone();
        assert!(link.demote());
        assert!(!observer.is_connected());
        assert!(!link.demote());

        link.mark_shutdown();
        assert!(!link.demote());
        assert_eq!(observer.state(), ConnectionState::Shutdown);
    }
}
