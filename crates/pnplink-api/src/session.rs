//! Authenticated hub session.
//!
//! [`connect`] opens a WebSocket to `{endpoint}/devices/{device_id}/link`,
//! pushes the model's full property snapshot, and only then starts routing
//! hub-initiated patches and method calls to the model. Work arriving
//! before the initial push completes is queued, not dropped.
//!
//! One IO task owns the socket. It writes queued frames, matches `ack`
//! frames to their waiting senders, and forwards everything else to the
//! event pump, which runs each handler on its own task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::Url;

use crate::command::CommandDispatcher;
use crate::device::DeviceModel;
use crate::error::{ConnectionError, CredentialError, SendError};
use crate::identity::Identity;
use crate::link::{ConnectionState, Link, Outbound};
use crate::message::{InboundEvent, InboundFrame, ack_result};
use crate::sas::{self, DEFAULT_TOKEN_TTL_SECS};
use crate::telemetry;
use crate::transport::{endpoint_host, endpoint_url};
use crate::twin::PatchHandler;

/// Upgrade header carrying the device's model id.
pub const MODEL_ID_HEADER: &str = "x-model-id";

/// Close code the hub uses when the device token has expired.
pub const CLOSE_CREDENTIALS_EXPIRED: u16 = 4401;

/// Bound on sending the close frame to a hub that may have stopped reading.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type AckWaiter = oneshot::Sender<Result<(), SendError>>;

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on the WebSocket handshake.
    pub connect_timeout: Duration,
    /// How long a sender waits for the hub to ack a frame.
    pub ack_timeout: Duration,
    /// Lifetime of the hub SAS token.
    pub token_ttl_secs: i64,
    /// Scheme applied to bare-host endpoints.
    pub default_scheme: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(30),
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            default_scheme: "wss".into(),
        }
    }
}

/// WebSocket URL of a device's link on `endpoint`.
pub fn link_url(
    endpoint: &str,
    device_id: &str,
    default_scheme: &str,
) -> Result<Url, ConnectionError> {
    endpoint_url(endpoint, default_scheme)
        .and_then(|base| base.join(&format!("devices/{device_id}/link")))
        .map_err(|e| ConnectionError::InvalidUrl(e.to_string()))
}

// ── Connect ──────────────────────────────────────────────────────────

/// Open a session for `device_id` on the assigned hub `endpoint`.
///
/// On return the session is connected, the initial reported properties
/// have been acknowledged, and patch and method handlers are live.
pub async fn connect(
    identity: &Identity,
    endpoint: &str,
    device_id: &str,
    model: Arc<dyn DeviceModel>,
    config: &SessionConfig,
) -> Result<Session, ConnectionError> {
    let url = link_url(endpoint, device_id, &config.default_scheme)?;
    let resource = format!("{}/devices/{device_id}", endpoint_host(endpoint));
    let token = sas::generate_sas_token(
        &resource,
        &identity.symmetric_key,
        None,
        sas::expiry_from_now(config.token_ttl_secs),
    )
    .map_err(|e| ConnectionError::InvalidKey(e.to_string()))?;

    let uri: tungstenite::http::Uri = url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| {
            ConnectionError::InvalidUrl(e.to_string())
        })?;
    let request = ClientRequestBuilder::new(uri)
        .with_header("Authorization", token)
        .with_header(MODEL_ID_HEADER, identity.model_id.clone());

    info!(url = %url, device_id, "connecting to hub");
    let handshake = tokio::time::timeout(
        config.connect_timeout,
        tokio_tungstenite::connect_async(request),
    )
    .await;
    let ws = match handshake {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(tungstenite::Error::Http(response)))
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            return Err(ConnectionError::Unauthorized {
                status: response.status().as_u16(),
            });
        }
        Ok(Err(e)) => {
            return Err(ConnectionError::Connect {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            });
        }
        Err(_) => {
            return Err(ConnectionError::Timeout {
                timeout_secs: config.connect_timeout.as_secs(),
            });
        }
    };

    Session::start(ws, endpoint, device_id, model, config.ack_timeout).await
}

// ── Session ──────────────────────────────────────────────────────────

/// A live (or formerly live) hub session.
///
/// Dropping a session without [`shutdown`](Self::shutdown) still closes
/// the socket, but does not wait for in-flight handlers.
pub struct Session {
    link: Link,
    endpoint: String,
    device_id: String,
    cancel: CancellationToken,
    io: Mutex<Option<JoinHandle<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    handlers: TaskTracker,
}

impl Session {
    async fn start<S>(
        ws: WebSocketStream<S>,
        endpoint: &str,
        device_id: &str,
        model: Arc<dyn DeviceModel>,
        ack_timeout: Duration,
    ) -> Result<Self, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (link, outbound_rx) = Link::channel(ack_timeout);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let io = tokio::spawn(run_link(
            ws,
            outbound_rx,
            event_tx,
            link.clone(),
            cancel.clone(),
        ));

        if let Err(e) = link.report_properties(&model.props()).await {
            warn!(error = %e, "initial property report failed");
            cancel.cancel();
            if let Err(join) = io.await {
                warn!(error = %join, "link task failed");
            }
            link.mark_shutdown();
            return Err(ConnectionError::InitialReport(e));
        }

        let handlers = TaskTracker::new();
        let pump = tokio::spawn(pump_events(
            event_rx,
            link.clone(),
            PatchHandler::new(Arc::clone(&model)),
            CommandDispatcher::new(model),
            handlers.clone(),
        ));

        info!(endpoint, device_id, "connected to hub");
        Ok(Self {
            link,
            endpoint: endpoint.to_string(),
            device_id: device_id.to_string(),
            cancel,
            io: Mutex::new(Some(io)),
            pump: Mutex::new(Some(pump)),
            handlers,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.link.subscribe_state()
    }

    /// See [`telemetry::send_telemetry`].
    pub async fn send_telemetry<T: Serialize + ?Sized>(
        &self,
        data: &T,
    ) -> Result<bool, SendError> {
        telemetry::send_telemetry(&self.link, data).await
    }

    /// Close the socket and stop answering the hub. No-op once closed.
    ///
    /// A session demoted by a credential failure still holds its socket
    /// until this (or [`shutdown`](Self::shutdown)) is called.
    pub async fn disconnect(&self) {
        let demoted = self.link.demote();
        let closed = self.close_link().await;
        if demoted || closed {
            info!(device_id = %self.device_id, "disconnected from hub");
        } else {
            debug!(state = %self.link.state(), "disconnect: already closed");
        }
    }

    /// Disconnect if needed, wait for in-flight handlers, and release the
    /// session for good.
    pub async fn shutdown(self) {
        self.disconnect().await;

        let pump = self.pump.lock().await.take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                warn!(error = %e, "event pump failed");
            }
        }
        self.handlers.close();
        self.handlers.wait().await;

        self.link.mark_shutdown();
        info!(device_id = %self.device_id, "session shut down");
    }

    /// Stop the IO task. Returns whether it was still held.
    async fn close_link(&self) -> bool {
        self.cancel.cancel();
        let Some(io) = self.io.lock().await.take() else {
            return false;
        };
        if let Err(e) = io.await {
            warn!(error = %e, "link task failed");
        }
        true
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Event pump ───────────────────────────────────────────────────────

async fn pump_events(
    mut events: mpsc::UnboundedReceiver<InboundEvent>,
    link: Link,
    patches: PatchHandler,
    commands: CommandDispatcher,
    handlers: TaskTracker,
) {
    while let Some(event) = events.recv().await {
        let link = link.clone();
        match event {
            InboundEvent::DesiredPatch(body) => {
                let patches = patches.clone();
                handlers.spawn(async move { patches.handle_raw(&link, body).await });
            }
            InboundEvent::MethodRequest(request) => {
                let commands = commands.clone();
                handlers.spawn(async move { commands.handle_logged(&link, request).await });
            }
        }
    }
    debug!("event pump exiting");
}

// ── IO task ──────────────────────────────────────────────────────────

enum LinkExit {
    Closed,
    Credential(CredentialError),
}

impl LinkExit {
    fn error(&self) -> SendError {
        match self {
            Self::Closed => SendError::Closed,
            Self::Credential(e) => SendError::Credential(e.clone()),
        }
    }
}

async fn run_link<S>(
    ws: WebSocketStream<S>,
    mut outbound: mpsc::Receiver<Outbound>,
    events: mpsc::UnboundedSender<InboundEvent>,
    link: Link,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut write, mut read) = ws.split();
    let mut pending: HashMap<String, AckWaiter> = HashMap::new();
    let write_timeout = link.ack_timeout();

    let exit = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let close = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "disconnect".into(),
                };
                let sent =
                    tokio::time::timeout(CLOSE_GRACE, write.send(Message::Close(Some(close)))).await;
                match sent {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(error = %e, "close frame not sent"),
                    Err(_) => debug!("close frame not sent; hub is not reading"),
                }
                break LinkExit::Closed;
            }
            Some(out) = outbound.recv() => {
                // A hub that stops reading must not wedge cancellation.
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        debug!("write abandoned on disconnect");
                        break LinkExit::Closed;
                    }
                    written = tokio::time::timeout(
                        write_timeout,
                        write_frame(&mut write, out, &mut pending),
                    ) => match written {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(error = %e, "hub link write failed");
                            break LinkExit::Closed;
                        }
                        Err(_) => {
                            warn!(timeout_secs = write_timeout.as_secs(), "hub link write stalled");
                            break LinkExit::Closed;
                        }
                    },
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_text(text.as_str(), &mut pending, &events),
                Some(Ok(Message::Close(frame))) => break close_exit(frame),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "hub link read failed");
                    break LinkExit::Closed;
                }
                None => {
                    info!("hub link ended");
                    break LinkExit::Closed;
                }
            },
        }
    };

    for (_, waiter) in pending.drain() {
        let _ = waiter.send(Err(exit.error()));
    }
    if link.demote() {
        match &exit {
            LinkExit::Credential(e) => warn!(error = %e, "connection has broken"),
            LinkExit::Closed => warn!("connection to hub lost"),
        }
    }
    debug!("link task exiting");
}

async fn write_frame<W>(
    write: &mut W,
    outbound: Outbound,
    pending: &mut HashMap<String, AckWaiter>,
) -> Result<(), tungstenite::Error>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let (frame, done) = outbound.into_parts();
    let text = match serde_json::to_string(&frame) {
        Ok(text) => text,
        Err(e) => {
            let _ = done.send(Err(e.into()));
            return Ok(());
        }
    };

    if let Err(e) = write.send(Message::text(text)).await {
        let _ = done.send(Err(SendError::WebSocket(e.to_string())));
        return Err(e);
    }

    if frame.expects_ack() {
        // Senders that timed out leave closed waiters behind.
        pending.retain(|_, waiter| !waiter.is_closed());
        pending.insert(frame.request_id().to_string(), done);
    } else {
        let _ = done.send(Ok(()));
    }
    Ok(())
}

fn handle_text(
    text: &str,
    pending: &mut HashMap<String, AckWaiter>,
    events: &mpsc::UnboundedSender<InboundEvent>,
) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "ignoring unparseable hub frame");
            return;
        }
    };

    if let InboundFrame::Ack {
        request_id,
        status,
        message,
    } = frame
    {
        match pending.remove(&request_id) {
            Some(waiter) => {
                let _ = waiter.send(ack_result(status, message));
            }
            None => debug!(request_id = %request_id, status, "ack for unknown request"),
        }
        return;
    }

    if let Some(event) = frame.into_event() {
        if events.send(event).is_err() {
            debug!("event pump gone; dropping hub request");
        }
    }
}

fn close_exit(frame: Option<CloseFrame>) -> LinkExit {
    let Some(frame) = frame else {
        info!("hub closed the link");
        return LinkExit::Closed;
    };
    info!(code = %frame.code, reason = %frame.reason, "hub closed the link");
    if u16::from(frame.code) == CLOSE_CREDENTIALS_EXPIRED || frame.code == CloseCode::Policy {
        LinkExit::Credential(CredentialError::Expired {
            reason: frame.reason.to_string(),
        })
    } else {
        LinkExit::Closed
    }
}
