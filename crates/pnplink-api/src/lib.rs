// pnplink-api: device-side client for cloud device hubs.
//
// Symmetric-key provisioning, an authenticated WebSocket session to the
// assigned hub, device-twin property sync, telemetry, and direct-method
// dispatch to a caller-supplied device model.

pub mod client;
pub mod command;
pub mod device;
pub mod error;
pub mod identity;
pub mod link;
pub mod message;
pub mod provisioning;
pub mod sas;
pub mod session;
pub mod telemetry;
pub mod transport;
pub mod twin;

// ── Primary re-exports ──────────────────────────────────────────────
pub use client::{ClientOptions, PnpClient};
pub use command::{CommandDispatcher, CommandResponse, MethodRequest, MethodResponse};
pub use device::{CommandOutcome, CommandResult, DeviceModel, PostAction};
pub use error::{
    ClientError, ConnectionError, CredentialError, DispatchError, PatchError, PropertyError,
    ProvisioningError, SendError,
};
pub use identity::Identity;
pub use link::{ConnectionState, Link, Outbound};
pub use provisioning::{ProvisioningClient, ProvisioningConfig, Registration, register};
pub use session::{Session, SessionConfig, connect};
pub use telemetry::send_telemetry;
pub use transport::{TlsMode, TransportConfig};
pub use twin::{PatchHandler, PropertyAck, PropertyPatch};
