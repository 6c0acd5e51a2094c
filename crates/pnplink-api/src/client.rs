// ── Provision-then-connect facade ──
//
// Ties an identity and a device model together. Every call to
// `auth_and_connect` registers again before opening a fresh session, which
// is how callers recover from a credential failure.

use std::sync::Arc;

use tracing::{debug, info};

use crate::device::DeviceModel;
use crate::error::{ClientError, ProvisioningError};
use crate::identity::Identity;
use crate::provisioning::{ProvisioningClient, ProvisioningConfig, Registration};
use crate::session::{self, Session, SessionConfig};

/// Tuning for both phases.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub provisioning: ProvisioningConfig,
    pub session: SessionConfig,
}

/// Device-side client for one identity and model.
pub struct PnpClient {
    identity: Identity,
    model: Arc<dyn DeviceModel>,
    provisioning: ProvisioningClient,
    session: SessionConfig,
}

impl PnpClient {
    /// Build a client. The model's id wins over the one in `identity`.
    pub fn new(
        mut identity: Identity,
        model: Arc<dyn DeviceModel>,
        options: ClientOptions,
    ) -> Result<Self, ProvisioningError> {
        if identity.model_id != model.model_id() {
            debug!(
                configured = %identity.model_id,
                model = model.model_id(),
                "using the device model's id"
            );
            identity.model_id = model.model_id().to_string();
        }
        let provisioning = ProvisioningClient::new(options.provisioning)?;
        Ok(Self {
            identity,
            model,
            provisioning,
            session: options.session,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Register only.
    pub async fn register(&self) -> Result<Registration, ProvisioningError> {
        self.provisioning.register(&self.identity).await
    }

    /// Register, then open a session on the assigned hub.
    pub async fn auth_and_connect(&self) -> Result<Session, ClientError> {
        let registration = self.register().await?;
        info!(
            registration_id = %self.identity.registration_id,
            endpoint = %registration.endpoint,
            "provisioned; opening session"
        );
        let session = session::connect(
            &self.identity,
            &registration.endpoint,
            &registration.device_id,
            Arc::clone(&self.model),
            &self.session,
        )
        .await?;
        Ok(session)
    }
}
