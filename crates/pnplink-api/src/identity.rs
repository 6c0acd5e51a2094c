// ── Device identity ──
//
// Everything needed to register with the provisioning service. Loaded once
// by the configuration layer and never mutated afterwards.

use secrecy::SecretString;

/// Public provisioning endpoint used when none is configured.
pub const DEFAULT_PROVISIONING_ENDPOINT: &str = "global.azure-devices-provisioning.net";

/// Symmetric-key device identity.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Model identifier attached to the registration payload.
    pub model_id: String,
    /// Registration id (the device's requested id).
    pub registration_id: String,
    /// Provisioning scope (`0ne...`).
    pub scope_id: String,
    /// Base64 symmetric key.
    pub symmetric_key: SecretString,
    /// Provisioning endpoint host or URL.
    pub provisioning_endpoint: String,
}

impl Identity {
    pub fn new(
        model_id: impl Into<String>,
        registration_id: impl Into<String>,
        scope_id: impl Into<String>,
        symmetric_key: SecretString,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            registration_id: registration_id.into(),
            scope_id: scope_id.into(),
            symmetric_key,
            provisioning_endpoint: DEFAULT_PROVISIONING_ENDPOINT.into(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.provisioning_endpoint = endpoint.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_key() {
        let identity = Identity::new(
            "dtmi:pnplink:gateway;1",
            "gw-01",
            "0ne00000000",
            SecretString::from("c2VjcmV0".to_string()),
        );
        let rendered = format!("{identity:?}");
        assert!(!rendered.contains("c2VjcmV0"));
        assert_eq!(identity.provisioning_endpoint, DEFAULT_PROVISIONING_ENDPOINT);
    }
}
