//! Shared access signature tokens.
//!
//! Both the provisioning service and the hub authenticate symmetric-key
//! devices with the same token shape:
//!
//! ```text
//! SharedAccessSignature sr={resource}&sig={signature}&se={expiry}[&skn={key name}]
//! ```
//!
//! where `signature = base64(HMAC-SHA256(base64decode(key), "{resource}\n{expiry}"))`
//! and `resource` is form-urlencoded before signing.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;
use url::form_urlencoded;

type HmacSha256 = Hmac<Sha256>;

/// Default token lifetime.
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

/// Key name the provisioning service expects for individual enrollments.
pub const REGISTRATION_KEY_NAME: &str = "registration";

/// The symmetric key could not be used for signing.
#[derive(Debug, Error)]
pub enum SasError {
    #[error("key is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("key rejected by HMAC: {0}")]
    Key(String),
}

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Sign `resource` with a base64 symmetric key, valid until `expiry`
/// (seconds since the Unix epoch).
pub fn generate_sas_token(
    resource: &str,
    key: &SecretString,
    key_name: Option<&str>,
    expiry: i64,
) -> Result<String, SasError> {
    let key_bytes = BASE64.decode(key.expose_secret().trim())?;
    let encoded_resource = encode(resource);
    let to_sign = format!("{encoded_resource}\n{expiry}");

    let mut mac =
        HmacSha256::new_from_slice(&key_bytes).map_err(|e| SasError::Key(e.to_string()))?;
    mac.update(to_sign.as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());

    let mut token = format!(
        "SharedAccessSignature sr={encoded_resource}&sig={}&se={expiry}",
        encode(&signature)
    );
    if let Some(name) = key_name {
        token.push_str("&skn=");
        token.push_str(&encode(name));
    }
    Ok(token)
}

/// Expiry timestamp `ttl_secs` from now.
pub fn expiry_from_now(ttl_secs: i64) -> i64 {
    chrono::Utc::now().timestamp() + ttl_secs
}
