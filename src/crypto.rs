//! Shared access signature (SAS) tokens derived from the device's symmetric key.
//! Used both for the provisioning service and for the hub session.

use crate::error::{DeviceError, Result};
use base64::{Engine as _, engine::general_purpose};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of generated tokens.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Signs resource URIs with a base64 encoded symmetric key.
#[derive(Clone)]
pub struct SasSigner {
    /// Decoded key bytes
    key: Vec<u8>,
}

impl SasSigner {
    /// Create a signer from the base64 key handed out by the provisioning service.
    pub fn new(symmetric_key: &str) -> Result<Self> {
        let key = general_purpose::STANDARD
            .decode(symmetric_key.trim())
            .map_err(|e| {
                DeviceError::Configuration(format!("symmetric key is not valid base64: {}", e))
            })?;
        if key.is_empty() {
            return Err(DeviceError::Configuration(
                "symmetric key is empty".to_string(),
            ));
        }
        Ok(Self { key })
    }

    /// Build a token for `resource_uri` that expires at `expiry` (unix seconds).
    ///
    /// * `key_name`: policy name sent as `skn`; the provisioning service expects
    ///   `registration`, the hub expects none.
    pub fn token(&self, resource_uri: &str, key_name: Option<&str>, expiry: u64) -> Result<String> {
        let encoded_uri = urlencoding::encode(resource_uri);
        let to_sign = format!("{}\n{}", encoded_uri, expiry);

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| DeviceError::Configuration("symmetric key rejected".to_string()))?;
        mac.update(to_sign.as_bytes());
        let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        let mut token = format!(
            "SharedAccessSignature sr={}&sig={}&se={}",
            encoded_uri,
            urlencoding::encode(&signature),
            expiry
        );
        if let Some(name) = key_name {
            token.push_str("&skn=");
            token.push_str(&urlencoding::encode(name));
        }
        Ok(token)
    }

    /// Token valid for `ttl` from now.
    pub fn token_from_now(
        &self,
        resource_uri: &str,
        key_name: Option<&str>,
        ttl: Duration,
    ) -> Result<String> {
        self.token(resource_uri, key_name, expiry_from_now(ttl))
    }
}

/// Unix time `ttl` from now, in seconds.
pub fn expiry_from_now(ttl: Duration) -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        + ttl.as_secs()
}
