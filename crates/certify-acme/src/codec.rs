//! Textual forms of key material persisted with ACME accounts
//!
//! Key pairs travel as `{"PublicKey": "<base64 SPKI DER>", "PrivateKey":
//! "<base64 PKCS#8 DER>"}`. Current-protocol accounts use
//! `{"Key": "<base64 DER>", "ServiceUri": ..., "AccountEmail": ...}`.

use crate::types::{AcmeError, AcmeResult};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use certify_ca::RsaKey;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyPairEnvelope {
    pub public_key: String,
    pub private_key: String,
}

/// Encodes both halves of `key` as base64 DER inside the JSON envelope
pub fn serialize_key_pair(key: &RsaKey) -> AcmeResult<String> {
    let envelope = KeyPairEnvelope {
        public_key: STANDARD.encode(key.public_key_der()),
        private_key: STANDARD.encode(key.private_key_der()),
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Inverse of [`serialize_key_pair`]
pub fn deserialize_key_pair(text: &str) -> AcmeResult<RsaKey> {
    let envelope: KeyPairEnvelope = serde_json::from_str(text)
        .map_err(|e| AcmeError::KeyFormat(format!("Malformed key envelope: {}", e)))?;

    let public = STANDARD
        .decode(envelope.public_key.trim())
        .map_err(|e| AcmeError::KeyFormat(format!("PublicKey is not base64: {}", e)))?;
    let private = STANDARD
        .decode(envelope.private_key.trim())
        .map_err(|e| AcmeError::KeyFormat(format!("PrivateKey is not base64: {}", e)))?;

    RsaKey::from_der_parts(&private, &public).map_err(|e| AcmeError::KeyFormat(e.to_string()))
}

/// Persisted current-protocol account configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccountSettings {
    /// Base64 PKCS#8 DER of the account key
    pub key: String,
    pub service_uri: String,
    pub account_email: String,
    /// Account URL assigned by the CA
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_url: Option<String>,
}

impl AccountSettings {
    pub fn new(key_der: &[u8], service_uri: &str, account_email: &str) -> Self {
        Self {
            key: STANDARD.encode(key_der),
            service_uri: service_uri.to_string(),
            account_email: account_email.to_string(),
            account_url: None,
        }
    }

    pub fn key_der(&self) -> AcmeResult<Vec<u8>> {
        STANDARD
            .decode(self.key.trim())
            .map_err(|e| AcmeError::KeyFormat(format!("Account key is not base64: {}", e)))
    }
}
