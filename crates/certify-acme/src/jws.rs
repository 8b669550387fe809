//! RS256 JSON Web Signatures for the legacy protocol, plus the JWK
//! thumbprint every protocol variant needs for key authorizations.

use crate::types::{AcmeError, AcmeResult};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use certify_ca::RsaKey;
use ring::digest::{SHA256, digest};
use ring::rand::SystemRandom;
use ring::signature::{RSA_PKCS1_SHA256, RsaKeyPair};
use serde::Serialize;

/// RSA public JWK; members are declared in lexicographic order so that the
/// compact serialization is the RFC 7638 thumbprint input
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Jwk {
    pub e: String,
    pub kty: &'static str,
    pub n: String,
}

impl Jwk {
    pub fn from_key(key: &RsaKey) -> AcmeResult<Self> {
        Ok(Self {
            e: b64url(&key.public_exponent()?),
            kty: "RSA",
            n: b64url(&key.modulus()?),
        })
    }

    /// base64url(SHA-256(compact JWK))
    pub fn thumbprint(&self) -> AcmeResult<String> {
        let canonical = serde_json::to_string(self)?;
        Ok(b64url(digest(&SHA256, canonical.as_bytes()).as_ref()))
    }
}

/// Flattened JWS JSON serialization
#[derive(Debug, Clone, Serialize)]
pub struct JwsEnvelope {
    pub header: serde_json::Value,
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

#[derive(Serialize)]
struct ProtectedHeader<'a> {
    alg: &'static str,
    jwk: &'a Jwk,
    nonce: &'a str,
    url: &'a str,
}

/// `{token}.{thumbprint}`
pub fn key_authorization(token: &str, thumbprint: &str) -> String {
    format!("{}.{}", token, thumbprint)
}

pub fn b64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Signs `payload` for `url` with the account key, embedding the JWK
pub fn sign<T: Serialize>(
    key: &RsaKey,
    jwk: &Jwk,
    nonce: &str,
    url: &str,
    payload: &T,
) -> AcmeResult<JwsEnvelope> {
    let protected = b64url(&serde_json::to_vec(&ProtectedHeader {
        alg: "RS256",
        jwk,
        nonce,
        url,
    })?);
    let payload = b64url(&serde_json::to_vec(payload)?);
    let signing_input = format!("{}.{}", protected, payload);

    let key_pair = RsaKeyPair::from_pkcs8(key.private_key_der())
        .map_err(|e| AcmeError::KeyFormat(format!("Account key rejected for signing: {}", e)))?;
    let mut signature = vec![0u8; key_pair.public().modulus_len()];
    key_pair
        .sign(
            &RSA_PKCS1_SHA256,
            &SystemRandom::new(),
            signing_input.as_bytes(),
            &mut signature,
        )
        .map_err(|_| AcmeError::KeyFormat("RS256 signing failed".to_string()))?;

    Ok(JwsEnvelope {
        header: serde_json::json!({ "alg": "RS256", "jwk": jwk }),
        protected,
        payload,
        signature: b64url(&signature),
    })
}
