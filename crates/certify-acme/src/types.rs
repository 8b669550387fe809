use certify_ca::CaError;
use certify_common::ProtocolKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// What the caller must serve before asking for validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeInstructions {
    /// URL the CA will fetch, `http://{domain}/{challenge_file_path}`
    pub challenge_url: String,
    /// Exact response body expected at that URL
    pub challenge_content: String,
    /// Relative path, `.well-known/acme-challenge/{token}`
    pub challenge_file_path: String,
}

/// Files produced by one certificate download.
///
/// Every path lives in the caller's output directory. A field is `None` when
/// the protocol variant does not produce that artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateBundle {
    pub name: String,
    pub key_pem_file: Option<PathBuf>,
    pub key_gen_file: Option<PathBuf>,
    pub csr_pem_file: Option<PathBuf>,
    pub csr_gen_file: Option<PathBuf>,
    pub crt_der_file: Option<PathBuf>,
    pub crt_pem_file: Option<PathBuf>,
    pub chain_pem_file: Option<PathBuf>,
    pub pfx_pem_file: Option<PathBuf>,
}

impl CertificateBundle {
    /// Produced files, in write order
    pub fn files(&self) -> Vec<&Path> {
        [
            &self.key_gen_file,
            &self.key_pem_file,
            &self.csr_gen_file,
            &self.csr_pem_file,
            &self.crt_der_file,
            &self.crt_pem_file,
            &self.chain_pem_file,
            &self.pfx_pem_file,
        ]
        .into_iter()
        .filter_map(|p| p.as_deref())
        .collect()
    }
}

/// Index entry for a certificate obtained through a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedCertificate {
    pub name: String,
    pub domain: String,
    pub protocol: ProtocolKind,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub bundle: CertificateBundle,
}

impl IssuedCertificate {
    /// Check if certificate needs renewal
    pub fn needs_renewal(&self, threshold_days: u32) -> bool {
        let threshold = chrono::Duration::days(threshold_days as i64);
        self.expires_at - Utc::now() < threshold
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn days_until_expiry(&self) -> i64 {
        (self.expires_at - Utc::now()).num_days()
    }
}

/// Problem document returned by a CA (RFC 7807 shape)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub detail: Option<String>,
    pub status: Option<u16>,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.detail) {
            (Some(kind), Some(detail)) => write!(f, "{}: {}", kind, detail),
            (None, Some(detail)) => write!(f, "{}", detail),
            (Some(kind), None) => write!(f, "{}", kind),
            (None, None) => write!(f, "no problem details"),
        }?;
        if let Some(status) = self.status {
            write!(f, " (status {})", status)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum AcmeError {
    #[error("Account initialization failed: {0}")]
    AccountInitialization(String),

    #[error("Failed to load account from {}: {reason}", .path.display())]
    AccountLoad { path: PathBuf, reason: String },

    #[error("Order creation failed: {0}")]
    OrderCreation(String),

    #[error("No usable authorization: {0}")]
    NoAuthorization(String),

    #[error("Challenge invalid: {0}")]
    ChallengeInvalid(String),

    #[error("Challenge not validated after {attempts} polls")]
    ChallengeTimeout { attempts: u32 },

    #[error("Certificate request rejected (status {status}): {detail}")]
    CertificateRequest { status: u16, detail: String },

    #[error("Unsupported request: {0}")]
    UnsupportedRequest(String),

    #[error("Aborted by caller while {0}")]
    Aborted(&'static str),

    #[error("Invalid key material: {0}")]
    KeyFormat(String),

    #[error("{operation} called before {requires}")]
    OutOfOrder {
        operation: &'static str,
        requires: &'static str,
    },

    #[error("ACME protocol error: {0}")]
    ProtocolError(String),

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Certificate generation error: {0}")]
    Certificate(#[from] CaError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type AcmeResult<T> = Result<T, AcmeError>;
