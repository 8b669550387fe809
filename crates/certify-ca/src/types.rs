use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Settings for the local signing authority
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalCaSettings {
    pub keystore_dir: PathBuf,
    /// Subject O= for the root and every leaf
    pub organization: String,
    pub root_name: String,
    pub root_validity_days: u32,
    pub leaf_validity_days: u32,
    /// RSA modulus size, root and leaves alike
    pub key_bits: u32,
}

impl Default for LocalCaSettings {
    fn default() -> Self {
        Self {
            keystore_dir: PathBuf::from("/var/lib/certify/ca"),
            organization: "Certify".to_string(),
            root_name: "Certify Local Root".to_string(),
            root_validity_days: 3650,
            leaf_validity_days: 365,
            key_bits: 2048,
        }
    }
}

/// Index entry for a leaf signed by the local root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuedLeaf {
    pub id: String,
    pub domains: Vec<String>,
    pub serial: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl IssuedLeaf {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn days_remaining(&self) -> i64 {
        (self.expires_at - Utc::now()).num_days()
    }
}

#[derive(Error, Debug)]
pub enum CaError {
    #[error("Local CA has no root yet")]
    Uninitialized,

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("No issued leaf with id {0}")]
    UnknownLeaf(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Parse error: {0}")]
    ParsingError(String),

    #[error("PKCS#12 error: {0}")]
    Pkcs12(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Keystore index error: {0}")]
    Index(#[from] serde_json::Error),
}

pub type CaResult<T> = Result<T, CaError>;
