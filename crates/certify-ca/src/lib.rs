//! Certificate generation helpers shared by the ACME providers
//!
//! RSA key generation, self-signed and local-CA certificates, PEM/DER
//! conversion and PKCS#12 bundling.

pub mod ca;
pub mod export;
pub mod keys;
pub mod storage;
pub mod types;

pub use ca::{CertificateAuthority, is_valid_domain, self_signed_certificate};
pub use export::{build_pfx, der_to_pem, pem_to_der_chain};
pub use keys::RsaKey;
pub use storage::{Keystore, LeafFile};
pub use types::{CaError, CaResult, IssuedLeaf, LocalCaSettings};
