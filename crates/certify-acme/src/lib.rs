//! ACME certificate issuance over HTTP-01
//!
//! One [`AcmeProvider`] per domain drives account bootstrap, the challenge
//! exchange and certificate download against a legacy (v1) CA, an RFC 8555
//! CA, or an offline self-signing substitute.

pub mod assembler;
pub mod challenge;
pub mod codec;
mod current;
pub mod jws;
mod legacy;
mod offline;
mod provider;
pub mod storage;
pub mod types;

pub use assembler::{ArtifactAssembler, ArtifactLayout, CsrOutcome, CsrSigner};
pub use challenge::{ChallengeController, ChallengeState, ChallengeStatus, PollPolicy};
pub use codec::{AccountSettings, KeyPairEnvelope, deserialize_key_pair, serialize_key_pair};
pub use current::CurrentProvider;
pub use legacy::{LegacyProvider, LegacyRegistration};
pub use offline::OfflineProvider;
pub use provider::{AcmeProvider, ProviderBackend};
pub use storage::{AccountStore, CertificateIndex, KeyGuard};
pub use types::{
    AcmeError, AcmeResult, CertificateBundle, ChallengeInstructions, IssuedCertificate,
};
