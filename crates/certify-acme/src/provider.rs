//! [`AcmeProvider`], the entry point callers drive.
//!
//! It picks the legacy, current or offline backend from
//! [`EnvironmentSettings::protocol`] and forwards each step of an issuance run
//! to it. Issued certificates are recorded in the storage root's `index.json`
//! so renewals can be scheduled from [`AcmeProvider::due_for_renewal`].

use crate::current::CurrentProvider;
use crate::legacy::LegacyProvider;
use crate::offline::OfflineProvider;
use crate::storage::CertificateIndex;
use crate::types::{
    AcmeError, AcmeResult, CertificateBundle, ChallengeInstructions, IssuedCertificate,
};
use certify_common::{EnvironmentSettings, ProtocolKind};
use chrono::{Duration, Utc};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Validity assumed for CA-issued certificates (Let's Encrypt issues 90 days)
const CA_CERT_VALIDITY_DAYS: i64 = 90;

/// Protocol implementation behind an [`AcmeProvider`]
pub enum ProviderBackend {
    Legacy(LegacyProvider),
    Current(CurrentProvider),
    Offline(OfflineProvider),
}

/// Certificate issuance for one domain.
///
/// The protocol variant is fixed at construction from
/// [`EnvironmentSettings::protocol`]. A typical run is
/// `init_registration` → `generate_http_challenge` → (caller serves the file)
/// → `validate_challenge` → `download_certificate` → `dispose`.
pub struct AcmeProvider {
    settings: EnvironmentSettings,
    domain: String,
    cancel: CancellationToken,
    storage_path: Option<PathBuf>,
    backend: ProviderBackend,
    disposed: bool,
}

impl AcmeProvider {
    pub fn new(settings: EnvironmentSettings, domain: &str) -> AcmeResult<Self> {
        let cancel = CancellationToken::new();
        let backend = match settings.protocol {
            ProtocolKind::Legacy => ProviderBackend::Legacy(LegacyProvider::new(
                settings.clone(),
                domain,
                cancel.clone(),
            )?),
            ProtocolKind::Current => ProviderBackend::Current(CurrentProvider::new(
                settings.clone(),
                domain,
                cancel.clone(),
            )?),
            ProtocolKind::Offline => ProviderBackend::Offline(OfflineProvider::new(
                settings.clone(),
                domain,
                cancel.clone(),
            )?),
        };

        info!(
            domain = %domain,
            protocol = ?settings.protocol,
            directory = %settings.effective_directory(),
            "ACME provider created"
        );
        Ok(Self {
            settings,
            domain: domain.to_string(),
            cancel,
            storage_path: None,
            backend,
            disposed: false,
        })
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.settings.protocol
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn backend(&self) -> &ProviderBackend {
        &self.backend
    }

    /// Token that aborts the in-flight challenge with [`AcmeError::Aborted`].
    /// Once fired it is replaced by the next `generate_http_challenge`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Creates or loads the account for `email` under `storage_path`.
    /// A second call with the same arguments only reloads.
    pub async fn init_registration<P: AsRef<Path>>(
        &mut self,
        storage_path: P,
        email: &str,
    ) -> AcmeResult<()> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(AcmeError::ConfigError(format!(
                "Invalid account email: {:?}",
                email
            )));
        }
        let storage_path = storage_path.as_ref();
        std::fs::create_dir_all(storage_path)?;

        match &mut self.backend {
            ProviderBackend::Legacy(p) => p.init_registration(storage_path, email).await?,
            ProviderBackend::Current(p) => p.init_registration(storage_path, email).await?,
            ProviderBackend::Offline(p) => p.init_registration(storage_path, email).await?,
        }

        self.storage_path = Some(storage_path.to_path_buf());
        self.disposed = false;
        info!(email = %email, domain = %self.domain, "Account ready");
        Ok(())
    }

    /// Starts a new order for the configured domain
    pub async fn generate_http_challenge(&mut self) -> AcmeResult<ChallengeInstructions> {
        if self.cancel.is_cancelled() {
            debug!(domain = %self.domain, "Previous challenge was cancelled, using a fresh token");
            self.cancel = CancellationToken::new();
            match &mut self.backend {
                ProviderBackend::Legacy(p) => p.set_cancellation(self.cancel.clone()),
                ProviderBackend::Current(p) => p.set_cancellation(self.cancel.clone()),
                ProviderBackend::Offline(p) => p.set_cancellation(self.cancel.clone()),
            }
        }

        let instructions = match &mut self.backend {
            ProviderBackend::Legacy(p) => p.generate_http_challenge().await?,
            ProviderBackend::Current(p) => p.generate_http_challenge().await?,
            ProviderBackend::Offline(p) => p.generate_http_challenge().await?,
        };

        info!(
            domain = %self.domain,
            url = %instructions.challenge_url,
            "Challenge ready to be served"
        );
        Ok(instructions)
    }

    /// True only once the CA reports the challenge valid
    pub async fn validate_challenge(&mut self) -> AcmeResult<bool> {
        let valid = match &mut self.backend {
            ProviderBackend::Legacy(p) => p.validate_challenge().await?,
            ProviderBackend::Current(p) => p.validate_challenge().await?,
            ProviderBackend::Offline(p) => p.validate_challenge().await?,
        };

        if valid {
            info!(domain = %self.domain, "Domain validated");
        } else {
            warn!(domain = %self.domain, "Domain validation failed");
        }
        Ok(valid)
    }

    pub async fn download_certificate<P: AsRef<Path>>(
        &mut self,
        name: &str,
        main_host: &str,
        output_dir: P,
        alternate_hosts: &[String],
    ) -> AcmeResult<CertificateBundle> {
        let output_dir = output_dir.as_ref();
        let bundle = match &mut self.backend {
            ProviderBackend::Legacy(p) => {
                p.download_certificate(name, main_host, output_dir, alternate_hosts)
                    .await?
            }
            ProviderBackend::Current(p) => {
                p.download_certificate(name, main_host, output_dir, alternate_hosts)
                    .await?
            }
            ProviderBackend::Offline(p) => {
                p.download_certificate(name, main_host, output_dir, alternate_hosts)
                    .await?
            }
        };

        let validity_days = match &self.backend {
            ProviderBackend::Offline(p) => p.validity_days() as i64,
            _ => CA_CERT_VALIDITY_DAYS,
        };
        let issued_at = Utc::now();
        let entry = IssuedCertificate {
            name: name.to_string(),
            domain: main_host.to_string(),
            protocol: self.settings.protocol,
            issued_at,
            expires_at: issued_at + Duration::days(validity_days),
            bundle: bundle.clone(),
        };
        if let Err(e) = self.index().record(entry).await {
            warn!(name = %name, error = %e, "Failed to update certificate index");
        }

        Ok(bundle)
    }

    fn index(&self) -> CertificateIndex {
        CertificateIndex::new(
            self.storage_path
                .as_deref()
                .unwrap_or(&self.settings.storage_path),
        )
    }

    pub fn list_certificates(&self) -> AcmeResult<Vec<IssuedCertificate>> {
        self.index().load()
    }

    pub fn certificates_needing_renewal(
        &self,
        threshold_days: u32,
    ) -> AcmeResult<Vec<IssuedCertificate>> {
        self.index().needing_renewal(threshold_days)
    }

    /// Certificates expiring within the configured renewal threshold
    pub fn due_for_renewal(&self) -> AcmeResult<Vec<IssuedCertificate>> {
        self.certificates_needing_renewal(self.settings.renewal_threshold_days)
    }

    /// Releases network clients and any pending challenge; safe to repeat
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        match &mut self.backend {
            ProviderBackend::Legacy(p) => p.dispose(),
            ProviderBackend::Current(p) => p.dispose(),
            ProviderBackend::Offline(p) => p.dispose(),
        }
        self.disposed = true;
        info!(domain = %self.domain, "ACME provider disposed");
    }
}

impl Drop for AcmeProvider {
    fn drop(&mut self) {
        self.dispose();
    }
}
