//! Provider without a CA
//!
//! Hands out a locally generated token, validates by fetching the served
//! challenge file over HTTP and issues self-signed certificates. Lets callers
//! exercise their challenge-serving wiring end to end.

use crate::assembler::{
    ArtifactAssembler, ArtifactLayout, CertificateRequest, CsrOutcome, CsrSigner,
};
use crate::challenge::{
    AuthorizationView, Challenge, ChallengeCandidate, ChallengeController, ChallengeResponder,
    ChallengeStatus, HTTP01, PollPolicy,
};
use crate::codec::AccountSettings;
use crate::jws::{b64url, key_authorization};
use crate::storage::{AccountStore, lock_key_cancellable};
use crate::types::{AcmeError, AcmeResult, CertificateBundle, ChallengeInstructions};
use async_trait::async_trait;
use certify_ca::{RsaKey, is_valid_domain, self_signed_certificate};
use certify_common::EnvironmentSettings;
use certify_common::config::OFFLINE_DIRECTORY;
use ring::digest::{SHA256, digest};
use ring::rand::{SecureRandom, SystemRandom};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const ACCOUNT_FILE: &str = "account.json";

const ACCOUNT_KEY_BITS: u32 = 2048;

/// Offline accounts never sign anything; their thumbprint is a digest of the
/// stored key bytes
fn offline_thumbprint(key_der: &[u8]) -> String {
    b64url(digest(&SHA256, key_der).as_ref())
}

fn random_token() -> AcmeResult<String> {
    let mut bytes = [0u8; 24];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| AcmeError::KeyFormat("System randomness unavailable".to_string()))?;
    Ok(b64url(&bytes))
}

struct SelfCheck<'a> {
    http: &'a reqwest::Client,
    url: String,
}

impl SelfCheck<'_> {
    /// `Valid` once the served body matches exactly; anything else is still pending
    async fn fetch_served(&self, challenge: &Challenge) -> ChallengeStatus {
        let response = match self.http.get(&self.url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %self.url, error = %e, "Challenge file not reachable yet");
                return ChallengeStatus::Pending;
            }
        };

        let status = response.status();
        match response.text().await {
            Ok(body) if status.is_success() && body == challenge.key_authorization => {
                ChallengeStatus::Valid
            }
            Ok(body) => {
                debug!(
                    url = %self.url,
                    status = %status,
                    bytes = body.len(),
                    "Challenge file does not match yet"
                );
                ChallengeStatus::Pending
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "Failed to read challenge response");
                ChallengeStatus::Pending
            }
        }
    }
}

#[async_trait]
impl<'a> ChallengeResponder for SelfCheck<'a> {
    async fn submit(&mut self, challenge: &Challenge) -> AcmeResult<ChallengeStatus> {
        Ok(self.fetch_served(challenge).await)
    }

    async fn fetch_status(&mut self, challenge: &Challenge) -> AcmeResult<ChallengeStatus> {
        Ok(self.fetch_served(challenge).await)
    }
}

struct SelfSigner {
    validity_days: u32,
}

#[async_trait]
impl CsrSigner for SelfSigner {
    async fn submit(&mut self, request: &CertificateRequest) -> AcmeResult<CsrOutcome> {
        let certificate =
            self_signed_certificate(&request.common_name, &request.key, self.validity_days)?;
        Ok(CsrOutcome::Created {
            certificate_der: certificate.der().to_vec(),
            issuers: Vec::new(),
        })
    }
}

pub struct OfflineProvider {
    settings: EnvironmentSettings,
    domain: String,
    http: reqwest::Client,
    cancel: CancellationToken,
    thumbprint: Option<String>,
    controller: Option<ChallengeController>,
}

impl OfflineProvider {
    pub fn new(
        settings: EnvironmentSettings,
        domain: &str,
        cancel: CancellationToken,
    ) -> AcmeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.http_timeout())
            .build()?;
        Ok(Self {
            settings,
            domain: domain.to_string(),
            http,
            cancel,
            thumbprint: None,
            controller: None,
        })
    }

    pub fn validity_days(&self) -> u32 {
        self.settings.offline_validity_days
    }

    fn self_check_url(&self, file_path: &str) -> String {
        let base = self
            .settings
            .self_check_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.domain));
        format!("{}/{}", base.trim_end_matches('/'), file_path)
    }

    /// Token used by challenges started after this call
    pub fn set_cancellation(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }

    pub async fn init_registration(&mut self, storage_path: &Path, email: &str) -> AcmeResult<()> {
        let store = AccountStore::new(storage_path, email, OFFLINE_DIRECTORY);
        let _guard = store.lock().await;

        let account = match store.load::<AccountSettings>(ACCOUNT_FILE)? {
            Some(account) => {
                debug!(email = %email, "Loaded offline account");
                account
            }
            None => {
                let key = RsaKey::generate(ACCOUNT_KEY_BITS)?;
                let mut account =
                    AccountSettings::new(key.private_key_der(), OFFLINE_DIRECTORY, email);
                account.account_url = Some(format!(
                    "{}/account/{}",
                    OFFLINE_DIRECTORY,
                    &AccountStore::account_hash(email, OFFLINE_DIRECTORY)[..16]
                ));
                store.save(ACCOUNT_FILE, &account)?;
                info!(email = %email, "Created offline account");
                account
            }
        };

        let key_der = account.key_der().map_err(|e| AcmeError::AccountLoad {
            path: store.path(ACCOUNT_FILE),
            reason: e.to_string(),
        })?;
        self.thumbprint = Some(offline_thumbprint(&key_der));
        Ok(())
    }

    pub async fn generate_http_challenge(&mut self) -> AcmeResult<ChallengeInstructions> {
        if !is_valid_domain(&self.domain) {
            return Err(AcmeError::ConfigError(format!("Invalid domain: {}", self.domain)));
        }
        self.controller = None;

        let thumbprint = self.thumbprint.as_deref().ok_or(AcmeError::OutOfOrder {
            operation: "generate_http_challenge",
            requires: "init_registration",
        })?;

        let guard =
            lock_key_cancellable(&format!("challenge:{}", self.domain), &self.cancel).await?;
        let mut controller = ChallengeController::new(
            &self.domain,
            PollPolicy::from_settings(&self.settings),
            self.cancel.clone(),
        );
        controller.hold(guard);

        let token = random_token()?;
        controller.authorizations_received(vec![AuthorizationView {
            domain: self.domain.clone(),
            status: ChallengeStatus::Pending,
            challenges: vec![ChallengeCandidate {
                kind: HTTP01.to_string(),
                url: format!("{}/challenge/{}", OFFLINE_DIRECTORY, token),
                status: ChallengeStatus::Pending,
                key_authorization: key_authorization(&token, thumbprint),
                token,
            }],
        }])?;
        let instructions = controller.decode()?;
        debug!(
            domain = %self.domain,
            path = %instructions.challenge_file_path,
            "Offline challenge generated"
        );

        self.controller = Some(controller);
        Ok(instructions)
    }

    pub async fn validate_challenge(&mut self) -> AcmeResult<bool> {
        let Some(file_path) = self
            .controller
            .as_ref()
            .and_then(|c| c.challenge())
            .map(|c| c.file_path.clone())
        else {
            return Err(AcmeError::OutOfOrder {
                operation: "validate_challenge",
                requires: "generate_http_challenge",
            });
        };

        let mut responder = SelfCheck {
            http: &self.http,
            url: self.self_check_url(&file_path),
        };
        match self.controller.as_mut() {
            Some(controller) => controller.validate(&mut responder).await,
            None => Err(AcmeError::OutOfOrder {
                operation: "validate_challenge",
                requires: "generate_http_challenge",
            }),
        }
    }

    pub async fn download_certificate(
        &mut self,
        name: &str,
        main_host: &str,
        output_dir: &Path,
        alternate_hosts: &[String],
    ) -> AcmeResult<CertificateBundle> {
        ArtifactAssembler::ensure_single_host(main_host, alternate_hosts)?;
        if self.thumbprint.is_none() {
            return Err(AcmeError::OutOfOrder {
                operation: "download_certificate",
                requires: "init_registration",
            });
        }

        let mut signer = SelfSigner {
            validity_days: self.settings.offline_validity_days,
        };
        let bundle = ArtifactAssembler::new(name, output_dir, ArtifactLayout::Named, &self.settings)
            .assemble(main_host, alternate_hosts, &mut signer)
            .await?;
        self.controller = None;
        Ok(bundle)
    }

    pub fn dispose(&mut self) {
        if self.thumbprint.take().is_some() {
            debug!(domain = %self.domain, "Offline provider disposed");
        }
        self.controller = None;
    }
}
