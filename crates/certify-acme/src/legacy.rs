//! Pre-standard ACME (Let's Encrypt v1 endpoints)
//!
//! The v1 protocol names every request with a `resource` member and signs it
//! with the embedded account JWK. Authorizations are requested per domain
//! (`new-authz`) and the CSR is posted to `new-cert`, which answers with the
//! DER certificate and a `Link: <issuer>;rel="up"` header.

use crate::assembler::{
    ArtifactAssembler, ArtifactLayout, CertificateRequest, CsrOutcome, CsrSigner,
};
use crate::challenge::{
    AuthorizationView, Challenge, ChallengeCandidate, ChallengeController, ChallengeResponder,
    ChallengeStatus, PollPolicy,
};
use crate::codec::{deserialize_key_pair, serialize_key_pair};
use crate::jws::{self, Jwk, key_authorization};
use crate::storage::{AccountStore, lock_key_cancellable};
use crate::types::{AcmeError, AcmeResult, CertificateBundle, ChallengeInstructions, Problem};
use async_trait::async_trait;
use certify_ca::{RsaKey, is_valid_domain};
use certify_common::EnvironmentSettings;
use chrono::{DateTime, Utc};
use reqwest::header::{LINK, LOCATION};
use reqwest::{Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SIGNER_FILE: &str = "signer.json";
pub const REGISTRATION_FILE: &str = "registration.json";
const VAULT_DIR: &str = "vault";
const REPLAY_NONCE: &str = "Replay-Nonce";

/// Account keys sign with RS256, which needs at least 2048 bits
const ACCOUNT_KEY_BITS: u32 = 2048;

#[derive(Debug, Clone, Deserialize)]
struct LegacyDirectory {
    #[serde(rename = "new-reg")]
    new_reg: String,
    #[serde(rename = "new-authz")]
    new_authz: String,
    #[serde(rename = "new-cert")]
    new_cert: String,
    #[serde(default)]
    meta: Option<LegacyMeta>,
}

#[derive(Debug, Clone, Deserialize)]
struct LegacyMeta {
    #[serde(rename = "terms-of-service")]
    terms_of_service: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LegacyAuthorization {
    status: String,
    #[serde(default)]
    challenges: Vec<LegacyChallenge>,
}

#[derive(Debug, Clone, Deserialize)]
struct LegacyChallenge {
    #[serde(rename = "type")]
    kind: String,
    uri: String,
    #[serde(default)]
    token: String,
    #[serde(default = "pending")]
    status: String,
    #[serde(default)]
    error: Option<Problem>,
}

fn pending() -> String {
    "pending".to_string()
}

/// CA registration record persisted next to the signer key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyRegistration {
    pub uri: String,
    pub email: String,
    pub directory: String,
    #[serde(default)]
    pub agreement: Option<String>,
    pub registered_at: DateTime<Utc>,
    /// Registration resource as returned by the CA
    #[serde(default)]
    pub record: serde_json::Value,
}

/// Signed-request client for one account key
pub struct LegacyClient {
    http: reqwest::Client,
    directory_url: String,
    directory: LegacyDirectory,
    key: RsaKey,
    jwk: Jwk,
    nonce: Option<String>,
}

impl LegacyClient {
    pub async fn connect(http: reqwest::Client, directory_url: &str, key: RsaKey) -> AcmeResult<Self> {
        let response = http.get(directory_url).send().await?;
        if !response.status().is_success() {
            return Err(AcmeError::ProtocolError(format!(
                "Directory {} answered {}",
                directory_url,
                response.status()
            )));
        }
        let nonce = replay_nonce(&response);
        let directory: LegacyDirectory = response.json().await?;
        debug!(directory = %directory_url, "Fetched legacy ACME directory");

        let jwk = Jwk::from_key(&key)?;
        Ok(Self {
            http,
            directory_url: directory_url.to_string(),
            directory,
            key,
            jwk,
            nonce,
        })
    }

    pub fn key(&self) -> &RsaKey {
        &self.key
    }

    pub fn thumbprint(&self) -> AcmeResult<String> {
        self.jwk.thumbprint()
    }

    pub fn terms_of_service(&self) -> Option<&str> {
        self.directory
            .meta
            .as_ref()
            .and_then(|m| m.terms_of_service.as_deref())
    }

    async fn fresh_nonce(&mut self) -> AcmeResult<String> {
        if let Some(nonce) = self.nonce.take() {
            return Ok(nonce);
        }
        let response = self.http.head(&self.directory_url).send().await?;
        replay_nonce(&response)
            .ok_or_else(|| AcmeError::ProtocolError("CA sent no Replay-Nonce".to_string()))
    }

    async fn post<T: Serialize>(&mut self, url: &str, payload: &T) -> AcmeResult<Response> {
        let nonce = self.fresh_nonce().await?;
        let envelope = jws::sign(&self.key, &self.jwk, &nonce, url, payload)?;
        let response = self.http.post(url).json(&envelope).send().await?;
        self.remember_nonce(&response);
        debug!(url = %url, status = %response.status(), "Signed request sent");
        Ok(response)
    }

    async fn get(&mut self, url: &str) -> AcmeResult<Response> {
        let response = self.http.get(url).send().await?;
        self.remember_nonce(&response);
        Ok(response)
    }

    fn remember_nonce(&mut self, response: &Response) {
        if let Some(nonce) = replay_nonce(response) {
            self.nonce = Some(nonce);
        }
    }

    /// Registers the account key; an existing registration (409) is reused
    pub async fn register(&mut self, email: &str) -> AcmeResult<LegacyRegistration> {
        let agreement = self.terms_of_service().map(str::to_string);
        let payload = serde_json::json!({
            "resource": "new-reg",
            "contact": [format!("mailto:{}", email)],
            "agreement": agreement,
        });
        let url = self.directory.new_reg.clone();
        let response = self.post(&url, &payload).await?;
        let status = response.status();
        let location = header_value(&response, LOCATION);

        match status {
            StatusCode::CREATED | StatusCode::CONFLICT => {
                let uri = location.ok_or_else(|| {
                    AcmeError::AccountInitialization(
                        "Registration answer carried no Location".to_string(),
                    )
                })?;
                let record = response.json().await.unwrap_or(serde_json::Value::Null);
                if status == StatusCode::CONFLICT {
                    info!(uri = %uri, "Account key already registered, reusing registration");
                } else {
                    info!(uri = %uri, email = %email, "Registered new legacy ACME account");
                }
                Ok(LegacyRegistration {
                    uri,
                    email: email.to_string(),
                    directory: self.directory_url.clone(),
                    agreement,
                    registered_at: Utc::now(),
                    record,
                })
            }
            _ => {
                let problem = problem_of(response).await;
                Err(AcmeError::AccountInitialization(format!(
                    "Registration rejected ({}): {}",
                    status, problem
                )))
            }
        }
    }

    /// Requests an authorization for `domain`; returns its URI and body
    async fn new_authorization(&mut self, domain: &str) -> AcmeResult<(String, LegacyAuthorization)> {
        let payload = serde_json::json!({
            "resource": "new-authz",
            "identifier": { "type": "dns", "value": domain },
        });
        let url = self.directory.new_authz.clone();
        let response = self.post(&url, &payload).await?;
        let status = response.status();

        if status != StatusCode::CREATED {
            let problem = problem_of(response).await;
            return Err(AcmeError::OrderCreation(format!(
                "new-authz for {} rejected ({}): {}",
                domain, status, problem
            )));
        }

        let uri = header_value(&response, LOCATION).ok_or_else(|| {
            AcmeError::OrderCreation("Authorization answer carried no Location".to_string())
        })?;
        let authorization = response.json().await?;
        Ok((uri, authorization))
    }

    async fn authorization(&mut self, uri: &str) -> AcmeResult<LegacyAuthorization> {
        let response = self.get(uri).await?;
        let status = response.status();
        if !status.is_success() {
            let problem = problem_of(response).await;
            return Err(AcmeError::ProtocolError(format!(
                "Fetching authorization {} failed ({}): {}",
                uri, status, problem
            )));
        }
        Ok(response.json().await?)
    }

    async fn answer_challenge(&mut self, challenge: &Challenge) -> AcmeResult<ChallengeStatus> {
        let payload = serde_json::json!({
            "resource": "challenge",
            "type": crate::challenge::HTTP01,
            "keyAuthorization": challenge.key_authorization,
        });
        let response = self.post(&challenge.url, &payload).await?;
        let status = response.status();
        if !status.is_success() {
            let problem = problem_of(response).await;
            return Err(AcmeError::ProtocolError(format!(
                "Challenge answer rejected ({}): {}",
                status, problem
            )));
        }

        let answered: LegacyChallenge = response.json().await?;
        if let Some(problem) = &answered.error {
            warn!(domain = %challenge.domain, problem = %problem, "CA reported challenge error");
        }
        Ok(ChallengeStatus::from_wire(&answered.status))
    }

    async fn issuer_chain(&mut self, response: &Response) -> AcmeResult<Vec<Vec<u8>>> {
        let Some(up) = link_up(response) else {
            return Ok(Vec::new());
        };
        let url = self.resolve(&up)?;
        let issuer = self.get(url.as_str()).await?;
        if !issuer.status().is_success() {
            warn!(url = %url, status = %issuer.status(), "Could not fetch issuer certificate");
            return Ok(Vec::new());
        }
        Ok(vec![issuer.bytes().await?.to_vec()])
    }

    fn resolve(&self, target: &str) -> AcmeResult<Url> {
        Url::parse(&self.directory_url)
            .and_then(|base| base.join(target))
            .map_err(|e| AcmeError::ProtocolError(format!("Bad URL {}: {}", target, e)))
    }
}

#[async_trait]
impl CsrSigner for LegacyClient {
    async fn submit(&mut self, request: &CertificateRequest) -> AcmeResult<CsrOutcome> {
        let payload = serde_json::json!({
            "resource": "new-cert",
            "csr": request.csr_b64url(),
        });
        let url = self.directory.new_cert.clone();
        let response = self.post(&url, &payload).await?;
        let status = response.status();

        if status != StatusCode::CREATED {
            let problem = problem_of(response).await;
            return Ok(CsrOutcome::Rejected {
                status: status.as_u16(),
                detail: problem.to_string(),
            });
        }

        let issuers = self.issuer_chain(&response).await?;
        let location = header_value(&response, LOCATION);
        let mut certificate_der = response.bytes().await?.to_vec();

        // Some CAs answer 201 before the certificate body is ready
        if certificate_der.is_empty() {
            if let Some(location) = location {
                certificate_der = self.get(&location).await?.bytes().await?.to_vec();
            }
        }
        if certificate_der.is_empty() {
            return Err(AcmeError::ProtocolError(
                "new-cert returned an empty certificate".to_string(),
            ));
        }

        info!(common_name = %request.common_name, "Legacy CA issued certificate");
        Ok(CsrOutcome::Created {
            certificate_der,
            issuers,
        })
    }
}

struct LegacyResponder<'a> {
    client: &'a mut LegacyClient,
    authorization_uri: &'a str,
}

#[async_trait]
impl<'a> ChallengeResponder for LegacyResponder<'a> {
    async fn submit(&mut self, challenge: &Challenge) -> AcmeResult<ChallengeStatus> {
        self.client.answer_challenge(challenge).await
    }

    async fn fetch_status(&mut self, _challenge: &Challenge) -> AcmeResult<ChallengeStatus> {
        let authorization = self.client.authorization(self.authorization_uri).await?;
        Ok(ChallengeStatus::from_wire(&authorization.status))
    }
}

impl LegacyAuthorization {
    fn to_view(&self, domain: &str, thumbprint: &str) -> AuthorizationView {
        AuthorizationView {
            domain: domain.to_string(),
            status: ChallengeStatus::from_wire(&self.status),
            challenges: self
                .challenges
                .iter()
                .map(|c| ChallengeCandidate {
                    kind: c.kind.clone(),
                    token: c.token.clone(),
                    url: c.uri.clone(),
                    status: ChallengeStatus::from_wire(&c.status),
                    key_authorization: key_authorization(&c.token, thumbprint),
                })
                .collect(),
        }
    }
}

fn replay_nonce(response: &Response) -> Option<String> {
    response
        .headers()
        .get(REPLAY_NONCE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn header_value(response: &Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Target of the first `Link` with `rel="up"`
fn link_up(response: &Response) -> Option<String> {
    response
        .headers()
        .get_all(LINK)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .find(|link| link.contains("rel=\"up\"") || link.contains("rel=up"))
        .and_then(|link| {
            let start = link.find('<')? + 1;
            let end = link.find('>')?;
            link.get(start..end).map(str::to_string)
        })
}

async fn problem_of(response: Response) -> Problem {
    let status = response.status().as_u16();
    let mut problem: Problem = response.json().await.unwrap_or_default();
    if problem.status.is_none() {
        problem.status = Some(status);
    }
    problem
}

/// Best-effort creation of the account vault directory; it normally exists
fn init_vault(store: &AccountStore) {
    let vault = store.path(VAULT_DIR);
    match std::fs::create_dir(&vault) {
        Ok(()) => debug!(path = %vault.display(), "Created account vault"),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            debug!(path = %vault.display(), "Account vault already present")
        }
        Err(e) => warn!(path = %vault.display(), error = %e, "Vault initialization failed, continuing"),
    }
}

pub struct LegacyProvider {
    settings: EnvironmentSettings,
    domain: String,
    http: reqwest::Client,
    cancel: CancellationToken,
    client: Option<LegacyClient>,
    registration: Option<LegacyRegistration>,
    controller: Option<ChallengeController>,
    authorization_uri: Option<String>,
}

impl LegacyProvider {
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
            client: None,
            registration: None,
            controller: None,
            authorization_uri: None,
        })
    }

    pub fn registration(&self) -> Option<&LegacyRegistration> {
        self.registration.as_ref()
    }

    /// Token used by challenges started after this call
    pub fn set_cancellation(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }

    pub async fn init_registration(&mut self, storage_path: &Path, email: &str) -> AcmeResult<()> {
        let directory = self.settings.effective_directory();
        let store = AccountStore::new(storage_path, email, &directory);
        let _guard = store.lock().await;

        store.init()?;
        init_vault(&store);

        let key = match store.read(SIGNER_FILE)? {
            Some(text) => Some(deserialize_key_pair(&text).map_err(|e| AcmeError::AccountLoad {
                path: store.path(SIGNER_FILE),
                reason: e.to_string(),
            })?),
            None => None,
        };
        let registration: Option<LegacyRegistration> = store.load(REGISTRATION_FILE)?;

        let (client, registration) = match (key, registration) {
            (Some(key), Some(registration)) => {
                debug!(uri = %registration.uri, "Loaded legacy ACME account");
                let client = LegacyClient::connect(self.http.clone(), &directory, key).await?;
                (client, registration)
            }
            (None, Some(_)) => {
                return Err(AcmeError::AccountInitialization(format!(
                    "{} exists without its signer key",
                    store.path(REGISTRATION_FILE).display()
                )));
            }
            (key, None) => {
                let fresh = key.is_none();
                let key = match key {
                    Some(key) => key,
                    None => RsaKey::generate(ACCOUNT_KEY_BITS)?,
                };
                let mut client = LegacyClient::connect(self.http.clone(), &directory, key).await?;
                let registration = client.register(email).await?;

                if fresh {
                    store.save_raw(SIGNER_FILE, &serialize_key_pair(client.key())?)?;
                }
                store.save(REGISTRATION_FILE, &registration)?;
                (client, registration)
            }
        };

        self.client = Some(client);
        self.registration = Some(registration);
        Ok(())
    }

    pub async fn generate_http_challenge(&mut self) -> AcmeResult<ChallengeInstructions> {
        if !is_valid_domain(&self.domain) {
            return Err(AcmeError::ConfigError(format!("Invalid domain: {}", self.domain)));
        }
        // drop any earlier challenge (and its domain lock) first
        self.controller = None;
        self.authorization_uri = None;

        let client = self.client.as_mut().ok_or(AcmeError::OutOfOrder {
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

        info!(domain = %self.domain, "Requesting legacy authorization");
        let (uri, authorization) = client.new_authorization(&self.domain).await?;
        let thumbprint = client.thumbprint()?;

        controller.authorizations_received(vec![authorization.to_view(&self.domain, &thumbprint)])?;
        let instructions = controller.decode()?;

        self.authorization_uri = Some(uri);
        self.controller = Some(controller);
        Ok(instructions)
    }

    pub async fn validate_challenge(&mut self) -> AcmeResult<bool> {
        let out_of_order = AcmeError::OutOfOrder {
            operation: "validate_challenge",
            requires: "generate_http_challenge",
        };
        let (Some(controller), Some(client), Some(uri)) = (
            self.controller.as_mut(),
            self.client.as_mut(),
            self.authorization_uri.as_deref(),
        ) else {
            return Err(out_of_order);
        };

        let mut responder = LegacyResponder {
            client,
            authorization_uri: uri,
        };
        controller.validate(&mut responder).await
    }

    pub async fn download_certificate(
        &mut self,
        name: &str,
        main_host: &str,
        output_dir: &Path,
        alternate_hosts: &[String],
    ) -> AcmeResult<CertificateBundle> {
        ArtifactAssembler::ensure_single_host(main_host, alternate_hosts)?;
        let client = self.client.as_mut().ok_or(AcmeError::OutOfOrder {
            operation: "download_certificate",
            requires: "init_registration",
        })?;

        ArtifactAssembler::new(name, output_dir, ArtifactLayout::Named, &self.settings)
            .assemble(main_host, alternate_hosts, client)
            .await
    }

    pub fn dispose(&mut self) {
        if self.client.take().is_some() {
            debug!(domain = %self.domain, "Legacy provider disposed");
        }
        self.controller = None;
        self.authorization_uri = None;
    }
}
