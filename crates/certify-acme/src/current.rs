//! RFC 8555 provider backed by `instant-acme`

use crate::assembler::{
    ArtifactAssembler, ArtifactLayout, CertificateRequest, CsrOutcome, CsrSigner,
};
use crate::challenge::{
    AuthorizationView, Challenge, ChallengeCandidate, ChallengeController, ChallengeResponder,
    ChallengeStatus, HTTP01, PollPolicy,
};
use crate::codec::AccountSettings;
use crate::storage::{AccountStore, lock_key_cancellable};
use crate::types::{AcmeError, AcmeResult, CertificateBundle, ChallengeInstructions};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use bytes::Bytes;
use certify_ca::{is_valid_domain, pem_to_der_chain};
use certify_common::EnvironmentSettings;
use http_body_util::{BodyExt, Full};
use instant_acme::{
    Account, AccountCredentials, Authorization, AuthorizationStatus, BytesResponse, ChallengeType,
    HttpClient, Identifier, NewAccount, NewOrder, Order, OrderStatus,
};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const ACCOUNT_FILE: &str = "account.json";

/// Persisted account form of freshly created `instant-acme` credentials
fn settings_from_credentials(
    credentials: &AccountCredentials,
    directory: &str,
    email: &str,
) -> AcmeResult<AccountSettings> {
    let value = serde_json::to_value(credentials)?;
    let encoded = value
        .get("key_pkcs8")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AcmeError::KeyFormat("Account credentials carry no key".to_string()))?;
    let key_der = URL_SAFE_NO_PAD
        .decode(encoded)
        .or_else(|_| STANDARD.decode(encoded))
        .map_err(|e| AcmeError::KeyFormat(format!("Account key is not base64: {}", e)))?;

    let mut settings = AccountSettings::new(&key_der, directory, email);
    settings.account_url = value
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Ok(settings)
}

fn credentials_from_settings(settings: &AccountSettings) -> AcmeResult<AccountCredentials> {
    let account_url = settings.account_url.as_deref().ok_or_else(|| {
        AcmeError::AccountInitialization(format!(
            "Stored account for {} has no account URL",
            settings.account_email
        ))
    })?;
    let credentials = serde_json::json!({
        "id": account_url,
        "key_pkcs8": URL_SAFE_NO_PAD.encode(settings.key_der()?),
        "directory": settings.service_uri,
    });
    serde_json::from_value(credentials)
        .map_err(|e| AcmeError::KeyFormat(format!("Stored account key rejected: {}", e)))
}

fn authorization_view(order: &Order, domain: &str, authorization: &Authorization) -> AuthorizationView {
    AuthorizationView {
        domain: domain.to_string(),
        status: authorization_status(&authorization.status),
        challenges: authorization
            .challenges
            .iter()
            .map(|c| ChallengeCandidate {
                kind: if c.r#type == ChallengeType::Http01 {
                    HTTP01.to_string()
                } else {
                    format!("{:?}", c.r#type)
                },
                token: c.token.clone(),
                url: c.url.clone(),
                status: challenge_status(&c.status),
                key_authorization: order.key_authorization(c).as_str().to_string(),
            })
            .collect(),
    }
}

fn authorization_status(status: &AuthorizationStatus) -> ChallengeStatus {
    match status {
        AuthorizationStatus::Pending => ChallengeStatus::Pending,
        AuthorizationStatus::Valid => ChallengeStatus::Valid,
        _ => ChallengeStatus::Invalid,
    }
}

/// `instant-acme` does not export its challenge status type; the variant
/// names match the wire values
fn challenge_status(status: &impl std::fmt::Debug) -> ChallengeStatus {
    ChallengeStatus::from_wire(&format!("{:?}", status).to_lowercase())
}

fn http_error(e: impl std::error::Error + Send + Sync + 'static) -> instant_acme::Error {
    instant_acme::Error::Other(Box::new(e))
}

/// Sends `instant-acme` traffic through the provider's reqwest client, so
/// the configured timeout applies and `http://` directories are reachable
struct ReqwestHttp(reqwest::Client);

impl HttpClient for ReqwestHttp {
    fn request(
        &self,
        req: http::Request<Full<Bytes>>,
    ) -> Pin<Box<dyn Future<Output = Result<BytesResponse, instant_acme::Error>> + Send>> {
        let client = self.0.clone();
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(never) => match never {},
            };
            let request = reqwest::Request::try_from(http::Request::from_parts(parts, body))
                .map_err(http_error)?;

            let response = client.execute(request).await.map_err(http_error)?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(http_error)?;

            let mut converted = http::Response::new(Full::new(body));
            *converted.status_mut() = status;
            *converted.headers_mut() = headers;
            Ok(BytesResponse::from(converted))
        })
    }
}

struct OrderResponder<'a> {
    order: &'a mut Order,
}

#[async_trait]
impl<'a> ChallengeResponder for OrderResponder<'a> {
    async fn submit(&mut self, challenge: &Challenge) -> AcmeResult<ChallengeStatus> {
        self.order
            .set_challenge_ready(&challenge.url)
            .await
            .map_err(|e| AcmeError::ProtocolError(format!("Failed to set challenge ready: {}", e)))?;
        Ok(ChallengeStatus::Processing)
    }

    async fn fetch_status(&mut self, challenge: &Challenge) -> AcmeResult<ChallengeStatus> {
        let authorizations = self.order.authorizations().await.map_err(|e| {
            AcmeError::ProtocolError(format!("Failed to refresh authorizations: {}", e))
        })?;

        authorizations
            .iter()
            .find(|a| a.challenges.iter().any(|c| c.url == challenge.url))
            .map(|a| authorization_status(&a.status))
            .ok_or_else(|| {
                AcmeError::ProtocolError(format!(
                    "Authorization for {} disappeared from the order",
                    challenge.domain
                ))
            })
    }
}

/// Finalizes an order once it is ready and collects the issued chain
struct OrderSigner<'a> {
    order: &'a mut Order,
    policy: PollPolicy,
    cancel: &'a CancellationToken,
}

impl OrderSigner<'_> {
    async fn wait_ready(&mut self) -> AcmeResult<OrderStatus> {
        for attempt in 1..=self.policy.max_attempts {
            self.order
                .refresh()
                .await
                .map_err(|e| AcmeError::ProtocolError(format!("Failed to refresh order: {}", e)))?;

            let status = self.order.state().status;
            debug!(attempt, status = ?status, "Order status");
            match status {
                OrderStatus::Ready | OrderStatus::Valid | OrderStatus::Invalid => {
                    return Ok(status);
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    self.policy.pause(self.cancel, "waiting for order").await?;
                }
            }
        }

        Err(AcmeError::ProtocolError(format!(
            "Order not ready after {} polls",
            self.policy.max_attempts
        )))
    }
}

#[async_trait]
impl<'a> CsrSigner for OrderSigner<'a> {
    async fn submit(&mut self, request: &CertificateRequest) -> AcmeResult<CsrOutcome> {
        match self.wait_ready().await? {
            OrderStatus::Ready => {
                if let Err(e) = self.order.finalize(&request.csr_der).await {
                    return Ok(match e {
                        instant_acme::Error::Api(problem) => CsrOutcome::Rejected {
                            status: problem.status.unwrap_or(400),
                            detail: problem.to_string(),
                        },
                        other => CsrOutcome::Rejected {
                            status: 0,
                            detail: other.to_string(),
                        },
                    });
                }
                info!(common_name = %request.common_name, "Order finalized, waiting for certificate");
            }
            OrderStatus::Invalid => {
                let detail = self
                    .order
                    .state()
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "order is invalid".to_string());
                return Ok(CsrOutcome::Rejected {
                    status: 403,
                    detail,
                });
            }
            status => {
                // its certificate was issued for some other key
                warn!(status = ?status, "Order finalized elsewhere, refusing to reuse it");
                return Ok(CsrOutcome::Rejected {
                    status: 409,
                    detail: format!(
                        "order is already {:?}; it cannot be finalized with a new key",
                        status
                    ),
                });
            }
        }

        for attempt in 1..=self.policy.max_attempts {
            match self.order.certificate().await {
                Ok(Some(chain)) => {
                    let mut ders = pem_to_der_chain(&chain)?.into_iter();
                    let certificate_der = ders.next().ok_or_else(|| {
                        AcmeError::ProtocolError("CA returned an empty chain".to_string())
                    })?;
                    return Ok(CsrOutcome::Created {
                        certificate_der,
                        issuers: ders.collect(),
                    });
                }
                Ok(None) => {
                    debug!(attempt, "Certificate not ready yet");
                    self.policy.pause(self.cancel, "waiting for certificate").await?;
                }
                Err(e) => {
                    return Err(AcmeError::ProtocolError(format!(
                        "Failed to get certificate: {}",
                        e
                    )));
                }
            }
        }

        Err(AcmeError::ProtocolError(format!(
            "Certificate not available after {} polls",
            self.policy.max_attempts
        )))
    }
}

pub struct CurrentProvider {
    settings: EnvironmentSettings,
    domain: String,
    http: reqwest::Client,
    cancel: CancellationToken,
    account: Option<Account>,
    order: Option<Order>,
    controller: Option<ChallengeController>,
}

impl CurrentProvider {
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
            account: None,
            order: None,
            controller: None,
        })
    }

    fn acme_http(&self) -> Box<dyn HttpClient> {
        Box::new(ReqwestHttp(self.http.clone()))
    }

    /// Token used by challenges started after this call
    pub fn set_cancellation(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }

    pub async fn init_registration(&mut self, storage_path: &Path, email: &str) -> AcmeResult<()> {
        let directory = self.settings.effective_directory();
        let store = AccountStore::new(storage_path, email, &directory);
        let _guard = store.lock().await;

        let account = match store.load::<AccountSettings>(ACCOUNT_FILE)? {
            Some(stored) => {
                let credentials = credentials_from_settings(&stored)?;
                let account = Account::from_credentials_and_http(credentials, self.acme_http())
                    .await
                    .map_err(|e| {
                        AcmeError::AccountInitialization(format!("Failed to load account: {}", e))
                    })?;
                info!(email = %email, "Loaded existing ACME account");
                account
            }
            None => {
                info!(email = %email, directory = %directory, "Creating new ACME account");
                let contact = format!("mailto:{}", email);
                let (account, credentials) = Account::create_with_http(
                    &NewAccount {
                        contact: &[&contact],
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    &directory,
                    None,
                    self.acme_http(),
                )
                .await
                .map_err(|e| {
                    AcmeError::AccountInitialization(format!("Failed to create account: {}", e))
                })?;

                let stored = settings_from_credentials(&credentials, &directory, email)?;
                store.save(ACCOUNT_FILE, &stored)?;
                info!(account = %account.id(), "Created new ACME account");
                account
            }
        };

        self.account = Some(account);
        Ok(())
    }

    pub async fn generate_http_challenge(&mut self) -> AcmeResult<ChallengeInstructions> {
        if !is_valid_domain(&self.domain) {
            return Err(AcmeError::ConfigError(format!("Invalid domain: {}", self.domain)));
        }
        self.controller = None;
        self.order = None;

        let account = self.account.as_ref().ok_or(AcmeError::OutOfOrder {
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

        let identifiers = vec![Identifier::Dns(self.domain.clone())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| AcmeError::OrderCreation(format!("Failed to create order: {}", e)))?;
        debug!(domain = %self.domain, "Created ACME order");

        let authorizations = order.authorizations().await.map_err(|e| {
            AcmeError::NoAuthorization(format!("Failed to get authorizations: {}", e))
        })?;
        let views = authorizations
            .iter()
            .map(|a| authorization_view(&order, &self.domain, a))
            .collect();

        controller.authorizations_received(views)?;
        let instructions = controller.decode()?;

        self.order = Some(order);
        self.controller = Some(controller);
        Ok(instructions)
    }

    pub async fn validate_challenge(&mut self) -> AcmeResult<bool> {
        let (Some(controller), Some(order)) = (self.controller.as_mut(), self.order.as_mut()) else {
            return Err(AcmeError::OutOfOrder {
                operation: "validate_challenge",
                requires: "generate_http_challenge",
            });
        };

        controller.validate(&mut OrderResponder { order }).await
    }

    pub async fn download_certificate(
        &mut self,
        name: &str,
        main_host: &str,
        output_dir: &Path,
        alternate_hosts: &[String],
    ) -> AcmeResult<CertificateBundle> {
        ArtifactAssembler::ensure_single_host(main_host, alternate_hosts)?;
        // an order is finalized at most once, whatever the outcome
        let mut order = self.order.take().ok_or(AcmeError::OutOfOrder {
            operation: "download_certificate",
            requires: "validate_challenge",
        })?;
        self.controller = None;

        let mut signer = OrderSigner {
            order: &mut order,
            policy: PollPolicy::from_settings(&self.settings),
            cancel: &self.cancel,
        };
        let layout = ArtifactLayout::Guid(uuid::Uuid::new_v4().to_string());
        let bundle = ArtifactAssembler::new(name, output_dir, layout, &self.settings)
            .assemble(main_host, alternate_hosts, &mut signer)
            .await?;
        Ok(bundle)
    }

    pub fn dispose(&mut self) {
        if self.account.take().is_some() {
            debug!(domain = %self.domain, "Current provider disposed");
        }
        self.order = None;
        self.controller = None;
    }
}
