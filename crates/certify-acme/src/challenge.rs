//! HTTP-01 challenge state machine shared by every provider
//!
//! ```text
//! Created → AuthorizationRequested → ChallengeDecoded → ChallengeSubmitted
//!         → Polling{pending|processing} → Valid | Invalid | Aborted
//! ```
//!
//! Providers translate their CA's authorization objects into
//! [`AuthorizationView`]s and talk to the CA through a [`ChallengeResponder`];
//! selection, ordering and the bounded, cancellable poll loop live here.

use crate::storage::KeyGuard;
use crate::types::{AcmeError, AcmeResult, ChallengeInstructions};
use async_trait::async_trait;
use certify_common::EnvironmentSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const HTTP01: &str = "http-01";
pub const WELL_KNOWN_PREFIX: &str = ".well-known/acme-challenge/";

/// `.well-known/acme-challenge/{token}`
pub fn challenge_file_path(token: &str) -> String {
    format!("{}{}", WELL_KNOWN_PREFIX, token)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

impl ChallengeStatus {
    /// Maps a CA status string (challenge or authorization) onto the four
    /// states the controller distinguishes
    pub fn from_wire(status: &str) -> Self {
        match status {
            "pending" => Self::Pending,
            "processing" => Self::Processing,
            "valid" => Self::Valid,
            // invalid, deactivated, expired, revoked
            _ => Self::Invalid,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Valid | Self::Invalid)
    }
}

/// One challenge offered inside an authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeCandidate {
    pub kind: String,
    pub token: String,
    pub url: String,
    pub status: ChallengeStatus,
    pub key_authorization: String,
}

/// Protocol-neutral view of a CA authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationView {
    pub domain: String,
    pub status: ChallengeStatus,
    pub challenges: Vec<ChallengeCandidate>,
}

/// The decoded HTTP-01 challenge being answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub domain: String,
    pub token: String,
    pub key_authorization: String,
    pub url: String,
    pub file_path: String,
    pub status: ChallengeStatus,
}

impl Challenge {
    pub fn instructions(&self) -> ChallengeInstructions {
        ChallengeInstructions {
            challenge_url: format!("http://{}/{}", self.domain, self.file_path),
            challenge_content: self.key_authorization.clone(),
            challenge_file_path: self.file_path.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    Created,
    AuthorizationRequested,
    ChallengeDecoded,
    ChallengeSubmitted,
    Polling,
    Valid,
    Invalid,
    /// Cancelled before a verdict; the order has to be started again
    Aborted,
}

/// Fixed-interval, bounded retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 10,
        }
    }
}

impl PollPolicy {
    pub fn from_settings(settings: &EnvironmentSettings) -> Self {
        Self {
            interval: settings.poll_interval(),
            max_attempts: settings.poll_max_attempts.max(1),
        }
    }

    /// Sleeps one interval unless `cancel` fires first
    pub async fn pause(&self, cancel: &CancellationToken, during: &'static str) -> AcmeResult<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AcmeError::Aborted(during)),
            _ = tokio::time::sleep(self.interval) => Ok(()),
        }
    }
}

/// CA side of a challenge exchange
#[async_trait]
pub trait ChallengeResponder: Send {
    /// Tells the CA the response is being served; returns the status it reports back
    async fn submit(&mut self, challenge: &Challenge) -> AcmeResult<ChallengeStatus>;

    async fn fetch_status(&mut self, challenge: &Challenge) -> AcmeResult<ChallengeStatus>;
}

pub struct ChallengeController {
    domain: String,
    state: ChallengeState,
    policy: PollPolicy,
    cancel: CancellationToken,
    authorizations: Vec<AuthorizationView>,
    challenge: Option<Challenge>,
    domain_guard: Option<KeyGuard>,
}

impl ChallengeController {
    pub fn new(domain: &str, policy: PollPolicy, cancel: CancellationToken) -> Self {
        Self {
            domain: domain.to_string(),
            state: ChallengeState::Created,
            policy,
            cancel,
            authorizations: Vec::new(),
            challenge: None,
            domain_guard: None,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn state(&self) -> ChallengeState {
        self.state
    }

    pub fn challenge(&self) -> Option<&Challenge> {
        self.challenge.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            ChallengeState::Valid | ChallengeState::Invalid | ChallengeState::Aborted
        )
    }

    /// Keeps `guard` until the challenge reaches a terminal state
    pub fn hold(&mut self, guard: KeyGuard) {
        self.domain_guard = Some(guard);
    }

    /// Records the authorizations the CA returned for the order
    pub fn authorizations_received(&mut self, views: Vec<AuthorizationView>) -> AcmeResult<()> {
        self.expect_state(
            ChallengeState::Created,
            "authorizations_received",
            "a new order",
        )?;

        if views.is_empty() {
            return Err(AcmeError::NoAuthorization(format!(
                "CA returned no authorization for {}",
                self.domain
            )));
        }
        if views.len() > 1 {
            warn!(
                domain = %self.domain,
                count = views.len(),
                "Order has several authorizations, only the first usable one is processed"
            );
        }

        self.authorizations = views;
        self.state = ChallengeState::AuthorizationRequested;
        Ok(())
    }

    /// Selects the first authorization offering an HTTP-01 challenge
    pub fn decode(&mut self) -> AcmeResult<ChallengeInstructions> {
        self.expect_state(
            ChallengeState::AuthorizationRequested,
            "decode",
            "authorizations_received",
        )?;

        let (authorization, candidate) = self
            .authorizations
            .iter()
            .find_map(|a| {
                a.challenges
                    .iter()
                    .find(|c| c.kind == HTTP01)
                    .map(|c| (a, c))
            })
            .ok_or_else(|| {
                AcmeError::NoAuthorization(format!(
                    "No http-01 challenge offered for {}",
                    self.domain
                ))
            })?;

        let status = if authorization.status == ChallengeStatus::Valid {
            ChallengeStatus::Valid
        } else {
            candidate.status
        };

        let challenge = Challenge {
            domain: authorization.domain.clone(),
            token: candidate.token.clone(),
            key_authorization: candidate.key_authorization.clone(),
            url: candidate.url.clone(),
            file_path: challenge_file_path(&candidate.token),
            status,
        };
        debug!(
            domain = %challenge.domain,
            token = %challenge.token,
            status = ?challenge.status,
            "Decoded http-01 challenge"
        );

        let instructions = challenge.instructions();
        self.challenge = Some(challenge);
        self.authorizations.clear();
        self.state = ChallengeState::ChallengeDecoded;
        Ok(instructions)
    }

    /// Submits the answer and polls until a terminal state.
    ///
    /// `Ok(false)` covers a CA-reported `invalid` seen while polling and an
    /// exhausted poll budget. A challenge that is already `invalid` before
    /// any polling fails with [`AcmeError::ChallengeInvalid`].
    pub async fn validate<R>(&mut self, responder: &mut R) -> AcmeResult<bool>
    where
        R: ChallengeResponder + ?Sized,
    {
        match self.state {
            ChallengeState::Valid => return Ok(true),
            ChallengeState::Invalid => return Ok(false),
            ChallengeState::ChallengeDecoded => {}
            _ => {
                return Err(AcmeError::OutOfOrder {
                    operation: "validate_challenge",
                    requires: "generate_http_challenge",
                });
            }
        }

        let challenge = self
            .challenge
            .clone()
            .ok_or(AcmeError::OutOfOrder {
                operation: "validate_challenge",
                requires: "generate_http_challenge",
            })?;

        match challenge.status {
            ChallengeStatus::Valid => {
                info!(domain = %self.domain, "Authorization already valid, nothing to submit");
                self.finish(ChallengeStatus::Valid);
                return Ok(true);
            }
            ChallengeStatus::Invalid => {
                self.finish(ChallengeStatus::Invalid);
                return Err(AcmeError::ChallengeInvalid(format!(
                    "Challenge for {} was already invalid",
                    self.domain
                )));
            }
            _ => {}
        }

        if self.cancel.is_cancelled() {
            self.abort();
            return Err(AcmeError::Aborted("submitting challenge"));
        }

        let submitted = responder.submit(&challenge).await?;
        self.state = ChallengeState::ChallengeSubmitted;
        debug!(domain = %self.domain, status = ?submitted, "Challenge submitted");

        match submitted {
            ChallengeStatus::Valid => {
                self.finish(ChallengeStatus::Valid);
                return Ok(true);
            }
            ChallengeStatus::Invalid => {
                self.finish(ChallengeStatus::Invalid);
                return Err(AcmeError::ChallengeInvalid(format!(
                    "CA rejected the http-01 answer for {}",
                    self.domain
                )));
            }
            _ => {}
        }

        self.state = ChallengeState::Polling;
        match self.poll(responder, &challenge).await {
            Ok(ChallengeStatus::Valid) => {
                info!(domain = %self.domain, "Challenge validated");
                self.finish(ChallengeStatus::Valid);
                Ok(true)
            }
            Ok(status) => {
                warn!(domain = %self.domain, status = ?status, "Challenge failed validation");
                self.finish(ChallengeStatus::Invalid);
                Ok(false)
            }
            Err(e @ AcmeError::ChallengeTimeout { .. }) => {
                warn!(domain = %self.domain, error = %e, "Giving up on challenge");
                self.finish(ChallengeStatus::Invalid);
                Ok(false)
            }
            Err(e @ AcmeError::Aborted(_)) => {
                self.abort();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn poll<R>(&self, responder: &mut R, challenge: &Challenge) -> AcmeResult<ChallengeStatus>
    where
        R: ChallengeResponder + ?Sized,
    {
        for attempt in 1..=self.policy.max_attempts {
            self.policy
                .pause(&self.cancel, "polling challenge status")
                .await?;

            let status = responder.fetch_status(challenge).await?;
            debug!(
                domain = %self.domain,
                attempt,
                status = ?status,
                "Polled challenge status"
            );
            if status.is_terminal() {
                return Ok(status);
            }
        }

        Err(AcmeError::ChallengeTimeout {
            attempts: self.policy.max_attempts,
        })
    }

    fn finish(&mut self, status: ChallengeStatus) {
        if let Some(challenge) = self.challenge.as_mut() {
            challenge.status = status;
        }
        self.state = match status {
            ChallengeStatus::Valid => ChallengeState::Valid,
            _ => ChallengeState::Invalid,
        };
        self.domain_guard = None;
    }

    fn abort(&mut self) {
        debug!(domain = %self.domain, "Challenge cancelled, releasing domain");
        self.state = ChallengeState::Aborted;
        self.domain_guard = None;
    }

    fn expect_state(
        &self,
        expected: ChallengeState,
        operation: &'static str,
        requires: &'static str,
    ) -> AcmeResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(AcmeError::OutOfOrder {
                operation,
                requires,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::lock_key;
    use std::collections::VecDeque;

    async fn is_free(key: &str) -> bool {
        tokio::time::timeout(Duration::from_millis(10), lock_key(key))
            .await
            .is_ok()
    }

    struct ScriptedCa {
        on_submit: ChallengeStatus,
        statuses: VecDeque<ChallengeStatus>,
        submits: u32,
        fetches: u32,
    }

    impl ScriptedCa {
        fn new(on_submit: ChallengeStatus, statuses: &[ChallengeStatus]) -> Self {
            Self {
                on_submit,
                statuses: statuses.iter().copied().collect(),
                submits: 0,
                fetches: 0,
            }
        }
    }

    #[async_trait]
    impl ChallengeResponder for ScriptedCa {
        async fn submit(&mut self, _challenge: &Challenge) -> AcmeResult<ChallengeStatus> {
            self.submits += 1;
            Ok(self.on_submit)
        }

        async fn fetch_status(&mut self, _challenge: &Challenge) -> AcmeResult<ChallengeStatus> {
            self.fetches += 1;
            Ok(self.statuses.pop_front().unwrap_or(ChallengeStatus::Pending))
        }
    }

    fn fast_policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            max_attempts: 3,
        }
    }

    fn candidate(kind: &str, token: &str) -> ChallengeCandidate {
        ChallengeCandidate {
            kind: kind.to_string(),
            token: token.to_string(),
            url: format!("https://ca.test/chall/{}", token),
            status: ChallengeStatus::Pending,
            key_authorization: format!("{}.thumb", token),
        }
    }

    fn view(status: ChallengeStatus, challenges: Vec<ChallengeCandidate>) -> AuthorizationView {
        AuthorizationView {
            domain: "app.example.test".to_string(),
            status,
            challenges,
        }
    }

    fn decoded(status: ChallengeStatus) -> ChallengeController {
        let mut controller =
            ChallengeController::new("app.example.test", fast_policy(), CancellationToken::new());
        controller
            .authorizations_received(vec![view(status, vec![candidate(HTTP01, "tok")])])
            .unwrap();
        controller.decode().unwrap();
        controller
    }

    #[test]
    fn test_decode_produces_instructions() {
        let mut controller =
            ChallengeController::new("app.example.test", fast_policy(), CancellationToken::new());
        controller
            .authorizations_received(vec![view(
                ChallengeStatus::Pending,
                vec![candidate("dns-01", "dns"), candidate(HTTP01, "abc")],
            )])
            .unwrap();

        let instructions = controller.decode().unwrap();
        assert_eq!(instructions.challenge_file_path, ".well-known/acme-challenge/abc");
        assert_eq!(
            instructions.challenge_url,
            "http://app.example.test/.well-known/acme-challenge/abc"
        );
        assert_eq!(instructions.challenge_content, "abc.thumb");
        assert_eq!(controller.state(), ChallengeState::ChallengeDecoded);
    }

    #[test]
    fn test_first_authorization_with_http01_wins() {
        let mut controller =
            ChallengeController::new("app.example.test", fast_policy(), CancellationToken::new());
        controller
            .authorizations_received(vec![
                view(ChallengeStatus::Pending, vec![candidate("dns-01", "a")]),
                view(ChallengeStatus::Pending, vec![candidate(HTTP01, "b")]),
                view(ChallengeStatus::Pending, vec![candidate(HTTP01, "c")]),
            ])
            .unwrap();

        controller.decode().unwrap();
        assert_eq!(controller.challenge().unwrap().token, "b");
    }

    #[test]
    fn test_missing_authorizations_and_challenges() {
        let mut controller =
            ChallengeController::new("app.example.test", fast_policy(), CancellationToken::new());
        assert!(matches!(
            controller.authorizations_received(vec![]),
            Err(AcmeError::NoAuthorization(_))
        ));

        controller
            .authorizations_received(vec![view(
                ChallengeStatus::Pending,
                vec![candidate("tls-alpn-01", "x")],
            )])
            .unwrap();
        assert!(matches!(controller.decode(), Err(AcmeError::NoAuthorization(_))));
    }

    #[tokio::test]
    async fn test_out_of_order_calls() {
        let mut controller =
            ChallengeController::new("app.example.test", fast_policy(), CancellationToken::new());
        let mut ca = ScriptedCa::new(ChallengeStatus::Pending, &[]);

        assert!(matches!(controller.decode(), Err(AcmeError::OutOfOrder { .. })));
        assert!(matches!(
            controller.validate(&mut ca).await,
            Err(AcmeError::OutOfOrder { .. })
        ));
        assert_eq!(ca.submits, 0);
    }

    #[tokio::test]
    async fn test_valid_after_polling() {
        let mut controller = decoded(ChallengeStatus::Pending);
        let mut ca = ScriptedCa::new(
            ChallengeStatus::Pending,
            &[ChallengeStatus::Processing, ChallengeStatus::Valid],
        );

        assert!(controller.validate(&mut ca).await.unwrap());
        assert_eq!(ca.submits, 1);
        assert_eq!(ca.fetches, 2);
        assert_eq!(controller.state(), ChallengeState::Valid);

        // terminal state is sticky
        assert!(controller.validate(&mut ca).await.unwrap());
        assert_eq!(ca.submits, 1);
    }

    #[tokio::test]
    async fn test_invalid_while_polling_is_false() {
        let mut controller = decoded(ChallengeStatus::Pending);
        let mut ca = ScriptedCa::new(ChallengeStatus::Pending, &[ChallengeStatus::Invalid]);

        assert!(!controller.validate(&mut ca).await.unwrap());
        assert_eq!(controller.state(), ChallengeState::Invalid);
    }

    #[tokio::test]
    async fn test_pending_forever_respects_bound() {
        let mut controller = decoded(ChallengeStatus::Pending);
        let mut ca = ScriptedCa::new(ChallengeStatus::Pending, &[]);

        assert!(!controller.validate(&mut ca).await.unwrap());
        assert_eq!(ca.fetches, 3);
    }

    #[tokio::test]
    async fn test_invalid_before_polling_fails_fast() {
        let mut controller = decoded(ChallengeStatus::Pending);
        let mut ca = ScriptedCa::new(ChallengeStatus::Invalid, &[]);

        let result = controller.validate(&mut ca).await;
        assert!(matches!(result, Err(AcmeError::ChallengeInvalid(_))));
        assert_eq!(ca.fetches, 0);

        let mut controller = decoded(ChallengeStatus::Invalid);
        let result = controller.validate(&mut ca).await;
        assert!(matches!(result, Err(AcmeError::ChallengeInvalid(_))));
    }

    #[tokio::test]
    async fn test_already_valid_skips_submission() {
        let mut controller = decoded(ChallengeStatus::Valid);
        let mut ca = ScriptedCa::new(ChallengeStatus::Pending, &[]);

        assert!(controller.validate(&mut ca).await.unwrap());
        assert_eq!(ca.submits, 0);
        assert_eq!(ca.fetches, 0);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_promptly() {
        let cancel = CancellationToken::new();
        let policy = PollPolicy {
            interval: Duration::from_secs(60),
            max_attempts: 10,
        };
        let mut controller = ChallengeController::new("app.example.test", policy, cancel.clone());
        controller
            .authorizations_received(vec![view(
                ChallengeStatus::Pending,
                vec![candidate(HTTP01, "tok")],
            )])
            .unwrap();
        controller.decode().unwrap();

        let mut ca = ScriptedCa::new(ChallengeStatus::Pending, &[]);
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), controller.validate(&mut ca))
            .await
            .expect("cancellation should interrupt the poll sleep");
        assert!(matches!(result, Err(AcmeError::Aborted(_))));
        assert_eq!(ca.fetches, 0);
    }

    #[tokio::test]
    async fn test_cancellation_releases_domain_and_ends_challenge() {
        let cancel = CancellationToken::new();
        let policy = PollPolicy {
            interval: Duration::from_secs(60),
            max_attempts: 10,
        };
        let mut controller = ChallengeController::new("app.example.test", policy, cancel.clone());
        controller
            .authorizations_received(vec![view(
                ChallengeStatus::Pending,
                vec![candidate(HTTP01, "tok")],
            )])
            .unwrap();
        controller.decode().unwrap();
        controller.hold(lock_key("challenge:cancelled.example.test").await);

        let mut ca = ScriptedCa::new(ChallengeStatus::Pending, &[]);
        cancel.cancel();
        let result = controller.validate(&mut ca).await;

        assert!(matches!(result, Err(AcmeError::Aborted(_))));
        assert_eq!(controller.state(), ChallengeState::Aborted);
        assert!(controller.is_terminal());
        assert!(is_free("challenge:cancelled.example.test").await);
        assert!(matches!(
            controller.validate(&mut ca).await,
            Err(AcmeError::OutOfOrder { .. })
        ));
        assert_eq!(ca.submits, 0);
    }

    #[tokio::test]
    async fn test_guard_released_on_terminal_state() {
        let mut controller = decoded(ChallengeStatus::Pending);
        controller.hold(lock_key("challenge:held.example.test").await);
        assert!(!is_free("challenge:held.example.test").await);

        let mut ca = ScriptedCa::new(ChallengeStatus::Valid, &[]);
        assert!(controller.validate(&mut ca).await.unwrap());
        assert!(is_free("challenge:held.example.test").await);
    }

    #[test]
    fn test_status_from_wire() {
        assert_eq!(ChallengeStatus::from_wire("pending"), ChallengeStatus::Pending);
        assert_eq!(ChallengeStatus::from_wire("valid"), ChallengeStatus::Valid);
        assert_eq!(ChallengeStatus::from_wire("deactivated"), ChallengeStatus::Invalid);
        assert!(!ChallengeStatus::Processing.is_terminal());
    }
}
