use certify_acme::{AccountStore, AcmeError, AcmeProvider, CertificateBundle};
use certify_common::config::OFFLINE_DIRECTORY;
use certify_common::{EnvironmentSettings, ProtocolKind};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const EMAIL: &str = "ops@example.com";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("certify_acme=debug")
        .try_init();
}

fn settings(server: &MockServer) -> EnvironmentSettings {
    init_tracing();
    EnvironmentSettings {
        protocol: ProtocolKind::Offline,
        self_check_base_url: Some(server.uri()),
        poll_interval_ms: 10,
        poll_max_attempts: 3,
        ..EnvironmentSettings::default()
    }
}

fn account_file(storage: &Path) -> PathBuf {
    storage
        .join(AccountStore::account_hash(EMAIL, OFFLINE_DIRECTORY))
        .join("account.json")
}

/// Caller-side flow: stop before download when validation fails
async fn issue(
    provider: &mut AcmeProvider,
    output: &Path,
) -> anyhow::Result<Option<CertificateBundle>> {
    if !provider.validate_challenge().await? {
        return Ok(None);
    }
    let domain = provider.domain().to_string();
    let bundle = provider
        .download_certificate("app", &domain, output, &[])
        .await?;
    Ok(Some(bundle))
}

async fn serve(server: &MockServer, file_path: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/{}", file_path)))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_offline_issuance_end_to_end() {
    let server = MockServer::start().await;
    let storage = tempdir().unwrap();
    let output = tempdir().unwrap();

    let mut provider = AcmeProvider::new(settings(&server), "app.example.test").unwrap();
    provider.init_registration(storage.path(), EMAIL).await.unwrap();

    let primary = account_file(storage.path());
    let backup = AccountStore::backup_path(&primary);
    for file in [&primary, &backup] {
        let content = std::fs::read_to_string(file).unwrap();
        assert!(!content.is_empty());
        let json: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(json["AccountEmail"], EMAIL);
        assert_eq!(json["ServiceUri"], OFFLINE_DIRECTORY);
    }

    let instructions = provider.generate_http_challenge().await.unwrap();
    assert!(
        instructions
            .challenge_file_path
            .starts_with(".well-known/acme-challenge/")
    );
    assert_eq!(
        instructions.challenge_url,
        format!("http://app.example.test/{}", instructions.challenge_file_path)
    );
    serve(
        &server,
        &instructions.challenge_file_path,
        &instructions.challenge_content,
    )
    .await;

    let bundle = issue(&mut provider, output.path()).await.unwrap().unwrap();

    let pfx_path = bundle.pfx_pem_file.clone().unwrap();
    assert_eq!(pfx_path, output.path().join("app-all.pfx"));
    let pfx_bytes = std::fs::read(&pfx_path).unwrap();
    assert!(!pfx_bytes.is_empty());
    let pfx = p12::PFX::parse(&pfx_bytes).unwrap();
    assert!(pfx.verify_mac(""));

    for file in bundle.files() {
        assert!(file.starts_with(output.path()));
        assert!(std::fs::metadata(file).unwrap().len() > 0);
    }

    let listed = provider.list_certificates().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].domain, "app.example.test");
    assert_eq!(listed[0].bundle, bundle);
    assert!(provider.certificates_needing_renewal(30).unwrap().is_empty());
    assert_eq!(provider.certificates_needing_renewal(365).unwrap().len(), 1);

    provider.dispose();
    provider.dispose();
}

#[tokio::test]
async fn test_wrong_content_stops_the_flow() {
    let server = MockServer::start().await;
    let storage = tempdir().unwrap();
    let output = tempdir().unwrap();

    let mut provider = AcmeProvider::new(settings(&server), "wrong.example.test").unwrap();
    provider.init_registration(storage.path(), EMAIL).await.unwrap();

    let instructions = provider.generate_http_challenge().await.unwrap();
    serve(&server, &instructions.challenge_file_path, "not-the-key-authorization").await;

    let started = std::time::Instant::now();
    assert!(issue(&mut provider, output.path()).await.unwrap().is_none());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(std::fs::read_dir(output.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_unserved_challenge_stops_the_flow() {
    let server = MockServer::start().await;
    let storage = tempdir().unwrap();
    let output = tempdir().unwrap();

    let mut provider = AcmeProvider::new(settings(&server), "unserved.example.test").unwrap();
    provider.init_registration(storage.path(), EMAIL).await.unwrap();
    provider.generate_http_challenge().await.unwrap();

    assert!(issue(&mut provider, output.path()).await.unwrap().is_none());
    assert_eq!(std::fs::read_dir(output.path()).unwrap().count(), 0);
    assert!(provider.list_certificates().unwrap().is_empty());
}

#[tokio::test]
async fn test_truncated_account_restored_from_backup() {
    let server = MockServer::start().await;
    let storage = tempdir().unwrap();

    let payload = r#"{"Key":"AAAA","ServiceUri":"x","AccountEmail":"o"}"#;
    assert_eq!(payload.len(), 50);

    let primary = account_file(storage.path());
    std::fs::create_dir_all(primary.parent().unwrap()).unwrap();
    std::fs::write(&primary, b"").unwrap();
    std::fs::write(AccountStore::backup_path(&primary), payload).unwrap();

    let mut provider = AcmeProvider::new(settings(&server), "restore.example.test").unwrap();
    provider.init_registration(storage.path(), EMAIL).await.unwrap();

    assert_eq!(std::fs::metadata(&primary).unwrap().len(), 50);
    assert_eq!(std::fs::read_to_string(&primary).unwrap(), payload);

    // the restored account is usable
    let instructions = provider.generate_http_challenge().await.unwrap();
    assert!(!instructions.challenge_content.is_empty());
}

#[tokio::test]
async fn test_registration_is_idempotent() {
    let server = MockServer::start().await;
    let storage = tempdir().unwrap();

    let mut provider = AcmeProvider::new(settings(&server), "again.example.test").unwrap();
    provider.init_registration(storage.path(), EMAIL).await.unwrap();
    let first = std::fs::read(account_file(storage.path())).unwrap();

    provider.init_registration(storage.path(), EMAIL).await.unwrap();
    let mut other = AcmeProvider::new(settings(&server), "again.example.test").unwrap();
    other.init_registration(storage.path(), EMAIL).await.unwrap();

    assert_eq!(std::fs::read(account_file(storage.path())).unwrap(), first);
}

#[tokio::test]
async fn test_unrecoverable_account_file() {
    let server = MockServer::start().await;
    let storage = tempdir().unwrap();

    let primary = account_file(storage.path());
    std::fs::create_dir_all(primary.parent().unwrap()).unwrap();
    std::fs::write(&primary, "{ truncated").unwrap();

    let mut provider = AcmeProvider::new(settings(&server), "broken.example.test").unwrap();
    match provider.init_registration(storage.path(), EMAIL).await {
        Err(AcmeError::AccountLoad { path, .. }) => assert_eq!(path, primary),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_cancellation_during_validation() {
    let server = MockServer::start().await;
    let storage = tempdir().unwrap();

    let slow = EnvironmentSettings {
        poll_interval_ms: 60_000,
        ..settings(&server)
    };
    let mut provider = AcmeProvider::new(slow, "cancel.example.test").unwrap();
    provider.init_registration(storage.path(), EMAIL).await.unwrap();
    provider.generate_http_challenge().await.unwrap();

    let cancel = provider.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(10), provider.validate_challenge())
        .await
        .expect("validation should stop once cancelled");
    assert!(matches!(result, Err(AcmeError::Aborted(_))));

    // the aborted order is dead, a new one starts with a fresh token
    assert!(matches!(
        provider.validate_challenge().await,
        Err(AcmeError::OutOfOrder { .. })
    ));
    let restarted = tokio::time::timeout(Duration::from_secs(5), provider.generate_http_challenge())
        .await
        .expect("domain lock should be free after cancellation")
        .unwrap();
    assert!(!restarted.challenge_content.is_empty());
    assert!(!provider.cancellation_token().is_cancelled());
}

#[tokio::test]
async fn test_cancellation_while_waiting_for_domain() {
    let server = MockServer::start().await;
    let storage = tempdir().unwrap();

    let mut first = AcmeProvider::new(settings(&server), "queued.example.test").unwrap();
    let mut second = AcmeProvider::new(settings(&server), "queued.example.test").unwrap();
    first.init_registration(storage.path(), EMAIL).await.unwrap();
    second.init_registration(storage.path(), EMAIL).await.unwrap();
    first.generate_http_challenge().await.unwrap();

    let cancel = second.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), second.generate_http_challenge())
        .await
        .expect("waiting for the domain should stop once cancelled");
    assert!(matches!(result, Err(AcmeError::Aborted(_))));
}

#[tokio::test]
async fn test_second_challenge_for_domain_waits_for_first() {
    let server = MockServer::start().await;
    let storage = tempdir().unwrap();

    let mut first = AcmeProvider::new(settings(&server), "locked.example.test").unwrap();
    let mut second = AcmeProvider::new(settings(&server), "locked.example.test").unwrap();
    first.init_registration(storage.path(), EMAIL).await.unwrap();
    second.init_registration(storage.path(), EMAIL).await.unwrap();

    first.generate_http_challenge().await.unwrap();
    let blocked =
        tokio::time::timeout(Duration::from_millis(200), second.generate_http_challenge()).await;
    assert!(blocked.is_err());

    first.dispose();
    let instructions =
        tokio::time::timeout(Duration::from_secs(5), second.generate_http_challenge())
            .await
            .expect("lock should be released by dispose")
            .unwrap();
    assert!(!instructions.challenge_content.is_empty());
}

#[tokio::test]
async fn test_alternate_hosts_rejected_for_any_host() {
    let server = MockServer::start().await;
    let storage = tempdir().unwrap();
    let output = tempdir().unwrap();

    let mut provider = AcmeProvider::new(settings(&server), "san.example.test").unwrap();
    provider.init_registration(storage.path(), EMAIL).await.unwrap();

    for host in ["san.example.test", "example.org", "x.y.z"] {
        let result = provider
            .download_certificate("app", host, output.path(), &["www.example.test".to_string()])
            .await;
        assert!(matches!(result, Err(AcmeError::UnsupportedRequest(_))));
    }
}
