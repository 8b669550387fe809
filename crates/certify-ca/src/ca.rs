use crate::export::{build_pfx, pem_to_der_chain};
use crate::keys::RsaKey;
use crate::storage::{Keystore, LeafFile};
use crate::types::{CaError, CaResult, IssuedLeaf, LocalCaSettings};
use chrono::{Duration, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, info};

fn validity(params: &mut CertificateParams, days: u32) {
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(days as i64);
}

fn subject(common_name: &str, organization: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    if let Some(org) = organization {
        dn.push(DnType::OrganizationName, org);
    }
    dn
}

fn server_params(
    domains: &[String],
    organization: Option<&str>,
    validity_days: u32,
) -> CaResult<CertificateParams> {
    let first = domains
        .first()
        .ok_or_else(|| CaError::InvalidDomain("No domains provided".to_string()))?;
    if let Some(bad) = domains.iter().find(|d| !is_valid_domain(d)) {
        return Err(CaError::InvalidDomain(bad.clone()));
    }

    let mut params = CertificateParams::new(domains.to_vec())
        .map_err(|e| CaError::Signing(format!("Bad subject names: {}", e)))?;
    params.distinguished_name = subject(first, organization);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    validity(&mut params, validity_days);
    Ok(params)
}

/// Self-signed server certificate for `common_name`, signed with `key`
pub fn self_signed_certificate(
    common_name: &str,
    key: &RsaKey,
    validity_days: u32,
) -> CaResult<Certificate> {
    let params = server_params(&[common_name.to_string()], None, validity_days)?;
    params
        .self_signed(&key.to_key_pair()?)
        .map_err(|e| CaError::Signing(format!("Self-signing {} failed: {}", common_name, e)))
}

/// Loaded root: the signing handle plus the exact PEM kept on disk
struct Root {
    cert: Certificate,
    key: KeyPair,
    pem: String,
}

/// Local root CA whose key and issued leaves live in a [`Keystore`]
pub struct CertificateAuthority {
    settings: LocalCaSettings,
    keystore: Keystore,
    root: RwLock<Option<Root>>,
}

impl CertificateAuthority {
    pub fn new(settings: LocalCaSettings) -> Self {
        let keystore = Keystore::new(&settings.keystore_dir);
        Self {
            settings,
            keystore,
            root: RwLock::new(None),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.keystore.has_root()
    }

    /// Loads the root from the keystore, creating it on first use
    pub async fn init(&self) -> CaResult<()> {
        self.keystore.init()?;

        let root = if self.keystore.has_root() {
            self.load_root()?
        } else {
            self.create_root()?
        };
        *self.root.write().await = Some(root);
        Ok(())
    }

    fn root_params(&self) -> CaResult<CertificateParams> {
        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| CaError::Signing(format!("Bad root parameters: {}", e)))?;
        params.distinguished_name =
            subject(&self.settings.root_name, Some(&self.settings.organization));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        validity(&mut params, self.settings.root_validity_days);
        Ok(params)
    }

    fn create_root(&self) -> CaResult<Root> {
        let rsa = RsaKey::generate(self.settings.key_bits)?;
        let key = rsa.to_key_pair()?;
        let cert = self
            .root_params()?
            .self_signed(&key)
            .map_err(|e| CaError::Signing(format!("Root self-signing failed: {}", e)))?;
        let pem = cert.pem();

        self.keystore.write(self.keystore.root_key_path(), rsa.to_pem())?;
        self.keystore.write(self.keystore.root_cert_path(), &pem)?;
        info!(name = %self.settings.root_name, "Created local root CA");

        Ok(Root { cert, key, pem })
    }

    /// The signing handle is rebuilt from the stored key with the same
    /// subject, so leaves chain to the certificate on disk.
    fn load_root(&self) -> CaResult<Root> {
        let rsa = RsaKey::from_pem(&self.keystore.read_string(self.keystore.root_key_path())?)?;
        let key = rsa.to_key_pair()?;
        let cert = self
            .root_params()?
            .self_signed(&key)
            .map_err(|e| CaError::Signing(format!("Root reload failed: {}", e)))?;
        let pem = self.keystore.read_string(self.keystore.root_cert_path())?;

        debug!(path = %self.keystore.root_cert_path().display(), "Loaded local root CA");
        Ok(Root { cert, key, pem })
    }

    pub async fn root_pem(&self) -> CaResult<String> {
        self.root
            .read()
            .await
            .as_ref()
            .map(|root| root.pem.clone())
            .ok_or(CaError::Uninitialized)
    }

    pub async fn root_der(&self) -> CaResult<Vec<u8>> {
        pem_to_der_chain(&self.root_pem().await?)?
            .into_iter()
            .next()
            .ok_or_else(|| CaError::ParsingError("Stored root holds no certificate".to_string()))
    }

    /// Signs a new RSA leaf for `domains`; the first name becomes the subject CN
    pub async fn issue(&self, domains: &[String]) -> CaResult<IssuedLeaf> {
        let mut params = server_params(
            domains,
            Some(&self.settings.organization),
            self.settings.leaf_validity_days,
        )?;

        let id = uuid::Uuid::new_v4();
        let mut serial = id.as_bytes().to_vec();
        serial[0] &= 0x7f;
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        let guard = self.root.read().await;
        let root = guard.as_ref().ok_or(CaError::Uninitialized)?;

        let key = RsaKey::generate(self.settings.key_bits)?;
        let cert = params
            .signed_by(&key.to_key_pair()?, &root.cert, &root.key)
            .map_err(|e| CaError::Signing(format!("Leaf signing failed: {}", e)))?;

        let id = id.to_string();
        let cert_path = self.keystore.leaf_path(&id, LeafFile::CertPem);
        let key_path = self.keystore.leaf_path(&id, LeafFile::KeyPem);
        self.keystore.write(&cert_path, cert.pem())?;
        self.keystore
            .write(self.keystore.leaf_path(&id, LeafFile::CertDer), cert.der())?;
        self.keystore.write(&key_path, key.to_pem())?;

        let issued_at = Utc::now();
        let leaf = IssuedLeaf {
            id,
            domains: domains.to_vec(),
            serial: hex::encode(&serial),
            issued_at,
            expires_at: issued_at + Duration::days(self.settings.leaf_validity_days as i64),
            cert_path,
            key_path,
        };

        let mut index = self.keystore.load_index()?;
        index.push(leaf.clone());
        self.keystore.save_index(&index)?;

        info!(id = %leaf.id, domains = ?leaf.domains, serial = %leaf.serial, "Issued leaf from local CA");
        Ok(leaf)
    }

    /// Bundles an issued leaf with its key and the root as PKCS#12
    pub async fn export_pfx(&self, id: &str, password: &str) -> CaResult<PathBuf> {
        let leaf = self.leaf(id)?;
        let root_der = self.root_der().await?;
        let cert_der = self
            .keystore
            .read(self.keystore.leaf_path(id, LeafFile::CertDer))?;
        let key = RsaKey::from_pem(&self.keystore.read_string(&leaf.key_path)?)?;
        let friendly_name = leaf.domains.first().map(String::as_str).unwrap_or(id);

        let pfx = build_pfx(
            &cert_der,
            key.private_key_der(),
            Some(&root_der),
            password,
            friendly_name,
        )?;
        let path = self.keystore.leaf_path(id, LeafFile::Pfx);
        self.keystore.write(&path, pfx)?;
        Ok(path)
    }

    pub fn leaves(&self) -> CaResult<Vec<IssuedLeaf>> {
        self.keystore.load_index()
    }

    pub fn leaf(&self, id: &str) -> CaResult<IssuedLeaf> {
        self.keystore
            .load_index()?
            .into_iter()
            .find(|leaf| leaf.id == id)
            .ok_or_else(|| CaError::UnknownLeaf(id.to_string()))
    }
}

/// Hostname syntax check; a wildcard is allowed as the leftmost label only
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    let host = domain.strip_prefix("*.").unwrap_or(domain);
    !host.is_empty()
        && host.split('.').all(|label| {
            (1..=63).contains(&label.len())
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        })
}
