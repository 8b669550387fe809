//! Key, CSR and certificate artifact assembly
//!
//! Every artifact is written as soon as it exists, so a rejected CSR still
//! leaves the generated key and request on disk.

use crate::codec::{KeyPairEnvelope, serialize_key_pair};
use crate::jws::b64url;
use crate::types::{AcmeError, AcmeResult, CertificateBundle};
use async_trait::async_trait;
use certify_ca::{RsaKey, build_pfx, der_to_pem, is_valid_domain};
use certify_common::EnvironmentSettings;
use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Ephemeral key pair and CSR for one issuance
pub struct CertificateRequest {
    pub common_name: String,
    pub key: RsaKey,
    pub csr_der: Vec<u8>,
    pub csr_pem: String,
    pub generated_at: DateTime<Utc>,
}

impl CertificateRequest {
    pub fn generate(common_name: &str, key_bits: u32) -> AcmeResult<Self> {
        let key = RsaKey::generate(key_bits)?;
        let key_pair = key.to_key_pair()?;

        let mut params = CertificateParams::new(vec![common_name.to_string()])
            .map_err(|e| AcmeError::KeyFormat(format!("Invalid CSR subject: {}", e)))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| AcmeError::KeyFormat(format!("Failed to create CSR: {}", e)))?;
        let csr_pem = csr
            .pem()
            .map_err(|e| AcmeError::KeyFormat(format!("Failed to encode CSR: {}", e)))?;

        Ok(Self {
            common_name: common_name.to_string(),
            key,
            csr_der: csr.der().to_vec(),
            csr_pem,
            generated_at: Utc::now(),
        })
    }

    /// CSR as the CA expects it on the wire
    pub fn csr_b64url(&self) -> String {
        b64url(&self.csr_der)
    }
}

/// CA answer to a CSR submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsrOutcome {
    Created {
        certificate_der: Vec<u8>,
        /// Issuer certificates, nearest first
        issuers: Vec<Vec<u8>>,
    },
    Rejected {
        status: u16,
        detail: String,
    },
}

/// Anything that turns a CSR into a certificate
#[async_trait]
pub trait CsrSigner: Send {
    async fn submit(&mut self, request: &CertificateRequest) -> AcmeResult<CsrOutcome>;
}

/// Output file naming
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLayout {
    /// `{name}-key.pem`, `{name}-crt.der`, ... plus key/CSR generation records
    Named,
    /// `{guid}.key`, `{guid}.cer`, ... with a fresh GUID per download
    Guid(String),
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct KeyGenRecord {
    algorithm: &'static str,
    bits: usize,
    generated_at: DateTime<Utc>,
    #[serde(flatten)]
    key: KeyPairEnvelope,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CsrGenRecord<'a> {
    common_name: &'a str,
    alternate_names: &'a [String],
    generated_at: DateTime<Utc>,
    csr: String,
}

pub struct ArtifactAssembler {
    name: String,
    output_dir: PathBuf,
    layout: ArtifactLayout,
    key_bits: u32,
    pfx_password: String,
}

impl ArtifactAssembler {
    pub fn new<P: AsRef<Path>>(
        name: &str,
        output_dir: P,
        layout: ArtifactLayout,
        settings: &EnvironmentSettings,
    ) -> Self {
        Self {
            name: name.to_string(),
            output_dir: output_dir.as_ref().to_path_buf(),
            layout,
            key_bits: settings.effective_rsa_key_bits(),
            pfx_password: settings.pfx_password.clone(),
        }
    }

    /// Fails for any SAN request
    pub fn ensure_single_host(main_host: &str, alternate_hosts: &[String]) -> AcmeResult<()> {
        if alternate_hosts.is_empty() {
            return Ok(());
        }
        Err(AcmeError::UnsupportedRequest(format!(
            "Alternate hosts {:?} requested for {}; only single-host certificates are issued",
            alternate_hosts, main_host
        )))
    }

    fn artifact_path(&self, artifact: &str, guid_ext: &str) -> PathBuf {
        match &self.layout {
            ArtifactLayout::Named => self.output_dir.join(format!("{}-{}", self.name, artifact)),
            ArtifactLayout::Guid(guid) => self.output_dir.join(format!("{}.{}", guid, guid_ext)),
        }
    }

    async fn write(&self, path: PathBuf, content: &[u8]) -> AcmeResult<PathBuf> {
        tokio::fs::write(&path, content).await?;
        debug!(path = %path.display(), bytes = content.len(), "Wrote artifact");
        Ok(path)
    }

    /// Generates a key and CSR for `main_host`, has `signer` issue it and
    /// writes every artifact into the output directory
    pub async fn assemble<S>(
        &self,
        main_host: &str,
        alternate_hosts: &[String],
        signer: &mut S,
    ) -> AcmeResult<CertificateBundle>
    where
        S: CsrSigner + ?Sized,
    {
        Self::ensure_single_host(main_host, alternate_hosts)?;
        if !is_valid_domain(main_host) {
            return Err(AcmeError::ConfigError(format!(
                "Invalid host name: {}",
                main_host
            )));
        }

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let named = self.layout == ArtifactLayout::Named;
        let mut bundle = CertificateBundle {
            name: self.name.clone(),
            ..Default::default()
        };

        info!(host = %main_host, bits = self.key_bits, "Generating certificate key and CSR");
        let request = CertificateRequest::generate(main_host, self.key_bits)?;

        if named {
            let record = KeyGenRecord {
                algorithm: "RSA",
                bits: request.key.bits()?,
                generated_at: request.generated_at,
                key: serde_json::from_str(&serialize_key_pair(&request.key)?)?,
            };
            bundle.key_gen_file = Some(
                self.write(
                    self.artifact_path("gen-key.json", "key.json"),
                    &serde_json::to_vec_pretty(&record)?,
                )
                .await?,
            );
        }
        bundle.key_pem_file = Some(
            self.write(self.artifact_path("key.pem", "key"), request.key.to_pem().as_bytes())
                .await?,
        );
        if named {
            let record = CsrGenRecord {
                common_name: &request.common_name,
                alternate_names: alternate_hosts,
                generated_at: request.generated_at,
                csr: request.csr_b64url(),
            };
            bundle.csr_gen_file = Some(
                self.write(
                    self.artifact_path("gen-csr.json", "csr.json"),
                    &serde_json::to_vec_pretty(&record)?,
                )
                .await?,
            );
        }
        bundle.csr_pem_file = Some(
            self.write(self.artifact_path("csr.pem", "csr"), request.csr_pem.as_bytes())
                .await?,
        );

        let (certificate_der, issuers) = match signer.submit(&request).await? {
            CsrOutcome::Created {
                certificate_der,
                issuers,
            } => (certificate_der, issuers),
            CsrOutcome::Rejected { status, detail } => {
                return Err(AcmeError::CertificateRequest { status, detail });
            }
        };

        bundle.crt_der_file = Some(
            self.write(self.artifact_path("crt.der", "cer"), &certificate_der)
                .await?,
        );
        let leaf_pem = der_to_pem("CERTIFICATE", &certificate_der);
        bundle.crt_pem_file = Some(
            self.write(self.artifact_path("crt.pem", "crt"), leaf_pem.as_bytes())
                .await?,
        );

        let mut chain_pem = leaf_pem;
        for issuer in &issuers {
            chain_pem.push_str(&der_to_pem("CERTIFICATE", issuer));
        }
        bundle.chain_pem_file = Some(
            self.write(self.artifact_path("chain.pem", "pem"), chain_pem.as_bytes())
                .await?,
        );

        let pfx = build_pfx(
            &certificate_der,
            request.key.private_key_der(),
            issuers.first().map(Vec::as_slice),
            &self.pfx_password,
            main_host,
        )?;
        bundle.pfx_pem_file = Some(self.write(self.artifact_path("all.pfx", "pfx"), &pfx).await?);

        info!(
            name = %self.name,
            host = %main_host,
            files = bundle.files().len(),
            "Certificate artifacts written"
        );
        Ok(bundle)
    }
}
