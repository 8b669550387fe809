use crate::types::{CaError, CaResult};
use pem::{EncodeConfig, LineEnding, Pem};

/// Encodes DER bytes as an LF-terminated PEM block with 64-column lines
pub fn der_to_pem(label: &str, der: &[u8]) -> String {
    pem::encode_config(
        &Pem::new(label, der),
        EncodeConfig::new().set_line_ending(LineEnding::LF),
    )
}

/// Extracts every `CERTIFICATE` block of a PEM chain, leaf first
pub fn pem_to_der_chain(pem: &str) -> CaResult<Vec<Vec<u8>>> {
    let chain = rustls_pemfile::certs(&mut pem.as_bytes())
        .map(|cert| cert.map(|c| c.to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CaError::ParsingError(format!("Failed to parse certificate chain: {}", e)))?;

    if chain.is_empty() {
        return Err(CaError::ParsingError(
            "No certificate found in PEM input".to_string(),
        ));
    }

    Ok(chain)
}

/// Builds a PKCS#12 bundle from a leaf certificate, its PKCS#8 key and an
/// optional issuer certificate (all DER)
pub fn build_pfx(
    cert_der: &[u8],
    key_pkcs8_der: &[u8],
    issuer_der: Option<&[u8]>,
    password: &str,
    friendly_name: &str,
) -> CaResult<Vec<u8>> {
    let pfx = p12::PFX::new(cert_der, key_pkcs8_der, issuer_der, password, friendly_name)
        .ok_or_else(|| CaError::Pkcs12("Failed to assemble PKCS#12 bundle".to_string()))?;
    Ok(pfx.to_der())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::RsaKey;
    use crate::ca::self_signed_certificate;

    #[test]
    fn test_der_to_pem_wraps_lines() {
        let der = vec![0xAB; 100];
        let pem = der_to_pem("CERTIFICATE", &der);
        let lines: Vec<&str> = pem.lines().collect();
        assert_eq!(lines.first(), Some(&"-----BEGIN CERTIFICATE-----"));
        assert_eq!(lines.last(), Some(&"-----END CERTIFICATE-----"));
        assert!(lines[1..lines.len() - 1].iter().all(|l| l.len() <= 64));
        assert!(!pem.contains('\r'));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));

        let parsed = pem::parse(&pem).unwrap();
        assert_eq!(parsed.tag(), "CERTIFICATE");
        assert_eq!(parsed.contents(), der.as_slice());
    }

    #[test]
    fn test_der_to_pem_exact_line_multiple() {
        // 48 bytes encode to exactly one full 64-column line
        let pem = der_to_pem("PRIVATE KEY", &[0x01; 48]);
        let lines: Vec<&str> = pem.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1].len(), 64);
        assert!(!lines.iter().any(|l| l.is_empty()));
    }

    #[test]
    fn test_pem_chain_roundtrip() {
        let key = RsaKey::generate(2048).unwrap();
        let cert = self_signed_certificate("chain.example.test", &key, 30).unwrap();
        let der = cert.der().to_vec();

        let chain_pem = format!(
            "{}{}",
            der_to_pem("CERTIFICATE", &der),
            der_to_pem("CERTIFICATE", &der)
        );
        let chain = pem_to_der_chain(&chain_pem).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0], der);
    }

    #[test]
    fn test_empty_chain_rejected() {
        assert!(matches!(
            pem_to_der_chain("nothing here"),
            Err(CaError::ParsingError(_))
        ));
    }

    #[test]
    fn test_build_pfx() {
        let key = RsaKey::generate(2048).unwrap();
        let cert = self_signed_certificate("pfx.example.test", &key, 30).unwrap();

        let bytes = build_pfx(cert.der(), key.private_key_der(), None, "", "pfx").unwrap();
        assert!(!bytes.is_empty());

        let parsed = p12::PFX::parse(&bytes).unwrap();
        assert!(parsed.verify_mac(""));
    }
}
