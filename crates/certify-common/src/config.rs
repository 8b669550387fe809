use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
pub const LETSENCRYPT_LEGACY_PRODUCTION: &str = "https://acme-v01.api.letsencrypt.org/directory";
pub const LETSENCRYPT_LEGACY_STAGING: &str = "https://acme-staging.api.letsencrypt.org/directory";
pub const OFFLINE_DIRECTORY: &str = "offline://self-signed";

/// Smallest RSA modulus accepted for certificate keys; the signer
/// refuses anything shorter
pub const MIN_RSA_KEY_BITS: u32 = 2048;

/// ACME protocol generation spoken by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// Pre-standard ACME (Let's Encrypt v1 endpoints)
    Legacy,
    /// RFC 8555
    #[default]
    Current,
    /// No CA: self-signed certificates, local challenge self-check
    Offline,
}

impl ProtocolKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "legacy" | "v1" | "acme-v1" => Some(Self::Legacy),
            "current" | "v2" | "acme-v2" | "rfc8555" => Some(Self::Current),
            "offline" | "self-signed" | "selfsigned" => Some(Self::Offline),
            _ => None,
        }
    }

    /// Directory URL used when none is configured explicitly
    pub fn default_directory(&self, staging: bool) -> &'static str {
        match (self, staging) {
            (Self::Legacy, false) => LETSENCRYPT_LEGACY_PRODUCTION,
            (Self::Legacy, true) => LETSENCRYPT_LEGACY_STAGING,
            (Self::Current, false) => LETSENCRYPT_PRODUCTION,
            (Self::Current, true) => LETSENCRYPT_STAGING,
            (Self::Offline, _) => OFFLINE_DIRECTORY,
        }
    }
}

/// Settings handed to a provider at construction time.
///
/// Nothing in the ACME crates reads ambient state; everything they need comes
/// through this value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentSettings {
    /// Protocol variant selected for the provider
    pub protocol: ProtocolKind,
    /// ACME directory URL; empty means "protocol default"
    pub directory_url: String,
    /// Use the CA's staging environment when picking the default directory
    pub staging: bool,
    /// Root under which account credentials and the certificate index live
    pub storage_path: PathBuf,
    /// Delay between two status polls
    pub poll_interval_ms: u64,
    /// Upper bound on status polls before giving up
    pub poll_max_attempts: u32,
    /// RSA modulus size for certificate keys
    pub rsa_key_bits: u32,
    /// Password protecting generated PKCS#12 bundles
    pub pfx_password: String,
    /// Timeout applied to every HTTP request
    pub http_timeout_secs: u64,
    /// Offline provider: base URL used instead of `http://{domain}` for the self-check
    pub self_check_base_url: Option<String>,
    /// Offline provider: validity of self-signed certificates
    pub offline_validity_days: u32,
    /// Days before expiry at which a certificate is due for renewal
    pub renewal_threshold_days: u32,
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        Self {
            protocol: ProtocolKind::Current,
            directory_url: String::new(),
            staging: false,
            storage_path: PathBuf::from("/var/lib/certify/acme"),
            poll_interval_ms: 2000,
            poll_max_attempts: 10,
            rsa_key_bits: 2048,
            pfx_password: String::new(),
            http_timeout_secs: 30,
            self_check_base_url: None,
            offline_validity_days: 90,
            renewal_threshold_days: 30,
        }
    }
}

impl EnvironmentSettings {
    /// Settings for the given protocol, everything else default
    pub fn for_protocol(protocol: ProtocolKind) -> Self {
        Self {
            protocol,
            ..Self::default()
        }
    }

    /// Loads settings from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads settings through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("ACME_PROTOCOL") {
            match ProtocolKind::parse(&v) {
                Some(protocol) => config.protocol = protocol,
                None => warn!(value = %v, "Unknown ACME_PROTOCOL, keeping default"),
            }
        }
        if let Some(v) = lookup("ACME_DIRECTORY_URL") {
            config.directory_url = v;
        }
        if let Some(v) = lookup("ACME_STAGING") {
            config.staging = parse_flag(&v);
        }
        if let Some(v) = lookup("ACME_STORAGE_PATH") {
            config.storage_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ACME_POLL_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                config.poll_interval_ms = ms;
            }
        }
        if let Some(v) = lookup("ACME_POLL_ATTEMPTS") {
            if let Ok(attempts) = v.parse() {
                config.poll_max_attempts = attempts;
            }
        }
        if let Some(v) = lookup("ACME_RSA_KEY_BITS") {
            if let Ok(bits) = v.parse() {
                config.rsa_key_bits = bits;
            }
        }
        if let Some(v) = lookup("ACME_PFX_PASSWORD") {
            config.pfx_password = v;
        }
        if let Some(v) = lookup("ACME_HTTP_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                config.http_timeout_secs = secs;
            }
        }
        if let Some(v) = lookup("ACME_SELF_CHECK_BASE_URL") {
            config.self_check_base_url = Some(v);
        }
        if let Some(v) = lookup("ACME_OFFLINE_VALIDITY_DAYS") {
            if let Ok(days) = v.parse() {
                config.offline_validity_days = days;
            }
        }
        if let Some(v) = lookup("ACME_RENEWAL_THRESHOLD_DAYS") {
            if let Ok(days) = v.parse() {
                config.renewal_threshold_days = days;
            }
        }

        config
    }

    /// Directory URL actually used by the provider
    pub fn effective_directory(&self) -> String {
        if self.directory_url.is_empty() {
            self.protocol.default_directory(self.staging).to_string()
        } else {
            self.directory_url.clone()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// RSA key size, never below [`MIN_RSA_KEY_BITS`]
    pub fn effective_rsa_key_bits(&self) -> u32 {
        if self.rsa_key_bits < MIN_RSA_KEY_BITS {
            warn!(
                requested = self.rsa_key_bits,
                used = MIN_RSA_KEY_BITS,
                "RSA key size below minimum, clamping"
            );
            MIN_RSA_KEY_BITS
        } else {
            self.rsa_key_bits
        }
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(vars: &[(&str, &str)]) -> EnvironmentSettings {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvironmentSettings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = EnvironmentSettings::default();
        assert_eq!(settings.protocol, ProtocolKind::Current);
        assert_eq!(settings.poll_max_attempts, 10);
        assert_eq!(settings.poll_interval(), Duration::from_secs(2));
        assert_eq!(settings.effective_directory(), LETSENCRYPT_PRODUCTION);
    }

    #[test]
    fn test_from_lookup() {
        let settings = settings_from(&[
            ("ACME_PROTOCOL", "v1"),
            ("ACME_STAGING", "true"),
            ("ACME_POLL_ATTEMPTS", "4"),
            ("ACME_POLL_INTERVAL_MS", "250"),
            ("ACME_STORAGE_PATH", "/tmp/acme"),
        ]);

        assert_eq!(settings.protocol, ProtocolKind::Legacy);
        assert_eq!(settings.poll_max_attempts, 4);
        assert_eq!(settings.poll_interval(), Duration::from_millis(250));
        assert_eq!(settings.storage_path, PathBuf::from("/tmp/acme"));
        assert_eq!(settings.effective_directory(), LETSENCRYPT_LEGACY_STAGING);
    }

    #[test]
    fn test_unparseable_values_keep_defaults() {
        let settings = settings_from(&[
            ("ACME_PROTOCOL", "carrier-pigeon"),
            ("ACME_POLL_ATTEMPTS", "many"),
        ]);
        assert_eq!(settings.protocol, ProtocolKind::Current);
        assert_eq!(settings.poll_max_attempts, 10);
    }

    #[test]
    fn test_explicit_directory_wins() {
        let settings = settings_from(&[
            ("ACME_PROTOCOL", "offline"),
            ("ACME_DIRECTORY_URL", "https://ca.internal/directory"),
        ]);
        assert_eq!(settings.effective_directory(), "https://ca.internal/directory");

        let offline = EnvironmentSettings::for_protocol(ProtocolKind::Offline);
        assert_eq!(offline.effective_directory(), OFFLINE_DIRECTORY);
    }

    #[test]
    fn test_rsa_key_bits_clamped() {
        let mut settings = EnvironmentSettings::default();
        for requested in [512, 1024, 2047] {
            settings.rsa_key_bits = requested;
            assert_eq!(settings.effective_rsa_key_bits(), 2048);
        }
        settings.rsa_key_bits = 4096;
        assert_eq!(settings.effective_rsa_key_bits(), 4096);
    }

    #[test]
    fn test_settings_json_partial() {
        let settings: EnvironmentSettings =
            serde_json::from_str(r#"{"protocol":"offline","poll_max_attempts":3}"#).unwrap();
        assert_eq!(settings.protocol, ProtocolKind::Offline);
        assert_eq!(settings.poll_max_attempts, 3);
        assert_eq!(settings.rsa_key_bits, 2048);
    }

    #[test]
    fn test_lookup_key_bits_below_floor() {
        let settings = settings_from(&[("ACME_RSA_KEY_BITS", "1024")]);
        assert_eq!(settings.rsa_key_bits, 1024);
        assert_eq!(settings.effective_rsa_key_bits(), MIN_RSA_KEY_BITS);
    }
}
