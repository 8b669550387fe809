//! Account credential persistence and the issued-certificate index
//!
//! ```text
//! {storage_root}/
//! ├── index.json
//! └── {sha256(email + "::" + directory_uri)}/
//!     ├── account.json   + account.json.bak        (current, offline)
//!     └── signer.json    + signer.json.bak         (legacy)
//!         registration.json + registration.json.bak
//! ```
//!
//! Every credential file has a sibling `.bak` copy, written only after the
//! primary write has been read back and verified. A zero-length primary found
//! at load time is restored from its backup.

use crate::types::{AcmeError, AcmeResult, IssuedCertificate};
use ring::digest::{SHA256, digest};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex as StdMutex, MutexGuard};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static LOCKS: LazyLock<StdMutex<HashMap<String, Arc<Mutex<()>>>>> =
    LazyLock::new(|| StdMutex::new(HashMap::new()));

fn registry() -> MutexGuard<'static, HashMap<String, Arc<Mutex<()>>>> {
    LOCKS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_for(key: &str) -> Arc<Mutex<()>> {
    let mut locks = registry();
    // left behind by waiters that gave up before acquiring
    locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    locks.entry(key.to_string()).or_default().clone()
}

/// Held lock on one key of the process-wide registry (an account
/// directory, a domain or the certificate index). The registry entry is
/// dropped with the last guard nobody else is waiting on.
pub struct KeyGuard {
    key: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = registry();
        // registry entry + this guard: no other task holds or awaits the key
        if Arc::strong_count(&self.lock) == 2
            && locks
                .get(&self.key)
                .is_some_and(|entry| Arc::ptr_eq(entry, &self.lock))
        {
            locks.remove(&self.key);
        }
    }
}

/// Waits for the process-wide lock on `key`
pub async fn lock_key(key: &str) -> KeyGuard {
    let lock = lock_for(key);
    let guard = lock.clone().lock_owned().await;
    KeyGuard {
        key: key.to_string(),
        lock,
        guard: Some(guard),
    }
}

/// Like [`lock_key`], but gives up with [`AcmeError::Aborted`] once `cancel` fires
pub async fn lock_key_cancellable(key: &str, cancel: &CancellationToken) -> AcmeResult<KeyGuard> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AcmeError::Aborted("waiting for a held lock")),
        guard = lock_key(key) => Ok(guard),
    }
}

/// Credential files of one `(email, directory)` account
#[derive(Debug, Clone)]
pub struct AccountStore {
    account_dir: PathBuf,
}

impl AccountStore {
    pub fn new<P: AsRef<Path>>(storage_root: P, email: &str, directory_uri: &str) -> Self {
        Self {
            account_dir: storage_root
                .as_ref()
                .join(Self::account_hash(email, directory_uri)),
        }
    }

    /// Hex SHA-256 of `email::directory_uri`
    pub fn account_hash(email: &str, directory_uri: &str) -> String {
        let input = format!("{}::{}", email, directory_uri);
        hex::encode(digest(&SHA256, input.as_bytes()).as_ref())
    }

    pub fn account_dir(&self) -> &Path {
        &self.account_dir
    }

    pub fn init(&self) -> AcmeResult<()> {
        fs::create_dir_all(&self.account_dir)?;
        Ok(())
    }

    /// Lock serialising writes to this account directory
    pub async fn lock(&self) -> KeyGuard {
        lock_key(&self.account_dir.to_string_lossy()).await
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.account_dir.join(file_name)
    }

    pub fn backup_path(primary: &Path) -> PathBuf {
        let mut name = primary.as_os_str().to_os_string();
        name.push(".bak");
        PathBuf::from(name)
    }

    /// Whether a primary credential file exists (possibly truncated)
    pub fn exists(&self, file_name: &str) -> bool {
        self.path(file_name).exists()
    }

    /// Replaces a zero-length primary with its backup. Returns true when a
    /// restore happened.
    pub fn restore_from_backup(&self, file_name: &str) -> AcmeResult<bool> {
        let primary = self.path(file_name);
        let backup = Self::backup_path(&primary);

        let truncated = fs::metadata(&primary).map(|m| m.len() == 0).unwrap_or(false);
        if !truncated || !backup.exists() {
            return Ok(false);
        }

        warn!(
            path = %primary.display(),
            backup = %backup.display(),
            "Credential file is empty, restoring from backup"
        );
        fs::copy(&backup, &primary)?;
        Ok(true)
    }

    /// Reads a credential file after backup recovery; `None` when absent
    pub fn read(&self, file_name: &str) -> AcmeResult<Option<String>> {
        let primary = self.path(file_name);
        if !primary.exists() {
            return Ok(None);
        }

        self.restore_from_backup(file_name)?;
        let content = fs::read_to_string(&primary).map_err(|e| AcmeError::AccountLoad {
            path: primary.clone(),
            reason: e.to_string(),
        })?;
        Ok(Some(content))
    }

    /// Reads and parses a JSON credential file
    pub fn load<T: DeserializeOwned>(&self, file_name: &str) -> AcmeResult<Option<T>> {
        let Some(content) = self.read(file_name)? else {
            return Ok(None);
        };

        let value = serde_json::from_str(&content).map_err(|e| AcmeError::AccountLoad {
            path: self.path(file_name),
            reason: e.to_string(),
        })?;
        debug!(path = %self.path(file_name).display(), "Loaded credential file");
        Ok(Some(value))
    }

    pub fn save<T: Serialize>(&self, file_name: &str, value: &T) -> AcmeResult<()> {
        let content = serde_json::to_string_pretty(value)?;
        self.save_raw(file_name, &content)
    }

    /// Writes the primary file, verifies it, then refreshes the backup
    pub fn save_raw(&self, file_name: &str, content: &str) -> AcmeResult<()> {
        self.init()?;
        let primary = self.path(file_name);
        let temp = primary.with_extension("tmp");

        fs::write(&temp, content)?;
        fs::rename(&temp, &primary)?;

        let written = fs::read(&primary)?;
        if written != content.as_bytes() {
            return Err(AcmeError::IoError(std::io::Error::other(format!(
                "Verification of {} failed after write",
                primary.display()
            ))));
        }

        fs::copy(&primary, Self::backup_path(&primary))?;
        debug!(path = %primary.display(), "Wrote credential file and backup");
        Ok(())
    }
}

/// `index.json` listing certificates issued under a storage root
pub struct CertificateIndex {
    index_path: PathBuf,
}

impl CertificateIndex {
    pub fn new<P: AsRef<Path>>(storage_root: P) -> Self {
        Self {
            index_path: storage_root.as_ref().join("index.json"),
        }
    }

    pub fn load(&self) -> AcmeResult<Vec<IssuedCertificate>> {
        if !self.index_path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.index_path)?;
        let index: Vec<IssuedCertificate> = serde_json::from_str(&content)?;
        Ok(index)
    }

    /// Save index atomically
    pub fn save(&self, index: &[IssuedCertificate]) -> AcmeResult<()> {
        if let Some(parent) = self.index_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(index)?;
        let temp_path = self.index_path.with_extension("json.tmp");

        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, &self.index_path)?;

        Ok(())
    }

    /// Adds `entry`, replacing any earlier entry with the same name and domain
    pub async fn record(&self, entry: IssuedCertificate) -> AcmeResult<()> {
        let _guard = lock_key(&self.index_path.to_string_lossy()).await;
        let mut index = self.load()?;
        index.retain(|c| !(c.name == entry.name && c.domain == entry.domain));
        info!(
            name = %entry.name,
            domain = %entry.domain,
            expires_at = %entry.expires_at,
            "Recorded issued certificate"
        );
        index.push(entry);
        self.save(&index)
    }

    pub fn needing_renewal(&self, threshold_days: u32) -> AcmeResult<Vec<IssuedCertificate>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|c| c.needs_renewal(threshold_days))
            .collect())
    }
}
