use crate::types::{CaResult, IssuedLeaf};
use std::fs;
use std::path::{Path, PathBuf};

/// Files kept for every issued leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafFile {
    CertPem,
    CertDer,
    KeyPem,
    Pfx,
}

impl LeafFile {
    fn file_name(self) -> &'static str {
        match self {
            LeafFile::CertPem => "cert.pem",
            LeafFile::CertDer => "cert.der",
            LeafFile::KeyPem => "key.pem",
            LeafFile::Pfx => "bundle.pfx",
        }
    }
}

/// Directory backing a [`crate::CertificateAuthority`]
///
/// ```text
/// root/ca.pem  root/ca.key.pem
/// leaves/{id}/cert.pem  cert.der  key.pem  bundle.pfx
/// index.json
/// ```
pub struct Keystore {
    dir: PathBuf,
}

impl Keystore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn init(&self) -> CaResult<()> {
        fs::create_dir_all(self.dir.join("root"))?;
        fs::create_dir_all(self.dir.join("leaves"))?;
        Ok(())
    }

    pub fn root_cert_path(&self) -> PathBuf {
        self.dir.join("root").join("ca.pem")
    }

    pub fn root_key_path(&self) -> PathBuf {
        self.dir.join("root").join("ca.key.pem")
    }

    /// Both halves of the root must be present; a lone certificate is ignored
    pub fn has_root(&self) -> bool {
        self.root_cert_path().is_file() && self.root_key_path().is_file()
    }

    pub fn leaf_path(&self, id: &str, file: LeafFile) -> PathBuf {
        self.dir.join("leaves").join(id).join(file.file_name())
    }

    pub fn write<P: AsRef<Path>>(&self, path: P, content: impl AsRef<[u8]>) -> CaResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    pub fn read<P: AsRef<Path>>(&self, path: P) -> CaResult<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    pub fn read_string<P: AsRef<Path>>(&self, path: P) -> CaResult<String> {
        Ok(fs::read_to_string(path)?)
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    pub fn load_index(&self) -> CaResult<Vec<IssuedLeaf>> {
        match fs::read_to_string(self.index_path()) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces the index through a temp file so readers never see half of it
    pub fn save_index(&self, leaves: &[IssuedLeaf]) -> CaResult<()> {
        let path = self.index_path();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(leaves)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_layout_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = Keystore::new(dir.path());
        store.init().unwrap();
        assert!(!store.has_root());
        assert!(store.load_index().unwrap().is_empty());

        let cert = store.leaf_path("abc", LeafFile::CertPem);
        assert_eq!(cert, dir.path().join("leaves/abc/cert.pem"));
        store.write(&cert, "pem").unwrap();
        assert_eq!(store.read_string(&cert).unwrap(), "pem");

        let leaf = IssuedLeaf {
            id: "abc".to_string(),
            domains: vec!["app.example.test".to_string()],
            serial: "01".to_string(),
            issued_at: Utc::now(),
            expires_at: Utc::now(),
            cert_path: cert,
            key_path: store.leaf_path("abc", LeafFile::KeyPem),
        };
        store.save_index(std::slice::from_ref(&leaf)).unwrap();
        assert_eq!(store.load_index().unwrap(), vec![leaf]);
        assert!(!dir.path().join("index.json.tmp").exists());
    }
}
