//! Provider credentials.
//!
//! Credentials are written once by the setup mode and read once at startup.
//! The store is plain TOML and is not encrypted; on Unix the file is created
//! with mode 0600, which is its only protection.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Errors from a credential store.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credentials stored at {0}; run setup first")]
    NotFound(String),

    #[error("failed to access credential store: {0}")]
    Io(String),

    #[error("malformed credential file: {0}")]
    Parse(String),

    #[error("invalid credentials: {0}")]
    Invalid(String),
}

/// Identity and secret used to authenticate with the data provider.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub identity: String,
    pub secret: SecretString,
}

impl Credentials {
    pub fn new(identity: impl Into<String>, secret: impl Into<String>) -> Result<Self, CredentialError> {
        let identity = identity.into().trim().to_string();
        let secret: String = secret.into();
        if identity.is_empty() {
            return Err(CredentialError::Invalid("identity is empty".to_string()));
        }
        if secret.is_empty() {
            return Err(CredentialError::Invalid("secret is empty".to_string()));
        }
        Ok(Self {
            identity,
            secret: SecretString::from(secret),
        })
    }
}

/// Source of provider credentials.
pub trait CredentialStore: Send + Sync {
    fn get_credentials(&self) -> Result<Credentials, CredentialError>;
}

#[derive(Serialize, Deserialize)]
struct CredentialFile {
    identity: String,
    secret: String,
}

/// Credentials kept in a TOML file readable only by the owner.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write credentials, replacing any stored ones.
    pub fn save(&self, credentials: &Credentials) -> Result<(), CredentialError> {
        let contents = toml::to_string(&CredentialFile {
            identity: credentials.identity.clone(),
            secret: credentials.secret.expose_secret().to_string(),
        })
        .map_err(|e| CredentialError::Parse(e.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| CredentialError::Io(e.to_string()))?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(&self.path)
            .map_err(|e| CredentialError::Io(format!("{}: {}", self.path.display(), e)))?;
        // `mode` only applies on create; tighten an existing file too.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))
                .map_err(|e| CredentialError::Io(e.to_string()))?;
        }
        file.write_all(contents.as_bytes())
            .map_err(|e| CredentialError::Io(e.to_string()))?;

        info!(path = %self.path.display(), identity = %credentials.identity, "Stored provider credentials");
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn get_credentials(&self) -> Result<Credentials, CredentialError> {
        if !self.path.exists() {
            return Err(CredentialError::NotFound(self.path.display().to_string()));
        }
        let text = fs::read_to_string(&self.path)
            .map_err(|e| CredentialError::Io(format!("{}: {}", self.path.display(), e)))?;
        let file: CredentialFile =
            toml::from_str(&text).map_err(|e| CredentialError::Parse(e.to_string()))?;
        Credentials::new(file.identity, file.secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = FileCredentialStore::new(dir.path().join("nested/credentials.toml"));

        let credentials = Credentials::new("punter@example.com", "hunter2").unwrap();
        store.save(&credentials).unwrap();

        let loaded = store.get_credentials().unwrap();
        assert_eq!(loaded.identity, "punter@example.com");
        assert_eq!(loaded.secret.expose_secret(), "hunter2");
    }

    #[test]
    fn test_store_is_plain_toml() {
        let dir = TempDir::new().unwrap();
        let store = FileCredentialStore::new(dir.path().join("credentials.toml"));
        store
            .save(&Credentials::new("user", "hunter2").unwrap())
            .unwrap();

        let text = fs::read_to_string(store.path()).unwrap();
        let value: toml::Value = toml::from_str(&text).unwrap();
        assert_eq!(value["secret"].as_str(), Some("hunter2"));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = FileCredentialStore::new(dir.path().join("credentials.toml"));
        store
            .save(&Credentials::new("user", "secret").unwrap())
            .unwrap();

        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_missing_file() {
        let store = FileCredentialStore::new("/nonexistent/credentials.toml");
        assert!(matches!(
            store.get_credentials(),
            Err(CredentialError::NotFound(_))
        ));
    }

    #[test]
    fn test_rejects_blank_values() {
        assert!(Credentials::new("  ", "x").is_err());
        assert!(Credentials::new("user", "").is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let credentials = Credentials::new("user", "topsecret").unwrap();
        assert!(!format!("{:?}", credentials).contains("topsecret"));
    }
}
