//! Saved sign-ins, kept in the OS keyring with a file fallback

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::error::AuthError;

const SERVICE_NAME: &str = "signon";
const ACTIVE_ACCOUNT_KEY: &str = "active_account";

/// Where saved sign-ins live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// OS native keyring
    Keyring,
    /// JSON file in the user config directory
    File,
}

/// One remembered sign-in, written when the user asked to stay logged in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSignin {
    pub email: String,
    pub bearer_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SigninFile {
    accounts: HashMap<String, StoredSignin>,
    active_account: Option<String>,
}

/// Persists sign-ins across invocations
pub struct SigninStore {
    backend: StorageBackend,
    file_path: Option<PathBuf>,
}

impl SigninStore {
    /// Create a store, preferring the keyring
    pub fn new() -> Result<Self, AuthError> {
        if Self::keyring_available() {
            Ok(Self {
                backend: StorageBackend::Keyring,
                file_path: None,
            })
        } else {
            Ok(Self {
                backend: StorageBackend::File,
                file_path: Some(Self::storage_file_path()?),
            })
        }
    }

    /// File-backed store at an explicit path
    pub fn with_file(path: PathBuf) -> Self {
        Self {
            backend: StorageBackend::File,
            file_path: Some(path),
        }
    }

    pub fn backend(&self) -> StorageBackend {
        self.backend
    }

    fn keyring_available() -> bool {
        keyring::Entry::new(SERVICE_NAME, "probe").is_ok()
    }

    fn storage_file_path() -> Result<PathBuf, AuthError> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| AuthError::Storage("Could not find config directory".to_string()))?;

        let app_dir = config_dir.join("signon");
        fs::create_dir_all(&app_dir).map_err(|e| {
            AuthError::Storage(format!("Failed to create config directory: {}", e))
        })?;

        Ok(app_dir.join("signins.json"))
    }

    fn read_file(&self) -> Result<SigninFile, AuthError> {
        let path = self
            .file_path
            .as_ref()
            .ok_or_else(|| AuthError::Storage("No file path set".to_string()))?;

        if !path.exists() {
            return Ok(SigninFile::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| AuthError::Storage(format!("Failed to read sign-in file: {}", e)))?;

        serde_json::from_str(&contents)
            .map_err(|e| AuthError::Storage(format!("Failed to parse sign-in file: {}", e)))
    }

    fn write_file(&self, file: &SigninFile) -> Result<(), AuthError> {
        let path = self
            .file_path
            .as_ref()
            .ok_or_else(|| AuthError::Storage("No file path set".to_string()))?;

        let contents = serde_json::to_string_pretty(file)
            .map_err(|e| AuthError::Storage(format!("Failed to serialize sign-ins: {}", e)))?;

        fs::write(path, contents)
            .map_err(|e| AuthError::Storage(format!("Failed to write sign-in file: {}", e)))?;

        // Bearer tokens inside, so owner-only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)
                .map_err(|e| AuthError::Storage(format!("Failed to read file metadata: {}", e)))?
                .permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)
                .map_err(|e| AuthError::Storage(format!("Failed to set file permissions: {}", e)))?;
        }

        Ok(())
    }

    /// Remember a sign-in, keyed by its email
    pub fn save(&self, signin: &StoredSignin) -> Result<(), AuthError> {
        match self.backend {
            StorageBackend::Keyring => {
                let entry = keyring::Entry::new(SERVICE_NAME, &signin.email).map_err(|e| {
                    AuthError::Storage(format!("Failed to create keyring entry: {}", e))
                })?;

                let data = serde_json::to_string(signin).map_err(|e| {
                    AuthError::Storage(format!("Failed to serialize sign-in: {}", e))
                })?;

                entry
                    .set_password(&data)
                    .map_err(|e| AuthError::Storage(format!("Failed to store sign-in: {}", e)))
            }
            StorageBackend::File => {
                let mut file = self.read_file()?;
                file.accounts.insert(signin.email.clone(), signin.clone());
                self.write_file(&file)
            }
        }
    }

    /// Look up a remembered sign-in
    pub fn load(&self, email: &str) -> Result<Option<StoredSignin>, AuthError> {
        match self.backend {
            StorageBackend::Keyring => {
                let entry = keyring::Entry::new(SERVICE_NAME, email).map_err(|e| {
                    AuthError::Storage(format!("Failed to create keyring entry: {}", e))
                })?;

                match entry.get_password() {
                    Ok(data) => {
                        let signin = serde_json::from_str(&data).map_err(|e| {
                            AuthError::Storage(format!("Failed to parse sign-in: {}", e))
                        })?;
                        Ok(Some(signin))
                    }
                    Err(_) => Ok(None),
                }
            }
            StorageBackend::File => {
                let file = self.read_file()?;
                Ok(file.accounts.get(email).cloned())
            }
        }
    }

    /// Forget a sign-in; clears the active marker when it pointed here
    pub fn delete(&self, email: &str) -> Result<(), AuthError> {
        match self.backend {
            StorageBackend::Keyring => {
                let entry = keyring::Entry::new(SERVICE_NAME, email).map_err(|e| {
                    AuthError::Storage(format!("Failed to create keyring entry: {}", e))
                })?;
                // Absent entries are fine
                let _ = entry.delete_password();

                if self.active_account()?.as_deref() == Some(email) {
                    self.clear_active_account()?;
                }
                Ok(())
            }
            StorageBackend::File => {
                let mut file = self.read_file()?;
                file.accounts.remove(email);
                if file.active_account.as_deref() == Some(email) {
                    file.active_account = None;
                }
                self.write_file(&file)
            }
        }
    }

    /// Email of the sign-in later invocations should use
    pub fn active_account(&self) -> Result<Option<String>, AuthError> {
        match self.backend {
            StorageBackend::Keyring => {
                let entry =
                    keyring::Entry::new(SERVICE_NAME, ACTIVE_ACCOUNT_KEY).map_err(|e| {
                        AuthError::Storage(format!("Failed to create keyring entry: {}", e))
                    })?;

                match entry.get_password() {
                    Ok(email) => Ok(Some(email)),
                    Err(_) => Ok(None),
                }
            }
            StorageBackend::File => {
                let file = self.read_file()?;
                Ok(file.active_account)
            }
        }
    }

    pub fn set_active_account(&self, email: &str) -> Result<(), AuthError> {
        match self.backend {
            StorageBackend::Keyring => {
                let entry =
                    keyring::Entry::new(SERVICE_NAME, ACTIVE_ACCOUNT_KEY).map_err(|e| {
                        AuthError::Storage(format!("Failed to create keyring entry: {}", e))
                    })?;

                entry
                    .set_password(email)
                    .map_err(|e| AuthError::Storage(format!("Failed to set active account: {}", e)))
            }
            StorageBackend::File => {
                let mut file = self.read_file()?;
                file.active_account = Some(email.to_string());
                self.write_file(&file)
            }
        }
    }

    pub fn clear_active_account(&self) -> Result<(), AuthError> {
        match self.backend {
            StorageBackend::Keyring => {
                let entry =
                    keyring::Entry::new(SERVICE_NAME, ACTIVE_ACCOUNT_KEY).map_err(|e| {
                        AuthError::Storage(format!("Failed to create keyring entry: {}", e))
                    })?;
                let _ = entry.delete_password();
                Ok(())
            }
            StorageBackend::File => {
                let mut file = self.read_file()?;
                file.active_account = None;
                self.write_file(&file)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_signin(email: &str) -> StoredSignin {
        StoredSignin {
            email: email.to_string(),
            bearer_token: "bearer-abc".to_string(),
            subject_id: Some("acct:bob".to_string()),
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn test_backend_selection() {
        let store = SigninStore::new().unwrap();
        assert!(matches!(
            store.backend(),
            StorageBackend::Keyring | StorageBackend::File
        ));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = SigninStore::with_file(dir.path().join("signins.json"));

        assert!(store.load("bob@bob.com").unwrap().is_none());

        store.save(&sample_signin("bob@bob.com")).unwrap();
        let loaded = store.load("bob@bob.com").unwrap().unwrap();
        assert_eq!(loaded.email, "bob@bob.com");
        assert_eq!(loaded.bearer_token, "bearer-abc");
        assert_eq!(loaded.subject_id.as_deref(), Some("acct:bob"));
    }

    #[test]
    fn test_active_account_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = SigninStore::with_file(dir.path().join("signins.json"));

        assert!(store.active_account().unwrap().is_none());

        store.save(&sample_signin("bob@bob.com")).unwrap();
        store.set_active_account("bob@bob.com").unwrap();
        assert_eq!(
            store.active_account().unwrap().as_deref(),
            Some("bob@bob.com")
        );

        store.clear_active_account().unwrap();
        assert!(store.active_account().unwrap().is_none());
    }

    #[test]
    fn test_delete_clears_matching_active_account() {
        let dir = TempDir::new().unwrap();
        let store = SigninStore::with_file(dir.path().join("signins.json"));

        store.save(&sample_signin("bob@bob.com")).unwrap();
        store.save(&sample_signin("eve@eve.com")).unwrap();
        store.set_active_account("bob@bob.com").unwrap();

        store.delete("bob@bob.com").unwrap();
        assert!(store.load("bob@bob.com").unwrap().is_none());
        assert!(store.active_account().unwrap().is_none());
        assert!(store.load("eve@eve.com").unwrap().is_some());

        // Deleting something unknown is not an error
        store.delete("nobody@nowhere.com").unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("signins.json");
        let store = SigninStore::with_file(path.clone());

        store.save(&sample_signin("bob@bob.com")).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
