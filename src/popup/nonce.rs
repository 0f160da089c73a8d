//! Handshake nonce generation and storage
//!
//! Each sign-in window round trip gets a fresh random nonce. The nonce is
//! persisted under a fixed slot name before the window opens, then carried
//! to the service as a query parameter on the sign-in URL.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use url::Url;

use crate::error::AuthError;

/// Query parameter carrying the nonce on the sign-in URL
pub const NONCE_PARAM: &str = "nonce";

/// Slot name the latest nonce is stored under
pub const NONCE_KEY: &str = "oauthNonce";

/// Generate a 128-bit nonce from the OS randomness source.
///
/// Fails when that source is unavailable; the nonce is never derived from
/// a weaker generator.
pub fn generate_nonce() -> Result<String, AuthError> {
    let mut bytes = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| AuthError::Popup(format!("No secure randomness available: {}", e)))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Attach a nonce to a sign-in URL
pub fn append_nonce(url: &Url, nonce: &str) -> Url {
    let mut url = url.clone();
    url.query_pairs_mut().append_pair(NONCE_PARAM, nonce);
    url
}

/// Generate a fresh nonce, persist it, then return the URL carrying it.
/// The store write happens before the URL is handed out, so the slot
/// always holds the nonce of the most recently prepared window.
pub fn prepare_signin_url(store: &dyn NonceStore, url: &Url) -> Result<Url, AuthError> {
    let nonce = generate_nonce()?;
    store.save(&nonce)?;
    Ok(append_nonce(url, &nonce))
}

/// One durable slot holding the most recently generated nonce
pub trait NonceStore {
    fn save(&self, nonce: &str) -> Result<(), AuthError>;
    fn load(&self) -> Result<Option<String>, AuthError>;
}

/// Nonce slot in a JSON file under the user config directory
pub struct FileNonceStore {
    path: PathBuf,
}

impl FileNonceStore {
    pub fn new() -> Result<Self, AuthError> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| AuthError::Storage("Could not find config directory".to_string()))?;

        let app_dir = config_dir.join("signon");
        fs::create_dir_all(&app_dir)
            .map_err(|e| AuthError::Storage(format!("Failed to create config directory: {}", e)))?;

        Ok(Self {
            path: app_dir.join("handshake.json"),
        })
    }

    pub fn at_path(path: PathBuf) -> Self {
        Self { path }
    }

    fn read_slots(&self) -> Result<HashMap<String, String>, AuthError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let contents = fs::read_to_string(&self.path)
            .map_err(|e| AuthError::Storage(format!("Failed to read handshake file: {}", e)))?;
        serde_json::from_str(&contents)
            .map_err(|e| AuthError::Storage(format!("Failed to parse handshake file: {}", e)))
    }

    fn write_slots(&self, slots: &HashMap<String, String>) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                AuthError::Storage(format!("Failed to create handshake directory: {}", e))
            })?;
        }

        let data = serde_json::to_string_pretty(slots)
            .map_err(|e| AuthError::Storage(format!("Failed to serialize handshake file: {}", e)))?;

        let file = fs::File::create(&self.path)
            .map_err(|e| AuthError::Storage(format!("Failed to write handshake file: {}", e)))?;
        fs2::FileExt::lock_exclusive(&file)
            .map_err(|e| AuthError::Storage(format!("Failed to lock handshake file: {}", e)))?;
        (&file)
            .write_all(data.as_bytes())
            .map_err(|e| AuthError::Storage(format!("Failed to write handshake file: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = file
                .metadata()
                .map_err(|e| AuthError::Storage(format!("Failed to read file metadata: {}", e)))?
                .permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms)
                .map_err(|e| AuthError::Storage(format!("Failed to set file permissions: {}", e)))?;
        }

        Ok(())
    }
}

impl NonceStore for FileNonceStore {
    fn save(&self, nonce: &str) -> Result<(), AuthError> {
        let mut slots = self.read_slots()?;
        slots.insert(NONCE_KEY.to_string(), nonce.to_string());
        self.write_slots(&slots)
    }

    fn load(&self) -> Result<Option<String>, AuthError> {
        Ok(self.read_slots()?.remove(NONCE_KEY))
    }
}
