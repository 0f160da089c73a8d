//! Reauthentication token cache
//!
//! Sensitive operations need a short-lived token signed by the service
//! over a caller-chosen contents object. Tokens are cached by a digest of
//! those contents so repeated requests within the allowed age reuse the
//! same token instead of asking the user to re-authenticate again.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::auth::api::IdentityApi;
use crate::error::AuthError;

/// Default freshness window for a signed reauth token
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    issued_at: Instant,
}

/// Signed tokens keyed by a digest of their contents.
///
/// Reads never mutate the cache: an entry past its age is simply not
/// returned, and stays in place until the next `put` replaces it.
#[derive(Debug, Default)]
pub struct ReauthCache {
    entries: HashMap<String, CachedToken>,
}

impl ReauthCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly signed token for these contents
    pub fn put(&mut self, contents: &serde_json::Value, token: String) {
        self.put_at(contents, token, Instant::now());
    }

    /// Look up a token no older than `max_age`
    pub fn get(&self, contents: &serde_json::Value, max_age: Duration) -> Option<String> {
        self.get_at(contents, max_age, Instant::now())
    }

    /// Return a signed token for the contents, reusing a cached one when
    /// it is recent enough; otherwise ask the service to sign a new one.
    /// Only a successful signing updates the cache.
    pub async fn obtain(
        &mut self,
        api: &IdentityApi,
        contents: &serde_json::Value,
        max_age: Duration,
        password: Option<&str>,
    ) -> Result<String, AuthError> {
        if let Some(token) = self.get(contents, max_age) {
            debug!("Reusing cached reauth token");
            return Ok(token);
        }

        let signed = api.sign_reauth_token(contents, password).await?;
        self.put(contents, signed.token.clone());
        Ok(signed.token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn put_at(&mut self, contents: &serde_json::Value, token: String, now: Instant) {
        self.entries
            .insert(cache_key(contents), CachedToken { token, issued_at: now });
    }

    fn get_at(
        &self,
        contents: &serde_json::Value,
        max_age: Duration,
        now: Instant,
    ) -> Option<String> {
        let entry = self.entries.get(&cache_key(contents))?;
        if now.duration_since(entry.issued_at) > max_age {
            return None;
        }
        Some(entry.token.clone())
    }
}

/// Digest of the contents under a stable serialization, so structurally
/// equal contents always map to the same entry
fn cache_key(contents: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(contents).as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Compact JSON with object keys sorted at every nesting level
fn canonical_json(value: &serde_json::Value) -> String {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        leaf => leaf.to_string(),
    }
}
