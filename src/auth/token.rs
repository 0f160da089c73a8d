//! Bearer token decoding
//!
//! Bearer tokens from the identity service are three dot-separated
//! base64url segments. Only the middle segment is decoded here, to read
//! who is signed in; signature verification stays on the server.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::error::AuthError;

#[derive(Debug, Error)]
pub enum TokenDecodeError {
    #[error("Expected 3 dot-separated segments, got {0}")]
    SegmentCount(usize),
    #[error("Payload is not valid base64url: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Payload is not a claims object: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<TokenDecodeError> for AuthError {
    fn from(err: TokenDecodeError) -> Self {
        AuthError::Decode(err.to_string())
    }
}

/// Claims carried in the bearer payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BearerClaims {
    /// Subject id of the signed-in account
    pub sub: String,

    /// Issued-at, seconds since the epoch
    #[serde(default)]
    pub iat: Option<i64>,

    /// Remaining claims, kept verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl BearerClaims {
    /// Issued-at as a timestamp, when present and in range
    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.iat.and_then(|secs| DateTime::from_timestamp(secs, 0))
    }
}

/// Decode the payload segment of a bearer token
///
/// Rejects anything not shaped like a token. Callers treat a failure as
/// "nobody is signed in" rather than a hard error, logging it as a
/// diagnostic.
pub fn decode_bearer_claims(token: &str) -> Result<BearerClaims, TokenDecodeError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(TokenDecodeError::SegmentCount(segments.len()));
    }

    let payload = URL_SAFE_NO_PAD.decode(segments[1])?;
    let claims = serde_json::from_slice(&payload)?;
    Ok(claims)
}
