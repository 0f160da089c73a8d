//! Authenticated request dispatch
//!
//! Every call that relies on the session goes through here: the gateway
//! attaches the anti-forgery header from the latest session snapshot and
//! refuses caller headers that would collide with ones it manages.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::watch;
use tracing::warn;

use crate::auth::session::SessionSnapshot;
use crate::config::ServiceConfig;
use crate::error::AuthError;

/// Header carrying the anti-forgery token
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Header names owned by the gateway; callers may not supply these
const RESERVED_HEADERS: &[&str] = &["x-csrf-token", "content-type"];

/// Per-call adjustments
#[derive(Debug, Default, Clone)]
pub struct CallOptions {
    /// Suppress the not-established warning for calls that are valid
    /// before the session exists
    pub allow_unestablished: bool,

    /// Extra request headers; gateway-owned names are rejected
    pub headers: Vec<(String, String)>,
}

/// Dispatches operations with the csrf token attached
pub struct CsrfGateway {
    client: reqwest::Client,
    config: ServiceConfig,
    session: watch::Receiver<SessionSnapshot>,
}

impl CsrfGateway {
    pub fn new(
        client: reqwest::Client,
        config: ServiceConfig,
        session: watch::Receiver<SessionSnapshot>,
    ) -> Self {
        Self {
            client,
            config,
            session,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// POST a JSON body to a named operation.
    ///
    /// Header conflicts are a setup mistake and fail before any request is
    /// sent. A missing csrf token is not fatal: the call proceeds without
    /// the header and a warning records the ordering problem.
    pub async fn post(
        &self,
        operation: &str,
        body: &serde_json::Value,
        options: &CallOptions,
    ) -> Result<reqwest::Response, AuthError> {
        let extra = build_extra_headers(&options.headers)?;

        let csrf = self.session.borrow().csrf_token.clone();
        if csrf.is_none() && !options.allow_unestablished {
            warn!(
                "{} called before the session was established; sending without csrf token",
                operation
            );
        }

        let mut request = self
            .client
            .post(self.config.api_url(operation))
            .headers(extra)
            .json(body);
        if let Some(token) = csrf {
            request = request.header(CSRF_HEADER, token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AuthError::Timeout(format!("{} request timed out", operation))
            } else {
                AuthError::Network(format!("{} request failed: {}", operation, e))
            }
        })?;

        Ok(response)
    }
}

fn build_extra_headers(headers: &[(String, String)]) -> Result<HeaderMap, AuthError> {
    let mut map = HeaderMap::new();

    for (name, value) in headers {
        if RESERVED_HEADERS.iter().any(|r| name.eq_ignore_ascii_case(r)) {
            return Err(AuthError::Config(format!(
                "Header {:?} is managed by the session gateway",
                name
            )));
        }

        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AuthError::Config(format!("Invalid header name {:?}: {}", name, e)))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| AuthError::Config(format!("Invalid value for header {:?}: {}", name, e)))?;
        map.insert(header_name, header_value);
    }

    Ok(map)
}
