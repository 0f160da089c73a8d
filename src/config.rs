//! Client configuration for the identity service

use crate::error::AuthError;
use url::Url;

/// Default identity service endpoint
pub const DEFAULT_SERVICE: &str = "https://id.signon.dev";

/// Default application identifier reported during session bootstrap
pub const DEFAULT_APPLICATION_ID: &str = "signon-cli";

/// Connection settings for the identity service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    service_url: Url,
    application_id: String,
}

impl ServiceConfig {
    /// Validate and build the configuration
    ///
    /// The application identifier names this client during session
    /// bootstrap; a blank value is a setup mistake and is rejected here,
    /// before any request is issued.
    pub fn new(service_url: &str, application_id: &str) -> Result<Self, AuthError> {
        let service_url = Url::parse(service_url)
            .map_err(|e| AuthError::Config(format!("Invalid service URL {:?}: {}", service_url, e)))?;

        if service_url.cannot_be_a_base() {
            return Err(AuthError::Config(format!(
                "Service URL {:?} cannot be used as a base",
                service_url.as_str()
            )));
        }

        let application_id = application_id.trim();
        if application_id.is_empty() {
            return Err(AuthError::Config(
                "Application id must not be empty".to_string(),
            ));
        }

        Ok(Self {
            service_url,
            application_id: application_id.to_string(),
        })
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub fn service_url(&self) -> &Url {
        &self.service_url
    }

    /// URL of a named API operation under the service root
    pub fn api_url(&self, operation: &str) -> Url {
        let mut url = self.service_url.clone();
        url.path_segments_mut()
            .expect("service URL is a valid base")
            .pop_if_empty()
            .extend(["api", operation]);
        url
    }

    /// Hosted page that starts the provider sign-in redirect chain
    pub fn oauth_signin_url(&self) -> Url {
        let mut url = self.service_url.clone();
        url.path_segments_mut()
            .expect("service URL is a valid base")
            .pop_if_empty()
            .extend(["signin", "oauth"]);
        url
    }
}
