//! Typed operations of the identity service API
//!
//! One method per service operation. Requests are JSON posts through the
//! csrf gateway; failures carry an `{"error": {"code", "message"}}`
//! envelope that is decoded into the application error taxonomy.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::auth::gateway::{CallOptions, CsrfGateway};
use crate::config::ServiceConfig;
use crate::error::AuthError;

/// Token pair returned by session bootstrap
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokens {
    pub csrf_token: String,
    pub bearer_token: String,
}

/// Outcome of operations that sign the caller in
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BearerOutcome {
    pub bearer_token: String,
}

/// Outcome of email-link operations that end in a redirect
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectOutcome {
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedReauthToken {
    pub token: String,
}

/// Pending second-factor enrollment: the signed key plus its otpauth form
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotpKey {
    pub token: String,
    pub otpauth_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryCodes {
    pub codes: Vec<String>,
}

/// How the user proves who they are when logging in
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialInput {
    /// Email and password pair
    Password(PasswordCredential),
    /// Token handed back by the sign-in window after an OAuth redirect
    OauthToken(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordCredential {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    credential: &'a CredentialInput,
    stay_logged_in: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    totp_code: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateAccountRequest<'a> {
    email: &'a str,
    password: &'a str,
    login_after_creation: bool,
    stay_logged_in: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResetPasswordRequest<'a> {
    token: &'a str,
    new_password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    login_after_reset: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stay_logged_in: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordRequest<'a> {
    old_password: &'a str,
    new_password: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AddPasswordRequest<'a> {
    email: &'a str,
    new_password: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignReauthTokenRequest<'a> {
    contents: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AddTotpRequest<'a> {
    token: &'a str,
    code: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRecoveryCodesRequest<'a> {
    reauth_token: &'a str,
}

#[derive(Debug, Serialize)]
struct EmailRequest<'a> {
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    #[serde(default)]
    message: Option<String>,
}

/// Establish or refresh the session token pair.
///
/// This is the one call that does not go through the gateway: it is what
/// produces the csrf token in the first place.
pub async fn bootstrap_session(
    client: &reqwest::Client,
    config: &ServiceConfig,
) -> Result<SessionTokens, AuthError> {
    let body = serde_json::json!({ "applicationId": config.application_id() });

    let response = client
        .post(config.api_url("session"))
        .json(&body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                AuthError::Timeout("session request timed out".to_string())
            } else {
                AuthError::Network(format!("session request failed: {}", e))
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(decode_error_response("session", status, &text));
    }

    response
        .json::<SessionTokens>()
        .await
        .map_err(|e| AuthError::Decode(format!("Failed to decode session response: {}", e)))
}

/// Typed client for the identity service operations
pub struct IdentityApi {
    gateway: CsrfGateway,
}

impl IdentityApi {
    pub fn new(gateway: CsrfGateway) -> Self {
        Self { gateway }
    }

    pub fn config(&self) -> &ServiceConfig {
        self.gateway.config()
    }

    /// Sign in with a credential. `TOTP_REQUIRED` signals that the
    /// credential was fine but a one-time code must accompany it.
    pub async fn login(
        &self,
        credential: &CredentialInput,
        stay_logged_in: bool,
        totp_code: Option<&str>,
    ) -> Result<BearerOutcome, AuthError> {
        let body = serde_json::to_value(LoginRequest {
            credential,
            stay_logged_in,
            totp_code,
        })?;
        self.execute("login", body, &CallOptions::default()).await
    }

    /// Register a new account; `EMAIL_EXISTS` when the address is taken
    pub async fn create_account(
        &self,
        email: &str,
        password: &str,
        login_after_creation: bool,
        stay_logged_in: bool,
    ) -> Result<BearerOutcome, AuthError> {
        let body = serde_json::to_value(CreateAccountRequest {
            email,
            password,
            login_after_creation,
            stay_logged_in,
        })?;
        self.execute("createAccount", body, &CallOptions::default())
            .await
    }

    /// Ask for a password-reset email. Always acknowledged the same way,
    /// whether or not the address is known.
    pub async fn request_password_reset(&self, email: &str) -> Result<(), AuthError> {
        let body = serde_json::to_value(EmailRequest { email })?;
        self.execute_ack("requestPasswordReset", body, &email_link_options())
            .await
    }

    /// Complete a reset started from an emailed link
    pub async fn reset_password(
        &self,
        token: &str,
        new_password: &str,
        login_after_reset: Option<bool>,
        stay_logged_in: Option<bool>,
    ) -> Result<RedirectOutcome, AuthError> {
        let body = serde_json::to_value(ResetPasswordRequest {
            token,
            new_password,
            login_after_reset,
            stay_logged_in,
        })?;
        self.execute("resetPassword", body, &email_link_options())
            .await
    }

    pub async fn change_password(
        &self,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let body = serde_json::to_value(ChangePasswordRequest {
            old_password,
            new_password,
        })?;
        self.execute_ack("changePassword", body, &CallOptions::default())
            .await
    }

    /// Attach a password to an account that only has OAuth credentials
    pub async fn add_password(&self, email: &str, new_password: &str) -> Result<(), AuthError> {
        let body = serde_json::to_value(AddPasswordRequest {
            email,
            new_password,
        })?;
        self.execute_ack("addPassword", body, &CallOptions::default())
            .await
    }

    /// Have the service sign a short-lived token over the given contents,
    /// proving the user re-authenticated for a sensitive action
    pub async fn sign_reauth_token(
        &self,
        contents: &serde_json::Value,
        password: Option<&str>,
    ) -> Result<SignedReauthToken, AuthError> {
        let body = serde_json::to_value(SignReauthTokenRequest { contents, password })?;
        self.execute("signReauthToken", body, &CallOptions::default())
            .await
    }

    pub async fn get_totp_key(&self) -> Result<TotpKey, AuthError> {
        self.execute("getTotpKey", serde_json::json!({}), &CallOptions::default())
            .await
    }

    /// Confirm second-factor enrollment with a code from the new device
    pub async fn add_totp(&self, token: &str, code: &str) -> Result<(), AuthError> {
        let body = serde_json::to_value(AddTotpRequest { token, code })?;
        self.execute_ack("addTotp", body, &CallOptions::default())
            .await
    }

    pub async fn create_recovery_codes(
        &self,
        reauth_token: &str,
    ) -> Result<RecoveryCodes, AuthError> {
        let body = serde_json::to_value(CreateRecoveryCodesRequest { reauth_token })?;
        self.execute("createRecoveryCodes", body, &CallOptions::default())
            .await
    }

    pub async fn get_recovery_code_count(&self) -> Result<u32, AuthError> {
        self.execute(
            "getRecoveryCodeCount",
            serde_json::json!({}),
            &CallOptions::default(),
        )
        .await
    }

    /// Confirm an email address from an emailed link
    pub async fn verify_email(&self, token: &str) -> Result<RedirectOutcome, AuthError> {
        let body = serde_json::to_value(TokenRequest { token })?;
        self.execute("verifyEmail", body, &email_link_options()).await
    }

    pub async fn send_verification_email(&self, email: &str) -> Result<(), AuthError> {
        let body = serde_json::to_value(EmailRequest { email })?;
        self.execute_ack("sendVerificationEmail", body, &CallOptions::default())
            .await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        operation: &str,
        body: serde_json::Value,
        options: &CallOptions,
    ) -> Result<T, AuthError> {
        let response = self.gateway.post(operation, &body, options).await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(decode_error_response(operation, status, &text));
        }

        response.json::<T>().await.map_err(|e| {
            AuthError::Decode(format!("Failed to decode {} response: {}", operation, e))
        })
    }

    async fn execute_ack(
        &self,
        operation: &str,
        body: serde_json::Value,
        options: &CallOptions,
    ) -> Result<(), AuthError> {
        let response = self.gateway.post(operation, &body, options).await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(decode_error_response(operation, status, &text));
        }

        Ok(())
    }
}

/// Operations reached from emailed links run before any session exists
fn email_link_options() -> CallOptions {
    CallOptions {
        allow_unestablished: true,
        ..Default::default()
    }
}

/// Turn a failure body into an application error when it carries the
/// service's error envelope, or surface the raw response otherwise
fn decode_error_response(
    operation: &str,
    status: reqwest::StatusCode,
    body: &str,
) -> AuthError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => {
            let message = envelope
                .error
                .message
                .unwrap_or_else(|| envelope.error.code.clone());
            AuthError::application(&envelope.error.code, message)
        }
        Err(_) => AuthError::Network(format!(
            "{} failed with status {}: {}",
            operation, status, body
        )),
    }
}
