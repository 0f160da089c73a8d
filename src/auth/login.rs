//! Multi-stage login flow
//!
//! `LoginFlow` is a pure state machine: it decides which stage the user is
//! in, validates second-factor input, and tracks when "logged in" may be
//! reported. All network work is described by the `LoginSubmission` values
//! it hands back, so the transitions are testable without a server.
//! `LoginManager` is the async driver that executes those submissions
//! against the identity service.

use std::time::Duration;

use regex::Regex;
use tracing::debug;
use url::Url;

use crate::auth::api::{CredentialInput, IdentityApi};
use crate::auth::session::{SessionManager, SessionSnapshot};
use crate::error::{AuthError, ErrorCode};
use crate::popup::browser::BrowserSigninFlow;
use crate::popup::nonce::{prepare_signin_url, NonceStore};

/// Stage of the login form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginMode {
    /// Primary credential entry
    Login,
    /// Password-reset request entry
    ForgotPassword,
    /// Second-factor entry after the service demanded one
    Totp,
}

/// Which shape a valid second-factor code matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondFactorKind {
    /// Six digits from the authenticator app
    TotpCode,
    /// One of the fourteen-character single-use recovery codes
    RecoveryCode,
}

/// Accepted input shapes for the second-factor stage
struct SecondFactorShapes {
    totp: Regex,
    recovery: Regex,
}

impl SecondFactorShapes {
    fn new() -> Self {
        Self {
            totp: Regex::new("^[0-9]{6}$").expect("valid pattern"),
            recovery: Regex::new("^[-0-9A-Z]{14}$").expect("valid pattern"),
        }
    }

    fn classify(&self, code: &str) -> Option<SecondFactorKind> {
        if self.totp.is_match(code) {
            Some(SecondFactorKind::TotpCode)
        } else if self.recovery.is_match(code) {
            Some(SecondFactorKind::RecoveryCode)
        } else {
            None
        }
    }
}

/// Everything entered so far for one sign-in attempt. Kept across failed
/// submissions so the user can retry without re-entering fields; discarded
/// on success or when navigating back to the primary form.
#[derive(Debug, Clone)]
pub struct LoginAttempt {
    pub credential: CredentialInput,
    pub stay_logged_in: bool,
    pub totp_code: Option<String>,
}

/// One network call the flow wants its driver to perform
#[derive(Debug, Clone)]
pub struct LoginSubmission {
    pub credential: CredentialInput,
    pub stay_logged_in: bool,
    pub totp_code: Option<String>,
}

/// What the host should present right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStatus {
    /// One of the input stages is still active
    Form,
    /// Signed in with a recovery code; the notice must be acknowledged
    RecoveryNotice,
    /// Fully signed in
    Complete,
}

pub struct LoginFlow {
    mode: LoginMode,
    attempt: Option<LoginAttempt>,
    error: Option<String>,
    pending: bool,
    mutation_succeeded: bool,
    used_recovery_code: bool,
    recovery_notice_dismissed: bool,
    reported: bool,
    recovery_input: bool,
    shapes: SecondFactorShapes,
}

impl Default for LoginFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl LoginFlow {
    pub fn new() -> Self {
        Self {
            mode: LoginMode::Login,
            attempt: None,
            error: None,
            pending: false,
            mutation_succeeded: false,
            used_recovery_code: false,
            recovery_notice_dismissed: false,
            reported: false,
            recovery_input: false,
            shapes: SecondFactorShapes::new(),
        }
    }

    pub fn mode(&self) -> LoginMode {
        self.mode
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn attempt(&self) -> Option<&LoginAttempt> {
        self.attempt.as_ref()
    }

    /// Whether the second-factor stage is showing the recovery-code input
    pub fn recovery_input_active(&self) -> bool {
        self.recovery_input
    }

    /// Submit the primary credential form. Returns the call to make, or
    /// nothing when the flow is not in a state that accepts a credential.
    pub fn submit_credential(
        &mut self,
        credential: CredentialInput,
        stay_logged_in: bool,
    ) -> Option<LoginSubmission> {
        if self.mode != LoginMode::Login || self.pending {
            debug!("Ignoring credential submission outside the login stage");
            return None;
        }

        self.attempt = Some(LoginAttempt {
            credential,
            stay_logged_in,
            totp_code: None,
        });
        self.error = None;
        self.pending = true;
        self.submission()
    }

    /// Submit a second-factor code. Input that matches neither accepted
    /// shape is rejected locally, without a network round trip.
    pub fn submit_second_factor(&mut self, code: &str) -> Option<LoginSubmission> {
        if self.mode != LoginMode::Totp || self.pending {
            debug!("Ignoring second-factor submission outside the totp stage");
            return None;
        }

        if self.shapes.classify(code).is_none() {
            self.error = Some(
                "Enter the 6-digit code from your authenticator app, or a recovery code"
                    .to_string(),
            );
            return None;
        }

        let Some(attempt) = self.attempt.as_mut() else {
            debug!("No login attempt to attach the second factor to");
            return None;
        };
        attempt.totp_code = Some(code.to_string());
        self.error = None;
        self.pending = true;
        self.submission()
    }

    fn submission(&self) -> Option<LoginSubmission> {
        self.attempt.as_ref().map(|attempt| LoginSubmission {
            credential: attempt.credential.clone(),
            stay_logged_in: attempt.stay_logged_in,
            totp_code: attempt.totp_code.clone(),
        })
    }

    /// The submitted credential was accepted
    pub fn resolve_success(&mut self) {
        self.pending = false;
        self.used_recovery_code = self
            .attempt
            .as_ref()
            .and_then(|a| a.totp_code.as_deref())
            .map(|code| {
                matches!(
                    self.shapes.classify(code),
                    Some(SecondFactorKind::RecoveryCode)
                )
            })
            .unwrap_or(false);
        self.mutation_succeeded = true;
        self.error = None;
        self.attempt = None;
    }

    /// The submitted credential was rejected. `TOTP_REQUIRED` moves the
    /// flow to the second-factor stage; every other failure is surfaced in
    /// place so already-entered values survive the retry.
    pub fn resolve_failure(&mut self, error: &AuthError) {
        self.pending = false;
        if matches!(error.code(), Some(ErrorCode::TotpRequired)) {
            self.mode = LoginMode::Totp;
            self.error = None;
        } else {
            self.error = Some(error.to_string());
        }
    }

    pub fn forgot_password(&mut self) {
        if self.mode == LoginMode::Login && !self.pending {
            self.mode = LoginMode::ForgotPassword;
        }
    }

    /// Leave the password-reset stage, discarding the current attempt
    pub fn cancel_forgot_password(&mut self) {
        if self.mode == LoginMode::ForgotPassword {
            self.mode = LoginMode::Login;
            self.attempt = None;
            self.error = None;
        }
    }

    /// Swap which second-factor input is shown; never leaves the stage
    pub fn toggle_recovery_input(&mut self) {
        if self.mode == LoginMode::Totp {
            self.recovery_input = !self.recovery_input;
        }
    }

    pub fn dismiss_recovery_notice(&mut self) {
        self.recovery_notice_dismissed = true;
    }

    /// Combine the mutation result with the session's own view. The login
    /// response and the session refresh resolve independently, so this
    /// only reads `Complete` once both agree, the session load has
    /// settled, and any recovery notice has been acknowledged.
    pub fn status(&self, session: &SessionSnapshot) -> LoginStatus {
        if !self.mutation_succeeded {
            return LoginStatus::Form;
        }
        if session.subject_id().is_none() || session.loading {
            return LoginStatus::Form;
        }
        if self.used_recovery_code && !self.recovery_notice_dismissed {
            return LoginStatus::RecoveryNotice;
        }
        LoginStatus::Complete
    }

    /// True exactly once, the first time the flow reads `Complete`
    pub fn take_logged_in(&mut self, session: &SessionSnapshot) -> bool {
        if self.reported {
            return false;
        }
        if self.status(session) == LoginStatus::Complete {
            self.reported = true;
            return true;
        }
        false
    }
}

/// Executes login submissions against the identity service and keeps the
/// session in agreement with the outcome
pub struct LoginManager<'a> {
    api: &'a IdentityApi,
    session: &'a SessionManager,
    flow: LoginFlow,
}

impl<'a> LoginManager<'a> {
    pub fn new(api: &'a IdentityApi, session: &'a SessionManager) -> Self {
        Self {
            api,
            session,
            flow: LoginFlow::new(),
        }
    }

    pub fn flow(&self) -> &LoginFlow {
        &self.flow
    }

    pub fn flow_mut(&mut self) -> &mut LoginFlow {
        &mut self.flow
    }

    /// Submit a credential. Returns `Ok` on success and on the
    /// second-factor detour (check `flow().mode()` afterwards); any other
    /// rejection is returned as the error, with the flow keeping it in
    /// place for retry.
    pub async fn submit_credential(
        &mut self,
        credential: CredentialInput,
        stay_logged_in: bool,
    ) -> Result<(), AuthError> {
        let Some(submission) = self.flow.submit_credential(credential, stay_logged_in) else {
            return Err(AuthError::Config(
                "A login attempt is already in progress".to_string(),
            ));
        };
        self.dispatch(submission).await
    }

    /// Submit the second-factor code for the pending attempt
    pub async fn submit_second_factor(&mut self, code: &str) -> Result<(), AuthError> {
        let Some(submission) = self.flow.submit_second_factor(code) else {
            let reason = self
                .flow
                .error()
                .unwrap_or("No login attempt is waiting for a second factor")
                .to_string();
            return Err(AuthError::Config(reason));
        };
        self.dispatch(submission).await
    }

    /// Run the whole browser handshake, then submit the returned token as
    /// a credential. The stay-logged-in preference is captured now, before
    /// the window opens, and reused when the token comes back.
    pub async fn submit_browser_signin(
        &mut self,
        nonce_store: &dyn NonceStore,
        stay_logged_in: bool,
        timeout: Duration,
    ) -> Result<(), AuthError> {
        let signin_url = self.api.config().oauth_signin_url();
        self.submit_browser_signin_at(nonce_store, &signin_url, stay_logged_in, timeout)
            .await
    }

    pub async fn submit_browser_signin_at(
        &mut self,
        nonce_store: &dyn NonceStore,
        signin_url: &Url,
        stay_logged_in: bool,
        timeout: Duration,
    ) -> Result<(), AuthError> {
        let url = prepare_signin_url(nonce_store, signin_url)?;
        let mut browser = BrowserSigninFlow::new()?;
        let token = browser.obtain_token(&url, timeout).await?;
        self.submit_credential(CredentialInput::OauthToken(token), stay_logged_in)
            .await
    }

    async fn dispatch(&mut self, submission: LoginSubmission) -> Result<(), AuthError> {
        let result = self
            .api
            .login(
                &submission.credential,
                submission.stay_logged_in,
                submission.totp_code.as_deref(),
            )
            .await;

        match result {
            Ok(_) => {
                self.flow.resolve_success();
                // Bring the session's own view of the account up to date
                self.session.refresh_now().await?;
                Ok(())
            }
            Err(err) => {
                self.flow.resolve_failure(&err);
                if self.flow.mode() == LoginMode::Totp
                    && matches!(err.code(), Some(ErrorCode::TotpRequired))
                {
                    return Ok(());
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::BearerClaims;
    use std::collections::BTreeMap;

    fn password_credential() -> CredentialInput {
        CredentialInput::Password(crate::auth::api::PasswordCredential {
            email: "bob@bob.com".to_string(),
            password: "hunter2".to_string(),
        })
    }

    fn signed_in_session() -> SessionSnapshot {
        SessionSnapshot {
            csrf_token: Some("csrf-1".to_string()),
            bearer_token: Some("bearer-1".to_string()),
            claims: Some(BearerClaims {
                sub: "acct:bob".to_string(),
                iat: None,
                extra: BTreeMap::new(),
            }),
            loading: false,
            error: None,
        }
    }

    fn totp_required() -> AuthError {
        AuthError::application("TOTP_REQUIRED", "A one-time code is required")
    }

    #[test]
    fn test_initial_state() {
        let flow = LoginFlow::new();
        assert_eq!(flow.mode(), LoginMode::Login);
        assert!(!flow.is_pending());
        assert!(flow.error().is_none());
        assert_eq!(flow.status(&SessionSnapshot::default()), LoginStatus::Form);
    }

    #[test]
    fn test_password_login_success() {
        let mut flow = LoginFlow::new();

        let submission = flow.submit_credential(password_credential(), true).unwrap();
        assert!(submission.totp_code.is_none());
        assert!(submission.stay_logged_in);
        assert!(flow.is_pending());

        flow.resolve_success();
        assert!(!flow.is_pending());
        assert_eq!(flow.status(&signed_in_session()), LoginStatus::Complete);
    }

    #[test]
    fn test_submission_rejected_while_pending() {
        let mut flow = LoginFlow::new();
        flow.submit_credential(password_credential(), false).unwrap();

        assert!(flow.submit_credential(password_credential(), false).is_none());
    }

    #[test]
    fn test_success_waits_for_session_agreement() {
        let mut flow = LoginFlow::new();
        flow.submit_credential(password_credential(), false).unwrap();
        flow.resolve_success();

        // Session still loading
        let mut session = signed_in_session();
        session.loading = true;
        assert_eq!(flow.status(&session), LoginStatus::Form);

        // Session settled but anonymous
        let mut session = signed_in_session();
        session.claims = None;
        assert_eq!(flow.status(&session), LoginStatus::Form);

        // Both agree
        assert_eq!(flow.status(&signed_in_session()), LoginStatus::Complete);
    }

    #[test]
    fn test_logged_in_reported_exactly_once() {
        let mut flow = LoginFlow::new();
        let session = signed_in_session();

        flow.submit_credential(password_credential(), false).unwrap();
        assert!(!flow.take_logged_in(&session));

        flow.resolve_success();
        assert!(flow.take_logged_in(&session));
        assert!(!flow.take_logged_in(&session));
        assert!(!flow.take_logged_in(&session));
    }

    #[test]
    fn test_totp_required_moves_to_second_factor() {
        let mut flow = LoginFlow::new();
        flow.submit_credential(password_credential(), true).unwrap();
        flow.resolve_failure(&totp_required());

        assert_eq!(flow.mode(), LoginMode::Totp);
        assert!(flow.error().is_none(), "the detour is not a user-visible failure");
        assert!(!flow.is_pending());
        assert!(flow.attempt().is_some(), "entered fields survive the detour");
    }

    #[test]
    fn test_second_factor_keeps_original_credential_and_preference() {
        let mut flow = LoginFlow::new();
        flow.submit_credential(password_credential(), true).unwrap();
        flow.resolve_failure(&totp_required());

        let submission = flow.submit_second_factor("123456").unwrap();
        assert_eq!(submission.totp_code.as_deref(), Some("123456"));
        assert!(submission.stay_logged_in);
        match submission.credential {
            CredentialInput::Password(p) => {
                assert_eq!(p.email, "bob@bob.com");
                assert_eq!(p.password, "hunter2");
            }
            other => panic!("expected the password credential, got {:?}", other),
        }
    }

    #[test]
    fn test_other_failures_stay_in_place() {
        let mut flow = LoginFlow::new();
        flow.submit_credential(password_credential(), false).unwrap();
        flow.resolve_failure(&AuthError::application("BAD_PASSWORD", "Wrong password"));

        assert_eq!(flow.mode(), LoginMode::Login);
        assert_eq!(flow.error(), Some("Wrong password"));
        assert!(flow.attempt().is_some());

        // Retry is allowed and clears the surfaced error
        let submission = flow.submit_credential(password_credential(), false);
        assert!(submission.is_some());
        assert!(flow.error().is_none());
    }

    #[test]
    fn test_second_factor_shape_rejected_locally() {
        let mut flow = LoginFlow::new();
        flow.submit_credential(password_credential(), false).unwrap();
        flow.resolve_failure(&totp_required());

        for bad in ["12345", "1234567", "12345a", "abcdef", "", "ABCD-1234-wxyz"] {
            assert!(
                flow.submit_second_factor(bad).is_none(),
                "{:?} should not reach the network",
                bad
            );
            assert!(flow.error().is_some());
            assert_eq!(flow.mode(), LoginMode::Totp);
        }
    }

    #[test]
    fn test_recovery_code_login_requires_dismissal() {
        let mut flow = LoginFlow::new();
        flow.submit_credential(password_credential(), false).unwrap();
        flow.resolve_failure(&totp_required());

        let submission = flow.submit_second_factor("ABCD-1234-WXYZ").unwrap();
        assert_eq!(submission.totp_code.as_deref(), Some("ABCD-1234-WXYZ"));
        flow.resolve_success();

        let session = signed_in_session();
        assert_eq!(flow.status(&session), LoginStatus::RecoveryNotice);
        assert!(!flow.take_logged_in(&session), "not reported before dismissal");

        flow.dismiss_recovery_notice();
        assert_eq!(flow.status(&session), LoginStatus::Complete);
        assert!(flow.take_logged_in(&session));
        assert!(!flow.take_logged_in(&session));
    }

    #[test]
    fn test_totp_code_login_skips_the_notice() {
        let mut flow = LoginFlow::new();
        flow.submit_credential(password_credential(), false).unwrap();
        flow.resolve_failure(&totp_required());
        flow.submit_second_factor("654321").unwrap();
        flow.resolve_success();

        assert_eq!(flow.status(&signed_in_session()), LoginStatus::Complete);
    }

    #[test]
    fn test_wrong_second_factor_stays_in_stage() {
        let mut flow = LoginFlow::new();
        flow.submit_credential(password_credential(), false).unwrap();
        flow.resolve_failure(&totp_required());
        flow.submit_second_factor("111111").unwrap();
        flow.resolve_failure(&AuthError::application("BAD_CODE", "That code is not right"));

        assert_eq!(flow.mode(), LoginMode::Totp);
        assert_eq!(flow.error(), Some("That code is not right"));

        // A corrected code goes straight back out
        assert!(flow.submit_second_factor("222222").is_some());
    }

    #[test]
    fn test_forgot_password_round_trip() {
        let mut flow = LoginFlow::new();
        flow.submit_credential(password_credential(), false).unwrap();
        flow.resolve_failure(&AuthError::application("BAD_PASSWORD", "Wrong password"));

        flow.forgot_password();
        assert_eq!(flow.mode(), LoginMode::ForgotPassword);

        flow.cancel_forgot_password();
        assert_eq!(flow.mode(), LoginMode::Login);
        assert!(flow.attempt().is_none(), "going back discards the attempt");
        assert!(flow.error().is_none());
    }

    #[test]
    fn test_forgot_password_only_from_login_stage() {
        let mut flow = LoginFlow::new();
        flow.submit_credential(password_credential(), false).unwrap();
        flow.resolve_failure(&totp_required());

        flow.forgot_password();
        assert_eq!(flow.mode(), LoginMode::Totp);
    }

    #[test]
    fn test_recovery_input_toggle_stays_in_stage() {
        let mut flow = LoginFlow::new();
        flow.submit_credential(password_credential(), false).unwrap();
        flow.resolve_failure(&totp_required());

        assert!(!flow.recovery_input_active());
        flow.toggle_recovery_input();
        assert!(flow.recovery_input_active());
        assert_eq!(flow.mode(), LoginMode::Totp);
        flow.toggle_recovery_input();
        assert!(!flow.recovery_input_active());

        // Outside the stage the toggle does nothing
        let mut flow = LoginFlow::new();
        flow.toggle_recovery_input();
        assert!(!flow.recovery_input_active());
    }

    #[test]
    fn test_second_factor_shapes() {
        let shapes = SecondFactorShapes::new();

        assert_eq!(shapes.classify("000000"), Some(SecondFactorKind::TotpCode));
        assert_eq!(shapes.classify("123456"), Some(SecondFactorKind::TotpCode));
        assert_eq!(
            shapes.classify("ABCD-1234-WXYZ"),
            Some(SecondFactorKind::RecoveryCode)
        );
        assert_eq!(
            shapes.classify("--------------"),
            Some(SecondFactorKind::RecoveryCode)
        );
        assert_eq!(
            shapes.classify("12345678901234"),
            Some(SecondFactorKind::RecoveryCode)
        );

        assert_eq!(shapes.classify("12345"), None);
        assert_eq!(shapes.classify("1234567"), None);
        assert_eq!(shapes.classify("abcd-1234-wxyz"), None);
        assert_eq!(shapes.classify("ABCD-1234-WXY"), None);
        assert_eq!(shapes.classify("ABCD-1234-WXYZ1"), None);
        assert_eq!(shapes.classify("ABCD 1234 WXYZ"), None);
    }
}
