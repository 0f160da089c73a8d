//! signon CLI
//!
//! Command-line client for a hosted identity service: it establishes a
//! csrf-protected session, signs users in (password, second factor, or a
//! browser OAuth handshake), and drives account maintenance operations
//! such as password changes, two-factor enrollment, and email verification.

mod auth;
mod cli;
mod config;
mod error;
mod http;
mod popup;

#[cfg(test)]
mod tests_login_flow;

use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tracing::{info, warn};

use auth::api::{CredentialInput, PasswordCredential};
use auth::login::LoginManager;
use auth::session::{SessionManager, SessionSnapshot, REFRESH_INTERVAL};
use auth::store::{SigninStore, StorageBackend, StoredSignin};
use auth::token::decode_bearer_claims;
use auth::{CsrfGateway, IdentityApi, LoginMode, LoginStatus, ReauthCache, DEFAULT_MAX_AGE};
use cli::{Cli, Commands};
use config::ServiceConfig;
use error::AuthError;
use popup::nonce::FileNonceStore;

/// How long the browser sign-in handshake may take
const BROWSER_SIGNIN_TIMEOUT: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity flags
    let log_level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr) // Log to stderr to keep stdout clean
        .init();

    let Cli {
        command,
        service,
        app_id,
        ..
    } = cli;

    let result = match command {
        Commands::Login(args) => execute_login_cli(args, service, app_id).await,
        Commands::Logout(args) => execute_logout_cli(args).await,
        Commands::Whoami => execute_whoami_cli().await,
        Commands::Signup(args) => execute_signup_cli(args, service, app_id).await,
        Commands::Password(args) => execute_password_cli(args, service, app_id).await,
        Commands::Twofactor(args) => execute_twofactor_cli(args, service, app_id).await,
        Commands::Email(args) => execute_email_cli(args, service, app_id).await,
        Commands::Session => execute_session_cli(service, app_id).await,
    };

    // Handle result and exit with appropriate code
    match result {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(get_exit_code(&e));
        }
    }
}

/// Live connection to the identity service
struct Connection {
    session: SessionManager,
    api: IdentityApi,
}

/// Build the HTTP client, establish the session, and wire up the gateway.
/// A failed bootstrap is recorded but not fatal here: the affected command
/// reports its own, more specific error.
async fn connect(service: Option<String>, app_id: Option<String>) -> Result<Connection> {
    let config = ServiceConfig::new(
        service.as_deref().unwrap_or(config::DEFAULT_SERVICE),
        app_id.as_deref().unwrap_or(config::DEFAULT_APPLICATION_ID),
    )?;

    let client = http::client_with_timeout(Duration::from_secs(30));
    let session = SessionManager::new(config.clone(), client.clone());
    if let Err(e) = session.bootstrap().await {
        warn!("Session bootstrap failed: {}", e);
    }

    let gateway = CsrfGateway::new(client, config, session.subscribe());
    let api = IdentityApi::new(gateway);

    Ok(Connection { session, api })
}

/// Read one line from the terminal
fn prompt(label: &str) -> Result<String> {
    use std::io::{self, Write};

    print!("{}: ", label);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

/// Take the flag value, or prompt for it
fn require(value: Option<String>, label: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => {
            let entered = prompt(label)?;
            if entered.is_empty() {
                return Err(anyhow::anyhow!("{} is required", label));
            }
            Ok(entered)
        }
    }
}

/// Persist the sign-in so later invocations can pick it up
fn remember_signin(
    snapshot: &SessionSnapshot,
    email: Option<&str>,
) -> Result<(String, &'static str)> {
    let bearer = snapshot
        .bearer_token
        .clone()
        .ok_or_else(|| anyhow::anyhow!("No bearer token to remember"))?;
    let subject = snapshot.subject_id().map(str::to_string);

    // Prefer the email the user typed; OAuth sign-ins fall back to the
    // address in the claims, then to the subject id
    let account = email
        .map(str::to_string)
        .or_else(|| {
            snapshot
                .claims
                .as_ref()
                .and_then(|c| c.extra.get("email"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .or_else(|| subject.clone())
        .ok_or_else(|| anyhow::anyhow!("No account identity to remember"))?;

    let store = SigninStore::new()?;
    store.save(&StoredSignin {
        email: account.clone(),
        bearer_token: bearer,
        subject_id: subject,
        saved_at: chrono::Utc::now(),
    })?;
    store.set_active_account(&account)?;

    let backend = match store.backend() {
        StorageBackend::Keyring => "OS keyring",
        StorageBackend::File => "file",
    };
    Ok((account, backend))
}

/// Execute the login command
async fn execute_login_cli(
    args: cli::LoginArgs,
    service: Option<String>,
    app_id: Option<String>,
) -> Result<String> {
    let conn = connect(service, app_id).await?;
    let mut manager = LoginManager::new(&conn.api, &conn.session);

    let typed_email = if args.oauth {
        info!("Opening the browser to sign in...");
        let nonce_store = FileNonceStore::new()?;
        manager
            .submit_browser_signin(&nonce_store, args.stay, BROWSER_SIGNIN_TIMEOUT)
            .await?;
        None
    } else {
        let email = require(args.email, "Email")?;
        let password = require(args.password, "Password")?;
        let credential = CredentialInput::Password(PasswordCredential {
            email: email.clone(),
            password,
        });
        manager.submit_credential(credential, args.stay).await?;

        if manager.flow().mode() == LoginMode::Totp {
            info!("This account asks for a second factor");
            let mut pending = args.totp.clone();
            let mut attempts = 0;
            loop {
                let code = match pending.take() {
                    Some(c) => c,
                    None => prompt("One-time code (or recovery code)")?,
                };
                match manager.submit_second_factor(&code).await {
                    Ok(()) => break,
                    Err(e) => {
                        attempts += 1;
                        if args.totp.is_some() || attempts >= 3 {
                            return Err(e.into());
                        }
                        eprintln!("  {}", e);
                    }
                }
            }
        }
        Some(email)
    };

    let snapshot = conn.session.snapshot();
    if manager.flow().status(&snapshot) == LoginStatus::RecoveryNotice {
        println!("You signed in with a recovery code; it is now used up.");
        println!("Generate a fresh set with: signon twofactor recovery");
        manager.flow_mut().dismiss_recovery_notice();
    }

    let snapshot = conn.session.snapshot();
    if !manager.flow_mut().take_logged_in(&snapshot) {
        return Err(anyhow::anyhow!(
            "Signed in, but the session does not show an account yet"
        ));
    }

    let mut output = match &typed_email {
        Some(email) => format!("✓ Signed in as {}", email),
        None => "✓ Signed in".to_string(),
    };
    if let Some(subject) = snapshot.subject_id() {
        output.push_str(&format!("\n  Subject: {}", subject));
    }
    if args.stay {
        let (account, backend) = remember_signin(&snapshot, typed_email.as_deref())?;
        output.push_str(&format!("\n  Remembered as: {} ({})", account, backend));
    }
    Ok(output)
}

/// Execute the logout command
async fn execute_logout_cli(args: cli::LogoutArgs) -> Result<String> {
    let store = SigninStore::new()?;

    let account = match args.email {
        Some(e) => e,
        None => store
            .active_account()?
            .ok_or_else(|| anyhow::anyhow!("No active sign-in. Specify --email"))?,
    };

    store.delete(&account)?;
    Ok(format!("✓ Signed out {}", account))
}

/// Execute the whoami command
async fn execute_whoami_cli() -> Result<String> {
    let store = SigninStore::new()?;

    let Some(account) = store.active_account()? else {
        return Ok("Not signed in. Use 'signon login' to sign in.".to_string());
    };
    let Some(signin) = store.load(&account)? else {
        return Ok(format!(
            "Active account {} has no stored sign-in. Use 'signon login'.",
            account
        ));
    };

    let mut output = format!("Signed in as {}", signin.email);
    if let Some(subject) = &signin.subject_id {
        output.push_str(&format!("\n  Subject: {}", subject));
    }
    match decode_bearer_claims(&signin.bearer_token) {
        Ok(claims) => {
            if let Some(issued) = claims.issued_at() {
                output.push_str(&format!(
                    "\n  Token issued: {}",
                    issued.format("%Y-%m-%d %H:%M UTC")
                ));
            }
        }
        Err(e) => {
            output.push_str(&format!("\n  Stored token unreadable: {}", e));
        }
    }
    output.push_str(&format!(
        "\n  Saved: {}",
        signin.saved_at.format("%Y-%m-%d %H:%M UTC")
    ));
    Ok(output)
}

/// Execute the signup command
async fn execute_signup_cli(
    args: cli::SignupArgs,
    service: Option<String>,
    app_id: Option<String>,
) -> Result<String> {
    let conn = connect(service, app_id).await?;

    let email = require(args.email, "Email")?;
    let password = require(args.password, "Password")?;
    let login_after = !args.no_login;

    conn.api
        .create_account(&email, &password, login_after, args.stay)
        .await?;

    let mut output = format!("✓ Account created for {}", email);
    if login_after {
        conn.session.refresh_now().await?;
        let snapshot = conn.session.snapshot();
        if let Some(subject) = snapshot.subject_id() {
            output.push_str(&format!("\n  Signed in as subject {}", subject));
        }
        if args.stay {
            let (account, backend) = remember_signin(&snapshot, Some(&email))?;
            output.push_str(&format!("\n  Remembered as: {} ({})", account, backend));
        }
    }
    output.push_str("\n  Confirm the address with the emailed link or 'signon email verify <token>'");
    Ok(output)
}

/// Execute the password command group
async fn execute_password_cli(
    args: cli::PasswordArgs,
    service: Option<String>,
    app_id: Option<String>,
) -> Result<String> {
    let conn = connect(service, app_id).await?;

    match args.command {
        cli::PasswordCommands::Change {
            old_password,
            new_password,
        } => {
            let old_password = require(old_password, "Current password")?;
            let new_password = require(new_password, "New password")?;
            conn.api.change_password(&old_password, &new_password).await?;
            Ok("✓ Password changed".to_string())
        }
        cli::PasswordCommands::Add {
            email,
            new_password,
        } => {
            let email = require(email, "Email")?;
            let new_password = require(new_password, "New password")?;
            conn.api.add_password(&email, &new_password).await?;
            Ok(format!("✓ Password added to {}", email))
        }
        cli::PasswordCommands::RequestReset { email } => {
            let email = require(email, "Email")?;
            conn.api.request_password_reset(&email).await?;
            Ok(format!(
                "✓ If {} has an account, a reset link is on its way",
                email
            ))
        }
        cli::PasswordCommands::Reset {
            token,
            new_password,
            login,
            stay,
        } => {
            let new_password = require(new_password, "New password")?;
            let stay_logged_in = if login { Some(stay) } else { None };
            let outcome = conn
                .api
                .reset_password(&token, &new_password, Some(login), stay_logged_in)
                .await?;

            let mut output = "✓ Password reset".to_string();
            if login {
                conn.session.refresh_now().await?;
                let snapshot = conn.session.snapshot();
                if let Some(subject) = snapshot.subject_id() {
                    output.push_str(&format!("\n  Signed in as subject {}", subject));
                }
                if stay {
                    let (account, backend) = remember_signin(&snapshot, None)?;
                    output.push_str(&format!("\n  Remembered as: {} ({})", account, backend));
                }
            }
            if let Some(redirect) = outcome.redirect_uri {
                output.push_str(&format!("\n  Continue at: {}", redirect));
            }
            Ok(output)
        }
    }
}

/// Execute the twofactor command group
async fn execute_twofactor_cli(
    args: cli::TwofactorArgs,
    service: Option<String>,
    app_id: Option<String>,
) -> Result<String> {
    let conn = connect(service, app_id).await?;

    match args.command {
        cli::TwofactorCommands::Setup { code } => {
            let key = conn.api.get_totp_key().await?;
            println!("Add this account to your authenticator app:");
            println!("  {}", key.otpauth_url);

            let code = require(code, "Code shown by the app")?;
            conn.api.add_totp(&key.token, &code).await?;

            Ok("✓ Two-factor authentication is on\n  Keep recovery codes handy: signon twofactor recovery".to_string())
        }
        cli::TwofactorCommands::Status => {
            let count = conn.api.get_recovery_code_count().await?;
            Ok(match count {
                0 => "No recovery codes left. Generate a fresh set with 'signon twofactor recovery'".to_string(),
                1 => "1 recovery code remains".to_string(),
                n => format!("{} recovery codes remain", n),
            })
        }
        cli::TwofactorCommands::Recovery { password } => {
            // Generating codes invalidates the old set, so the service
            // wants proof of a recent re-authentication
            let contents = serde_json::json!("createRecoveryCodes");
            let mut reauth = ReauthCache::new();
            let token = reauth
                .obtain(&conn.api, &contents, DEFAULT_MAX_AGE, password.as_deref())
                .await?;

            let fresh = conn.api.create_recovery_codes(&token).await?;

            let mut output = String::from("✓ New recovery codes (the old set no longer works):");
            for code in &fresh.codes {
                output.push_str(&format!("\n  {}", code));
            }
            output.push_str("\nStore them somewhere safe; each works exactly once.");
            Ok(output)
        }
    }
}

/// Execute the email command group
async fn execute_email_cli(
    args: cli::EmailArgs,
    service: Option<String>,
    app_id: Option<String>,
) -> Result<String> {
    let conn = connect(service, app_id).await?;

    match args.command {
        cli::EmailCommands::Verify { token } => {
            let outcome = conn.api.verify_email(&token).await?;
            let mut output = "✓ Email address verified".to_string();
            if let Some(redirect) = outcome.redirect_uri {
                output.push_str(&format!("\n  Continue at: {}", redirect));
            }
            Ok(output)
        }
        cli::EmailCommands::SendVerification { email } => {
            let email = require(email, "Email")?;
            conn.api.send_verification_email(&email).await?;
            Ok(format!("✓ Verification email sent to {}", email))
        }
    }
}

/// Execute the session command
async fn execute_session_cli(
    service: Option<String>,
    app_id: Option<String>,
) -> Result<String> {
    let conn = connect(service, app_id).await?;
    let snapshot = conn.session.snapshot();

    let mut output = String::from("Session:");
    output.push_str(&format!("\n  Service: {}", conn.api.config().service_url()));
    output.push_str(&format!(
        "\n  Application: {}",
        conn.api.config().application_id()
    ));
    output.push_str(&format!(
        "\n  Established: {}",
        if snapshot.is_established() { "yes" } else { "no" }
    ));
    match snapshot.subject_id() {
        Some(subject) => output.push_str(&format!("\n  Signed in as: {}", subject)),
        None => output.push_str("\n  Signed in as: nobody (anonymous session)"),
    }
    if let Some(error) = &snapshot.error {
        output.push_str(&format!("\n  Last error: {}", error));
    }
    output.push_str(&format!(
        "\n  Refresh interval: {}s",
        REFRESH_INTERVAL.as_secs()
    ));
    Ok(output)
}

/// Map errors to exit codes
fn get_exit_code(err: &anyhow::Error) -> i32 {
    if let Some(auth) = err.downcast_ref::<AuthError>() {
        return auth.exit_code();
    }

    let err_str = err.to_string().to_lowercase();
    if err_str.contains("invalid") || err_str.contains("required") {
        1 // Invalid arguments or usage error
    } else if err_str.contains("network") || err_str.contains("connection") {
        2 // Network or API error
    } else if err_str.contains("timeout") {
        4 // Timeout error
    } else {
        5 // Other application errors
    }
}
