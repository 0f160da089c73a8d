//! Command-line surface of the signon client

use clap::{Parser, Subcommand};

/// signon CLI
#[derive(Parser)]
#[command(name = "signon")]
#[command(about = "Account client for the hosted identity service", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Identity service URL
    #[arg(long, global = true, env = "SIGNON_SERVICE")]
    pub service: Option<String>,

    /// Application id reported when the session is established
    #[arg(long, global = true, env = "SIGNON_APP_ID")]
    pub app_id: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-error output (no short flag to avoid conflicts)
    #[arg(long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in with a password or through the browser
    Login(LoginArgs),
    /// Forget the remembered sign-in
    Logout(LogoutArgs),
    /// Show who is signed in
    Whoami,
    /// Create a new account
    Signup(SignupArgs),
    /// Change, add, or reset the account password
    Password(PasswordArgs),
    /// Set up and inspect two-factor authentication
    Twofactor(TwofactorArgs),
    /// Verify the account email address
    Email(EmailArgs),
    /// Show the bootstrapped session state
    Session,
}

/// Login command arguments
#[derive(Parser, Debug, Clone)]
pub struct LoginArgs {
    /// Account email
    #[arg(short = 'u', long)]
    pub email: Option<String>,

    /// Account password (prompted when omitted)
    #[arg(short = 'p', long)]
    pub password: Option<String>,

    /// Sign in through the system browser instead of a password
    #[arg(long)]
    pub oauth: bool,

    /// One-time code, when two-factor is already known to be on
    #[arg(long)]
    pub totp: Option<String>,

    /// Remember this sign-in for later invocations
    #[arg(long)]
    pub stay: bool,
}

/// Logout command arguments
#[derive(Parser, Debug)]
pub struct LogoutArgs {
    /// Email to forget (defaults to the active sign-in)
    #[arg(short = 'u', long)]
    pub email: Option<String>,
}

/// Signup command arguments
#[derive(Parser, Debug)]
pub struct SignupArgs {
    /// Account email
    #[arg(short = 'u', long)]
    pub email: Option<String>,

    /// Account password (prompted when omitted)
    #[arg(short = 'p', long)]
    pub password: Option<String>,

    /// Create the account without signing in afterwards
    #[arg(long)]
    pub no_login: bool,

    /// Remember this sign-in for later invocations
    #[arg(long)]
    pub stay: bool,
}

/// Password management arguments
#[derive(Parser, Debug)]
pub struct PasswordArgs {
    #[command(subcommand)]
    pub command: PasswordCommands,
}

#[derive(Subcommand, Debug)]
pub enum PasswordCommands {
    /// Change the password of the signed-in account
    Change {
        /// Current password (prompted when omitted)
        #[arg(long)]
        old_password: Option<String>,

        /// New password (prompted when omitted)
        #[arg(long)]
        new_password: Option<String>,
    },
    /// Add a password to an account created through a provider
    Add {
        /// Account email
        #[arg(short = 'u', long)]
        email: Option<String>,

        /// New password (prompted when omitted)
        #[arg(long)]
        new_password: Option<String>,
    },
    /// Email a password-reset link
    RequestReset {
        /// Account email
        #[arg(short = 'u', long)]
        email: Option<String>,
    },
    /// Finish a reset with the emailed token
    Reset {
        /// Token from the reset email
        #[arg(long)]
        token: String,

        /// New password (prompted when omitted)
        #[arg(long)]
        new_password: Option<String>,

        /// Sign in once the password is set
        #[arg(long)]
        login: bool,

        /// Remember this sign-in for later invocations
        #[arg(long)]
        stay: bool,
    },
}

/// Two-factor management arguments
#[derive(Parser, Debug)]
pub struct TwofactorArgs {
    #[command(subcommand)]
    pub command: TwofactorCommands,
}

#[derive(Subcommand, Debug)]
pub enum TwofactorCommands {
    /// Enroll an authenticator app
    Setup {
        /// Code from the authenticator app (prompted when omitted)
        #[arg(long)]
        code: Option<String>,
    },
    /// Show how many recovery codes remain
    Status,
    /// Generate a fresh set of recovery codes
    Recovery {
        /// Account password, for the re-authentication step
        #[arg(short = 'p', long)]
        password: Option<String>,
    },
}

/// Email verification arguments
#[derive(Parser, Debug)]
pub struct EmailArgs {
    #[command(subcommand)]
    pub command: EmailCommands,
}

#[derive(Subcommand, Debug)]
pub enum EmailCommands {
    /// Confirm an address with the emailed token
    Verify {
        /// Token from the verification email
        token: String,
    },
    /// Send the verification email again
    SendVerification {
        /// Account email
        #[arg(short = 'u', long)]
        email: Option<String>,
    },
}
