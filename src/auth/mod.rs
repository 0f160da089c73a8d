pub mod api;
pub mod gateway;
pub mod login;
pub mod reauth;
pub mod session;
pub mod store;
pub mod token;

pub use api::{CredentialInput, IdentityApi, PasswordCredential};
pub use gateway::{CallOptions, CsrfGateway, CSRF_HEADER};
pub use login::{LoginFlow, LoginManager, LoginMode, LoginStatus};
pub use reauth::{ReauthCache, DEFAULT_MAX_AGE};
pub use session::{SessionManager, SessionSnapshot, REFRESH_INTERVAL};
pub use store::{SigninStore, StorageBackend, StoredSignin};
pub use token::{decode_bearer_claims, BearerClaims};
