//! Session establishment and refresh
//!
//! The identity service hands out a csrf token and a bearer token from a
//! single bootstrap call. The pair is fetched once at startup and then
//! re-fetched on a fixed interval; consumers observe the latest snapshot
//! over a watch channel. A refresh failure never clears tokens that were
//! already obtained.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::api::{self, SessionTokens};
use crate::auth::token::{decode_bearer_claims, BearerClaims};
use crate::config::ServiceConfig;
use crate::error::AuthError;

/// How often the token pair is re-fetched once established
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Point-in-time view of the session
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    /// Anti-forgery token attached to every authenticated request
    pub csrf_token: Option<String>,

    /// Current bearer token; present for anonymous sessions too
    pub bearer_token: Option<String>,

    /// Claims decoded from the bearer, absent when nobody is signed in
    pub claims: Option<BearerClaims>,

    /// True while the initial bootstrap call is in flight
    pub loading: bool,

    /// Most recent failure, kept for diagnostics only
    pub error: Option<String>,
}

impl SessionSnapshot {
    /// Subject id of the signed-in account, if any
    pub fn subject_id(&self) -> Option<&str> {
        self.claims.as_ref().map(|c| c.sub.as_str())
    }

    /// Whether the csrf token has been obtained
    pub fn is_established(&self) -> bool {
        self.csrf_token.is_some()
    }
}

/// Owns the session lifecycle: one bootstrap, then periodic refresh
pub struct SessionManager {
    inner: Arc<SessionInner>,
    refresh_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

struct SessionInner {
    config: ServiceConfig,
    client: reqwest::Client,
    tx: watch::Sender<SessionSnapshot>,
    bootstrapped: AtomicBool,
    established: AtomicBool,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl SessionManager {
    pub fn new(config: ServiceConfig, client: reqwest::Client) -> Self {
        let (tx, _rx) = watch::channel(SessionSnapshot::default());
        Self {
            inner: Arc::new(SessionInner {
                config,
                client,
                tx,
                bootstrapped: AtomicBool::new(false),
                established: AtomicBool::new(false),
                refresh_lock: tokio::sync::Mutex::new(()),
            }),
            refresh_task: std::sync::Mutex::new(None),
        }
    }

    /// Watch the session snapshot. The receiver always holds the latest
    /// value; no history is kept.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.tx.subscribe()
    }

    /// Current snapshot by value
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.tx.borrow().clone()
    }

    /// Establish the session for the configured application id.
    ///
    /// The first call wins. Any later call is ignored, including after a
    /// failed establishment: a failed bootstrap leaves the session empty
    /// with the error recorded, and nothing retries it.
    pub async fn bootstrap(&self) -> Result<(), AuthError> {
        if self.inner.bootstrapped.swap(true, Ordering::SeqCst) {
            debug!("Session already bootstrapped, ignoring repeat call");
            return Ok(());
        }

        self.inner.tx.send_modify(|s| s.loading = true);
        let result = self.inner.fetch_and_apply().await;
        self.inner.tx.send_modify(|s| s.loading = false);

        match result {
            Ok(()) => {
                info!(
                    "Session established for application {}",
                    self.inner.config.application_id()
                );
                self.inner.established.store(true, Ordering::SeqCst);
                self.spawn_refresh_task();
                Ok(())
            }
            Err(e) => {
                warn!("Session bootstrap failed: {}", e);
                Err(e)
            }
        }
    }

    /// Re-fetch the token pair now, outside the regular interval.
    ///
    /// Used after a login or logout so the bearer reflects the new
    /// identity. Failure keeps the previous tokens, like any refresh.
    pub async fn refresh_now(&self) -> Result<(), AuthError> {
        if !self.inner.established.load(Ordering::SeqCst) {
            debug!("Session never established, skipping refresh");
            return Ok(());
        }
        self.inner.fetch_and_apply().await
    }

    /// Drop the current identity and re-establish an anonymous session.
    ///
    /// The bootstrap guard stays armed and the refresh loop keeps running;
    /// only the snapshot content is cleared.
    pub async fn reset(&self) -> Result<(), AuthError> {
        self.inner.tx.send_modify(|s| {
            s.csrf_token = None;
            s.bearer_token = None;
            s.claims = None;
            s.error = None;
        });

        if self.inner.established.load(Ordering::SeqCst) {
            self.inner.fetch_and_apply().await
        } else {
            Ok(())
        }
    }
}

impl SessionInner {
    /// One serialized fetch: refresh never overlaps itself or a manual
    /// refresh, and a failure only touches the diagnostic error slot.
    async fn fetch_and_apply(&self) -> Result<(), AuthError> {
        let _guard = self.refresh_lock.lock().await;

        match api::bootstrap_session(&self.client, &self.config).await {
            Ok(tokens) => {
                self.tx.send_modify(|s| apply_tokens(s, tokens));
                Ok(())
            }
            Err(e) => {
                self.tx.send_modify(|s| s.error = Some(e.to_string()));
                Err(e)
            }
        }
    }
}

impl SessionManager {
    fn spawn_refresh_task(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(REFRESH_INTERVAL).await;
                match inner.fetch_and_apply().await {
                    Ok(()) => debug!("Session tokens refreshed"),
                    Err(e) => warn!("Session refresh failed, keeping previous tokens: {}", e),
                }
            }
        });

        let mut slot = self.refresh_task.lock().expect("refresh task slot");
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.refresh_task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

/// Fold a freshly fetched token pair into the snapshot
fn apply_tokens(snapshot: &mut SessionSnapshot, tokens: SessionTokens) {
    snapshot.claims = match decode_bearer_claims(&tokens.bearer_token) {
        Ok(claims) => Some(claims),
        Err(e) => {
            debug!("Bearer payload not decodable, treating as signed out: {}", e);
            None
        }
    };
    snapshot.csrf_token = Some(tokens.csrf_token);
    snapshot.bearer_token = Some(tokens.bearer_token);
    snapshot.error = None;
}
