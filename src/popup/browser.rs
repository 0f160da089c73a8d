//! Sign-in window flow over the system browser
//!
//! Native processes have no real child windows, so the window shell opens
//! the system browser and a loopback HTTP listener plays the part of the
//! message path back: the service ends the redirect chain at the listener,
//! and each request there is turned into a window message that still goes
//! through the channel's origin and source validation.

use axum::{extract::Query, response::Html, routing::get, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use crate::error::AuthError;
use crate::popup::{ChildWindow, PopupChannel, WindowFeatures, WindowId, WindowMessage, WindowShell};

/// Query parameter telling the service where to end the redirect chain
pub const REDIRECT_PARAM: &str = "redirectUri";

/// Opens sign-in URLs in the default browser
pub struct SystemBrowserShell {
    next_id: AtomicU64,
}

impl SystemBrowserShell {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
        }
    }
}

impl Default for SystemBrowserShell {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowShell for SystemBrowserShell {
    fn open(&self, url: &Url, _features: &WindowFeatures) -> Result<Box<dyn ChildWindow>, AuthError> {
        webbrowser::open(url.as_str())
            .map_err(|e| AuthError::Popup(format!("Failed to open the browser: {}", e)))?;
        let id = WindowId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        Ok(Box::new(BrowserTab { id }))
    }
}

struct BrowserTab {
    id: WindowId,
}

impl ChildWindow for BrowserTab {
    fn id(&self) -> WindowId {
        self.id
    }

    fn navigate(&self, url: &Url) -> Result<(), AuthError> {
        // An already-open tab cannot be steered from here; show the URL in
        // a fresh one instead
        webbrowser::open(url.as_str())
            .map_err(|e| AuthError::Popup(format!("Failed to open the browser: {}", e)))
    }

    fn focus(&self) {
        // The browser raises its own window
    }

    fn close(&self) {
        // Tabs are left to the user
    }

    fn is_closed(&self) -> bool {
        false
    }
}

/// Parameters the redirect chain may end with
#[derive(Debug, Deserialize)]
struct CallbackParams {
    #[serde(rename = "oauthToken")]
    oauth_token: Option<String>,
    error: Option<String>,
    #[serde(rename = "errorDescription")]
    error_description: Option<String>,
}

/// Loopback endpoint receiving the end of the redirect chain
pub struct CallbackServer {
    addr: SocketAddr,
    origin: Url,
}

impl CallbackServer {
    /// Reserve a loopback port for the redirect endpoint
    pub fn new() -> Result<Self, AuthError> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")
            .map_err(|e| AuthError::Popup(format!("Failed to reserve a loopback port: {}", e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| AuthError::Popup(format!("Failed to read the loopback address: {}", e)))?;
        // Release the port so the async listener can bind it
        drop(listener);

        let origin = Url::parse(&format!("http://{}", addr))
            .map_err(|e| AuthError::Popup(format!("Invalid loopback address: {}", e)))?;

        Ok(Self { addr, origin })
    }

    /// URL the service should redirect back to
    pub fn callback_url(&self) -> Url {
        self.origin.clone()
    }

    pub fn origin(&self) -> Url {
        self.origin.clone()
    }

    /// Start listening, turning every request into a window message
    /// attributed to `source`. Requests without recognizable parameters
    /// become messages with an empty payload and are filtered downstream.
    pub async fn serve(&self, source: WindowId) -> Result<CallbackStream, AuthError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let origin = self.origin.to_string();

        let handler = move |Query(params): Query<CallbackParams>| async move {
            let payload = if let Some(token) = params.oauth_token {
                Some(serde_json::json!({ "oauthToken": token }))
            } else if let Some(error) = params.error {
                Some(serde_json::json!({
                    "error": error,
                    "errorDescription": params.error_description,
                }))
            } else {
                None
            };

            let _ = tx.send(WindowMessage {
                origin,
                source: Some(source),
                payload,
            });

            Html(COMPLETION_PAGE)
        };

        let app = Router::new().route("/", get(handler));

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| AuthError::Popup(format!("Failed to bind callback listener: {}", e)))?;

        debug!("Sign-in callback listener on {}", self.addr);

        let server_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::warn!("Callback listener stopped: {}", e);
            }
        });

        Ok(CallbackStream { rx, server_handle })
    }
}

/// Stream of synthesized window messages; stops serving when dropped
pub struct CallbackStream {
    rx: mpsc::UnboundedReceiver<WindowMessage>,
    server_handle: JoinHandle<()>,
}

impl CallbackStream {
    pub async fn recv(&mut self) -> Option<WindowMessage> {
        self.rx.recv().await
    }
}

impl Drop for CallbackStream {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

enum Outcome {
    Token(String),
    Failed(String),
}

/// Drives a complete sign-in window round trip
pub struct BrowserSigninFlow {
    server: CallbackServer,
    channel: PopupChannel,
}

impl BrowserSigninFlow {
    /// Stand up the loopback endpoint and a channel that trusts it
    pub fn new() -> Result<Self, AuthError> {
        Self::with_shell(Box::new(SystemBrowserShell::new()))
    }

    pub fn with_shell(shell: Box<dyn WindowShell>) -> Result<Self, AuthError> {
        let server = CallbackServer::new()?;
        let channel = PopupChannel::new(shell, server.origin());
        Ok(Self { server, channel })
    }

    pub fn callback_url(&self) -> Url {
        self.server.callback_url()
    }

    /// Open the sign-in window on `signin_url`, with the redirect pointed
    /// back at this process, and wait for the token message.
    pub async fn obtain_token(
        &mut self,
        signin_url: &Url,
        timeout: Duration,
    ) -> Result<String, AuthError> {
        let mut url = signin_url.clone();
        url.query_pairs_mut()
            .append_pair(REDIRECT_PARAM, self.server.callback_url().as_str());

        let mut delivered = self.channel.open(&url)?;
        let source = self
            .channel
            .window_id()
            .ok_or_else(|| AuthError::Popup("Sign-in window is not open".to_string()))?;
        let mut messages = self.server.serve(source).await?;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let result = loop {
            tokio::select! {
                message = messages.recv() => {
                    let Some(message) = message else {
                        break Err(AuthError::Popup(
                            "Callback listener stopped unexpectedly".to_string(),
                        ));
                    };
                    self.channel.handle_message(message);
                    match drain_delivered(&mut delivered) {
                        Some(Outcome::Token(token)) => break Ok(token),
                        Some(Outcome::Failed(reason)) => break Err(AuthError::Popup(reason)),
                        None => {}
                    }
                }
                _ = &mut deadline => {
                    break Err(AuthError::Timeout(
                        "Timed out waiting for the sign-in window".to_string(),
                    ));
                }
            }
        };

        self.channel.close();
        result
    }
}

/// Inspect payloads the channel accepted, looking for the token
fn drain_delivered(rx: &mut mpsc::UnboundedReceiver<serde_json::Value>) -> Option<Outcome> {
    while let Ok(payload) = rx.try_recv() {
        if let Some(token) = payload.get("oauthToken").and_then(|v| v.as_str()) {
            return Some(Outcome::Token(token.to_string()));
        }
        if let Some(error) = payload.get("error").and_then(|v| v.as_str()) {
            let description = payload
                .get("errorDescription")
                .and_then(|v| v.as_str())
                .unwrap_or("no description");
            return Some(Outcome::Failed(format!("{}: {}", error, description)));
        }
        debug!("Sign-in message without a token, ignoring");
    }
    None
}

const COMPLETION_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>Sign-in complete</title>
    <style>
        body {
            font-family: system-ui, -apple-system, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            min-height: 100vh;
            margin: 0;
            background: #f3f4f6;
        }
        main {
            background: white;
            padding: 2.5rem 3rem;
            border-radius: 0.75rem;
            box-shadow: 0 10px 30px rgba(0, 0, 0, 0.12);
            text-align: center;
        }
        h1 {
            color: #111827;
            font-size: 1.5rem;
            margin: 0 0 0.5rem;
        }
        p {
            color: #6b7280;
            margin: 0;
        }
    </style>
</head>
<body>
    <main>
        <h1>Sign-in complete</h1>
        <p>You can close this window and return to the terminal.</p>
    </main>
</body>
</html>"#;
