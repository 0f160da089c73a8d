//! Sign-in window management
//!
//! A single named child window carries the OAuth redirect dance. The
//! channel tracks that window across repeated open calls, validates every
//! message claiming to come from it, and hands accepted payloads to the
//! one active listener.

pub mod browser;
pub mod nonce;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::error::AuthError;

/// Identity of a child window, compared when validating message sources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowId(pub u64);

/// Geometry for the sign-in window
#[derive(Debug, Clone, PartialEq)]
pub struct WindowFeatures {
    pub width: u32,
    pub height: u32,
}

impl Default for WindowFeatures {
    fn default() -> Self {
        Self {
            width: 600,
            height: 700,
        }
    }
}

impl WindowFeatures {
    /// Render as a window feature list, centered on a screen of the given
    /// size, with browser chrome disabled
    pub fn to_feature_string(&self, screen_width: u32, screen_height: u32) -> String {
        let left = screen_width.saturating_sub(self.width) / 2;
        let top = screen_height.saturating_sub(self.height) / 2;
        format!(
            "width={},height={},left={},top={},menubar=no,toolbar=no,location=no,status=no",
            self.width, self.height, left, top
        )
    }
}

/// Something that can put a window on screen
pub trait WindowShell: Send + Sync {
    fn open(&self, url: &Url, features: &WindowFeatures) -> Result<Box<dyn ChildWindow>, AuthError>;
}

/// A window the shell opened on our behalf
pub trait ChildWindow: Send {
    fn id(&self) -> WindowId;
    fn navigate(&self, url: &Url) -> Result<(), AuthError>;
    fn focus(&self);
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// A message posted toward the opener from some window
#[derive(Debug, Clone)]
pub struct WindowMessage {
    /// Origin of the sender, as scheme://host:port
    pub origin: String,

    /// Identity of the posting window, when the transport knows it
    pub source: Option<WindowId>,

    /// Message body; protocol messages are JSON objects
    pub payload: Option<serde_json::Value>,
}

/// Manages the sign-in window and the message path back from it
pub struct PopupChannel {
    shell: Box<dyn WindowShell>,
    expected_origin: Url,
    features: WindowFeatures,
    window: Option<Box<dyn ChildWindow>>,
    current_url: Option<Url>,
    listener: Option<mpsc::UnboundedSender<serde_json::Value>>,
}

impl PopupChannel {
    /// Build a channel that only accepts messages from `expected_origin`
    pub fn new(shell: Box<dyn WindowShell>, expected_origin: Url) -> Self {
        Self {
            shell,
            expected_origin,
            features: WindowFeatures::default(),
            window: None,
            current_url: None,
            listener: None,
        }
    }

    /// Show the sign-in window on `url` and install a fresh listener.
    ///
    /// An existing window is reused: same URL means focus only, a new URL
    /// means navigate and focus. A window the user closed is replaced.
    /// The previous listener, if any, is detached; its receiver ends
    /// without ever yielding a message.
    pub fn open(&mut self, url: &Url) -> Result<mpsc::UnboundedReceiver<serde_json::Value>, AuthError> {
        match &self.window {
            Some(window) if !window.is_closed() => {
                if self.current_url.as_ref() == Some(url) {
                    debug!("Sign-in window already on {}, focusing", url);
                    window.focus();
                } else {
                    debug!("Steering sign-in window to {}", url);
                    window.navigate(url)?;
                    window.focus();
                    self.current_url = Some(url.clone());
                }
            }
            _ => {
                debug!("Opening sign-in window on {}", url);
                let window = self.shell.open(url, &self.features)?;
                self.window = Some(window);
                self.current_url = Some(url.clone());
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.listener = Some(tx);
        Ok(rx)
    }

    /// Close the window and forget it, including the URL it was showing.
    /// Any waiting listener is detached as well.
    pub fn close(&mut self) {
        if let Some(window) = self.window.take() {
            window.close();
        }
        self.current_url = None;
        self.listener = None;
    }

    /// Id of the currently tracked window
    pub fn window_id(&self) -> Option<WindowId> {
        self.window.as_ref().map(|w| w.id())
    }

    /// Validate an inbound message and deliver its payload.
    ///
    /// Empty payloads and messages from windows other than ours are
    /// dropped; a foreign origin is dropped loudly since it suggests
    /// someone probing the protocol.
    pub fn handle_message(&self, message: WindowMessage) {
        let Some(payload) = message.payload else {
            debug!("Dropping window message with empty payload");
            return;
        };

        if !origin_matches(&self.expected_origin, &message.origin) {
            warn!(
                "Dropping window message from unexpected origin {:?}",
                message.origin
            );
            return;
        }

        let expected_source = self.window.as_ref().map(|w| w.id());
        if expected_source.is_none() || message.source != expected_source {
            return;
        }

        if let Some(listener) = &self.listener {
            if listener.send(payload).is_err() {
                debug!("Window message arrived after its waiter went away");
            }
        }
    }
}

fn origin_matches(expected: &Url, origin: &str) -> bool {
    match Url::parse(origin) {
        Ok(url) => url.origin() == expected.origin(),
        Err(_) => false,
    }
}
