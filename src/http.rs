//! HTTP client construction
//!
//! Every request to the identity service goes through a reqwest::Client
//! built here, with a shared timeout, user agent and proxy env support.

use reqwest::{Client, NoProxy, Proxy};
use std::time::Duration;

/// Build a reqwest Client with the given timeout and honoring proxy env vars
///
/// Recognized env vars, upper or lower case:
/// - HTTPS_PROXY / HTTP_PROXY / ALL_PROXY
/// - NO_PROXY
pub fn client_with_timeout(timeout: Duration) -> Client {
    let mut builder = Client::builder().timeout(timeout);

    let no_proxy = getenv_first(&["NO_PROXY", "no_proxy"]).and_then(|v| NoProxy::from_string(&v));

    let https_proxy = getenv_first(&["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"]);
    if let Some(value) = https_proxy {
        if let Ok(proxy) = Proxy::https(&value) {
            builder = builder.proxy(proxy.no_proxy(no_proxy.clone()));
        }
    }

    let http_proxy = getenv_first(&["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"]);
    if let Some(value) = http_proxy {
        if let Ok(proxy) = Proxy::http(&value) {
            builder = builder.proxy(proxy.no_proxy(no_proxy));
        }
    }

    builder
        .user_agent(concat!("signon/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("Failed to create HTTP client")
}

fn getenv_first(keys: &[&str]) -> Option<String> {
    for k in keys {
        if let Ok(v) = std::env::var(k) {
            if !v.trim().is_empty() {
                return Some(v);
            }
        }
    }
    None
}
