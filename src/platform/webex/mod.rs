// ABOUTME: Webex REST and device integrations behind the core collaborator traits
// ABOUTME: Shared HTTP helpers used by the message, device, OAuth and admin clients

pub mod admin;
pub mod cards;
pub mod client;
pub mod device;
pub mod oauth;

pub use admin::WebexAdmin;
pub use client::{BotIdentity, WebexClient};
pub use device::{DeviceDescriptor, DeviceRegistry, StaticDeviceRegistry, WdmDeviceRegistry};
pub use oauth::WebexTokenEndpoint;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Per-request timeout for REST calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// `{ "items": [...] }` wrapper used by every Webex list endpoint
#[derive(Debug, Deserialize)]
pub(crate) struct ItemList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("boardbot/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

/// Turn a non-2xx response into an error carrying the status and body
pub(crate) async fn ensure_success(
    response: reqwest::Response,
    what: &str,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let preview: String = body.chars().take(300).collect();
    bail!("{what} failed with {status}: {preview}")
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
