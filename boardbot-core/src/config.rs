// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates credentials and the OAuth redirect URI, derives the callback bind address
use crate::backoff::BackoffConfig;
use crate::paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Scopes requested during the admin authorization handshake
pub const DEFAULT_SCOPES: &[&str] = &[
    "spark-compliance:memberships_read",
    "spark-admin:workspaces_write",
    "spark:kms",
    "spark-admin:devices_read",
    "Identity:one_time_password",
    "spark:people_read",
    "spark-admin:organizations_read",
    "spark-admin:workspaces_read",
    "spark-admin:devices_write",
    "spark-compliance:rooms_read",
    "spark:xapi_statuses",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub webex: WebexConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub bot: BotConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct WebexConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_devices_url")]
    pub devices_url: String,
}

impl Default for WebexConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            device_name: default_device_name(),
            api_base: default_api_base(),
            devices_url: default_devices_url(),
        }
    }
}

// Custom Debug impl to redact bot_token
impl std::fmt::Debug for WebexConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebexConfig")
            .field("bot_token", &"[REDACTED]")
            .field("device_name", &self.device_name)
            .field("api_base", &self.api_base)
            .field("devices_url", &self.devices_url)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Interface the callback server binds; derived from the redirect URI when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: default_redirect_uri(),
            authorize_url: default_authorize_url(),
            token_url: default_token_url(),
            scopes: default_scopes(),
            bind_address: None,
        }
    }
}

// Custom Debug impl to redact client_secret
impl std::fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .field("scopes", &self.scopes)
            .field("bind_address", &self.bind_address)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_initial_reconnect_secs")]
    pub initial_reconnect_secs: u64,
    #[serde(default = "default_max_reconnect_secs")]
    pub max_reconnect_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_reconnect_secs: default_initial_reconnect_secs(),
            max_reconnect_secs: default_max_reconnect_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
        }
    }
}

impl SessionConfig {
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_secs(self.initial_reconnect_secs),
            max_delay: Duration::from_secs(self.max_reconnect_secs),
            ..BackoffConfig::default()
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Silence longer than this means the connection is gone
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs + self.ping_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_concurrent_events")]
    pub max_concurrent_events: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_events: default_max_concurrent_events(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotConfig {
    /// Address shown at the end of the help text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support_contact: Option<String>,
}

/// Where the OAuth callback server listens, derived from the redirect URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackBinding {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl CallbackBinding {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_device_name() -> String {
    "boardbot".to_string()
}

fn default_api_base() -> String {
    "https://webexapis.com/v1".to_string()
}

fn default_devices_url() -> String {
    "https://wdm-a.wbx2.com/wdm/api/v1/devices".to_string()
}

fn default_redirect_uri() -> String {
    "http://127.0.0.1:9999/auth".to_string()
}

fn default_authorize_url() -> String {
    "https://webexapis.com/v1/authorize".to_string()
}

fn default_token_url() -> String {
    "https://webexapis.com/v1/access_token".to_string()
}

fn default_scopes() -> Vec<String> {
    DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect()
}

fn default_storage_path() -> String {
    paths::ROOM_STORE_FILE.to_string()
}

fn default_initial_reconnect_secs() -> u64 {
    5
}

fn default_max_reconnect_secs() -> u64 {
    300 // 5 minutes
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_ping_timeout_secs() -> u64 {
    10
}

fn default_max_concurrent_events() -> usize {
    16
}

impl Config {
    /// Find the config file, checking in order:
    /// 1. BOARDBOT_CONFIG_PATH env var (if set)
    /// 2. ./boardbot.toml
    /// 3. ~/.config/boardbot/config.toml
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("BOARDBOT_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_config = PathBuf::from("boardbot.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Load configuration from file (if any), apply environment overrides, validate
    pub fn load() -> Result<Self> {
        let mut config = if let Some(config_path) = Self::find_config_file() {
            tracing::info!(path = %config_path.display(), "Loading configuration from file");
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            tracing::info!("No config file found, using environment variables and defaults");
            Config::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("BOT_TOKEN") {
            self.webex.bot_token = val;
        }
        if let Ok(val) = std::env::var("WEBEX_DEVICE_NAME") {
            self.webex.device_name = val;
        }
        if let Ok(val) = std::env::var("OAUTH_CLIENT_ID") {
            self.oauth.client_id = val;
        }
        if let Ok(val) = std::env::var("OAUTH_CLIENT_SECRET") {
            self.oauth.client_secret = val;
        }
        if let Ok(val) = std::env::var("OAUTH_REDIRECT_URI") {
            self.oauth.redirect_uri = val;
        }
        if let Ok(val) = std::env::var("BOT_DATA_PATH") {
            self.storage.path = val;
        }
        if let Ok(val) = std::env::var("BOARDBOT_MAX_CONCURRENT_EVENTS") {
            self.dispatch.max_concurrent_events = val.parse().with_context(|| {
                format!("BOARDBOT_MAX_CONCURRENT_EVENTS must be a positive number, got: {val}")
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.webex.bot_token.trim().is_empty() {
            anyhow::bail!("webex.bot_token is required (set in config file or BOT_TOKEN env var)");
        }
        if self.oauth.client_id.trim().is_empty() || self.oauth.client_secret.trim().is_empty() {
            anyhow::bail!(
                "oauth.client_id and oauth.client_secret are required (OAUTH_CLIENT_ID / OAUTH_CLIENT_SECRET)"
            );
        }
        self.callback_binding()?;
        if self.dispatch.max_concurrent_events == 0 {
            anyhow::bail!("dispatch.max_concurrent_events must be at least 1");
        }
        if self.session.ping_interval_secs == 0 {
            anyhow::bail!("session.ping_interval_secs must be at least 1");
        }
        if self.session.initial_reconnect_secs == 0
            || self.session.initial_reconnect_secs > self.session.max_reconnect_secs
        {
            anyhow::bail!(
                "session.initial_reconnect_secs must be between 1 and max_reconnect_secs ({})",
                self.session.max_reconnect_secs
            );
        }
        Ok(())
    }

    /// Bind address, port and route for the OAuth callback server
    pub fn callback_binding(&self) -> Result<CallbackBinding> {
        let url = url::Url::parse(&self.oauth.redirect_uri).with_context(|| {
            format!("oauth.redirect_uri is not a valid URL: {}", self.oauth.redirect_uri)
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("oauth.redirect_uri must use http or https, got {}", url.scheme());
        }
        let Some(url_host) = url.host_str() else {
            anyhow::bail!("oauth.redirect_uri has no host: {}", self.oauth.redirect_uri);
        };
        let port = url
            .port_or_known_default()
            .context("oauth.redirect_uri has no port")?;

        // Loopback redirects bind where they point; public ones listen on all interfaces
        let host = match &self.oauth.bind_address {
            Some(addr) => addr.clone(),
            None if url_host == "localhost" || url_host.starts_with("127.") => {
                url_host.to_string()
            }
            None => "0.0.0.0".to_string(),
        };

        Ok(CallbackBinding {
            host,
            port,
            path: url.path().to_string(),
        })
    }

    pub fn storage_path(&self) -> PathBuf {
        paths::room_store_file(&self.storage.path)
    }
}
