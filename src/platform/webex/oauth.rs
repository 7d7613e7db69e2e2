// ABOUTME: OAuth 2.0 token endpoint for the Webex integration
// ABOUTME: Builds authorization URLs and exchanges codes or refresh tokens for access tokens

use anyhow::{Context, Result};
use async_trait::async_trait;
use boardbot_core::config::OAuthConfig;
use boardbot_core::{TokenEndpoint, TokenError, TokenGrant};
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use super::http_client;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Authorization-code and refresh-token grants against the Webex token URL
pub struct WebexTokenEndpoint {
    http: reqwest::Client,
    authorize_base: Url,
    token_url: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    scope: String,
}

impl std::fmt::Debug for WebexTokenEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebexTokenEndpoint")
            .field("authorize_base", &self.authorize_base.as_str())
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

impl WebexTokenEndpoint {
    pub fn new(config: &OAuthConfig) -> Result<Self> {
        let authorize_base = Url::parse(&config.authorize_url)
            .with_context(|| format!("Invalid OAuth authorize URL: {}", config.authorize_url))?;
        Ok(Self {
            http: http_client()?,
            authorize_base,
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            scope: config.scopes.join(" "),
        })
    }

    async fn grant(&self, form: &[(&str, &str)]) -> Result<TokenGrant, TokenError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| TokenError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // Server-side trouble is worth retrying later; other refusals are final
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                return Err(TokenError::Transport(format!("{status}: {body}")));
            }
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| TokenError::Transport(format!("malformed token response: {e}")))?;
        Ok(TokenGrant {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in: token.expires_in,
        })
    }
}

#[async_trait]
impl TokenEndpoint for WebexTokenEndpoint {
    fn authorize_url(&self, state: &str) -> String {
        let mut url = self.authorize_base.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("scope", &self.scope)
            .append_pair("state", state);
        url.into()
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, TokenError> {
        tracing::debug!("Exchanging authorization code");
        self.grant(&[
            ("grant_type", "authorization_code"),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("code", code),
            ("redirect_uri", &self.redirect_uri),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, TokenError> {
        tracing::debug!("Refreshing access token");
        self.grant(&[
            ("grant_type", "refresh_token"),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("refresh_token", refresh_token),
        ])
        .await
    }
}
