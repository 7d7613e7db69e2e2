// ABOUTME: HTTP server receiving the OAuth redirect and the Prometheus scrape
// ABOUTME: Correlates `state` with the pending room, exchanges the code and hands tokens to the vault

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use boardbot_core::config::CallbackBinding;
use boardbot_core::{metrics, CredentialVault, LinkOutcome};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
struct CallbackState {
    vault: Arc<CredentialVault>,
}

/// Query parameters of the OAuth redirect
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Minimal escaping for values echoed into the HTML pages
pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn page(status: StatusCode, body: String) -> (StatusCode, Html<String>) {
    (status, Html(body))
}

/// Build the callback router. `/metrics` is served when a Prometheus handle is given.
pub fn router(
    vault: Arc<CredentialVault>,
    callback_path: &str,
    metrics_handle: Option<PrometheusHandle>,
) -> Router {
    let callback_routes = Router::new()
        .route(callback_path, get(oauth_callback))
        .with_state(CallbackState { vault });

    let app = match metrics_handle {
        Some(handle) => {
            let metrics_routes = Router::new()
                .route("/metrics", get(metrics_handler))
                .with_state(Arc::new(handle));
            callback_routes.merge(metrics_routes)
        }
        None => callback_routes,
    };

    app.layer(TraceLayer::new_for_http())
}

/// Serve `app` on the callback binding until `shutdown` fires
pub async fn serve(binding: &CallbackBinding, app: Router, shutdown: CancellationToken) -> Result<()> {
    let addr = binding.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind OAuth callback server on {addr}"))?;
    tracing::info!(addr = %addr, path = %binding.path, "OAuth callback server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("OAuth callback server failed")?;

    tracing::info!("OAuth callback server stopped");
    Ok(())
}

/// Handle GET on the redirect path
async fn oauth_callback(
    State(state): State<CallbackState>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, Html<String>) {
    if let Some(error) = present(&params.error) {
        let description = present(&params.error_description).unwrap_or("No description");
        tracing::warn!(error = %error, description = %description, "OAuth provider returned an error");
        metrics::record_oauth_callback("provider_error");
        return page(
            StatusCode::BAD_REQUEST,
            format!(
                "<h1>Authorization Failed</h1><p>Error: {}</p><p>{}</p>",
                escape_html(error),
                escape_html(description)
            ),
        );
    }

    let (Some(code), Some(state_token)) = (present(&params.code), present(&params.state)) else {
        tracing::warn!("OAuth callback without code or state");
        metrics::record_oauth_callback("missing_params");
        return page(
            StatusCode::BAD_REQUEST,
            "<h1>Missing Parameters</h1><p>Authorization code or state missing.</p>".to_string(),
        );
    };

    let vault = &state.vault;
    let Some(room_id) = vault.pending().consume(state_token).await else {
        tracing::warn!("OAuth callback with unknown or expired state");
        metrics::record_oauth_callback("invalid_state");
        return page(
            StatusCode::BAD_REQUEST,
            "<h1>Invalid or Expired State</h1><p>Please try the authorization again.</p>".to_string(),
        );
    };

    let grant = match vault.endpoint().exchange_code(code).await {
        Ok(grant) => grant,
        Err(e) => {
            tracing::error!(room_id = %room_id, error = %e, "Authorization code exchange failed");
            metrics::record_oauth_callback("exchange_failed");
            return page(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("<h1>Authorization Failed</h1><p>{}</p>", escape_html(&e.to_string())),
            );
        }
    };

    let expires_at = grant.expires_at(Utc::now());
    let outcome = vault
        .store_tokens(
            &room_id,
            state_token,
            grant.access_token,
            grant.refresh_token,
            expires_at,
        )
        .await;

    match outcome {
        Ok(LinkOutcome::Linked { org_id, .. }) => {
            tracing::info!(room_id = %room_id, org_id = %org_id, "Room authorized");
            metrics::record_oauth_callback("linked");
            page(
                StatusCode::OK,
                "<h1>Authorization Successful!</h1><p>You can close this window and return to Webex.</p>\
                 <script>window.close();</script>"
                    .to_string(),
            )
        }
        Ok(LinkOutcome::NotAdmin) => {
            metrics::record_oauth_callback("not_admin");
            page(
                StatusCode::FORBIDDEN,
                "<h1>Authorization Failed</h1><p>This account cannot administer its organization. \
                 Check the Webex space for a new authorization link.</p>"
                    .to_string(),
            )
        }
        Err(e) => {
            tracing::error!(room_id = %room_id, error = %e, "Failed to store tokens");
            metrics::record_oauth_callback("store_failed");
            page(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("<h1>Authorization Failed</h1><p>{}</p>", escape_html(&e.to_string())),
            )
        }
    }
}

/// Handle GET /metrics - returns Prometheus text format
async fn metrics_handler(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
