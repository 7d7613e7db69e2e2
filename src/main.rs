// ABOUTME: Main entry point for the board provisioning bot
// ABOUTME: Wires logging, config, Webex clients, the event-stream session and the OAuth callback server

use anyhow::{Context, Result};
use boardbot::bot::{BotHandler, TraceHandler};
use boardbot::callback;
use boardbot::platform::webex::{WdmDeviceRegistry, WebexAdmin, WebexClient, WebexTokenEndpoint};
use boardbot::session::{ConnectionSession, SessionError, SessionSettings};
use boardbot_core::{
    config::Config, metrics, paths, CredentialVault, EventDispatcher, PendingAuthRegistry,
    RoomAuthority, RoomStore, CONVERSATION_ACTIVITY,
};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often expired authorization handshakes are swept
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "boardbot")]
#[command(about = "Webex bot that hands out board activation codes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Emit JSON logs on stdout
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to Webex and serve events (default)
    Run,
    /// Load and validate configuration, then print it with secrets redacted
    CheckConfig,
}

fn init_logging(json_logs: bool) -> Result<WorkerGuard> {
    let log_dir = paths::log_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "boardbot.log"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.json_logs)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            let config = Config::load()?;
            let binding = config.callback_binding()?;
            println!("{config:#?}");
            println!("OAuth callback: {}{}", binding.addr(), binding.path);
            Ok(())
        }
        Commands::Run => run(Config::load()?).await,
    }
}

async fn run(config: Config) -> Result<()> {
    tracing::info!(
        device_name = %config.webex.device_name,
        storage = %config.storage.path,
        redirect_uri = %config.oauth.redirect_uri,
        max_concurrent_events = config.dispatch.max_concurrent_events,
        "Configuration loaded"
    );

    let metrics_handle = metrics::init_metrics()?;
    let store = Arc::new(
        RoomStore::load(config.storage_path())
            .await
            .context("Failed to load room store")?,
    );

    let client = Arc::new(WebexClient::new(
        &config.webex.api_base,
        &config.webex.bot_token,
    )?);
    let identity = client.me().await.context("Failed to identify the bot")?;
    tracing::info!(bot = %identity.display_name, email = ?identity.email, "Bot identified");

    let org_admin = Arc::new(WebexAdmin::new(&config.webex.api_base)?);
    let endpoint = Arc::new(WebexTokenEndpoint::new(&config.oauth)?);
    let pending = Arc::new(PendingAuthRegistry::new());

    let authority = Arc::new(RoomAuthority::new(
        Arc::clone(&store),
        client.clone(),
        client.clone(),
    ));
    let vault = Arc::new(
        CredentialVault::new(
            Arc::clone(&store),
            endpoint,
            org_admin.clone(),
            client.clone(),
            pending,
        )
        .with_bot_name(identity.display_name.clone()),
    );

    if let Err(e) = authority.reconcile_joined_rooms().await {
        tracing::warn!(error = %e, "Could not reconcile joined rooms");
    }

    let handler = BotHandler::new(
        identity,
        Arc::clone(&authority),
        Arc::clone(&vault),
        client.clone(),
        org_admin,
    )
    .with_support_contact(config.bot.support_contact.clone());
    let dispatcher = EventDispatcher::builder()
        .on(CONVERSATION_ACTIVITY, Arc::new(handler))
        .on_any(Arc::new(TraceHandler))
        .max_concurrent_events(config.dispatch.max_concurrent_events)
        .build();

    let shutdown = CancellationToken::new();
    let registry = Arc::new(WdmDeviceRegistry::new(
        &config.webex.devices_url,
        &config.webex.device_name,
        &config.webex.bot_token,
    )?);
    let session = Arc::new(ConnectionSession::new(
        registry,
        dispatcher,
        config.webex.bot_token.clone(),
        SessionSettings::from(&config.session),
        shutdown.child_token(),
    ));

    let binding = config.callback_binding()?;
    let app = callback::router(Arc::clone(&vault), &binding.path, Some(metrics_handle));
    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let result = callback::serve(&binding, app, shutdown.clone()).await;
            if let Err(e) = &result {
                tracing::error!(error = %format!("{e:#}"), "Callback server exited");
                shutdown.cancel();
            }
            result
        }
    });

    let housekeeping = tokio::spawn(purge_expired_handshakes(
        Arc::clone(&vault),
        shutdown.clone(),
    ));

    tokio::spawn({
        let session = Arc::clone(&session);
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received");
            session.stop();
            shutdown.cancel();
        }
    });

    // Returns once stopped or on a fatal stream error
    let session_result = session.start().await;
    shutdown.cancel();

    let server_result = server.await.context("Callback server task panicked")?;
    if let Err(e) = housekeeping.await {
        tracing::warn!(error = %e, "Housekeeping task ended abnormally");
    }

    store.save().await.context("Failed to flush room store")?;
    tracing::info!(rooms = store.len().await, "Room store flushed, exiting");

    server_result?;
    match session_result {
        Ok(()) | Err(SessionError::Stopped) => Ok(()),
        Err(e) => Err(e).context("Event stream session failed"),
    }
}

async fn purge_expired_handshakes(vault: Arc<CredentialVault>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(PURGE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let purged = vault.purge_expired().await;
                if purged > 0 {
                    tracing::info!(purged, "Expired authorization handshakes purged");
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
