// ABOUTME: Event-stream websocket session: connect, authorize, read frames and reconnect with backoff
// ABOUTME: Keeps at most one live socket and stops for good when the stream rejects the bot token

use boardbot_core::backoff::{BackoffConfig, ReconnectBackoff};
use boardbot_core::config::SessionConfig;
use boardbot_core::metrics;
use boardbot_core::EventDispatcher;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::platform::webex::DeviceRegistry;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is already running")]
    AlreadyRunning,
    #[error("session was stopped and cannot be restarted")]
    Stopped,
    #[error("could not obtain the event stream descriptor: {0:#}")]
    Descriptor(#[source] anyhow::Error),
    #[error("event stream descriptor has no websocket URL")]
    MissingUrl,
    #[error("event stream rejected the bot credentials (close code {code}: {reason})")]
    AuthenticationFailed { code: u16, reason: String },
}

/// Timing knobs for one session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub backoff: BackoffConfig,
    pub ping_interval: Duration,
    /// Silence longer than this drops the connection
    pub idle_timeout: Duration,
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            backoff: config.backoff(),
            ping_interval: config.ping_interval(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

/// How one connection ended when it was not an authentication failure
#[derive(Debug, PartialEq, Eq)]
enum Disconnect {
    Stopped,
    Dropped,
}

enum ConnectError {
    Transport(String),
    Rejected { code: u16, reason: String },
}

/// Owns the event-stream socket lifecycle and feeds frames to the dispatcher
pub struct ConnectionSession {
    registry: Arc<dyn DeviceRegistry>,
    dispatcher: Arc<EventDispatcher>,
    bot_token: String,
    settings: SessionSettings,
    running: AtomicBool,
    cancel: CancellationToken,
}

impl ConnectionSession {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        dispatcher: Arc<EventDispatcher>,
        bot_token: impl Into<String>,
        settings: SessionSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            bot_token: bot_token.into(),
            settings,
            running: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the read loop and any pending reconnect wait. Safe to call repeatedly.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!("Stopping event stream session");
        }
        self.cancel.cancel();
    }

    /// Run until stopped or until the stream rejects the bot token.
    ///
    /// Returns `Ok(())` after `stop()`. Descriptor problems fail immediately;
    /// dropped connections are retried with exponential backoff, without limit.
    pub async fn start(&self) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Stopped);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyRunning);
        }

        let result = self.run().await;
        self.running.store(false, Ordering::SeqCst);
        metrics::set_session_connected(false);
        result
    }

    async fn run(&self) -> Result<(), SessionError> {
        let descriptor = self
            .registry
            .descriptor()
            .await
            .map_err(SessionError::Descriptor)?;
        if descriptor.websocket_url.trim().is_empty() {
            return Err(SessionError::MissingUrl);
        }
        let url = descriptor.websocket_url;
        let mut backoff = ReconnectBackoff::new(self.settings.backoff.clone());

        while self.is_running() && !self.cancel.is_cancelled() {
            let preview: String = url.chars().take(50).collect();
            tracing::info!(url = %preview, "Connecting to event stream");

            match self.connect_once(&url, &mut backoff).await {
                Ok(Disconnect::Stopped) => break,
                Ok(Disconnect::Dropped) => {
                    tracing::warn!("Event stream connection closed");
                }
                Err(ConnectError::Rejected { code, reason }) => {
                    tracing::error!(code, reason = %reason, "Event stream rejected authorization, not retrying");
                    metrics::record_error("stream_auth");
                    return Err(SessionError::AuthenticationFailed { code, reason });
                }
                Err(ConnectError::Transport(e)) => {
                    tracing::warn!(error = %e, "Event stream connection failed");
                    metrics::record_error("stream_transport");
                }
            }
            metrics::set_session_connected(false);

            if !self.is_running() {
                break;
            }
            let delay = backoff.next_delay();
            tracing::info!(
                delay_secs = delay.as_secs_f64(),
                attempt = backoff.attempts(),
                "Reconnecting after delay"
            );
            metrics::record_reconnect();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Ok(())
    }

    async fn connect_once(
        &self,
        url: &str,
        backoff: &mut ReconnectBackoff,
    ) -> Result<Disconnect, ConnectError> {
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(Disconnect::Stopped),
            connected = tokio_tungstenite::connect_async(url) => connected,
        };
        let (socket, _) = connected.map_err(|e| ConnectError::Transport(e.to_string()))?;
        let (mut write, mut read) = socket.split();

        let handshake = serde_json::json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "type": "authorization",
            "data": { "token": format!("Bearer {}", self.bot_token) },
        });
        write
            .send(Message::Text(handshake.to_string().into()))
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))?;

        backoff.reset_on_connect();
        metrics::set_session_connected(true);
        tracing::info!("Listening for events");

        let period = self.settings.ping_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        let mut last_heard = Instant::now();
        // Messages of any kind seen on this socket
        let mut received: u64 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(Disconnect::Stopped);
                }
                _ = keepalive.tick() => {
                    if last_heard.elapsed() > self.settings.idle_timeout {
                        tracing::warn!(
                            silent_secs = last_heard.elapsed().as_secs(),
                            "Event stream went silent, dropping connection"
                        );
                        return Ok(Disconnect::Dropped);
                    }
                    if let Err(e) = write.send(Message::Ping(Default::default())).await {
                        tracing::debug!(error = %e, "Keepalive ping failed");
                        return Ok(Disconnect::Dropped);
                    }
                }
                next = read.next() => {
                    let message = match next {
                        Some(Ok(message)) => message,
                        None if received == 0 => return Err(abnormal_closure("stream ended")),
                        Some(Err(e)) if received == 0 && is_abnormal_closure(&e) => {
                            return Err(abnormal_closure(&e.to_string()));
                        }
                        None => return Ok(Disconnect::Dropped),
                        Some(Err(e)) => {
                            tracing::debug!(error = %e, "Event stream read failed");
                            return Ok(Disconnect::Dropped);
                        }
                    };
                    last_heard = Instant::now();
                    let first = received == 0;
                    received += 1;

                    let text = match &message {
                        Message::Text(text) => Some(text.as_str()),
                        Message::Binary(bytes) => std::str::from_utf8(bytes).ok(),
                        Message::Close(frame) => {
                            let (code, reason) = frame
                                .as_ref()
                                .map(|f| (Some(u16::from(f.code)), f.reason.as_str().to_string()))
                                .unwrap_or((None, String::new()));
                            return match code {
                                Some(code) if first && is_rejection(code) => {
                                    Err(ConnectError::Rejected { code, reason })
                                }
                                _ => {
                                    tracing::info!(code = ?code, reason = %reason, "Event stream closed by server");
                                    Ok(Disconnect::Dropped)
                                }
                            };
                        }
                        _ => None,
                    };

                    if let Some(text) = text {
                        if !self.is_running() {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(Disconnect::Stopped);
                        }
                        self.dispatcher.submit(text);
                    }
                }
            }
        }
    }
}

/// A close right after the handshake with anything but a normal code means the token was refused
fn is_rejection(code: u16) -> bool {
    !matches!(CloseCode::from(code), CloseCode::Normal | CloseCode::Away)
}

/// The peer went away without a closing handshake
fn is_abnormal_closure(error: &WsError) -> bool {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        WsError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::BrokenPipe
        ),
        _ => false,
    }
}

fn abnormal_closure(detail: &str) -> ConnectError {
    ConnectError::Rejected {
        code: u16::from(CloseCode::Abnormal),
        reason: format!("abnormal closure before any event: {detail}"),
    }
}
