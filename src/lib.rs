// ABOUTME: Root library module exposing the Webex-facing parts of boardbot
// ABOUTME: Event-stream session, OAuth callback server, bot handler and Webex REST clients

pub mod bot;
pub mod callback;
pub mod platform;
pub mod session;

// Re-export platform-agnostic modules from boardbot-core
pub use boardbot_core::config;
pub use boardbot_core::metrics;
pub use boardbot_core::paths;

pub use bot::BotHandler;
pub use session::{ConnectionSession, SessionError, SessionSettings};
