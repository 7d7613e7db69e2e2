// ABOUTME: Platform-agnostic core of the board provisioning bot
// ABOUTME: Room authorization, OAuth credential vault, pending handshakes and event dispatch

pub mod authority;
pub mod backoff;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod ids;
pub mod metrics;
pub mod paths;
pub mod pending;
pub mod rooms;
pub mod testing;
pub mod traits;
pub mod vault;

pub use authority::{JoinedRoom, RoomAuthority};
pub use backoff::{BackoffConfig, ReconnectBackoff};
pub use commands::Command;
pub use config::Config;
pub use dispatcher::{EventDispatcher, EventDispatcherBuilder, EventHandler};
pub use events::{ClassifiedActivity, StreamEvent, Verb, CONVERSATION_ACTIVITY};
pub use ids::{AttachmentActionId, MessageId, PersonId, RoomId};
pub use pending::PendingAuthRegistry;
pub use rooms::{Room, RoomStore, StoreError};

// Re-export collaborator traits for convenient access
pub use traits::{
    // Collaborators
    Directory, Messenger, OrgAdmin, TokenEndpoint,
    // Data Types
    CardSubmission, InboundMessage, MessageContent, OrgInspection, RoomDetails, TokenError,
    TokenGrant, Workspace,
};
pub use vault::{CredentialVault, LinkOutcome, VaultError};
