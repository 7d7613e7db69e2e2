// ABOUTME: Conversation-activity handler that turns posts, card submissions and membership changes into bot actions
// ABOUTME: Gates every command through RoomAuthority and fetches org tokens from the CredentialVault

use anyhow::{Context, Result};
use async_trait::async_trait;
use boardbot_core::commands::first_name;
use boardbot_core::{
    metrics, ClassifiedActivity, Command, CredentialVault, EventHandler, MessageContent,
    Messenger, OrgAdmin, RoomAuthority, RoomId, StreamEvent, VaultError, Verb, Workspace,
};
use std::sync::Arc;

use crate::platform::webex::cards::{
    code_card, split_code, CARD_FALLBACK_TEXT, EXISTING_WORKSPACE_INPUT, WORKSPACE_INPUT,
};
use crate::platform::webex::BotIdentity;

pub const MISSING_WORKSPACE: &str =
    "Please provide a workspace name or select an existing workspace.";

pub const PROVISIONING_FAILED: &str = "Something went wrong. Please check if you need to update \
     the access token or if you've been sending too many requests.";

/// Help text listing the commands, optionally ending with a support address
pub fn help_text(support_contact: Option<&str>) -> String {
    let mut text = String::from(
        "To initialize the bot, please authorize using the link provided. If the bot is already \
         initialized, mention the bot to receive a card to fill out to get an activation code.\n\n\
         Other commands include:\n\
         - `add` [email]: add an authorized user to your organization; add several at once separated with a space\n\
         - `remove` [email]: remove an authorized user from your organization; remove several at once separated with a space\n\
         - `info`: get info about the organization linked to this room\n\
         - `reinit`: change organization and/or re-authorize for this room",
    );
    if let Some(contact) = support_contact.filter(|c| !c.trim().is_empty()) {
        text.push_str(&format!(
            "\n\nIf you require further assistance, please contact {contact}."
        ));
    }
    text
}

/// Handles `conversation.activity` events for the bot
pub struct BotHandler {
    identity: BotIdentity,
    authority: Arc<RoomAuthority>,
    vault: Arc<CredentialVault>,
    messenger: Arc<dyn Messenger>,
    org_admin: Arc<dyn OrgAdmin>,
    support_contact: Option<String>,
}

impl BotHandler {
    pub fn new(
        identity: BotIdentity,
        authority: Arc<RoomAuthority>,
        vault: Arc<CredentialVault>,
        messenger: Arc<dyn Messenger>,
        org_admin: Arc<dyn OrgAdmin>,
    ) -> Self {
        Self {
            identity,
            authority,
            vault,
            messenger,
            org_admin,
            support_contact: None,
        }
    }

    pub fn with_support_contact(mut self, contact: Option<String>) -> Self {
        self.support_contact = contact;
        self
    }

    fn is_bot(&self, raw_id: &str) -> bool {
        self.identity.id.matches(raw_id)
    }

    async fn reply(&self, room_id: &RoomId, content: MessageContent) -> Result<()> {
        self.messenger
            .send(room_id, content)
            .await
            .with_context(|| format!("Failed to reply in room {room_id}"))?;
        Ok(())
    }

    // =========================================================================
    // Activities
    // =========================================================================

    async fn on_post(&self, activity: &ClassifiedActivity) -> Result<()> {
        if self.is_bot(&activity.actor.id) {
            return Ok(());
        }
        let message = self
            .messenger
            .fetch_message(&activity.message_id())
            .await
            .context("Failed to fetch posted message")?;
        // The stream can report our own posts under a different actor shape
        if message.person_id == self.identity.id {
            return Ok(());
        }

        if !self
            .authority
            .is_authorized(&message.room_id, &message.person_id)
            .await?
        {
            return Ok(());
        }

        let Some(text) = message.text.as_deref() else {
            return Ok(());
        };
        let Some(command) = Command::parse(text, first_name(&self.identity.display_name)) else {
            return Ok(());
        };
        self.run_command(&message.room_id, command).await
    }

    async fn on_card_action(&self, activity: &ClassifiedActivity) -> Result<()> {
        let (Some(room_id), Some(actor)) = (activity.room_id(), activity.actor_id()) else {
            tracing::debug!(activity_id = %activity.id, "Card action without room or actor");
            return Ok(());
        };
        if self.is_bot(&activity.actor.id) {
            return Ok(());
        }
        if !self.authority.is_authorized(&room_id, &actor).await? {
            return Ok(());
        }
        if !self.vault.ensure_linked(&room_id).await? {
            return Ok(());
        }

        let submission = self
            .messenger
            .fetch_card_action(&activity.attachment_action_id())
            .await
            .context("Failed to fetch card submission")?;
        let new_name = submission.input(WORKSPACE_INPUT);
        let existing_id = submission.input(EXISTING_WORKSPACE_INPUT);
        if new_name.is_empty() && existing_id.is_empty() {
            return self
                .reply(&room_id, MessageContent::plain(MISSING_WORKSPACE))
                .await;
        }

        let Some((token, org_id)) = self.org_token(&room_id).await? else {
            return Ok(());
        };
        match self.provision(&token, &org_id, new_name, existing_id).await {
            Ok((workspace, code)) => {
                tracing::info!(room_id = %room_id, workspace_id = %workspace.id, "Sending activation code");
                self.reply(
                    &room_id,
                    MessageContent::markdown(format!(
                        "Here's your activation code: {} for workspace *{}*",
                        split_code(&code),
                        workspace.display_name
                    )),
                )
                .await
            }
            Err(e) => {
                tracing::error!(room_id = %room_id, error = %format!("{e:#}"), "Provisioning failed");
                metrics::record_error("provisioning");
                self.reply(&room_id, MessageContent::plain(PROVISIONING_FAILED))
                    .await
            }
        }
    }

    async fn on_member_added(&self, activity: &ClassifiedActivity) -> Result<()> {
        let Some(room_id) = activity.room_id() else {
            return Ok(());
        };
        if !activity.object.as_deref().is_some_and(|o| self.is_bot(o)) {
            return Ok(());
        }

        tracing::info!(room_id = %room_id, "Bot was added to room");
        let inviter = activity.actor_id();
        let joined = self
            .authority
            .on_room_joined(&room_id, inviter.as_ref())
            .await?;
        if !joined.is_direct {
            self.vault.ensure_linked(&room_id).await?;
        }
        Ok(())
    }

    async fn on_member_left(&self, activity: &ClassifiedActivity) -> Result<()> {
        let Some(room_id) = activity.room_id() else {
            return Ok(());
        };
        if !activity.object.as_deref().is_some_and(|o| self.is_bot(o)) {
            return Ok(());
        }

        tracing::info!(room_id = %room_id, "Bot was removed from room");
        self.authority.on_room_left(&room_id).await;
        self.vault.forget_room(&room_id).await;
        Ok(())
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn run_command(&self, room_id: &RoomId, command: Command) -> Result<()> {
        tracing::info!(room_id = %room_id, command = command.name(), "Running command");
        metrics::record_command(command.name());

        match command {
            Command::Reinit => {
                self.vault.unlink(room_id).await?;
                self.vault.request_authorization(room_id).await?;
                Ok(())
            }
            Command::Add(emails) => {
                if emails.is_empty() {
                    return self
                        .reply(room_id, MessageContent::plain("Usage: add <email> [email ...]"))
                        .await;
                }
                for email in emails {
                    let added = self
                        .authority
                        .add_authorized_user(room_id, &email)
                        .await
                        .unwrap_or_else(|e| {
                            tracing::warn!(room_id = %room_id, error = %e, "Adding user failed");
                            false
                        });
                    let text = if added {
                        format!("User {email} added successfully.")
                    } else {
                        format!("Failed to add user {email}. Make sure they are in this room.")
                    };
                    self.reply(room_id, MessageContent::plain(text)).await?;
                }
                Ok(())
            }
            Command::Remove(emails) => {
                if emails.is_empty() {
                    return self
                        .reply(room_id, MessageContent::plain("Usage: remove <email> [email ...]"))
                        .await;
                }
                for email in emails {
                    let removed = self
                        .authority
                        .remove_authorized_user(room_id, &email)
                        .await
                        .unwrap_or_else(|e| {
                            tracing::warn!(room_id = %room_id, error = %e, "Removing user failed");
                            false
                        });
                    let text = if removed {
                        format!("User {email} removed successfully.")
                    } else {
                        format!(
                            "Failed to remove user {email}. Make sure they are in the allowed users list."
                        )
                    };
                    self.reply(room_id, MessageContent::plain(text)).await?;
                }
                Ok(())
            }
            Command::Help => {
                self.reply(
                    room_id,
                    MessageContent::markdown(help_text(self.support_contact.as_deref())),
                )
                .await
            }
            Command::Info => self.send_info(room_id).await,
            Command::Provision => self.send_code_card(room_id).await,
        }
    }

    async fn send_info(&self, room_id: &RoomId) -> Result<()> {
        let Some(room) = self.authority.store().get(room_id).await else {
            tracing::warn!(room_id = %room_id, "Info requested for unknown room");
            return Ok(());
        };
        let or_na = |value: &str| {
            if value.is_empty() {
                "N/A".to_string()
            } else {
                value.to_string()
            }
        };
        let users = self.authority.authorized_user_emails(room_id).await;
        let users = if users.is_empty() {
            "N/A".to_string()
        } else {
            users.join(", ")
        };
        let text = format!(
            "**This room is linked to the following organization:**\n\
             - Organization Name: {}\n\
             - Organization ID: {}\n\n\
             {} will only respond to authorized users in this room:\n\
             - Owner: {}\n\
             - Authorized Users: {}",
            or_na(&room.managed_org.org_name),
            or_na(&room.managed_org.org_id),
            self.identity.display_name,
            or_na(room.room_admin.email.as_deref().unwrap_or("")),
            users
        );
        self.reply(room_id, MessageContent::markdown(text)).await
    }

    async fn send_code_card(&self, room_id: &RoomId) -> Result<()> {
        if !self.vault.ensure_linked(room_id).await? {
            return Ok(());
        }
        let Some((token, org_id)) = self.org_token(room_id).await? else {
            return Ok(());
        };
        let workspaces = match self.org_admin.list_workspaces(&token, &org_id).await {
            Ok(workspaces) => workspaces,
            Err(e) => {
                tracing::warn!(room_id = %room_id, error = %e, "Could not list workspaces for card");
                Vec::new()
            }
        };
        self.reply(
            room_id,
            MessageContent::Card {
                text: CARD_FALLBACK_TEXT.to_string(),
                card: code_card(&workspaces),
            },
        )
        .await
    }

    /// Valid access token and org id for the room.
    ///
    /// None when the room had to be sent back through authorization or the
    /// token endpoint is unreachable; the room has been told either way.
    async fn org_token(&self, room_id: &RoomId) -> Result<Option<(String, String)>> {
        match self.vault.get_valid_token(room_id).await {
            Ok(token) => {
                let org_id = self
                    .authority
                    .store()
                    .get(room_id)
                    .await
                    .map(|room| room.managed_org.org_id)
                    .unwrap_or_default();
                Ok(Some((token, org_id)))
            }
            Err(VaultError::ReauthorizationRequired(_)) => {
                self.vault.request_authorization(room_id).await?;
                Ok(None)
            }
            Err(VaultError::Refresh(e)) => {
                tracing::warn!(room_id = %room_id, error = %e, "Token refresh unavailable");
                self.reply(room_id, MessageContent::plain(PROVISIONING_FAILED))
                    .await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn provision(
        &self,
        token: &str,
        org_id: &str,
        new_name: &str,
        existing_id: &str,
    ) -> Result<(Workspace, String)> {
        let workspace = if !new_name.is_empty() {
            self.org_admin
                .ensure_workspace(token, org_id, new_name)
                .await?
        } else {
            self.org_admin
                .list_workspaces(token, org_id)
                .await?
                .into_iter()
                .find(|w| w.id == existing_id)
                .with_context(|| format!("Workspace {existing_id} no longer exists"))?
        };
        let code = self
            .org_admin
            .activation_code(token, org_id, &workspace.id)
            .await?;
        Ok((workspace, code))
    }
}

#[async_trait]
impl EventHandler for BotHandler {
    fn name(&self) -> &'static str {
        "bot"
    }

    async fn handle(&self, event: &StreamEvent) -> Result<()> {
        let Some(activity) = &event.activity else {
            return Ok(());
        };
        match activity.verb {
            Verb::Post => self.on_post(activity).await,
            Verb::CardAction => self.on_card_action(activity).await,
            Verb::Add => self.on_member_added(activity).await,
            Verb::Leave => self.on_member_left(activity).await,
        }
    }
}

/// Logs every event at trace level; registered last as the catch-all
pub struct TraceHandler;

#[async_trait]
impl EventHandler for TraceHandler {
    fn name(&self) -> &'static str {
        "trace"
    }

    async fn handle(&self, event: &StreamEvent) -> Result<()> {
        tracing::trace!(
            event_type = %event.event_type,
            verb = ?event.verb(),
            raw_verb = ?event.raw_verb,
            "Stream event"
        );
        Ok(())
    }
}
