// ABOUTME: Per-room authorization: who may issue commands, admin bootstrap and the authorized-user set
// ABOUTME: All room mutations go through RoomStore::update so concurrent events never see partial writes

use anyhow::Result;
use std::sync::Arc;

use crate::ids::{PersonId, RoomId};
use crate::rooms::{Room, RoomAdmin, RoomStore};
use crate::traits::{Directory, MessageContent, Messenger};

pub const GREETING: &str =
    "Hello! I'm here to help you provision Webex Boards for your organization.";

pub fn admin_confirmation(email: &str) -> String {
    format!("User {email} is now the room admin.")
}

pub fn denial_notice(admin_email: &str) -> String {
    format!("You don't have rights in this room, please ask {admin_email} to grant you permissions.")
}

/// What the bot found when it was added to a room
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRoom {
    pub room: Room,
    pub is_direct: bool,
}

/// Decides which people may command the bot in each room
pub struct RoomAuthority {
    store: Arc<RoomStore>,
    directory: Arc<dyn Directory>,
    messenger: Arc<dyn Messenger>,
}

impl RoomAuthority {
    pub fn new(
        store: Arc<RoomStore>,
        directory: Arc<dyn Directory>,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        Self {
            store,
            directory,
            messenger,
        }
    }

    pub fn store(&self) -> &Arc<RoomStore> {
        &self.store
    }

    /// Return the room record, creating it from directory details when unknown.
    ///
    /// A new direct room gets its creator as admin without any message.
    pub async fn ensure_room(&self, room_id: &RoomId) -> Result<Room> {
        if let Some(room) = self.store.get(room_id).await {
            return Ok(room);
        }

        let mut room = Room::new(room_id, "");
        match self.directory.room(room_id).await {
            Ok(details) => {
                room.room_name = details.title;
                if details.is_direct {
                    if let Some(creator) = details.creator_id {
                        let email = self.lookup_person_email(&creator).await;
                        room.room_admin = RoomAdmin {
                            email,
                            id: Some(creator.as_str().to_string()),
                        };
                    }
                }
            }
            Err(e) => {
                tracing::warn!(room_id = %room_id, error = %e, "Room details unavailable, creating bare record");
            }
        }

        let (room, created) = self.store.insert_if_absent(room).await;
        if created {
            tracing::info!(room_id = %room_id, room_name = %room.room_name, "Room registered");
            self.store.persist().await;
        }
        Ok(room)
    }

    /// Whether `actor` may command the bot in `room_id`.
    ///
    /// With no admin ever set, the first caller becomes admin. Refusals post a
    /// notice naming the admin.
    pub async fn is_authorized(&self, room_id: &RoomId, actor: &PersonId) -> Result<bool> {
        let room = self.ensure_room(room_id).await?;

        if !room.room_admin.is_set() {
            let email = self.lookup_member_email(room_id, actor).await;
            let promoted = self
                .store
                .update(room_id, |room| {
                    if room.room_admin.is_set() {
                        return false;
                    }
                    room.room_admin = RoomAdmin {
                        email: email.clone(),
                        id: Some(actor.as_str().to_string()),
                    };
                    true
                })
                .await
                .unwrap_or(false);

            if promoted {
                tracing::info!(room_id = %room_id, actor = ?actor, "No room admin set, promoting first caller");
                self.store.persist().await;
                let shown = email.as_deref().unwrap_or(actor.as_str());
                self.notify(room_id, MessageContent::plain(admin_confirmation(shown)))
                    .await;
                return Ok(true);
            }
        }

        let Some(room) = self.store.get(room_id).await else {
            return Ok(false);
        };
        if room.permits(actor) {
            return Ok(true);
        }

        let admin_email = room
            .room_admin
            .email
            .clone()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| "the room admin".to_string());
        tracing::info!(room_id = %room_id, actor = ?actor, "Unauthorized command refused");
        self.notify(room_id, MessageContent::plain(denial_notice(&admin_email)))
            .await;
        Ok(false)
    }

    /// Make the member with `email` the room admin. False when they are not a member.
    pub async fn set_admin(&self, room_id: &RoomId, email: &str, quiet: bool) -> Result<bool> {
        let Some(person) = self.resolve_member(room_id, email).await? else {
            return Ok(false);
        };
        let updated = self
            .store
            .update(room_id, |room| room.room_admin = RoomAdmin::new(email, &person))
            .await
            .is_some();
        if !updated {
            tracing::warn!(room_id = %room_id, "Cannot set admin for unknown room");
            return Ok(false);
        }

        tracing::info!(room_id = %room_id, email = %email, "Room admin set");
        self.store.persist().await;
        if !quiet {
            self.notify(room_id, MessageContent::plain(admin_confirmation(email)))
                .await;
        }
        Ok(true)
    }

    /// Add a member to the authorized set. Adding someone twice is harmless.
    pub async fn add_authorized_user(&self, room_id: &RoomId, email: &str) -> Result<bool> {
        let Some(person) = self.resolve_member(room_id, email).await? else {
            return Ok(false);
        };
        let updated = self
            .store
            .update(room_id, |room| {
                room.room_authorized_users
                    .retain(|id| !person.matches(id));
                room.room_authorized_users
                    .insert(person.as_str().to_string());
            })
            .await
            .is_some();
        if updated {
            tracing::info!(room_id = %room_id, email = %email, "Authorized user added");
            self.store.persist().await;
        }
        Ok(updated)
    }

    /// Remove a member from the authorized set. False when they were not in it.
    pub async fn remove_authorized_user(&self, room_id: &RoomId, email: &str) -> Result<bool> {
        let Some(person) = self.resolve_member(room_id, email).await? else {
            return Ok(false);
        };
        let removed = self
            .store
            .update(room_id, |room| {
                let before = room.room_authorized_users.len();
                room.room_authorized_users
                    .retain(|id| !person.matches(id));
                room.room_authorized_users.len() < before
            })
            .await
            .unwrap_or(false);
        if removed {
            tracing::info!(room_id = %room_id, email = %email, "Authorized user removed");
            self.store.persist().await;
        }
        Ok(removed)
    }

    /// The bot was added to a room.
    ///
    /// Direct rooms get the creator as a quiet admin. Group rooms are greeted
    /// and the inviter becomes admin with a confirmation.
    pub async fn on_room_joined(
        &self,
        room_id: &RoomId,
        inviter: Option<&PersonId>,
    ) -> Result<JoinedRoom> {
        let details = self.directory.room(room_id).await?;

        let mut fresh = Room::new(room_id, details.title.clone());
        if details.is_direct {
            if let Some(creator) = &details.creator_id {
                fresh.room_admin = RoomAdmin {
                    email: self.lookup_person_email(creator).await,
                    id: Some(creator.as_str().to_string()),
                };
            }
        }
        let (room, created) = self.store.insert_if_absent(fresh).await;
        if created {
            tracing::info!(room_id = %room_id, room_name = %room.room_name, direct = details.is_direct, "Joined room");
            self.store.persist().await;
        }
        if details.is_direct {
            return Ok(JoinedRoom {
                room,
                is_direct: true,
            });
        }

        self.notify(room_id, MessageContent::plain(GREETING)).await;

        if let Some(inviter) = inviter {
            match self.lookup_member_email(room_id, inviter).await {
                Some(email) => {
                    self.set_admin(room_id, &email, false).await?;
                }
                None => {
                    tracing::warn!(room_id = %room_id, inviter = ?inviter, "Inviter email unknown, admin left unset");
                }
            }
        }

        Ok(JoinedRoom {
            room: self.store.get(room_id).await.unwrap_or(room),
            is_direct: false,
        })
    }

    /// The bot left or was removed: forget the room entirely
    pub async fn on_room_left(&self, room_id: &RoomId) -> Option<Room> {
        let removed = self.store.remove(room_id).await;
        if removed.is_some() {
            tracing::info!(room_id = %room_id, "Cleaned up state for room");
            self.store.persist().await;
        }
        removed
    }

    /// Make sure every room the bot belongs to has a record. Returns how many were checked.
    pub async fn reconcile_joined_rooms(&self) -> Result<usize> {
        let rooms = self.directory.joined_rooms().await?;
        for room_id in &rooms {
            if let Err(e) = self.ensure_room(room_id).await {
                tracing::warn!(room_id = %room_id, error = %e, "Failed to register joined room");
            }
        }
        tracing::info!(rooms = rooms.len(), "Joined rooms reconciled");
        Ok(rooms.len())
    }

    /// Emails of the authorized users, falling back to the stored id when a lookup fails
    pub async fn authorized_user_emails(&self, room_id: &RoomId) -> Vec<String> {
        let Some(room) = self.store.get(room_id).await else {
            return Vec::new();
        };
        let mut emails = Vec::with_capacity(room.room_authorized_users.len());
        for raw in &room.room_authorized_users {
            let email = match PersonId::parse_or_uuid(raw) {
                Ok(person) => self.lookup_member_email(room_id, &person).await,
                Err(_) => None,
            };
            emails.push(email.unwrap_or_else(|| raw.clone()));
        }
        emails
    }

    async fn resolve_member(&self, room_id: &RoomId, email: &str) -> Result<Option<PersonId>> {
        let person = self.directory.person_for_email(room_id, email).await?;
        if person.is_none() {
            tracing::info!(room_id = %room_id, email = %email, "User not found in room");
        }
        Ok(person)
    }

    async fn lookup_member_email(&self, room_id: &RoomId, person: &PersonId) -> Option<String> {
        match self.directory.email_for_person(room_id, person).await {
            Ok(email) => email,
            Err(e) => {
                tracing::warn!(room_id = %room_id, error = %e, "Membership lookup failed");
                None
            }
        }
    }

    async fn lookup_person_email(&self, person: &PersonId) -> Option<String> {
        match self.directory.person_email(person).await {
            Ok(email) => email,
            Err(e) => {
                tracing::warn!(person = ?person, error = %e, "Person lookup failed");
                None
            }
        }
    }

    async fn notify(&self, room_id: &RoomId, content: MessageContent) {
        if let Err(e) = self.messenger.send(room_id, content).await {
            tracing::warn!(room_id = %room_id, error = %e, "Failed to send room notice");
        }
    }
}
