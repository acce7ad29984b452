//! Authoritative in-memory room/session state.
//!
//! The store is the single shared mutable resource of the engine. It is only
//! mutated through the operations below (ingress pipeline, hand-off handler
//! and explicit user actions); every operation is idempotent and bumps a
//! revision counter the persistence writer observes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    resolver,
    types::{ChatKind, ChatMode, ChatSession, Message, Room, SupportSession},
};

/// Serializable snapshot of the durable portion of the store.
///
/// Per-kind [`ChatSession`] descriptors are deliberately absent: sessions are
/// rebuilt from user actions and server responses, not from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreSnapshot {
    pub rooms: Vec<Room>,
    pub messages: HashMap<String, Vec<Message>>,
    pub active_room_id: Option<String>,
    pub support_session: Option<SupportSession>,
}

/// In-memory table of rooms, message sequences and session descriptors.
#[derive(Debug, Default)]
pub struct RoomStore {
    rooms: HashMap<String, Room>,
    messages: HashMap<String, Vec<Message>>,
    active_room_id: Option<String>,
    support_session: Option<SupportSession>,
    sessions: HashMap<ChatKind, ChatSession>,
    revision: u64,
}

impl RoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic counter bumped by every observable mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn rooms(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    pub fn messages_in(&self, room_id: &str) -> &[Message] {
        self.messages.get(room_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn message_count(&self, room_id: &str) -> usize {
        self.messages.get(room_id).map(Vec::len).unwrap_or(0)
    }

    pub fn active_room_id(&self) -> Option<&str> {
        self.active_room_id.as_deref()
    }

    pub fn support_session(&self) -> Option<&SupportSession> {
        self.support_session.as_ref()
    }

    pub fn session(&self, kind: ChatKind) -> Option<&ChatSession> {
        self.sessions.get(&kind)
    }

    /// Lazily create a room shell for the given id.
    pub fn ensure_room(&mut self, room_id: &str, kind: ChatKind, now_ms: u64) {
        if !self.rooms.contains_key(room_id) {
            debug!(%room_id, ?kind, "creating room on first reference");
            self.rooms
                .insert(room_id.to_owned(), Room::new(room_id, kind, now_ms));
            self.mark_mutated();
        }
    }

    /// Idempotent upsert: merges onto an existing room without blanking
    /// fields the incoming payload does not carry.
    pub fn upsert_room(&mut self, incoming: Room) {
        let merged = match self.rooms.get(&incoming.id) {
            Some(existing) => {
                let mut merged = existing.clone();
                merged.participants.extend(incoming.participants);
                if incoming.last_message.is_some() {
                    merged.last_message = incoming.last_message;
                }
                if incoming.order_id.is_some() {
                    merged.order_id = incoming.order_id;
                }
                merged.kind = incoming.kind;
                merged.created_at_ms = merged.created_at_ms.min(incoming.created_at_ms);
                merged.updated_at_ms = merged.updated_at_ms.max(incoming.updated_at_ms);
                merged
            }
            None => incoming,
        };

        if self.rooms.get(&merged.id) != Some(&merged) {
            self.rooms.insert(merged.id.clone(), merged);
            self.mark_mutated();
        }
    }

    /// Admit a message to its room sequence.
    ///
    /// Duplicate `message_id`s within the room are a no-op. The sequence
    /// stays ordered by non-decreasing timestamp; equal timestamps preserve
    /// admission order. Returns whether the message was admitted.
    pub fn add_message(&mut self, message: Message, count_unread: bool) -> bool {
        let sequence = self.messages.entry(message.room_id.clone()).or_default();
        if sequence
            .iter()
            .any(|existing| existing.message_id == message.message_id)
        {
            return false;
        }

        let position =
            sequence.partition_point(|existing| existing.timestamp_ms <= message.timestamp_ms);
        sequence.insert(position, message.clone());

        let is_active = self.active_room_id.as_deref() == Some(message.room_id.as_str());
        if let Some(room) = self.rooms.get_mut(&message.room_id) {
            room.updated_at_ms = room.updated_at_ms.max(message.timestamp_ms);
            if room
                .last_message
                .as_ref()
                .is_none_or(|last| last.timestamp_ms <= message.timestamp_ms)
            {
                room.last_message = Some(message.clone());
            }
            if count_unread && !is_active {
                room.unread_count = room.unread_count.saturating_add(1);
            }
        }

        if let Some(session) = self.sessions.values_mut().find(|s| s.room_id == message.room_id) {
            session.last_message_at_ms = Some(
                session
                    .last_message_at_ms
                    .unwrap_or(0)
                    .max(message.timestamp_ms),
            );
        }

        self.mark_mutated();
        true
    }

    /// Full sequence replace, used when a history response arrives.
    pub fn replace_messages(&mut self, room_id: &str, mut messages: Vec<Message>) {
        messages.sort_by_key(|message| message.timestamp_ms);
        for message in &mut messages {
            message.room_id = room_id.to_owned();
        }

        if self.messages.get(room_id).map(Vec::as_slice) == Some(messages.as_slice()) {
            return;
        }

        if let Some(room) = self.rooms.get_mut(room_id) {
            room.last_message = messages.last().cloned();
            if let Some(last) = messages.last() {
                room.updated_at_ms = room.updated_at_ms.max(last.timestamp_ms);
            }
        }
        self.messages.insert(room_id.to_owned(), messages);
        self.mark_mutated();
    }

    /// Move the active room pointer and reset that room's unread counter.
    pub fn set_active_room(&mut self, room_id: Option<String>) {
        if let Some(room_id) = &room_id
            && let Some(room) = self.rooms.get_mut(room_id)
            && room.unread_count != 0
        {
            room.unread_count = 0;
            self.mark_mutated();
        }

        if self.active_room_id != room_id {
            self.active_room_id = room_id;
            self.mark_mutated();
        }
    }

    /// Atomically migrate a pending placeholder room onto its real id.
    ///
    /// Buffered messages are remapped and prepended (they predate anything
    /// the real room may already hold), the placeholder entry is removed,
    /// and the active pointer / session bindings are retargeted.
    pub fn migrate_pending_room(&mut self, pending_id: &str, real_id: &str, now_ms: u64) {
        if pending_id == real_id || !resolver::is_pending(pending_id) {
            warn!(%pending_id, %real_id, "pending-room migration skipped");
            return;
        }

        let pending_room = self.rooms.remove(pending_id);
        let buffered = self.messages.remove(pending_id).unwrap_or_default();

        if let Some(pending_room) = pending_room {
            let mut shell = pending_room;
            shell.id = real_id.to_owned();
            shell.last_message = None;
            self.upsert_room(shell);
        } else if !self.rooms.contains_key(real_id) {
            let kind = self
                .sessions
                .values()
                .find(|s| s.room_id == pending_id)
                .map(|s| s.kind)
                .unwrap_or(ChatKind::Order);
            self.rooms
                .insert(real_id.to_owned(), Room::new(real_id, kind, now_ms));
        }

        for mut message in buffered {
            message.room_id = real_id.to_owned();
            self.add_message(message, false);
        }

        if self.active_room_id.as_deref() == Some(pending_id) {
            self.active_room_id = Some(real_id.to_owned());
        }
        for session in self.sessions.values_mut() {
            if session.room_id == pending_id {
                session.room_id = real_id.to_owned();
            }
        }
        self.mark_mutated();
    }

    /// Copy (not move) every message of `src_id` into `dst_id`, remapping
    /// the `room_id` of each copy. Returns the number of copies admitted.
    pub fn copy_history_into(&mut self, src_id: &str, dst_id: &str) -> usize {
        let source = self.messages.get(src_id).cloned().unwrap_or_default();
        let mut copied = 0;
        for mut message in source {
            message.room_id = dst_id.to_owned();
            if self.add_message(message, false) {
                copied += 1;
            }
        }
        copied
    }

    pub fn set_support_session(&mut self, session: SupportSession) {
        if self.support_session.as_ref() != Some(&session) {
            self.support_session = Some(session);
            self.mark_mutated();
        }
    }

    /// Flip the support session's mode (chatbot-to-agent hand-off).
    pub fn set_support_mode(&mut self, mode: ChatMode) {
        if let Some(session) = &mut self.support_session
            && session.chat_mode != mode
        {
            session.chat_mode = mode;
            self.mark_mutated();
        }
    }

    pub fn upsert_session(&mut self, session: ChatSession) {
        if self.sessions.get(&session.kind) != Some(&session) {
            self.sessions.insert(session.kind, session);
            self.mark_mutated();
        }
    }

    pub fn end_session(&mut self, kind: ChatKind) -> Option<ChatSession> {
        let ended = self.sessions.remove(&kind);
        if ended.is_some() {
            self.mark_mutated();
        }
        ended
    }

    /// Drop all state (logout).
    pub fn clear(&mut self) {
        self.rooms.clear();
        self.messages.clear();
        self.active_room_id = None;
        self.support_session = None;
        self.sessions.clear();
        self.mark_mutated();
    }

    /// Durable snapshot. Pending placeholder rooms are non-authoritative and
    /// excluded; their buffered messages stay memory-only until migrated.
    pub fn snapshot(&self) -> StoreSnapshot {
        let mut rooms: Vec<Room> = self
            .rooms
            .values()
            .filter(|room| !resolver::is_pending(&room.id))
            .cloned()
            .collect();
        rooms.sort_by(|a, b| a.id.cmp(&b.id));

        let messages = self
            .messages
            .iter()
            .filter(|(room_id, _)| !resolver::is_pending(room_id))
            .map(|(room_id, sequence)| (room_id.clone(), sequence.clone()))
            .collect();

        let active_room_id = self
            .active_room_id
            .clone()
            .filter(|room_id| !resolver::is_pending(room_id));

        StoreSnapshot {
            rooms,
            messages,
            active_room_id,
            support_session: self.support_session.clone(),
        }
    }

    /// Load a hydrated snapshot as the starting state.
    pub fn hydrate_from(&mut self, snapshot: StoreSnapshot) {
        self.rooms = snapshot
            .rooms
            .into_iter()
            .map(|room| (room.id.clone(), room))
            .collect();
        self.messages = snapshot.messages;
        self.active_room_id = snapshot.active_room_id;
        self.support_session = snapshot.support_session;
        self.mark_mutated();
    }

    fn mark_mutated(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }
}
