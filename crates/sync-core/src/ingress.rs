//! Inbound message normalization, sender-echo deduplication and admission.
//!
//! Every inbound wire payload is reduced to a [`MessageCandidate`] and fed
//! through [`IngressPipeline::ingest`]. The pipeline discards server echoes
//! of locally originated optimistic sends; messages from other senders are
//! always admitted, even on a content collision.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use tracing::{debug, warn};

use crate::{
    store::RoomStore,
    types::{ChatKind, Message, MessageKind, MessageMeta, SyncEvent},
    wire::{AgentMessagePayload, ChatbotMessagePayload, HistoryEntryPayload, NewMessagePayload},
};

/// Sender id attached to normalized chatbot messages.
pub const CHATBOT_SENDER: &str = "chatbot";

/// Canonical message candidate before dedup and admission.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageCandidate {
    pub room_id: String,
    pub room_kind: ChatKind,
    pub sender_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub message_id: Option<String>,
    pub timestamp_ms: Option<u64>,
    pub metadata: MessageMeta,
}

/// Result of feeding one candidate through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Admitted(Message),
    /// Server echo of a local optimistic send; the local copy already exists.
    DroppedEcho,
    /// A message with the same id is already in the room sequence.
    DroppedDuplicate,
}

/// Ingress pipeline holding the per-room pending-echo bookkeeping.
#[derive(Debug)]
pub struct IngressPipeline {
    local_user_id: String,
    pending_echoes: HashMap<String, HashMap<String, u32>>,
}

impl IngressPipeline {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            pending_echoes: HashMap::new(),
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Record an optimistic local send so its server echo can be discarded.
    pub fn note_optimistic_send(&mut self, room_id: &str, content: &str) {
        *self
            .pending_echoes
            .entry(room_id.to_owned())
            .or_default()
            .entry(content.to_owned())
            .or_insert(0) += 1;
    }

    /// Normalize, deduplicate and admit one candidate into the store.
    pub fn ingest(
        &mut self,
        store: &mut RoomStore,
        candidate: MessageCandidate,
        now_ms: u64,
    ) -> IngestOutcome {
        if candidate.sender_id == self.local_user_id
            && self.consume_pending_echo(&candidate.room_id, &candidate.content)
        {
            debug!(
                room_id = %candidate.room_id,
                "discarded server echo of optimistic send"
            );
            return IngestOutcome::DroppedEcho;
        }

        store.ensure_room(&candidate.room_id, candidate.room_kind, now_ms);

        let timestamp_ms = candidate.timestamp_ms.unwrap_or(now_ms);
        let message = Message {
            message_id: candidate.message_id.clone().unwrap_or_else(|| {
                synthesized_message_id(
                    &candidate.room_id,
                    &candidate.sender_id,
                    &candidate.content,
                    timestamp_ms,
                )
            }),
            room_id: candidate.room_id.clone(),
            sender_id: candidate.sender_id.clone(),
            content: candidate.content,
            kind: candidate.kind,
            timestamp_ms,
            metadata: candidate.metadata,
        };

        let count_unread = message.sender_id != self.local_user_id;
        if store.add_message(message.clone(), count_unread) {
            IngestOutcome::Admitted(message)
        } else {
            warn!(
                room_id = %message.room_id,
                message_id = %message.message_id,
                "duplicate message id dropped before admission"
            );
            IngestOutcome::DroppedDuplicate
        }
    }

    /// Drop all pending-echo entries for a room (room closed or migrated).
    pub fn forget_room(&mut self, room_id: &str) {
        self.pending_echoes.remove(room_id);
    }

    /// Retarget pending-echo entries when a pending room id becomes real.
    pub fn retarget_room(&mut self, pending_id: &str, real_id: &str) {
        if let Some(entries) = self.pending_echoes.remove(pending_id) {
            let target = self.pending_echoes.entry(real_id.to_owned()).or_default();
            for (content, count) in entries {
                *target.entry(content).or_insert(0) += count;
            }
        }
    }

    fn consume_pending_echo(&mut self, room_id: &str, content: &str) -> bool {
        let Some(room_entries) = self.pending_echoes.get_mut(room_id) else {
            return false;
        };
        let Some(count) = room_entries.get_mut(content) else {
            return false;
        };

        *count -= 1;
        if *count == 0 {
            room_entries.remove(content);
        }
        if room_entries.is_empty() {
            self.pending_echoes.remove(room_id);
        }
        true
    }
}

/// Candidate from a `newMessage` frame (ORDER rooms).
pub fn candidate_from_new_message(payload: &NewMessagePayload) -> MessageCandidate {
    MessageCandidate {
        room_id: payload.room_id.clone(),
        room_kind: ChatKind::Order,
        sender_id: payload.sender_id.clone().unwrap_or_default(),
        content: payload.content.clone().unwrap_or_default(),
        kind: MessageKind::from_wire(payload.kind.as_deref()),
        message_id: payload.message_id.clone(),
        timestamp_ms: payload.timestamp,
        metadata: MessageMeta::None,
    }
}

/// Candidate from a `chatbotMessage` frame, targeting the chatbot room.
pub fn candidate_from_chatbot_message(
    payload: &ChatbotMessagePayload,
    room_id: &str,
) -> MessageCandidate {
    let mut kind = MessageKind::from_wire(payload.kind.as_deref());
    if kind == MessageKind::Text && !payload.options.is_empty() {
        kind = MessageKind::Options;
    }

    MessageCandidate {
        room_id: room_id.to_owned(),
        room_kind: ChatKind::Chatbot,
        sender_id: CHATBOT_SENDER.to_owned(),
        content: payload.message.clone(),
        kind,
        message_id: None,
        timestamp_ms: payload.timestamp,
        metadata: MessageMeta::Chatbot {
            options: payload.options.clone(),
            quick_replies: payload.quick_replies.clone(),
            form_fields: payload.form_fields.clone(),
            follow_up_prompt: payload.follow_up_prompt.clone(),
        },
    }
}

/// Candidate from an `agentMessage` frame, targeting the support room.
pub fn candidate_from_agent_message(
    payload: &AgentMessagePayload,
    room_id: &str,
) -> MessageCandidate {
    MessageCandidate {
        room_id: room_id.to_owned(),
        room_kind: ChatKind::Support,
        sender_id: payload.agent_id.clone(),
        content: payload.message.clone(),
        kind: MessageKind::from_wire(payload.message_type.as_deref()),
        message_id: None,
        timestamp_ms: payload.timestamp,
        metadata: MessageMeta::Agent {
            agent_id: payload.agent_id.clone(),
            agent_name: payload.agent_name.clone(),
        },
    }
}

/// Normalize history entries into canonical messages for a full replace.
pub fn messages_from_history(
    entries: &[HistoryEntryPayload],
    room_id: &str,
    fallback_ts_ms: u64,
) -> Vec<Message> {
    entries
        .iter()
        .map(|entry| {
            let content = entry.content.clone().unwrap_or_default();
            let sender_id = entry.sender_id.clone().unwrap_or_default();
            let timestamp_ms = entry.timestamp.unwrap_or(fallback_ts_ms);
            Message {
                message_id: entry.message_id.clone().unwrap_or_else(|| {
                    synthesized_message_id(room_id, &sender_id, &content, timestamp_ms)
                }),
                room_id: room_id.to_owned(),
                sender_id,
                content,
                kind: MessageKind::from_wire(entry.kind.as_deref()),
                timestamp_ms,
                metadata: MessageMeta::None,
            }
        })
        .collect()
}

/// Stable acknowledgement event for a user-initiated send.
pub fn send_ack_event(
    client_txn_id: impl Into<String>,
    error_code: Option<&str>,
) -> SyncEvent {
    SyncEvent::SendAck {
        client_txn_id: client_txn_id.into(),
        error_code: error_code.map(ToOwned::to_owned),
    }
}

fn synthesized_message_id(room_id: &str, sender_id: &str, content: &str, ts_ms: u64) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    room_id.hash(&mut hasher);
    sender_id.hash(&mut hasher);
    content.hash(&mut hasher);
    ts_ms.hash(&mut hasher);
    format!("recv-{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(room: &str, sender: &str, content: &str, ts: u64) -> MessageCandidate {
        MessageCandidate {
            room_id: room.to_owned(),
            room_kind: ChatKind::Order,
            sender_id: sender.to_owned(),
            content: content.to_owned(),
            kind: MessageKind::Text,
            message_id: None,
            timestamp_ms: Some(ts),
            metadata: MessageMeta::None,
        }
    }

    #[test]
    fn optimistic_send_plus_echo_yields_exactly_one_copy() {
        // Scenario: user sends "Hello" in order room R1, then the server
        // echoes it back with the local sender id.
        let mut store = RoomStore::new();
        let mut ingress = IngressPipeline::new("me");

        store.ensure_room("R1", ChatKind::Order, 0);
        let optimistic = Message {
            message_id: "local-1".to_owned(),
            room_id: "R1".to_owned(),
            sender_id: "me".to_owned(),
            content: "Hello".to_owned(),
            kind: MessageKind::Text,
            timestamp_ms: 10,
            metadata: MessageMeta::None,
        };
        ingress.note_optimistic_send("R1", "Hello");
        store.add_message(optimistic, false);
        assert_eq!(store.message_count("R1"), 1);

        let outcome = ingress.ingest(&mut store, candidate("R1", "me", "Hello", 12), 12);
        assert_eq!(outcome, IngestOutcome::DroppedEcho);
        assert_eq!(store.message_count("R1"), 1);
    }

    #[test]
    fn echo_is_consumed_exactly_once() {
        let mut store = RoomStore::new();
        let mut ingress = IngressPipeline::new("me");
        ingress.note_optimistic_send("R1", "Hello");

        assert_eq!(
            ingress.ingest(&mut store, candidate("R1", "me", "Hello", 10), 10),
            IngestOutcome::DroppedEcho
        );
        // A later identical message from the same sender is a genuine new
        // message, not an echo.
        assert!(matches!(
            ingress.ingest(&mut store, candidate("R1", "me", "Hello", 20), 20),
            IngestOutcome::Admitted(_)
        ));
    }

    #[test]
    fn content_collision_from_other_sender_is_always_admitted() {
        let mut store = RoomStore::new();
        let mut ingress = IngressPipeline::new("me");
        ingress.note_optimistic_send("R1", "Hello");

        let outcome = ingress.ingest(&mut store, candidate("R1", "them", "Hello", 10), 10);
        assert!(matches!(outcome, IngestOutcome::Admitted(_)));
        // The pending entry is still armed for the real echo.
        assert_eq!(
            ingress.ingest(&mut store, candidate("R1", "me", "Hello", 11), 11),
            IngestOutcome::DroppedEcho
        );
    }

    #[test]
    fn other_sender_bumps_unread_in_inactive_room() {
        let mut store = RoomStore::new();
        let mut ingress = IngressPipeline::new("me");
        store.ensure_room("R1", ChatKind::Order, 0);
        store.set_active_room(Some("R2".to_owned()));

        ingress.ingest(&mut store, candidate("R1", "them", "ping", 10), 10);
        assert_eq!(store.room("R1").expect("room").unread_count, 1);
    }

    #[test]
    fn creates_room_lazily_on_first_message() {
        let mut store = RoomStore::new();
        let mut ingress = IngressPipeline::new("me");

        let outcome = ingress.ingest(&mut store, candidate("R-new", "them", "hi", 10), 10);
        assert!(matches!(outcome, IngestOutcome::Admitted(_)));
        assert!(store.room("R-new").is_some());
    }

    #[test]
    fn chatbot_candidate_infers_options_kind() {
        let payload = ChatbotMessagePayload {
            session_id: "S1".to_owned(),
            message: "Pick one".to_owned(),
            kind: None,
            options: vec!["a".to_owned(), "b".to_owned()],
            quick_replies: Vec::new(),
            form_fields: Vec::new(),
            follow_up_prompt: None,
            timestamp: None,
        };

        let candidate = candidate_from_chatbot_message(&payload, "chatbot_S1");
        assert_eq!(candidate.kind, MessageKind::Options);
        assert_eq!(candidate.sender_id, CHATBOT_SENDER);
        assert!(matches!(candidate.metadata, MessageMeta::Chatbot { .. }));
    }

    #[test]
    fn history_normalization_synthesizes_missing_ids() {
        let entries = vec![
            HistoryEntryPayload {
                content: Some("one".to_owned()),
                sender_id: Some("u1".to_owned()),
                timestamp: Some(100),
                ..Default::default()
            },
            HistoryEntryPayload {
                content: Some("two".to_owned()),
                sender_id: Some("u2".to_owned()),
                timestamp: Some(200),
                ..Default::default()
            },
        ];

        let messages = messages_from_history(&entries, "R1", 0);
        assert_eq!(messages.len(), 2);
        assert_ne!(messages[0].message_id, messages[1].message_id);
        assert!(messages.iter().all(|m| m.room_id == "R1"));
    }

    #[test]
    fn unknown_kind_token_defaults_to_text() {
        let payload = NewMessagePayload {
            room_id: "R1".to_owned(),
            sender_id: Some("u2".to_owned()),
            content: Some("hi".to_owned()),
            kind: Some("HOLOGRAM".to_owned()),
            message_id: None,
            timestamp: None,
        };
        assert_eq!(candidate_from_new_message(&payload).kind, MessageKind::Text);
    }
}
