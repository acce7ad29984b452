//! Chatbot-to-agent hand-off within one support session.
//!
//! The transition is one-directional and keyed on the stable support
//! `session_id`; only `chat_mode` changes. From the consumer's point of view
//! the history migration, mode flip, active-room switch and admission of the
//! triggering agent message happen as one step.

use tracing::{debug, info};

use crate::{
    error::{SyncError, SyncErrorCategory},
    ingress::{IngestOutcome, IngressPipeline, candidate_from_agent_message},
    resolver,
    store::RoomStore,
    types::{ChatKind, ChatMode, Message},
    wire::AgentMessagePayload,
};

/// What a processed `agentMessage` did to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct HandoffReport {
    pub support_room_id: String,
    pub chatbot_room_id: String,
    /// Number of chatbot-history copies admitted into the support room.
    pub migrated_count: usize,
    /// Whether this event performed the chatbot-to-agent transition.
    pub mode_changed: bool,
    pub admitted: Option<Message>,
}

/// Process one `agentMessage` event.
///
/// The first matching event flips the session to agent mode, migrates
/// chatbot history into the (previously empty) support room and makes the
/// support room active; later events only ingest ordinarily. An event whose
/// `session_id` does not match the current support session never mutates
/// the store.
pub fn handle_agent_message(
    store: &mut RoomStore,
    ingress: &mut IngressPipeline,
    payload: &AgentMessagePayload,
    now_ms: u64,
) -> Result<HandoffReport, SyncError> {
    let session = store.support_session().ok_or_else(|| {
        SyncError::new(
            SyncErrorCategory::SessionMismatch,
            "unknown_session",
            "agent message arrived without an active support session",
        )
    })?;

    if session.session_id != payload.session_id {
        return Err(SyncError::new(
            SyncErrorCategory::SessionMismatch,
            "session_mismatch",
            format!(
                "agent message for session '{}' does not match active session '{}'",
                payload.session_id, session.session_id
            ),
        ));
    }

    let session_id = session.session_id.clone();
    let chatbot_room_id = resolver::chatbot_room_id(&session_id);
    let support_room_id = resolver::support_room_id(&session_id);
    let mode_changed = session.chat_mode == ChatMode::Chatbot;

    let mut migrated_count = 0;
    if mode_changed {
        store.ensure_room(&support_room_id, ChatKind::Support, now_ms);
        if store.message_count(&support_room_id) == 0
            && store.message_count(&chatbot_room_id) >= 1
        {
            migrated_count = store.copy_history_into(&chatbot_room_id, &support_room_id);
            debug!(
                %session_id,
                migrated_count,
                "migrated chatbot history into support room"
            );
        }
        store.set_support_mode(ChatMode::Agent);
        store.set_active_room(Some(support_room_id.clone()));
        info!(%session_id, agent_id = %payload.agent_id, "support session handed off to agent");
    }

    let candidate = candidate_from_agent_message(payload, &support_room_id);
    let admitted = match ingress.ingest(store, candidate, now_ms) {
        IngestOutcome::Admitted(message) => Some(message),
        IngestOutcome::DroppedEcho | IngestOutcome::DroppedDuplicate => None,
    };

    Ok(HandoffReport {
        support_room_id,
        chatbot_room_id,
        migrated_count,
        mode_changed,
        admitted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageKind, MessageMeta, SupportSession};

    fn support_session(session_id: &str, mode: ChatMode) -> SupportSession {
        SupportSession {
            session_id: session_id.to_owned(),
            chat_mode: mode,
            status: "ACTIVE".to_owned(),
            priority: "NORMAL".to_owned(),
            category: None,
            sla_deadline_ms: None,
        }
    }

    fn chatbot_message(room: &str, id: &str, ts: u64) -> Message {
        Message {
            message_id: id.to_owned(),
            room_id: room.to_owned(),
            sender_id: "chatbot".to_owned(),
            content: format!("bot-{id}"),
            kind: MessageKind::Text,
            timestamp_ms: ts,
            metadata: MessageMeta::None,
        }
    }

    fn agent_payload(session_id: &str, message: &str) -> AgentMessagePayload {
        AgentMessagePayload {
            session_id: session_id.to_owned(),
            agent_id: "agent-7".to_owned(),
            agent_name: "Alex".to_owned(),
            message: message.to_owned(),
            message_type: None,
            timestamp: None,
        }
    }

    #[test]
    fn first_agent_message_migrates_history_and_switches_room() {
        // chatbot_S42 has 3 prior messages, support_S42 none.
        let mut store = RoomStore::new();
        let mut ingress = IngressPipeline::new("me");
        store.set_support_session(support_session("S42", ChatMode::Chatbot));
        store.ensure_room("chatbot_S42", ChatKind::Chatbot, 0);
        for (i, ts) in [(1, 10), (2, 20), (3, 30)] {
            store.add_message(chatbot_message("chatbot_S42", &format!("m{i}"), ts), false);
        }

        let report =
            handle_agent_message(&mut store, &mut ingress, &agent_payload("S42", "Hi, I'm Alex"), 40)
                .expect("hand-off should succeed");

        assert!(report.mode_changed);
        assert_eq!(report.migrated_count, 3);
        assert_eq!(store.message_count("support_S42"), 4);
        assert_eq!(store.message_count("chatbot_S42"), 3);
        assert_eq!(store.active_room_id(), Some("support_S42"));
        assert_eq!(
            store.support_session().expect("session").chat_mode,
            ChatMode::Agent
        );
        assert_eq!(
            store.support_session().expect("session").session_id,
            "S42"
        );
    }

    #[test]
    fn replayed_support_room_skips_migration() {
        let mut store = RoomStore::new();
        let mut ingress = IngressPipeline::new("me");
        store.set_support_session(support_session("S42", ChatMode::Chatbot));
        store.ensure_room("chatbot_S42", ChatKind::Chatbot, 0);
        store.add_message(chatbot_message("chatbot_S42", "m1", 10), false);
        store.ensure_room("support_S42", ChatKind::Support, 0);
        store.add_message(chatbot_message("support_S42", "replayed", 5), false);

        let report =
            handle_agent_message(&mut store, &mut ingress, &agent_payload("S42", "hello"), 40)
                .expect("hand-off should succeed");

        assert_eq!(report.migrated_count, 0);
        assert_eq!(store.message_count("support_S42"), 2);
    }

    #[test]
    fn later_agent_messages_only_ingest() {
        let mut store = RoomStore::new();
        let mut ingress = IngressPipeline::new("me");
        store.set_support_session(support_session("S42", ChatMode::Agent));
        store.ensure_room("chatbot_S42", ChatKind::Chatbot, 0);
        store.add_message(chatbot_message("chatbot_S42", "m1", 10), false);

        let report =
            handle_agent_message(&mut store, &mut ingress, &agent_payload("S42", "still here"), 50)
                .expect("ordinary ingestion should succeed");

        assert!(!report.mode_changed);
        assert_eq!(report.migrated_count, 0);
        assert_eq!(store.message_count("support_S42"), 1);
    }

    #[test]
    fn mismatched_session_never_mutates_the_store() {
        let mut store = RoomStore::new();
        let mut ingress = IngressPipeline::new("me");
        store.set_support_session(support_session("S42", ChatMode::Chatbot));
        let revision = store.revision();

        let err = handle_agent_message(&mut store, &mut ingress, &agent_payload("S99", "hi"), 40)
            .expect_err("mismatch must be rejected");

        assert_eq!(err.category, SyncErrorCategory::SessionMismatch);
        assert_eq!(store.revision(), revision);
        assert_eq!(store.message_count("support_S99"), 0);
    }
}
