//! Deterministic room-id namespacing shared by every chat mode.
//!
//! Support-family rooms derive their id from the support session id;
//! order rooms use the server-issued id verbatim. Until a server id is
//! known the resolver hands out placeholder ids that are never persisted
//! as authoritative.

use crate::types::ChatKind;

const SUPPORT_PREFIX: &str = "support_";
const CHATBOT_PREFIX: &str = "chatbot_";
const PENDING_PREFIX: &str = "pending_";

/// Identifiers known at resolution time.
#[derive(Debug, Clone, Copy, Default)]
pub struct KnownIds<'a> {
    /// Support session id, when a support/chatbot session exists.
    pub session_id: Option<&'a str>,
    /// Server-issued room id, when the server already allocated one.
    pub server_room_id: Option<&'a str>,
}

/// Resolve the canonical room id for the given chat kind.
///
/// Falls back to a pending placeholder when no usable id is known yet.
pub fn resolve_room_id(kind: ChatKind, known: KnownIds<'_>) -> String {
    match kind {
        ChatKind::Support => match known.session_id {
            Some(session_id) => support_room_id(session_id),
            None => pending_room_id(kind),
        },
        ChatKind::Chatbot => match known.session_id {
            Some(session_id) => chatbot_room_id(session_id),
            None => pending_room_id(kind),
        },
        ChatKind::Order => match known.server_room_id {
            Some(room_id) if !room_id.trim().is_empty() => room_id.to_owned(),
            _ => pending_room_id(kind),
        },
    }
}

/// `support_<session_id>`; idempotent when the prefix is already present.
pub fn support_room_id(session_id: &str) -> String {
    prefixed(SUPPORT_PREFIX, session_id)
}

/// `chatbot_<session_id>`; idempotent when the prefix is already present.
pub fn chatbot_room_id(session_id: &str) -> String {
    prefixed(CHATBOT_PREFIX, session_id)
}

/// Placeholder id used before the server allocates a real one.
pub fn pending_room_id(kind: ChatKind) -> String {
    let suffix = match kind {
        ChatKind::Support => "support",
        ChatKind::Order => "order",
        ChatKind::Chatbot => "chatbot",
    };
    format!("{PENDING_PREFIX}{suffix}")
}

/// Whether a room id is a non-authoritative placeholder.
pub fn is_pending(room_id: &str) -> bool {
    room_id.starts_with(PENDING_PREFIX)
}

fn prefixed(prefix: &str, session_id: &str) -> String {
    if session_id.starts_with(prefix) {
        session_id.to_owned()
    } else {
        format!("{prefix}{session_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_support_and_chatbot_sessions() {
        assert_eq!(support_room_id("S42"), "support_S42");
        assert_eq!(chatbot_room_id("S42"), "chatbot_S42");
    }

    #[test]
    fn prefixing_is_idempotent() {
        assert_eq!(support_room_id("support_S42"), "support_S42");
        assert_eq!(chatbot_room_id("chatbot_S42"), "chatbot_S42");
    }

    #[test]
    fn order_rooms_use_server_id_verbatim() {
        let resolved = resolve_room_id(
            ChatKind::Order,
            KnownIds {
                session_id: None,
                server_room_id: Some("R1"),
            },
        );
        assert_eq!(resolved, "R1");
    }

    #[test]
    fn unknown_ids_resolve_to_pending_placeholders() {
        assert_eq!(
            resolve_room_id(ChatKind::Support, KnownIds::default()),
            "pending_support"
        );
        assert_eq!(
            resolve_room_id(ChatKind::Order, KnownIds::default()),
            "pending_order"
        );
        assert!(is_pending("pending_chatbot"));
        assert!(!is_pending("support_S42"));
    }

    #[test]
    fn blank_server_room_id_is_not_authoritative() {
        let resolved = resolve_room_id(
            ChatKind::Order,
            KnownIds {
                session_id: None,
                server_room_id: Some("  "),
            },
        );
        assert_eq!(resolved, "pending_order");
    }
}
