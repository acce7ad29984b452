//! Core contract of the real-time session/message synchronization engine.
//!
//! This crate defines the command/event protocol, the wire payload
//! validators, the room/session store and the pure decision cores the
//! runtime crate drives from wire traffic.

/// Async command/event channel primitives.
pub mod channel;
/// Driver location subscription decision core.
pub mod driver;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Chatbot-to-agent hand-off handler.
pub mod handoff;
/// Inbound normalization, echo dedup and admission.
pub mod ingress;
/// Deterministic room-id namespacing.
pub mod resolver;
/// Backoff policy used by the bounded reconnect loop.
pub mod retry;
/// Connection lifecycle state machine.
pub mod state;
/// Authoritative room/message/session store.
pub mod store;
/// Order tracking push/snapshot merge.
pub mod tracking;
/// Canonical data model and runtime protocol types.
pub mod types;
/// Wire event names, payload validators and frame builders.
pub mod wire;

pub use channel::{EventStream, SyncChannelError, SyncChannels};
pub use driver::{
    DEFAULT_ARRIVAL_ETA_THRESHOLD, DEFAULT_INACTIVITY_WINDOW_MS, DriverPushOutcome, DriverWatch,
};
pub use error::{SyncError, SyncErrorCategory, classify_http_status};
pub use handoff::{HandoffReport, handle_agent_message};
pub use ingress::{IngestOutcome, IngressPipeline, MessageCandidate, send_ack_event};
pub use retry::RetryPolicy;
pub use state::{ConnectionState, ConnectionStateMachine};
pub use store::{RoomStore, StoreSnapshot};
pub use tracking::{
    OrderSnapshotEntry, OrderTracker, OrderUpdate, PushOutcome, SnapshotOutcome, stage_index,
};
pub use types::{
    ChatKind, ChatMode, ChatSession, GeoPoint, Message, MessageKind, MessageMeta, Namespace,
    OrderItem, OrderStatus, OrderTrackingRecord, Room, SessionStatus, SupportSession, SyncCommand,
    SyncEvent,
};
pub use wire::{WireEvent, WireFrame, parse_wire_event};
