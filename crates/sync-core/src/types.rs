use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Logical transport namespace. One connection is held per namespace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Support/chatbot/order chat traffic.
    Chat,
    /// Order status push stream.
    OrderTracking,
    /// Driver location/ETA push stream.
    DriverLocation,
}

impl Namespace {
    /// Stable path segment used when building the connect URL.
    pub fn as_path(&self) -> &'static str {
        match self {
            Namespace::Chat => "chat",
            Namespace::OrderTracking => "order-tracking",
            Namespace::DriverLocation => "driver-location",
        }
    }
}

/// Chat session/room flavor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatKind {
    Support,
    Order,
    Chatbot,
}

impl ChatKind {
    /// Wire token used by `startSupportChat`/`startChat` payloads.
    pub fn as_wire(&self) -> &'static str {
        match self {
            ChatKind::Support => "SUPPORT",
            ChatKind::Order => "ORDER",
            ChatKind::Chatbot => "CHATBOT",
        }
    }
}

/// Lifecycle of a logical conversation context.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Ended,
}

/// A logical conversation context of a given kind.
///
/// At most one active session per [`ChatKind`] exists client-side at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSession {
    pub kind: ChatKind,
    /// Room the session currently writes into (may be a pending placeholder).
    pub room_id: String,
    /// Counterpart reference: agent ref, bot ref or peer user id.
    pub counterpart_ref: Option<String>,
    pub order_id: Option<String>,
    pub status: SessionStatus,
    pub created_at_ms: u64,
    pub last_message_at_ms: Option<u64>,
}

/// Canonical message kind after normalization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    OrderInfo,
    Options,
}

impl MessageKind {
    /// Map a provider kind token to the canonical kind.
    ///
    /// Unknown tokens fall back to [`MessageKind::Text`].
    pub fn from_wire(token: Option<&str>) -> Self {
        match token.map(str::trim) {
            Some(t) if t.eq_ignore_ascii_case("image") => MessageKind::Image,
            Some(t) if t.eq_ignore_ascii_case("video") => MessageKind::Video,
            Some(t) if t.eq_ignore_ascii_case("order_info") || t.eq_ignore_ascii_case("orderInfo") => {
                MessageKind::OrderInfo
            }
            Some(t) if t.eq_ignore_ascii_case("options") => MessageKind::Options,
            _ => MessageKind::Text,
        }
    }
}

/// Sender-specific payload extras carried alongside a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum MessageMeta {
    #[default]
    None,
    Chatbot {
        options: Vec<String>,
        quick_replies: Vec<String>,
        form_fields: Vec<String>,
        follow_up_prompt: Option<String>,
    },
    Agent {
        agent_id: String,
        agent_name: String,
    },
    System,
}

/// Canonical message record, immutable once admitted to a room sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Unique within its room.
    pub message_id: String,
    pub room_id: String,
    pub sender_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub metadata: MessageMeta,
}

/// Addressable container for an ordered message sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Room {
    pub id: String,
    pub participants: HashSet<String>,
    pub last_message: Option<Message>,
    pub unread_count: u32,
    pub kind: ChatKind,
    pub order_id: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl Room {
    /// Minimal room shell for lazy creation on first reference.
    pub fn new(id: impl Into<String>, kind: ChatKind, now_ms: u64) -> Self {
        Self {
            id: id.into(),
            participants: HashSet::new(),
            last_message: None,
            unread_count: 0,
            kind,
            order_id: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }
}

/// Escalatable support conversation mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatMode {
    Chatbot,
    Agent,
}

/// Support conversation descriptor.
///
/// `session_id` is stable across the chatbot-to-agent hand-off; only
/// `chat_mode` changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupportSession {
    pub session_id: String,
    pub chat_mode: ChatMode,
    pub status: String,
    pub priority: String,
    pub category: Option<String>,
    pub sla_deadline_ms: Option<u64>,
}

/// Order progress state as reported by the push/snapshot sources.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    ReadyForPickup,
    PickedUp,
    EnRoute,
    Delivered,
    Cancelled,
    /// Any status token the client does not model.
    #[serde(other)]
    Unknown,
}

impl OrderStatus {
    /// Whether the order reached a state the UI treats as final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }
}

/// Line item carried by authoritative order snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderItem {
    pub name: String,
    pub quantity: u32,
}

/// Locally tracked order state merged from pushes and snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderTrackingRecord {
    pub order_id: String,
    pub status: OrderStatus,
    pub tracking_info: Option<String>,
    pub restaurant_address: Option<String>,
    pub customer_address: Option<String>,
    pub driver_ref: Option<String>,
    /// Monotonic per order once merged.
    pub updated_at_ms: u64,
    pub total_amount: Option<f64>,
    pub order_items: Vec<OrderItem>,
    /// Set by a terminal-status push; cleared only by explicit UI action.
    pub awaiting_rating: bool,
}

impl OrderTrackingRecord {
    /// Minimal record created when a push references an unknown order.
    pub fn minimal(order_id: impl Into<String>, status: OrderStatus, updated_at_ms: u64) -> Self {
        Self {
            order_id: order_id.into(),
            status,
            tracking_info: None,
            restaurant_address: None,
            customer_address: None,
            driver_ref: None,
            updated_at_ms,
            total_amount: None,
            order_items: Vec::new(),
            awaiting_rating: status == OrderStatus::Delivered,
        }
    }
}

/// Geographic coordinate pushed by the driver-location stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Command channel input accepted by the sync runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SyncCommand {
    /// Open all namespace connections with the given auth token.
    Connect { auth_token: String },
    /// Tear down all connections without clearing local state.
    Disconnect,
    /// Start a support-family conversation (SUPPORT or CHATBOT).
    StartSupportChat { kind: ChatKind },
    /// Start a per-order conversation with another user.
    StartOrderChat {
        with_user_id: String,
        order_id: String,
    },
    /// Send a message into the currently active room (optimistic).
    SendChatMessage { content: String, kind: MessageKind },
    /// Make a room active and reset its unread counter.
    SelectRoom { room_id: String },
    /// Request a full history replace for a room.
    FetchHistory { room_id: String },
    /// Subscribe to a single driver's location/ETA stream.
    SubscribeDriver { driver_id: String },
    /// Drop the current driver subscription, if any.
    UnsubscribeDriver,
    /// Remove a delivered order the UI has finished with.
    ClearDeliveredOrder { order_id: String },
    /// End the active session of the given kind.
    CloseSession { kind: ChatKind },
    /// Clear all local state and persisted snapshots.
    Logout,
}

/// Event channel output emitted by the sync runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SyncEvent {
    /// Per-namespace connectivity flag consumed by the UI.
    ConnectionChanged { namespace: Namespace, connected: bool },
    /// Reconnect attempts exhausted; tracking state was cleared.
    ConnectionGaveUp { namespace: Namespace },
    /// A message was admitted to a room sequence.
    MessageAdded { message: Message },
    /// Room metadata changed (participants, unread, last message).
    RoomUpdated { room: Room },
    /// A room's full message sequence was replaced from history.
    HistoryReplaced { room_id: String, count: usize },
    /// The active room pointer moved.
    ActiveRoomChanged { room_id: Option<String> },
    /// Support session created or its mode changed.
    SupportSessionUpdated { session: SupportSession },
    /// Acknowledgement for a user-initiated send.
    SendAck {
        client_txn_id: String,
        error_code: Option<String>,
    },
    /// An order tracking record was created or merged.
    OrderTrackingUpdated { record: OrderTrackingRecord },
    /// A locally tracked order was removed (staleness or explicit clear).
    OrderTrackingRemoved { order_id: String },
    /// All tracking state was dropped (give-up or logout).
    TrackingCleared,
    /// Driver position/ETA push applied to the active subscription.
    DriverLocationUpdated {
        driver_id: String,
        location: GeoPoint,
        eta_minutes: u32,
    },
    /// Arrival alert: at most one per continuous-activity burst.
    DriverArrivingSoon { driver_id: String, eta_minutes: u32 },
    /// Recovered runtime error surfaced for observability.
    FatalError {
        code: String,
        message: String,
        recoverable: bool,
    },
}
