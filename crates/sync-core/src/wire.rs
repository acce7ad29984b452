//! Wire protocol: event names, payload validators and frame builders.
//!
//! Every inbound frame is `{ "event": <name>, "data": <payload> }`. Payloads
//! are validated into typed structs at this boundary; a payload that fails
//! validation is rejected whole, never partially applied.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    error::SyncError,
    types::{ChatKind, MessageKind, OrderStatus},
};

pub const EVT_START_SUPPORT_CHAT: &str = "startSupportChat";
pub const EVT_START_SUPPORT_CHAT_RESPONSE: &str = "startSupportChatResponse";
pub const EVT_SEND_SUPPORT_MESSAGE: &str = "sendSupportMessage";
pub const EVT_CHATBOT_MESSAGE: &str = "chatbotMessage";
pub const EVT_AGENT_MESSAGE: &str = "agentMessage";
pub const EVT_START_CHAT: &str = "startChat";
pub const EVT_CHAT_STARTED: &str = "chatStarted";
pub const EVT_SEND_MESSAGE: &str = "sendMessage";
pub const EVT_NEW_MESSAGE: &str = "newMessage";
pub const EVT_GET_CHAT_HISTORY: &str = "getChatHistory";
pub const EVT_CHAT_HISTORY: &str = "chatHistory";
pub const EVT_GET_SUPPORT_HISTORY: &str = "getSupportHistory";
pub const EVT_SUPPORT_HISTORY: &str = "supportHistory";
pub const EVT_NOTIFY_ORDER_STATUS: &str = "notifyOrderStatus";
pub const EVT_SUBSCRIBE_DRIVER_LOCATION: &str = "subscribeToDriverLocation";
pub const EVT_DRIVER_CURRENT_LOCATION: &str = "driverCurrentLocation";

/// One transport frame: event name plus raw JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl WireFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// `startSupportChatResponse` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SupportChatStartedPayload {
    #[serde(alias = "session_id")]
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, alias = "sla_deadline")]
    pub sla_deadline: Option<u64>,
}

/// `chatbotMessage` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatbotMessagePayload {
    #[serde(alias = "session_id")]
    pub session_id: String,
    pub message: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default, alias = "quick_replies")]
    pub quick_replies: Vec<String>,
    #[serde(default, alias = "form_fields")]
    pub form_fields: Vec<String>,
    #[serde(default, alias = "follow_up_prompt")]
    pub follow_up_prompt: Option<String>,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

/// `agentMessage` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessagePayload {
    #[serde(alias = "session_id")]
    pub session_id: String,
    #[serde(alias = "agent_id")]
    pub agent_id: String,
    #[serde(default, alias = "agent_name")]
    pub agent_name: String,
    pub message: String,
    #[serde(default, alias = "message_type")]
    pub message_type: Option<String>,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

/// Peer descriptor inside `chatStarted`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WithUserPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// `chatStarted` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatStartedPayload {
    #[serde(default, alias = "chat_id")]
    pub chat_id: Option<String>,
    #[serde(alias = "db_room_id")]
    pub db_room_id: String,
    #[serde(default, alias = "with_user")]
    pub with_user: Option<WithUserPayload>,
    #[serde(default, rename = "type")]
    pub kind: Option<ChatKind>,
    #[serde(default, alias = "order_id")]
    pub order_id: Option<String>,
}

/// `newMessage` payload; `roomId` is the required identifying field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    #[serde(alias = "room_id")]
    pub room_id: String,
    #[serde(default, alias = "sender", alias = "sender_id")]
    pub sender_id: Option<String>,
    #[serde(default, alias = "message")]
    pub content: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default, alias = "id", alias = "message_id")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

/// Entry inside history responses; room/session context comes from the
/// enclosing payload, so no identifying field is required here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntryPayload {
    #[serde(default, alias = "id", alias = "message_id")]
    pub message_id: Option<String>,
    #[serde(default, alias = "sender", alias = "sender_id")]
    pub sender_id: Option<String>,
    #[serde(default, alias = "message")]
    pub content: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

/// `chatHistory` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistoryPayload {
    #[serde(alias = "room_id")]
    pub room_id: String,
    #[serde(default)]
    pub messages: Vec<HistoryEntryPayload>,
}

/// `supportHistory` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SupportHistoryPayload {
    #[serde(alias = "session_id")]
    pub session_id: String,
    #[serde(default)]
    pub messages: Vec<HistoryEntryPayload>,
}

/// Driver descriptor inside `notifyOrderStatus`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverDetailsPayload {
    #[serde(default, alias = "driver_id", alias = "id")]
    pub driver_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Line item inside order payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemPayload {
    pub name: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

/// `notifyOrderStatus` payload; `orderId` is the required identifying field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusPushPayload {
    #[serde(alias = "order_id")]
    pub order_id: String,
    pub status: OrderStatus,
    #[serde(default, alias = "tracking_info")]
    pub tracking_info: Option<String>,
    #[serde(default, alias = "restaurant_address")]
    pub restaurant_address: Option<String>,
    #[serde(default, alias = "customer_address")]
    pub customer_address: Option<String>,
    #[serde(default, alias = "driver_details")]
    pub driver_details: Option<DriverDetailsPayload>,
    #[serde(default, alias = "updated_at")]
    pub updated_at: Option<u64>,
    #[serde(default, alias = "total_amount")]
    pub total_amount: Option<f64>,
    #[serde(default, alias = "order_items")]
    pub order_items: Option<Vec<OrderItemPayload>>,
}

/// `driverCurrentLocation` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverLocationPayload {
    #[serde(alias = "driver_id")]
    pub driver_id: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(alias = "eta_minutes", alias = "etaMinutes")]
    pub eta: u32,
}

/// Server-to-client wire event after payload validation.
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    SupportChatStarted(SupportChatStartedPayload),
    ChatbotMessage(ChatbotMessagePayload),
    AgentMessage(AgentMessagePayload),
    ChatStarted(ChatStartedPayload),
    NewMessage(NewMessagePayload),
    ChatHistory(ChatHistoryPayload),
    SupportHistory(SupportHistoryPayload),
    OrderStatusPush(OrderStatusPushPayload),
    DriverLocation(DriverLocationPayload),
}

/// Validate one inbound frame into a typed wire event.
///
/// Returns `Ok(None)` for event names the client does not model (ignored),
/// and a validation error when a known event carries an unusable payload.
pub fn parse_wire_event(frame: &WireFrame) -> Result<Option<WireEvent>, SyncError> {
    let data = &frame.data;
    let event = match frame.event.as_str() {
        EVT_START_SUPPORT_CHAT_RESPONSE => {
            WireEvent::SupportChatStarted(decode(&frame.event, data)?)
        }
        EVT_CHATBOT_MESSAGE => WireEvent::ChatbotMessage(decode(&frame.event, data)?),
        EVT_AGENT_MESSAGE => WireEvent::AgentMessage(decode(&frame.event, data)?),
        EVT_CHAT_STARTED => WireEvent::ChatStarted(decode(&frame.event, data)?),
        EVT_NEW_MESSAGE => WireEvent::NewMessage(decode(&frame.event, data)?),
        EVT_CHAT_HISTORY => WireEvent::ChatHistory(decode(&frame.event, data)?),
        EVT_SUPPORT_HISTORY => WireEvent::SupportHistory(decode(&frame.event, data)?),
        EVT_NOTIFY_ORDER_STATUS => WireEvent::OrderStatusPush(decode(&frame.event, data)?),
        EVT_DRIVER_CURRENT_LOCATION => WireEvent::DriverLocation(decode(&frame.event, data)?),
        _ => return Ok(None),
    };
    Ok(Some(event))
}

fn decode<T: serde::de::DeserializeOwned>(event: &str, data: &Value) -> Result<T, SyncError> {
    serde_json::from_value(data.clone()).map_err(|err| {
        SyncError::validation("invalid_payload", format!("'{event}' payload rejected: {err}"))
    })
}

/// Build the `startSupportChat` client frame.
pub fn start_support_chat_frame(kind: ChatKind) -> WireFrame {
    WireFrame::new(EVT_START_SUPPORT_CHAT, json!({ "type": kind.as_wire() }))
}

/// Build the `sendSupportMessage` client frame.
pub fn send_support_message_frame(
    session_id: &str,
    message: &str,
    kind: MessageKind,
    is_option_selection: bool,
) -> WireFrame {
    WireFrame::new(
        EVT_SEND_SUPPORT_MESSAGE,
        json!({
            "sessionId": session_id,
            "message": message,
            "type": kind,
            "isOptionSelection": is_option_selection,
        }),
    )
}

/// Build the `startChat` client frame for an order conversation.
pub fn start_chat_frame(with_user_id: &str, order_id: &str) -> WireFrame {
    WireFrame::new(
        EVT_START_CHAT,
        json!({
            "withUserId": with_user_id,
            "type": ChatKind::Order.as_wire(),
            "orderId": order_id,
        }),
    )
}

/// Build the `sendMessage` client frame for an order room.
pub fn send_message_frame(room_id: &str, content: &str, kind: MessageKind) -> WireFrame {
    WireFrame::new(
        EVT_SEND_MESSAGE,
        json!({ "roomId": room_id, "content": content, "type": kind }),
    )
}

/// Build the `getChatHistory` client frame.
pub fn get_chat_history_frame(room_id: &str) -> WireFrame {
    WireFrame::new(EVT_GET_CHAT_HISTORY, json!({ "roomId": room_id }))
}

/// Build the `getSupportHistory` client frame.
pub fn get_support_history_frame(session_id: &str) -> WireFrame {
    WireFrame::new(EVT_GET_SUPPORT_HISTORY, json!({ "sessionId": session_id }))
}

/// Build the `subscribeToDriverLocation` client frame.
pub fn subscribe_driver_location_frame(driver_id: &str) -> WireFrame {
    WireFrame::new(
        EVT_SUBSCRIBE_DRIVER_LOCATION,
        json!({ "driverId": driver_id }),
    )
}
