//! Host capability seams backing the synchronization engine.
//!
//! Each seam ships a production implementation and an in-memory/channel
//! implementation for tests.

/// Durable state store seam (JSON file store + in-memory store).
pub mod store;
/// Wire transport seam (websocket + channel-backed test transport).
pub mod transport;

pub use store::{InMemoryStateStore, JsonFileStateStore, StateStore, StateStoreError};
pub use transport::{
    ChannelTransport, ChannelTransportFactory, Transport, TransportError, TransportFactory,
    TransportHarness, WsTransport, WsTransportFactory, channel_transport,
};
