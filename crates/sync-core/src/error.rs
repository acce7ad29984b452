use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::ConnectionState;

/// Broad error category used for recovery behavior.
///
/// Everything here is recovered locally; nothing propagates past the
/// runtime boundary as a panic or early return.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncErrorCategory {
    /// Transient transport failure; subject to bounded reconnect.
    Connection,
    /// Event references a session/room the client does not know.
    SessionMismatch,
    /// Wire payload missing required identifying fields.
    Validation,
    /// Durable write/read failure; memory stays authoritative.
    Persistence,
    /// Server confirmed a referenced entity no longer exists.
    StaleReference,
    /// Invalid input or unsupported local state.
    Config,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal invariant break.
    Internal,
}

/// Stable error payload crossing the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SyncError {
    pub category: SyncErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl SyncError {
    pub fn new(
        category: SyncErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Standard invalid-state-transition error.
    pub fn invalid_state(current: ConnectionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            SyncErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while connection is in state {current:?}"),
        )
    }

    /// Session-mutating command rejected outside the connected state.
    pub fn not_connected(action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            SyncErrorCategory::Connection,
            "not_connected",
            format!("'{action}' requires an established connection"),
        )
    }

    /// Wire payload rejected at the ingress boundary.
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Validation, code, message)
    }
}

/// Map REST collaborator status codes onto the local taxonomy.
pub fn classify_http_status(status: u16) -> SyncErrorCategory {
    match status {
        404 | 410 => SyncErrorCategory::StaleReference,
        408 | 429 => SyncErrorCategory::Connection,
        400..=499 => SyncErrorCategory::Validation,
        500..=599 => SyncErrorCategory::Connection,
        _ => SyncErrorCategory::Internal,
    }
}
