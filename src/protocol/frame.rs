//! Inbound transport frames.
//!
//! The hosting transport maps its own message type onto [`InboundFrame`]
//! before handing it to a connection. Ping/pong and other control traffic
//! never reach this layer.
//!
//! # Example
//!
//! ```
//! use metrilyx_dataserver::protocol::{CloseInfo, InboundFrame};
//!
//! let frame = InboundFrame::text(r#"{"_id":"g1"}"#);
//! assert!(!frame.is_close());
//!
//! let close = InboundFrame::Close(CloseInfo::clean(1000, "bye"));
//! assert!(close.is_close());
//! ```

use bytes::Bytes;

/// Why and how a connection closed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseInfo {
    /// Whether the closing handshake completed.
    pub was_clean: bool,
    /// Close code, if the peer sent one.
    pub code: Option<u16>,
    /// Close reason text (may be empty).
    pub reason: String,
}

impl CloseInfo {
    /// A completed closing handshake.
    pub fn clean(code: u16, reason: impl Into<String>) -> Self {
        Self {
            was_clean: true,
            code: Some(code),
            reason: reason.into(),
        }
    }

    /// The transport went away without a closing handshake.
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            was_clean: false,
            code: None,
            reason: reason.into(),
        }
    }
}

/// A message received from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// A text frame; the only kind that carries requests.
    Text(String),
    /// A binary frame; always rejected.
    Binary(Bytes),
    /// The transport is closing.
    Close(CloseInfo),
}

impl InboundFrame {
    /// Create a text frame.
    pub fn text(payload: impl Into<String>) -> Self {
        Self::Text(payload.into())
    }

    /// Create a binary frame (copies data).
    pub fn binary(payload: &[u8]) -> Self {
        Self::Binary(Bytes::copy_from_slice(payload))
    }

    /// Check if this frame ends the connection.
    #[inline]
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }
}
