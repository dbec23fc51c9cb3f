//! Error taxonomy for the streaming engine.
//!
//! Queue-level failures come back to the caller through a [`Delivery`]
//! rejection. Remote `error` frames are not errors at this level: they are
//! recorded in the conversation state the UI already observes.
//!
//! [`Delivery`]: crate::queue::Delivery

use std::time::Duration;

/// Why a queued outbound payload was not delivered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// No open channel appeared within the wait window.
    #[error("no open channel within {0:?}; message not sent")]
    Timeout(Duration),
    /// `disconnect()` tore the channel down while the payload was queued.
    #[error("channel disconnected before the message was sent")]
    ChannelClosed,
    /// The owning manager task is gone.
    #[error("connection manager has stopped")]
    ManagerStopped,
    /// The item could not be serialised for the wire.
    #[error("could not encode message: {0}")]
    Encode(String),
}

impl DeliveryError {
    /// Whether resubmitting the same envelope later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// A command was sent to a manager task that is no longer running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection manager has stopped")]
pub struct ManagerStopped;

/// Faults raised by a physical duplex connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("channel closed")]
    Closed,
}

/// An inbound frame that could not be routed.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The `type` tag is outside the closed frame set.
    #[error("unrecognized frame type `{0}`")]
    Unrecognized(String),
    /// The frame carries no string `type` tag at all.
    #[error("frame has no `type` tag")]
    MissingTag,
    /// The tag is known but the body does not match it.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}
