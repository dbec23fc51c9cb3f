//! Inbound frame dispatcher for chat streams.
//!
//! Turns each parsed frame into exactly one mutation of the conversation
//! state. It is the only writer of that state.

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{DeliveryError, FrameError};
use crate::manager::FrameHandler;
use crate::protocol::{FrameTag, InboundFrame, Message, MessageRole, OutboundEnvelope, Warning};
use crate::state::ConversationState;

/// Error recorded when the stall watchdog gives up on an exchange.
pub const STALLED_ERROR: &str = "exchange stalled: no response from agent";

pub struct InboundFrameDispatcher {
    state: watch::Sender<ConversationState>,
}

impl InboundFrameDispatcher {
    pub fn new(state: watch::Sender<ConversationState>) -> Self {
        Self { state }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.state.subscribe()
    }

    /// Start a new exchange: record the user's message, clear the buffer
    /// before any reply can arrive, and show activity immediately.
    pub fn begin_exchange(&mut self, content: &str) {
        self.state.send_modify(|state| {
            state.messages.push(Message::new(MessageRole::User, content));
            state.streaming.clear();
            state.last_error = None;
            state.status.begin();
        });
    }

    /// Parse and route one text frame.
    pub fn dispatch_text(&mut self, text: &str) -> Result<FrameTag, FrameError> {
        match InboundFrame::parse(text) {
            Ok(frame) => {
                let tag = frame.tag();
                self.dispatch(frame);
                Ok(tag)
            }
            Err(err) => {
                warn!(error = %err, frame = %truncate(text, 200), "unroutable frame");
                let fault = err.to_string();
                self.state.send_modify(|state| {
                    state.protocol_faults += 1;
                    state.last_fault = Some(fault);
                });
                Err(err)
            }
        }
    }

    /// Route one frame to its state mutation.
    pub fn dispatch(&mut self, frame: InboundFrame) {
        debug!(tag = %frame.tag(), "dispatch");
        self.state.send_modify(|state| match frame {
            InboundFrame::Chunk { content } => {
                state.status.chunk();
                state.streaming.push(&content);
            }
            InboundFrame::Complete { message } => {
                state.messages.push(message);
                state.streaming.clear();
                state.status.finish(FrameTag::Complete);
            }
            InboundFrame::ToolCall {
                tool_name,
                tool_args,
            } => {
                state.status.tool_call(tool_name, tool_args);
            }
            InboundFrame::Warning {
                warning,
                warning_type,
            } => {
                state.last_warning = Some(Warning {
                    message: warning,
                    warning_type,
                });
            }
            InboundFrame::Error { error } => {
                state.streaming.clear();
                state.status.finish(FrameTag::Error);
                state.last_error = Some(error);
            }
        });
    }

    /// Abandon the active exchange as if the agent had reported an error.
    pub fn stall(&mut self) {
        self.fail_exchange(STALLED_ERROR.to_string());
    }

    /// The message that started the active exchange was never sent.
    pub fn reject(&mut self, err: &DeliveryError) {
        self.fail_exchange(err.to_string());
    }

    fn fail_exchange(&mut self, error: String) {
        self.state.send_modify(|state| {
            if state.status.is_active {
                state.streaming.clear();
                state.status.finish(FrameTag::Error);
                state.last_error = Some(error);
            }
        });
    }
}

impl FrameHandler for InboundFrameDispatcher {
    type Outbound = OutboundEnvelope;

    fn on_text(&mut self, text: &str) {
        let _ = self.dispatch_text(text);
    }

    fn on_enqueue(&mut self, envelope: &OutboundEnvelope) {
        self.begin_exchange(envelope.content());
    }

    fn exchange_active(&self) -> bool {
        self.state.borrow().status.is_active
    }

    fn on_stall(&mut self) {
        self.stall();
    }

    fn on_rejected(&mut self, err: &DeliveryError) {
        self.reject(err);
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
