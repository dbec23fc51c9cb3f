//! Conversation-level state observed by the UI.
//!
//! Only the dispatcher writes this state; everything else reads it through a
//! `watch` receiver. It lives outside any single connection, so a reconnect
//! keeps whatever the user has already seen.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::protocol::{FrameTag, Message, Warning};

/// Stage of the agent within one exchange, inferred from frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Thinking,
    ToolCalling,
    Generating,
}

impl Phase {
    /// Transition on a new outbound send.
    pub fn on_send(self) -> Phase {
        Phase::Thinking
    }

    /// Transition on an inbound frame.
    ///
    /// Exhaustive over [`FrameTag`]: a new frame kind does not compile until
    /// it gets a rule here.
    pub fn on_frame(self, tag: FrameTag) -> Phase {
        match tag {
            FrameTag::ToolCall => Phase::ToolCalling,
            // Text after a tool call means the tool phase is over.
            FrameTag::Chunk => match self {
                Phase::ToolCalling => Phase::Generating,
                other => other,
            },
            FrameTag::Complete | FrameTag::Error => Phase::Idle,
            FrameTag::Warning => self,
        }
    }
}

/// Live agent indicator.
///
/// `tool_name` is only ever set while `phase` is [`Phase::ToolCalling`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentStatus {
    pub is_active: bool,
    pub phase: Phase,
    pub tool_name: Option<String>,
    pub tool_args: Option<Value>,
}

impl AgentStatus {
    pub fn begin(&mut self) {
        self.is_active = true;
        self.phase = self.phase.on_send();
        self.clear_tool();
    }

    pub fn tool_call(&mut self, name: String, args: Value) {
        self.phase = self.phase.on_frame(FrameTag::ToolCall);
        self.tool_name = Some(name);
        self.tool_args = Some(args);
    }

    pub fn chunk(&mut self) {
        self.phase = self.phase.on_frame(FrameTag::Chunk);
        self.clear_tool();
    }

    /// `complete` or `error`.
    pub fn finish(&mut self, tag: FrameTag) {
        self.is_active = false;
        self.phase = self.phase.on_frame(tag);
        self.clear_tool();
    }

    fn clear_tool(&mut self) {
        self.tool_name = None;
        self.tool_args = None;
    }
}

/// Concatenated `chunk` text of the exchange in flight. Display only; the
/// stored message always comes from the `complete` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingBuffer(String);

impl StreamingBuffer {
    pub fn push(&mut self, text: &str) {
        self.0.push_str(text);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Everything a UI needs to render one conversation.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    pub status: AgentStatus,
    pub streaming: StreamingBuffer,
    pub messages: Vec<Message>,
    pub last_warning: Option<Warning>,
    pub last_error: Option<String>,
    /// Frames that could not be routed (unknown tag, bad body).
    pub protocol_faults: u64,
    pub last_fault: Option<String>,
}

impl ConversationState {
    /// Create the single-writer / multi-reader cell for one conversation.
    pub fn channel() -> (watch::Sender<Self>, watch::Receiver<Self>) {
        watch::channel(Self::default())
    }
}
