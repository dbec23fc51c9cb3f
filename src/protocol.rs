//! Wire types for the chat and notification streams.
//!
//! Frames travel as JSON text messages. Outbound traffic is a single
//! envelope kind (`message`); inbound traffic is a closed, `type`-tagged set
//! of frames. Anything outside that set is a protocol error.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::FrameError;

/// Path prefix for per-conversation chat streams.
pub const CHAT_PATH: &str = "/ws/chat";

/// Fixed path of the global notification stream.
pub const NOTIFICATIONS_PATH: &str = "/ws/notifications";

// ── Channel identity ────────────────────────────────────────────────────────

/// Key scoping one logical duplex stream.
///
/// At most one physical connection exists per identity at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelIdentity {
    /// Chat stream for one conversation.
    Conversation(String),
    /// The global notification stream.
    Notifications,
}

impl ChannelIdentity {
    pub fn conversation(id: impl Into<String>) -> Self {
        Self::Conversation(id.into())
    }

    /// URL path the identity is addressed by.
    pub fn path(&self) -> String {
        match self {
            Self::Conversation(id) => format!("{CHAT_PATH}/{id}"),
            Self::Notifications => NOTIFICATIONS_PATH.to_string(),
        }
    }

    /// Resolve the full endpoint against a `ws://` / `wss://` base.
    pub fn endpoint(&self, base: &url::Url) -> url::Url {
        let mut path = base.path().trim_end_matches('/').to_string();
        path.push_str(&self.path());
        let mut url = base.clone();
        url.set_path(&path);
        url
    }
}

impl fmt::Display for ChannelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversation(id) => write!(f, "conversation:{id}"),
            Self::Notifications => f.write_str("notifications"),
        }
    }
}

// ── Outbound ────────────────────────────────────────────────────────────────

/// Routing settings attached to every outbound message.
///
/// Captured when the message is enqueued; later changes to the caller's
/// settings never reach an envelope that is already queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingOptions {
    /// Enabled tool servers.
    pub mcp_servers: Vec<String>,
    pub provider: String,
    pub model: String,
    pub thinking_enabled: bool,
    pub rag_enabled: bool,
    pub rag_top_k: u32,
    pub rag_hybrid_search: bool,
}

impl Default for RoutingOptions {
    fn default() -> Self {
        Self {
            mcp_servers: Vec::new(),
            provider: "ollama".to_string(),
            model: "llama3.1".to_string(),
            thinking_enabled: false,
            rag_enabled: false,
            rag_top_k: 5,
            rag_hybrid_search: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EnvelopeKind {
    Message,
}

/// One outbound unit. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    content: String,
    #[serde(flatten)]
    routing: RoutingOptions,
}

impl OutboundEnvelope {
    /// Build a `message` envelope, taking its own copy of `routing`.
    pub fn message(content: impl Into<String>, routing: &RoutingOptions) -> Self {
        Self {
            kind: EnvelopeKind::Message,
            content: content.into(),
            routing: routing.clone(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn routing(&self) -> &RoutingOptions {
        &self.routing
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ── Inbound ─────────────────────────────────────────────────────────────────

/// Identifier of a stored message. The server may use integer or string keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Int(i64),
    Text(String),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageRole {
    User,
    #[default]
    Assistant,
    System,
    Tool,
}

/// A finalized conversation message as stored by the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default)]
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Fields this client does not interpret (metadata, token counts, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: None,
            role,
            content: content.into(),
            created_at: None,
            extra: Map::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Tags of the closed inbound frame set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum FrameTag {
    Chunk,
    Complete,
    ToolCall,
    Warning,
    Error,
}

/// One inbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Partial answer text.
    Chunk { content: String },
    /// Terminal frame carrying the authoritative stored message.
    Complete { message: Message },
    /// The agent invoked a tool.
    ToolCall {
        tool_name: String,
        #[serde(default)]
        tool_args: Value,
    },
    /// Non-fatal notice from the agent.
    Warning {
        warning: String,
        #[serde(default)]
        warning_type: String,
    },
    /// Terminal frame: the exchange failed remotely.
    Error { error: String },
}

impl InboundFrame {
    /// Parse one text frame.
    ///
    /// The tag is checked before the body so that an unknown tag is reported
    /// as [`FrameError::Unrecognized`] rather than as a generic decode error.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(FrameError::MissingTag)?;
        if FrameTag::from_str(tag).is_err() {
            return Err(FrameError::Unrecognized(tag.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn tag(&self) -> FrameTag {
        match self {
            Self::Chunk { .. } => FrameTag::Chunk,
            Self::Complete { .. } => FrameTag::Complete,
            Self::ToolCall { .. } => FrameTag::ToolCall,
            Self::Warning { .. } => FrameTag::Warning,
            Self::Error { .. } => FrameTag::Error,
        }
    }
}

/// A warning surfaced by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub message: String,
    pub warning_type: String,
}

// ── Notifications ───────────────────────────────────────────────────────────

/// A best-effort notification from the global stream.
///
/// The notification vocabulary is open-ended, so only the `type` tag is
/// interpreted; everything else is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Notification {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        if !value.get("type").is_some_and(Value::is_string) {
            return Err(FrameError::MissingTag);
        }
        Ok(serde_json::from_value(value)?)
    }
}
