//! Client-side streaming engine for chat-oriented agents.
//!
//! A [`ChatSession`] owns one conversation's duplex channel: outbound
//! messages wait in a delivery queue while the channel is down, inbound
//! frames drive a [`ConversationState`] that a UI observes through a
//! `watch` receiver, and an explicit disconnect is never mistaken for a
//! failure. A [`NotificationStream`] follows the server's global
//! notification channel and reconnects on its own.

pub mod args;
pub mod arena;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod manager;
pub mod notifications;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod state;
pub mod theme;

pub use arena::ConversationArena;
pub use error::{ChannelError, DeliveryError, FrameError, ManagerStopped};
pub use manager::{ConnectionManager, ManagerConfig, ManagerHandle, ReconnectPolicy};
pub use protocol::{ChannelIdentity, InboundFrame, Message, OutboundEnvelope, RoutingOptions};
pub use queue::{Delivery, Ticket};
pub use session::{ChatSession, NotificationStream};
pub use state::{AgentStatus, ConversationState, Phase};
