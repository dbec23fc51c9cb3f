//! Consumer-facing facades over a connection manager.
//!
//! [`ChatSession`] is one conversation's chat stream: manual reconnect, a
//! dispatcher that owns the conversation state, and mutable routing options
//! that are snapshotted into each envelope. [`NotificationStream`] is the
//! global best-effort stream with automatic reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, watch};
use url::Url;

use crate::channel::Transport;
use crate::dispatcher::InboundFrameDispatcher;
use crate::error::ManagerStopped;
use crate::manager::{ConnectionManager, ManagerConfig, ManagerHandle, ReconnectPolicy};
use crate::notifications::NotificationHandler;
use crate::protocol::{ChannelIdentity, Notification, OutboundEnvelope, RoutingOptions};
use crate::queue::Delivery;
use crate::state::ConversationState;

pub struct ChatSession {
    handle: ManagerHandle<OutboundEnvelope>,
    state: watch::Receiver<ConversationState>,
    routing: RoutingOptions,
}

impl ChatSession {
    /// Spawn a disconnected chat manager. The chat stream never reconnects
    /// on its own, whatever `config.policy` says.
    pub fn spawn(config: ManagerConfig, transport: Arc<dyn Transport>) -> Self {
        let config = ManagerConfig {
            policy: ReconnectPolicy::Manual,
            ..config
        };
        let (state_tx, state) = ConversationState::channel();
        let handle = ConnectionManager::spawn(
            config,
            transport,
            InboundFrameDispatcher::new(state_tx),
        );
        Self {
            handle,
            state,
            routing: RoutingOptions::default(),
        }
    }

    /// Spawn and connect to `conversation_id` in one step.
    pub async fn open(
        conversation_id: impl Into<String>,
        config: ManagerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ManagerStopped> {
        let session = Self::spawn(config, transport);
        session.connect(conversation_id).await?;
        Ok(session)
    }

    /// Switch to another conversation. The previous connection is closed
    /// normally first; the conversation state is kept.
    pub async fn connect(&self, conversation_id: impl Into<String>) -> Result<(), ManagerStopped> {
        self.handle
            .connect(ChannelIdentity::conversation(conversation_id))
            .await
    }

    pub async fn reconnect(&self) -> Result<(), ManagerStopped> {
        self.handle.reconnect().await
    }

    pub async fn disconnect(&self) -> Result<(), ManagerStopped> {
        self.handle.disconnect().await
    }

    pub async fn shutdown(&self) -> Result<(), ManagerStopped> {
        self.handle.shutdown().await
    }

    /// Submit a user message with the current routing options.
    ///
    /// The returned [`Delivery`] settles once the envelope is written or
    /// rejected; the reply itself shows up in [`state`](Self::state).
    pub async fn send_message(&self, content: impl Into<String>) -> Delivery {
        let envelope = OutboundEnvelope::message(content, &self.routing);
        self.handle.send(envelope).await
    }

    pub fn routing(&self) -> &RoutingOptions {
        &self.routing
    }

    /// Applies to messages sent from now on; queued envelopes keep the
    /// options they were built with.
    pub fn set_routing(&mut self, routing: RoutingOptions) {
        self.routing = routing;
    }

    pub fn routing_mut(&mut self) -> &mut RoutingOptions {
        &mut self.routing
    }

    pub fn state(&self) -> watch::Receiver<ConversationState> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> ConversationState {
        self.state.borrow().clone()
    }

    pub fn conversation_id(&self) -> Option<String> {
        match self.handle.identity() {
            Some(ChannelIdentity::Conversation(id)) => Some(id),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.handle.connected()
    }

    pub fn handle(&self) -> &ManagerHandle<OutboundEnvelope> {
        &self.handle
    }
}

pub struct NotificationStream {
    handle: ManagerHandle<Value>,
    tx: broadcast::Sender<Notification>,
    malformed: Arc<AtomicU64>,
}

impl NotificationStream {
    /// Spawn a disconnected notification manager that retries after
    /// `reconnect_delay` whenever the server drops it.
    pub fn spawn(
        base_url: Url,
        reconnect_delay: Duration,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let config = ManagerConfig::new(
            base_url,
            ReconnectPolicy::Auto {
                delay: reconnect_delay,
            },
        );
        let handler = NotificationHandler::new();
        let tx = handler.sender();
        let malformed = handler.malformed_counter();
        Self {
            handle: ConnectionManager::spawn(config, transport, handler),
            tx,
            malformed,
        }
    }

    pub async fn connect(&self) -> Result<(), ManagerStopped> {
        self.handle.connect(ChannelIdentity::Notifications).await
    }

    pub async fn disconnect(&self) -> Result<(), ManagerStopped> {
        self.handle.disconnect().await
    }

    pub async fn shutdown(&self) -> Result<(), ManagerStopped> {
        self.handle.shutdown().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Frames dropped because they carried no `type`.
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    pub fn handle(&self) -> &ManagerHandle<Value> {
        &self.handle
    }
}
