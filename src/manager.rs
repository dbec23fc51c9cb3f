//! Connection lifecycle for one logical stream.
//!
//! A [`ConnectionManager`] runs as its own task and is the only code that
//! touches its [`ChannelHandle`], delivery queue, and frame handler. Callers
//! drive it through a cloneable [`ManagerHandle`]. Because every mutation
//! happens inside one `select!` loop, none of that state needs a lock.
//!
//! Two things vary between streams: the [`ReconnectPolicy`] applied when the
//! peer closes unexpectedly, and the [`FrameHandler`] that interprets inbound
//! text.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::channel::{ChannelEvent, ChannelHandle, CloseInfo, EventRx, EventTx, Transport};
use crate::error::{ChannelError, DeliveryError, ManagerStopped};
use crate::protocol::ChannelIdentity;
use crate::queue::{DEFAULT_QUEUE_TIMEOUT, Delivery, OutboundDeliveryQueue, Outlet, Ticket};

/// Default delay before an automatic reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// What to do when the peer closes with anything but a normal closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Stay disconnected until the caller reconnects.
    Manual,
    /// Schedule one reconnect attempt after `delay`.
    Auto { delay: Duration },
}

impl ReconnectPolicy {
    pub fn auto() -> Self {
        Self::Auto {
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    fn retry_delay(&self, close: &CloseInfo) -> Option<Duration> {
        match self {
            _ if close.is_normal() => None,
            Self::Manual => None,
            Self::Auto { delay } => Some(*delay),
        }
    }
}

/// Static settings for one manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Base `ws://` / `wss://` URL; identities append their own path.
    pub base_url: Url,
    pub policy: ReconnectPolicy,
    pub queue_timeout: Duration,
    /// Give up on an exchange that has been silent this long. `None` waits
    /// forever.
    pub stall_timeout: Option<Duration>,
}

impl ManagerConfig {
    pub fn new(base_url: Url, policy: ReconnectPolicy) -> Self {
        Self {
            base_url,
            policy,
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
            stall_timeout: None,
        }
    }
}

/// Interprets the inbound side of one stream.
pub trait FrameHandler: Send + 'static {
    /// Item type callers submit through [`ManagerHandle::send`].
    type Outbound: Serialize + Send + 'static;

    /// One inbound text frame, in arrival order.
    fn on_text(&mut self, text: &str);

    /// Called when an item is accepted for delivery, before it is sent.
    fn on_enqueue(&mut self, _item: &Self::Outbound) {}

    /// Whether an exchange is waiting on the remote side.
    fn exchange_active(&self) -> bool {
        false
    }

    /// The active exchange has been silent for the configured stall timeout.
    fn on_stall(&mut self) {}

    /// The item that started the active exchange was rejected before it
    /// reached the peer, so no reply will ever arrive for it.
    fn on_rejected(&mut self, _err: &DeliveryError) {}
}

enum Command<O> {
    Connect {
        identity: ChannelIdentity,
        ack: oneshot::Sender<()>,
    },
    Reconnect {
        ack: oneshot::Sender<()>,
    },
    Disconnect {
        ack: oneshot::Sender<()>,
    },
    Send {
        item: O,
        completion: oneshot::Sender<Delivery>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Caller-side handle to a running manager.
pub struct ManagerHandle<O> {
    commands: mpsc::UnboundedSender<Command<O>>,
    connected: watch::Receiver<bool>,
    identity: watch::Receiver<Option<ChannelIdentity>>,
}

impl<O> Clone for ManagerHandle<O> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            connected: self.connected.clone(),
            identity: self.identity.clone(),
        }
    }
}

impl<O: Send + 'static> ManagerHandle<O> {
    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<()>) -> Command<O>,
    ) -> Result<(), ManagerStopped> {
        let (ack, done) = oneshot::channel();
        self.commands.send(build(ack)).map_err(|_| ManagerStopped)?;
        done.await.map_err(|_| ManagerStopped)
    }

    /// Replace any current connection with a new one for `identity`.
    ///
    /// Returns once the previous connection is torn down and the new one is
    /// being opened; watch [`connected`](Self::connected) for the outcome.
    pub async fn connect(&self, identity: ChannelIdentity) -> Result<(), ManagerStopped> {
        self.request(|ack| Command::Connect { identity, ack }).await
    }

    /// `connect` with the last identity used.
    pub async fn reconnect(&self) -> Result<(), ManagerStopped> {
        self.request(|ack| Command::Reconnect { ack }).await
    }

    /// Close normally and reject everything still queued. Never retried.
    pub async fn disconnect(&self) -> Result<(), ManagerStopped> {
        self.request(|ack| Command::Disconnect { ack }).await
    }

    /// Disconnect and stop the manager task.
    pub async fn shutdown(&self) -> Result<(), ManagerStopped> {
        self.request(|ack| Command::Shutdown { ack }).await
    }

    /// Submit an item for delivery.
    pub async fn send(&self, item: O) -> Delivery {
        let (completion, accepted) = oneshot::channel();
        if self.commands.send(Command::Send { item, completion }).is_err() {
            return Delivery::settled(Err(DeliveryError::ManagerStopped));
        }
        accepted
            .await
            .unwrap_or_else(|_| Delivery::settled(Err(DeliveryError::ManagerStopped)))
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Wait until the connected flag equals `want`.
    pub async fn wait_connected(&self, want: bool) -> Result<(), ManagerStopped> {
        let mut rx = self.connected.clone();
        rx.wait_for(|connected| *connected == want)
            .await
            .map(|_| ())
            .map_err(|_| ManagerStopped)
    }

    pub fn identity(&self) -> Option<ChannelIdentity> {
        self.identity.borrow().clone()
    }
}

/// The currently owned connection, seen as a delivery outlet.
struct Link<'a> {
    channel: &'a Option<ChannelHandle>,
    open: &'a mut bool,
}

impl Outlet for Link<'_> {
    fn is_open(&self) -> bool {
        *self.open && self.channel.is_some()
    }

    fn deliver(&mut self, payload: &str) -> Result<(), ChannelError> {
        let result = match self.channel {
            Some(channel) => channel.send(payload.to_string()),
            None => Err(ChannelError::Closed),
        };
        if result.is_err() {
            *self.open = false;
        }
        result
    }
}

enum Wake<O> {
    Command(Option<Command<O>>),
    Channel(u64, ChannelEvent),
    QueueDeadline,
    ReconnectDue,
    Stalled,
}

pub struct ConnectionManager<H: FrameHandler> {
    config: ManagerConfig,
    transport: Arc<dyn Transport>,
    handler: H,
    commands: mpsc::UnboundedReceiver<Command<H::Outbound>>,
    events_tx: EventTx,
    events_rx: EventRx,
    channel: Option<ChannelHandle>,
    open: bool,
    generation: u64,
    identity: Option<ChannelIdentity>,
    queue: OutboundDeliveryQueue,
    /// Ticket of the item that started the handler's current exchange.
    exchange: Option<Ticket>,
    reconnect_at: Option<Instant>,
    stall_at: Option<Instant>,
    connected_tx: watch::Sender<bool>,
    identity_tx: watch::Sender<Option<ChannelIdentity>>,
}

impl<H: FrameHandler> ConnectionManager<H> {
    /// Start a manager task. It stays disconnected until `connect` is called.
    pub fn spawn(
        config: ManagerConfig,
        transport: Arc<dyn Transport>,
        handler: H,
    ) -> ManagerHandle<H::Outbound> {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected) = watch::channel(false);
        let (identity_tx, identity) = watch::channel(None);

        let manager = Self {
            queue: OutboundDeliveryQueue::new(config.queue_timeout),
            config,
            transport,
            handler,
            commands,
            events_tx,
            events_rx,
            channel: None,
            open: false,
            generation: 0,
            identity: None,
            exchange: None,
            reconnect_at: None,
            stall_at: None,
            connected_tx,
            identity_tx,
        };
        tokio::spawn(manager.run());

        ManagerHandle {
            commands: commands_tx,
            connected,
            identity,
        }
    }

    async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                cmd = self.commands.recv() => Wake::Command(cmd),
                Some((generation, event)) = self.events_rx.recv() => Wake::Channel(generation, event),
                _ = sleep_until(self.queue.next_deadline()) => Wake::QueueDeadline,
                _ = sleep_until(self.reconnect_at) => Wake::ReconnectDue,
                _ = sleep_until(self.stall_at) => Wake::Stalled,
            };

            match wake {
                Wake::Command(Some(cmd)) => {
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
                Wake::Command(None) => {
                    self.teardown().await;
                    break;
                }
                Wake::Channel(generation, event) => self.handle_event(generation, event),
                Wake::QueueDeadline => {
                    let expired = self.queue.expire(Instant::now());
                    let err = self.queue.timeout_error();
                    self.abandon_exchange(&expired, &err);
                }
                Wake::ReconnectDue => {
                    self.reconnect_at = None;
                    info!(identity = ?self.identity, "automatic reconnect");
                    self.reconnect().await;
                }
                Wake::Stalled => {
                    warn!(identity = ?self.identity, "exchange stalled");
                    self.handler.on_stall();
                    self.rearm_stall();
                }
            }
        }
        debug!(identity = ?self.identity, "connection manager stopped");
    }

    /// Returns `false` once the manager should stop.
    async fn handle_command(&mut self, cmd: Command<H::Outbound>) -> bool {
        match cmd {
            Command::Connect { identity, ack } => {
                self.connect(identity).await;
                let _ = ack.send(());
            }
            Command::Reconnect { ack } => {
                self.reconnect().await;
                let _ = ack.send(());
            }
            Command::Disconnect { ack } => {
                self.teardown().await;
                let _ = ack.send(());
            }
            Command::Send { item, completion } => {
                let delivery = self.enqueue(item);
                let _ = completion.send(delivery);
            }
            Command::Shutdown { ack } => {
                self.teardown().await;
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    fn enqueue(&mut self, item: H::Outbound) -> Delivery {
        let payload = match serde_json::to_string(&item) {
            Ok(payload) => payload,
            Err(err) => return Delivery::settled(Err(DeliveryError::Encode(err.to_string()))),
        };
        self.handler.on_enqueue(&item);
        self.rearm_stall();

        let mut link = Link {
            channel: &self.channel,
            open: &mut self.open,
        };
        let delivery = self.queue.enqueue(payload, Instant::now(), &mut link);
        self.exchange = Some(delivery.ticket());
        self.publish_connected();
        delivery
    }

    /// Tell the handler when `rejected` includes the exchange's own item.
    fn abandon_exchange(&mut self, rejected: &[Ticket], err: &DeliveryError) {
        let Some(ticket) = self.exchange else {
            return;
        };
        if rejected.contains(&ticket) {
            debug!(identity = ?self.identity, ticket, error = %err, "exchange abandoned");
            self.exchange = None;
            self.handler.on_rejected(err);
            self.rearm_stall();
        }
    }

    async fn connect(&mut self, identity: ChannelIdentity) {
        self.reconnect_at = None;
        self.close_channel().await;

        self.generation += 1;
        let url = identity.endpoint(&self.config.base_url);
        info!(%identity, %url, generation = self.generation, "connecting");
        self.channel = Some(ChannelHandle::open(
            self.transport.clone(),
            url,
            self.generation,
            self.events_tx.clone(),
        ));
        self.identity = Some(identity.clone());
        self.identity_tx.send_replace(Some(identity));
    }

    async fn reconnect(&mut self) {
        match self.identity.clone() {
            Some(identity) => self.connect(identity).await,
            None => warn!("reconnect requested before any connect"),
        }
    }

    /// Explicit disconnect: terminal, not a failure.
    async fn teardown(&mut self) {
        self.reconnect_at = None;
        self.close_channel().await;
        let err = DeliveryError::ChannelClosed;
        let rejected = self.queue.reject_all(err.clone());
        if !rejected.is_empty() {
            info!(
                identity = ?self.identity,
                rejected = rejected.len(),
                "rejected queued payloads on disconnect"
            );
            self.abandon_exchange(&rejected, &err);
        }
    }

    async fn close_channel(&mut self) {
        self.open = false;
        self.publish_connected();
        if let Some(channel) = self.channel.take() {
            debug!(generation = channel.generation(), "closing channel");
            channel.close().await;
        }
    }

    fn handle_event(&mut self, generation: u64, event: ChannelEvent) {
        if generation != self.generation || self.channel.is_none() {
            debug!(generation, current = self.generation, "dropping event from stale channel");
            return;
        }

        match event {
            ChannelEvent::Opened => {
                info!(identity = ?self.identity, generation, "connected");
                self.open = true;
                self.publish_connected();
                let mut link = Link {
                    channel: &self.channel,
                    open: &mut self.open,
                };
                self.queue.flush(&mut link);
                self.publish_connected();
            }
            ChannelEvent::Message(text) => {
                self.handler.on_text(&text);
                self.rearm_stall();
            }
            ChannelEvent::Fault(err) => {
                warn!(identity = ?self.identity, generation, error = %err, "transport fault");
            }
            ChannelEvent::Closed(close) => {
                self.open = false;
                self.channel = None;
                self.publish_connected();
                match self.config.policy.retry_delay(&close) {
                    Some(delay) => {
                        info!(
                            identity = ?self.identity,
                            code = close.code,
                            reason = %close.reason,
                            ?delay,
                            "connection lost; reconnect scheduled"
                        );
                        self.reconnect_at = Some(Instant::now() + delay);
                    }
                    None => info!(
                        identity = ?self.identity,
                        code = close.code,
                        reason = %close.reason,
                        queued = self.queue.len(),
                        "connection closed"
                    ),
                }
            }
        }
    }

    fn rearm_stall(&mut self) {
        self.stall_at = match self.config.stall_timeout {
            Some(timeout) if self.handler.exchange_active() => Some(Instant::now() + timeout),
            _ => None,
        };
    }

    fn publish_connected(&self) {
        let connected = self.open && self.channel.is_some();
        self.connected_tx.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
