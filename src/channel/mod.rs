//! Physical duplex connections.
//!
//! A [`ChannelHandle`] owns exactly one connection. The connection runs in its
//! own task, which performs the handshake, writes queued text, and forwards
//! everything it observes to the owning manager as [`ChannelEvent`]s tagged
//! with the handle's generation. The manager ignores events whose generation
//! is not current, so a torn-down connection can never affect its successor.

pub mod mock;
pub mod ws;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::ChannelError;

/// Close code for a closure this client asked for.
pub const NORMAL_CLOSURE: u16 = 1000;
/// A close frame arrived without a status code.
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// The connection dropped (or never opened) without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// How long a closing connection may take to say goodbye.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Transport-level message, independent of the WebSocket library in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Close { code: u16, reason: String },
}

pub type WireSink = Pin<Box<dyn Sink<WireMessage, Error = ChannelError> + Send>>;
pub type WireStream = Pin<Box<dyn Stream<Item = Result<WireMessage, ChannelError>> + Send>>;

/// Something that can open a duplex connection to a URL.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &Url) -> Result<(WireSink, WireStream), ChannelError>;
}

/// Code and reason reported when a connection ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: ABNORMAL_CLOSURE,
            reason: reason.into(),
        }
    }

    /// Only a normal closure is exempt from reconnection policies.
    pub fn is_normal(&self) -> bool {
        self.code == NORMAL_CLOSURE
    }
}

/// What a connection task reports to its manager.
#[derive(Debug)]
pub enum ChannelEvent {
    Opened,
    Message(String),
    /// Logged only. The `Closed` that follows drives policy.
    Fault(ChannelError),
    Closed(CloseInfo),
}

pub type EventTx = mpsc::UnboundedSender<(u64, ChannelEvent)>;
pub type EventRx = mpsc::UnboundedReceiver<(u64, ChannelEvent)>;

/// Exclusive owner of one physical connection.
pub struct ChannelHandle {
    generation: u64,
    url: Url,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    /// Start opening a connection. Returns immediately; `Opened` or `Closed`
    /// arrives on `events` once the handshake settles.
    pub fn open(transport: Arc<dyn Transport>, url: Url, generation: u64, events: EventTx) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_connection(
            transport,
            url.clone(),
            generation,
            events,
            outbound_rx,
            cancel.clone(),
        ));
        Self {
            generation,
            url,
            outbound,
            cancel,
            task: Some(task),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Hand a text frame to the connection task for writing.
    pub fn send(&self, text: String) -> Result<(), ChannelError> {
        self.outbound.send(text).map_err(|_| ChannelError::Closed)
    }

    /// Close with a normal-closure code and wait (briefly) for the task to end.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(CLOSE_GRACE, task).await.is_err() {
                warn!(url = %self.url, generation = self.generation, "connection did not close in time");
            }
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_connection(
    transport: Arc<dyn Transport>,
    url: Url,
    generation: u64,
    events: EventTx,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let emit = |event: ChannelEvent| {
        let _ = events.send((generation, event));
    };

    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = transport.open(&url) => opened,
    };
    let (mut sink, mut stream) = match opened {
        Ok(pair) => pair,
        Err(err) => {
            let reason = err.to_string();
            emit(ChannelEvent::Fault(err));
            emit(ChannelEvent::Closed(CloseInfo::abnormal(reason)));
            return;
        }
    };
    debug!(%url, generation, "channel open");
    emit(ChannelEvent::Opened);

    let close = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let goodbye = WireMessage::Close {
                    code: NORMAL_CLOSURE,
                    reason: "client closed".to_string(),
                };
                let _ = sink.send(goodbye).await;
                let _ = sink.close().await;
                debug!(%url, generation, "channel closed by client");
                return;
            }
            Some(text) = outbound.recv() => {
                if let Err(err) = sink.send(WireMessage::Text(text)).await {
                    let reason = err.to_string();
                    emit(ChannelEvent::Fault(err));
                    break CloseInfo::abnormal(reason);
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(WireMessage::Text(text))) => emit(ChannelEvent::Message(text)),
                Some(Ok(WireMessage::Close { code, reason })) => break CloseInfo { code, reason },
                Some(Err(err)) => {
                    let reason = err.to_string();
                    emit(ChannelEvent::Fault(err));
                    break CloseInfo::abnormal(reason);
                }
                None => break CloseInfo::abnormal("stream ended"),
            },
        }
    };
    debug!(%url, generation, code = close.code, reason = %close.reason, "channel closed by peer");
    emit(ChannelEvent::Closed(close));
}
