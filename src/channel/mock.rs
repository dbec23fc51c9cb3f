//! In-memory transport.
//!
//! [`pair`] returns a [`MockTransport`] to hand to a manager and a
//! [`MockServer`] that observes every connection the manager opens. Each
//! accepted [`MockConnection`] exposes what the client wrote and lets the
//! caller push frames, faults, or a close back.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::{sink, stream};
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use super::{Transport, WireMessage, WireSink, WireStream};
use crate::error::ChannelError;

type Inbound = Result<WireMessage, ChannelError>;

pub fn pair() -> (MockTransport, MockServer) {
    let (accepted, connections) = mpsc::unbounded_channel();
    let refusing = Arc::new(AtomicBool::new(false));
    let attempts = Arc::new(AtomicUsize::new(0));
    (
        MockTransport {
            accepted,
            refusing: refusing.clone(),
            attempts: attempts.clone(),
        },
        MockServer {
            connections,
            refusing,
            attempts,
        },
    )
}

#[derive(Debug, Clone)]
pub struct MockTransport {
    accepted: mpsc::UnboundedSender<MockConnection>,
    refusing: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, url: &Url) -> Result<(WireSink, WireStream), ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refusing.load(Ordering::SeqCst) {
            return Err(ChannelError::Connect(format!("{url}: connection refused")));
        }

        let (sent_tx, sent_rx) = mpsc::unbounded_channel::<WireMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();

        let connection = MockConnection {
            url: url.clone(),
            sent: sent_rx,
            inbound: inbound_tx,
        };
        self.accepted
            .send(connection)
            .map_err(|_| ChannelError::Connect(format!("{url}: no server")))?;

        let sink = sink::unfold(sent_tx, |tx, msg: WireMessage| async move {
            tx.send(msg).map_err(|_| ChannelError::Closed)?;
            Ok::<_, ChannelError>(tx)
        });
        let stream = stream::unfold(inbound_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

#[derive(Debug)]
pub struct MockServer {
    connections: mpsc::UnboundedReceiver<MockConnection>,
    refusing: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl MockServer {
    /// Wait for the next connection the client opens.
    pub async fn accept(&mut self) -> Option<MockConnection> {
        self.connections.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MockConnection> {
        self.connections.try_recv().ok()
    }

    /// Make subsequent opens fail with a connect error.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of open attempts, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// Server side of one accepted connection.
#[derive(Debug)]
pub struct MockConnection {
    pub url: Url,
    sent: mpsc::UnboundedReceiver<WireMessage>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl MockConnection {
    /// Next message the client wrote, or `None` once the client side is gone.
    pub async fn next_sent(&mut self) -> Option<WireMessage> {
        self.sent.recv().await
    }

    pub fn try_next_sent(&mut self) -> Option<WireMessage> {
        self.sent.try_recv().ok()
    }

    /// Next text frame the client wrote, parsed as JSON. Skips close frames.
    pub async fn next_json(&mut self) -> Option<Value> {
        while let Some(msg) = self.next_sent().await {
            if let WireMessage::Text(text) = msg {
                return serde_json::from_str(&text).ok();
            }
        }
        None
    }

    pub fn push_text(&self, text: impl Into<String>) {
        let _ = self.inbound.send(Ok(WireMessage::Text(text.into())));
    }

    pub fn push_json(&self, value: &Value) {
        self.push_text(value.to_string());
    }

    pub fn push_fault(&self, err: ChannelError) {
        let _ = self.inbound.send(Err(err));
    }

    /// Close from the server side with the given code.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.inbound.send(Ok(WireMessage::Close {
            code,
            reason: reason.into(),
        }));
    }
}
