//! Handler for the global notification stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::manager::FrameHandler;
use crate::protocol::Notification;

/// Capacity of the fan-out channel. Slow subscribers see `Lagged`.
pub const NOTIFICATION_BUFFER: usize = 64;

/// Parses notification frames and fans them out to subscribers.
///
/// Frames without a string `type` are logged, counted, and dropped; they
/// never reach subscribers and never close the stream.
pub struct NotificationHandler {
    tx: broadcast::Sender<Notification>,
    malformed: Arc<AtomicU64>,
}

impl NotificationHandler {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            tx,
            malformed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn sender(&self) -> broadcast::Sender<Notification> {
        self.tx.clone()
    }

    /// Shared counter of dropped frames.
    pub fn malformed_counter(&self) -> Arc<AtomicU64> {
        self.malformed.clone()
    }
}

impl Default for NotificationHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameHandler for NotificationHandler {
    type Outbound = Value;

    fn on_text(&mut self, text: &str) {
        match Notification::parse(text) {
            Ok(notification) => {
                debug!(kind = %notification.kind, "notification");
                // No receivers is fine; notifications are fire-and-forget.
                let _ = self.tx.send(notification);
            }
            Err(err) => {
                let dropped = self.malformed.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(error = %err, dropped, "dropping malformed notification");
            }
        }
    }
}
