//! Outbound delivery queue.
//!
//! Payloads submitted while the channel is down wait here, in submission
//! order, until the channel opens or their wait window runs out. Every
//! submission gets a [`Delivery`] handle that settles exactly once: settling
//! consumes the pending entry, so a second resolve or reject cannot be
//! expressed.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ChannelError, DeliveryError};

/// Default wait window for a queued payload.
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(10);

type Completion = oneshot::Sender<Result<(), DeliveryError>>;

/// Identifies one submission to a queue. Tickets start at 1.
pub type Ticket = u64;

/// Caller-side completion handle. Resolves to `Ok(())` once the payload is
/// handed to the transport.
#[derive(Debug)]
pub struct Delivery {
    rx: oneshot::Receiver<Result<(), DeliveryError>>,
    ticket: Ticket,
}

impl Delivery {
    /// A handle that is already settled. It never entered a queue, so its
    /// ticket is 0.
    pub fn settled(result: Result<(), DeliveryError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx, ticket: 0 }
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    fn pair(ticket: Ticket) -> (Completion, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx, ticket })
    }
}

impl Future for Delivery {
    type Output = Result<(), DeliveryError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or(Err(DeliveryError::ManagerStopped)))
    }
}

/// A payload waiting for an open channel.
#[derive(Debug)]
struct PendingDelivery {
    ticket: Ticket,
    payload: String,
    completion: Completion,
    deadline: Instant,
}

impl PendingDelivery {
    fn resolve(self) {
        let _ = self.completion.send(Ok(()));
    }

    /// Returns the ticket so callers can tell which submissions failed.
    fn reject(self, err: DeliveryError) -> Ticket {
        let _ = self.completion.send(Err(err));
        self.ticket
    }
}

/// Where the queue hands payloads once a channel is available.
pub trait Outlet {
    fn is_open(&self) -> bool;

    /// Write one payload. An error means the channel is no longer usable and
    /// `is_open` must report `false` afterwards.
    fn deliver(&mut self, payload: &str) -> Result<(), ChannelError>;
}

#[derive(Debug)]
pub struct OutboundDeliveryQueue {
    pending: VecDeque<PendingDelivery>,
    timeout: Duration,
    last_ticket: Ticket,
}

impl Default for OutboundDeliveryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_TIMEOUT)
    }
}

impl OutboundDeliveryQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            timeout,
            last_ticket: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Submit a payload.
    ///
    /// Sent straight through when the outlet is open and nothing older is
    /// still waiting; otherwise buffered behind the entries already queued.
    pub fn enqueue(&mut self, payload: String, now: Instant, outlet: &mut dyn Outlet) -> Delivery {
        self.last_ticket += 1;
        let (completion, delivery) = Delivery::pair(self.last_ticket);
        let entry = PendingDelivery {
            ticket: self.last_ticket,
            payload,
            completion,
            deadline: now + self.timeout,
        };

        if self.pending.is_empty() && outlet.is_open() {
            match outlet.deliver(&entry.payload) {
                Ok(()) => {
                    entry.resolve();
                    return delivery;
                }
                Err(err) => warn!(error = %err, "immediate send failed; queueing"),
            }
        }

        self.pending.push_back(entry);
        debug!(queued = self.pending.len(), "payload queued until channel opens");
        delivery
    }

    /// Drain in FIFO order while the outlet stays open. Returns how many
    /// entries were delivered; anything left waits for the next open.
    pub fn flush(&mut self, outlet: &mut dyn Outlet) -> usize {
        let mut delivered = 0;
        while outlet.is_open() {
            let Some(front) = self.pending.front() else {
                break;
            };
            if let Err(err) = outlet.deliver(&front.payload) {
                warn!(error = %err, remaining = self.pending.len(), "flush interrupted");
                break;
            }
            if let Some(entry) = self.pending.pop_front() {
                entry.resolve();
                delivered += 1;
            }
        }
        if delivered > 0 {
            debug!(delivered, remaining = self.pending.len(), "flushed queued payloads");
        }
        delivered
    }

    /// The error [`expire`](Self::expire) rejects with.
    pub fn timeout_error(&self) -> DeliveryError {
        DeliveryError::Timeout(self.timeout)
    }

    /// Reject and remove every entry whose wait window has elapsed.
    /// Returns the rejected tickets in submission order.
    pub fn expire(&mut self, now: Instant) -> Vec<Ticket> {
        let (expired, kept): (VecDeque<_>, VecDeque<_>) = self
            .pending
            .drain(..)
            .partition(|entry| entry.deadline <= now);
        self.pending = kept;
        let tickets: Vec<Ticket> = expired
            .into_iter()
            .map(|entry| entry.reject(self.timeout_error()))
            .collect();
        if !tickets.is_empty() {
            warn!(expired = tickets.len(), timeout = ?self.timeout, "queued payloads timed out");
        }
        tickets
    }

    /// Reject everything still waiting. Returns the rejected tickets in
    /// submission order.
    pub fn reject_all(&mut self, err: DeliveryError) -> Vec<Ticket> {
        self.pending
            .drain(..)
            .map(|entry| entry.reject(err.clone()))
            .collect()
    }

    /// Earliest instant at which [`expire`](Self::expire) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|entry| entry.deadline).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Outlet that records payloads and can be told to fail after N writes.
    #[derive(Default)]
    struct RecordingOutlet {
        open: bool,
        sent: Vec<String>,
        fail_after: Option<usize>,
    }

    impl Outlet for RecordingOutlet {
        fn is_open(&self) -> bool {
            self.open
        }

        fn deliver(&mut self, payload: &str) -> Result<(), ChannelError> {
            if self.fail_after == Some(self.sent.len()) {
                self.open = false;
                return Err(ChannelError::Closed);
            }
            self.sent.push(payload.to_string());
            Ok(())
        }
    }

    fn queue() -> OutboundDeliveryQueue {
        OutboundDeliveryQueue::new(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_sends_immediately_when_open() {
        let mut q = queue();
        let mut outlet = RecordingOutlet {
            open: true,
            ..Default::default()
        };
        let delivery = q.enqueue("a".into(), Instant::now(), &mut outlet);
        assert!(q.is_empty());
        assert_eq!(outlet.sent, vec!["a"]);
        assert_eq!(delivery.await, Ok(()));
    }

    #[tokio::test]
    async fn test_flushes_in_submission_order() {
        let mut q = queue();
        let mut outlet = RecordingOutlet::default();
        let now = Instant::now();
        let a = q.enqueue("a".into(), now, &mut outlet);
        let b = q.enqueue("b".into(), now, &mut outlet);
        let c = q.enqueue("c".into(), now, &mut outlet);
        assert_eq!(q.len(), 3);

        outlet.open = true;
        assert_eq!(q.flush(&mut outlet), 3);
        assert_eq!(outlet.sent, vec!["a", "b", "c"]);
        assert_eq!(a.await, Ok(()));
        assert_eq!(b.await, Ok(()));
        assert_eq!(c.await, Ok(()));
    }

    #[tokio::test]
    async fn test_new_payload_waits_behind_older_ones_even_when_open() {
        let mut q = queue();
        let mut outlet = RecordingOutlet::default();
        let now = Instant::now();
        let _a = q.enqueue("a".into(), now, &mut outlet);
        outlet.open = true;
        let _b = q.enqueue("b".into(), now, &mut outlet);
        assert!(outlet.sent.is_empty());
        q.flush(&mut outlet);
        assert_eq!(outlet.sent, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_flush_stops_when_channel_drops_mid_way() {
        let mut q = queue();
        let mut outlet = RecordingOutlet::default();
        let now = Instant::now();
        let a = q.enqueue("a".into(), now, &mut outlet);
        let _b = q.enqueue("b".into(), now, &mut outlet);
        let _c = q.enqueue("c".into(), now, &mut outlet);

        outlet.open = true;
        outlet.fail_after = Some(1);
        assert_eq!(q.flush(&mut outlet), 1);
        assert_eq!(q.len(), 2);
        assert_eq!(a.await, Ok(()));

        outlet.open = true;
        outlet.fail_after = None;
        assert_eq!(q.flush(&mut outlet), 2);
        assert_eq!(outlet.sent, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_expired_entries_are_rejected_and_removed() {
        let mut q = queue();
        let mut outlet = RecordingOutlet::default();
        let start = Instant::now();
        let early = q.enqueue("early".into(), start, &mut outlet);
        let late = q.enqueue("late".into(), start + Duration::from_secs(5), &mut outlet);
        assert_eq!(q.next_deadline(), Some(start + Duration::from_secs(10)));

        assert_eq!(q.expire(start + Duration::from_secs(10)), vec![early.ticket()]);
        assert_eq!(
            early.await,
            Err(DeliveryError::Timeout(Duration::from_secs(10)))
        );

        outlet.open = true;
        q.flush(&mut outlet);
        assert_eq!(outlet.sent, vec!["late"]);
        assert_eq!(late.await, Ok(()));
    }

    #[tokio::test]
    async fn test_reject_all_settles_everything_once() {
        let mut q = queue();
        let mut outlet = RecordingOutlet::default();
        let now = Instant::now();
        let a = q.enqueue("a".into(), now, &mut outlet);
        let b = q.enqueue("b".into(), now, &mut outlet);
        assert_eq!(
            q.reject_all(DeliveryError::ChannelClosed),
            vec![a.ticket(), b.ticket()]
        );
        assert!(q.expire(now + Duration::from_secs(60)).is_empty());
        assert_eq!(a.await, Err(DeliveryError::ChannelClosed));
        assert_eq!(b.await, Err(DeliveryError::ChannelClosed));
    }

    #[test]
    fn test_tickets_are_unique_per_submission() {
        let mut q = queue();
        let mut outlet = RecordingOutlet {
            open: true,
            ..Default::default()
        };
        let now = Instant::now();
        let sent = q.enqueue("a".into(), now, &mut outlet);
        outlet.open = false;
        let queued = q.enqueue("b".into(), now, &mut outlet);
        assert_eq!(sent.ticket(), 1);
        assert_eq!(queued.ticket(), 2);
        assert_eq!(Delivery::settled(Ok(())).ticket(), 0);
    }

    #[tokio::test]
    async fn test_dropped_queue_reports_manager_stopped() {
        let mut q = queue();
        let mut outlet = RecordingOutlet::default();
        let delivery = q.enqueue("a".into(), Instant::now(), &mut outlet);
        drop(q);
        assert_eq!(delivery.await, Err(DeliveryError::ManagerStopped));
    }
}
