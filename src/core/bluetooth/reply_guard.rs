//! Exactly-once completion gate for outstanding requests.
//!
//! Driver stacks may fire a completion callback more than once for the same
//! request. Every request therefore gets a [`Ticket`]: the first `complete`
//! flips it from pending to completed with a single compare-and-set and is
//! the only result that ever reaches the waiting [`PendingReply`]. Later calls
//! lose the race, get `false`, and leave nothing behind except a diagnostic
//! [`IgnoredCompletion`] record.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::core::bluetooth::events::{EventBus, LinkEvent};
use crate::error::{LinkError, Result};

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const IGNORED: u8 = 2;

/// Lifecycle of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    Pending,
    Completed,
    /// Abandoned before any result arrived; later results are ignored.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoredReason {
    /// A result had already been delivered.
    Duplicate,
    /// The ticket was abandoned before the result arrived.
    Abandoned,
}

/// Diagnostic record of a completion that was dropped by the gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IgnoredCompletion {
    pub request: String,
    /// Monotonic across every ticket created by the same guard.
    pub sequence: u64,
    pub reason: IgnoredReason,
    pub at: DateTime<Utc>,
}

struct Diagnostics {
    sequence: AtomicU64,
    capacity: usize,
    ignored: Mutex<VecDeque<IgnoredCompletion>>,
    bus: Option<EventBus>,
}

impl Diagnostics {
    fn record(&self, request: &str, reason: IgnoredReason) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            "Ignoring {:?} completion #{} for request `{}`",
            reason, sequence, request
        );
        let entry = IgnoredCompletion {
            request: request.to_string(),
            sequence,
            reason,
            at: Utc::now(),
        };

        {
            let mut ignored = self.ignored.lock().unwrap_or_else(PoisonError::into_inner);
            if ignored.len() == self.capacity {
                ignored.pop_front();
            }
            ignored.push_back(entry.clone());
        }

        if let Some(bus) = &self.bus {
            bus.publish(LinkEvent::DuplicateIgnored(entry));
        }
    }
}

struct TicketInner<T> {
    request: String,
    state: AtomicU8,
    // Only the compare-and-set winner ever takes the sender, so this lock is
    // never contended.
    sender: Mutex<Option<oneshot::Sender<T>>>,
    diagnostics: Arc<Diagnostics>,
}

impl<T> TicketInner<T> {
    fn take_sender(&self) -> Option<oneshot::Sender<T>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn state(&self) -> TicketState {
        match self.state.load(Ordering::Acquire) {
            PENDING => TicketState::Pending,
            COMPLETED => TicketState::Completed,
            _ => TicketState::Ignored,
        }
    }
}

/// Type-erased view of a ticket used by sessions to abandon what they track
/// without owning it.
pub(crate) trait Outstanding: Send + Sync {
    fn request(&self) -> &str;
    fn is_pending(&self) -> bool;
    fn abandon(&self) -> bool;
}

impl<T: Send> Outstanding for TicketInner<T> {
    fn request(&self) -> &str {
        &self.request
    }

    fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    fn abandon(&self) -> bool {
        if self
            .state
            .compare_exchange(PENDING, IGNORED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // Dropping the sender wakes the waiting caller with an abandonment.
        drop(self.take_sender());
        debug!("Abandoned pending request `{}`", self.request);
        true
    }
}

/// One-shot completion handle for a single outstanding request.
///
/// Cheap to clone; every clone refers to the same gate. Hand clones to
/// whatever callback may report the result, as many times as it likes.
pub struct Ticket<T> {
    inner: Arc<TicketInner<T>>,
}

impl<T> Clone for Ticket<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Ticket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("request", &self.inner.request)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl<T: Send + 'static> Ticket<T> {
    /// Logical name of the originating request.
    pub fn request(&self) -> &str {
        &self.inner.request
    }

    /// Offers a result. Returns `true` only for the call whose result is
    /// delivered; every other call is recorded and dropped.
    ///
    /// An "empty" result (e.g. `None`) is a legal value and is delivered like
    /// any other.
    pub fn complete(&self, result: T) -> bool {
        match self.inner.state.compare_exchange(
            PENDING,
            COMPLETED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                if let Some(sender) = self.inner.take_sender() {
                    if sender.send(result).is_err() {
                        debug!(
                            "Caller of `{}` stopped waiting before the reply arrived",
                            self.inner.request
                        );
                    }
                }
                true
            }
            Err(IGNORED) => {
                self.inner
                    .diagnostics
                    .record(&self.inner.request, IgnoredReason::Abandoned);
                false
            }
            Err(_) => {
                self.inner
                    .diagnostics
                    .record(&self.inner.request, IgnoredReason::Duplicate);
                false
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        self.inner.state() == TicketState::Completed
    }

    pub fn state(&self) -> TicketState {
        self.inner.state()
    }

    /// Gives up on the request. Returns `false` if a result already won.
    pub fn abandon(&self) -> bool {
        self.inner.abandon()
    }

    pub(crate) fn downgrade(&self) -> Weak<dyn Outstanding> {
        let weak: Weak<TicketInner<T>> = Arc::downgrade(&self.inner);
        weak
    }
}

/// The caller's side of a ticket: resolves with the single delivered result.
#[derive(Debug)]
pub struct PendingReply<T> {
    request: String,
    receiver: oneshot::Receiver<T>,
}

impl<T> PendingReply<T> {
    pub fn request(&self) -> &str {
        &self.request
    }

    /// Waits for the delivered result, or `CommandAbandoned` if the ticket was
    /// abandoned or every handle to it was dropped.
    pub async fn wait(self) -> Result<T> {
        let request = self.request;
        self.receiver
            .await
            .map_err(|_| LinkError::CommandAbandoned { request })
    }
}

/// Factory for tickets sharing one diagnostic log.
#[derive(Clone)]
pub struct ReplyGuard {
    diagnostics: Arc<Diagnostics>,
}

impl ReplyGuard {
    /// Creates a guard keeping at most `capacity` ignored-completion records.
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, None)
    }

    /// Same as [`ReplyGuard::new`], also publishing every ignored completion.
    pub fn with_bus(capacity: usize, bus: EventBus) -> Self {
        Self::build(capacity, Some(bus))
    }

    fn build(capacity: usize, bus: Option<EventBus>) -> Self {
        let capacity = capacity.max(1);
        Self {
            diagnostics: Arc::new(Diagnostics {
                sequence: AtomicU64::new(0),
                capacity,
                ignored: Mutex::new(VecDeque::with_capacity(capacity)),
                bus,
            }),
        }
    }

    pub fn create<T: Send + 'static>(&self, request: impl Into<String>) -> (Ticket<T>, PendingReply<T>) {
        let request = request.into();
        let (sender, receiver) = oneshot::channel();
        let ticket = Ticket {
            inner: Arc::new(TicketInner {
                request: request.clone(),
                state: AtomicU8::new(PENDING),
                sender: Mutex::new(Some(sender)),
                diagnostics: self.diagnostics.clone(),
            }),
        };
        (ticket, PendingReply { request, receiver })
    }

    pub fn complete<T: Send + 'static>(&self, ticket: &Ticket<T>, result: T) -> bool {
        ticket.complete(result)
    }

    pub fn is_completed<T: Send + 'static>(&self, ticket: &Ticket<T>) -> bool {
        ticket.is_completed()
    }

    /// Most recent ignored completions, oldest first.
    pub fn ignored(&self) -> Vec<IgnoredCompletion> {
        self.diagnostics
            .ignored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Total number of completions ever ignored by this guard.
    pub fn ignored_count(&self) -> u64 {
        self.diagnostics.sequence.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn first_completion_wins() {
        let guard = ReplyGuard::new(16);
        for n in 1..=10u32 {
            let (ticket, _reply) = guard.create::<u32>("deviceInfo");
            let delivered = (0..n).filter(|i| guard.complete(&ticket, *i)).count();
            assert_eq!(delivered, 1);
            assert!(guard.is_completed(&ticket));
        }
    }

    #[tokio::test]
    async fn delivered_result_is_the_first_one() {
        let guard = ReplyGuard::new(16);
        let (ticket, reply) = guard.create::<&'static str>("deviceInfo");
        assert!(ticket.complete("first"));
        assert!(!ticket.complete("second"));
        assert_eq!(reply.wait().await.unwrap(), "first");
    }

    #[tokio::test]
    async fn empty_result_is_still_delivered() {
        let guard = ReplyGuard::new(16);
        let (ticket, reply) = guard.create::<Option<Vec<u8>>>("read");
        assert!(ticket.complete(None));
        assert!(!ticket.complete(Some(vec![1])));
        assert_eq!(reply.wait().await.unwrap(), None);
    }

    #[test]
    fn racing_threads_produce_one_winner() {
        for threads in 2..=20usize {
            let guard = ReplyGuard::new(64);
            let (ticket, mut reply) = guard.create::<usize>("race");
            let barrier = Arc::new(Barrier::new(threads));
            let winners = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..threads)
                .map(|i| {
                    let ticket = ticket.clone();
                    let barrier = barrier.clone();
                    let winners = winners.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        if ticket.complete(i) {
                            winners.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(winners.load(Ordering::SeqCst), 1);
            assert!(reply.receiver.try_recv().is_ok());
            assert_eq!(guard.ignored_count(), (threads - 1) as u64);
        }
    }

    #[test]
    fn duplicates_are_logged_with_increasing_sequence() {
        let guard = ReplyGuard::new(16);
        let (ticket, _reply) = guard.create::<()>("deviceInfo");
        ticket.complete(());
        ticket.complete(());
        ticket.complete(());

        let ignored = guard.ignored();
        assert_eq!(ignored.len(), 2);
        assert_eq!(ignored[0].sequence, 1);
        assert_eq!(ignored[1].sequence, 2);
        assert!(ignored.iter().all(|r| r.request == "deviceInfo"));
        assert!(ignored.iter().all(|r| r.reason == IgnoredReason::Duplicate));
    }

    #[test]
    fn diagnostic_log_is_bounded() {
        let guard = ReplyGuard::new(2);
        let (ticket, _reply) = guard.create::<()>("spam");
        for _ in 0..5 {
            ticket.complete(());
        }
        let ignored = guard.ignored();
        assert_eq!(ignored.len(), 2);
        assert_eq!(ignored[1].sequence, 4);
        assert_eq!(guard.ignored_count(), 4);
    }

    #[tokio::test]
    async fn abandoned_ticket_ignores_late_results() {
        let guard = ReplyGuard::new(16);
        let (ticket, reply) = guard.create::<u8>("batteryLevel");
        assert!(ticket.abandon());
        assert!(!ticket.abandon());
        assert!(!ticket.complete(42));
        assert_eq!(ticket.state(), TicketState::Ignored);

        match reply.wait().await {
            Err(LinkError::CommandAbandoned { request }) => assert_eq!(request, "batteryLevel"),
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(guard.ignored()[0].reason, IgnoredReason::Abandoned);
    }

    #[test]
    fn completed_ticket_cannot_be_abandoned() {
        let guard = ReplyGuard::new(16);
        let (ticket, _reply) = guard.create::<u8>("read");
        assert!(ticket.complete(1));
        assert!(!ticket.abandon());
        assert_eq!(ticket.state(), TicketState::Completed);
    }

    #[tokio::test]
    async fn duplicate_callbacks_five_ms_apart() {
        let guard = ReplyGuard::new(16);
        let (ticket, reply) = guard.create::<Vec<u8>>("deviceInfo");

        let callback = ticket.clone();
        let driver = tokio::spawn(async move {
            let first = callback.complete(vec![1, 2, 3]);
            tokio::time::sleep(Duration::from_millis(5)).await;
            let second = callback.complete(vec![9, 9, 9]);
            (first, second)
        });

        assert_eq!(reply.wait().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(driver.await.unwrap(), (true, false));
        assert_eq!(guard.ignored().len(), 1);
    }

    #[test]
    fn session_view_sees_ticket_until_dropped() {
        let guard = ReplyGuard::new(16);
        let (ticket, reply) = guard.create::<u8>("read");
        let weak = ticket.downgrade();
        assert!(weak.upgrade().is_some_and(|t| t.is_pending()));
        drop(ticket);
        drop(reply);
        assert!(weak.upgrade().is_none());
    }
}
