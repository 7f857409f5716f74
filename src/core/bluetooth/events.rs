//! Event bus fanning lifecycle, discovery and diagnostic events out to observers.
//!
//! Backed by a single `tokio::sync::broadcast` channel. Every subscriber has
//! its own bounded view of `capacity` events: when a subscriber falls behind,
//! the oldest events it has not read yet are dropped (drop-oldest), the loss is
//! logged, and it continues with the oldest event still retained. Publishers
//! never block and never fail, with or without subscribers.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use log::warn;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::core::bluetooth::reply_guard::IgnoredCompletion;
use crate::core::bluetooth::types::{PeripheralAddress, PeripheralIdentity, StateTransition};
use crate::error::LinkError;
use crate::logging::LogMessage;

/// Everything observers can see.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum LinkEvent {
    StateChanged(StateTransition),
    ScanStarted,
    ScanStopped,
    /// First acceptance of a peripheral.
    DeviceDiscovered(PeripheralIdentity),
    /// Re-observation of an accepted peripheral.
    DeviceUpdated(PeripheralIdentity),
    /// A single command failed; the session is unaffected.
    CommandFailed {
        address: PeripheralAddress,
        error: LinkError,
    },
    DuplicateIgnored(IgnoredCompletion),
    Log(LogMessage),
}

/// Multi-subscriber broadcast of [`LinkEvent`]s.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<LinkEvent>,
}

impl EventBus {
    /// `capacity` bounds how far any one subscriber may lag behind.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes to every current subscriber, returning how many there were.
    ///
    /// Must not log: the bus logger publishes through here.
    pub fn publish(&self, event: LinkEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Starts receiving every event published from now on. No replay.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            inner: BroadcastStream::new(self.sender.subscribe()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Infinite stream of events for one subscriber; ends only when every
/// [`EventBus`] handle has been dropped.
pub struct Subscription {
    inner: BroadcastStream<LinkEvent>,
}

impl Stream for Subscription {
    type Item = LinkEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!("Event subscriber fell behind, dropped {} oldest events", skipped);
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
