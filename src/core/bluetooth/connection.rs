//! Per-peripheral connection lifecycle
//! This module owns the session table and drives every session through
//! connect, pair, operate, reconnect and disconnect.
//!
//! Each session sits behind its own mutex, so transitions for one address
//! are serialized while different addresses never wait on each other. Locks
//! are only held for the CPU-bound transition itself, never across a driver
//! call. A session has at most one retry timer; every transition bumps the
//! session's timer generation, and a timer that wakes up with an outdated
//! generation does nothing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::core::bluetooth::backoff::ReconnectionScheduler;
use crate::core::bluetooth::driver::{LinkSignal, PeripheralDriver};
use crate::core::bluetooth::events::{EventBus, LinkEvent};
use crate::core::bluetooth::reply_guard::{Outstanding, Ticket};
use crate::core::bluetooth::types::{
    LinkState, PeripheralAddress, SessionSnapshot, StateTransition,
};
use crate::error::{LinkError, Result};

struct Session {
    address: PeripheralAddress,
    state: LinkState,
    /// Reconnection attempt of the current episode, 0 outside of one.
    attempt: u32,
    entered_at: DateTime<Utc>,
    last_error: Option<LinkError>,
    timer_generation: u64,
    timer: Option<JoinHandle<()>>,
    tickets: Vec<Weak<dyn Outstanding>>,
    /// A retry timer fired and its connection request has not been answered yet.
    retry_in_flight: bool,
    /// Set once the session has been torn down and removed from the table.
    retired: bool,
}

impl Session {
    fn new(address: PeripheralAddress) -> Self {
        Self {
            address,
            state: LinkState::Idle,
            attempt: 0,
            entered_at: Utc::now(),
            last_error: None,
            timer_generation: 0,
            timer: None,
            tickets: Vec::new(),
            retry_in_flight: false,
            retired: false,
        }
    }

    fn cancel_timer(&mut self) {
        self.timer_generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn live_tickets(&self) -> impl Iterator<Item = Arc<dyn Outstanding>> + '_ {
        self.tickets
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|ticket| ticket.is_pending())
    }

    fn abandon_tickets(&mut self) -> usize {
        let abandoned = self
            .live_tickets()
            .filter(|ticket| {
                debug!("Abandoning `{}` for {}", ticket.request(), self.address);
                ticket.abandon()
            })
            .count();
        self.tickets.clear();
        abandoned
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            address: self.address.clone(),
            state: self.state,
            attempt: self.attempt,
            entered_at: self.entered_at,
            last_error: self.last_error.clone(),
            outstanding_tickets: self.live_tickets().count(),
        }
    }

    fn invalid(&self, operation: &str) -> LinkError {
        invalid_state(&self.address, self.state, operation)
    }
}

fn invalid_state(address: &PeripheralAddress, state: LinkState, operation: &str) -> LinkError {
    LinkError::InvalidState {
        address: address.to_string(),
        state: state.to_string(),
        operation: operation.to_string(),
    }
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    sessions: DashMap<PeripheralAddress, Arc<Mutex<Session>>>,
    scheduler: ReconnectionScheduler,
    bus: EventBus,
    driver: Arc<dyn PeripheralDriver>,
}

/// Owns every connection session. Cheap to clone; clones share the table.
///
/// Must be used from within a Tokio runtime, retry timers are spawned tasks.
#[derive(Clone)]
pub struct ConnectionStateMachine {
    inner: Arc<Inner>,
}

impl ConnectionStateMachine {
    pub fn new(
        scheduler: ReconnectionScheduler,
        bus: EventBus,
        driver: Arc<dyn PeripheralDriver>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                scheduler,
                bus,
                driver,
            }),
        }
    }

    pub fn scheduler(&self) -> &ReconnectionScheduler {
        &self.inner.scheduler
    }

    fn entry(&self, address: &PeripheralAddress) -> Option<Arc<Mutex<Session>>> {
        self.inner
            .sessions
            .get(address)
            .map(|entry| entry.value().clone())
    }

    fn entry_or_create(&self, address: &PeripheralAddress) -> Arc<Mutex<Session>> {
        self.inner
            .sessions
            .entry(address.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(address.clone()))))
            .value()
            .clone()
    }

    /// Starts connecting to `address`, creating its session if needed.
    ///
    /// Returns once the link has been requested; the outcome arrives through
    /// [`ConnectionStateMachine::on_link_event`].
    pub async fn connect(&self, address: &PeripheralAddress) -> Result<()> {
        let session = loop {
            let session = self.entry_or_create(address);
            {
                let mut s = lock(&session);
                if s.retired {
                    // Torn down between lookup and lock; the table holds a fresh one now.
                    continue;
                }
                match s.state {
                    LinkState::Idle | LinkState::Disconnected | LinkState::Error => {
                        s.attempt = 0;
                        self.transition(&mut s, LinkState::Connecting, None);
                    }
                    LinkState::Connected => {
                        info!("Device {} already connected.", address);
                        return Ok(());
                    }
                    LinkState::Connecting | LinkState::Pairing | LinkState::Reconnecting => {
                        info!("Connection to {} already in progress ({}).", address, s.state);
                        return Ok(());
                    }
                    LinkState::Disconnecting | LinkState::Scanning => {
                        return Err(s.invalid("connect"));
                    }
                }
            }
            break session;
        };

        self.request_link(address, &session).await;
        Ok(())
    }

    /// User-initiated teardown, legal from any state.
    ///
    /// Cancels the pending retry timer and abandons outstanding tickets before
    /// anything else can happen to the session, then walks it through
    /// `Disconnecting` to `Disconnected` and drops it from the table. The
    /// session is torn down even if the driver fails to disconnect; that
    /// failure is returned afterwards.
    pub async fn disconnect(&self, address: &PeripheralAddress) -> Result<()> {
        let Some(session) = self.entry(address) else {
            info!("No session for {}, nothing to disconnect.", address);
            return Ok(());
        };

        {
            let mut s = lock(&session);
            if s.retired || s.state == LinkState::Disconnecting {
                return Ok(());
            }
            let abandoned = s.abandon_tickets();
            if abandoned > 0 {
                info!("Abandoned {} outstanding requests for {}", abandoned, address);
            }
            s.attempt = 0;
            self.transition(&mut s, LinkState::Disconnecting, None);
        }

        info!("Disconnecting from device {}", address);
        let result = self
            .inner
            .driver
            .disconnect(address)
            .await
            .map_err(LinkError::from_driver);
        if let Err(e) = &result {
            warn!("Driver failed to disconnect {}: {}", address, e);
        }

        {
            let mut s = lock(&session);
            self.transition(&mut s, LinkState::Disconnected, None);
            s.retired = true;
            self.inner
                .sessions
                .remove_if(address, |_, current| Arc::ptr_eq(current, &session));
        }
        info!("Session for {} torn down", address);

        result
    }

    /// Feeds a link-level signal from the driver into the session for `address`.
    /// Signals for unknown or torn-down sessions, and signals that make no
    /// sense in the current state, are ignored.
    pub fn on_link_event(&self, address: &PeripheralAddress, signal: LinkSignal) {
        let Some(session) = self.entry(address) else {
            debug!("Ignoring {:?} for {}: no session", signal, address);
            return;
        };
        let mut s = lock(&session);
        if s.retired {
            debug!("Ignoring {:?} for {}: session torn down", signal, address);
            return;
        }
        self.apply(&mut s, signal);
    }

    fn apply(&self, s: &mut Session, signal: LinkSignal) {
        use LinkState::*;

        match (s.state, signal) {
            (Connecting | Reconnecting, LinkSignal::Established { pairing_required: true }) => {
                self.transition(s, Pairing, None);
            }
            (Connecting | Reconnecting, LinkSignal::Established { pairing_required: false })
            | (Pairing, LinkSignal::PairingSucceeded) => {
                s.attempt = 0;
                self.transition(s, Connected, None);
            }
            (Pairing, LinkSignal::PairingFailed(reason)) => {
                self.transition(s, Error, Some(LinkError::PairingFailed(reason)));
            }
            (Connecting | Pairing | Reconnecting, LinkSignal::HandshakeRejected(reason)) => {
                self.transition(s, Error, Some(LinkError::UnsupportedPeripheral(reason)));
            }
            (Reconnecting, LinkSignal::Failed(error) | LinkSignal::Lost(error))
                if !s.retry_in_flight =>
            {
                // Repeated report of the failure that started this backoff.
                debug!(
                    "Ignoring {} for {} while waiting to retry (attempt {})",
                    error, s.address, s.attempt
                );
            }
            (
                Connecting | Pairing | Reconnecting,
                LinkSignal::Failed(error) | LinkSignal::Lost(error),
            ) => {
                self.retry_or_fail(s, error);
            }
            (Connected, LinkSignal::Lost(error) | LinkSignal::Failed(error)) => {
                let abandoned = s.abandon_tickets();
                if abandoned > 0 {
                    info!("Link to {} lost, abandoned {} requests", s.address, abandoned);
                }
                s.attempt = 0;
                self.retry_or_fail(s, error);
            }
            (state, signal) => {
                debug!("Ignoring {:?} for {} in state {}", signal, s.address, state);
            }
        }
    }

    fn retry_or_fail(&self, s: &mut Session, error: LinkError) {
        if !error.is_retryable() {
            self.transition(s, LinkState::Error, Some(error));
            return;
        }

        let next = s.attempt + 1;
        if self.inner.scheduler.should_retry(next) {
            s.attempt = next;
            self.transition(s, LinkState::Reconnecting, Some(error));
        } else {
            let exhausted = LinkError::ReconnectionExhausted {
                attempts: s.attempt,
            };
            self.transition(s, LinkState::Error, Some(exhausted));
        }
    }

    fn transition(&self, s: &mut Session, to: LinkState, error: Option<LinkError>) {
        let from = s.state;
        s.cancel_timer();
        s.retry_in_flight = false;
        s.state = to;
        s.entered_at = Utc::now();
        if error.is_some() {
            s.last_error = error.clone();
        }

        match (&error, to) {
            (Some(e), LinkState::Error) => error!("{}: {} -> {} ({})", s.address, from, to, e),
            (Some(e), _) => info!(
                "{}: {} -> {} attempt {} ({})",
                s.address, from, to, s.attempt, e
            ),
            (None, _) => info!("{}: {} -> {}", s.address, from, to),
        }

        self.inner
            .bus
            .publish(LinkEvent::StateChanged(StateTransition {
                address: s.address.clone(),
                from,
                to,
                attempt: s.attempt,
                error,
                at: s.entered_at,
            }));

        if to == LinkState::Reconnecting {
            self.schedule_retry(s);
        }
    }

    fn schedule_retry(&self, s: &mut Session) {
        let delay = self
            .inner
            .scheduler
            .next_delay(s.attempt.saturating_sub(1));
        let generation = s.timer_generation;
        let address = s.address.clone();
        let machine = Arc::downgrade(&self.inner);

        debug!(
            "Retrying {} in {:?} (attempt {})",
            address, delay, s.attempt
        );
        s.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = machine.upgrade() {
                ConnectionStateMachine { inner }
                    .fire_retry(&address, generation)
                    .await;
            }
        }));
    }

    async fn fire_retry(&self, address: &PeripheralAddress, generation: u64) {
        let Some(session) = self.entry(address) else {
            return;
        };
        {
            let mut s = lock(&session);
            if s.retired || s.timer_generation != generation || s.state != LinkState::Reconnecting
            {
                debug!("Discarding stale retry timer for {}", address);
                return;
            }
            // This task is the timer; forget its handle without aborting it.
            s.timer = None;
            s.retry_in_flight = true;
            info!("Reconnection attempt {} for {}", s.attempt, address);
        }

        self.request_link(address, &session).await;
    }

    async fn request_link(&self, address: &PeripheralAddress, session: &Arc<Mutex<Session>>) {
        info!("Initiating connection to {}...", address);
        if let Err(err) = self.inner.driver.connect(address).await {
            let error = LinkError::from_driver(err);
            warn!("Connection request for {} failed: {}", address, error);
            self.on_link_event(address, LinkSignal::Failed(error));
            return;
        }

        let torn_down = {
            let s = lock(session);
            s.retired || matches!(s.state, LinkState::Disconnecting | LinkState::Disconnected)
        };
        if torn_down {
            // The disconnect overtook this request; release whatever link it produced.
            warn!("Session for {} was torn down while connecting, releasing the link", address);
            if let Err(e) = self.inner.driver.disconnect(address).await {
                warn!("Driver failed to disconnect {}: {:#}", address, e);
            }
        }
    }

    /// Registers an outstanding request with a connected session so that a
    /// disconnect or link loss can abandon it.
    pub fn track_ticket<T: Send + 'static>(
        &self,
        address: &PeripheralAddress,
        ticket: &Ticket<T>,
    ) -> Result<()> {
        let operation = format!("issue `{}`", ticket.request());
        let Some(session) = self.entry(address) else {
            return Err(invalid_state(address, LinkState::Idle, &operation));
        };
        let mut s = lock(&session);
        if s.retired || s.state != LinkState::Connected {
            return Err(s.invalid(&operation));
        }
        s.tickets
            .retain(|t| t.upgrade().is_some_and(|t| t.is_pending()));
        s.tickets.push(ticket.downgrade());
        Ok(())
    }

    pub fn state(&self, address: &PeripheralAddress) -> Option<LinkState> {
        self.entry(address).map(|session| lock(&session).state)
    }

    pub fn session(&self, address: &PeripheralAddress) -> Option<SessionSnapshot> {
        self.entry(address).map(|session| lock(&session).snapshot())
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<_> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sessions
            .iter()
            .map(|session| lock(session).snapshot())
            .collect()
    }

    /// Drops every session without publishing transitions: timers are
    /// cancelled and outstanding tickets abandoned.
    pub fn shutdown(&self) {
        let sessions: Vec<_> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in sessions {
            let mut s = lock(&session);
            s.cancel_timer();
            s.abandon_tickets();
            s.retired = true;
        }
        self.inner.sessions.clear();
        info!("All sessions shut down");
    }
}
