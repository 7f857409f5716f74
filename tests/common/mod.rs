//! Scriptable in-memory driver shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use ble_link_core::core::bluetooth::{
    AdvertisementRecord, BluetoothManager, CommandReply, DeviceCommand, DriverEvent, LinkEvent,
    LinkSignal, PeripheralAddress, PeripheralDriver, StateTransition, Subscription, Ticket,
    UUID_HEART_RATE_SERVICE,
};
use ble_link_core::{LinkConfig, LinkError};

pub const MONITOR: &str = "C4:2E:A1:07:9B:01";
pub const MANUFACTURER: &[u8] = b"Acme Health";
pub const BATTERY: u8 = 87;

/// What the driver does when asked for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Establish,
    Pair,
    /// The connect call itself fails with a retryable error.
    Fail,
    /// Accepts the request and never reports back.
    Silent,
}

pub struct MockDriver {
    events: mpsc::UnboundedSender<DriverEvent>,
    scan: Mutex<Option<mpsc::UnboundedSender<AdvertisementRecord>>>,
    behavior: Mutex<ConnectBehavior>,
    /// Return values of the late, duplicate completions the driver attempted.
    late_completions: Arc<Mutex<Vec<bool>>>,
    /// When set, commands are accepted but their tickets are kept unanswered.
    hold_replies: AtomicBool,
    held: Mutex<Vec<(DeviceCommand, Ticket<CommandReply>)>>,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub scans_started: AtomicUsize,
    pub scans_stopped: AtomicUsize,
}

impl MockDriver {
    pub fn new() -> (Arc<Self>, BoxStream<'static, DriverEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let driver = Arc::new(Self {
            events,
            scan: Mutex::new(None),
            behavior: Mutex::new(ConnectBehavior::Establish),
            late_completions: Arc::new(Mutex::new(Vec::new())),
            hold_replies: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            scans_started: AtomicUsize::new(0),
            scans_stopped: AtomicUsize::new(0),
        });
        (driver, UnboundedReceiverStream::new(receiver).boxed())
    }

    pub fn set_behavior(&self, behavior: ConnectBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Feeds an advertisement into the running scan, if any.
    pub fn advertise(&self, record: AdvertisementRecord) -> bool {
        match self.scan.lock().unwrap().as_ref() {
            Some(scan) => scan.send(record).is_ok(),
            None => false,
        }
    }

    /// Closes the running scan's stream as if the platform ended it.
    pub fn end_scan(&self) {
        self.scan.lock().unwrap().take();
    }

    pub fn hold_replies(&self, hold: bool) {
        self.hold_replies.store(hold, Ordering::SeqCst);
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    /// Answers every held command and returns whether each answer was accepted.
    pub fn release_held(&self) -> Vec<bool> {
        let held = std::mem::take(&mut *self.held.lock().unwrap());
        held.into_iter()
            .map(|(command, reply)| reply.complete(Self::reply_for(&command)))
            .collect()
    }

    pub fn signal(&self, address: &str, signal: LinkSignal) {
        let _ = self.events.send(DriverEvent::Link {
            address: PeripheralAddress::new(address),
            signal,
        });
    }

    pub fn late_completions(&self) -> Vec<bool> {
        self.late_completions.lock().unwrap().clone()
    }

    fn reply_for(command: &DeviceCommand) -> CommandReply {
        match command {
            DeviceCommand::DeviceInfo => Ok(Some(MANUFACTURER.to_vec())),
            DeviceCommand::BatteryLevel => Ok(Some(vec![BATTERY])),
            DeviceCommand::Read { .. } => Ok(Some(Vec::new())),
            DeviceCommand::Write { payload, .. } if payload.is_empty() => {
                Err("write rejected: empty payload".into())
            }
            DeviceCommand::Write { .. } => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl PeripheralDriver for MockDriver {
    async fn start_scan(&self) -> anyhow::Result<BoxStream<'static, AdvertisementRecord>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.scan.lock().unwrap() = Some(sender);
        self.scans_started.fetch_add(1, Ordering::SeqCst);
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn stop_scan(&self) -> anyhow::Result<()> {
        self.scan.lock().unwrap().take();
        self.scans_stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, address: &PeripheralAddress) -> anyhow::Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.behavior.lock().unwrap();
        let link = |signal| DriverEvent::Link {
            address: address.clone(),
            signal,
        };
        match behavior {
            ConnectBehavior::Establish => {
                let _ = self.events.send(link(LinkSignal::Established {
                    pairing_required: false,
                }));
            }
            ConnectBehavior::Pair => {
                let _ = self.events.send(link(LinkSignal::Established {
                    pairing_required: true,
                }));
                let _ = self.events.send(link(LinkSignal::PairingSucceeded));
            }
            ConnectBehavior::Fail => {
                return Err(anyhow::Error::new(LinkError::LinkFailed(
                    "peripheral out of range".into(),
                )));
            }
            ConnectBehavior::Silent => {}
        }
        Ok(())
    }

    async fn disconnect(&self, _address: &PeripheralAddress) -> anyhow::Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Unless replies are held, completes every command twice, the second time 5 ms later, the way
    /// some platform stacks report a read.
    async fn send_command(
        &self,
        address: &PeripheralAddress,
        command: &DeviceCommand,
        reply: Ticket<CommandReply>,
    ) -> anyhow::Result<()> {
        if address.as_str().is_empty() {
            return Err(anyhow!("no such peripheral"));
        }
        if self.hold_replies.load(Ordering::SeqCst) {
            self.held.lock().unwrap().push((command.clone(), reply));
            return Ok(());
        }
        let result = Self::reply_for(command);
        reply.complete(result.clone());

        let late_completions = self.late_completions.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let accepted = reply.complete(result);
            late_completions.lock().unwrap().push(accepted);
        });
        Ok(())
    }
}

pub fn test_config() -> LinkConfig {
    LinkConfig {
        base_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(1),
        max_retry_attempts: 3,
        command_timeout: Duration::from_secs(1),
        ..LinkConfig::default()
    }
}

pub fn heart_rate_monitor() -> AdvertisementRecord {
    AdvertisementRecord::new(MONITOR)
        .with_services([UUID_HEART_RATE_SERVICE])
        .with_name("HRM Pro")
        .with_rssi(-62)
}

pub fn monitor() -> PeripheralAddress {
    PeripheralAddress::new(MONITOR)
}

/// A manager on top of a fresh mock driver with its event stream attached.
pub async fn harness(config: LinkConfig) -> (BluetoothManager, Arc<MockDriver>, Subscription) {
    let (driver, events) = MockDriver::new();
    let mut manager = BluetoothManager::new(config, driver.clone()).unwrap();
    manager.attach_driver_events(events).await;
    let subscription = manager.subscribe();
    (manager, driver, subscription)
}

/// Next event, failing the test if none arrives within five seconds.
pub async fn next_event(events: &mut Subscription) -> LinkEvent {
    tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .expect("timed out waiting for an event")
        .expect("event bus closed")
}

/// Next state change, skipping every other kind of event.
pub async fn next_transition(events: &mut Subscription) -> StateTransition {
    loop {
        if let LinkEvent::StateChanged(transition) = next_event(events).await {
            return transition;
        }
    }
}
