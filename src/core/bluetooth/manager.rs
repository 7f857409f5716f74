//! Bluetooth manager for the link core
//! This module provides the main interface for bluetooth operations

use std::sync::Arc;

use futures_util::stream::BoxStream;
use log::info;

use crate::config::LinkConfig;
use crate::core::bluetooth::backoff::ReconnectionScheduler;
use crate::core::bluetooth::commands::{CommandExecutor, DeviceCommand};
use crate::core::bluetooth::connection::ConnectionStateMachine;
use crate::core::bluetooth::driver::{DriverEvent, PeripheralDriver};
use crate::core::bluetooth::events::{EventBus, Subscription};
use crate::core::bluetooth::notification::DriverEventPump;
use crate::core::bluetooth::reply_guard::ReplyGuard;
use crate::core::bluetooth::scanner::{BluetoothScanner, DeviceRegistry};
use crate::core::bluetooth::types::{
    LinkState, PeripheralAddress, PeripheralIdentity, SessionSnapshot,
};
use crate::error::{LinkError, Result};

/// Manages Bluetooth operations
pub struct BluetoothManager {
    config: LinkConfig,
    bus: EventBus,
    /// Accepted peripherals, shared with the scan task and the event pump
    registry: Arc<DeviceRegistry>,
    machine: ConnectionStateMachine,
    scanner: BluetoothScanner,
    commands: CommandExecutor,
    pump: Option<DriverEventPump>,
}

impl BluetoothManager {
    /// Creates a new BluetoothManager on top of `driver`.
    pub fn new(config: LinkConfig, driver: Arc<dyn PeripheralDriver>) -> Result<Self> {
        config.validate()?;

        let bus = EventBus::new(config.event_queue_capacity);
        let registry = Arc::new(DeviceRegistry::from_config(&config));
        let machine = ConnectionStateMachine::new(
            ReconnectionScheduler::from_config(&config),
            bus.clone(),
            driver.clone(),
        );
        let scanner = BluetoothScanner::new(driver.clone(), registry.clone(), bus.clone());
        let guard = ReplyGuard::with_bus(config.diagnostic_log_capacity, bus.clone());
        let commands = CommandExecutor::new(
            driver,
            guard,
            machine.clone(),
            bus.clone(),
            config.command_timeout,
        );

        info!("Bluetooth manager ready.");
        Ok(Self {
            config,
            bus,
            registry,
            machine,
            scanner,
            commands,
            pump: None,
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn state_machine(&self) -> &ConnectionStateMachine {
        &self.machine
    }

    pub fn reply_guard(&self) -> &ReplyGuard {
        self.commands.reply_guard()
    }

    /// Starts a scan, stopping any scan already running.
    pub async fn start_scan(&mut self) -> Result<()> {
        self.scanner.start_scan().await
    }

    pub async fn stop_scan(&mut self) -> Result<()> {
        self.scanner.stop_scan().await
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    pub fn accepted_devices(&self) -> Vec<PeripheralIdentity> {
        self.registry.accepted()
    }

    /// Routes the driver's event stream into the core, replacing any stream
    /// attached before.
    pub async fn attach_driver_events(&mut self, events: BoxStream<'static, DriverEvent>) {
        if let Some(mut pump) = self.pump.take() {
            pump.stop().await;
        }
        self.pump = Some(DriverEventPump::spawn(
            events,
            self.registry.clone(),
            self.bus.clone(),
            self.machine.clone(),
        ));
    }

    /// Handles one driver event inline, for drivers that push instead of stream.
    pub fn handle_driver_event(&self, event: DriverEvent) {
        DriverEventPump::dispatch(&self.registry, &self.bus, &self.machine, event);
    }

    /// Connects to a peripheral previously accepted by a scan.
    pub async fn connect(&self, address: &PeripheralAddress) -> Result<()> {
        if !self.registry.contains(address) {
            return Err(LinkError::DeviceNotFound(address.to_string()));
        }
        self.machine.connect(address).await
    }

    pub async fn disconnect(&self, address: &PeripheralAddress) -> Result<()> {
        self.machine.disconnect(address).await
    }

    pub async fn execute(
        &self,
        address: &PeripheralAddress,
        command: DeviceCommand,
    ) -> Result<Option<Vec<u8>>> {
        self.commands.execute(address, command).await
    }

    pub async fn device_info(&self, address: &PeripheralAddress) -> Result<Option<Vec<u8>>> {
        self.commands.device_info(address).await
    }

    /// Get battery level
    pub async fn battery_level(&self, address: &PeripheralAddress) -> Result<u8> {
        self.commands.battery_level(address).await
    }

    pub fn state(&self, address: &PeripheralAddress) -> Option<LinkState> {
        self.machine.state(address)
    }

    pub fn is_connected(&self, address: &PeripheralAddress) -> bool {
        self.state(address) == Some(LinkState::Connected)
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.machine.sessions()
    }

    /// Stops scanning and event routing, then drops every session.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down Bluetooth manager.");
        let scan_result = if self.scanner.has_scan_task() {
            self.scanner.stop_scan().await
        } else {
            Ok(())
        };
        if let Some(mut pump) = self.pump.take() {
            pump.stop().await;
        }
        self.machine.shutdown();
        scan_result
    }
}
