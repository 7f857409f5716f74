//! Peripheral commands and their exactly-once execution
//! Every command gets a fresh reply ticket; the driver may report the result
//! as often as it likes, the caller sees it once.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use uuid::Uuid;

use crate::core::bluetooth::connection::ConnectionStateMachine;
use crate::core::bluetooth::constants::{
    UUID_BATTERY_LEVEL, UUID_BATTERY_SERVICE, UUID_DEVICE_INFORMATION_SERVICE,
    UUID_MANUFACTURER_NAME,
};
use crate::core::bluetooth::driver::PeripheralDriver;
use crate::core::bluetooth::events::{EventBus, LinkEvent};
use crate::core::bluetooth::reply_guard::ReplyGuard;
use crate::core::bluetooth::types::PeripheralAddress;
use crate::error::{LinkError, Result};

/// What a driver reports for a command: an optional payload, or a failure reason.
pub type CommandReply = std::result::Result<Option<Vec<u8>>, String>;

/// Peripheral commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Read the manufacturer name from the Device Information service
    DeviceInfo,
    /// Read the Battery Level characteristic
    BatteryLevel,
    Read {
        service: Uuid,
        characteristic: Uuid,
    },
    Write {
        service: Uuid,
        characteristic: Uuid,
        payload: Vec<u8>,
    },
}

impl DeviceCommand {
    /// Logical request name used for tickets and diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeviceInfo => "deviceInfo",
            Self::BatteryLevel => "batteryLevel",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
        }
    }

    /// `(service, characteristic)` the command addresses
    pub fn target(&self) -> (Uuid, Uuid) {
        match self {
            Self::DeviceInfo => (UUID_DEVICE_INFORMATION_SERVICE, UUID_MANUFACTURER_NAME),
            Self::BatteryLevel => (UUID_BATTERY_SERVICE, UUID_BATTERY_LEVEL),
            Self::Read {
                service,
                characteristic,
            }
            | Self::Write {
                service,
                characteristic,
                ..
            } => (*service, *characteristic),
        }
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Self::Write { payload, .. } => Some(payload),
            _ => None,
        }
    }
}

/// Issues commands to connected peripherals through the driver.
#[derive(Clone)]
pub struct CommandExecutor {
    driver: Arc<dyn PeripheralDriver>,
    guard: ReplyGuard,
    machine: ConnectionStateMachine,
    bus: EventBus,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(
        driver: Arc<dyn PeripheralDriver>,
        guard: ReplyGuard,
        machine: ConnectionStateMachine,
        bus: EventBus,
        timeout: Duration,
    ) -> Self {
        Self {
            driver,
            guard,
            machine,
            bus,
            timeout,
        }
    }

    pub fn reply_guard(&self) -> &ReplyGuard {
        &self.guard
    }

    /// Runs `command` against a connected peripheral and returns the single
    /// delivered reply. Failures are published but never touch the session.
    pub async fn execute(
        &self,
        address: &PeripheralAddress,
        command: DeviceCommand,
    ) -> Result<Option<Vec<u8>>> {
        let result = self.run(address, &command).await;
        if let Err(e) = &result {
            error!("Command {:?} on {} failed: {}", command, address, e);
            self.bus.publish(LinkEvent::CommandFailed {
                address: address.clone(),
                error: e.clone(),
            });
        }
        result
    }

    async fn run(
        &self,
        address: &PeripheralAddress,
        command: &DeviceCommand,
    ) -> Result<Option<Vec<u8>>> {
        let request = command.name();
        let (ticket, reply) = self.guard.create::<CommandReply>(request);
        self.machine.track_ticket(address, &ticket)?;

        info!("Sending command to {}: {:?}", address, command);
        if let Err(e) = self
            .driver
            .send_command(address, command, ticket.clone())
            .await
        {
            ticket.abandon();
            return Err(LinkError::CommandFailed {
                request: request.to_string(),
                reason: format!("{:#}", e),
            });
        }

        match tokio::time::timeout(self.timeout, reply.wait()).await {
            Ok(Ok(Ok(payload))) => Ok(payload),
            Ok(Ok(Err(reason))) => Err(LinkError::CommandFailed {
                request: request.to_string(),
                reason,
            }),
            Ok(Err(abandoned)) => Err(abandoned),
            Err(_) => {
                ticket.abandon();
                Err(LinkError::CommandFailed {
                    request: request.to_string(),
                    reason: format!("no reply within {:?}", self.timeout),
                })
            }
        }
    }

    pub async fn device_info(&self, address: &PeripheralAddress) -> Result<Option<Vec<u8>>> {
        self.execute(address, DeviceCommand::DeviceInfo).await
    }

    /// Battery level in percent.
    pub async fn battery_level(&self, address: &PeripheralAddress) -> Result<u8> {
        let payload = self.execute(address, DeviceCommand::BatteryLevel).await?;
        payload
            .and_then(|data| data.first().copied())
            .ok_or_else(|| LinkError::CommandFailed {
                request: DeviceCommand::BatteryLevel.name().to_string(),
                reason: "no battery level data received".into(),
            })
    }
}
