//! Boundary with the platform Bluetooth driver.
//! The core never talks to a radio itself; a backend implements
//! [`PeripheralDriver`] and feeds what it observes back as [`DriverEvent`]s.

use anyhow::Result;
use futures_util::stream::BoxStream;

use crate::core::bluetooth::commands::{CommandReply, DeviceCommand};
use crate::core::bluetooth::reply_guard::Ticket;
use crate::core::bluetooth::types::{AdvertisementRecord, PeripheralAddress};
use crate::error::LinkError;

/// Outbound operations the core needs from a Bluetooth backend.
///
/// Errors may wrap a [`LinkError`] to classify themselves precisely; see
/// [`LinkError::from_driver`].
#[async_trait::async_trait]
pub trait PeripheralDriver: Send + Sync {
    /// Starts scanning and returns the stream of raw advertisements.
    async fn start_scan(&self) -> Result<BoxStream<'static, AdvertisementRecord>>;

    async fn stop_scan(&self) -> Result<()>;

    /// Requests a link. The outcome is reported later as a [`LinkSignal`].
    async fn connect(&self, address: &PeripheralAddress) -> Result<()>;

    async fn disconnect(&self, address: &PeripheralAddress) -> Result<()>;

    /// Sends `command` and reports its completion through `reply`, as many
    /// times as the underlying stack happens to call back.
    async fn send_command(
        &self,
        address: &PeripheralAddress,
        command: &DeviceCommand,
        reply: Ticket<CommandReply>,
    ) -> Result<()>;
}

/// Link-level happenings reported by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkSignal {
    Established { pairing_required: bool },
    PairingSucceeded,
    PairingFailed(String),
    /// An established link went away.
    Lost(LinkError),
    /// A link could not be established.
    Failed(LinkError),
    /// The peripheral answered the handshake with something malformed or
    /// unsupported. Fatal for the session.
    HandshakeRejected(String),
}

/// Everything the driver pushes into the core.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    Advertisement(AdvertisementRecord),
    Link {
        address: PeripheralAddress,
        signal: LinkSignal,
    },
}
