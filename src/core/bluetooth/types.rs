//! Defines shared data structures for the Bluetooth module.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LinkError;
use crate::utils::extract_mac_address;

/// Stable key of a peripheral.
///
/// Platform identifiers that embed a MAC address are reduced to that address
/// (upper-case, `:`-separated); anything else (e.g. the per-host UUIDs handed
/// out on macOS) is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralAddress(String);

impl PeripheralAddress {
    pub fn new(id: impl AsRef<str>) -> Self {
        let id = id.as_ref().trim();
        match extract_mac_address(id) {
            Some(mac) => Self(mac),
            None => Self(id.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralAddress {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A single raw scan event as reported by the driver.
#[derive(Debug, Clone)]
pub struct AdvertisementRecord {
    pub address: PeripheralAddress,
    /// Advertised service identifiers, complete or incomplete lists alike.
    pub service_ids: Vec<Uuid>,
    /// Manufacturer specific data, vendor id first (little-endian company id on BLE).
    pub manufacturer_data: Vec<u8>,
    pub rssi: Option<i16>,
    pub name: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl AdvertisementRecord {
    /// Creates an empty record for `address` captured now.
    pub fn new(address: impl Into<PeripheralAddress>) -> Self {
        Self {
            address: address.into(),
            service_ids: Vec::new(),
            manufacturer_data: Vec::new(),
            rssi: None,
            name: None,
            captured_at: Utc::now(),
        }
    }

    pub fn with_services(mut self, services: impl IntoIterator<Item = Uuid>) -> Self {
        self.service_ids.extend(services);
        self
    }

    /// Sets the manufacturer payload from a Bluetooth SIG company id and the
    /// vendor bytes that follow it.
    pub fn with_manufacturer(mut self, company_id: u16, data: &[u8]) -> Self {
        self.manufacturer_data = company_id.to_le_bytes().to_vec();
        self.manufacturer_data.extend_from_slice(data);
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn captured_at(mut self, at: DateTime<Utc>) -> Self {
        self.captured_at = at;
        self
    }
}

/// Why an advertisement was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Neither service identifiers nor a manufacturer payload were advertised.
    NoIdentifyingData,
    NoMatchingServiceId,
    NoMatchingManufacturerPrefix,
    /// Both were advertised and neither matched.
    NoMatchingIdentifiers,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::NoIdentifyingData => "no identifying data",
            RejectReason::NoMatchingServiceId => "no matching service id",
            RejectReason::NoMatchingManufacturerPrefix => "no matching manufacturer prefix",
            RejectReason::NoMatchingIdentifiers => "no matching service id or manufacturer prefix",
        };
        f.write_str(text)
    }
}

/// Classification of an advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    Rejected(RejectReason),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

/// A discovered, accepted peripheral as tracked by the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeripheralIdentity {
    pub address: PeripheralAddress,
    /// The name of the device, if it ever advertised one
    pub name: Option<String>,
    pub last_seen: DateTime<Utc>,
    /// The signal strength (RSSI) of the latest advertisement
    pub rssi: Option<i16>,
    pub verdict: Verdict,
}

/// Connection lifecycle states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Idle,
    /// Informational only, sessions never enter it.
    Scanning,
    Connecting,
    Pairing,
    Connected,
    Reconnecting,
    Disconnecting,
    Disconnected,
    Error,
}

impl LinkState {
    /// `Disconnected` and `Error` end a session's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Error)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One published state change of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub address: PeripheralAddress,
    pub from: LinkState,
    pub to: LinkState,
    pub attempt: u32,
    pub error: Option<LinkError>,
    pub at: DateTime<Utc>,
}

/// Point-in-time copy of a session for inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub address: PeripheralAddress,
    pub state: LinkState,
    pub attempt: u32,
    pub entered_at: DateTime<Utc>,
    pub last_error: Option<LinkError>,
    pub outstanding_tickets: usize,
}
