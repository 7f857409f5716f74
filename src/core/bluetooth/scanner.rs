//! Scan-time classification and deduplication of peripherals.
//!
//! Peripherals are accepted on what they advertise (service identifiers and
//! the vendor prefix of the manufacturer payload), never on their name.
//! Accepted peripherals live in the [`DeviceRegistry`], one entry per address.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, error, info};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::LinkConfig;
use crate::core::bluetooth::driver::PeripheralDriver;
use crate::core::bluetooth::events::{EventBus, LinkEvent};
use crate::core::bluetooth::types::{
    AdvertisementRecord, PeripheralAddress, PeripheralIdentity, RejectReason, Verdict,
};
use crate::error::{LinkError, Result};

/// Allow-list classifier backed by hash sets.
#[derive(Debug, Clone)]
pub struct ScanFilter {
    service_ids: HashSet<Uuid>,
    vendor_prefixes: HashSet<Vec<u8>>,
    /// Distinct prefix lengths, so a payload is checked once per length.
    prefix_lengths: Vec<usize>,
}

impl ScanFilter {
    pub fn new(service_ids: HashSet<Uuid>, vendor_prefixes: HashSet<Vec<u8>>) -> Self {
        let mut prefix_lengths: Vec<usize> = vendor_prefixes.iter().map(Vec::len).collect();
        prefix_lengths.sort_unstable();
        prefix_lengths.dedup();
        Self {
            service_ids,
            vendor_prefixes,
            prefix_lengths,
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self::new(
            config.compatible_service_ids.clone(),
            config.compatible_vendor_prefixes.clone(),
        )
    }

    pub fn classify(&self, record: &AdvertisementRecord) -> Verdict {
        let has_services = !record.service_ids.is_empty();
        let has_payload = !record.manufacturer_data.is_empty();
        if !has_services && !has_payload {
            return Verdict::Rejected(RejectReason::NoIdentifyingData);
        }

        if record
            .service_ids
            .iter()
            .any(|id| self.service_ids.contains(id))
            || self.matches_vendor(&record.manufacturer_data)
        {
            return Verdict::Accepted;
        }

        Verdict::Rejected(match (has_services, has_payload) {
            (true, false) => RejectReason::NoMatchingServiceId,
            (false, true) => RejectReason::NoMatchingManufacturerPrefix,
            _ => RejectReason::NoMatchingIdentifiers,
        })
    }

    fn matches_vendor(&self, payload: &[u8]) -> bool {
        self.prefix_lengths.iter().any(|&len| {
            payload
                .get(..len)
                .is_some_and(|prefix| self.vendor_prefixes.contains(prefix))
        })
    }
}

/// Entry of the rejection log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub address: PeripheralAddress,
    pub reason: RejectReason,
    pub at: DateTime<Utc>,
}

/// What an advertisement did to the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// First acceptance of this address.
    Discovered(PeripheralIdentity),
    /// Known address; name or signal strength changed.
    Updated(PeripheralIdentity),
    /// Known address; only the last-seen time moved.
    Refreshed(PeripheralIdentity),
    /// Older than what the registry already holds; nothing changed.
    Stale,
    Rejected(RejectReason),
}

impl Observation {
    pub fn verdict(&self) -> Verdict {
        match self {
            Observation::Rejected(reason) => Verdict::Rejected(*reason),
            _ => Verdict::Accepted,
        }
    }
}

/// Accepted peripherals keyed by address, plus a bounded rejection log.
///
/// Upserts lock only the map shard of their address, so enumeration and
/// upserts of other addresses proceed concurrently.
pub struct DeviceRegistry {
    filter: ScanFilter,
    devices: DashMap<PeripheralAddress, PeripheralIdentity>,
    rejections: Mutex<VecDeque<Rejection>>,
    capacity: usize,
}

impl DeviceRegistry {
    pub fn new(filter: ScanFilter, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            filter,
            devices: DashMap::new(),
            rejections: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self::new(ScanFilter::from_config(config), config.diagnostic_log_capacity)
    }

    /// Classifies `record` and upserts it when accepted.
    pub fn on_advertisement(&self, record: AdvertisementRecord) -> Verdict {
        self.observe(record).verdict()
    }

    /// Like [`DeviceRegistry::on_advertisement`], reporting what changed.
    pub fn observe(&self, record: AdvertisementRecord) -> Observation {
        match self.filter.classify(&record) {
            Verdict::Accepted => self.upsert(record),
            Verdict::Rejected(reason) => {
                self.reject(record.address, reason, record.captured_at);
                Observation::Rejected(reason)
            }
        }
    }

    fn upsert(&self, record: AdvertisementRecord) -> Observation {
        match self.devices.entry(record.address.clone()) {
            Entry::Occupied(mut entry) => {
                let identity = entry.get_mut();
                if record.captured_at < identity.last_seen {
                    return Observation::Stale;
                }
                identity.last_seen = record.captured_at;

                let mut changed = false;
                if record.rssi.is_some() && record.rssi != identity.rssi {
                    identity.rssi = record.rssi;
                    changed = true;
                }
                if record.name.is_some() && record.name != identity.name {
                    identity.name = record.name;
                    changed = true;
                }

                if changed {
                    Observation::Updated(identity.clone())
                } else {
                    Observation::Refreshed(identity.clone())
                }
            }
            Entry::Vacant(entry) => {
                let identity = PeripheralIdentity {
                    address: record.address,
                    name: record.name,
                    last_seen: record.captured_at,
                    rssi: record.rssi,
                    verdict: Verdict::Accepted,
                };
                entry.insert(identity.clone());
                Observation::Discovered(identity)
            }
        }
    }

    fn reject(&self, address: PeripheralAddress, reason: RejectReason, at: DateTime<Utc>) {
        debug!("Rejected {}: {}", address, reason);
        let mut rejections = self
            .rejections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if rejections.len() == self.capacity {
            rejections.pop_front();
        }
        rejections.push_back(Rejection { address, reason, at });
    }

    pub fn get(&self, address: &PeripheralAddress) -> Option<PeripheralIdentity> {
        self.devices.get(address).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, address: &PeripheralAddress) -> bool {
        self.devices.contains_key(address)
    }

    /// Every accepted peripheral, ordered by address.
    pub fn accepted(&self) -> Vec<PeripheralIdentity> {
        let mut devices: Vec<_> = self
            .devices
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Most recent rejections, oldest first.
    pub fn rejections(&self) -> Vec<Rejection> {
        self.rejections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.devices.clear();
        self.rejections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Runs driver scans in the background, feeding every advertisement
/// through the registry and publishing accepted peripherals.
pub struct BluetoothScanner {
    driver: Arc<dyn PeripheralDriver>,
    registry: Arc<DeviceRegistry>,
    bus: EventBus,
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
}

impl BluetoothScanner {
    pub fn new(driver: Arc<dyn PeripheralDriver>, registry: Arc<DeviceRegistry>, bus: EventBus) -> Self {
        Self {
            driver,
            registry,
            bus,
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_task_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// True while a scan task is held, including one whose stream already ended.
    pub fn has_scan_task(&self) -> bool {
        self.scan_task_handle.is_some()
    }

    pub async fn start_scan(&mut self) -> Result<()> {
        if self.scan_task_handle.is_some() {
            self.stop_scan().await?;
        }

        info!("Starting bluetooth scan");
        let scan_stream = self
            .driver
            .start_scan()
            .await
            .map_err(LinkError::from_driver)?;

        self.cancel_token = CancellationToken::new();
        let handle = tokio::spawn(Self::internal_scan_task(
            scan_stream,
            self.registry.clone(),
            self.bus.clone(),
            self.cancel_token.clone(),
        ));
        self.scan_task_handle = Some(handle);

        self.bus.publish(LinkEvent::ScanStarted);
        info!("Device scan task started.");
        Ok(())
    }

    async fn internal_scan_task(
        mut scan_stream: BoxStream<'static, AdvertisementRecord>,
        registry: Arc<DeviceRegistry>,
        bus: EventBus,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                record = scan_stream.next() => {
                    match record {
                        Some(record) => {
                            Self::ingest(&registry, &bus, record);
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }

        bus.publish(LinkEvent::ScanStopped);
    }

    /// Classifies one advertisement and publishes what it changed.
    pub(crate) fn ingest(registry: &DeviceRegistry, bus: &EventBus, record: AdvertisementRecord) -> Verdict {
        let observation = registry.observe(record);
        match &observation {
            Observation::Discovered(identity) => {
                info!(
                    "Found compatible device: Address: {}, Name: {:?}, RSSI: {:?}",
                    identity.address, identity.name, identity.rssi
                );
                bus.publish(LinkEvent::DeviceDiscovered(identity.clone()));
            }
            Observation::Updated(identity) => {
                debug!("Updated device {}: RSSI {:?}", identity.address, identity.rssi);
                bus.publish(LinkEvent::DeviceUpdated(identity.clone()));
            }
            Observation::Refreshed(_) | Observation::Stale | Observation::Rejected(_) => {}
        }
        observation.verdict()
    }

    pub async fn stop_scan(&mut self) -> Result<()> {
        info!("Stopping Bluetooth scan.");
        self.cancel_token.cancel();

        if let Some(handle) = self.scan_task_handle.take() {
            info!("Waiting for scan task to finish...");
            if let Err(e) = handle.await {
                if e.is_cancelled() {
                    info!("Scan task was cancelled.");
                } else {
                    error!("Scan task finished with an unexpected join error: {:?}", e);
                }
            }
        } else {
            info!("No active scan task handle found to wait for.");
        }

        self.driver
            .stop_scan()
            .await
            .map_err(LinkError::from_driver)
    }
}
