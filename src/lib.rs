//! BLE link core library
//! Discovers compatible Bluetooth LE peripherals, keeps their connections
//! alive and delivers every command reply exactly once.

// Module declarations
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod utils;

pub use crate::config::{AppConfig, LinkConfig};
pub use crate::core::bluetooth::{
    AdvertisementRecord, BluetoothManager, DeviceCommand, DriverEvent, EventBus, LinkEvent,
    LinkSignal, LinkState, PeripheralAddress, PeripheralDriver, ReplyGuard,
};
pub use crate::error::{LinkError, Result};
