//! Core functionality for the link core
//! This module contains the peripheral lifecycle machinery

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{BluetoothManager, LinkEvent, LinkState, PeripheralAddress};
