//! Constants used throughout the link core
//! This module contains the constant values used by the link core,
//! such as UUIDs and default timing parameters.

use uuid::Uuid;

/// Standard Bluetooth Service UUIDs
pub const UUID_DEVICE_INFORMATION_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Health device services accepted by default
pub const UUID_GLUCOSE_SERVICE: Uuid = Uuid::from_u128(0x00001808_0000_1000_8000_00805f9b34fb);
pub const UUID_HEALTH_THERMOMETER_SERVICE: Uuid = Uuid::from_u128(0x00001809_0000_1000_8000_00805f9b34fb);
pub const UUID_HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
pub const UUID_BLOOD_PRESSURE_SERVICE: Uuid = Uuid::from_u128(0x00001810_0000_1000_8000_00805f9b34fb);
pub const UUID_WEIGHT_SCALE_SERVICE: Uuid = Uuid::from_u128(0x0000181d_0000_1000_8000_00805f9b34fb);

/// Standard Bluetooth Characteristic UUIDs
pub const UUID_MANUFACTURER_NAME: Uuid = Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// Maximum number of reconnection attempts per episode
pub const MAX_CONNECT_RETRIES: u32 = 5;

/// Delay before the first reconnection attempt in milliseconds
pub const DEFAULT_BASE_BACKOFF_MS: u64 = 1000;

/// Upper bound of a reconnection delay in milliseconds
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;

/// Timeout for a command reply in seconds
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 10;

/// Events a subscriber may fall behind before losing the oldest
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;

/// Entries kept in the rejection and ignored-completion logs
pub const DEFAULT_DIAGNOSTIC_LOG_CAPACITY: usize = 256;
