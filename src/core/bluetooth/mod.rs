//! Bluetooth functionality for the link core
//! This module handles all bluetooth operations including scanning,
//! connecting, reconnecting and issuing commands to peripherals.

pub mod backoff;
pub mod commands;
pub mod connection;
pub mod constants;
pub mod driver;
pub mod events;
mod manager;
mod notification;
pub mod reply_guard;
pub mod scanner;
pub mod types;

// Re-export types that should be publicly accessible
pub use backoff::ReconnectionScheduler;
pub use commands::{CommandExecutor, CommandReply, DeviceCommand};
pub use connection::ConnectionStateMachine;
pub use constants::*; // Re-export all constants
pub use driver::{DriverEvent, LinkSignal, PeripheralDriver};
pub use events::{EventBus, LinkEvent, Subscription};
pub use manager::BluetoothManager;
pub use notification::DriverEventPump;
pub use reply_guard::{IgnoredCompletion, IgnoredReason, PendingReply, ReplyGuard, Ticket, TicketState};
pub use scanner::{BluetoothScanner, DeviceRegistry, Observation, Rejection, ScanFilter};
pub use types::{
    AdvertisementRecord, LinkState, PeripheralAddress, PeripheralIdentity, RejectReason,
    SessionSnapshot, StateTransition, Verdict,
};
