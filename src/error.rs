//! Error taxonomy for the link core.
//! Driver and persistence boundaries speak `anyhow`; everything that reaches a
//! session or an observer is folded into a [`LinkError`].

use serde::Serialize;
use thiserror::Error;

/// Errors attached to sessions and published on the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail")]
pub enum LinkError {
    /// The host refused Bluetooth access. Needs user action, never retried.
    #[error("bluetooth permission denied")]
    PermissionDenied,

    /// The adapter is powered off. Needs user action, never retried.
    #[error("bluetooth radio is off")]
    RadioOff,

    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("pairing failed: {0}")]
    PairingFailed(String),

    #[error("link failed: {0}")]
    LinkFailed(String),

    #[error("link timed out")]
    LinkTimeout,

    /// Scoped to a single ticket, never changes session state.
    #[error("command `{request}` failed: {reason}")]
    CommandFailed { request: String, reason: String },

    /// The ticket was abandoned before a reply arrived (disconnect or link loss).
    #[error("command `{request}` abandoned")]
    CommandAbandoned { request: String },

    #[error("reconnection gave up after {attempts} attempts")]
    ReconnectionExhausted { attempts: u32 },

    /// The peripheral answered the handshake with something it cannot support.
    #[error("unsupported peripheral: {0}")]
    UnsupportedPeripheral(String),

    #[error("{address} is {state}, cannot {operation}")]
    InvalidState {
        address: String,
        state: String,
        operation: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, LinkError>;

impl LinkError {
    /// Whether the reconnection scheduler may try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::LinkFailed(_) | LinkError::LinkTimeout | LinkError::DeviceNotFound(_)
        )
    }

    /// Classifies an error returned by a driver call.
    ///
    /// Drivers that know precisely what went wrong wrap a `LinkError` in the
    /// `anyhow::Error`; anything else is treated as a generic link failure.
    pub fn from_driver(err: anyhow::Error) -> Self {
        match err.downcast::<LinkError>() {
            Ok(link_error) => link_error,
            Err(other) => LinkError::LinkFailed(format!("{:#}", other)),
        }
    }
}
