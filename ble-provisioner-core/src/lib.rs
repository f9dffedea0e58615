//! Core library for provisioning a WiFi peripheral over BLE.
//! This crate drives the text-line protocol spoken over one write and one
//! notify characteristic: it routes the shared notification stream to the
//! running operations, runs one state machine per exchange and owns the
//! connection to the single target peripheral. Transports (the BLE radio
//! side) plug in through the `BleTransport` trait and are selected by
//! feature flags.

pub mod backends;
pub mod codec;
pub mod config;
pub mod operations;
pub mod protocol;
pub mod router;
pub mod session;
pub mod traits;

pub use codec::CodecError;
pub use config::{AppConfig, SelectionConfig, SessionConfig};
pub use operations::{OperationKind, OperationOutcome};
pub use protocol::WifiNetwork;
pub use session::ProvisioningSession;
pub use traits::{BleTransport, PeripheralHandle};

// Define a shared Error and Result type for the entire crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Session is not initialized, call initialize() first")]
    NotInitialized,

    #[error("No peripheral connected")]
    NotConnected,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("A {0} operation is already in progress")]
    Busy(OperationKind),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "backend_btleplug")]
    #[error("Bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Locks a std mutex, recovering the data if a previous holder panicked.
///
/// Listener callbacks run arbitrary caller code, so a poisoned lock must not
/// take the whole session down with it.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
