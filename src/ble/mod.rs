//! BLE transport layer
//!
//! Provides the handle-addressed GATT transport trait the engine runs on,
//! an in-process simulator for tests, and (behind the `ble-central`
//! feature) a btleplug backed transport for real radios.

#[cfg(feature = "ble-central")]
pub mod btleplug_adapter;
pub mod simulated;
pub mod transport;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("No characteristic with handle {0}")]
    UnknownHandle(u16),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,

    #[error("No BLE adapter available")]
    AdapterUnavailable,
}
