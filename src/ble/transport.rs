//! BLE transport trait definitions and core types
//!
//! The engine talks to the radio through [`BleTransport`]. GATT endpoints
//! are addressed by transport-level handles; mapping them to uuids is the
//! connection manager's job.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::BleError;

/// A BLE device address, e.g. `"e4:1f:0a:33:21:90"`.
///
/// Stored lowercase so comparisons and map lookups are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct BleAddress(String);

impl BleAddress {
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(address.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BleAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for BleAddress {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<BleAddress> for String {
    fn from(value: BleAddress) -> Self {
        value.0
    }
}

/// One received scan response.
#[derive(Debug, Clone)]
pub struct ScanRecord {
    pub address: BleAddress,
    /// Received signal strength indicator in dBm.
    pub rssi: i16,
    /// Local name, if the device advertised one.
    pub name: Option<String>,
    /// Service data keyed by 16-bit service uuid.
    pub service_data: HashMap<u16, Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub handle: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub handle: u16,
    pub characteristics: Vec<GattCharacteristic>,
}

/// Called for every scan record while scanning.
pub type DiscoveryCallback = Arc<dyn Fn(ScanRecord) + Send + Sync>;

/// Called with `(characteristic handle, value)` for every notification.
pub type NotificationCallback = Arc<dyn Fn(u16, &[u8]) + Send + Sync>;

/// Called when the link drops without the central asking for it.
pub type DisconnectCallback = Arc<dyn Fn(&BleAddress) + Send + Sync>;

/// BLE central role with a single active GATT connection.
///
/// Callbacks are invoked synchronously from whatever task the transport
/// delivers events on and must not block.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Start scanning; `on_discovery` receives every scan record.
    async fn start_scan(&self, on_discovery: DiscoveryCallback) -> Result<(), BleError>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Connect to the peripheral at `address`.
    async fn connect(&self, address: &BleAddress) -> Result<(), BleError>;

    /// Close the active connection. Does not fire the disconnect callback.
    async fn disconnect(&self) -> Result<(), BleError>;

    fn is_connected(&self) -> bool;

    /// Enumerate services and characteristics of the connected peripheral.
    async fn discover_services(&self) -> Result<Vec<GattService>, BleError>;

    async fn read(&self, handle: u16) -> Result<Vec<u8>, BleError>;

    /// Acknowledged write.
    async fn write(&self, handle: u16, data: &[u8]) -> Result<(), BleError>;

    /// Enable notifications for a characteristic.
    async fn subscribe(&self, handle: u16) -> Result<(), BleError>;

    async fn unsubscribe(&self, handle: u16) -> Result<(), BleError>;

    /// Register the single notification callback.
    fn set_notification_callback(&self, callback: NotificationCallback);

    /// Register the single disconnect callback.
    fn set_disconnect_callback(&self, callback: DisconnectCallback);
}
