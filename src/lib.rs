// Crownstone BLE - client engine for Crownstone smart plugs

pub mod ble;
pub mod config;
pub mod connection;
pub mod control;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod notification;
pub mod protocol;
pub mod scan;
pub mod selectors;
pub mod session;
pub mod simulated_crownstone;

pub use ble::transport::{BleAddress, BleTransport};
pub use config::{EngineConfig, KeySet};
pub use engine::CrownstoneBle;
pub use error::CrownstoneError;
pub use event_bus::{BusEvent, EventBus, Topic};
pub use protocol::advertisement::{Advertisement, OperationMode};
