//! btleplug backed transport for real radios
//!
//! btleplug addresses characteristics by uuid; the engine wants handles.
//! Handles are synthesized per connection in discovery order, services and
//! characteristics numbered from 1 in one sequence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::transport::{
    BleAddress, BleTransport, DisconnectCallback, DiscoveryCallback, GattCharacteristic,
    GattService, NotificationCallback, ScanRecord,
};
use super::BleError;

/// Low 96 bits of the Bluetooth base uuid `0000xxxx-0000-1000-8000-00805f9b34fb`.
const BASE_UUID_LOW: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;
const BASE_UUID_MASK: u128 = (1 << 96) - 1;

/// The 16-bit alias of a uuid derived from the Bluetooth base uuid.
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & BASE_UUID_MASK != BASE_UUID_LOW {
        return None;
    }
    u32::try_from(value >> 96).ok().and_then(|v| u16::try_from(v).ok())
}

fn gatt_error(e: btleplug::Error) -> BleError {
    BleError::GattError(e.to_string())
}

#[derive(Default)]
struct Link {
    peripheral: Option<Peripheral>,
    address: Option<BleAddress>,
    characteristics: HashMap<u16, Characteristic>,
    handles_by_uuid: HashMap<Uuid, u16>,
    notification_task: Option<JoinHandle<()>>,
}

impl Link {
    fn is_peer(&self, id: &PeripheralId) -> bool {
        self.peripheral.as_ref().map(|p| &p.id() == id).unwrap_or(false)
    }

    fn reset(&mut self) -> Option<BleAddress> {
        if let Some(task) = self.notification_task.take() {
            task.abort();
        }
        self.peripheral = None;
        self.characteristics.clear();
        self.handles_by_uuid.clear();
        self.address.take()
    }
}

#[derive(Default)]
struct Shared {
    link: Mutex<Link>,
    on_discovery: Mutex<Option<DiscoveryCallback>>,
    on_notification: Mutex<Option<NotificationCallback>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct BtleplugTransport {
    adapter: Adapter,
    shared: Arc<Shared>,
    events_task: JoinHandle<()>,
}

impl BtleplugTransport {
    /// Use the first adapter the platform reports.
    pub async fn new() -> Result<Self, BleError> {
        let manager = Manager::new()
            .await
            .map_err(|e| BleError::ConnectionError(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|_| BleError::AdapterUnavailable)?
            .into_iter()
            .next()
            .ok_or(BleError::AdapterUnavailable)?;
        Self::with_adapter(adapter).await
    }

    pub async fn with_adapter(adapter: Adapter) -> Result<Self, BleError> {
        let shared = Arc::new(Shared::default());
        let events = adapter
            .events()
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))?;
        let events_task = tokio::spawn(run_events(adapter.clone(), Arc::clone(&shared), events));
        Ok(Self {
            adapter,
            shared,
            events_task,
        })
    }

    fn characteristic(&self, handle: u16) -> Result<(Peripheral, Characteristic), BleError> {
        let link = lock(&self.shared.link);
        let peripheral = link.peripheral.clone().ok_or(BleError::Disconnected)?;
        let characteristic = link
            .characteristics
            .get(&handle)
            .cloned()
            .ok_or(BleError::UnknownHandle(handle))?;
        Ok((peripheral, characteristic))
    }

    async fn find_peripheral(&self, address: &BleAddress) -> Result<Peripheral, BleError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| BleError::ConnectionError(e.to_string()))?;
        peripherals
            .into_iter()
            .find(|p| BleAddress::new(p.address().to_string()) == *address)
            .ok_or_else(|| BleError::ConnectionError(format!("{} has not been seen", address)))
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.events_task.abort();
        lock(&self.shared.link).reset();
    }
}

type EventStream = std::pin::Pin<Box<dyn futures_util::Stream<Item = CentralEvent> + Send>>;

async fn run_events(adapter: Adapter, shared: Arc<Shared>, mut events: EventStream) {
    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ServiceDataAdvertisement { id, .. } => {
                let Some(on_discovery) = lock(&shared.on_discovery).clone() else {
                    continue;
                };
                match scan_record(&adapter, &id).await {
                    Ok(Some(record)) => on_discovery(record),
                    Ok(None) => {}
                    Err(e) => log::trace!("Skipping advertisement: {}", e),
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let dropped = {
                    let mut link = lock(&shared.link);
                    if link.is_peer(&id) {
                        link.reset()
                    } else {
                        None
                    }
                };
                if let Some(address) = dropped {
                    log::info!("{} dropped the connection", address);
                    let callback = lock(&shared.on_disconnect).clone();
                    if let Some(callback) = callback {
                        callback(&address);
                    }
                }
            }
            _ => {}
        }
    }
    log::debug!("Adapter event stream ended");
}

async fn scan_record(adapter: &Adapter, id: &PeripheralId) -> Result<Option<ScanRecord>, BleError> {
    let peripheral = adapter.peripheral(id).await.map_err(gatt_error)?;
    let Some(properties) = peripheral.properties().await.map_err(gatt_error)? else {
        return Ok(None);
    };
    let Some(rssi) = properties.rssi else {
        return Ok(None);
    };
    let service_data = properties
        .service_data
        .iter()
        .filter_map(|(uuid, data)| short_uuid(uuid).map(|short| (short, data.clone())))
        .collect();
    Ok(Some(ScanRecord {
        address: BleAddress::new(properties.address.to_string()),
        rssi,
        name: properties.local_name,
        service_data,
    }))
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn start_scan(&self, on_discovery: DiscoveryCallback) -> Result<(), BleError> {
        *lock(&self.shared.on_discovery) = Some(on_discovery);
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        lock(&self.shared.on_discovery).take();
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))
    }

    async fn connect(&self, address: &BleAddress) -> Result<(), BleError> {
        let peripheral = self.find_peripheral(address).await?;
        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral
                .connect()
                .await
                .map_err(|e| BleError::ConnectionError(e.to_string()))?;
        }

        let mut notifications = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                if let Err(close_error) = peripheral.disconnect().await {
                    log::debug!("Failed to close {} after setup error: {}", address, close_error);
                }
                return Err(gatt_error(e));
            }
        };
        let shared = Arc::clone(&self.shared);
        let notification_task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let handle = lock(&shared.link)
                    .handles_by_uuid
                    .get(&notification.uuid)
                    .copied();
                let callback = lock(&shared.on_notification).clone();
                if let (Some(handle), Some(callback)) = (handle, callback) {
                    callback(handle, &notification.value);
                }
            }
        });

        let mut link = lock(&self.shared.link);
        link.reset();
        link.peripheral = Some(peripheral);
        link.address = Some(address.clone());
        link.notification_task = Some(notification_task);
        log::debug!("Connected to {}", address);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        let peripheral = {
            let mut link = lock(&self.shared.link);
            let peripheral = link.peripheral.take();
            link.reset();
            peripheral
        };
        match peripheral {
            Some(peripheral) => peripheral
                .disconnect()
                .await
                .map_err(|e| BleError::ConnectionError(e.to_string())),
            None => Ok(()),
        }
    }

    fn is_connected(&self) -> bool {
        lock(&self.shared.link).peripheral.is_some()
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, BleError> {
        let peripheral = lock(&self.shared.link)
            .peripheral
            .clone()
            .ok_or(BleError::Disconnected)?;
        peripheral.discover_services().await.map_err(gatt_error)?;

        let mut next_handle: u16 = 1;
        let mut services = Vec::new();
        let mut characteristics = HashMap::new();
        let mut handles_by_uuid = HashMap::new();
        for service in peripheral.services() {
            let service_handle = next_handle;
            next_handle += 1;
            let mut discovered = Vec::new();
            for characteristic in service.characteristics {
                let handle = next_handle;
                next_handle += 1;
                discovered.push(GattCharacteristic {
                    uuid: characteristic.uuid,
                    handle,
                });
                handles_by_uuid.insert(characteristic.uuid, handle);
                characteristics.insert(handle, characteristic);
            }
            services.push(GattService {
                uuid: service.uuid,
                handle: service_handle,
                characteristics: discovered,
            });
        }

        let mut link = lock(&self.shared.link);
        link.characteristics = characteristics;
        link.handles_by_uuid = handles_by_uuid;
        Ok(services)
    }

    async fn read(&self, handle: u16) -> Result<Vec<u8>, BleError> {
        let (peripheral, characteristic) = self.characteristic(handle)?;
        peripheral.read(&characteristic).await.map_err(gatt_error)
    }

    async fn write(&self, handle: u16, data: &[u8]) -> Result<(), BleError> {
        let (peripheral, characteristic) = self.characteristic(handle)?;
        let written = peripheral
            .write(&characteristic, data, WriteType::WithResponse)
            .await;
        match written {
            Ok(()) => Ok(()),
            Err(_) if !peripheral.is_connected().await.unwrap_or(false) => {
                Err(BleError::Disconnected)
            }
            Err(e) => Err(gatt_error(e)),
        }
    }

    async fn subscribe(&self, handle: u16) -> Result<(), BleError> {
        let (peripheral, characteristic) = self.characteristic(handle)?;
        peripheral.subscribe(&characteristic).await.map_err(gatt_error)
    }

    async fn unsubscribe(&self, handle: u16) -> Result<(), BleError> {
        let (peripheral, characteristic) = self.characteristic(handle)?;
        peripheral
            .unsubscribe(&characteristic)
            .await
            .map_err(gatt_error)
    }

    fn set_notification_callback(&self, callback: NotificationCallback) {
        *lock(&self.shared.on_notification) = Some(callback);
    }

    fn set_disconnect_callback(&self, callback: DisconnectCallback) {
        *lock(&self.shared.on_disconnect) = Some(callback);
    }
}
