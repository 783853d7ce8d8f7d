//! In-process BLE simulator
//!
//! A [`SimAdapter`] plays the central role and hosts any number of
//! [`SimPeripheral`]s, each with a GATT table, characteristic values and a
//! programmable write responder. Advertisements are injected by the test,
//! links can be dropped from the peripheral side, and connection attempts
//! can be made to fail. Used for integration testing without real hardware.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::transport::{
    BleAddress, BleTransport, DisconnectCallback, DiscoveryCallback, GattService,
    NotificationCallback, ScanRecord,
};
use super::BleError;

/// What a peripheral does in reaction to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimResponse {
    /// Notify on a characteristic. Only delivered if the central subscribed.
    Notify { handle: u16, data: Vec<u8> },
    /// Hold back the remaining responses for this long.
    Delay(Duration),
    /// Drop the link. The write itself fails with `Disconnected`.
    Disconnect,
}

/// Produces the responses to a write of `data` to `handle`.
pub type WriteResponder = Arc<dyn Fn(&SimPeripheral, u16, &[u8]) -> Vec<SimResponse> + Send + Sync>;

/// A simulated peripheral with a fixed GATT table.
pub struct SimPeripheral {
    address: BleAddress,
    services: Vec<GattService>,
    values: Mutex<HashMap<u16, Vec<u8>>>,
    writes: Mutex<Vec<(u16, Vec<u8>)>>,
    responder: Mutex<Option<WriteResponder>>,
}

impl SimPeripheral {
    pub fn new(address: BleAddress, services: Vec<GattService>) -> Arc<Self> {
        Arc::new(Self {
            address,
            services,
            values: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
        })
    }

    pub fn address(&self) -> &BleAddress {
        &self.address
    }

    pub fn set_value(&self, handle: u16, value: Vec<u8>) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, value);
    }

    pub fn value(&self, handle: u16) -> Option<Vec<u8>> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .cloned()
    }

    /// Every write received so far, in order.
    pub fn writes(&self) -> Vec<(u16, Vec<u8>)> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_responder(&self, responder: WriteResponder) {
        *self.responder.lock().unwrap_or_else(PoisonError::into_inner) = Some(responder);
    }

    fn has_characteristic(&self, handle: u16) -> bool {
        self.services
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .any(|characteristic| characteristic.handle == handle)
    }

    fn receive_write(&self, handle: u16, data: &[u8]) -> Vec<SimResponse> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((handle, data.to_vec()));
        let responder = self
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match responder {
            Some(responder) => responder(self, handle, data),
            None => Vec::new(),
        }
    }
}

struct SimInner {
    peripherals: Mutex<HashMap<BleAddress, Arc<SimPeripheral>>>,
    connected: Mutex<Option<Arc<SimPeripheral>>>,
    subscriptions: Mutex<HashSet<u16>>,
    scanning: AtomicBool,
    on_discovery: Mutex<Option<DiscoveryCallback>>,
    on_notification: Mutex<Option<NotificationCallback>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
    failing_connects: AtomicU32,
    failing_disconnects: AtomicU32,
    connect_count: AtomicU32,
}

impl SimInner {
    fn connected(&self) -> Option<Arc<SimPeripheral>> {
        self.connected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn connected_or_err(&self) -> Result<Arc<SimPeripheral>, BleError> {
        self.connected().ok_or(BleError::Disconnected)
    }

    fn is_connected_to(&self, address: &BleAddress) -> bool {
        self.connected()
            .is_some_and(|peripheral| peripheral.address() == address)
    }

    fn notify(&self, handle: u16, data: &[u8]) {
        if !self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&handle)
        {
            return;
        }
        let callback = self
            .on_notification
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(handle, data);
        }
    }

    /// Drop the link from the peripheral side and fire the disconnect callback.
    fn drop_link(&self) -> bool {
        let dropped = self
            .connected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(peripheral) = dropped else {
            return false;
        };
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let callback = self
            .on_disconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(peripheral.address());
        }
        true
    }
}

/// Simulated central. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SimAdapter {
    inner: Arc<SimInner>,
}

impl Default for SimAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SimAdapter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SimInner {
                peripherals: Mutex::new(HashMap::new()),
                connected: Mutex::new(None),
                subscriptions: Mutex::new(HashSet::new()),
                scanning: AtomicBool::new(false),
                on_discovery: Mutex::new(None),
                on_notification: Mutex::new(None),
                on_disconnect: Mutex::new(None),
                failing_connects: AtomicU32::new(0),
                failing_disconnects: AtomicU32::new(0),
                connect_count: AtomicU32::new(0),
            }),
        }
    }

    /// Make a peripheral connectable.
    pub fn add_peripheral(&self, peripheral: Arc<SimPeripheral>) {
        self.inner
            .peripherals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peripheral.address().clone(), peripheral);
    }

    /// Deliver a scan record to the discovery callback. Dropped when not scanning.
    pub fn advertise(&self, record: ScanRecord) {
        if !self.inner.scanning.load(Ordering::SeqCst) {
            return;
        }
        let callback = self
            .inner
            .on_discovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(record);
        }
    }

    /// Drop the active link as if the peripheral went away.
    /// Returns false when nothing was connected.
    pub fn force_disconnect(&self) -> bool {
        self.inner.drop_link()
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` local disconnects fail, leaving the link up.
    pub fn fail_next_disconnects(&self, count: u32) {
        self.inner.failing_disconnects.store(count, Ordering::SeqCst);
    }

    /// Number of connection attempts, successful or not.
    pub fn connect_count(&self) -> u32 {
        self.inner.connect_count.load(Ordering::SeqCst)
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::SeqCst)
    }

    pub fn connected_address(&self) -> Option<BleAddress> {
        self.inner
            .connected()
            .map(|peripheral| peripheral.address().clone())
    }

    pub fn subscribed_handles(&self) -> HashSet<u16> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Play out responses, deferring everything after a `Delay` to a task.
    /// Returns `Disconnected` if a response dropped the link inline.
    fn dispatch(&self, address: BleAddress, responses: Vec<SimResponse>) -> Result<(), BleError> {
        let mut responses = responses.into_iter();
        while let Some(response) = responses.next() {
            match response {
                SimResponse::Notify { handle, data } => self.inner.notify(handle, &data),
                SimResponse::Disconnect => {
                    self.inner.drop_link();
                    return Err(BleError::Disconnected);
                }
                SimResponse::Delay(delay) => {
                    let inner = Arc::clone(&self.inner);
                    let rest: Vec<SimResponse> = responses.by_ref().collect();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        for response in rest {
                            if !inner.is_connected_to(&address) {
                                return;
                            }
                            match response {
                                SimResponse::Notify { handle, data } => inner.notify(handle, &data),
                                SimResponse::Disconnect => {
                                    inner.drop_link();
                                }
                                SimResponse::Delay(delay) => tokio::time::sleep(delay).await,
                            }
                        }
                    });
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BleTransport for SimAdapter {
    async fn start_scan(&self, on_discovery: DiscoveryCallback) -> Result<(), BleError> {
        *self
            .inner
            .on_discovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(on_discovery);
        self.inner.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.inner.scanning.store(false, Ordering::SeqCst);
        *self
            .inner
            .on_discovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    async fn connect(&self, address: &BleAddress) -> Result<(), BleError> {
        self.inner.connect_count.fetch_add(1, Ordering::SeqCst);
        let failing = self.inner.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.inner.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(BleError::ConnectionError(format!(
                "Simulated connection failure to {}",
                address
            )));
        }

        let peripheral = self
            .inner
            .peripherals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
            .ok_or_else(|| BleError::ConnectionError(format!("No peripheral at {}", address)))?;

        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *self
            .inner
            .connected
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(peripheral);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        let failing = self.inner.failing_disconnects.load(Ordering::SeqCst);
        if failing > 0 {
            self.inner.failing_disconnects.store(failing - 1, Ordering::SeqCst);
            return Err(BleError::ConnectionError(
                "Simulated disconnect failure".to_string(),
            ));
        }
        self.inner
            .connected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected().is_some()
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, BleError> {
        Ok(self.inner.connected_or_err()?.services.clone())
    }

    async fn read(&self, handle: u16) -> Result<Vec<u8>, BleError> {
        let peripheral = self.inner.connected_or_err()?;
        if !peripheral.has_characteristic(handle) {
            return Err(BleError::UnknownHandle(handle));
        }
        Ok(peripheral.value(handle).unwrap_or_default())
    }

    async fn write(&self, handle: u16, data: &[u8]) -> Result<(), BleError> {
        let peripheral = self.inner.connected_or_err()?;
        if !peripheral.has_characteristic(handle) {
            return Err(BleError::UnknownHandle(handle));
        }
        let responses = peripheral.receive_write(handle, data);
        self.dispatch(peripheral.address().clone(), responses)
    }

    async fn subscribe(&self, handle: u16) -> Result<(), BleError> {
        let peripheral = self.inner.connected_or_err()?;
        if !peripheral.has_characteristic(handle) {
            return Err(BleError::UnknownHandle(handle));
        }
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle);
        Ok(())
    }

    async fn unsubscribe(&self, handle: u16) -> Result<(), BleError> {
        self.inner.connected_or_err()?;
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle);
        Ok(())
    }

    fn set_notification_callback(&self, callback: NotificationCallback) {
        *self
            .inner
            .on_notification
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn set_disconnect_callback(&self, callback: DisconnectCallback) {
        *self
            .inner
            .on_disconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::transport::GattCharacteristic;
    use uuid::Uuid;

    const ECHO: u16 = 3;

    fn echo_peripheral(address: &str) -> Arc<SimPeripheral> {
        let peripheral = SimPeripheral::new(
            BleAddress::new(address),
            vec![GattService {
                uuid: Uuid::new_v4(),
                handle: 1,
                characteristics: vec![GattCharacteristic {
                    uuid: Uuid::new_v4(),
                    handle: ECHO,
                }],
            }],
        );
        peripheral.set_responder(Arc::new(|_: &SimPeripheral, handle: u16, data: &[u8]| {
            vec![SimResponse::Notify {
                handle,
                data: data.to_vec(),
            }]
        }));
        peripheral
    }

    #[tokio::test]
    async fn test_advertisements_only_while_scanning() {
        let adapter = SimAdapter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let record = ScanRecord {
            address: BleAddress::new("00:00:00:00:00:01"),
            rssi: -40,
            name: None,
            service_data: HashMap::new(),
        };
        adapter.advertise(record.clone());

        adapter
            .start_scan(Arc::new(move |record: ScanRecord| {
                sink.lock().unwrap().push(record.rssi)
            }))
            .await
            .unwrap();
        adapter.advertise(record.clone());
        adapter.stop_scan().await.unwrap();
        adapter.advertise(record);

        assert_eq!(*seen.lock().unwrap(), vec![-40]);
    }

    #[tokio::test]
    async fn test_notifications_require_subscription() {
        let adapter = SimAdapter::new();
        let peripheral = echo_peripheral("00:00:00:00:00:02");
        adapter.add_peripheral(Arc::clone(&peripheral));

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        adapter.set_notification_callback(Arc::new(move |handle: u16, data: &[u8]| {
            sink.lock().unwrap().push((handle, data.to_vec()))
        }));

        adapter.connect(peripheral.address()).await.unwrap();
        adapter.write(ECHO, b"dropped").await.unwrap();
        adapter.subscribe(ECHO).await.unwrap();
        adapter.write(ECHO, b"echoed").await.unwrap();

        assert_eq!(*received.lock().unwrap(), vec![(ECHO, b"echoed".to_vec())]);
        assert_eq!(peripheral.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_handle_and_peer() {
        let adapter = SimAdapter::new();
        let peripheral = echo_peripheral("00:00:00:00:00:03");
        adapter.add_peripheral(Arc::clone(&peripheral));

        assert!(matches!(
            adapter.connect(&BleAddress::new("ff:ff:ff:ff:ff:ff")).await,
            Err(BleError::ConnectionError(_))
        ));
        assert_eq!(adapter.read(ECHO).await, Err(BleError::Disconnected));

        adapter.connect(peripheral.address()).await.unwrap();
        assert_eq!(adapter.read(99).await, Err(BleError::UnknownHandle(99)));
    }

    #[tokio::test]
    async fn test_force_disconnect_fires_callback_once() {
        let adapter = SimAdapter::new();
        let peripheral = echo_peripheral("00:00:00:00:00:04");
        adapter.add_peripheral(Arc::clone(&peripheral));

        let count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&count);
        adapter.set_disconnect_callback(Arc::new(move |_: &BleAddress| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        adapter.connect(peripheral.address()).await.unwrap();
        assert!(adapter.force_disconnect());
        assert!(!adapter.force_disconnect());
        assert!(!adapter.is_connected());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // A local disconnect never fires the callback.
        adapter.connect(peripheral.address()).await.unwrap();
        adapter.disconnect().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_responses() {
        let adapter = SimAdapter::new();
        let peripheral = echo_peripheral("00:00:00:00:00:05");
        peripheral.set_responder(Arc::new(|_: &SimPeripheral, handle: u16, _: &[u8]| {
            vec![
                SimResponse::Notify {
                    handle,
                    data: vec![1],
                },
                SimResponse::Delay(Duration::from_millis(100)),
                SimResponse::Notify {
                    handle,
                    data: vec![2],
                },
            ]
        }));
        adapter.add_peripheral(Arc::clone(&peripheral));

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        adapter.set_notification_callback(Arc::new(move |_: u16, data: &[u8]| {
            sink.lock().unwrap().push(data[0])
        }));

        adapter.connect(peripheral.address()).await.unwrap();
        adapter.subscribe(ECHO).await.unwrap();
        adapter.write(ECHO, &[0]).await.unwrap();
        assert_eq!(*received.lock().unwrap(), vec![1]);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*received.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_connection_failure_injection() {
        let adapter = SimAdapter::new();
        let peripheral = echo_peripheral("00:00:00:00:00:06");
        adapter.add_peripheral(Arc::clone(&peripheral));

        adapter.fail_next_connects(1);
        assert!(adapter.connect(peripheral.address()).await.is_err());
        assert!(adapter.connect(peripheral.address()).await.is_ok());
        assert_eq!(adapter.connect_count(), 2);

        adapter.fail_next_disconnects(1);
        assert!(adapter.disconnect().await.is_err());
        assert!(adapter.is_connected());
        assert!(adapter.disconnect().await.is_ok());
        assert!(!adapter.is_connected());
    }
}
