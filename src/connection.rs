//! The single active GATT connection
//!
//! The transport addresses characteristics by handle; everything above this
//! module addresses them by uuid. Discovery fills the uuid/handle maps at
//! connect time and notification delivery goes handle -> uuid -> callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::ble::transport::{BleAddress, BleTransport, GattService};
use crate::error::CrownstoneError;
use crate::event_bus::{BusEvent, EventBus};
use crate::session::EncryptionSession;

/// Receives the raw value of every notification on one characteristic.
pub type ValueCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Default)]
struct ConnectionState {
    address: Option<BleAddress>,
    service_handles: HashMap<Uuid, u16>,
    service_uuids: HashMap<u16, Uuid>,
    /// (service, characteristic) -> handle
    characteristic_handles: HashMap<(Uuid, Uuid), u16>,
    characteristic_uuids: HashMap<u16, Uuid>,
    notification_uuids: HashMap<u16, Uuid>,
    notification_callbacks: HashMap<Uuid, ValueCallback>,
}

impl ConnectionState {
    fn from_discovery(address: BleAddress, services: &[GattService]) -> Self {
        let mut state = ConnectionState {
            address: Some(address),
            ..Default::default()
        };
        for service in services {
            state.service_handles.insert(service.uuid, service.handle);
            state.service_uuids.insert(service.handle, service.uuid);
            for characteristic in &service.characteristics {
                state
                    .characteristic_handles
                    .insert((service.uuid, characteristic.uuid), characteristic.handle);
                state
                    .characteristic_uuids
                    .insert(characteristic.handle, characteristic.uuid);
            }
        }
        state
    }

    fn is_clean(&self) -> bool {
        self.address.is_none()
            && self.service_handles.is_empty()
            && self.characteristic_handles.is_empty()
            && self.notification_uuids.is_empty()
            && self.notification_callbacks.is_empty()
    }

    fn handle_for(&self, service: Uuid, characteristic: Uuid) -> Result<u16, CrownstoneError> {
        if !self.service_handles.contains_key(&service) {
            return Err(CrownstoneError::UnknownService(service));
        }
        self.characteristic_handles
            .get(&(service, characteristic))
            .copied()
            .ok_or(CrownstoneError::UnknownCharacteristic(characteristic))
    }

    fn handle_for_characteristic(&self, characteristic: Uuid) -> Result<u16, CrownstoneError> {
        self.characteristic_handles
            .iter()
            .find(|((_, uuid), _)| *uuid == characteristic)
            .map(|(_, handle)| *handle)
            .ok_or(CrownstoneError::UnknownCharacteristic(characteristic))
    }
}

/// Resets `state` and reports whether there was anything to reset.
fn reset(state: &Mutex<ConnectionState>) -> Option<BleAddress> {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.is_clean() {
        return None;
    }
    let previous = std::mem::take(&mut *state);
    previous.address
}

pub struct ConnectionManager {
    transport: Arc<dyn BleTransport>,
    session: Arc<EncryptionSession>,
    state: Arc<Mutex<ConnectionState>>,
}

impl ConnectionManager {
    /// Registers the notification and disconnect callbacks with `transport`.
    pub fn new(
        transport: Arc<dyn BleTransport>,
        bus: Arc<EventBus>,
        session: Arc<EncryptionSession>,
    ) -> Self {
        let state = Arc::new(Mutex::new(ConnectionState::default()));

        let notification_state = Arc::clone(&state);
        transport.set_notification_callback(Arc::new(move |handle: u16, value: &[u8]| {
            let callback = {
                let state = notification_state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                state
                    .notification_uuids
                    .get(&handle)
                    .and_then(|uuid| state.notification_callbacks.get(uuid))
                    .cloned()
            };
            match callback {
                Some(callback) => callback(value),
                None => log::debug!("Dropping notification on unsubscribed handle {}", handle),
            }
        }));

        let disconnect_state = Arc::clone(&state);
        let disconnect_session = Arc::clone(&session);
        transport.set_disconnect_callback(Arc::new(move |address: &BleAddress| {
            if reset(&disconnect_state).is_none() {
                return;
            }
            log::info!("{} disconnected", address);
            disconnect_session.clear_session();
            bus.emit(BusEvent::ForcedDisconnect(address.clone()));
        }));

        Self {
            transport,
            session,
            state,
        }
    }

    /// Connect and discover services. An existing connection is closed first.
    pub async fn connect(&self, address: &BleAddress) -> Result<(), CrownstoneError> {
        if self.is_connected() {
            self.disconnect().await?;
        }

        log::info!("Connecting to {}", address);
        self.transport
            .connect(address)
            .await
            .map_err(|e| CrownstoneError::ConnectionFailed {
                address: address.clone(),
                reason: e.to_string(),
            })?;

        let services = match self.transport.discover_services().await {
            Ok(services) => services,
            Err(e) => {
                if let Err(close_error) = self.transport.disconnect().await {
                    log::warn!("Failed to close {} after discovery error: {}", address, close_error);
                }
                return Err(CrownstoneError::ConnectionFailed {
                    address: address.clone(),
                    reason: e.to_string(),
                });
            }
        };

        log::debug!("Discovered {} services on {}", services.len(), address);
        *self.lock() = ConnectionState::from_discovery(address.clone(), &services);
        self.session.clear_session();
        Ok(())
    }

    /// Close the connection. Calling this while disconnected does nothing.
    pub async fn disconnect(&self) -> Result<(), CrownstoneError> {
        reset(&self.state);
        self.session.clear_session();
        if self.transport.is_connected() {
            log::info!("Disconnecting");
            self.transport.disconnect().await?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.lock().address.is_some() && self.transport.is_connected()
    }

    pub fn address(&self) -> Option<BleAddress> {
        self.lock().address.clone()
    }

    pub fn session(&self) -> &Arc<EncryptionSession> {
        &self.session
    }

    /// Uuid of a discovered service handle.
    pub fn service_uuid(&self, handle: u16) -> Option<Uuid> {
        self.lock().service_uuids.get(&handle).copied()
    }

    /// Uuid of a discovered characteristic handle.
    pub fn characteristic_uuid(&self, handle: u16) -> Option<Uuid> {
        self.lock().characteristic_uuids.get(&handle).copied()
    }

    pub fn has_notification_subscription(&self, characteristic: Uuid) -> bool {
        self.lock()
            .notification_callbacks
            .contains_key(&characteristic)
    }

    /// Read a characteristic without decryption.
    pub async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>, CrownstoneError> {
        let handle = self.guarded_handle(service, characteristic)?;
        log::debug!("Reading {} (handle {})", characteristic, handle);
        Ok(self.transport.read(handle).await?)
    }

    /// Read a characteristic and decrypt it with the current session.
    pub async fn read_decrypted(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, CrownstoneError> {
        let value = self.read(service, characteristic).await?;
        self.decode(&value, true)
    }

    pub async fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
        encrypted: bool,
    ) -> Result<(), CrownstoneError> {
        let handle = self.guarded_handle(service, characteristic)?;
        let data = self.encode(payload, encrypted)?;
        log::debug!(
            "Writing {} bytes to {} (handle {}, encrypted: {})",
            data.len(),
            characteristic,
            handle,
            encrypted
        );
        Ok(self.transport.write(handle, &data).await?)
    }

    /// Enable notifications on `characteristic` and route them to `callback`.
    pub async fn subscribe_notifications(
        &self,
        characteristic: Uuid,
        callback: ValueCallback,
    ) -> Result<(), CrownstoneError> {
        self.ensure_connected()?;
        let handle = {
            let mut state = self.lock();
            let handle = state.handle_for_characteristic(characteristic)?;
            state.notification_uuids.insert(handle, characteristic);
            state.notification_callbacks.insert(characteristic, callback);
            handle
        };

        log::debug!("Subscribing to notifications on {} (handle {})", characteristic, handle);
        if let Err(e) = self.transport.subscribe(handle).await {
            self.forget_notification(characteristic);
            return Err(e.into());
        }
        Ok(())
    }

    /// Stop routing notifications on `characteristic`.
    ///
    /// The tables are torn down even if the link is already gone, in which
    /// case the transport is not contacted.
    pub async fn unsubscribe_notifications(&self, characteristic: Uuid) -> Result<(), CrownstoneError> {
        let handle = self.forget_notification(characteristic);
        match handle {
            Some(handle) if self.is_connected() => {
                log::debug!("Unsubscribing from {} (handle {})", characteristic, handle);
                Ok(self.transport.unsubscribe(handle).await?)
            }
            _ => Ok(()),
        }
    }

    /// Encrypt an outgoing payload if requested and enabled.
    pub fn encode(&self, payload: &[u8], encrypted: bool) -> Result<Vec<u8>, CrownstoneError> {
        if encrypted && self.session.is_encryption_enabled() {
            Ok(self.session.encrypt(payload)?)
        } else {
            Ok(payload.to_vec())
        }
    }

    /// Decrypt an incoming value if requested and enabled.
    pub fn decode(&self, value: &[u8], encrypted: bool) -> Result<Vec<u8>, CrownstoneError> {
        if encrypted && self.session.is_encryption_enabled() {
            Ok(self.session.decrypt(value)?)
        } else {
            Ok(value.to_vec())
        }
    }

    fn forget_notification(&self, characteristic: Uuid) -> Option<u16> {
        let mut state = self.lock();
        state.notification_callbacks.remove(&characteristic);
        let handle = state
            .notification_uuids
            .iter()
            .find(|(_, uuid)| **uuid == characteristic)
            .map(|(handle, _)| *handle)?;
        state.notification_uuids.remove(&handle);
        Some(handle)
    }

    fn ensure_connected(&self) -> Result<(), CrownstoneError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(CrownstoneError::NotConnected)
        }
    }

    fn guarded_handle(&self, service: Uuid, characteristic: Uuid) -> Result<u16, CrownstoneError> {
        self.ensure_connected()?;
        self.lock().handle_for(service, characteristic)
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
