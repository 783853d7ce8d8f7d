//! Top level engine
//!
//! [`CrownstoneBle`] owns the bus, the encryption session, the connection,
//! the scan pipeline and the control handler. Scan based queries subscribe
//! a fresh selector for one scan window and reduce it to an answer.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::ble::transport::{BleAddress, BleTransport};
use crate::config::{EngineConfig, KeySet};
use crate::connection::ConnectionManager;
use crate::control::ControlHandler;
use crate::error::CrownstoneError;
use crate::event_bus::{BusEvent, EventBus, Topic};
use crate::protocol::advertisement::{Advertisement, OperationMode};
use crate::scan::ScanPipeline;
use crate::selectors::{
    AdvertisementHandler, Gatherer, ModeChecker, NearestCandidate, NearestSelector, RssiChecker,
};
use crate::session::EncryptionSession;

pub struct CrownstoneBle {
    config: EngineConfig,
    bus: Arc<EventBus>,
    session: Arc<EncryptionSession>,
    connection: Arc<ConnectionManager>,
    scanner: Arc<ScanPipeline>,
    pub control: ControlHandler,
}

impl CrownstoneBle {
    pub fn new(transport: Arc<dyn BleTransport>, config: EngineConfig) -> Self {
        let bus = EventBus::new();
        let session = Arc::new(EncryptionSession::default());
        let connection = Arc::new(ConnectionManager::new(
            Arc::clone(&transport),
            Arc::clone(&bus),
            Arc::clone(&session),
        ));
        let scanner = ScanPipeline::new(
            transport,
            Arc::clone(&bus),
            Arc::clone(&session),
            &config,
        );
        let control = ControlHandler::new(Arc::clone(&connection), config.clone());

        Self {
            config,
            bus,
            session,
            connection,
            scanner,
            control,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn set_keys(&self, keys: KeySet) {
        self.session.load_keys(keys);
    }

    /// Load keys from a JSON key dictionary.
    pub fn load_keys_from_json(&self, json: &str) -> Result<(), CrownstoneError> {
        self.set_keys(KeySet::from_json(json)?);
        Ok(())
    }

    /// Stop scanning, close the connection and drop every subscription.
    pub async fn shut_down(&self) -> Result<(), CrownstoneError> {
        self.scanner.shut_down().await?;
        self.connection.disconnect().await?;
        self.bus.clear();
        Ok(())
    }

    /// Connect and, unless `ignore_encryption`, run the session handshake.
    pub async fn connect(
        &self,
        address: &BleAddress,
        ignore_encryption: bool,
    ) -> Result<(), CrownstoneError> {
        self.connection.connect(address).await?;
        if ignore_encryption {
            return Ok(());
        }
        if let Err(e) = self.control.get_and_set_session_nonce().await {
            if let Err(close_error) = self.connection.disconnect().await {
                log::warn!("Failed to disconnect after handshake error: {}", close_error);
            }
            return Err(e);
        }
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), CrownstoneError> {
        self.connection.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Scan for `duration`, publishing advertisements on the bus.
    pub async fn start_scanning(&self, duration: Duration) -> Result<(), CrownstoneError> {
        self.scanner.scan(duration).await
    }

    pub async fn stop_scanning(&self) -> Result<(), CrownstoneError> {
        self.scanner.stop_scanning().await
    }

    /// End the running scan at its next tick.
    pub fn abort_scanning(&self) {
        self.scanner.abort();
    }

    /// Every device seen during the window, latest advertisement each.
    pub async fn get_crownstones_by_scanning(
        &self,
        duration: Duration,
    ) -> Result<Vec<Advertisement>, CrownstoneError> {
        self.scan_with(Topic::RawAdvertisement, Gatherer::new(), duration, false, |gatherer| {
            gatherer.collection()
        })
        .await
    }

    /// The mode `address` advertises. The scan ends as soon as it is known.
    pub async fn get_mode(
        &self,
        address: &BleAddress,
        duration: Duration,
    ) -> Result<OperationMode, CrownstoneError> {
        let checker = ModeChecker::new(address.clone(), None, false);
        self.scan_with(Topic::RawAdvertisement, checker, duration, true, ModeChecker::result)
            .await?
            .ok_or_else(|| CrownstoneError::NoScansReceived {
                address: address.clone(),
                duration,
            })
    }

    /// Follow `address` for the whole window; fails unless the last mode
    /// it advertised is `required`.
    pub async fn wait_for_mode(
        &self,
        address: &BleAddress,
        required: OperationMode,
        duration: Duration,
    ) -> Result<(), CrownstoneError> {
        let checker = ModeChecker::new(address.clone(), Some(required), true);
        let observed = self
            .scan_with(Topic::RawAdvertisement, checker, duration, false, ModeChecker::result)
            .await?;
        match observed {
            None => Err(CrownstoneError::NoScansReceived {
                address: address.clone(),
                duration,
            }),
            Some(mode) if mode != required => Err(CrownstoneError::ModeMismatch {
                address: address.clone(),
                required,
                observed: mode,
            }),
            Some(_) => Ok(()),
        }
    }

    #[deprecated(note = "use get_mode or wait_for_mode")]
    pub async fn is_crownstone_in_setup_mode(
        &self,
        address: &BleAddress,
        duration: Duration,
        wait_until_in_setup_mode: bool,
    ) -> Result<bool, CrownstoneError> {
        log::warn!("is_crownstone_in_setup_mode is deprecated, use get_mode or wait_for_mode");
        self.is_in_mode(
            Topic::Advertisement,
            address,
            OperationMode::Setup,
            duration,
            wait_until_in_setup_mode,
        )
        .await
    }

    #[deprecated(note = "use get_mode or wait_for_mode")]
    pub async fn is_crownstone_in_normal_mode(
        &self,
        address: &BleAddress,
        duration: Duration,
        wait_until_in_normal_mode: bool,
    ) -> Result<bool, CrownstoneError> {
        log::warn!("is_crownstone_in_normal_mode is deprecated, use get_mode or wait_for_mode");
        self.is_in_mode(
            Topic::RawAdvertisement,
            address,
            OperationMode::Normal,
            duration,
            wait_until_in_normal_mode,
        )
        .await
    }

    /// Mean RSSI of `address` over the window, `None` if it was not heard.
    pub async fn get_rssi_average(
        &self,
        address: &BleAddress,
        duration: Duration,
    ) -> Result<Option<f64>, CrownstoneError> {
        let checker = RssiChecker::new(address.clone());
        self.scan_with(Topic::RawAdvertisement, checker, duration, false, RssiChecker::average)
            .await
    }

    /// Nearest device advertising as a Crownstone, keys not checked.
    ///
    /// With `return_first_acceptable` the scan ends at the first device
    /// at or above `rssi_at_least` instead of running the whole window.
    pub async fn get_nearest_crownstone(
        &self,
        rssi_at_least: i16,
        duration: Duration,
        return_first_acceptable: bool,
        addresses_to_exclude: &[BleAddress],
    ) -> Result<Option<NearestCandidate>, CrownstoneError> {
        let selector = NearestSelector::new(
            false,
            rssi_at_least,
            return_first_acceptable,
            addresses_to_exclude,
        );
        self.nearest(Topic::RawAdvertisement, selector, duration).await
    }

    /// Nearest Crownstone whose advertisements decode with our keys.
    pub async fn get_nearest_validated_crownstone(
        &self,
        rssi_at_least: i16,
        duration: Duration,
        return_first_acceptable: bool,
        addresses_to_exclude: &[BleAddress],
    ) -> Result<Option<NearestCandidate>, CrownstoneError> {
        let selector = NearestSelector::new(
            false,
            rssi_at_least,
            return_first_acceptable,
            addresses_to_exclude,
        );
        self.nearest(Topic::Advertisement, selector, duration).await
    }

    /// Nearest Crownstone in setup mode.
    pub async fn get_nearest_setup_crownstone(
        &self,
        rssi_at_least: i16,
        duration: Duration,
        return_first_acceptable: bool,
        addresses_to_exclude: &[BleAddress],
    ) -> Result<Option<NearestCandidate>, CrownstoneError> {
        let selector = NearestSelector::new(
            true,
            rssi_at_least,
            return_first_acceptable,
            addresses_to_exclude,
        );
        self.nearest(Topic::Advertisement, selector, duration).await
    }

    async fn nearest(
        &self,
        topic: Topic,
        selector: NearestSelector,
        duration: Duration,
    ) -> Result<Option<NearestCandidate>, CrownstoneError> {
        // Settles only with return_first_acceptable; the scan then ends early.
        self.scan_with(topic, selector, duration, true, |selector| {
            selector.nearest().cloned()
        })
        .await
    }

    async fn is_in_mode(
        &self,
        topic: Topic,
        address: &BleAddress,
        mode: OperationMode,
        duration: Duration,
        wait: bool,
    ) -> Result<bool, CrownstoneError> {
        let checker = ModeChecker::new(address.clone(), Some(mode), wait);
        let observed = self
            .scan_with(topic, checker, duration, false, ModeChecker::result)
            .await?;
        match observed {
            Some(observed) => Ok(observed == mode),
            None => Err(CrownstoneError::NoScansReceived {
                address: address.clone(),
                duration,
            }),
        }
    }

    /// Feed `handler` the advertisements on `topic` for one scan window.
    ///
    /// With `stop_early` the scan is aborted once the handler is settled.
    /// The subscription is released before the result is read.
    async fn scan_with<H, R, F>(
        &self,
        topic: Topic,
        handler: H,
        duration: Duration,
        stop_early: bool,
        finish: F,
    ) -> Result<R, CrownstoneError>
    where
        H: AdvertisementHandler + 'static,
        F: FnOnce(&H) -> R,
    {
        let handler = Arc::new(Mutex::new(handler));
        let sink = Arc::clone(&handler);
        let bus = Arc::downgrade(&self.bus);
        let subscription = self.bus.subscribe(topic, move |event| {
            let Some(advertisement) = event.advertisement() else {
                return Ok(());
            };
            let settled = {
                let mut handler = sink.lock().unwrap_or_else(PoisonError::into_inner);
                handler.handle_advertisement(advertisement);
                handler.is_settled()
            };
            if settled && stop_early {
                if let Some(bus) = bus.upgrade() {
                    bus.emit(BusEvent::AbortScanning);
                }
            }
            Ok(())
        });

        let scanned = self.scanner.scan(duration).await;
        self.bus.unsubscribe(subscription);
        scanned?;

        let handler = handler.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(finish(&*handler))
    }
}
