//! Radio scanning and advertisement republishing
//!
//! Scan records are decoded as they arrive and published on the bus twice:
//! every record under `RawAdvertisement`, and those that decoded with the
//! current keys under `Advertisement` as well.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::ble::transport::{BleTransport, ScanRecord};
use crate::config::EngineConfig;
use crate::error::CrownstoneError;
use crate::event_bus::{BusEvent, EventBus, Topic};
use crate::protocol::advertisement::Advertisement;
use crate::session::EncryptionSession;

pub struct ScanPipeline {
    transport: Arc<dyn BleTransport>,
    bus: Arc<EventBus>,
    session: Arc<EncryptionSession>,
    scanning: AtomicBool,
    aborted: Arc<AtomicBool>,
    abort_subscription: Uuid,
    tick: Duration,
}

impl ScanPipeline {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        bus: Arc<EventBus>,
        session: Arc<EncryptionSession>,
        config: &EngineConfig,
    ) -> Arc<Self> {
        let aborted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&aborted);
        let abort_subscription = bus.subscribe(Topic::AbortScanning, move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        Arc::new(Self {
            transport,
            bus,
            session,
            scanning: AtomicBool::new(false),
            aborted,
            abort_subscription,
            tick: config.scan_tick,
        })
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Start the radio. Clears a pending abort; does nothing else if
    /// already scanning.
    pub async fn start_scanning(&self) -> Result<(), CrownstoneError> {
        self.aborted.store(false, Ordering::SeqCst);
        if self.scanning.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        log::debug!("Starting scan");
        let bus = Arc::clone(&self.bus);
        let session = Arc::clone(&self.session);
        let on_discovery = Arc::new(move |record: ScanRecord| {
            let advertisement = Advertisement::decode(&record, &session.keys());
            let validated = advertisement.validated;
            bus.emit(BusEvent::RawAdvertisement(advertisement.clone()));
            if validated {
                bus.emit(BusEvent::Advertisement(advertisement));
            }
        });

        if let Err(e) = self.transport.start_scan(on_discovery).await {
            self.scanning.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        Ok(())
    }

    /// Stop the radio. Does nothing if not scanning.
    pub async fn stop_scanning(&self) -> Result<(), CrownstoneError> {
        self.aborted.store(false, Ordering::SeqCst);
        if !self.scanning.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("Stopping scan");
        Ok(self.transport.stop_scan().await?)
    }

    /// Scan for `duration`, or until an abort is published.
    ///
    /// The countdown runs in ticks and checks the abort flag once per tick,
    /// so the scan ends on the first tick boundary after an abort.
    pub async fn scan(&self, duration: Duration) -> Result<(), CrownstoneError> {
        self.start_scanning().await?;

        let mut remaining = duration;
        while !remaining.is_zero() && !self.aborted.load(Ordering::SeqCst) {
            tokio::time::sleep(self.tick).await;
            remaining = remaining.saturating_sub(self.tick);
        }
        if self.aborted.load(Ordering::SeqCst) {
            log::debug!("Scan aborted with {:?} remaining", remaining);
        }

        self.stop_scanning().await
    }

    /// Publish an abort for whichever scan is running.
    pub fn abort(&self) {
        self.bus.emit(BusEvent::AbortScanning);
    }

    /// Release the abort subscription and stop the radio.
    pub async fn shut_down(&self) -> Result<(), CrownstoneError> {
        self.bus.unsubscribe(self.abort_subscription);
        self.stop_scanning().await
    }
}
