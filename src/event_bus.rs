//! Topic keyed publish/subscribe register
//!
//! One bus per engine instance. Delivery is synchronous: `emit` returns once
//! every subscriber present at call time has seen the event, in the order
//! they subscribed. Subscriptions belong to whoever created them; the bus
//! never drops one on its own.

use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::ble::transport::BleAddress;
use crate::protocol::advertisement::Advertisement;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every decoded scan record, validated or not.
    RawAdvertisement,
    /// Scan records whose service data decoded with the current keys.
    Advertisement,
    /// The link dropped without a local disconnect.
    ForcedDisconnect,
    /// Stop the running scan at its next tick.
    AbortScanning,
}

#[derive(Debug, Clone)]
pub enum BusEvent {
    RawAdvertisement(Advertisement),
    Advertisement(Advertisement),
    ForcedDisconnect(BleAddress),
    AbortScanning,
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::RawAdvertisement(_) => Topic::RawAdvertisement,
            BusEvent::Advertisement(_) => Topic::Advertisement,
            BusEvent::ForcedDisconnect(_) => Topic::ForcedDisconnect,
            BusEvent::AbortScanning => Topic::AbortScanning,
        }
    }

    /// The advertisement carried by either advertisement topic.
    pub fn advertisement(&self) -> Option<&Advertisement> {
        match self {
            BusEvent::RawAdvertisement(advertisement) | BusEvent::Advertisement(advertisement) => {
                Some(advertisement)
            }
            _ => None,
        }
    }
}

pub type SubscriberCallback = Arc<dyn Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync>;

struct Subscriber {
    id: Uuid,
    topic: Topic,
    callback: SubscriberCallback,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `callback` for `topic`. Returns an opaque subscription id.
    pub fn subscribe<F>(&self, topic: Topic, callback: F) -> Uuid
    where
        F: Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.lock().push(Subscriber {
            id,
            topic,
            callback: Arc::new(callback),
        });
        id
    }

    /// Remove a subscription. Unknown or already removed ids are ignored.
    pub fn unsubscribe(&self, id: Uuid) {
        self.lock().retain(|subscriber| subscriber.id != id);
    }

    /// Deliver `event` to the subscribers of its topic.
    ///
    /// Subscribers added while an emission is running are not called for it.
    /// A failing subscriber is logged and skipped.
    pub fn emit(&self, event: BusEvent) {
        let topic = event.topic();
        let snapshot: Vec<(Uuid, SubscriberCallback)> = self
            .lock()
            .iter()
            .filter(|subscriber| subscriber.topic == topic)
            .map(|subscriber| (subscriber.id, Arc::clone(&subscriber.callback)))
            .collect();

        for (id, callback) in snapshot {
            if let Err(e) = callback(&event) {
                log::warn!("Subscriber {} failed on {:?}: {:#}", id, topic, e);
            }
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.lock()
            .iter()
            .filter(|subscriber| subscriber.topic == topic)
            .count()
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
