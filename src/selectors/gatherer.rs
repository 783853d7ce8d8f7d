use std::collections::HashMap;

use super::AdvertisementHandler;
use crate::ble::transport::BleAddress;
use crate::protocol::advertisement::Advertisement;

/// Latest advertisement per address.
#[derive(Debug, Default)]
pub struct Gatherer {
    latest: HashMap<BleAddress, Advertisement>,
}

impl Gatherer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    /// Snapshot sorted by address.
    pub fn collection(&self) -> Vec<Advertisement> {
        let mut collection: Vec<Advertisement> = self.latest.values().cloned().collect();
        collection.sort_by(|a, b| a.address.cmp(&b.address));
        collection
    }
}

impl AdvertisementHandler for Gatherer {
    fn handle_advertisement(&mut self, advertisement: &Advertisement) {
        self.latest
            .insert(advertisement.address.clone(), advertisement.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selectors::tests::advertisement;
    use crate::protocol::advertisement::OperationMode;

    #[test]
    fn test_keeps_latest_per_address() {
        let mut gatherer = Gatherer::new();
        gatherer.handle_advertisement(&advertisement("bb:00:00:00:00:01", -80, OperationMode::Normal));
        gatherer.handle_advertisement(&advertisement("AA:00:00:00:00:02", -70, OperationMode::Setup));
        gatherer.handle_advertisement(&advertisement("BB:00:00:00:00:01", -40, OperationMode::Normal));

        let collection = gatherer.collection();
        assert_eq!(collection.len(), 2);
        assert_eq!(collection[0].address.as_str(), "aa:00:00:00:00:02");
        assert_eq!(collection[1].rssi, -40);
    }
}
