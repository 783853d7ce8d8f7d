use std::collections::HashSet;

use serde::Serialize;

use super::AdvertisementHandler;
use crate::ble::transport::BleAddress;
use crate::protocol::advertisement::{Advertisement, OperationMode};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearestCandidate {
    pub address: BleAddress,
    pub name: Option<String>,
    pub rssi: i16,
    pub operation_mode: OperationMode,
    pub validated: bool,
}

impl From<&Advertisement> for NearestCandidate {
    fn from(advertisement: &Advertisement) -> Self {
        Self {
            address: advertisement.address.clone(),
            name: advertisement.name.clone(),
            rssi: advertisement.rssi,
            operation_mode: advertisement.operation_mode,
            validated: advertisement.validated,
        }
    }
}

/// Picks the nearest Crownstone by signal strength.
#[derive(Debug)]
pub struct NearestSelector {
    want_setup_mode: bool,
    rssi_at_least: i16,
    return_first_acceptable: bool,
    excluded: HashSet<BleAddress>,
    nearest: Option<NearestCandidate>,
}

impl NearestSelector {
    pub fn new(
        want_setup_mode: bool,
        rssi_at_least: i16,
        return_first_acceptable: bool,
        addresses_to_exclude: &[BleAddress],
    ) -> Self {
        Self {
            want_setup_mode,
            rssi_at_least,
            return_first_acceptable,
            excluded: addresses_to_exclude.iter().cloned().collect(),
            nearest: None,
        }
    }

    pub fn nearest(&self) -> Option<&NearestCandidate> {
        self.nearest.as_ref()
    }

    pub fn into_nearest(self) -> Option<NearestCandidate> {
        self.nearest
    }

    fn wanted(&self, advertisement: &Advertisement) -> bool {
        let mode_matches = if self.want_setup_mode {
            advertisement.operation_mode == OperationMode::Setup
        } else {
            advertisement.is_crownstone()
        };
        mode_matches
            && advertisement.rssi >= self.rssi_at_least
            && !self.excluded.contains(&advertisement.address)
    }
}

impl AdvertisementHandler for NearestSelector {
    fn handle_advertisement(&mut self, advertisement: &Advertisement) {
        if self.is_settled() || !self.wanted(advertisement) {
            return;
        }
        let stronger = self
            .nearest
            .as_ref()
            .map_or(true, |current| advertisement.rssi > current.rssi);
        if stronger {
            self.nearest = Some(NearestCandidate::from(advertisement));
        }
    }

    fn is_settled(&self) -> bool {
        self.return_first_acceptable && self.nearest.is_some()
    }
}
