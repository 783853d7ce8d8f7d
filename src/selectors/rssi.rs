use super::AdvertisementHandler;
use crate::ble::transport::BleAddress;
use crate::protocol::advertisement::Advertisement;

/// Running mean of the signal strength of one address.
#[derive(Debug)]
pub struct RssiChecker {
    address: BleAddress,
    sum: i64,
    count: u32,
}

impl RssiChecker {
    pub fn new(address: BleAddress) -> Self {
        Self {
            address,
            sum: 0,
            count: 0,
        }
    }

    pub fn sample_count(&self) -> u32 {
        self.count
    }

    /// Mean RSSI, or `None` without samples.
    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum as f64 / self.count as f64)
    }
}

impl AdvertisementHandler for RssiChecker {
    fn handle_advertisement(&mut self, advertisement: &Advertisement) {
        if advertisement.address == self.address {
            self.sum += i64::from(advertisement.rssi);
            self.count += 1;
        }
    }
}
