use super::AdvertisementHandler;
use crate::ble::transport::BleAddress;
use crate::protocol::advertisement::{Advertisement, OperationMode};

/// Tracks the operation mode one address advertises.
///
/// Reports the last mode seen. Without `wait_until_required` the checker is
/// settled by the first observation, so a caller may end the scan there.
/// With it the address is followed for the whole window; comparing the
/// result to the required mode is up to the caller.
#[derive(Debug)]
pub struct ModeChecker {
    address: BleAddress,
    required: Option<OperationMode>,
    wait_until_required: bool,
    observed: Option<OperationMode>,
}

impl ModeChecker {
    pub fn new(
        address: BleAddress,
        required: Option<OperationMode>,
        wait_until_required: bool,
    ) -> Self {
        Self {
            address,
            required,
            wait_until_required,
            observed: None,
        }
    }

    pub fn required(&self) -> Option<OperationMode> {
        self.required
    }

    /// Last observed mode, `None` if the address was never seen.
    pub fn result(&self) -> Option<OperationMode> {
        self.observed
    }
}

impl AdvertisementHandler for ModeChecker {
    fn handle_advertisement(&mut self, advertisement: &Advertisement) {
        if advertisement.address != self.address {
            return;
        }
        self.observed = Some(advertisement.operation_mode);
    }

    fn is_settled(&self) -> bool {
        !self.wait_until_required && self.observed.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selectors::tests::advertisement;

    const ADDRESS: &str = "dd:00:00:00:00:01";

    fn feed(checker: &mut ModeChecker, modes: &[OperationMode]) {
        for mode in modes {
            checker.handle_advertisement(&advertisement("dd:00:00:00:00:99", -50, OperationMode::Dfu));
            checker.handle_advertisement(&advertisement(ADDRESS, -50, *mode));
        }
    }

    #[test]
    fn test_without_wait_settles_on_first_observation() {
        let mut checker = ModeChecker::new(BleAddress::new(ADDRESS), None, false);
        assert_eq!(checker.result(), None);
        assert!(!checker.is_settled());

        feed(&mut checker, &[OperationMode::Setup]);
        assert_eq!(checker.result(), Some(OperationMode::Setup));
        assert!(checker.is_settled());

        feed(&mut checker, &[OperationMode::Normal]);
        assert_eq!(checker.result(), Some(OperationMode::Normal));
    }

    #[test]
    fn test_wait_reports_last_observed_mode() {
        let mut checker =
            ModeChecker::new(BleAddress::new(ADDRESS), Some(OperationMode::Setup), true);
        feed(
            &mut checker,
            &[OperationMode::Normal, OperationMode::Setup, OperationMode::Normal],
        );
        assert_eq!(checker.result(), Some(OperationMode::Normal));
        assert_ne!(checker.result(), checker.required());
        assert!(!checker.is_settled());
    }
}
