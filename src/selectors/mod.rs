//! Per-query reducers over the advertisement stream
//!
//! Each selector is built fresh for one query, fed every advertisement of
//! one scan window and then asked for its answer.

mod gatherer;
mod mode;
mod nearest;
mod rssi;

pub use gatherer::Gatherer;
pub use mode::ModeChecker;
pub use nearest::{NearestCandidate, NearestSelector};
pub use rssi::RssiChecker;

use crate::protocol::advertisement::Advertisement;

pub trait AdvertisementHandler: Send {
    fn handle_advertisement(&mut self, advertisement: &Advertisement);

    /// True once further advertisements cannot change the answer.
    fn is_settled(&self) -> bool {
        false
    }
}
