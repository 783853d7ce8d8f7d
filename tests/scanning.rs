//! Scan based query integration tests
//!
//! Simulated Crownstones advertise on a schedule while the engine scans;
//! each test checks what one of the scan queries makes of it.
//!
//! Run with:
//!   cargo test --test scanning

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crownstone_ble::ble::simulated::SimAdapter;
use crownstone_ble::ble::transport::ScanRecord;
use crownstone_ble::simulated_crownstone::SimCrownstone;
use crownstone_ble::{
    BleAddress, CrownstoneBle, CrownstoneError, EngineConfig, KeySet, OperationMode, Topic,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const FIRST: &str = "aa:00:00:00:00:01";
const SECOND: &str = "aa:00:00:00:00:02";
const THIRD: &str = "aa:00:00:00:00:03";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn engine() -> (SimAdapter, CrownstoneBle) {
    init_logging();
    let adapter = SimAdapter::new();
    let ble = CrownstoneBle::new(Arc::new(adapter.clone()), EngineConfig::default());
    (adapter, ble)
}

fn record(address: &str, mode: OperationMode, rssi: i16) -> ScanRecord {
    SimCrownstone::new(address, KeySet::default()).scan_record(mode, rssi)
}

/// Deliver each record at its offset from now, in order.
fn advertise_at(adapter: &SimAdapter, schedule: Vec<(u64, ScanRecord)>) {
    let adapter = adapter.clone();
    tokio::spawn(async move {
        let start = Instant::now();
        for (offset, record) in schedule {
            tokio::time::sleep_until(start + Duration::from_millis(offset)).await;
            adapter.advertise(record);
        }
    });
}

fn addresses(addresses: &[&str]) -> Vec<BleAddress> {
    addresses.iter().map(|a| BleAddress::new(a)).collect()
}

// ---------------------------------------------------------------------------
// Mode queries
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_get_mode_stops_scanning_once_known() {
    let (adapter, ble) = engine();
    advertise_at(
        &adapter,
        vec![(150, record(FIRST, OperationMode::Setup, -60))],
    );

    let start = Instant::now();
    let mode = ble
        .get_mode(&BleAddress::new(FIRST), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(mode, OperationMode::Setup);
    assert_eq!(start.elapsed(), Duration::from_millis(200));
    assert!(!adapter.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn test_get_mode_of_absent_device() {
    let (adapter, ble) = engine();
    advertise_at(
        &adapter,
        vec![(150, record(SECOND, OperationMode::Normal, -60))],
    );

    let err = ble
        .get_mode(&BleAddress::new(FIRST), Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(matches!(err, CrownstoneError::NoScansReceived { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_get_mode_reports_dfu() {
    let (adapter, ble) = engine();
    advertise_at(&adapter, vec![(50, record(FIRST, OperationMode::Dfu, -60))]);

    let mode = ble
        .get_mode(&BleAddress::new(FIRST), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(mode, OperationMode::Dfu);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_mode_follows_whole_window() {
    let (adapter, ble) = engine();
    advertise_at(
        &adapter,
        vec![
            (150, record(FIRST, OperationMode::Normal, -60)),
            (350, record(FIRST, OperationMode::Setup, -60)),
            (550, record(FIRST, OperationMode::Normal, -60)),
        ],
    );

    let start = Instant::now();
    let err = ble
        .wait_for_mode(
            &BleAddress::new(FIRST),
            OperationMode::Setup,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

    assert_eq!(start.elapsed(), Duration::from_secs(1));
    match err {
        CrownstoneError::ModeMismatch {
            required, observed, ..
        } => {
            assert_eq!(required, OperationMode::Setup);
            assert_eq!(observed, OperationMode::Normal);
        }
        other => panic!("expected ModeMismatch, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_mode_succeeds_when_last_mode_matches() {
    let (adapter, ble) = engine();
    advertise_at(
        &adapter,
        vec![
            (150, record(FIRST, OperationMode::Setup, -60)),
            (350, record(FIRST, OperationMode::Normal, -60)),
        ],
    );

    ble.wait_for_mode(
        &BleAddress::new(FIRST),
        OperationMode::Normal,
        Duration::from_secs(1),
    )
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_mode_without_scans() {
    let (_adapter, ble) = engine();

    let err = ble
        .wait_for_mode(
            &BleAddress::new(FIRST),
            OperationMode::Normal,
            Duration::from_millis(300),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CrownstoneError::NoScansReceived { .. }));
}

#[tokio::test(start_paused = true)]
#[allow(deprecated)]
async fn test_deprecated_mode_checks() {
    let (adapter, ble) = engine();
    advertise_at(
        &adapter,
        vec![
            (50, record(FIRST, OperationMode::Setup, -60)),
            (350, record(FIRST, OperationMode::Setup, -60)),
        ],
    );

    let address = BleAddress::new(FIRST);
    assert!(ble
        .is_crownstone_in_setup_mode(&address, Duration::from_millis(300), false)
        .await
        .unwrap());
    assert!(!ble
        .is_crownstone_in_normal_mode(&address, Duration::from_millis(300), false)
        .await
        .unwrap());
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

fn three_normal_devices() -> Vec<(u64, ScanRecord)> {
    vec![
        (50, record(FIRST, OperationMode::Normal, -90)),
        (100, record(SECOND, OperationMode::Normal, -60)),
        (150, record(THIRD, OperationMode::Normal, -50)),
    ]
}

#[tokio::test(start_paused = true)]
async fn test_nearest_crownstone() {
    let (adapter, ble) = engine();
    advertise_at(&adapter, three_normal_devices());

    let nearest = ble
        .get_nearest_crownstone(-100, Duration::from_millis(500), false, &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(nearest.address, BleAddress::new(THIRD));
    assert_eq!(nearest.rssi, -50);
}

#[tokio::test(start_paused = true)]
async fn test_nearest_crownstone_honours_exclusions() {
    let (adapter, ble) = engine();
    advertise_at(&adapter, three_normal_devices());

    let nearest = ble
        .get_nearest_crownstone(-100, Duration::from_millis(500), false, &addresses(&[THIRD]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(nearest.address, BleAddress::new(SECOND));
}

#[tokio::test(start_paused = true)]
async fn test_nearest_crownstone_first_acceptable() {
    let (adapter, ble) = engine();
    advertise_at(&adapter, three_normal_devices());

    let nearest = ble
        .get_nearest_crownstone(-70, Duration::from_millis(500), true, &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(nearest.address, BleAddress::new(SECOND));
}

#[tokio::test(start_paused = true)]
async fn test_first_acceptable_ends_scan_early() {
    let (adapter, ble) = engine();
    advertise_at(
        &adapter,
        vec![
            (50, record(FIRST, OperationMode::Normal, -90)),
            (150, record(SECOND, OperationMode::Normal, -60)),
            (250, record(THIRD, OperationMode::Normal, -50)),
        ],
    );

    let start = Instant::now();
    let nearest = ble
        .get_nearest_crownstone(-70, Duration::from_secs(5), true, &[])
        .await
        .unwrap()
        .unwrap();

    assert_eq!(nearest.address, BleAddress::new(SECOND));
    assert_eq!(start.elapsed(), Duration::from_millis(200));
    assert!(!adapter.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn test_nearest_crownstone_below_threshold() {
    let (adapter, ble) = engine();
    advertise_at(&adapter, three_normal_devices());

    let nearest = ble
        .get_nearest_crownstone(-40, Duration::from_millis(500), false, &[])
        .await
        .unwrap();
    assert!(nearest.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_nearest_setup_crownstone() {
    let (adapter, ble) = engine();
    advertise_at(
        &adapter,
        vec![
            (50, record(FIRST, OperationMode::Normal, -40)),
            (100, record(SECOND, OperationMode::Setup, -80)),
        ],
    );

    let nearest = ble
        .get_nearest_setup_crownstone(-100, Duration::from_millis(300), false, &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(nearest.address, BleAddress::new(SECOND));
    assert_eq!(nearest.operation_mode, OperationMode::Setup);
}

#[tokio::test(start_paused = true)]
async fn test_nearest_validated_needs_matching_keys() {
    let (adapter, ble) = engine();
    let foreign = KeySet::from_strings(
        "0123456789abcdef",
        "0123456789abcdef",
        "0123456789abcdef",
        "fedcba9876543210",
        "0123456789abcdef",
        "0123456789abcdef",
        "0123456789abcdef",
    )
    .unwrap();
    let stranger = SimCrownstone::new(FIRST, foreign).scan_record(OperationMode::Normal, -40);
    advertise_at(
        &adapter,
        vec![
            (50, stranger),
            (100, record(SECOND, OperationMode::Normal, -70)),
        ],
    );

    let nearest = ble
        .get_nearest_validated_crownstone(-100, Duration::from_millis(300), false, &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(nearest.address, BleAddress::new(SECOND));
    assert!(nearest.validated);
}

#[tokio::test(start_paused = true)]
async fn test_rssi_average() {
    let (adapter, ble) = engine();
    advertise_at(
        &adapter,
        vec![
            (50, record(FIRST, OperationMode::Normal, -50)),
            (100, record(SECOND, OperationMode::Normal, -90)),
            (150, record(FIRST, OperationMode::Normal, -60)),
        ],
    );

    let average = ble
        .get_rssi_average(&BleAddress::new(FIRST), Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(average, Some(-55.0));

    let silent = ble
        .get_rssi_average(&BleAddress::new(THIRD), Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(silent, None);
}

#[tokio::test(start_paused = true)]
async fn test_get_crownstones_by_scanning() {
    let (adapter, ble) = engine();
    advertise_at(
        &adapter,
        vec![
            (50, record(SECOND, OperationMode::Normal, -70)),
            (100, record(FIRST, OperationMode::Setup, -60)),
            (150, record(SECOND, OperationMode::Normal, -65)),
        ],
    );

    let found = ble
        .get_crownstones_by_scanning(Duration::from_millis(300))
        .await
        .unwrap();

    let seen: Vec<(BleAddress, i16)> = found.iter().map(|a| (a.address.clone(), a.rssi)).collect();
    assert_eq!(
        seen,
        vec![(BleAddress::new(FIRST), -60), (BleAddress::new(SECOND), -65)]
    );
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_queries_release_their_subscriptions() {
    let (adapter, ble) = engine();
    advertise_at(&adapter, three_normal_devices());

    ble.get_nearest_crownstone(-100, Duration::from_millis(300), false, &[])
        .await
        .unwrap();

    assert_eq!(ble.bus().subscriber_count(Topic::RawAdvertisement), 0);
    assert_eq!(ble.bus().subscriber_count(Topic::Advertisement), 0);
    assert_eq!(ble.bus().subscriber_count(Topic::AbortScanning), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abort_scanning_ends_scan() {
    let (adapter, ble) = engine();
    let ble = Arc::new(ble);
    let aborter = Arc::clone(&ble);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        aborter.abort_scanning();
    });

    let start = Instant::now();
    ble.start_scanning(Duration::from_secs(10)).await.unwrap();
    assert_eq!(start.elapsed(), Duration::from_millis(300));
    assert!(!adapter.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn test_shut_down_clears_everything() {
    let (adapter, ble) = engine();
    ble.bus().subscribe(Topic::Advertisement, |_| Ok(()));

    ble.shut_down().await.unwrap();

    assert!(!adapter.is_scanning());
    for topic in [
        Topic::RawAdvertisement,
        Topic::Advertisement,
        Topic::ForcedDisconnect,
        Topic::AbortScanning,
    ] {
        assert_eq!(ble.bus().subscriber_count(topic), 0);
    }
}
