//! Connection and control integration tests
//!
//! Drives the engine against a simulated Crownstone: session handshake,
//! encrypted control writes, result notifications, microapp management and
//! the factory reset recovery procedure.
//!
//! Run with:
//!   cargo test --test control

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crownstone_ble::ble::simulated::SimAdapter;
use crownstone_ble::protocol::control::{
    relay_packet, ControlPacket, ControlType, StatePacket, STATE_CURRENT_THRESHOLD_DIMMER,
};
use crownstone_ble::protocol::crypto::CryptoError;
use crownstone_ble::protocol::microapp::{MAX_MICROAPP_SIZE, MICROAPP_PROTOCOL};
use crownstone_ble::protocol::result::{ResultCode, ResultPacket};
use crownstone_ble::protocol::uuids::RESULT_CHARACTERISTIC;
use crownstone_ble::simulated_crownstone::{RecoveryBehaviour, SimCrownstone, RESULT_HANDLE};
use crownstone_ble::{
    BleAddress, BusEvent, CrownstoneBle, CrownstoneError, EngineConfig, KeySet, Topic,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const ADDRESS: &str = "E4:1F:0A:33:21:90";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn setup() -> (SimAdapter, SimCrownstone, CrownstoneBle) {
    setup_with(EngineConfig::default())
}

fn setup_with(config: EngineConfig) -> (SimAdapter, SimCrownstone, CrownstoneBle) {
    init_logging();
    let adapter = SimAdapter::new();
    let crownstone = SimCrownstone::new(ADDRESS, KeySet::default());
    adapter.add_peripheral(crownstone.peripheral());
    let ble = CrownstoneBle::new(Arc::new(adapter.clone()), config);
    (adapter, crownstone, ble)
}

async fn connected() -> (SimAdapter, SimCrownstone, CrownstoneBle) {
    let (adapter, crownstone, ble) = setup();
    ble.connect(&BleAddress::new(ADDRESS), false).await.unwrap();
    (adapter, crownstone, ble)
}

fn record_forced_disconnects(ble: &CrownstoneBle) -> Arc<Mutex<Vec<BleAddress>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    ble.bus().subscribe(Topic::ForcedDisconnect, move |event| {
        if let BusEvent::ForcedDisconnect(address) = event {
            sink.lock().unwrap().push(address.clone());
        }
        Ok(())
    });
    seen
}

// ---------------------------------------------------------------------------
// Connection and session
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_connect_establishes_session() {
    let (adapter, _crownstone, ble) = connected().await;

    assert!(ble.is_connected());
    assert!(ble.connection().session().has_session());
    assert_eq!(adapter.connected_address(), Some(BleAddress::new(ADDRESS)));
}

#[tokio::test(start_paused = true)]
async fn test_connect_with_bad_session_data_fails_and_disconnects() {
    let (adapter, crownstone, ble) = setup();
    crownstone.corrupt_session_data();

    let err = ble
        .connect(&BleAddress::new(ADDRESS), false)
        .await
        .unwrap_err();
    assert!(matches!(err, CrownstoneError::SessionValidationFailed));
    assert!(!ble.is_connected());
    assert_eq!(adapter.connected_address(), None);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_is_reported_and_retryable() {
    let (adapter, _crownstone, ble) = setup();
    adapter.fail_next_connects(1);

    let err = ble
        .connect(&BleAddress::new(ADDRESS), false)
        .await
        .unwrap_err();
    assert!(matches!(err, CrownstoneError::ConnectionFailed { .. }));
    assert!(!ble.is_connected());

    ble.connect(&BleAddress::new(ADDRESS), false).await.unwrap();
    assert!(ble.is_connected());
    assert_eq!(adapter.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_forced_disconnect_clears_session_and_notifies() {
    let (adapter, _crownstone, ble) = connected().await;
    let forced = record_forced_disconnects(&ble);

    assert!(adapter.force_disconnect());

    assert!(!ble.is_connected());
    assert!(!ble.connection().session().has_session());
    assert_eq!(*forced.lock().unwrap(), vec![BleAddress::new(ADDRESS)]);

    let err = ble.control.set_switch(100).await.unwrap_err();
    assert!(matches!(err, CrownstoneError::NotConnected));
}

// ---------------------------------------------------------------------------
// Control commands
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_switch_command_reaches_device() {
    let (_adapter, crownstone, ble) = connected().await;

    ble.control.set_switch(100).await.unwrap();
    ble.control.set_relay(false).await.unwrap();

    assert_eq!(
        crownstone.commands(),
        vec![
            ControlPacket::with_payload(ControlType::Switch, vec![100]),
            ControlPacket::with_payload(ControlType::Relay, vec![0]),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_encrypted_write_without_session_fails() {
    let (_adapter, crownstone, ble) = setup();
    ble.connect(&BleAddress::new(ADDRESS), true).await.unwrap();

    let err = ble.control.set_switch(0).await.unwrap_err();
    assert!(matches!(err, CrownstoneError::Crypto(CryptoError::NoSession)));
    assert!(crownstone.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_write_control_and_get_result() {
    let (adapter, _crownstone, ble) = connected().await;

    let result: ResultPacket = ble
        .control
        .write_control_and_get_result(relay_packet(true))
        .await
        .unwrap();
    assert_eq!(result.command_type, ControlType::Relay.as_u16());
    assert_eq!(result.result_code, ResultCode::Success);

    assert!(!adapter.subscribed_handles().contains(&RESULT_HANDLE));
    assert!(!ble
        .connection()
        .has_notification_subscription(RESULT_CHARACTERISTIC));
}

#[tokio::test(start_paused = true)]
async fn test_silent_device_times_out_after_tick_bound() {
    let (adapter, crownstone, ble) = connected().await;
    crownstone.set_silent(true);

    let start = Instant::now();
    let err = ble
        .control
        .write_control_and_get_result(relay_packet(true))
        .await
        .unwrap_err();

    assert!(matches!(err, CrownstoneError::NoNotificationData));
    assert_eq!(start.elapsed(), Duration::from_millis(12_500));
    assert!(adapter.subscribed_handles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_command_tolerates_peer_disconnect() {
    let (adapter, crownstone, ble) = connected().await;
    let forced = record_forced_disconnects(&ble);

    ble.control.disconnect_command().await.unwrap();

    assert!(!ble.is_connected());
    assert_eq!(adapter.connected_address(), None);
    assert_eq!(
        crownstone.commands().last().map(|p| p.control_type),
        Some(ControlType::Disconnect)
    );
    assert_eq!(forced.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_current_threshold_dimmer_set_then_get() {
    let (_adapter, crownstone, ble) = connected().await;

    assert_eq!(ble.control.get_current_threshold_dimmer().await.unwrap(), 1.0);

    ble.control.set_current_threshold_dimmer(0.5).await.unwrap();
    assert_eq!(
        crownstone.state_value(STATE_CURRENT_THRESHOLD_DIMMER),
        Some(500u16.to_le_bytes().to_vec())
    );
    assert_eq!(ble.control.get_current_threshold_dimmer().await.unwrap(), 0.5);

    let commands = crownstone.commands();
    assert_eq!(commands.len(), 3);
    assert_eq!(commands[1].control_type, ControlType::StateSet);
    let set = StatePacket::parse(&commands[1].payload).unwrap();
    assert_eq!(set.state_type, STATE_CURRENT_THRESHOLD_DIMMER);
    assert_eq!(set.value, vec![0xF4, 0x01]);
    assert_eq!(commands[2].control_type, ControlType::StateGet);
}

#[tokio::test(start_paused = true)]
async fn test_current_threshold_dimmer_out_of_range() {
    let (_adapter, crownstone, ble) = connected().await;

    for amps in [-0.1, 70.0, f32::NAN] {
        let err = ble
            .control
            .set_current_threshold_dimmer(amps)
            .await
            .unwrap_err();
        assert!(matches!(err, CrownstoneError::InvalidArgument(_)));
    }
    assert!(crownstone.commands().is_empty());
}

// ---------------------------------------------------------------------------
// Microapps
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_get_microapp_info() {
    let (_adapter, _crownstone, ble) = connected().await;

    let info = ble.control.get_microapp_info(0).await.unwrap();
    assert_eq!(info.max_apps, 1);
    assert_eq!(info.max_chunk_size, 256);
    assert_eq!(info.slots.len(), 1);
    assert!(!info.slots[0].enabled);
}

#[tokio::test(start_paused = true)]
async fn test_upload_microapp_sends_every_chunk() {
    let (adapter, crownstone, ble) = connected().await;
    let binary: Vec<u8> = (0..301u32).map(|i| (i % 251) as u8).collect();

    ble.control.upload_microapp(0, binary.clone()).await.unwrap();

    assert_eq!(crownstone.chunks_received(), 3);
    let stored = crownstone.microapp();
    assert_eq!(stored.len(), 304);
    assert_eq!(&stored[..301], binary.as_slice());
    assert!(stored[301..].iter().all(|b| *b == 0xFF));
    assert!(adapter.subscribed_handles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_upload_microapp_aborts_on_rejected_chunk() {
    let (_adapter, crownstone, ble) = connected().await;
    crownstone.reject_chunk(1);

    let err = ble
        .control
        .upload_microapp(0, vec![0xAB; 300])
        .await
        .unwrap_err();

    match err {
        CrownstoneError::StreamAborted { payload } => {
            let result = ResultPacket::parse(&payload).unwrap();
            assert_eq!(result.result_code, ResultCode::WrongPayloadLength);
        }
        other => panic!("expected StreamAborted, got {other:?}"),
    }
    assert_eq!(crownstone.chunks_received(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_upload_empty_microapp_is_rejected() {
    let (_adapter, crownstone, ble) = connected().await;

    let err = ble.control.upload_microapp(0, Vec::new()).await.unwrap_err();
    assert!(matches!(err, CrownstoneError::InvalidArgument(_)));
    assert!(crownstone.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_upload_oversized_microapp_is_rejected() {
    let (_adapter, crownstone, ble) = connected().await;

    let err = ble
        .control
        .upload_microapp(0, vec![0x5A; MAX_MICROAPP_SIZE + 1])
        .await
        .unwrap_err();
    assert!(matches!(err, CrownstoneError::InvalidArgument(_)));
    assert!(crownstone.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_upload_with_overflowing_timeout_is_rejected() {
    let config = EngineConfig {
        microapp_chunk_timeout: Duration::MAX,
        ..EngineConfig::default()
    };
    let (_adapter, crownstone, ble) = setup_with(config);
    ble.connect(&BleAddress::new(ADDRESS), false).await.unwrap();

    let err = ble
        .control
        .upload_microapp(0, vec![0xAB; 300])
        .await
        .unwrap_err();
    assert!(matches!(err, CrownstoneError::InvalidArgument(_)));
    assert!(crownstone.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_microapp_lifecycle_commands() {
    let (_adapter, crownstone, ble) = connected().await;

    ble.control.validate_microapp(0).await.unwrap();
    ble.control.enable_microapp(0).await.unwrap();
    ble.control.disable_microapp(0).await.unwrap();
    ble.control.remove_microapp(0).await.unwrap();

    let commands = crownstone.commands();
    let types: Vec<ControlType> = commands.iter().map(|p| p.control_type).collect();
    assert_eq!(
        types,
        vec![
            ControlType::MicroappValidate,
            ControlType::MicroappEnable,
            ControlType::MicroappDisable,
            ControlType::MicroappRemove,
        ]
    );
    assert!(commands
        .iter()
        .all(|p| p.payload == vec![0, MICROAPP_PROTOCOL]));
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_recovery_runs_two_attempts() {
    let (adapter, crownstone, ble) = setup();

    let start = Instant::now();
    ble.control.recovery(&BleAddress::new(ADDRESS)).await.unwrap();

    assert_eq!(start.elapsed(), Duration::from_secs(7));
    assert_eq!(crownstone.recovery_writes(), 2);
    assert_eq!(adapter.connect_count(), 2);
    assert!(!ble.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_recovery_accepts_peer_disconnect() {
    let (adapter, crownstone, ble) = setup();
    crownstone.set_recovery_behaviour(RecoveryBehaviour::AcceptAndDisconnect);

    ble.control.recovery(&BleAddress::new(ADDRESS)).await.unwrap();

    assert_eq!(crownstone.recovery_writes(), 2);
    assert_eq!(adapter.connected_address(), None);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_disabled_by_owner() {
    let (_adapter, crownstone, ble) = setup();
    crownstone.set_recovery_behaviour(RecoveryBehaviour::Disabled);

    let err = ble
        .control
        .recovery(&BleAddress::new(ADDRESS))
        .await
        .unwrap_err();

    assert!(matches!(err, CrownstoneError::RecoveryModeDisabled));
    assert_eq!(crownstone.recovery_writes(), 1);
    assert!(!ble.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_recovery_failure_survives_failed_disconnect() {
    let (adapter, crownstone, ble) = setup();
    crownstone.set_recovery_behaviour(RecoveryBehaviour::Disabled);
    adapter.fail_next_disconnects(1);

    let err = ble
        .control
        .recovery(&BleAddress::new(ADDRESS))
        .await
        .unwrap_err();

    assert!(matches!(err, CrownstoneError::RecoveryModeDisabled));
    assert_eq!(crownstone.recovery_writes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_reports_failed_disconnect_after_success() {
    let (adapter, crownstone, ble) = setup();
    adapter.fail_next_disconnects(1);

    let err = ble
        .control
        .recovery(&BleAddress::new(ADDRESS))
        .await
        .unwrap_err();

    assert!(matches!(err, CrownstoneError::Transport(_)));
    assert_eq!(crownstone.recovery_writes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_window_expired() {
    let (_adapter, crownstone, ble) = setup();
    crownstone.set_recovery_behaviour(RecoveryBehaviour::Expired);

    let err = ble
        .control
        .recovery(&BleAddress::new(ADDRESS))
        .await
        .unwrap_err();

    assert!(matches!(err, CrownstoneError::NotInRecoveryMode));
    assert!(!ble.is_connected());
}
