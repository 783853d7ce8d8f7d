//! GATT and advertisement identifiers used by Crownstones.

use uuid::Uuid;

/// Primary Crownstone GATT service.
pub const CROWNSTONE_SERVICE: Uuid = Uuid::from_u128(0x24f00000_7d10_4805_bfc1_76663a9c3bff);

/// Control characteristic: encrypted command packets are written here.
pub const CONTROL_CHARACTERISTIC: Uuid = Uuid::from_u128(0x24f0000c_7d10_4805_bfc1_76663a9c3bff);

/// Result characteristic: command results arrive as notifications.
pub const RESULT_CHARACTERISTIC: Uuid = Uuid::from_u128(0x24f0000d_7d10_4805_bfc1_76663a9c3bff);

/// Session data characteristic, read during the handshake.
pub const SESSION_DATA_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x24f0000e_7d10_4805_bfc1_76663a9c3bff);

/// Factory reset characteristic used by the recovery flow.
pub const FACTORY_RESET_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x24f00009_7d10_4805_bfc1_76663a9c3bff);

/// 16-bit service data ids a Crownstone advertises under.
pub const SERVICE_DATA_PLUG: u16 = 0xC001;
pub const SERVICE_DATA_BUILTIN: u16 = 0xC002;
pub const SERVICE_DATA_GUIDESTONE: u16 = 0xC003;
pub const SERVICE_DATA_DONGLE: u16 = 0xC004;

/// Nordic secure DFU service, advertised by devices in bootloader mode.
pub const SERVICE_DATA_DFU: u16 = 0xFE59;

pub const CROWNSTONE_SERVICE_DATA_IDS: [u16; 4] = [
    SERVICE_DATA_PLUG,
    SERVICE_DATA_BUILTIN,
    SERVICE_DATA_GUIDESTONE,
    SERVICE_DATA_DONGLE,
];
