//! Advertisement service data decoding
//!
//! Crownstones put `version u8 | device_type u8 | block (16)` in the service
//! data of their advertisements. Setup mode devices send the block in
//! plaintext; devices in normal mode encrypt it with the service data key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::crypto::{decrypt_ecb, encrypt_ecb, CryptoError, BLOCK_SIZE};
use super::uuids::{CROWNSTONE_SERVICE_DATA_IDS, SERVICE_DATA_DFU};
use super::{read_u16, read_u32};
use crate::ble::transport::{BleAddress, ScanRecord};
use crate::config::KeySet;

const SETUP_VERSION: u8 = 6;
const NORMAL_VERSION: u8 = 5;
const SERVICE_DATA_LENGTH: usize = 2 + BLOCK_SIZE;

/// Last byte of every correctly decoded block.
pub const VALIDATION_BYTE: u8 = 0xFA;

const KIND_STATE: u8 = 0;
const KIND_ERROR: u8 = 1;
const KIND_ALTERNATIVE_STATE: u8 = 4;

/// Lifecycle state a device advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationMode {
    Setup,
    Normal,
    Dfu,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    Plug,
    Guidestone,
    Builtin,
    Dongle,
    BuiltinOne,
    Unknown(u8),
}

impl DeviceType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => DeviceType::Plug,
            2 => DeviceType::Guidestone,
            3 => DeviceType::Builtin,
            4 => DeviceType::Dongle,
            5 => DeviceType::BuiltinOne,
            other => DeviceType::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            DeviceType::Plug => 1,
            DeviceType::Guidestone => 2,
            DeviceType::Builtin => 3,
            DeviceType::Dongle => 4,
            DeviceType::BuiltinOne => 5,
            DeviceType::Unknown(value) => value,
        }
    }
}

/// Decoded content of the 16 byte service data block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceDataPayload {
    State {
        crownstone_id: u8,
        switch_state: u8,
        flags: u8,
        temperature: i8,
        power_usage: i16,
        energy_used: i32,
        partial_timestamp: u16,
    },
    Error {
        crownstone_id: u8,
        error_bitmask: u32,
        error_timestamp: u32,
        flags: u8,
        temperature: i8,
        partial_timestamp: u16,
    },
    /// Sent in rotation with `State`; carries the version counters other
    /// nodes use to tell whether their behaviour and filter copies are stale.
    AlternativeState {
        crownstone_id: u8,
        switch_state: u8,
        flags: u8,
        behaviour_master_hash: u16,
        asset_filter_master_version: u16,
        asset_filter_master_crc: u32,
        partial_timestamp: u16,
    },
}

impl ServiceDataPayload {
    /// Parse a plaintext block. Returns `None` when the validation byte or
    /// the kind is wrong, which is what a block decrypted with the wrong key
    /// looks like.
    pub fn parse(block: &[u8]) -> Option<Self> {
        if block.len() != BLOCK_SIZE || block[BLOCK_SIZE - 1] != VALIDATION_BYTE {
            return None;
        }
        let payload = match block[0] {
            KIND_STATE => ServiceDataPayload::State {
                crownstone_id: block[1],
                switch_state: block[2],
                flags: block[3],
                temperature: block[4] as i8,
                power_usage: read_u16(block, 6) as i16,
                energy_used: read_u32(block, 8) as i32,
                partial_timestamp: read_u16(block, 12),
            },
            KIND_ERROR => ServiceDataPayload::Error {
                crownstone_id: block[1],
                error_bitmask: read_u32(block, 2),
                error_timestamp: read_u32(block, 6),
                flags: block[10],
                temperature: block[11] as i8,
                partial_timestamp: read_u16(block, 12),
            },
            KIND_ALTERNATIVE_STATE => ServiceDataPayload::AlternativeState {
                crownstone_id: block[1],
                switch_state: block[2],
                flags: block[3],
                behaviour_master_hash: read_u16(block, 4),
                asset_filter_master_version: read_u16(block, 6),
                asset_filter_master_crc: read_u32(block, 8),
                partial_timestamp: read_u16(block, 12),
            },
            _ => return None,
        };
        Some(payload)
    }

    pub fn serialize(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        match self {
            ServiceDataPayload::State {
                crownstone_id,
                switch_state,
                flags,
                temperature,
                power_usage,
                energy_used,
                partial_timestamp,
            } => {
                block[0] = KIND_STATE;
                block[1] = *crownstone_id;
                block[2] = *switch_state;
                block[3] = *flags;
                block[4] = *temperature as u8;
                block[6..8].copy_from_slice(&power_usage.to_le_bytes());
                block[8..12].copy_from_slice(&energy_used.to_le_bytes());
                block[12..14].copy_from_slice(&partial_timestamp.to_le_bytes());
            }
            ServiceDataPayload::Error {
                crownstone_id,
                error_bitmask,
                error_timestamp,
                flags,
                temperature,
                partial_timestamp,
            } => {
                block[0] = KIND_ERROR;
                block[1] = *crownstone_id;
                block[2..6].copy_from_slice(&error_bitmask.to_le_bytes());
                block[6..10].copy_from_slice(&error_timestamp.to_le_bytes());
                block[10] = *flags;
                block[11] = *temperature as u8;
                block[12..14].copy_from_slice(&partial_timestamp.to_le_bytes());
            }
            ServiceDataPayload::AlternativeState {
                crownstone_id,
                switch_state,
                flags,
                behaviour_master_hash,
                asset_filter_master_version,
                asset_filter_master_crc,
                partial_timestamp,
            } => {
                block[0] = KIND_ALTERNATIVE_STATE;
                block[1] = *crownstone_id;
                block[2] = *switch_state;
                block[3] = *flags;
                block[4..6].copy_from_slice(&behaviour_master_hash.to_le_bytes());
                block[6..8].copy_from_slice(&asset_filter_master_version.to_le_bytes());
                block[8..12].copy_from_slice(&asset_filter_master_crc.to_le_bytes());
                block[12..14].copy_from_slice(&partial_timestamp.to_le_bytes());
            }
        }
        block[BLOCK_SIZE - 1] = VALIDATION_BYTE;
        block
    }
}

/// A decoded advertisement.
///
/// Every scan record becomes an `Advertisement`. `validated` is only set
/// when the service data decoded cleanly with the current keys.
#[derive(Debug, Clone, Serialize)]
pub struct Advertisement {
    pub address: BleAddress,
    pub rssi: i16,
    pub name: Option<String>,
    pub operation_mode: OperationMode,
    pub device_type: Option<DeviceType>,
    pub payload: Option<ServiceDataPayload>,
    pub validated: bool,
    pub received_at: DateTime<Utc>,
}

impl Advertisement {
    pub fn decode(record: &ScanRecord, keys: &KeySet) -> Self {
        let mut advertisement = Advertisement {
            address: record.address.clone(),
            rssi: record.rssi,
            name: record.name.clone(),
            operation_mode: OperationMode::Unknown,
            device_type: None,
            payload: None,
            validated: false,
            received_at: Utc::now(),
        };

        if record.service_data.contains_key(&SERVICE_DATA_DFU) {
            advertisement.operation_mode = OperationMode::Dfu;
            advertisement.validated = true;
            return advertisement;
        }

        let Some(data) = CROWNSTONE_SERVICE_DATA_IDS
            .iter()
            .find_map(|id| record.service_data.get(id))
        else {
            return advertisement;
        };
        if data.len() < SERVICE_DATA_LENGTH {
            return advertisement;
        }

        let block = &data[2..SERVICE_DATA_LENGTH];
        advertisement.device_type = Some(DeviceType::from_u8(data[1]));
        advertisement.payload = match data[0] {
            SETUP_VERSION => {
                advertisement.operation_mode = OperationMode::Setup;
                ServiceDataPayload::parse(block)
            }
            NORMAL_VERSION => {
                advertisement.operation_mode = OperationMode::Normal;
                decrypt_ecb(block, keys.service_data())
                    .ok()
                    .and_then(|plain| ServiceDataPayload::parse(&plain))
            }
            _ => None,
        };
        advertisement.validated = advertisement.payload.is_some();
        advertisement
    }

    pub fn is_crownstone(&self) -> bool {
        self.operation_mode != OperationMode::Unknown
    }
}

/// Build the service data a device in `mode` would advertise.
pub fn encode_service_data(
    mode: OperationMode,
    device_type: DeviceType,
    payload: &ServiceDataPayload,
    keys: &KeySet,
) -> Result<Vec<u8>, CryptoError> {
    let plain = payload.serialize();
    let (version, block) = match mode {
        OperationMode::Setup => (SETUP_VERSION, plain.to_vec()),
        _ => (NORMAL_VERSION, encrypt_ecb(&plain, keys.service_data())?),
    };
    let mut out = Vec::with_capacity(SERVICE_DATA_LENGTH);
    out.push(version);
    out.push(device_type.as_u8());
    out.extend_from_slice(&block);
    Ok(out)
}
