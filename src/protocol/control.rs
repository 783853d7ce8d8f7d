//! Control packets
//!
//! Layout: `protocol u8 | type u16 LE | length u16 LE | payload`.

use super::{ensure_length, read_u16, ProtocolError, CONTROL_PROTOCOL};

const HEADER_LENGTH: usize = 5;

/// Written unencrypted to the factory reset characteristic to trigger recovery.
pub const RECOVERY_CODE: u32 = 0xDEAD_BEEF;

/// Switch value meaning "on, at whatever level the device's behaviour picks".
pub const SWITCH_SMART_ON: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlType {
    FactoryReset,
    Reset,
    Disconnect,
    Switch,
    Pwm,
    Relay,
    LockSwitch,
    AllowDimming,
    StateGet,
    StateSet,
    MicroappGetInfo,
    MicroappUpload,
    MicroappValidate,
    MicroappRemove,
    MicroappEnable,
    MicroappDisable,
}

impl ControlType {
    pub fn as_u16(self) -> u16 {
        match self {
            ControlType::FactoryReset => 1,
            ControlType::Reset => 10,
            ControlType::Disconnect => 13,
            ControlType::Switch => 20,
            ControlType::Pwm => 22,
            ControlType::Relay => 23,
            ControlType::LockSwitch => 31,
            ControlType::AllowDimming => 32,
            ControlType::StateGet => 34,
            ControlType::StateSet => 35,
            ControlType::MicroappGetInfo => 90,
            ControlType::MicroappUpload => 91,
            ControlType::MicroappValidate => 92,
            ControlType::MicroappRemove => 93,
            ControlType::MicroappEnable => 94,
            ControlType::MicroappDisable => 95,
        }
    }

    pub fn from_u16(value: u16) -> Result<Self, ProtocolError> {
        let control_type = match value {
            1 => ControlType::FactoryReset,
            10 => ControlType::Reset,
            13 => ControlType::Disconnect,
            20 => ControlType::Switch,
            22 => ControlType::Pwm,
            23 => ControlType::Relay,
            31 => ControlType::LockSwitch,
            32 => ControlType::AllowDimming,
            34 => ControlType::StateGet,
            35 => ControlType::StateSet,
            90 => ControlType::MicroappGetInfo,
            91 => ControlType::MicroappUpload,
            92 => ControlType::MicroappValidate,
            93 => ControlType::MicroappRemove,
            94 => ControlType::MicroappEnable,
            95 => ControlType::MicroappDisable,
            other => return Err(ProtocolError::UnknownControlType(other)),
        };
        Ok(control_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub control_type: ControlType,
    pub payload: Vec<u8>,
}

impl ControlPacket {
    pub fn new(control_type: ControlType) -> Self {
        Self {
            control_type,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(control_type: ControlType, payload: Vec<u8>) -> Self {
        Self {
            control_type,
            payload,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LENGTH + self.payload.len());
        out.push(CONTROL_PROTOCOL);
        out.extend_from_slice(&self.control_type.as_u16().to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_length("control", data, HEADER_LENGTH)?;
        let control_type = ControlType::from_u16(read_u16(data, 1))?;
        let declared = read_u16(data, 3) as usize;
        let payload = &data[HEADER_LENGTH..];
        if payload.len() < declared {
            return Err(ProtocolError::LengthMismatch {
                packet: "control",
                declared,
                actual: payload.len(),
            });
        }
        Ok(Self {
            control_type,
            payload: payload[..declared].to_vec(),
        })
    }
}

/// Switch to a level in 0..=100, or one of the special switch values.
pub fn switch_packet(value: u8) -> Vec<u8> {
    ControlPacket::with_payload(ControlType::Switch, vec![value]).serialize()
}

/// Dim to an intensity in 0..=100.
pub fn dimmer_packet(intensity: u8) -> Vec<u8> {
    ControlPacket::with_payload(ControlType::Pwm, vec![intensity.min(100)]).serialize()
}

pub fn relay_packet(turn_on: bool) -> Vec<u8> {
    ControlPacket::with_payload(ControlType::Relay, vec![turn_on as u8]).serialize()
}

pub fn allow_dimming_packet(allow: bool) -> Vec<u8> {
    ControlPacket::with_payload(ControlType::AllowDimming, vec![allow as u8]).serialize()
}

pub fn lock_switch_packet(lock: bool) -> Vec<u8> {
    ControlPacket::with_payload(ControlType::LockSwitch, vec![lock as u8]).serialize()
}

pub fn reset_packet() -> Vec<u8> {
    ControlPacket::new(ControlType::Reset).serialize()
}

pub fn disconnect_packet() -> Vec<u8> {
    ControlPacket::new(ControlType::Disconnect).serialize()
}

/// Factory reset issued over an encrypted session by a key holder.
pub fn command_factory_reset_packet() -> Vec<u8> {
    ControlPacket::with_payload(ControlType::FactoryReset, RECOVERY_CODE.to_le_bytes().to_vec())
        .serialize()
}

/// Raw packet for the factory reset characteristic, used without keys.
pub fn recovery_packet() -> Vec<u8> {
    RECOVERY_CODE.to_le_bytes().to_vec()
}

const STATE_HEADER_LENGTH: usize = 6;

/// Current consumption (mA) above which the dimmer is switched off.
pub const STATE_CURRENT_THRESHOLD_DIMMER: u16 = 36;

/// Read the value currently in use.
pub const PERSISTENCE_GET_CURRENT: u8 = 0;
/// Write the value to flash so it survives a reboot.
pub const PERSISTENCE_SET_STORED: u8 = 1;

/// Payload of state get/set commands and of their results.
///
/// Layout: `state_type u16 LE | id u16 LE | persistence u8 | reserved u8 | value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePacket {
    pub state_type: u16,
    pub id: u16,
    pub persistence: u8,
    pub value: Vec<u8>,
}

impl StatePacket {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(STATE_HEADER_LENGTH + self.value.len());
        out.extend_from_slice(&self.state_type.to_le_bytes());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.push(self.persistence);
        out.push(0);
        out.extend_from_slice(&self.value);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_length("state", data, STATE_HEADER_LENGTH)?;
        Ok(Self {
            state_type: read_u16(data, 0),
            id: read_u16(data, 2),
            persistence: data[4],
            value: data[STATE_HEADER_LENGTH..].to_vec(),
        })
    }
}

pub fn state_get_packet(state_type: u16) -> Vec<u8> {
    let state = StatePacket {
        state_type,
        id: 0,
        persistence: PERSISTENCE_GET_CURRENT,
        value: Vec::new(),
    };
    ControlPacket::with_payload(ControlType::StateGet, state.serialize()).serialize()
}

pub fn state_set_packet(state_type: u16, value: &[u8]) -> Vec<u8> {
    let state = StatePacket {
        state_type,
        id: 0,
        persistence: PERSISTENCE_SET_STORED,
        value: value.to_vec(),
    };
    ControlPacket::with_payload(ControlType::StateSet, state.serialize()).serialize()
}
