//! Result packets, received as notifications on the result characteristic.
//!
//! Layout: `protocol u8 | type u16 LE | result u16 LE | length u16 LE | payload`.

use super::control::ControlType;
use super::{ensure_length, read_u16, ProtocolError, CONTROL_PROTOCOL};

const HEADER_LENGTH: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success,
    WaitForSuccess,
    InvalidAddress,
    WrongPayloadLength,
    InvalidMessage,
    Busy,
    EventUnhandled,
    Unknown(u16),
}

impl ResultCode {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x00 => ResultCode::Success,
            0x01 => ResultCode::WaitForSuccess,
            0x10 => ResultCode::InvalidAddress,
            0x20 => ResultCode::WrongPayloadLength,
            0x22 => ResultCode::InvalidMessage,
            0x27 => ResultCode::Busy,
            0x70 => ResultCode::EventUnhandled,
            other => ResultCode::Unknown(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            ResultCode::Success => 0x00,
            ResultCode::WaitForSuccess => 0x01,
            ResultCode::InvalidAddress => 0x10,
            ResultCode::WrongPayloadLength => 0x20,
            ResultCode::InvalidMessage => 0x22,
            ResultCode::Busy => 0x27,
            ResultCode::EventUnhandled => 0x70,
            ResultCode::Unknown(value) => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultPacket {
    pub command_type: u16,
    pub result_code: ResultCode,
    pub payload: Vec<u8>,
}

impl ResultPacket {
    pub fn new(command: ControlType, result_code: ResultCode, payload: Vec<u8>) -> Self {
        Self {
            command_type: command.as_u16(),
            result_code,
            payload,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_length("result", data, HEADER_LENGTH)?;
        let declared = read_u16(data, 5) as usize;
        let payload = &data[HEADER_LENGTH..];
        if payload.len() < declared {
            return Err(ProtocolError::LengthMismatch {
                packet: "result",
                declared,
                actual: payload.len(),
            });
        }
        Ok(Self {
            command_type: read_u16(data, 1),
            result_code: ResultCode::from_u16(read_u16(data, 3)),
            payload: payload[..declared].to_vec(),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LENGTH + self.payload.len());
        out.push(CONTROL_PROTOCOL);
        out.extend_from_slice(&self.command_type.to_le_bytes());
        out.extend_from_slice(&self.result_code.as_u16().to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}
