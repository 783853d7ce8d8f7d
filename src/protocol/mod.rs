//! Crownstone wire protocol
//!
//! Packet encoders and decoders for the control, result, session data and
//! microapp exchanges, the advertisement service data decoder, and the AES
//! primitives the encrypted session is built on.

pub mod advertisement;
pub mod control;
pub mod crypto;
pub mod microapp;
pub mod result;
pub mod session_data;
pub mod uuids;

use thiserror::Error;

/// Protocol version written into control packets.
pub const CONTROL_PROTOCOL: u8 = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{packet} packet too short ({size} < {minimum})")]
    TooShort {
        packet: &'static str,
        size: usize,
        minimum: usize,
    },

    #[error("{packet} packet declares {declared} payload bytes but carries {actual}")]
    LengthMismatch {
        packet: &'static str,
        declared: usize,
        actual: usize,
    },

    #[error("Unknown control type {0}")]
    UnknownControlType(u16),

    #[error("Malformed packet: {0}")]
    Malformed(String),
}

pub(crate) fn ensure_length(
    packet: &'static str,
    data: &[u8],
    minimum: usize,
) -> Result<(), ProtocolError> {
    if data.len() < minimum {
        return Err(ProtocolError::TooShort {
            packet,
            size: data.len(),
            minimum,
        });
    }
    Ok(())
}

pub(crate) fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}
