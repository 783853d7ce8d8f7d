//! Session data packet, read unencrypted and ECB-decrypted with the basic key.
//!
//! Plaintext layout (16 bytes):
//! `checksum u32 LE | protocol u8 | session_nonce (5) | validation_key (4) | padding (2)`.

use super::crypto::{BLOCK_SIZE, SESSION_NONCE_LENGTH, VALIDATION_KEY_LENGTH};
use super::{ensure_length, read_u32, ProtocolError};

/// Constant every correctly decrypted session data packet starts with.
pub const SESSION_DATA_CHECKSUM: u32 = 0xCAFE_BABE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDataPacket {
    pub validation: u32,
    pub protocol: u8,
    pub session_nonce: [u8; SESSION_NONCE_LENGTH],
    pub validation_key: [u8; VALIDATION_KEY_LENGTH],
}

impl SessionDataPacket {
    pub fn parse(decrypted: &[u8]) -> Result<Self, ProtocolError> {
        ensure_length("session data", decrypted, BLOCK_SIZE)?;
        let mut session_nonce = [0u8; SESSION_NONCE_LENGTH];
        session_nonce.copy_from_slice(&decrypted[5..10]);
        let mut validation_key = [0u8; VALIDATION_KEY_LENGTH];
        validation_key.copy_from_slice(&decrypted[10..14]);
        Ok(Self {
            validation: read_u32(decrypted, 0),
            protocol: decrypted[4],
            session_nonce,
            validation_key,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.validation == SESSION_DATA_CHECKSUM
    }

    pub fn serialize(&self) -> [u8; BLOCK_SIZE] {
        let mut out = [0u8; BLOCK_SIZE];
        out[..4].copy_from_slice(&self.validation.to_le_bytes());
        out[4] = self.protocol;
        out[5..10].copy_from_slice(&self.session_nonce);
        out[10..14].copy_from_slice(&self.validation_key);
        out
    }
}
