//! AES primitives for the Crownstone session
//!
//! Two modes are used:
//! - AES-128-ECB for single-block payloads (the session data handshake
//!   and the service data block in advertisements).
//! - AES-128-CTR for everything sent over an established session.
//!
//! Encrypted session packets look like
//! `packet_nonce (3) || user_level (1) || ctr(validation_key (4) || payload)`.
//! The counter block is `packet_nonce || session_nonce || counter (u64 BE)`.

use aes_gcm::aes::cipher::generic_array::GenericArray;
use aes_gcm::aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes_gcm::aes::Aes128;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::KeySet;

pub const BLOCK_SIZE: usize = 16;
pub const KEY_LENGTH: usize = 16;
pub const PACKET_NONCE_LENGTH: usize = 3;
pub const SESSION_NONCE_LENGTH: usize = 5;
pub const VALIDATION_KEY_LENGTH: usize = 4;

/// Header in front of every encrypted session packet.
const HEADER_LENGTH: usize = PACKET_NONCE_LENGTH + 1;

/// A raw AES-128 key.
pub type Key = [u8; KEY_LENGTH];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key length: expected 16 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Packet too short ({size} < {minimum})")]
    PacketTooShort { size: usize, minimum: usize },

    #[error("Payload length {0} is not a multiple of the block size")]
    NotBlockAligned(usize),

    #[error("Validation key mismatch")]
    ValidationMismatch,

    #[error("No session established")]
    NoSession,

    #[error("Unknown user level {0}")]
    UnknownUserLevel(u8),
}

/// Access level a packet is encrypted for. Selects which key is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserLevel {
    Admin,
    Member,
    Basic,
}

impl UserLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            UserLevel::Admin => 0,
            UserLevel::Member => 1,
            UserLevel::Basic => 2,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, CryptoError> {
        match value {
            0 => Ok(UserLevel::Admin),
            1 => Ok(UserLevel::Member),
            2 => Ok(UserLevel::Basic),
            other => Err(CryptoError::UnknownUserLevel(other)),
        }
    }
}

/// Per-connection values established by the session handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionContext {
    pub session_nonce: [u8; SESSION_NONCE_LENGTH],
    pub validation_key: [u8; VALIDATION_KEY_LENGTH],
    pub protocol_version: u8,
}

fn cipher_for(key: &Key) -> Aes128 {
    Aes128::new(GenericArray::from_slice(key))
}

/// Encrypt a single 16 byte block.
pub fn encrypt_block(block: &[u8; BLOCK_SIZE], key: &Key) -> [u8; BLOCK_SIZE] {
    let cipher = cipher_for(key);
    let mut buffer = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut buffer);
    let mut out = [0u8; BLOCK_SIZE];
    out.copy_from_slice(&buffer);
    out
}

/// ECB-encrypt data whose length is a multiple of the block size.
pub fn encrypt_ecb(data: &[u8], key: &Key) -> Result<Vec<u8>, CryptoError> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::NotBlockAligned(data.len()));
    }
    let cipher = cipher_for(key);
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(BLOCK_SIZE) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.encrypt_block(&mut block);
        out.extend_from_slice(&block);
    }
    Ok(out)
}

/// ECB-decrypt data whose length is a multiple of the block size.
pub fn decrypt_ecb(data: &[u8], key: &Key) -> Result<Vec<u8>, CryptoError> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::NotBlockAligned(data.len()));
    }
    let cipher = cipher_for(key);
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(BLOCK_SIZE) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.decrypt_block(&mut block);
        out.extend_from_slice(&block);
    }
    Ok(out)
}

/// XOR `data` in place with the CTR keystream. Encryption and decryption
/// are the same operation.
fn apply_ctr(
    data: &mut [u8],
    packet_nonce: &[u8; PACKET_NONCE_LENGTH],
    session_nonce: &[u8; SESSION_NONCE_LENGTH],
    key: &Key,
) {
    let mut counter_block = [0u8; BLOCK_SIZE];
    counter_block[..PACKET_NONCE_LENGTH].copy_from_slice(packet_nonce);
    counter_block[PACKET_NONCE_LENGTH..PACKET_NONCE_LENGTH + SESSION_NONCE_LENGTH]
        .copy_from_slice(session_nonce);

    for (counter, chunk) in data.chunks_mut(BLOCK_SIZE).enumerate() {
        counter_block[8..].copy_from_slice(&(counter as u64).to_be_bytes());
        let keystream = encrypt_block(&counter_block, key);
        for (byte, mask) in chunk.iter_mut().zip(keystream.iter()) {
            *byte ^= mask;
        }
    }
}

/// Encrypt a payload for the current session with a fresh packet nonce.
pub fn encrypt(
    payload: &[u8],
    session: &SessionContext,
    keys: &KeySet,
) -> Vec<u8> {
    let mut packet_nonce = [0u8; PACKET_NONCE_LENGTH];
    rand::thread_rng().fill_bytes(&mut packet_nonce);
    encrypt_with_nonce(payload, session, keys.highest_level(), keys, packet_nonce)
}

/// Encrypt with an explicit user level and packet nonce.
pub fn encrypt_with_nonce(
    payload: &[u8],
    session: &SessionContext,
    level: UserLevel,
    keys: &KeySet,
    packet_nonce: [u8; PACKET_NONCE_LENGTH],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(VALIDATION_KEY_LENGTH + payload.len());
    body.extend_from_slice(&session.validation_key);
    body.extend_from_slice(payload);
    apply_ctr(&mut body, &packet_nonce, &session.session_nonce, keys.key_for(level));

    let mut packet = Vec::with_capacity(HEADER_LENGTH + body.len());
    packet.extend_from_slice(&packet_nonce);
    packet.push(level.as_u8());
    packet.extend_from_slice(&body);
    packet
}

/// Decrypt a session packet and check its embedded validation key.
pub fn decrypt(
    packet: &[u8],
    session: &SessionContext,
    keys: &KeySet,
) -> Result<Vec<u8>, CryptoError> {
    let minimum = HEADER_LENGTH + VALIDATION_KEY_LENGTH;
    if packet.len() < minimum {
        return Err(CryptoError::PacketTooShort {
            size: packet.len(),
            minimum,
        });
    }

    let mut packet_nonce = [0u8; PACKET_NONCE_LENGTH];
    packet_nonce.copy_from_slice(&packet[..PACKET_NONCE_LENGTH]);
    let level = UserLevel::from_u8(packet[PACKET_NONCE_LENGTH])?;

    let mut body = packet[HEADER_LENGTH..].to_vec();
    apply_ctr(&mut body, &packet_nonce, &session.session_nonce, keys.key_for(level));

    if body[..VALIDATION_KEY_LENGTH] != session.validation_key {
        return Err(CryptoError::ValidationMismatch);
    }
    Ok(body.split_off(VALIDATION_KEY_LENGTH))
}
