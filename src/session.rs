//! Per-connection encryption state
//!
//! Holds the loaded keys for the engine's lifetime and the session values
//! established by the handshake for the current connection.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::KeySet;
use crate::error::CrownstoneError;
use crate::protocol::crypto::{self, decrypt_ecb, CryptoError, SessionContext};
use crate::protocol::session_data::SessionDataPacket;

struct SessionState {
    keys: KeySet,
    context: Option<SessionContext>,
    enabled: bool,
}

pub struct EncryptionSession {
    state: Mutex<SessionState>,
}

impl Default for EncryptionSession {
    fn default() -> Self {
        Self::new(KeySet::default())
    }
}

impl EncryptionSession {
    pub fn new(keys: KeySet) -> Self {
        Self {
            state: Mutex::new(SessionState {
                keys,
                context: None,
                enabled: true,
            }),
        }
    }

    /// Replace the key set. The current session, if any, is kept.
    pub fn load_keys(&self, keys: KeySet) {
        self.lock().keys = keys;
    }

    pub fn keys(&self) -> KeySet {
        self.lock().keys.clone()
    }

    /// Validate and adopt the raw session data read from the device.
    ///
    /// On a checksum mismatch the current session values stay as they were.
    pub fn process_session_data(&self, raw: &[u8]) -> Result<SessionContext, CrownstoneError> {
        let mut state = self.lock();
        let decrypted = decrypt_ecb(raw, state.keys.basic())?;
        let packet = SessionDataPacket::parse(&decrypted)?;
        if !packet.is_valid() {
            return Err(CrownstoneError::SessionValidationFailed);
        }

        let context = SessionContext {
            session_nonce: packet.session_nonce,
            validation_key: packet.validation_key,
            protocol_version: packet.protocol,
        };
        state.context = Some(context);
        Ok(context)
    }

    pub fn context(&self) -> Option<SessionContext> {
        self.lock().context
    }

    pub fn has_session(&self) -> bool {
        self.lock().context.is_some()
    }

    pub fn encrypt(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let state = self.lock();
        let context = state.context.as_ref().ok_or(CryptoError::NoSession)?;
        Ok(crypto::encrypt(payload, context, &state.keys))
    }

    pub fn decrypt(&self, packet: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let state = self.lock();
        let context = state.context.as_ref().ok_or(CryptoError::NoSession)?;
        crypto::decrypt(packet, context, &state.keys)
    }

    /// Forget the per-connection values. Keys are kept.
    pub fn clear_session(&self) {
        self.lock().context = None;
    }

    /// Whether writes and reads marked as encrypted go through the cipher.
    /// Only switched off to talk to firmware built without encryption.
    pub fn is_encryption_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn set_encryption_enabled(&self, enabled: bool) {
        self.lock().enabled = enabled;
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
