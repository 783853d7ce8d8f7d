//! Engine configuration and key material

use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CrownstoneError;
use crate::protocol::crypto::{CryptoError, Key, UserLevel, KEY_LENGTH};

/// Timing and sizing knobs for the engine.
///
/// All waits are tick counted: a wait of `d` ends after `ceil(d / tick)`
/// ticks, so observed latency may exceed the request by one tick.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Poll period of the scan countdown and abort check.
    pub scan_tick: Duration,
    /// Scan window used when the caller does not pass one.
    pub default_scan_duration: Duration,
    /// Poll period of notification exchanges.
    pub notification_tick: Duration,
    /// Tick bound for single-shot notification exchanges.
    pub single_shot_max_ticks: u32,
    /// Bytes per microapp upload chunk.
    pub microapp_chunk_size: usize,
    /// Time allowed per microapp chunk; the stream timeout is this times the chunk count.
    pub microapp_chunk_timeout: Duration,
    /// Pause between the two recovery attempts.
    pub recovery_reconnect_delay: Duration,
    /// Pause after the second recovery attempt.
    pub recovery_settle_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan_tick: Duration::from_millis(100),
            default_scan_duration: Duration::from_secs(3),
            notification_tick: Duration::from_millis(250),
            single_shot_max_ticks: 50,
            microapp_chunk_size: 128,
            microapp_chunk_timeout: Duration::from_secs(10),
            recovery_reconnect_delay: Duration::from_secs(5),
            recovery_settle_delay: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, CrownstoneError> {
        serde_json::from_str(json).map_err(|e| CrownstoneError::InvalidConfig(e.to_string()))
    }
}

/// The seven keys a Crownstone sphere is provisioned with.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeySet {
    admin: Key,
    member: Key,
    basic: Key,
    service_data: Key,
    localization: Key,
    mesh_application: Key,
    mesh_network: Key,
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeySet { .. }")
    }
}

impl Default for KeySet {
    /// Placeholder keys, so the library works before real keys are loaded.
    fn default() -> Self {
        Self {
            admin: *b"adminKeyForCrown",
            member: *b"memberKeyForHome",
            basic: *b"basicKeyForOther",
            service_data: *b"MyServiceDataKey",
            localization: *b"aLocalizationKey",
            mesh_application: *b"MyGoodMeshAppKey",
            mesh_network: *b"MyGoodMeshNetKey",
        }
    }
}

/// Key names as they appear in a key dictionary.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawKeySet {
    admin: Option<String>,
    member: Option<String>,
    basic: Option<String>,
    service_data_key: Option<String>,
    localization_key: Option<String>,
    mesh_application_key: Option<String>,
    mesh_network_key: Option<String>,
}

fn required(value: Option<String>, name: &'static str) -> Result<String, CrownstoneError> {
    value.ok_or(CrownstoneError::MissingKey(name))
}

impl KeySet {
    /// Build a key set from key strings. Each key is either 16 ASCII
    /// characters or 32 hex digits.
    pub fn from_strings(
        admin: &str,
        member: &str,
        basic: &str,
        service_data: &str,
        localization: &str,
        mesh_application: &str,
        mesh_network: &str,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            admin: parse_key(admin)?,
            member: parse_key(member)?,
            basic: parse_key(basic)?,
            service_data: parse_key(service_data)?,
            localization: parse_key(localization)?,
            mesh_application: parse_key(mesh_application)?,
            mesh_network: parse_key(mesh_network)?,
        })
    }

    /// Parse a key dictionary such as
    /// `{"admin": "...", "member": "...", "basic": "...", "serviceDataKey": "...", ...}`.
    pub fn from_json(json: &str) -> Result<Self, CrownstoneError> {
        let raw: RawKeySet =
            serde_json::from_str(json).map_err(|e| CrownstoneError::InvalidConfig(e.to_string()))?;

        let admin = required(raw.admin, "admin")?;
        let member = required(raw.member, "member")?;
        let basic = required(raw.basic, "basic")?;
        let service_data = required(raw.service_data_key, "serviceDataKey")?;
        let localization = required(raw.localization_key, "localizationKey")?;
        let mesh_application = required(raw.mesh_application_key, "meshApplicationKey")?;
        let mesh_network = required(raw.mesh_network_key, "meshNetworkKey")?;

        let keys = Self::from_strings(
            &admin,
            &member,
            &basic,
            &service_data,
            &localization,
            &mesh_application,
            &mesh_network,
        )?;
        Ok(keys)
    }

    pub fn key_for(&self, level: UserLevel) -> &Key {
        match level {
            UserLevel::Admin => &self.admin,
            UserLevel::Member => &self.member,
            UserLevel::Basic => &self.basic,
        }
    }

    /// The level outgoing packets are encrypted with.
    pub fn highest_level(&self) -> UserLevel {
        UserLevel::Admin
    }

    pub fn basic(&self) -> &Key {
        &self.basic
    }

    pub fn service_data(&self) -> &Key {
        &self.service_data
    }

    pub fn localization(&self) -> &Key {
        &self.localization
    }

    pub fn mesh_application(&self) -> &Key {
        &self.mesh_application
    }

    pub fn mesh_network(&self) -> &Key {
        &self.mesh_network
    }
}

/// Parse a key given as 16 ASCII characters or 32 hex digits.
pub fn parse_key(value: &str) -> Result<Key, CryptoError> {
    let bytes = match value.len() {
        KEY_LENGTH => value.as_bytes().to_vec(),
        n if n == KEY_LENGTH * 2 => {
            hex::decode(value).map_err(|e| CryptoError::InvalidKey(e.to_string()))?
        }
        n => return Err(CryptoError::InvalidKeyLength(n)),
    };
    let mut key = [0u8; KEY_LENGTH];
    key.copy_from_slice(&bytes);
    Ok(key)
}
