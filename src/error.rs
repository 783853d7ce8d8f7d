use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::ble::transport::BleAddress;
use crate::ble::BleError;
use crate::protocol::advertisement::OperationMode;
use crate::protocol::crypto::CryptoError;
use crate::protocol::result::ResultCode;
use crate::protocol::ProtocolError;

#[derive(Error, Debug)]
pub enum CrownstoneError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed { address: BleAddress, reason: String },

    #[error("Could not validate the session nonce")]
    SessionValidationFailed,

    #[error("No notification data received")]
    NoNotificationData,

    #[error("Notification stream not finished within {0:?}")]
    StreamTimeout(Duration),

    #[error("Notification stream aborted by the result handler (last payload: {})", hex::encode(.payload))]
    StreamAborted { payload: Vec<u8> },

    #[error("No advertisement received from {address} during {duration:?} of scanning")]
    NoScansReceived { address: BleAddress, duration: Duration },

    #[error("{address} was in {observed:?} mode instead of {required:?}")]
    ModeMismatch {
        address: BleAddress,
        required: OperationMode,
        observed: OperationMode,
    },

    #[error("Command {command} answered with {result:?}")]
    CommandFailed { command: u16, result: ResultCode },

    #[error("Service {0} not found on the connected device")]
    UnknownService(Uuid),

    #[error("Characteristic {0} not found on the connected device")]
    UnknownCharacteristic(Uuid),

    #[error("The recovery mechanism has been disabled by the Crownstone owner")]
    RecoveryModeDisabled,

    #[error("The recovery window has expired; it is only open briefly after power on")]
    NotInRecoveryMode,

    #[error("Missing key: {0}")]
    MissingKey(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Transport error: {0}")]
    Transport(#[from] BleError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl CrownstoneError {
    /// True when the peer dropped the link underneath an operation.
    pub fn is_peer_disconnect(&self) -> bool {
        matches!(self, CrownstoneError::Transport(BleError::Disconnected))
    }
}
