//! Commands over the control characteristic
//!
//! Everything here assumes a connection; commands are written encrypted
//! and results come back as notifications on the result characteristic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::ble::transport::BleAddress;
use crate::config::EngineConfig;
use crate::connection::ConnectionManager;
use crate::error::CrownstoneError;
use crate::notification::{NotificationClassifier, NotificationStreamEngine, ProcessType, WriteCommand};
use crate::protocol::control::{
    allow_dimming_packet, command_factory_reset_packet, dimmer_packet, disconnect_packet,
    lock_switch_packet, recovery_packet, relay_packet, reset_packet, state_get_packet,
    state_set_packet, switch_packet, ControlType, StatePacket, STATE_CURRENT_THRESHOLD_DIMMER,
};
use crate::protocol::microapp::{header_command, MicroappInfo, UploadState, MAX_MICROAPP_SIZE};
use crate::protocol::ProtocolError;
use crate::protocol::result::{ResultCode, ResultPacket};
use crate::protocol::uuids::{
    CONTROL_CHARACTERISTIC, CROWNSTONE_SERVICE, FACTORY_RESET_CHARACTERISTIC,
    RESULT_CHARACTERISTIC, SESSION_DATA_CHARACTERISTIC,
};

/// Value of the factory reset characteristic once recovery is accepted.
const RECOVERY_ACCEPTED: u8 = 1;
/// Value of the factory reset characteristic when the owner disabled recovery.
const RECOVERY_DISABLED: u8 = 2;
const RECOVERY_ATTEMPTS: usize = 2;

fn ensure_success(result: &ResultPacket) -> Result<(), CrownstoneError> {
    if result.result_code != ResultCode::Success {
        return Err(CrownstoneError::CommandFailed {
            command: result.command_type,
            result: result.result_code,
        });
    }
    Ok(())
}

fn upload_timeout(chunk_timeout: Duration, chunk_count: usize) -> Result<Duration, CrownstoneError> {
    u32::try_from(chunk_count)
        .ok()
        .and_then(|count| chunk_timeout.checked_mul(count))
        .ok_or_else(|| {
            CrownstoneError::InvalidArgument(format!(
                "upload timeout of {} chunks at {:?} each overflows",
                chunk_count, chunk_timeout
            ))
        })
}

fn control_command(packet: Vec<u8>) -> WriteCommand {
    WriteCommand {
        service: CROWNSTONE_SERVICE,
        characteristic: CONTROL_CHARACTERISTIC,
        payload: packet,
        encrypted: true,
    }
}

/// Continues on WaitForSuccess, finishes on Success, aborts on anything else.
struct WaitForSuccess;

#[async_trait]
impl NotificationClassifier for WaitForSuccess {
    async fn classify(
        &mut self,
        payload: &[u8],
        _connection: &ConnectionManager,
    ) -> Result<ProcessType, CrownstoneError> {
        let result = ResultPacket::parse(payload)?;
        Ok(match result.result_code {
            ResultCode::Success => ProcessType::Finished,
            ResultCode::WaitForSuccess => ProcessType::Continue,
            other => {
                log::warn!("Command {} failed with {:?}", result.command_type, other);
                ProcessType::AbortError
            }
        })
    }
}

/// Drives a chunked microapp upload: every Success moves the cursor and
/// writes the next chunk until none is left.
struct MicroappUpload {
    state: UploadState,
}

#[async_trait]
impl NotificationClassifier for MicroappUpload {
    async fn classify(
        &mut self,
        payload: &[u8],
        connection: &ConnectionManager,
    ) -> Result<ProcessType, CrownstoneError> {
        let result = ResultPacket::parse(payload)?;
        match result.result_code {
            ResultCode::Success => {
                if !self.state.advance() {
                    log::info!("Microapp upload complete ({} chunks)", self.state.chunk_count());
                    return Ok(ProcessType::Finished);
                }
                log::debug!(
                    "Uploading chunk {}/{} at offset {}",
                    self.state.index() + 1,
                    self.state.chunk_count(),
                    self.state.offset()
                );
                connection
                    .write(
                        CROWNSTONE_SERVICE,
                        CONTROL_CHARACTERISTIC,
                        &self.state.current_command()?,
                        true,
                    )
                    .await?;
                Ok(ProcessType::Continue)
            }
            ResultCode::WaitForSuccess => Ok(ProcessType::Continue),
            other => {
                log::warn!(
                    "Microapp chunk {} rejected with {:?}",
                    self.state.index(),
                    other
                );
                Ok(ProcessType::AbortError)
            }
        }
    }
}

pub struct ControlHandler {
    connection: Arc<ConnectionManager>,
    notifications: NotificationStreamEngine,
    config: EngineConfig,
}

impl ControlHandler {
    pub fn new(connection: Arc<ConnectionManager>, config: EngineConfig) -> Self {
        Self {
            notifications: NotificationStreamEngine::new(Arc::clone(&connection), &config),
            connection,
            config,
        }
    }

    /// Read the session data and establish the encrypted session.
    pub async fn get_and_set_session_nonce(&self) -> Result<(), CrownstoneError> {
        let raw = self
            .connection
            .read(CROWNSTONE_SERVICE, SESSION_DATA_CHARACTERISTIC)
            .await?;
        self.connection.session().process_session_data(&raw)?;
        log::debug!("Session established");
        Ok(())
    }

    /// 0..=100 switches to that level, 255 lets the device pick.
    pub async fn set_switch(&self, value: u8) -> Result<(), CrownstoneError> {
        self.write_control(switch_packet(value)).await
    }

    pub async fn set_dimmer(&self, intensity: u8) -> Result<(), CrownstoneError> {
        self.write_control(dimmer_packet(intensity)).await
    }

    pub async fn set_relay(&self, turn_on: bool) -> Result<(), CrownstoneError> {
        self.write_control(relay_packet(turn_on)).await
    }

    pub async fn allow_dimming(&self, allow: bool) -> Result<(), CrownstoneError> {
        self.write_control(allow_dimming_packet(allow)).await
    }

    pub async fn lock_switch(&self, lock: bool) -> Result<(), CrownstoneError> {
        self.write_control(lock_switch_packet(lock)).await
    }

    pub async fn reset(&self) -> Result<(), CrownstoneError> {
        self.write_control(reset_packet()).await
    }

    pub async fn command_factory_reset(&self) -> Result<(), CrownstoneError> {
        self.write_control(command_factory_reset_packet()).await
    }

    /// Ask the device to drop the link, then disconnect locally.
    pub async fn disconnect_command(&self) -> Result<(), CrownstoneError> {
        match self.write_control(disconnect_packet()).await {
            Err(e) if e.is_peer_disconnect() => log::debug!("Disconnected by peer (expected)"),
            Err(e) => return Err(e),
            Ok(()) => {}
        }
        self.connection.disconnect().await
    }

    /// Write a control packet and return the first result notification.
    pub async fn write_control_and_get_result(
        &self,
        packet: Vec<u8>,
    ) -> Result<ResultPacket, CrownstoneError> {
        let payload = self
            .notifications
            .single_shot(RESULT_CHARACTERISTIC, control_command(packet))
            .await?;
        Ok(ResultPacket::parse(&payload)?)
    }

    /// Write a control packet and wait until the device reports Success.
    pub async fn write_control_and_wait_for_success(
        &self,
        packet: Vec<u8>,
        timeout: Duration,
    ) -> Result<(), CrownstoneError> {
        self.notifications
            .stream(
                RESULT_CHARACTERISTIC,
                control_command(packet),
                &mut WaitForSuccess,
                timeout,
            )
            .await
    }

    /// Factory reset a device whose keys are lost.
    ///
    /// Only works briefly after the device powered on. Runs two
    /// connect/reset/check/disconnect cycles; any failure other than the
    /// device dropping the link on the reset write ends the recovery.
    pub async fn recovery(&self, address: &BleAddress) -> Result<(), CrownstoneError> {
        for attempt in 0..RECOVERY_ATTEMPTS {
            log::info!("Recovery attempt {} on {}", attempt + 1, address);
            self.connection.connect(address).await?;
            let outcome = self.recover_by_factory_reset().await;
            let disconnected = self.connection.disconnect().await;
            if let Err(e) = outcome {
                if let Err(close) = disconnected {
                    log::warn!("Disconnect after failed recovery attempt also failed: {}", close);
                }
                return Err(e);
            }
            disconnected?;

            let pause = if attempt + 1 < RECOVERY_ATTEMPTS {
                self.config.recovery_reconnect_delay
            } else {
                self.config.recovery_settle_delay
            };
            tokio::time::sleep(pause).await;
        }
        Ok(())
    }

    async fn recover_by_factory_reset(&self) -> Result<(), CrownstoneError> {
        let written = self
            .connection
            .write(
                CROWNSTONE_SERVICE,
                FACTORY_RESET_CHARACTERISTIC,
                &recovery_packet(),
                false,
            )
            .await;
        match written {
            Err(e) if e.is_peer_disconnect() => {
                log::debug!("Disconnected by peer during recovery (expected)");
                return Ok(());
            }
            other => other?,
        }

        let state = self
            .connection
            .read(CROWNSTONE_SERVICE, FACTORY_RESET_CHARACTERISTIC)
            .await?;
        match state.first() {
            Some(&RECOVERY_ACCEPTED) => Ok(()),
            Some(&RECOVERY_DISABLED) => Err(CrownstoneError::RecoveryModeDisabled),
            _ => Err(CrownstoneError::NotInRecoveryMode),
        }
    }

    /// Current (A) above which the device switches its dimmer off.
    pub async fn set_current_threshold_dimmer(&self, current_amp: f32) -> Result<(), CrownstoneError> {
        let milliamp = (current_amp * 1000.0).round();
        if !(0.0..=f32::from(u16::MAX)).contains(&milliamp) {
            return Err(CrownstoneError::InvalidArgument(format!(
                "dimmer current threshold {} A is out of range",
                current_amp
            )));
        }
        let value = (milliamp as u16).to_le_bytes();
        self.set_state(STATE_CURRENT_THRESHOLD_DIMMER, &value).await
    }

    pub async fn get_current_threshold_dimmer(&self) -> Result<f32, CrownstoneError> {
        let value = self.get_state(STATE_CURRENT_THRESHOLD_DIMMER).await?;
        let milliamp: [u8; 2] = value.as_slice().try_into().map_err(|_| {
            ProtocolError::Malformed(format!(
                "dimmer current threshold has {} bytes, expected 2",
                value.len()
            ))
        })?;
        Ok(f32::from(u16::from_le_bytes(milliamp)) / 1000.0)
    }

    async fn set_state(&self, state_type: u16, value: &[u8]) -> Result<(), CrownstoneError> {
        let result = self
            .write_control_and_get_result(state_set_packet(state_type, value))
            .await?;
        ensure_success(&result)
    }

    async fn get_state(&self, state_type: u16) -> Result<Vec<u8>, CrownstoneError> {
        let result = self
            .write_control_and_get_result(state_get_packet(state_type))
            .await?;
        ensure_success(&result)?;
        let state = StatePacket::parse(&result.payload)?;
        if state.state_type != state_type {
            return Err(ProtocolError::Malformed(format!(
                "asked for state {}, got {}",
                state_type, state.state_type
            ))
            .into());
        }
        Ok(state.value)
    }

    pub async fn get_microapp_info(&self, app_index: u8) -> Result<MicroappInfo, CrownstoneError> {
        let result = self
            .write_control_and_get_result(header_command(ControlType::MicroappGetInfo, app_index))
            .await?;
        ensure_success(&result)?;
        Ok(MicroappInfo::parse(&result.payload)?)
    }

    /// Upload a microapp binary chunk by chunk.
    ///
    /// The whole upload gets `microapp_chunk_timeout` per chunk. Binaries
    /// larger than [`MAX_MICROAPP_SIZE`] are refused before anything is sent.
    pub async fn upload_microapp(&self, app_index: u8, data: Vec<u8>) -> Result<(), CrownstoneError> {
        if data.is_empty() {
            return Err(CrownstoneError::InvalidArgument(
                "microapp binary is empty".to_string(),
            ));
        }
        if data.len() > MAX_MICROAPP_SIZE {
            return Err(CrownstoneError::InvalidArgument(format!(
                "microapp binary of {} bytes exceeds {} bytes",
                data.len(),
                MAX_MICROAPP_SIZE
            )));
        }
        let state = UploadState::new(app_index, data, self.config.microapp_chunk_size);
        let timeout = upload_timeout(self.config.microapp_chunk_timeout, state.chunk_count())?;
        log::info!(
            "Uploading microapp {} in {} chunks (timeout {:?})",
            app_index,
            state.chunk_count(),
            timeout
        );

        let first = control_command(state.current_command()?);
        let mut upload = MicroappUpload { state };
        self.notifications
            .stream(RESULT_CHARACTERISTIC, first, &mut upload, timeout)
            .await
    }

    pub async fn validate_microapp(&self, app_index: u8) -> Result<(), CrownstoneError> {
        self.microapp_command(ControlType::MicroappValidate, app_index).await
    }

    pub async fn enable_microapp(&self, app_index: u8) -> Result<(), CrownstoneError> {
        self.microapp_command(ControlType::MicroappEnable, app_index).await
    }

    pub async fn disable_microapp(&self, app_index: u8) -> Result<(), CrownstoneError> {
        self.microapp_command(ControlType::MicroappDisable, app_index).await
    }

    pub async fn remove_microapp(&self, app_index: u8) -> Result<(), CrownstoneError> {
        self.microapp_command(ControlType::MicroappRemove, app_index).await
    }

    async fn microapp_command(
        &self,
        control_type: ControlType,
        app_index: u8,
    ) -> Result<(), CrownstoneError> {
        self.write_control_and_wait_for_success(
            header_command(control_type, app_index),
            self.config.microapp_chunk_timeout,
        )
        .await
    }

    async fn write_control(&self, packet: Vec<u8>) -> Result<(), CrownstoneError> {
        self.connection
            .write(CROWNSTONE_SERVICE, CONTROL_CHARACTERISTIC, &packet, true)
            .await
    }
}
