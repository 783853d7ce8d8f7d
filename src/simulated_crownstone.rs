//! A simulated Crownstone on top of the BLE simulator
//!
//! Serves the session data characteristic, decrypts control writes, answers
//! with encrypted result notifications, acknowledges microapp chunks and
//! implements the factory reset recovery characteristic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::ble::simulated::{SimPeripheral, SimResponse};
use crate::ble::transport::{BleAddress, GattCharacteristic, GattService, ScanRecord};
use crate::config::KeySet;
use crate::protocol::advertisement::{
    encode_service_data, DeviceType, OperationMode, ServiceDataPayload,
};
use crate::protocol::control::{
    recovery_packet, ControlPacket, ControlType, StatePacket, STATE_CURRENT_THRESHOLD_DIMMER,
};
use crate::protocol::crypto::{self, encrypt_ecb, SessionContext};
use crate::protocol::microapp::{MicroappInfo, MicroappSlot, UploadChunk};
use crate::protocol::result::{ResultCode, ResultPacket};
use crate::protocol::session_data::{SessionDataPacket, SESSION_DATA_CHECKSUM};
use crate::protocol::uuids::{
    CONTROL_CHARACTERISTIC, CROWNSTONE_SERVICE, FACTORY_RESET_CHARACTERISTIC,
    RESULT_CHARACTERISTIC, SERVICE_DATA_DFU, SERVICE_DATA_PLUG, SESSION_DATA_CHARACTERISTIC,
};

pub const SERVICE_HANDLE: u16 = 1;
pub const CONTROL_HANDLE: u16 = 3;
pub const RESULT_HANDLE: u16 = 5;
pub const SESSION_DATA_HANDLE: u16 = 7;
pub const FACTORY_RESET_HANDLE: u16 = 9;

/// Time between WaitForSuccess and Success for long running commands.
const PROCESSING_TIME: Duration = Duration::from_millis(100);

const DEFAULT_THRESHOLD_DIMMER_MILLIAMP: u16 = 1000;

/// How the device reacts to a recovery write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryBehaviour {
    /// Accept, report 1 on the factory reset characteristic.
    Accept,
    /// Accept and drop the link right away.
    AcceptAndDisconnect,
    /// The owner disabled recovery, report 2.
    Disabled,
    /// The window after power on has passed, report 0.
    Expired,
}

struct DeviceState {
    context: SessionContext,
    commands: Vec<ControlPacket>,
    recovery: RecoveryBehaviour,
    recovery_writes: usize,
    reject_chunk: Option<usize>,
    chunks_received: usize,
    microapp: Vec<u8>,
    info: MicroappInfo,
    states: HashMap<u16, Vec<u8>>,
    silent: bool,
}

pub struct SimCrownstone {
    peripheral: Arc<SimPeripheral>,
    keys: KeySet,
    state: Arc<Mutex<DeviceState>>,
}

impl SimCrownstone {
    pub fn new(address: impl Into<BleAddress>, keys: KeySet) -> Self {
        let peripheral = SimPeripheral::new(address.into(), crownstone_services());
        let context = SessionContext {
            session_nonce: [0x11, 0x22, 0x33, 0x44, 0x55],
            validation_key: [0xDE, 0xAD, 0xBE, 0xEF],
            protocol_version: 5,
        };
        let state = Arc::new(Mutex::new(DeviceState {
            context,
            commands: Vec::new(),
            recovery: RecoveryBehaviour::Accept,
            recovery_writes: 0,
            reject_chunk: None,
            chunks_received: 0,
            microapp: Vec::new(),
            info: MicroappInfo {
                protocol: 1,
                max_apps: 1,
                max_app_size: 8192,
                max_chunk_size: 256,
                slots: vec![MicroappSlot {
                    build_version: 0,
                    checksum: 0,
                    enabled: false,
                }],
            },
            states: HashMap::from([(
                STATE_CURRENT_THRESHOLD_DIMMER,
                DEFAULT_THRESHOLD_DIMMER_MILLIAMP.to_le_bytes().to_vec(),
            )]),
            silent: false,
        }));

        let crownstone = Self {
            peripheral,
            keys,
            state,
        };
        crownstone.write_session_data(SESSION_DATA_CHECKSUM);
        crownstone.peripheral.set_value(FACTORY_RESET_HANDLE, vec![0]);

        let state = Arc::clone(&crownstone.state);
        let keys = crownstone.keys.clone();
        crownstone
            .peripheral
            .set_responder(Arc::new(move |peripheral: &SimPeripheral, handle: u16, data: &[u8]| {
                respond(&state, &keys, peripheral, handle, data)
            }));
        crownstone
    }

    pub fn peripheral(&self) -> Arc<SimPeripheral> {
        Arc::clone(&self.peripheral)
    }

    pub fn address(&self) -> &BleAddress {
        self.peripheral.address()
    }

    /// Every control packet received, decrypted.
    pub fn commands(&self) -> Vec<ControlPacket> {
        self.lock().commands.clone()
    }

    pub fn microapp(&self) -> Vec<u8> {
        self.lock().microapp.clone()
    }

    pub fn chunks_received(&self) -> usize {
        self.lock().chunks_received
    }

    /// Raw value of a state, as last set or as seeded at creation.
    pub fn state_value(&self, state_type: u16) -> Option<Vec<u8>> {
        self.lock().states.get(&state_type).cloned()
    }

    pub fn recovery_writes(&self) -> usize {
        self.lock().recovery_writes
    }

    pub fn set_recovery_behaviour(&self, behaviour: RecoveryBehaviour) {
        self.lock().recovery = behaviour;
    }

    /// Answer the upload of chunk `index` with an error.
    pub fn reject_chunk(&self, index: usize) {
        self.lock().reject_chunk = Some(index);
    }

    /// Stop sending result notifications.
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// Serve session data with a wrong checksum.
    pub fn corrupt_session_data(&self) {
        self.write_session_data(SESSION_DATA_CHECKSUM ^ 0xFFFF);
    }

    /// A scan record as this device would advertise it.
    pub fn scan_record(&self, mode: OperationMode, rssi: i16) -> ScanRecord {
        let mut service_data = HashMap::new();
        match mode {
            OperationMode::Dfu => {
                service_data.insert(SERVICE_DATA_DFU, Vec::new());
            }
            OperationMode::Setup | OperationMode::Normal => {
                let payload = ServiceDataPayload::State {
                    crownstone_id: 1,
                    switch_state: 0,
                    flags: 0,
                    temperature: 21,
                    power_usage: 0,
                    energy_used: 0,
                    partial_timestamp: 0,
                };
                if let Ok(data) = encode_service_data(mode, DeviceType::Plug, &payload, &self.keys) {
                    service_data.insert(SERVICE_DATA_PLUG, data);
                }
            }
            OperationMode::Unknown => {}
        }
        ScanRecord {
            address: self.address().clone(),
            rssi,
            name: Some("CS_SIM".to_string()),
            service_data,
        }
    }

    fn write_session_data(&self, checksum: u32) {
        let context = self.lock().context;
        let packet = SessionDataPacket {
            validation: checksum,
            protocol: context.protocol_version,
            session_nonce: context.session_nonce,
            validation_key: context.validation_key,
        };
        if let Ok(encrypted) = encrypt_ecb(&packet.serialize(), self.keys.basic()) {
            self.peripheral.set_value(SESSION_DATA_HANDLE, encrypted);
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn crownstone_services() -> Vec<GattService> {
    vec![GattService {
        uuid: CROWNSTONE_SERVICE,
        handle: SERVICE_HANDLE,
        characteristics: vec![
            GattCharacteristic {
                uuid: CONTROL_CHARACTERISTIC,
                handle: CONTROL_HANDLE,
            },
            GattCharacteristic {
                uuid: RESULT_CHARACTERISTIC,
                handle: RESULT_HANDLE,
            },
            GattCharacteristic {
                uuid: SESSION_DATA_CHARACTERISTIC,
                handle: SESSION_DATA_HANDLE,
            },
            GattCharacteristic {
                uuid: FACTORY_RESET_CHARACTERISTIC,
                handle: FACTORY_RESET_HANDLE,
            },
        ],
    }]
}

fn respond(
    state: &Mutex<DeviceState>,
    keys: &KeySet,
    peripheral: &SimPeripheral,
    handle: u16,
    data: &[u8],
) -> Vec<SimResponse> {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    match handle {
        CONTROL_HANDLE => respond_to_control(&mut state, keys, data),
        FACTORY_RESET_HANDLE if data == recovery_packet().as_slice() => {
            state.recovery_writes += 1;
            let (value, responses) = match state.recovery {
                RecoveryBehaviour::Accept => (1, Vec::new()),
                RecoveryBehaviour::AcceptAndDisconnect => (1, vec![SimResponse::Disconnect]),
                RecoveryBehaviour::Disabled => (2, Vec::new()),
                RecoveryBehaviour::Expired => (0, Vec::new()),
            };
            peripheral.set_value(FACTORY_RESET_HANDLE, vec![value]);
            responses
        }
        _ => Vec::new(),
    }
}

fn respond_to_control(state: &mut DeviceState, keys: &KeySet, data: &[u8]) -> Vec<SimResponse> {
    let packet = match crypto::decrypt(data, &state.context, keys)
        .ok()
        .and_then(|plain| ControlPacket::parse(&plain).ok())
    {
        Some(packet) => packet,
        None => {
            log::debug!("Simulated Crownstone dropped an undecodable control write");
            return Vec::new();
        }
    };
    state.commands.push(packet.clone());

    let command = packet.control_type;
    let replies: Vec<Option<(ResultCode, Vec<u8>)>> = match command {
        ControlType::Disconnect => return vec![SimResponse::Disconnect],
        ControlType::MicroappGetInfo => vec![Some((ResultCode::Success, state.info.serialize()))],
        ControlType::StateSet => match StatePacket::parse(&packet.payload) {
            Ok(set) if state.states.contains_key(&set.state_type) => {
                state.states.insert(set.state_type, set.value);
                vec![Some((ResultCode::Success, Vec::new()))]
            }
            Ok(_) => vec![Some((ResultCode::InvalidMessage, Vec::new()))],
            Err(_) => vec![Some((ResultCode::WrongPayloadLength, Vec::new()))],
        },
        ControlType::StateGet => match StatePacket::parse(&packet.payload) {
            Ok(get) => match state.states.get(&get.state_type) {
                Some(value) => {
                    let reply = StatePacket {
                        value: value.clone(),
                        ..get
                    };
                    vec![Some((ResultCode::Success, reply.serialize()))]
                }
                None => vec![Some((ResultCode::InvalidMessage, Vec::new()))],
            },
            Err(_) => vec![Some((ResultCode::WrongPayloadLength, Vec::new()))],
        },
        ControlType::MicroappUpload => {
            let index = state.chunks_received;
            state.chunks_received += 1;
            match UploadChunk::parse(&packet.payload) {
                Ok(_) if state.reject_chunk == Some(index) => {
                    vec![Some((ResultCode::WrongPayloadLength, Vec::new()))]
                }
                Ok(chunk) => {
                    let offset = chunk.offset as usize;
                    let end = offset + chunk.data.len();
                    if state.microapp.len() < end {
                        state.microapp.resize(end, 0);
                    }
                    state.microapp[offset..end].copy_from_slice(&chunk.data);
                    vec![
                        Some((ResultCode::WaitForSuccess, Vec::new())),
                        None,
                        Some((ResultCode::Success, Vec::new())),
                    ]
                }
                Err(_) => vec![Some((ResultCode::InvalidMessage, Vec::new()))],
            }
        }
        ControlType::MicroappValidate
        | ControlType::MicroappEnable
        | ControlType::MicroappDisable
        | ControlType::MicroappRemove => vec![
            Some((ResultCode::WaitForSuccess, Vec::new())),
            None,
            Some((ResultCode::Success, Vec::new())),
        ],
        _ => vec![Some((ResultCode::Success, Vec::new()))],
    };

    if state.silent {
        return Vec::new();
    }
    replies
        .into_iter()
        .map(|reply| match reply {
            Some((code, payload)) => {
                let result = ResultPacket::new(command, code, payload).serialize();
                SimResponse::Notify {
                    handle: RESULT_HANDLE,
                    data: crypto::encrypt(&result, &state.context, keys),
                }
            }
            None => SimResponse::Delay(PROCESSING_TIME),
        })
        .collect()
}
