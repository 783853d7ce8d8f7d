//! Microapp packets and the chunked upload cursor

use super::control::{ControlPacket, ControlType};
use super::{ensure_length, read_u16, read_u32, ProtocolError};

pub const MICROAPP_PROTOCOL: u8 = 1;

/// Upload chunks must be a multiple of this many bytes.
const CHUNK_ALIGNMENT: usize = 4;
const CHUNK_PADDING: u8 = 0xFF;

/// Largest binary whose chunk offsets all fit the u16 offset field.
pub const MAX_MICROAPP_SIZE: usize = u16::MAX as usize + 1;

/// `app_index u8 | protocol u8`, in front of every microapp command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicroappHeader {
    pub app_index: u8,
    pub protocol: u8,
}

impl MicroappHeader {
    pub fn new(app_index: u8) -> Self {
        Self {
            protocol: MICROAPP_PROTOCOL,
            app_index,
        }
    }

    pub fn serialize(&self) -> [u8; 2] {
        [self.app_index, self.protocol]
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_length("microapp header", data, 2)?;
        Ok(Self {
            app_index: data[0],
            protocol: data[1],
        })
    }
}

/// Control packet carrying only a microapp header.
pub fn header_command(control_type: ControlType, app_index: u8) -> Vec<u8> {
    ControlPacket::with_payload(control_type, MicroappHeader::new(app_index).serialize().to_vec())
        .serialize()
}

/// Control packet uploading one chunk: `header | offset u16 LE | chunk`.
pub fn upload_command(app_index: u8, offset: u16, chunk: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + chunk.len());
    payload.extend_from_slice(&MicroappHeader::new(app_index).serialize());
    payload.extend_from_slice(&offset.to_le_bytes());
    payload.extend_from_slice(chunk);
    ControlPacket::with_payload(ControlType::MicroappUpload, payload).serialize()
}

/// Decoded payload of an upload control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    pub header: MicroappHeader,
    pub offset: u16,
    pub data: Vec<u8>,
}

impl UploadChunk {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        ensure_length("microapp upload", payload, 4)?;
        Ok(Self {
            header: MicroappHeader::parse(payload)?,
            offset: read_u16(payload, 2),
            data: payload[4..].to_vec(),
        })
    }
}

/// Cursor over a microapp binary being uploaded chunk by chunk.
///
/// The chunk index only moves forward; the upload is complete once
/// `advance` reports that no chunk remains.
#[derive(Debug, Clone)]
pub struct UploadState {
    app_index: u8,
    data: Vec<u8>,
    chunk_size: usize,
    index: usize,
    offset: usize,
    chunk_count: usize,
}

impl UploadState {
    pub fn new(app_index: u8, data: Vec<u8>, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(CHUNK_ALIGNMENT);
        let chunk_count = data.len().div_ceil(chunk_size);
        Self {
            app_index,
            data,
            chunk_size,
            index: 0,
            offset: 0,
            chunk_count,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn remaining_chunks(&self) -> usize {
        self.chunk_count.saturating_sub(self.index)
    }

    /// The current chunk, padded with 0xFF to a multiple of 4 bytes.
    pub fn current_chunk(&self) -> Vec<u8> {
        let end = (self.offset + self.chunk_size).min(self.data.len());
        let mut chunk = self.data[self.offset.min(end)..end].to_vec();
        let remainder = chunk.len() % CHUNK_ALIGNMENT;
        if remainder != 0 {
            chunk.resize(chunk.len() + CHUNK_ALIGNMENT - remainder, CHUNK_PADDING);
        }
        chunk
    }

    /// Control packet uploading the current chunk.
    ///
    /// Fails once the offset no longer fits the u16 offset field.
    pub fn current_command(&self) -> Result<Vec<u8>, ProtocolError> {
        let offset = u16::try_from(self.offset).map_err(|_| {
            ProtocolError::Malformed(format!(
                "upload offset {} does not fit the offset field",
                self.offset
            ))
        })?;
        Ok(upload_command(self.app_index, offset, &self.current_chunk()))
    }

    /// Move to the next chunk. Returns false when no chunk remains.
    pub fn advance(&mut self) -> bool {
        if self.index + 1 >= self.chunk_count {
            self.index = self.chunk_count;
            self.offset = self.data.len();
            return false;
        }
        self.index += 1;
        self.offset += self.chunk_size;
        true
    }

    pub fn is_complete(&self) -> bool {
        self.index >= self.chunk_count
    }
}

/// One app slot as reported by the get-info command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicroappSlot {
    pub build_version: u32,
    pub checksum: u16,
    pub enabled: bool,
}

/// Result payload of the get-info command.
///
/// Layout: `protocol u8 | max_apps u8 | max_app_size u16 | max_chunk_size u16`
/// followed by one 8 byte slot per app:
/// `build_version u32 | checksum u16 | enabled u8 | reserved u8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicroappInfo {
    pub protocol: u8,
    pub max_apps: u8,
    pub max_app_size: u16,
    pub max_chunk_size: u16,
    pub slots: Vec<MicroappSlot>,
}

const INFO_HEADER_LENGTH: usize = 6;
const SLOT_LENGTH: usize = 8;

impl MicroappInfo {
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_length("microapp info", data, INFO_HEADER_LENGTH)?;
        let max_apps = data[1];
        ensure_length(
            "microapp info",
            data,
            INFO_HEADER_LENGTH + max_apps as usize * SLOT_LENGTH,
        )?;

        let slots = data[INFO_HEADER_LENGTH..]
            .chunks_exact(SLOT_LENGTH)
            .take(max_apps as usize)
            .map(|slot| MicroappSlot {
                build_version: read_u32(slot, 0),
                checksum: read_u16(slot, 4),
                enabled: slot[6] != 0,
            })
            .collect();

        Ok(Self {
            protocol: data[0],
            max_apps,
            max_app_size: read_u16(data, 2),
            max_chunk_size: read_u16(data, 4),
            slots,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(INFO_HEADER_LENGTH + self.slots.len() * SLOT_LENGTH);
        out.push(self.protocol);
        out.push(self.slots.len() as u8);
        out.extend_from_slice(&self.max_app_size.to_le_bytes());
        out.extend_from_slice(&self.max_chunk_size.to_le_bytes());
        for slot in &self.slots {
            out.extend_from_slice(&slot.build_version.to_le_bytes());
            out.extend_from_slice(&slot.checksum.to_le_bytes());
            out.push(slot.enabled as u8);
            out.push(0);
        }
        out
    }
}
