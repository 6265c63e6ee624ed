//! Frame header preceding every envelope on the wire.
//!
//! ```text
//! magic:          [u8; 4]  "ILK1"
//! payload_length: u32 LE
//! checksum:       u32 LE   first 4 bytes of BLAKE3(payload)
//! ```

use crate::error::LinkError;

/// Magic bytes opening every frame.
pub const MAGIC: [u8; 4] = *b"ILK1";

/// Encoded header size in bytes.
pub const HEADER_SIZE: usize = 12;

/// Checksum of a frame payload.
pub fn payload_checksum(payload: &[u8]) -> u32 {
    let hash = blake3::hash(payload);
    let bytes = hash.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    payload_length: u32,
    checksum: u32,
}

impl FrameHeader {
    /// Header for `payload`, checksum included.
    pub fn for_payload(payload: &[u8]) -> Result<Self, LinkError> {
        let payload_length = u32::try_from(payload.len()).map_err(|_| LinkError::FrameTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;
        Ok(Self {
            payload_length,
            checksum: payload_checksum(payload),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.payload_length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Parse a header. `bytes` must hold at least [`HEADER_SIZE`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LinkError> {
        if bytes.len() < HEADER_SIZE {
            return Err(LinkError::Framing("short header"));
        }
        if bytes[0..4] != MAGIC {
            return Err(LinkError::Framing("invalid magic bytes"));
        }
        Ok(Self {
            payload_length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        })
    }

    pub fn payload_length(&self) -> usize {
        self.payload_length as usize
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// `true` if `payload` matches the recorded checksum.
    pub fn verify(&self, payload: &[u8]) -> bool {
        payload_checksum(payload) == self.checksum
    }
}
