//! Versioned binary encoding of published frames.
//!
//! Each frame is written as one packet: a fixed header followed by the rkyv
//! archive of the [`FrameData`], optionally LZ4-compressed. A trace file and a
//! telemetry stream are both plain sequences of packets.

use std::borrow::Cow;
use std::io::{self, Read, Write};

use crate::error::ProtocolError;
use crate::frame::FrameData;

/// Wire protocol magic bytes: "VP"
pub const MAGIC: [u8; 2] = [0x56, 0x50];

/// Current format version. Bumped on any change to the archived layout.
pub const FORMAT_VERSION: u16 = 1;

/// Maximum packet payload size: 256 MB
pub const MAX_PACKET_SIZE: u32 = 256 * 1024 * 1024;

/// Packet header size in bytes: magic(2) + version(2) + flags(1) + length(4) = 9
pub const HEADER_SIZE: usize = 9;

/// Payloads smaller than this are never compressed.
const COMPRESSION_THRESHOLD: usize = 512;

bitflags::bitflags! {
    /// Packet flags byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketFlags: u8 {
        const COMPRESSED = 0b0000_0001;
        const PARTIAL    = 0b0000_0010;
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u16,
    pub flags: PacketFlags,
    pub length: u32,
}

/// Encode a frame into bytes (header + payload), with optional LZ4 compression.
pub fn encode_frame(frame: &FrameData, compress: bool) -> Result<Vec<u8>, WireError> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(frame)
        .map_err(|e| WireError::Serialization(e.to_string()))?;

    let (final_payload, compression_flag) = if compress && payload.len() > COMPRESSION_THRESHOLD {
        let compressed = lz4_flex::compress_prepend_size(&payload);
        if compressed.len() < payload.len() {
            (Cow::Owned(compressed), PacketFlags::COMPRESSED)
        } else {
            (Cow::Borrowed(payload.as_slice()), PacketFlags::empty())
        }
    } else {
        (Cow::Borrowed(payload.as_slice()), PacketFlags::empty())
    };

    let status_flag = if frame.is_partial() {
        PacketFlags::PARTIAL
    } else {
        PacketFlags::empty()
    };

    let payload_len = u32::try_from(final_payload.len())
        .ok()
        .filter(|&len| len <= MAX_PACKET_SIZE)
        .ok_or(WireError::PacketTooLarge(final_payload.len()))?;

    let flags = compression_flag | status_flag;

    let mut packet = Vec::with_capacity(HEADER_SIZE + final_payload.len());
    packet.extend_from_slice(&MAGIC);
    packet.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    packet.push(flags.bits());
    packet.extend_from_slice(&payload_len.to_le_bytes());
    packet.extend_from_slice(&final_payload);

    Ok(packet)
}

/// Decode a packet header.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<PacketHeader, WireError> {
    if header[0] != MAGIC[0] || header[1] != MAGIC[1] {
        return Err(WireError::InvalidMagic);
    }

    let version = u16::from_le_bytes([header[2], header[3]]);
    if version != FORMAT_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }

    let flags = PacketFlags::from_bits_truncate(header[4]);
    let length = u32::from_le_bytes([header[5], header[6], header[7], header[8]]);

    if length > MAX_PACKET_SIZE {
        return Err(WireError::PacketTooLarge(length as usize));
    }

    Ok(PacketHeader {
        version,
        flags,
        length,
    })
}

/// Decode a frame from payload bytes, decompressing if the COMPRESSED flag is set.
///
/// The archive layout is checked by rkyv; the region arenas inside it are
/// checked afterwards, so a decoded frame is always safe to traverse.
pub fn decode_frame(payload: &[u8], flags: PacketFlags) -> Result<FrameData, WireError> {
    let data: Cow<'_, [u8]> = if flags.contains(PacketFlags::COMPRESSED) {
        Cow::Owned(
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| WireError::DecompressionError(e.to_string()))?,
        )
    } else {
        Cow::Borrowed(payload)
    };

    // Archived data must be suitably aligned; payload slices usually are not.
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(data.len());
    aligned.extend_from_slice(&data);

    let frame = rkyv::from_bytes::<FrameData, rkyv::rancor::Error>(&aligned)
        .map_err(|e| WireError::Serialization(e.to_string()))?;
    frame.validate()?;
    Ok(frame)
}

/// Decode a complete packet held in memory.
pub fn decode_packet(packet: &[u8]) -> Result<FrameData, WireError> {
    let header: &[u8; HEADER_SIZE] = packet
        .get(..HEADER_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or(WireError::Truncated)?;
    let header = decode_header(header)?;
    let payload = packet
        .get(HEADER_SIZE..HEADER_SIZE + header.length as usize)
        .ok_or(WireError::Truncated)?;
    decode_frame(payload, header.flags)
}

/// Write one frame packet to `writer`.
pub fn write_frame<W: Write>(writer: &mut W, frame: &FrameData, compress: bool) -> Result<(), WireError> {
    let packet = encode_frame(frame, compress)?;
    writer.write_all(&packet)?;
    Ok(())
}

/// Read the next frame packet from `reader`. Returns `Ok(None)` on a clean
/// end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<FrameData>, WireError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = decode_header(&header)?;

    let mut payload = vec![0u8; header.length as usize];
    reader.read_exact(&mut payload).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            WireError::Truncated
        } else {
            WireError::Io(e)
        }
    })?;

    decode_frame(&payload, header.flags).map(Some)
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid magic bytes")]
    InvalidMagic,
    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u16),
    #[error("packet too large: {0} bytes")]
    PacketTooLarge(usize),
    #[error("truncated packet")]
    Truncated,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("decompression error: {0}")]
    DecompressionError(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] ProtocolError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
