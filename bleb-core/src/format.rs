//! On-disk structures for the repository format.
//!
//! Every struct here is a plain value type with an explicit byte layout;
//! there is no shared mutable graph on disk, only forward-pointing offsets
//! (§9 of the format notes: spans point only forward, streams point only at
//! their descriptor slot, entries are self-describing).

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{BlebError, Result};

pub const MAGIC: [u8; 7] = [0x89, b'b', b'l', b'e', b'b', 0x0D, 0x0A];
pub const CURRENT_FORMAT_VERSION: u8 = 1;

pub const PROLOGUE_SIZE: u64 = 16;
pub const CONTENT_DIRECTORY_DESCRIPTOR_POS: u64 = PROLOGUE_SIZE;
pub const STREAM_DESCRIPTOR_SIZE: u64 = 16;
pub const SPAN_HEADER_SIZE: u64 = 16;
pub const OBJECT_ENTRY_PROLOGUE_SIZE: u64 = 6;

pub const OBJECT_ENTRY_LENGTH_MASK: u16 = 0x7FFF;
pub const OBJECT_ENTRY_INVALIDATED_BIT: u16 = 0x8000;

/// Bitmask carried by an object entry's `flags` field.
pub mod object_flags {
    pub const IS_DIRECTORY: u16 = 0x0001;
    pub const HAS_STREAM_DESCR: u16 = 0x0002;
    pub const HAS_STORAGE_DESCR: u16 = 0x0004;
    pub const HAS_HASH128: u16 = 0x0008;
    pub const HAS_INLINE_PAYLOAD: u16 = 0x0010;
    pub const IS_TEXT: u16 = 0x1001;
}

/// Caller-facing flags for `Directory::set_object_contents`.
pub mod put_flags {
    pub const PREFER_INLINE_PAYLOAD: u32 = 0x0001;
}

/// Caller-facing flags for `Directory::open_stream`.
pub mod stream_open_mode {
    pub const CREATE: u32 = 0x0001;
    pub const TRUNCATE: u32 = 0x0002;
}

/// Rounds `value` up to the next multiple of `unit` (`unit` must be non-zero).
pub fn align_up(value: u64, unit: u64) -> u64 {
    debug_assert!(unit != 0);
    (value + unit - 1) / unit * unit
}

/// Rounds a directory-entry length up to the next multiple of 16.
pub fn align16(value: u16) -> u16 {
    (value + 15) & !15
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prologue {
    pub format_version: u8,
    pub flags: u32,
    pub info_flags: u32,
}

impl Prologue {
    pub fn fresh() -> Self {
        Prologue {
            format_version: CURRENT_FORMAT_VERSION,
            flags: 0,
            info_flags: 0,
        }
    }

    pub fn read(bytes: &[u8; PROLOGUE_SIZE as usize]) -> Result<Self> {
        if bytes[0..7] != MAGIC {
            return Err(BlebError::NotABlebRepository);
        }

        let format_version = bytes[7];
        let flags = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let info_flags = u32::from_le_bytes(bytes[12..16].try_into().unwrap());

        if format_version > CURRENT_FORMAT_VERSION {
            return Err(BlebError::NotSupported(format!(
                "formatVersion {format_version} is newer than the highest version ({CURRENT_FORMAT_VERSION}) this build understands"
            )));
        }
        if flags != 0 {
            return Err(BlebError::NotSupported(format!(
                "prologue carries unknown flag bits: {flags:#x}"
            )));
        }

        Ok(Prologue { format_version, flags, info_flags })
    }

    pub fn write(&self, bytes: &mut [u8; PROLOGUE_SIZE as usize]) {
        bytes[0..7].copy_from_slice(&MAGIC);
        bytes[7] = self.format_version;
        bytes[8..12].copy_from_slice(&self.flags.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.info_flags.to_le_bytes());
    }
}

/// Anchors a span chain: the offset of its first span (0 = unallocated) and
/// the stream's current logical length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamDescriptor {
    pub location: u64,
    pub length: u64,
}

impl StreamDescriptor {
    pub const SIZE: usize = STREAM_DESCRIPTOR_SIZE as usize;

    pub fn is_allocated(&self) -> bool {
        self.location != 0
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        Self::read_from(&mut cursor)
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let location = reader
            .read_u64::<LittleEndian>()
            .map_err(|e| BlebError::ReadFailed(e.to_string()))?;
        let length = reader
            .read_u64::<LittleEndian>()
            .map_err(|e| BlebError::ReadFailed(e.to_string()))?;
        Ok(StreamDescriptor { location, length })
    }

    pub fn write_to(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.location.to_le_bytes());
        out[8..16].copy_from_slice(&self.length.to_le_bytes());
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer
            .write_u64::<LittleEndian>(self.location)
            .and_then(|_| writer.write_u64::<LittleEndian>(self.length))
            .map_err(|e| BlebError::WriteFailed(e.to_string()))
    }
}

/// Span metadata. `reservedLength` is the span's payload capacity;
/// `usedLength` is how much of it is logically part of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpanHeader {
    pub reserved_length: u32,
    pub used_length: u32,
    pub next_span_location: u64,
}

impl SpanHeader {
    pub const SIZE: usize = SPAN_HEADER_SIZE as usize;

    pub fn is_tail(&self) -> bool {
        self.next_span_location == 0
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let reserved_length = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| BlebError::ReadFailed(e.to_string()))?;
        let used_length = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| BlebError::ReadFailed(e.to_string()))?;
        let next_span_location = cursor
            .read_u64::<LittleEndian>()
            .map_err(|e| BlebError::ReadFailed(e.to_string()))?;
        Ok(SpanHeader { reserved_length, used_length, next_span_location })
    }

    pub fn write_to(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.reserved_length.to_le_bytes());
        out[4..8].copy_from_slice(&self.used_length.to_le_bytes());
        out[8..16].copy_from_slice(&self.next_span_location.to_le_bytes());
    }
}

/// Six-byte prefix of every directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectEntryPrologueHeader {
    pub length: u16,
    pub flags: u16,
    pub name_length: u16,
}

impl ObjectEntryPrologueHeader {
    pub const SIZE: usize = OBJECT_ENTRY_PROLOGUE_SIZE as usize;

    pub fn new(byte_length: u16, flags: u16, name_length: u16) -> Self {
        ObjectEntryPrologueHeader { length: byte_length & OBJECT_ENTRY_LENGTH_MASK, flags, name_length }
    }

    pub fn invalidated(byte_length: u16) -> Self {
        ObjectEntryPrologueHeader {
            length: (byte_length & OBJECT_ENTRY_LENGTH_MASK) | OBJECT_ENTRY_INVALIDATED_BIT,
            flags: 0,
            name_length: 0,
        }
    }

    pub fn byte_length(&self) -> u16 {
        self.length & OBJECT_ENTRY_LENGTH_MASK
    }

    pub fn is_invalidated(&self) -> bool {
        self.length & OBJECT_ENTRY_INVALIDATED_BIT != 0
    }

    pub fn padded_length(&self) -> u16 {
        align16(self.byte_length())
    }

    pub fn mark_invalidated(&mut self) {
        self.length |= OBJECT_ENTRY_INVALIDATED_BIT;
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let length = cursor
            .read_u16::<LittleEndian>()
            .map_err(|e| BlebError::ReadFailed(e.to_string()))?;
        let flags = cursor
            .read_u16::<LittleEndian>()
            .map_err(|e| BlebError::ReadFailed(e.to_string()))?;
        let name_length = cursor
            .read_u16::<LittleEndian>()
            .map_err(|e| BlebError::ReadFailed(e.to_string()))?;
        Ok(ObjectEntryPrologueHeader { length, flags, name_length })
    }

    pub fn write_to(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.length.to_le_bytes());
        out[2..4].copy_from_slice(&self.flags.to_le_bytes());
        out[4..6].copy_from_slice(&self.name_length.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prologue_round_trips() {
        let p = Prologue { format_version: 1, flags: 0, info_flags: 7 };
        let mut bytes = [0u8; PROLOGUE_SIZE as usize];
        p.write(&mut bytes);
        assert_eq!(Prologue::read(&bytes).unwrap(), p);
    }

    #[test]
    fn prologue_rejects_bad_magic() {
        let mut bytes = [0u8; PROLOGUE_SIZE as usize];
        Prologue::fresh().write(&mut bytes);
        bytes[0] = 0x00;
        assert!(matches!(Prologue::read(&bytes), Err(BlebError::NotABlebRepository)));
    }

    #[test]
    fn prologue_rejects_future_version() {
        let mut bytes = [0u8; PROLOGUE_SIZE as usize];
        let mut p = Prologue::fresh();
        p.format_version = 2;
        p.write(&mut bytes);
        assert!(matches!(Prologue::read(&bytes), Err(BlebError::NotSupported(_))));
    }

    #[test]
    fn align16_rounds_up() {
        assert_eq!(align16(0), 0);
        assert_eq!(align16(1), 16);
        assert_eq!(align16(16), 16);
        assert_eq!(align16(17), 32);
    }

    #[test]
    fn entry_prologue_packs_invalidated_bit_over_length() {
        let hdr = ObjectEntryPrologueHeader::invalidated(40);
        assert!(hdr.is_invalidated());
        assert_eq!(hdr.byte_length(), 40);
    }
}
