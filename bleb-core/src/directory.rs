//! Repository Directory: a single stream whose bytes hold a packed sequence
//! of object entries. Owns name lookup, in-place overwrite, invalidate-and-
//! append, and iteration.

use std::cell::RefCell;
use std::rc::Rc;

use crate::device::{ByteStore, SharedStore};
use crate::error::{BlebError, Result};
use crate::format::{
    align16, object_flags, put_flags, stream_open_mode, ObjectEntryPrologueHeader, StreamDescriptor,
    OBJECT_ENTRY_PROLOGUE_SIZE,
};
use crate::stream::{DescriptorHome, Stream};

/// Result of a name lookup: either the entry was found, or the scan settled
/// on a position to place a new one (a reclaimed invalidated slot, or the
/// end of the directory stream).
pub enum FindOutcome {
    Found(FoundEntry),
    NotFound { insert_pos: u64 },
}

pub struct FoundEntry {
    pub pos: u64,
    pub prologue: ObjectEntryPrologueHeader,
}

pub struct Directory {
    device: SharedStore,
    stream: Rc<RefCell<Stream>>,
    scratch: Vec<u8>,
}

impl Directory {
    pub fn new(device: SharedStore, stream: Stream) -> Self {
        Directory { device, stream: Rc::new(RefCell::new(stream)), scratch: Vec::new() }
    }

    pub fn len(&self) -> u64 {
        self.stream.borrow().len()
    }

    fn home(&self) -> DescriptorHome {
        DescriptorHome::Stream(self.stream.clone())
    }

    /// Flushes the directory stream's own descriptor. Called by the
    /// repository facade on close.
    pub fn flush(&mut self) -> Result<()> {
        self.stream.borrow_mut().flush()
    }

    fn read_prologue_at(&self, pos: u64) -> Result<ObjectEntryPrologueHeader> {
        let mut bytes = [0u8; ObjectEntryPrologueHeader::SIZE];
        if !self.stream.borrow_mut().get_bytes_at(pos, &mut bytes) {
            return Err(BlebError::ReadFailed(format!("failed reading entry prologue at {pos}")));
        }
        ObjectEntryPrologueHeader::read(&bytes)
    }

    /// Walks the directory stream from the start. `new_entry_size` (when
    /// non-zero) enables reuse-candidate tracking over invalidated entries,
    /// keeping the smallest one that still fits.
    fn find_object_by_name(&self, name: &[u8], new_entry_size: u16) -> Result<FindOutcome> {
        let stream_len = self.stream.borrow().len();
        let mut pos = 0u64;
        let mut best_reuse: Option<(u64, u16)> = None;

        while pos < stream_len {
            let prologue = self.read_prologue_at(pos)?;
            let byte_length = prologue.byte_length();
            if (byte_length as u64) < OBJECT_ENTRY_PROLOGUE_SIZE {
                return Err(BlebError::corruption(format!("entry at {pos} has length {byte_length} < 6")));
            }
            let padded = prologue.padded_length() as u64;

            if prologue.is_invalidated() {
                if new_entry_size != 0 && byte_length >= new_entry_size {
                    if best_reuse.map_or(true, |(_, best_len)| byte_length < best_len) {
                        best_reuse = Some((pos, byte_length));
                    }
                }
            } else {
                if prologue.name_length == name.len() as u16 {
                    let mut name_buf = vec![0u8; name.len()];
                    if !self.stream.borrow_mut().get_bytes_at(pos + OBJECT_ENTRY_PROLOGUE_SIZE, &mut name_buf) {
                        return Err(BlebError::ReadFailed(format!("failed reading entry name at {pos}")));
                    }
                    if name_buf == name {
                        return Ok(FindOutcome::Found(FoundEntry { pos, prologue }));
                    }
                }
            }

            pos += padded;
        }

        match best_reuse {
            Some((pos, _)) => Ok(FindOutcome::NotFound { insert_pos: pos }),
            None => Ok(FindOutcome::NotFound { insert_pos: stream_len }),
        }
    }

    pub fn contains(&self, name: &[u8]) -> Result<bool> {
        Ok(matches!(self.find_object_by_name(name, 0)?, FindOutcome::Found(_)))
    }

    /// Returns `None` for a missing name without treating that as an error,
    /// per the format's user-visible-behaviour rule.
    pub fn get_object_contents(&mut self, name: &[u8]) -> Result<Option<Vec<u8>>> {
        let found = match self.find_object_by_name(name, 0)? {
            FindOutcome::Found(f) => f,
            FindOutcome::NotFound { .. } => return Ok(None),
        };

        if found.prologue.flags & object_flags::HAS_STREAM_DESCR != 0 {
            let descr_pos = found.pos + OBJECT_ENTRY_PROLOGUE_SIZE + found.prologue.name_length as u64;
            let mut payload_stream =
                Stream::open_existing(self.device.clone(), self.home(), descr_pos, true)?;
            let len = payload_stream.len();
            let len_usize = usize::try_from(len)
                .map_err(|_| BlebError::NotEnoughMemory(format!("object {len} bytes exceeds addressable size")))?;
            let mut buf = vec![0u8; len_usize];
            payload_stream.read(&mut buf)?;
            Ok(Some(buf))
        } else if found.prologue.flags & object_flags::HAS_INLINE_PAYLOAD != 0 {
            let payload_pos = found.pos + OBJECT_ENTRY_PROLOGUE_SIZE + found.prologue.name_length as u64;
            let header_and_name = OBJECT_ENTRY_PROLOGUE_SIZE + found.prologue.name_length as u64;
            let payload_len = found.prologue.byte_length() as u64 - header_and_name;
            let mut buf = vec![0u8; payload_len as usize];
            if !self.stream.borrow_mut().get_bytes_at(payload_pos, &mut buf) {
                return Err(BlebError::ReadFailed(format!("failed reading inline payload at {payload_pos}")));
            }
            Ok(Some(buf))
        } else {
            Err(BlebError::corruption(format!(
                "entry at {} has neither kHasInlinePayload nor kHasStreamDescr",
                found.pos
            )))
        }
    }

    /// Writes `name`'s content, overwriting any existing entry. `extra_object_flags`
    /// carries caller flags like `kIsText`/`kIsDirectory` ORed into the entry.
    pub fn set_object_contents(
        &mut self,
        name: &[u8],
        contents: &[u8],
        flags: u32,
        extra_object_flags: u16,
    ) -> Result<()> {
        let prologue_len = OBJECT_ENTRY_PROLOGUE_SIZE as usize + name.len();
        let prefer_inline = flags & put_flags::PREFER_INLINE_PAYLOAD != 0;
        let use_inline =
            prefer_inline && (prologue_len + contents.len()) < crate::format::OBJECT_ENTRY_LENGTH_MASK as usize;
        let object_entry_len = if use_inline {
            prologue_len + contents.len()
        } else {
            prologue_len + StreamDescriptor::SIZE
        };
        let object_entry_len = u16::try_from(object_entry_len)
            .map_err(|_| BlebError::Internal("object entry length overflowed u16".into()))?;

        match self.find_object_by_name(name, object_entry_len)? {
            FindOutcome::Found(found) if found.prologue.flags & object_flags::HAS_STREAM_DESCR != 0 => {
                let descr_pos = found.pos + OBJECT_ENTRY_PROLOGUE_SIZE + found.prologue.name_length as u64;
                let mut payload_stream =
                    Stream::open_existing(self.device.clone(), self.home(), descr_pos, false)?;
                payload_stream.set_pos(0);
                payload_stream.write(contents)?;
                payload_stream.set_length(contents.len() as u64);
                payload_stream.flush()
            }
            FindOutcome::Found(found) if found.prologue.flags & object_flags::HAS_INLINE_PAYLOAD != 0 => {
                let old_padded = found.prologue.padded_length();
                let new_padded = align16(object_entry_len);
                let preserved_flags = found.prologue.flags & !object_flags::HAS_INLINE_PAYLOAD | extra_object_flags;
                if old_padded >= new_padded {
                    self.place_entry_at(found.pos, name, contents, use_inline, preserved_flags)
                } else {
                    self.invalidate_entry_at(found.pos, found.prologue)?;
                    let end = self.stream.borrow().len();
                    self.place_entry_at(end, name, contents, use_inline, preserved_flags)
                }
            }
            FindOutcome::Found(found) => Err(BlebError::corruption(format!(
                "entry at {} has neither kHasInlinePayload nor kHasStreamDescr",
                found.pos
            ))),
            FindOutcome::NotFound { insert_pos } => {
                self.place_entry_at(insert_pos, name, contents, use_inline, extra_object_flags)
            }
        }
    }

    /// Opens (or creates) a standalone stream for `name`. Returns `Ok(None)`
    /// when the name is missing and `mode` lacks `kStreamCreate`.
    pub fn open_stream(&mut self, name: &[u8], mode: u32, reserve_length: u64) -> Result<Option<Stream>> {
        let truncate = mode & stream_open_mode::TRUNCATE != 0;
        let create = mode & stream_open_mode::CREATE != 0;

        match self.find_object_by_name(name, 0)? {
            FindOutcome::Found(found) if found.prologue.flags & object_flags::HAS_STREAM_DESCR != 0 => {
                let descr_pos = found.pos + OBJECT_ENTRY_PROLOGUE_SIZE + found.prologue.name_length as u64;
                let mut stream = Stream::open_existing(self.device.clone(), self.home(), descr_pos, false)?;
                if truncate {
                    stream.set_length(0);
                    stream.set_pos(0);
                }
                Ok(Some(stream))
            }
            FindOutcome::Found(found) if found.prologue.flags & object_flags::HAS_INLINE_PAYLOAD != 0 => {
                let name_len = found.prologue.name_length as u64;
                let payload_pos = found.pos + OBJECT_ENTRY_PROLOGUE_SIZE + name_len;
                let header_and_name = OBJECT_ENTRY_PROLOGUE_SIZE + name_len;
                let payload_len = found.prologue.byte_length() as u64 - header_and_name;

                let preserved = if truncate {
                    Vec::new()
                } else {
                    let mut buf = vec![0u8; payload_len as usize];
                    if !self.stream.borrow_mut().get_bytes_at(payload_pos, &mut buf) {
                        return Err(BlebError::ReadFailed(format!(
                            "failed reading inline payload to preserve at {payload_pos}"
                        )));
                    }
                    buf
                };

                let new_flags = (found.prologue.flags & !object_flags::HAS_INLINE_PAYLOAD)
                    | object_flags::HAS_STREAM_DESCR;
                let new_entry_len = header_and_name + StreamDescriptor::SIZE as u64;
                let new_padded = align16(new_entry_len as u16);
                let old_padded = found.prologue.padded_length();

                let entry_pos = if old_padded >= new_padded {
                    let len = self.fill_stream_placeholder(name, new_flags);
                    self.overwrite_entry_at(found.pos, len)?;
                    found.pos
                } else {
                    self.invalidate_entry_at(found.pos, found.prologue)?;
                    let end = self.stream.borrow().len();
                    let len = self.fill_stream_placeholder(name, new_flags);
                    self.overwrite_entry_at(end, len)?;
                    end
                };

                let descr_pos = entry_pos + OBJECT_ENTRY_PROLOGUE_SIZE + name_len;
                let mut stream =
                    Stream::create_new(self.device.clone(), self.home(), descr_pos, preserved.len() as u64)?;
                if !preserved.is_empty() {
                    stream.write(&preserved)?;
                    stream.set_pos(0);
                }
                Ok(Some(stream))
            }
            FindOutcome::Found(found) => Err(BlebError::corruption(format!(
                "entry at {} has neither kHasInlinePayload nor kHasStreamDescr",
                found.pos
            ))),
            FindOutcome::NotFound { insert_pos } => {
                if !create {
                    return Ok(None);
                }
                let len = self.fill_stream_placeholder(name, object_flags::HAS_STREAM_DESCR);
                self.overwrite_entry_at(insert_pos, len)?;
                let descr_pos = insert_pos + OBJECT_ENTRY_PROLOGUE_SIZE + name.len() as u64;
                let stream = Stream::create_new(self.device.clone(), self.home(), descr_pos, reserve_length)?;
                Ok(Some(stream))
            }
        }
    }

    /// Names of every currently-valid (non-invalidated) entry, in on-disk order.
    pub fn enumerate(&self) -> Result<Vec<Vec<u8>>> {
        let stream_len = self.stream.borrow().len();
        let mut pos = 0u64;
        let mut names = Vec::new();

        while pos < stream_len {
            let prologue = self.read_prologue_at(pos)?;
            let byte_length = prologue.byte_length();
            if (byte_length as u64) < OBJECT_ENTRY_PROLOGUE_SIZE {
                return Err(BlebError::corruption(format!("entry at {pos} has length {byte_length} < 6")));
            }
            if !prologue.is_invalidated() {
                let mut name_buf = vec![0u8; prologue.name_length as usize];
                if !self.stream.borrow_mut().get_bytes_at(pos + OBJECT_ENTRY_PROLOGUE_SIZE, &mut name_buf) {
                    return Err(BlebError::ReadFailed(format!("failed reading entry name at {pos}")));
                }
                names.push(name_buf);
            }
            pos += prologue.padded_length() as u64;
        }

        Ok(names)
    }

    fn place_entry_at(
        &mut self,
        pos: u64,
        name: &[u8],
        contents: &[u8],
        use_inline: bool,
        extra_object_flags: u16,
    ) -> Result<()> {
        if use_inline {
            let len = self.fill_inline_entry(name, extra_object_flags, contents);
            self.overwrite_entry_at(pos, len)
        } else {
            let flags = (extra_object_flags & !object_flags::HAS_INLINE_PAYLOAD) | object_flags::HAS_STREAM_DESCR;
            let len = self.fill_stream_placeholder(name, flags);
            self.overwrite_entry_at(pos, len)?;
            let descr_pos = pos + OBJECT_ENTRY_PROLOGUE_SIZE + name.len() as u64;
            let mut stream =
                Stream::create_new(self.device.clone(), self.home(), descr_pos, contents.len() as u64)?;
            stream.write(contents)?;
            stream.flush()
        }
    }

    /// Grows `scratch` to at least `len` bytes in 32-byte-aligned steps. The
    /// buffer is never shrunk back down; entry serialization reuses whatever
    /// capacity the largest entry written so far left behind.
    fn ensure_scratch(&mut self, len: usize) {
        let padded = (len + 31) / 32 * 32;
        if self.scratch.len() < padded {
            self.scratch.resize(padded, 0);
        }
    }

    /// Fills `scratch[..n]` with a header+name+payload entry and returns `n`.
    fn fill_inline_entry(&mut self, name: &[u8], extra_object_flags: u16, contents: &[u8]) -> usize {
        let unpadded = OBJECT_ENTRY_PROLOGUE_SIZE as usize + name.len() + contents.len();
        self.ensure_scratch(unpadded);
        let prologue = ObjectEntryPrologueHeader::new(
            unpadded as u16,
            (extra_object_flags & !object_flags::HAS_STREAM_DESCR) | object_flags::HAS_INLINE_PAYLOAD,
            name.len() as u16,
        );
        prologue.write_to(&mut self.scratch[0..6]);
        self.scratch[6..6 + name.len()].copy_from_slice(name);
        self.scratch[6 + name.len()..unpadded].copy_from_slice(contents);
        unpadded
    }

    /// Fills `scratch[..n]` with a header+name+zeroed-descriptor entry (the
    /// descriptor itself is filled in afterward by the stream anchored at
    /// it) and returns `n`.
    fn fill_stream_placeholder(&mut self, name: &[u8], flags: u16) -> usize {
        let unpadded = OBJECT_ENTRY_PROLOGUE_SIZE as usize + name.len() + StreamDescriptor::SIZE;
        self.ensure_scratch(unpadded);
        let prologue =
            ObjectEntryPrologueHeader::new(unpadded as u16, flags | object_flags::HAS_STREAM_DESCR, name.len() as u16);
        prologue.write_to(&mut self.scratch[0..6]);
        self.scratch[6..6 + name.len()].copy_from_slice(name);
        for b in &mut self.scratch[6 + name.len()..unpadded] {
            *b = 0;
        }
        unpadded
    }

    /// Writes `scratch[..len]` (an already-serialized entry) at `pos`,
    /// zero-padding to a 16-byte multiple, and — if the slot held a larger
    /// entry before — drops an invalidated filler entry into the leftover
    /// gap so it becomes a single reusable slot instead of being silently
    /// lost.
    fn overwrite_entry_at(&mut self, pos: u64, len: usize) -> Result<()> {
        let new_padded = align16(len as u16) as u64;
        let stream_len = self.stream.borrow().len();
        let old_padded = if pos < stream_len { self.read_prologue_at(pos)?.padded_length() as u64 } else { 0 };

        {
            let mut stream = self.stream.borrow_mut();
            stream.set_pos(pos);
            stream.write(&self.scratch[..len])?;
            let pad = new_padded - len as u64;
            if pad > 0 {
                stream.clear_bytes_at(pos + len as u64, pad)?;
            }
        }

        if old_padded > new_padded {
            let gap = (old_padded - new_padded) as u16;
            let filler = ObjectEntryPrologueHeader::invalidated(gap);
            let mut filler_bytes = [0u8; ObjectEntryPrologueHeader::SIZE];
            filler.write_to(&mut filler_bytes);
            let mut stream = self.stream.borrow_mut();
            stream.set_pos(pos + new_padded);
            stream.write(&filler_bytes)?;
        }

        Ok(())
    }

    fn invalidate_entry_at(&mut self, pos: u64, mut prologue: ObjectEntryPrologueHeader) -> Result<()> {
        prologue.mark_invalidated();
        let mut bytes = [0u8; ObjectEntryPrologueHeader::SIZE];
        prologue.write_to(&mut bytes);
        let mut stream = self.stream.borrow_mut();
        stream.set_pos(pos);
        stream.write(&bytes)?;
        Ok(())
    }
}
