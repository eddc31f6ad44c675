//! Repository Stream: a seekable byte view over a singly linked span chain,
//! anchored by a `StreamDescriptor` that lives somewhere the caller chooses
//! — directly on the device (the content directory's own descriptor) or
//! inside another stream's bytes (an object entry's out-of-line payload).
//! That "somewhere" is modeled as the [`DescriptorHome`] tagged variant
//! rather than a second generic parameter or a trait object, since a stream
//! can recursively serve as another stream's descriptor home and `Rc`/
//! `RefCell` do not unsize across that extra layer on stable Rust.

use std::cell::RefCell;
use std::rc::Rc;

use crate::allocator::{allocate_span, SizingPolicy};
use crate::device::{ByteStore, SharedStore};
use crate::error::{BlebError, Result};
use crate::format::{SpanHeader, StreamDescriptor, SPAN_HEADER_SIZE};

struct CurrentSpan {
    location: u64,
    header: SpanHeader,
    pos_in_stream: u64,
    pos_in_span: u32,
}

/// Where a stream's 16-byte anchor lives: directly on the raw device (the
/// content directory's own descriptor, at a fixed offset) or inside another
/// stream's bytes (an object entry's out-of-line payload, embedded at an
/// offset within the directory stream).
#[derive(Clone)]
pub enum DescriptorHome {
    Device(SharedStore),
    Stream(Rc<RefCell<Stream>>),
}

impl DescriptorHome {
    fn get_bytes_at(&self, pos: u64, buf: &mut [u8]) -> bool {
        match self {
            DescriptorHome::Device(d) => d.borrow_mut().get_bytes_at(pos, buf),
            DescriptorHome::Stream(s) => s.borrow_mut().get_bytes_at(pos, buf),
        }
    }

    fn set_bytes_at(&self, pos: u64, buf: &[u8]) -> bool {
        match self {
            DescriptorHome::Device(d) => d.borrow_mut().set_bytes_at(pos, buf),
            DescriptorHome::Stream(s) => s.borrow_mut().set_bytes_at(pos, buf),
        }
    }
}

/// A stream that exists but has not yet been told where its chain starts;
/// `StreamDescriptor.location == 0` is the on-disk form of this state.
pub struct Stream {
    device: SharedStore,
    descr_home: DescriptorHome,
    descr_pos: u64,
    descriptor: StreamDescriptor,
    descr_dirty: bool,
    read_only: bool,
    pos: u64,
    initial_length_hint: u64,
    policy: SizingPolicy,
    first_span: Option<SpanHeader>,
    current: Option<CurrentSpan>,
}

impl Stream {
    /// Attaches to a stream descriptor that already exists at `descr_pos`
    /// within `descr_home` (which may or may not itself already be
    /// allocated — an entry can carry `kHasStreamDescr` with
    /// `location == 0` if nothing was ever written to it).
    pub fn open_existing(
        device: SharedStore,
        descr_home: DescriptorHome,
        descr_pos: u64,
        read_only: bool,
    ) -> Result<Self> {
        let descriptor = read_descriptor(&descr_home, descr_pos)?;
        let first_span = if descriptor.is_allocated() {
            Some(read_span_header(&device, descriptor.location)?)
        } else {
            None
        };

        Ok(Stream {
            device,
            descr_home,
            descr_pos,
            descriptor,
            descr_dirty: false,
            read_only,
            pos: 0,
            initial_length_hint: 0,
            policy: SizingPolicy::default(),
            first_span,
            current: None,
        })
    }

    /// Establishes a brand-new, empty stream descriptor at `descr_pos`.
    /// `initial_length_hint` feeds the allocator's rounding policy the
    /// first time a span is lazily allocated.
    pub fn create_new(
        device: SharedStore,
        descr_home: DescriptorHome,
        descr_pos: u64,
        initial_length_hint: u64,
    ) -> Result<Self> {
        let descriptor = StreamDescriptor::default();
        let mut zeroed = [0u8; StreamDescriptor::SIZE];
        descriptor.write_to(&mut zeroed);
        if !descr_home.set_bytes_at(descr_pos, &zeroed) {
            return Err(BlebError::WriteFailed(format!(
                "failed writing empty stream descriptor at {descr_pos}"
            )));
        }

        Ok(Stream {
            device,
            descr_home,
            descr_pos,
            descriptor,
            descr_dirty: false,
            read_only: false,
            pos: 0,
            initial_length_hint,
            policy: SizingPolicy::default(),
            first_span: None,
            current: None,
        })
    }

    pub fn len(&self) -> u64 {
        self.descriptor.length
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor.length == 0
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn descriptor(&self) -> StreamDescriptor {
        self.descriptor
    }

    pub fn set_pos(&mut self, pos: u64) {
        if let Some(cur) = &self.current {
            let span_end = cur.pos_in_stream + cur.header.reserved_length as u64;
            if pos < cur.pos_in_stream || pos >= span_end {
                self.current = None;
            }
        }
        self.pos = pos;
    }

    /// Shrinks or grows the logical length without touching span bytes;
    /// per the format notes, truncation never reclaims spans (I3 then only
    /// holds as `sum(usedLength) >= descriptor.length`).
    pub fn set_length(&mut self, new_length: u64) {
        self.descriptor.length = new_length;
        self.descr_dirty = true;
    }

    /// Eagerly allocates a first span sized by `length_hint` without
    /// advancing the logical length, so a freshly created stream already
    /// owns device space before anything is written to it.
    pub fn reserve(&mut self, length_hint: u64) -> Result<()> {
        if self.descriptor.is_allocated() {
            return Ok(());
        }
        self.allocate_first_span(length_hint)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            if self.pos >= self.descriptor.length {
                break;
            }
            if self.current.is_none() {
                self.goto_right_span()?;
            }
            let cur = self.current.as_ref().unwrap();
            if cur.header.next_span_location != 0 && cur.header.used_length < cur.header.reserved_length {
                return Err(BlebError::corruption("span not fully utilized but chain continues"));
            }

            let available = (cur.header.used_length - cur.pos_in_span) as usize;
            if available == 0 {
                self.advance_to_next_span()?;
                continue;
            }
            let want = (buf.len() - done).min(available);
            let at = cur.location + SPAN_HEADER_SIZE + cur.pos_in_span as u64;
            if !self.device.borrow_mut().get_bytes_at(at, &mut buf[done..done + want]) {
                return Err(BlebError::ReadFailed(format!("failed reading {want} bytes at {at}")));
            }

            done += want;
            self.pos += want as u64;
            let cur = self.current.as_mut().unwrap();
            cur.pos_in_span += want as u32;
        }
        Ok(done)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.read_only {
            return Err(BlebError::NotAllowed("stream is read-only".into()));
        }

        let mut done = 0;
        while done < buf.len() {
            if self.current.is_none() {
                if !self.descriptor.is_allocated() {
                    self.allocate_first_span((buf.len() - done) as u64)?;
                } else {
                    self.goto_right_span()?;
                }
            }

            let cur_location = self.current.as_ref().unwrap().location;
            let cur_reserved = self.current.as_ref().unwrap().header.reserved_length;
            let cur_pos_in_span = self.current.as_ref().unwrap().pos_in_span;

            let room = (cur_reserved - cur_pos_in_span) as usize;
            if room == 0 {
                self.extend_chain((buf.len() - done) as u64)?;
                continue;
            }

            let want = (buf.len() - done).min(room);
            let at = cur_location + SPAN_HEADER_SIZE + cur_pos_in_span as u64;
            if !self.device.borrow_mut().set_bytes_at(at, &buf[done..done + want]) {
                return Err(BlebError::WriteFailed(format!("failed writing {want} bytes at {at}")));
            }

            done += want;
            self.pos += want as u64;
            self.descriptor.length = self.descriptor.length.max(self.pos);
            self.descr_dirty = true;

            let cur = self.current.as_mut().unwrap();
            cur.pos_in_span += want as u32;
            cur.header.used_length = cur.header.used_length.max(cur.pos_in_span);
            let header = cur.header;
            let location = cur.location;
            let pos_in_stream = cur.pos_in_stream;
            persist_span_header(&self.device, location, &header)?;
            if pos_in_stream == 0 {
                self.first_span = Some(header);
            }
        }
        Ok(done)
    }

    pub fn clear_bytes_at(&mut self, pos: u64, count: u64) -> Result<()> {
        const CHUNK: usize = 4096;
        let zeros = [0u8; CHUNK];
        self.set_pos(pos);
        let mut remaining = count;
        while remaining > 0 {
            let n = remaining.min(CHUNK as u64) as usize;
            let written = self.write(&zeros[..n])?;
            if written != n {
                return Err(BlebError::WriteFailed("short write while clearing stream bytes".into()));
            }
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Flushes the descriptor if dirty. Explicit counterpart to the
    /// best-effort flush attempted from `Drop`; call this when you need to
    /// observe a flush failure rather than have it swallowed. Safe to call
    /// and then keep writing — a later write simply marks the descriptor
    /// dirty again.
    pub fn flush(&mut self) -> Result<()> {
        if self.descr_dirty {
            let mut bytes = [0u8; StreamDescriptor::SIZE];
            self.descriptor.write_to(&mut bytes);
            if !self.descr_home.set_bytes_at(self.descr_pos, &bytes) {
                return Err(BlebError::WriteFailed(format!(
                    "failed flushing stream descriptor at {}",
                    self.descr_pos
                )));
            }
            self.descr_dirty = false;
        }
        Ok(())
    }

    fn allocate_first_span(&mut self, span_length: u64) -> Result<()> {
        let hint = self.initial_length_hint.max(span_length);
        let (location, header) = allocate_span(&self.device, self.policy, hint, span_length)?;
        self.descriptor.location = location;
        self.descr_dirty = true;
        self.first_span = Some(header);
        self.current = Some(CurrentSpan { location, header, pos_in_stream: 0, pos_in_span: 0 });
        Ok(())
    }

    fn extend_chain(&mut self, remaining: u64) -> Result<()> {
        let cur = self.current.as_ref().unwrap();
        let next = cur.header.next_span_location;
        if next != 0 {
            let header = read_span_header(&self.device, next)?;
            self.current = Some(CurrentSpan {
                location: next,
                header,
                pos_in_stream: cur.pos_in_stream + cur.header.reserved_length as u64,
                pos_in_span: 0,
            });
            return Ok(());
        }

        let (new_location, new_header) =
            allocate_span(&self.device, self.policy, self.descriptor.length, remaining)?;

        let mut updated = cur.header;
        updated.next_span_location = new_location;
        let location = cur.location;
        let pos_in_stream = cur.pos_in_stream;
        persist_span_header(&self.device, location, &updated)?;
        if pos_in_stream == 0 {
            self.first_span = Some(updated);
        }

        self.current = Some(CurrentSpan {
            location: new_location,
            header: new_header,
            pos_in_stream: pos_in_stream + updated.reserved_length as u64,
            pos_in_span: 0,
        });
        Ok(())
    }

    fn advance_to_next_span(&mut self) -> Result<()> {
        let cur = self.current.as_ref().unwrap();
        let next = cur.header.next_span_location;
        if next == 0 {
            return Err(BlebError::unexpected_eof("span chain ended before requested position"));
        }
        let header = read_span_header(&self.device, next)?;
        self.current = Some(CurrentSpan {
            location: next,
            header,
            pos_in_stream: cur.pos_in_stream + cur.header.reserved_length as u64,
            pos_in_span: 0,
        });
        Ok(())
    }

    /// Seeks the span chain so that `self.pos` falls inside `self.current`.
    fn goto_right_span(&mut self) -> Result<()> {
        if !self.descriptor.is_allocated() {
            return Err(BlebError::Internal("gotoRightSpan called on an unallocated stream".into()));
        }

        let mut location = self.descriptor.location;
        let mut header = match self.first_span {
            Some(h) => h,
            None => read_span_header(&self.device, location)?,
        };
        let mut pos_in_stream = 0u64;

        loop {
            if pos_in_stream > self.descriptor.length {
                return Err(BlebError::corruption("span position exceeds stream length while seeking"));
            }
            let span_end = pos_in_stream + header.reserved_length as u64;
            if self.pos <= span_end {
                break;
            }
            if header.next_span_location == 0 {
                return Err(BlebError::unexpected_eof("span chain ended before seek target"));
            }
            location = header.next_span_location;
            header = read_span_header(&self.device, location)?;
            pos_in_stream = span_end;
        }

        let pos_in_span = (self.pos - pos_in_stream) as u32;
        self.current = Some(CurrentSpan { location, header, pos_in_stream, pos_in_span });
        Ok(())
    }
}

impl ByteStore for Stream {
    fn size(&self) -> u64 {
        self.descriptor.length
    }

    fn get_bytes_at(&mut self, pos: u64, buf: &mut [u8]) -> bool {
        self.set_pos(pos);
        matches!(self.read(buf), Ok(n) if n == buf.len())
    }

    fn set_bytes_at(&mut self, pos: u64, buf: &[u8]) -> bool {
        self.set_pos(pos);
        matches!(self.write(buf), Ok(n) if n == buf.len())
    }

    fn clear_bytes_at(&mut self, pos: u64, count: u64) -> bool {
        self.clear_bytes_at(pos, count).is_ok()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.descr_dirty {
            if let Err(e) = self.flush() {
                log::error!("best-effort descriptor flush on stream drop failed: {e}");
            }
        }
    }
}

fn read_descriptor(home: &DescriptorHome, pos: u64) -> Result<StreamDescriptor> {
    let mut bytes = [0u8; StreamDescriptor::SIZE];
    if !home.get_bytes_at(pos, &mut bytes) {
        return Err(BlebError::ReadFailed(format!("failed reading stream descriptor at {pos}")));
    }
    StreamDescriptor::read(&bytes)
}

fn read_span_header(device: &SharedStore, location: u64) -> Result<SpanHeader> {
    let mut bytes = [0u8; SpanHeader::SIZE];
    if !device.borrow_mut().get_bytes_at(location, &mut bytes) {
        return Err(BlebError::ReadFailed(format!("failed reading span header at {location}")));
    }
    SpanHeader::read(&bytes)
}

fn persist_span_header(device: &SharedStore, location: u64, header: &SpanHeader) -> Result<()> {
    let mut bytes = [0u8; SpanHeader::SIZE];
    header.write_to(&mut bytes);
    if !device.borrow_mut().set_bytes_at(location, &bytes) {
        return Err(BlebError::WriteFailed(format!("failed persisting span header at {location}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{shared, MemoryDevice};

    fn fresh_stream() -> (SharedStore, Stream) {
        let device = shared(MemoryDevice::new());
        let descr_home = DescriptorHome::Device(device.clone());
        let stream = Stream::create_new(device.clone(), descr_home, 0, 64).unwrap();
        (device, stream)
    }

    #[test]
    fn write_then_read_small_payload() {
        let (_device, mut s) = fresh_stream();
        s.write(b"hello world").unwrap();
        assert_eq!(s.len(), 11);

        s.set_pos(0);
        let mut buf = [0u8; 11];
        assert_eq!(s.read(&mut buf).unwrap(), 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn write_spanning_many_spans_round_trips() {
        let (_device, mut s) = fresh_stream();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        s.write(&data).unwrap();
        assert_eq!(s.len(), data.len() as u64);

        s.set_pos(0);
        let mut read_back = vec![0u8; data.len()];
        let n = s.read(&mut read_back).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(read_back, data);
    }

    #[test]
    fn set_length_truncates_without_touching_spans() {
        let (_device, mut s) = fresh_stream();
        s.write(b"0123456789").unwrap();
        s.set_length(4);
        assert_eq!(s.len(), 4);
        s.set_pos(0);
        let mut buf = [0u8; 4];
        assert_eq!(s.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");
    }

    #[test]
    fn descriptor_flushes_on_drop() {
        let device = shared(MemoryDevice::new());
        let descr_home = DescriptorHome::Device(device.clone());
        let descr_pos;
        {
            let mut s = Stream::create_new(device.clone(), descr_home.clone(), 0, 16).unwrap();
            s.write(b"abc").unwrap();
            descr_pos = 0;
        }
        let descriptor = read_descriptor(&descr_home, descr_pos).unwrap();
        assert_eq!(descriptor.length, 3);
        assert!(descriptor.is_allocated());
    }

    #[test]
    fn reopen_existing_stream_preserves_contents() {
        let device = shared(MemoryDevice::new());
        {
            let mut s =
                Stream::create_new(device.clone(), DescriptorHome::Device(device.clone()), 0, 16).unwrap();
            s.write(b"persisted").unwrap();
        }
        let mut reopened =
            Stream::open_existing(device.clone(), DescriptorHome::Device(device.clone()), 0, false).unwrap();
        assert_eq!(reopened.len(), 9);
        let mut buf = [0u8; 9];
        reopened.read(&mut buf).unwrap();
        assert_eq!(&buf, b"persisted");
    }
}
