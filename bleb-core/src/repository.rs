//! Top-level façade: owns the device, validates or writes the prologue, and
//! hands out a thin dispatcher over the content directory.

use crate::device::{shared, ByteStore, FileDevice, MemoryDevice, SharedStore};
use crate::directory::Directory;
use crate::error::{BlebError, Result};
use crate::format::{object_flags, Prologue, CONTENT_DIRECTORY_DESCRIPTOR_POS, PROLOGUE_SIZE};
use crate::stream::{DescriptorHome, Stream};

/// The content directory's own descriptor is given the same length hint a
/// freshly-created object stream gets; there is nothing special about 192,
/// it is simply big enough to hold a handful of small entries before the
/// first span has to grow.
const CONTENT_DIRECTORY_LENGTH_HINT: u64 = 192;

pub struct Repository {
    device: SharedStore,
    prologue: Prologue,
    directory: Directory,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").field("prologue", &self.prologue).finish_non_exhaustive()
    }
}

impl Repository {
    /// Opens `device` as a repository, creating one fresh if the device is
    /// empty, or validating and attaching to an existing prologue otherwise.
    pub fn open(device: SharedStore) -> Result<Self> {
        Self::open_with(device, true)
    }

    /// Same as [`Repository::open`], but when `allow_create` is `false` an
    /// empty device is rejected with `NotAllowed` instead of being
    /// initialized.
    pub fn open_with(device: SharedStore, allow_create: bool) -> Result<Self> {
        let size = device.borrow().size();
        if size == 0 {
            if !allow_create {
                return Err(BlebError::NotAllowed("device is empty and creation was not requested".into()));
            }
            Self::create(device)
        } else {
            Self::attach(device)
        }
    }

    /// Convenience wrapper for an in-memory repository, handy in tests and
    /// for short-lived scratch usage.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(shared(MemoryDevice::new()))
    }

    /// Convenience wrapper over [`FileDevice`] for a path on disk.
    pub fn open_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let exists = path.as_ref().exists();
        let file = if exists {
            FileDevice::open_existing(path).map_err(|e| BlebError::ReadFailed(e.to_string()))?
        } else {
            FileDevice::create_new(path).map_err(|e| BlebError::WriteFailed(e.to_string()))?
        };
        Self::open(shared(file))
    }

    fn create(device: SharedStore) -> Result<Self> {
        let prologue = Prologue::fresh();
        let mut bytes = [0u8; PROLOGUE_SIZE as usize];
        prologue.write(&mut bytes);
        if !device.borrow_mut().set_bytes_at(0, &bytes) {
            return Err(BlebError::WriteFailed("failed writing prologue".into()));
        }

        let mut directory_stream = Stream::create_new(
            device.clone(),
            DescriptorHome::Device(device.clone()),
            CONTENT_DIRECTORY_DESCRIPTOR_POS,
            CONTENT_DIRECTORY_LENGTH_HINT,
        )?;
        directory_stream.reserve(CONTENT_DIRECTORY_LENGTH_HINT)?;
        directory_stream.flush()?;

        log::debug!("created fresh repository");
        Ok(Repository { device: device.clone(), prologue, directory: Directory::new(device, directory_stream) })
    }

    fn attach(device: SharedStore) -> Result<Self> {
        if device.borrow().size() < PROLOGUE_SIZE {
            return Err(BlebError::NotABlebRepository);
        }
        let mut bytes = [0u8; PROLOGUE_SIZE as usize];
        if !device.borrow_mut().get_bytes_at(0, &mut bytes) {
            return Err(BlebError::ReadFailed("failed reading prologue".into()));
        }
        let prologue = Prologue::read(&bytes)?;

        let directory_stream = Stream::open_existing(
            device.clone(),
            DescriptorHome::Device(device.clone()),
            CONTENT_DIRECTORY_DESCRIPTOR_POS,
            false,
        )?;

        log::debug!("attached to existing repository, formatVersion={}", prologue.format_version);
        Ok(Repository { device: device.clone(), prologue, directory: Directory::new(device, directory_stream) })
    }

    pub fn format_version(&self) -> u8 {
        self.prologue.format_version
    }

    /// Flushes the content directory's own descriptor. Individual object
    /// streams flush themselves on drop or explicit `flush()`.
    pub fn close(&mut self) -> Result<()> {
        self.directory.flush()
    }

    pub fn contains(&self, name: &[u8]) -> Result<bool> {
        self.directory.contains(name)
    }

    pub fn get(&mut self, name: &[u8]) -> Result<Option<Vec<u8>>> {
        self.directory.get_object_contents(name)
    }

    pub fn put(&mut self, name: &[u8], contents: &[u8], flags: u32) -> Result<()> {
        self.directory.set_object_contents(name, contents, flags, 0)
    }

    pub fn put_text(&mut self, name: &[u8], contents: &[u8], flags: u32) -> Result<()> {
        self.directory.set_object_contents(name, contents, flags, object_flags::IS_TEXT)
    }

    pub fn open_stream(&mut self, name: &[u8], mode: u32, reserve_length: u64) -> Result<Option<Stream>> {
        self.directory.open_stream(name, mode, reserve_length)
    }

    pub fn enumerate(&self) -> Result<Vec<Vec<u8>>> {
        self.directory.enumerate()
    }

    pub fn device_size(&self) -> u64 {
        self.device.borrow().size()
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("best-effort directory flush on repository drop failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::put_flags;

    #[test]
    fn opening_empty_device_creates_fresh_repository() {
        let repo = Repository::open_in_memory().unwrap();
        assert_eq!(repo.format_version(), crate::format::CURRENT_FORMAT_VERSION);
        assert!(repo.device_size() >= PROLOGUE_SIZE);
    }

    #[test]
    fn put_then_get_round_trips_across_reopen() {
        let device = shared(MemoryDevice::new());
        {
            let mut repo = Repository::open(device.clone()).unwrap();
            repo.put(b"greeting", b"hello", put_flags::PREFER_INLINE_PAYLOAD).unwrap();
            repo.close().unwrap();
        }

        let mut repo = Repository::open(device).unwrap();
        assert_eq!(repo.get(b"greeting").unwrap().unwrap(), b"hello");
    }

    #[test]
    fn opening_too_small_nonempty_device_fails_closed() {
        let device = shared(MemoryDevice::new());
        device.borrow_mut().set_bytes_at(0, b"short");
        assert!(matches!(Repository::open(device), Err(BlebError::NotABlebRepository)));
    }

    #[test]
    fn opening_empty_device_without_create_fails_not_allowed() {
        let device = shared(MemoryDevice::new());
        assert!(matches!(Repository::open_with(device, false), Err(BlebError::NotAllowed(_))));
    }

    #[test]
    fn opening_device_with_no_room_for_content_directory_fails_write_failed() {
        let device = shared(MemoryDevice::with_capacity(32));
        assert!(matches!(Repository::open(device), Err(BlebError::WriteFailed(_))));
    }

    #[test]
    fn multiple_objects_persist_across_close_and_reopen() {
        let device = shared(MemoryDevice::new());
        {
            let mut repo = Repository::open(device.clone()).unwrap();
            repo.put(b"a", b"1", put_flags::PREFER_INLINE_PAYLOAD).unwrap();
            repo.put(b"b", b"2", put_flags::PREFER_INLINE_PAYLOAD).unwrap();
            let big = vec![7u8; 10_000];
            repo.put(b"c", &big, 0).unwrap();
            repo.close().unwrap();
        }

        let mut repo = Repository::open(device).unwrap();
        assert_eq!(repo.get(b"a").unwrap().unwrap(), b"1");
        assert_eq!(repo.get(b"b").unwrap().unwrap(), b"2");
        assert_eq!(repo.get(b"c").unwrap().unwrap().len(), 10_000);
        let mut names = repo.enumerate().unwrap();
        names.sort();
        assert_eq!(names, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
