//! Single-file binary object container: a prologue, a span-chained stream
//! allocator, and a packed directory of named objects layered on top.

mod allocator;
mod device;
mod directory;
mod error;
mod format;
mod repository;
mod stream;

pub use allocator::{SizingPolicy, DEFAULT_ALLOCATION_GRANULARITY};
pub use device::{shared, ByteStore, FileDevice, MemoryDevice, SharedStore};
pub use error::{BlebError, ErrorKind, Result};
pub use format::{object_flags, put_flags, stream_open_mode, CURRENT_FORMAT_VERSION};
pub use repository::Repository;
pub use stream::{DescriptorHome, Stream};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_to_end_inline_then_stream_objects() {
        let mut repo = Repository::open_in_memory().unwrap();
        repo.put(b"name", b"bleb", put_flags::PREFER_INLINE_PAYLOAD).unwrap();

        {
            let mut s = repo
                .open_stream(b"log", stream_open_mode::CREATE, 64)
                .unwrap()
                .expect("create mode always returns a stream");
            s.write(b"line one\n").unwrap();
            s.write(b"line two\n").unwrap();
        }

        assert_eq!(repo.get(b"name").unwrap().unwrap(), b"bleb");
        assert_eq!(repo.get(b"log").unwrap().unwrap(), b"line one\nline two\n");

        let mut names = repo.enumerate().unwrap();
        names.sort();
        assert_eq!(names, vec![b"log".to_vec(), b"name".to_vec()]);
    }

    #[test]
    fn missing_stream_without_create_flag_returns_none() {
        let mut repo = Repository::open_in_memory().unwrap();
        assert!(repo.open_stream(b"absent", 0, 0).unwrap().is_none());
    }
}
