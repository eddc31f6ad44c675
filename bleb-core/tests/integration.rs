//! End-to-end scenarios driven purely through the public `Repository` API
//! against an in-memory device, mirroring the literal scenarios the format
//! notes call out by number.

use bleb_core::{put_flags, stream_open_mode, MemoryDevice, Repository};

fn open_empty() -> Repository {
    Repository::open(bleb_core::shared(MemoryDevice::new())).unwrap()
}

#[test]
fn scenario_1_opening_an_empty_device_creates_a_repository() {
    let repo = open_empty();
    assert!(repo.device_size() > 0);
    assert!(repo.enumerate().unwrap().is_empty());
}

#[test]
fn scenario_2_undersized_nonempty_device_fails_closed() {
    let device = bleb_core::shared(MemoryDevice::from_vec(vec![1, 2, 3]));
    let err = Repository::open(device).unwrap_err();
    assert_eq!(err.kind(), bleb_core::ErrorKind::NotABlebRepository);
}

#[test]
fn scenario_3_inline_put_then_get() {
    let mut repo = open_empty();
    repo.put(b"message", b"Hello, World\0", put_flags::PREFER_INLINE_PAYLOAD).unwrap();
    let got = repo.get(b"message").unwrap().unwrap();
    assert_eq!(got, b"Hello, World\0");
    assert_eq!(got.len(), 13);
}

#[test]
fn scenario_4_replace_grows_to_stream_backed() {
    let mut repo = open_empty();
    repo.put(b"k", b"short", put_flags::PREFER_INLINE_PAYLOAD).unwrap();

    let long_value: Vec<u8> = b"a much longer string that no longer fits inline and needs a span chain of its own to hold all these bytes comfortably without truncation or loss"
        .iter()
        .cycle()
        .take(300)
        .copied()
        .collect();
    repo.put(b"k", &long_value, put_flags::PREFER_INLINE_PAYLOAD).unwrap();

    assert_eq!(repo.get(b"k").unwrap().unwrap(), long_value);
    assert_eq!(repo.enumerate().unwrap(), vec![b"k".to_vec()]);
}

#[test]
fn scenario_5_stream_write_of_ten_thousand_bytes_survives_reopen() {
    let device = bleb_core::shared(MemoryDevice::new());
    {
        let mut repo = Repository::open(device.clone()).unwrap();
        let mut s = repo
            .open_stream(b"blob", stream_open_mode::CREATE | stream_open_mode::TRUNCATE, 0)
            .unwrap()
            .unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        s.write(&data).unwrap();
        s.flush().unwrap();
        repo.close().unwrap();
    }

    let mut repo = Repository::open(device).unwrap();
    let got = repo.get(b"blob").unwrap().unwrap();
    let expected: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(got, expected);
}

#[test]
fn scenario_6_five_objects_persist_across_close_and_reopen() {
    let device = bleb_core::shared(MemoryDevice::new());
    let names: [&[u8]; 5] = [b"alpha", b"beta", b"gamma", b"delta", b"epsilon"];
    {
        let mut repo = Repository::open(device.clone()).unwrap();
        for (i, name) in names.iter().enumerate() {
            let value = vec![i as u8; 10 + i * 7];
            repo.put(name, &value, put_flags::PREFER_INLINE_PAYLOAD).unwrap();
        }
        repo.close().unwrap();
    }

    let mut repo = Repository::open(device).unwrap();
    let mut enumerated = repo.enumerate().unwrap();
    enumerated.sort();
    let mut expected_names: Vec<Vec<u8>> = names.iter().map(|n| n.to_vec()).collect();
    expected_names.sort();
    assert_eq!(enumerated, expected_names);

    for (i, name) in names.iter().enumerate() {
        let value = vec![i as u8; 10 + i * 7];
        assert_eq!(repo.get(name).unwrap().unwrap(), value);
    }
}

#[test]
fn property_idempotent_overwrite_with_same_size_does_not_grow_device() {
    let mut repo = open_empty();
    repo.put(b"n", b"fixed-width-value!!", put_flags::PREFER_INLINE_PAYLOAD).unwrap();
    let size_after_first = repo.device_size();
    repo.put(b"n", b"fixed-width-value!!", put_flags::PREFER_INLINE_PAYLOAD).unwrap();
    assert_eq!(repo.device_size(), size_after_first);
    assert_eq!(repo.get(b"n").unwrap().unwrap(), b"fixed-width-value!!");
}

#[test]
fn property_stream_and_inline_paths_agree_on_identical_bytes() {
    let mut repo = open_empty();
    let payload = vec![0x5au8; 4000];

    repo.put(b"via-put", &payload, 0).unwrap();

    {
        let mut s = repo.open_stream(b"via-stream", stream_open_mode::CREATE, payload.len() as u64).unwrap().unwrap();
        s.write(&payload).unwrap();
    }

    assert_eq!(repo.get(b"via-put").unwrap().unwrap(), repo.get(b"via-stream").unwrap().unwrap());
}

#[test]
fn missing_object_reports_none_rather_than_error() {
    let mut repo = open_empty();
    assert!(repo.get(b"ghost").unwrap().is_none());
}

#[test]
fn many_objects_with_invalidated_entries_still_enumerate_correctly() {
    let mut repo = open_empty();
    for i in 0..20 {
        let name = format!("item-{i}");
        repo.put(name.as_bytes(), format!("value-{i}").as_bytes(), put_flags::PREFER_INLINE_PAYLOAD).unwrap();
    }
    // Force a few invalidate-and-append cycles by growing past the inline slot.
    let big = vec![b'x'; 1000];
    repo.put(b"item-3", &big, put_flags::PREFER_INLINE_PAYLOAD).unwrap();
    repo.put(b"item-11", &big, put_flags::PREFER_INLINE_PAYLOAD).unwrap();

    let names = repo.enumerate().unwrap();
    assert_eq!(names.len(), 20);
    assert_eq!(repo.get(b"item-3").unwrap().unwrap(), big);
    assert_eq!(repo.get(b"item-0").unwrap().unwrap(), b"value-0");
}
