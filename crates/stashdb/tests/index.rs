use std::thread;

use stashdb::{
    encode, now, Directory, Error, Index, IndexQueries, Key, MetadataKey, Mode, NewEntry,
    Placement, RetryPolicy, Settings, Value,
};
use tempfile::TempDir;

fn patient() -> Settings {
    Settings::default().with_retry(RetryPolicy {
        max_attempts: 500,
        initial_backoff_ms: 1,
        max_backoff_ms: 20,
    })
}

fn insert(index: &Index, key: &Key, payload: &[u8]) -> stashdb::Result<i64> {
    index.write(|txn| {
        txn.insert(&NewEntry {
            key,
            now: now(),
            expire_time: None,
            tag: None,
            size: payload.len() as u64,
            mode: Mode::Raw,
            filename: None,
            value: Some(payload),
        })
    })
}

#[test]
fn test_handles_serialize_writes() {
    let dir = TempDir::new().unwrap();
    let directory = Directory::open(dir.path()).unwrap();
    Index::open(&directory, Some(patient())).unwrap();

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let directory = directory.clone();
            thread::spawn(move || {
                // Separate handle per thread, like separate processes.
                let (index, _) = Index::open(&directory, None).unwrap();
                for i in 0..25 {
                    insert(&index, &Key::Int(t * 100 + i), &[0u8; 10]).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    let (index, _) = Index::open(&directory, None).unwrap();
    let (count, size) = index
        .read(|conn| Ok((conn.metadata(MetadataKey::Count)?, conn.metadata(MetadataKey::Size)?)))
        .unwrap();
    assert_eq!((count, size), (100, 1000));
    assert_eq!(index.read(|conn| conn.recount()).unwrap(), (100, 1000));
}

#[test]
fn test_duplicate_key_is_rejected() {
    let dir = TempDir::new().unwrap();
    let directory = Directory::open(dir.path()).unwrap();
    let (index, _) = Index::open(&directory, None).unwrap();
    let key = Key::from("dup");

    insert(&index, &key, b"one").unwrap();
    let err = insert(&index, &key, b"two").unwrap_err();
    assert!(matches!(err, Error::Index(_)));

    let row = index.read(|conn| conn.entry(&key)).unwrap().unwrap();
    assert_eq!(row.value.as_deref(), Some(&b"one"[..]));
}

#[test]
fn test_replace_swaps_blob_atomically() {
    let dir = TempDir::new().unwrap();
    let directory = Directory::open(dir.path()).unwrap();
    let (index, _) = Index::open(&directory, None).unwrap();
    let key = Key::from("k");

    let first = encode(Value::Bytes(vec![1; 128]), 0);
    assert_eq!(first.placement, Placement::File);
    let first_name = directory.write_blob(&first).unwrap();
    index
        .write(|txn| {
            txn.insert(&NewEntry {
                key: &key,
                now: now(),
                expire_time: None,
                tag: Some("t"),
                size: first.size(),
                mode: first.mode,
                filename: Some(first_name.as_str()),
                value: None,
            })
        })
        .unwrap();

    let second = encode(Value::from("inline"), 1024);
    index
        .write(|txn| {
            let old = txn.entry(&key)?.unwrap();
            txn.replace(
                &old,
                &NewEntry {
                    key: &key,
                    now: now(),
                    expire_time: None,
                    tag: None,
                    size: second.size(),
                    mode: second.mode,
                    filename: None,
                    value: Some(second.payload.as_slice()),
                },
            )
        })
        .unwrap();

    assert_eq!(directory.read_blob(&first_name).unwrap(), None);
    let row = index.read(|conn| conn.entry(&key)).unwrap().unwrap();
    assert_eq!(row.mode, Mode::Text);
    assert_eq!(row.tag, None);
    assert_eq!(index.read(|conn| conn.metadata(MetadataKey::Size)).unwrap(), 6);
}
