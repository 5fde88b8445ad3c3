//! Resolver and cache properties

use aff4::{
    Aff4Object, Cache, EvictionPolicy, ImageConfig, ImageStream, Mode, Resolver, Stream, Urn,
    Value, ValueType, ZipVolume,
};
use proptest::prelude::*;
use tempfile::TempDir;

#[test]
fn test_set_value_is_idempotent() {
    let resolver = Resolver::new();
    let urn = Urn::new("aff4://subject");

    resolver.set_value(&urn, "aff4:size", 10u64).unwrap();
    assert_eq!(
        resolver.resolve_value(&urn, "aff4:size", ValueType::U64).unwrap(),
        Some(Value::U64(10))
    );

    resolver.set_value(&urn, "aff4:size", 20u64).unwrap();
    assert_eq!(resolver.resolve_all(&urn, "aff4:size").unwrap(), vec![Value::U64(20)]);
}

#[test]
fn test_add_value_iterates_newest_first() {
    let resolver = Resolver::new();
    let urn = Urn::new("aff4://subject");
    resolver.add_value(&urn, "aff4:target", "first", false).unwrap();
    resolver.add_value(&urn, "aff4:target", "second", false).unwrap();

    let mut iter = resolver.get_iter(&urn, "aff4:target").unwrap();
    assert_eq!(resolver.iter_next(&mut iter).unwrap(), Some(Value::from("second")));
    assert_eq!(resolver.iter_next(&mut iter).unwrap(), Some(Value::from("first")));
    assert_eq!(resolver.iter_next(&mut iter).unwrap(), None);
    assert_eq!(resolver.iter_next(&mut iter).unwrap(), None);
}

#[test]
fn test_shutdown_closes_streams_before_volumes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cached.zip");
    let data = vec![0xA5u8; 1000];

    let urn = {
        let resolver = Resolver::new();
        let volume = ZipVolume::create(&resolver, &path).unwrap();
        let volume_urn = volume.urn().clone();
        let urn = volume_urn.join("parked");
        let config = ImageConfig {
            chunk_size: 64,
            chunks_in_segment: 4,
            ..ImageConfig::default()
        };
        let mut image = ImageStream::create(&resolver, urn.clone(), &volume_urn, &config).unwrap();
        image.write_all(&data).unwrap();

        // Park both unfinished; shutdown must finish the image first
        resolver.cache_return(Aff4Object::Volume(volume));
        resolver.cache_return(Aff4Object::Image(image));
        assert!(resolver.is_cached(&volume_urn, Mode::Write));
        assert!(resolver.is_cached(&urn, Mode::Write));
        resolver.shutdown().unwrap();
        assert!(!resolver.is_cached(&urn, Mode::Write));
        urn
    };

    let fresh = Resolver::new();
    ZipVolume::open(&fresh, &path, Mode::Read).unwrap();
    let mut image = fresh.checkout(&urn, Mode::Read).unwrap();
    assert_eq!(image.stream().unwrap().read_all().unwrap(), data);
}

#[test]
fn test_write_checkout_waits_for_return() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("file.bin");
    std::fs::write(&path, b"").unwrap();
    let resolver = Resolver::new();
    let urn = Urn::from_path(&path).unwrap();
    let returned = Arc::new(AtomicBool::new(false));

    let first = resolver.checkout(&urn, Mode::Write).unwrap();
    let waiter = {
        let resolver = Arc::clone(&resolver);
        let urn = urn.clone();
        let returned = Arc::clone(&returned);
        thread::spawn(move || {
            let mut file = resolver.checkout(&urn, Mode::Write).unwrap();
            assert!(returned.load(Ordering::SeqCst));
            file.stream().unwrap().write_all(b"second").unwrap();
        })
    };

    thread::sleep(Duration::from_millis(50));
    returned.store(true, Ordering::SeqCst);
    drop(first);
    waiter.join().unwrap();
    resolver.shutdown().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"second");
}

proptest! {
    #[test]
    fn prop_fifo_evicts_oldest(capacity in 1usize..40, extra in 0usize..40) {
        let mut cache = Cache::new(capacity, EvictionPolicy::Fifo);
        let mut evicted = Vec::new();
        for i in 0..capacity + extra {
            if let Some((key, value)) = cache.put(format!("key-{}", i), i) {
                prop_assert_eq!(key, format!("key-{}", value).into_bytes());
                evicted.push(value);
            }
        }

        prop_assert_eq!(cache.len(), capacity);
        prop_assert_eq!(evicted, (0..extra).collect::<Vec<_>>());
        for i in 0..extra {
            let key = format!("key-{}", i);
            prop_assert!(!cache.present(key));
        }
        for i in extra..capacity + extra {
            let key = format!("key-{}", i);
            prop_assert!(cache.present(key));
        }
    }

    #[test]
    fn prop_last_set_wins(values in proptest::collection::vec(any::<u64>(), 1..20)) {
        let resolver = Resolver::new();
        let urn = Urn::new("aff4://prop");
        for &value in &values {
            resolver.set_value(&urn, "aff4:size", value).unwrap();
        }
        prop_assert_eq!(
            resolver.resolve_u64(&urn, "aff4:size").unwrap(),
            values.last().copied()
        );
        prop_assert_eq!(resolver.resolve_all(&urn, "aff4:size").unwrap().len(), 1);
    }

    #[test]
    fn prop_unique_add_has_no_duplicates(values in proptest::collection::vec(0u32..8, 1..30)) {
        let resolver = Resolver::new();
        let urn = Urn::new("aff4://prop");
        for &value in &values {
            resolver.add_value(&urn, "aff4:target", value, true).unwrap();
        }
        let mut stored: Vec<u64> = resolver
            .resolve_all(&urn, "aff4:target")
            .unwrap()
            .iter()
            .filter_map(Value::as_u64)
            .collect();
        let count = stored.len();
        stored.sort();
        stored.dedup();
        prop_assert_eq!(stored.len(), count);
    }
}
