//! Map streams over images in the same volume

use aff4::{
    Compression, ImageConfig, ImageStream, MapStream, MapTarget, Mode, Resolver, Stream, Urn,
    ZipVolume,
};
use proptest::prelude::*;
use std::io::SeekFrom;
use tempfile::TempDir;

const STRIPE: usize = 4;

fn image_config() -> ImageConfig {
    ImageConfig {
        chunk_size: 16,
        chunks_in_segment: 4,
        compression: Compression::Deflate,
        threads: 2,
        queue_depth: 2,
    }
}

#[test]
fn test_raid0_reassembly() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("raid.zip");
    let logical: Vec<u8> = (0..203u32).map(|i| (i * 7 % 251) as u8).collect();

    // Split into two members the way a two-disk stripe set would
    let mut disks = [Vec::new(), Vec::new()];
    for (n, stripe) in logical.chunks(STRIPE).enumerate() {
        disks[n % 2].extend_from_slice(stripe);
    }

    let map_urn = {
        let resolver = Resolver::new();
        let mut volume = ZipVolume::create(&resolver, &path).unwrap();
        let mut members = Vec::new();
        for (i, disk) in disks.iter().enumerate() {
            let urn = volume.urn().join(&format!("disk{}", i));
            let mut image =
                ImageStream::create(&resolver, urn.clone(), volume.urn(), &image_config()).unwrap();
            image.write_all(disk).unwrap();
            image.close().unwrap();
            members.push(urn);
        }

        let map_urn = volume.urn().join("array");
        let mut map = MapStream::create(&resolver, map_urn.clone(), volume.urn()).unwrap();
        map.add_point(0, 0, &members[0]).unwrap();
        map.add_point(STRIPE as u64, 0, &members[1]).unwrap();
        map.set_period(2 * STRIPE as u64, Some(STRIPE as u64)).unwrap();
        map.set_size(logical.len() as u64).unwrap();
        assert_eq!(map.targets(), members);
        map.close().unwrap();
        volume.close().unwrap();
        map_urn
    };

    let fresh = Resolver::new();
    ZipVolume::open(&fresh, &path, Mode::Read).unwrap();
    let mut object = fresh.checkout(&map_urn, Mode::Read).unwrap();
    let map = object.as_map().unwrap();
    assert_eq!(map.target_period(), Some(STRIPE as u64));
    assert_eq!(map.read_all().unwrap(), logical);

    // Unaligned read spanning both disks and a window boundary
    map.seek(SeekFrom::Start(6)).unwrap();
    let mut buf = [0u8; 9];
    assert_eq!(map.read_fill(&mut buf).unwrap(), 9);
    assert_eq!(&buf, &logical[6..15]);
}

#[test]
fn test_sparse_map_reads_zeros_for_gaps() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sparse.zip");
    let resolver = Resolver::new();
    let mut volume = ZipVolume::create(&resolver, &path).unwrap();

    let image_urn = volume.urn().join("partial");
    let mut image =
        ImageStream::create(&resolver, image_urn.clone(), volume.urn(), &image_config()).unwrap();
    image.write_all(&[0xEEu8; 40]).unwrap();
    image.close().unwrap();

    let map_urn = volume.urn().join("recovered");
    let mut map = MapStream::create(&resolver, map_urn.clone(), volume.urn()).unwrap();
    map.add_point(10, 0, &image_urn).unwrap();
    map.add_point(30, 0, &Urn::new(aff4::vocab::AFF4_ZERO_TARGET)).unwrap();
    map.add_point(35, 20, &image_urn).unwrap();
    map.set_size(45).unwrap();
    assert_eq!(
        map.get_range(0).map(|r| (r.target, r.length)),
        Some((MapTarget::Null, 10))
    );
    map.close().unwrap();
    volume.close().unwrap();

    let mut object = resolver.checkout(&map_urn, Mode::Read).unwrap();
    let data = object.stream().unwrap().read_all().unwrap();
    let mut expected = vec![0u8; 10];
    expected.extend_from_slice(&[0xEE; 20]);
    expected.extend_from_slice(&[0; 5]);
    expected.extend_from_slice(&[0xEE; 10]);
    assert_eq!(data, expected);
}

#[test]
fn test_short_target_ends_read() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("short.zip");
    let resolver = Resolver::new();
    let mut volume = ZipVolume::create(&resolver, &path).unwrap();
    let target = volume.urn().join("tiny");
    volume
        .write_member(&target, b"abc", aff4::ZipCompression::Stored)
        .unwrap();

    let map_urn = volume.urn().join("overlong");
    let mut map = MapStream::create(&resolver, map_urn.clone(), volume.urn()).unwrap();
    map.add_point(0, 0, &target).unwrap();
    map.set_size(10).unwrap();
    map.close().unwrap();
    volume.close().unwrap();

    let mut object = resolver.checkout(&map_urn, Mode::Read).unwrap();
    let stream = object.stream().unwrap();
    let mut buf = [0u8; 10];
    assert_eq!(stream.read(&mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], b"abc");
}

proptest! {
    #[test]
    fn prop_ranges_tile_the_map(
        points in proptest::collection::btree_map(0u64..200, 0u64..1000, 0..12),
        period in proptest::option::of(1u64..64),
        size in 0u64..400,
    ) {
        let resolver = Resolver::new();
        let mut map =
            MapStream::create(&resolver, Urn::new("aff4://prop-map"), &Urn::new("aff4://v")).unwrap();
        let target = Urn::new("aff4://target");
        for (&logical, &offset) in &points {
            map.add_point(logical, offset, &target).unwrap();
        }
        if let Some(period) = period {
            map.set_period(period, None).unwrap();
        }
        map.set_size(size).unwrap();

        let mut ptr = 0;
        while let Some(range) = map.get_range(ptr) {
            prop_assert!(range.length > 0);
            if let Some(period) = period {
                // Never crosses a window boundary
                prop_assert!(ptr % period + range.length <= period);
            }
            ptr += range.length;
        }
        prop_assert_eq!(ptr, size);
    }
}
