//! Image streams written, closed and read back through a fresh resolver

use aff4::image::{bevy_index_urn, bevy_urn};
use aff4::{Compression, ImageConfig, ImageStream, Mode, Resolver, Stream, Urn, ZipVolume};
use std::path::Path;
use tempfile::TempDir;

fn small_config(compression: Compression) -> ImageConfig {
    ImageConfig {
        chunk_size: 32,
        chunks_in_segment: 10,
        compression,
        threads: 2,
        queue_depth: 2,
    }
}

fn write_stream(path: &Path, data: &[u8], config: &ImageConfig, pieces: usize) -> Urn {
    let resolver = Resolver::new();
    let mut volume = ZipVolume::create(&resolver, path).unwrap();
    let urn = volume.urn().join("default");
    let mut image = ImageStream::create(&resolver, urn.clone(), volume.urn(), config).unwrap();
    for piece in data.chunks(pieces) {
        image.write_all(piece).unwrap();
    }
    image.close().unwrap();
    volume.close().unwrap();
    resolver.shutdown().unwrap();
    urn
}

fn read_stream(path: &Path, urn: &Urn) -> Vec<u8> {
    let resolver = Resolver::new();
    ZipVolume::open(&resolver, path, Mode::Read).unwrap();
    let mut image = resolver.checkout(urn, Mode::Read).unwrap();
    image.stream().unwrap().read_all().unwrap()
}

#[test]
fn test_round_trip_stored() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stored.zip");
    let data: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();

    let urn = write_stream(&path, &data, &small_config(Compression::Stored), 77);
    assert_eq!(read_stream(&path, &urn), data);
}

#[test]
fn test_round_trip_deflate() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("deflate.zip");
    let data: Vec<u8> = (0..5000u32).map(|i| (i * 31 % 7) as u8).collect();

    let urn = write_stream(&path, &data, &small_config(Compression::Deflate), 1000);
    assert_eq!(read_stream(&path, &urn), data);
}

#[test]
fn test_round_trip_random_bytes() {
    use rand::RngCore;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("random.zip");
    let mut data = vec![0u8; 10_000];
    rand::thread_rng().fill_bytes(&mut data);

    let urn = write_stream(&path, &data, &small_config(Compression::Deflate), 333);
    assert_eq!(read_stream(&path, &urn), data);
}

#[test]
fn test_hello_world_scenario() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hello.zip");
    let data = b"hello world!".repeat(1000);
    assert_eq!(data.len(), 12_000);

    let resolver = Resolver::new();
    let mut volume = ZipVolume::create(&resolver, &path).unwrap();
    let urn = volume.urn().join("default");
    let mut image = ImageStream::create(
        &resolver,
        urn.clone(),
        volume.urn(),
        &small_config(Compression::Deflate),
    )
    .unwrap();
    for _ in 0..1000 {
        image.write_all(b"hello world!").unwrap();
    }
    // 320-byte bevies
    assert_eq!(image.bevy_count(), 38);
    image.close().unwrap();
    volume.close().unwrap();

    // ceil(12000 / 320) bevies, nothing more
    for bevy in 0..38 {
        assert!(volume.has_member(&bevy_urn(&urn, bevy)).unwrap());
        assert!(volume.has_member(&bevy_index_urn(&urn, bevy)).unwrap());
    }
    assert!(!volume.has_member(&bevy_urn(&urn, 38)).unwrap());

    // Last bevy: 12000 - 37 * 320 = 160 bytes = 5 chunks
    let mut index = resolver
        .checkout(&bevy_index_urn(&urn, 37), Mode::Read)
        .unwrap();
    assert_eq!(index.stream().unwrap().size(), 5 * 4);
    drop(index);

    let fresh = Resolver::new();
    ZipVolume::open(&fresh, &path, Mode::Read).unwrap();
    let mut image = fresh.checkout(&urn, Mode::Read).unwrap();
    let stream = image.stream().unwrap();
    assert_eq!(stream.size(), 12_000);
    assert_eq!(stream.read_all().unwrap(), data);

    stream.seek(std::io::SeekFrom::Start(11_990)).unwrap();
    let mut tail = [0u8; 32];
    assert_eq!(stream.read_fill(&mut tail).unwrap(), 10);
    assert_eq!(&tail[..10], b"llo world!");
}

#[test]
fn test_images_share_a_volume() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.zip");
    let resolver = Resolver::new();
    let mut volume = ZipVolume::create(&resolver, &path).unwrap();

    let mut streams = Vec::new();
    for (i, compression) in [Compression::Stored, Compression::Lz4].into_iter().enumerate() {
        let urn = volume.urn().join(&format!("disk{}", i));
        let mut image =
            ImageStream::create(&resolver, urn.clone(), volume.urn(), &small_config(compression))
                .unwrap();
        let data = vec![i as u8 + 1; 700];
        image.write_all(&data).unwrap();
        image.close().unwrap();
        streams.push((urn, data));
    }
    volume.close().unwrap();

    for (urn, data) in streams {
        assert_eq!(read_stream(&path, &urn), data);
    }
}

#[test]
fn test_short_final_chunk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("short.zip");
    // 3 full bevies and 240 bytes: 7 chunks of 32 plus one of 16
    let data = b"hello world!".repeat(100);
    assert_eq!(data.len(), 3 * 320 + 240);

    let urn = write_stream(&path, &data, &small_config(Compression::Deflate), 12);

    let resolver = Resolver::new();
    let volume = ZipVolume::open(&resolver, &path, Mode::Read).unwrap();
    assert!(volume.has_member(&bevy_urn(&urn, 3)).unwrap());
    assert!(!volume.has_member(&bevy_urn(&urn, 4)).unwrap());
    let index = volume.read_member(&bevy_index_urn(&urn, 3)).unwrap();
    assert_eq!(index.len(), 8 * 4);

    let mut image = resolver.checkout(&urn, Mode::Read).unwrap();
    let stream = image.stream().unwrap();
    stream.seek(std::io::SeekFrom::Start(1190)).unwrap();
    let mut tail = [0u8; 32];
    assert_eq!(stream.read_fill(&mut tail).unwrap(), 10);
    assert_eq!(&tail[..10], &data[1190..]);
    stream.seek(std::io::SeekFrom::Start(0)).unwrap();
    assert_eq!(stream.read_all().unwrap(), data);
}
