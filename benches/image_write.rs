//! Benchmarks for image stream writes and reads

use aff4::{Compression, ImageConfig, ImageStream, Mode, Resolver, Stream, Urn, ZipVolume};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::path::Path;
use tempfile::TempDir;

const IMAGE_SIZE: usize = 4 * 1024 * 1024;

fn test_data() -> Vec<u8> {
    // Half compressible, half noise
    (0..IMAGE_SIZE)
        .map(|i| {
            if (i / 4096) % 2 == 0 {
                (i % 64) as u8
            } else {
                (i as u64).wrapping_mul(2654435761) as u8
            }
        })
        .collect()
}

fn config(compression: Compression, threads: usize) -> ImageConfig {
    ImageConfig {
        chunk_size: 32 * 1024,
        chunks_in_segment: 32,
        compression,
        threads,
        queue_depth: threads * 2,
    }
}

fn write_image(path: &Path, data: &[u8], config: &ImageConfig) -> Urn {
    let resolver = Resolver::new();
    let mut volume = ZipVolume::create(&resolver, path).unwrap();
    let urn = volume.urn().join("bench");
    let mut image = ImageStream::create(&resolver, urn.clone(), volume.urn(), config).unwrap();
    for piece in data.chunks(64 * 1024) {
        image.write_all(piece).unwrap();
    }
    image.close().unwrap();
    volume.close().unwrap();
    urn
}

fn benchmark_write_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("image_write");
    group.sample_size(10);
    group.throughput(Throughput::Bytes(IMAGE_SIZE as u64));
    let data = test_data();

    for compression in [
        Compression::Stored,
        Compression::Deflate,
        Compression::Lz4,
        Compression::Zstd,
    ] {
        group.bench_with_input(
            BenchmarkId::from_parameter(compression.name()),
            &compression,
            |b, &compression| {
                let dir = TempDir::new().unwrap();
                let path = dir.path().join("bench.zip");
                b.iter(|| write_image(&path, black_box(&data), &config(compression, 4)));
            },
        );
    }

    group.finish();
}

fn benchmark_write_threads(c: &mut Criterion) {
    let mut group = c.benchmark_group("image_write_threads");
    group.sample_size(10);
    group.throughput(Throughput::Bytes(IMAGE_SIZE as u64));
    let data = test_data();

    for threads in [1, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("bench.zip");
            b.iter(|| write_image(&path, black_box(&data), &config(Compression::Deflate, threads)));
        });
    }

    group.finish();
}

fn benchmark_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("image_read");
    group.sample_size(10);
    group.throughput(Throughput::Bytes(IMAGE_SIZE as u64));
    let data = test_data();

    for compression in [Compression::Stored, Compression::Deflate] {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bench.zip");
        let urn = write_image(&path, &data, &config(compression, 4));

        group.bench_with_input(
            BenchmarkId::from_parameter(compression.name()),
            &compression,
            |b, _| {
                b.iter(|| {
                    let resolver = Resolver::new();
                    ZipVolume::open(&resolver, &path, Mode::Read).unwrap();
                    let mut image = resolver.checkout(&urn, Mode::Read).unwrap();
                    black_box(image.stream().unwrap().read_all().unwrap())
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_write_compression,
    benchmark_write_threads,
    benchmark_read
);
criterion_main!(benches);
