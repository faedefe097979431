use criterion::{black_box, criterion_group, criterion_main, Criterion};
use compressfs::block::Block;
use compressfs::config::EngineConfig;
use compressfs::engine::CompressedFile;
use compressfs::layer_map::LayerMap;
use compressfs::sniff::NoSniffer;
use compressfs::CompressionMethod;
use std::fs::File;
use std::sync::Arc;
use tempfile::TempDir;

fn bench_compression(c: &mut Criterion) {
    let data: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 251) as u8).collect();

    for method in [CompressionMethod::Zstd, CompressionMethod::Lz4, CompressionMethod::Brotli] {
        let packed = method.compress(&data, 3).unwrap();
        c.bench_function(&format!("{method}_compress_1mb"), |b| {
            b.iter(|| method.compress(black_box(&data), 3))
        });
        c.bench_function(&format!("{method}_prefix_4k_of_1mb"), |b| {
            b.iter(|| method.decompress_prefix(black_box(&packed), data.len(), 4096))
        });
    }
}

fn bench_layer_map_get(c: &mut Criterion) {
    let mut map = LayerMap::new();
    for i in 0..10_000u64 {
        // Overlapping 4 KiB writes with a 1 KiB stride.
        map.put(Block::new(i * 1024, 4096, 32 + i * 100, 100, CompressionMethod::Zstd), false);
    }

    c.bench_function("layer_map_get_10k_blocks", |b| {
        let mut offset = 0u64;
        b.iter(|| {
            offset = (offset + 7919) % (10_000 * 1024);
            black_box(map.get(offset))
        })
    });
}

fn bench_engine_writes(c: &mut Criterion) {
    let data = vec![42u8; 64 * 1024];

    c.bench_function("engine_overwrite_64k_with_defrag", |b| {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bench.bin");
        File::create(&path).unwrap();
        let mut file =
            CompressedFile::new(&path, Arc::new(EngineConfig::default()), Arc::new(NoSniffer)).unwrap();
        file.open().unwrap();
        b.iter(|| file.write(black_box(&data), 4096).unwrap());
        file.release().unwrap();
    });
}

criterion_group!(benches, bench_compression, bench_layer_map_get, bench_engine_writes);
criterion_main!(benches);
