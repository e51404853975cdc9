use artifact_transfer::compression::{CompressionContextPool, Compressor};
use artifact_transfer::transport::MemoryConnector;
use artifact_transfer::{ArtifactClient, ClientConfig, Endpoint};
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

fn sample_data(len: usize) -> Vec<u8> {
    // Mildly compressible: repeating runs with a drifting byte.
    (0..len).map(|i| ((i / 64) % 251) as u8 ^ (i as u8 & 0x0f)).collect()
}

fn bench_compress_chunk(c: &mut Criterion) {
    let mut group = c.benchmark_group("compress_chunk");
    let pool: CompressionContextPool<Compressor> = CompressionContextPool::new(3, 1);

    for size in [64 * 1024, 1024 * 1024, 4 * 1024 * 1024].iter() {
        let data = sample_data(*size);
        let mut out = Vec::new();
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut ctx = pool.checkout().unwrap();
                ctx.compress_chunk(black_box(&data), &mut out).unwrap()
            });
        });
    }
    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("upload_download");
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    for size in [256 * 1024, 8 * 1024 * 1024].iter() {
        let connector = MemoryConnector::new();
        let client = ArtifactClient::new(
            Endpoint::https("bench"),
            Arc::new(connector.clone()),
            ClientConfig::default(),
        )
        .unwrap();
        let data = Bytes::from(sample_data(*size));
        let dir = tempfile::TempDir::new().unwrap();
        let dest = dir.path().join("out.bin");

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                runtime.block_on(async {
                    client.upload_bytes("/bench", data.clone()).await.unwrap();
                    client
                        .download_file("/bench", &dest, Default::default())
                        .await
                        .unwrap()
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compress_chunk, bench_round_trip);
criterion_main!(benches);
