//! Upload benchmarks

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::StreamExt;
use presign_uploadr::progress::ProgressTracker;
use presign_uploadr::upload::StreamingRequestBody;
use std::sync::Arc;

fn benchmark_streaming_body(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("streaming_body");
    let size = 8 * 1024 * 1024;
    let data = Bytes::from(vec![0u8; size]);
    group.throughput(Throughput::Bytes(size as u64));

    for window in [4 * 1024, 8 * 1024, 64 * 1024, 1024 * 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(window), &window, |b, &window| {
            b.to_async(&rt).iter(|| {
                let data = data.clone();
                async move {
                    let tracker = Arc::new(ProgressTracker::new(size as u64, false));
                    let mut body = StreamingRequestBody::new(data, window, tracker);
                    let mut total = 0;
                    while let Some(Ok(window)) = body.next().await {
                        total += window.len();
                    }
                    black_box(total)
                }
            });
        });
    }

    group.finish();
}

fn benchmark_progress_updates(c: &mut Criterion) {
    let mut group = c.benchmark_group("progress");
    group.bench_function("update_8k", |b| {
        let tracker = ProgressTracker::new(u64::MAX, false);
        b.iter(|| black_box(tracker.update(black_box(8192))));
    });
    group.finish();
}

criterion_group!(benches, benchmark_streaming_body, benchmark_progress_updates);
criterion_main!(benches);
