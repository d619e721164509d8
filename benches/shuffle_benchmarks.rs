//! Benchmarks for hybrid-shuffle write and read paths
//!
//! Run with: cargo bench

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use hybrid_shuffle::strategy::{SpillingInfo, SpillingStrategy, SubpartitionSpillingInfo};
use hybrid_shuffle::{
    BlockingListener, GlobalBufferPool, HybridShuffleConfig, IoExecutor, NoOpListener,
    ReadBufferPool, ResultPartition, ResultPartitionBuilder, SpillingStrategyType,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const BUFFER_SIZE: usize = 32 * 1024;

fn create_partition(
    dir: &TempDir,
    num_subpartitions: usize,
    pool_size: usize,
    executor: &Arc<IoExecutor>,
) -> Arc<ResultPartition> {
    let global = GlobalBufferPool::new(pool_size, BUFFER_SIZE).unwrap();
    ResultPartitionBuilder::new()
        .with_num_subpartitions(num_subpartitions)
        .with_buffer_size(BUFFER_SIZE)
        .with_buffer_pool_factory(move || global.create_buffer_pool(pool_size))
        .with_read_buffer_pool(ReadBufferPool::new(64 * BUFFER_SIZE, BUFFER_SIZE).unwrap())
        .with_read_io_executor(Arc::clone(executor))
        .with_spill_path(dir.path().join("bench"))
        .build()
        .unwrap()
}

/// Benchmark emitting records that are consumed straight from memory
fn bench_emit_and_consume(c: &mut Criterion) {
    let mut group = c.benchmark_group("emit_and_consume");
    let executor = Arc::new(IoExecutor::new(2));

    for size in [64usize, 1024, 16 * 1024, 64 * 1024].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let temp_dir = TempDir::new().unwrap();
            let partition = create_partition(&temp_dir, 1, 64, &executor);
            let view = partition
                .create_subpartition_view(0, Arc::new(NoOpListener))
                .unwrap();
            let record = vec![0xabu8; size];

            b.iter(|| {
                partition.emit_record(black_box(&record), 0).unwrap();
                while let Some(next) = view.get_next_buffer().unwrap() {
                    black_box(next.buffer().readable_bytes());
                }
            });
        });
    }

    group.finish();
}

/// Benchmark broadcasting to many subpartitions
fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast_record");
    let executor = Arc::new(IoExecutor::new(2));

    for subpartitions in [4usize, 32, 256].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(subpartitions),
            subpartitions,
            |b, &subpartitions| {
                let temp_dir = TempDir::new().unwrap();
                let partition = create_partition(&temp_dir, subpartitions, 64, &executor);
                let views: Vec<_> = (0..subpartitions)
                    .map(|i| {
                        partition
                            .create_subpartition_view(i, Arc::new(NoOpListener))
                            .unwrap()
                    })
                    .collect();
                let record = vec![0x5au8; 4096];

                b.iter(|| {
                    partition.broadcast_record(black_box(&record)).unwrap();
                    for view in &views {
                        while let Some(next) = view.get_next_buffer().unwrap() {
                            black_box(next.buffer().readable_bytes());
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark a write that overflows the pool, followed by reading everything back
fn bench_spill_and_read_back(c: &mut Criterion) {
    let mut group = c.benchmark_group("spill_and_read_back");
    group.sample_size(20);
    let executor = Arc::new(IoExecutor::new(4));

    for strategy in [SpillingStrategyType::Full, SpillingStrategyType::Selective] {
        group.bench_function(format!("{:?}", strategy), |b| {
            b.iter(|| {
                let temp_dir = TempDir::new().unwrap();
                let global = GlobalBufferPool::new(16, BUFFER_SIZE).unwrap();
                let partition = ResultPartitionBuilder::new()
                    .with_num_subpartitions(4)
                    .with_buffer_size(BUFFER_SIZE)
                    .with_buffer_pool_factory(move || global.create_buffer_pool(16))
                    .with_read_buffer_pool(
                        ReadBufferPool::new(64 * BUFFER_SIZE, BUFFER_SIZE).unwrap(),
                    )
                    .with_read_io_executor(Arc::clone(&executor))
                    .with_spill_path(temp_dir.path().join("bench"))
                    .with_config(HybridShuffleConfig::default().with_spilling_strategy(strategy))
                    .build()
                    .unwrap();

                let record = vec![1u8; BUFFER_SIZE];
                for i in 0..256 {
                    partition.emit_record(&record, i % 4).unwrap();
                }
                partition.finish().unwrap();

                for subpartition in 0..4 {
                    let listener = Arc::new(BlockingListener::new());
                    let view = partition
                        .create_subpartition_view(subpartition, listener.clone())
                        .unwrap();
                    loop {
                        match view.get_next_buffer().unwrap() {
                            Some(next) if next.buffer().is_buffer() => {
                                black_box(next.buffer().readable_bytes());
                            }
                            Some(_) => break,
                            None => {
                                listener.wait_for_data_timeout(Duration::from_secs(10));
                            }
                        }
                    }
                }
                partition.release();
            });
        });
    }

    group.finish();
}

/// Benchmark spilling decisions over many subpartitions
fn bench_strategy_decide(c: &mut Criterion) {
    let mut group = c.benchmark_group("strategy_decide");

    for strategy in [SpillingStrategyType::Full, SpillingStrategyType::Selective] {
        let config = HybridShuffleConfig::default().with_spilling_strategy(strategy);
        let spilling = SpillingStrategy::from_config(&config, 1000);
        let info = SpillingInfo {
            pool_size: 1000,
            num_requested_buffers: 1000,
            subpartitions: (0..100)
                .map(|i| SubpartitionSpillingInfo {
                    subpartition: i,
                    backlog: 10 + i % 7,
                    next_sequence_to_consume: (i % 3) as u64,
                    resident: (10..20).collect(),
                })
                .collect(),
        };

        group.bench_function(format!("{:?}", strategy), |b| {
            b.iter(|| black_box(spilling.decide(black_box(&info))));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_emit_and_consume,
    bench_broadcast,
    bench_spill_and_read_back,
    bench_strategy_decide
);
criterion_main!(benches);
