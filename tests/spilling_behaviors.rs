use hybrid_shuffle::{
    BlockingListener, GlobalBufferPool, HybridShuffleConfig, IoExecutor, ReadBufferPool,
    ResultPartition, ResultPartitionBuilder, SpillOrder, SpillingStrategyType, SubpartitionView,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const BUFFER_SIZE: usize = 256;

fn create_partition(
    dir: &TempDir,
    num_subpartitions: usize,
    pool_size: usize,
    config: HybridShuffleConfig,
) -> Arc<ResultPartition> {
    let global = GlobalBufferPool::new(pool_size, BUFFER_SIZE).unwrap();
    ResultPartitionBuilder::new()
        .with_num_subpartitions(num_subpartitions)
        .with_buffer_size(BUFFER_SIZE)
        .with_buffer_pool_factory(move || global.create_buffer_pool(pool_size))
        .with_read_buffer_pool(ReadBufferPool::new(8 * BUFFER_SIZE, BUFFER_SIZE).unwrap())
        .with_read_io_executor(Arc::new(IoExecutor::new(2)))
        .with_spill_path(dir.path().join("spill"))
        .with_config(config)
        .build()
        .unwrap()
}

fn record(subpartition: usize, i: usize) -> Vec<u8> {
    let mut data = vec![(i % 251) as u8; BUFFER_SIZE];
    data[0] = subpartition as u8;
    data
}

/// Collects every data buffer until end-of-partition.
fn drain(view: &SubpartitionView, listener: &BlockingListener) -> Vec<Vec<u8>> {
    let mut records = Vec::new();
    loop {
        match view.get_next_buffer().unwrap() {
            Some(next) if next.buffer().is_buffer() => {
                records.push(next.buffer().as_slice().to_vec());
            }
            Some(_) => return records,
            None => assert!(listener.wait_for_data_timeout(Duration::from_secs(10))),
        }
    }
}

#[test]
fn test_full_strategy_spills_and_reads_back_in_order() {
    let temp_dir = TempDir::new().unwrap();
    let partition = create_partition(&temp_dir, 1, 4, HybridShuffleConfig::default());

    for i in 0..20 {
        partition.emit_record(&record(0, i), 0).unwrap();
    }
    partition.finish().unwrap();
    assert!(partition.num_spilled_buffers() > 0);
    assert_eq!(partition.backlog(0).unwrap(), 21);

    let listener = Arc::new(BlockingListener::new());
    let view = partition
        .create_subpartition_view(0, listener.clone())
        .unwrap();
    let records = drain(&view, &listener);

    assert_eq!(records.len(), 20);
    for (i, data) in records.iter().enumerate() {
        assert_eq!(data, &record(0, i), "record {} out of order", i);
    }
    assert_eq!(partition.num_spilled_buffers(), 0);
}

#[test]
fn test_absolute_trigger_spills_whole_subpartition() {
    let temp_dir = TempDir::new().unwrap();
    let config = HybridShuffleConfig::default().with_full_strategy_num_buffers_trigger_spilling(2);
    let partition = create_partition(&temp_dir, 2, 8, config);

    partition.emit_record(&record(0, 0), 0).unwrap();
    partition.emit_record(&record(0, 1), 0).unwrap();
    assert_eq!(partition.num_spilled_buffers(), 0);

    partition.emit_record(&record(1, 2), 1).unwrap();
    assert_eq!(partition.num_spilled_buffers(), 2);
    assert_eq!(partition.backlog(0).unwrap(), 2);
    assert_eq!(partition.backlog(1).unwrap(), 1);
}

#[test]
fn test_trigger_above_pool_size_still_spills() {
    let temp_dir = TempDir::new().unwrap();
    let config = HybridShuffleConfig::default().with_full_strategy_num_buffers_trigger_spilling(8);
    let partition = create_partition(&temp_dir, 1, 4, config);

    let producer = {
        let partition = Arc::clone(&partition);
        thread::spawn(move || {
            for i in 0..6 {
                partition.emit_record(&record(0, i), 0)?;
            }
            partition.finish()
        })
    };
    let deadline = Instant::now() + Duration::from_secs(10);
    while !producer.is_finished() {
        assert!(Instant::now() < deadline, "producer never got a buffer");
        thread::sleep(Duration::from_millis(5));
    }
    producer.join().unwrap().unwrap();
    assert!(partition.num_spilled_buffers() > 0);

    let listener = Arc::new(BlockingListener::new());
    let view = partition
        .create_subpartition_view(0, listener.clone())
        .unwrap();
    let records = drain(&view, &listener);
    assert_eq!(records, (0..6).map(|i| record(0, i)).collect::<Vec<_>>());
}

#[test]
fn test_most_backlogged_subpartition_spills_first() {
    let temp_dir = TempDir::new().unwrap();
    let partition = create_partition(&temp_dir, 3, 6, HybridShuffleConfig::default());

    // Backlogs 1, 4, 1 fill the pool.
    partition.emit_record(&record(0, 0), 0).unwrap();
    for i in 0..4 {
        partition.emit_record(&record(1, i), 1).unwrap();
    }
    partition.emit_record(&record(2, 0), 2).unwrap();
    assert_eq!(partition.num_spilled_buffers(), 0);

    partition.emit_record(&record(2, 1), 2).unwrap();
    assert_eq!(partition.num_spilled_buffers(), 4);
    assert_eq!(partition.buffer_pool().num_used_buffers(), 3);
}

#[test]
fn test_index_order_policy() {
    let temp_dir = TempDir::new().unwrap();
    let config = HybridShuffleConfig::default().with_full_strategy_spill_order(SpillOrder::IndexOrder);
    let partition = create_partition(&temp_dir, 2, 4, config);

    partition.emit_record(&record(0, 0), 0).unwrap();
    for i in 0..3 {
        partition.emit_record(&record(1, i), 1).unwrap();
    }
    partition.emit_record(&record(0, 1), 0).unwrap();

    // Subpartition 0 frees one of the two buffers needed, so subpartition 1 follows.
    assert_eq!(partition.num_spilled_buffers(), 4);
}

#[test]
fn test_selective_strategy_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let config = HybridShuffleConfig::default().with_spilling_strategy(SpillingStrategyType::Selective);
    let partition = create_partition(&temp_dir, 2, 10, config);

    for i in 0..30 {
        partition.emit_record(&record(i % 2, i), i % 2).unwrap();
    }
    partition.broadcast_record(&record(9, 99)).unwrap();
    partition.finish().unwrap();
    assert!(partition.num_spilled_buffers() > 0);

    for subpartition in 0..2 {
        let listener = Arc::new(BlockingListener::new());
        let view = partition
            .create_subpartition_view(subpartition, listener.clone())
            .unwrap();
        let records = drain(&view, &listener);

        let mut expected: Vec<Vec<u8>> = (0..30)
            .filter(|i| i % 2 == subpartition)
            .map(|i| record(subpartition, i))
            .collect();
        expected.push(record(9, 99));
        assert_eq!(records, expected);
    }
}

#[test]
fn test_buffer_in_reader_hand_survives_spilling() {
    let temp_dir = TempDir::new().unwrap();
    let partition = create_partition(&temp_dir, 1, 2, HybridShuffleConfig::default());
    let listener = Arc::new(BlockingListener::new());
    let view = partition
        .create_subpartition_view(0, listener.clone())
        .unwrap();

    partition.emit_record(&record(0, 0), 0).unwrap();
    let held = view.get_next_buffer().unwrap().unwrap().into_buffer();

    for i in 1..10 {
        partition.emit_record(&record(0, i), 0).unwrap();
    }
    assert!(partition.num_spilled_buffers() > 0);
    assert_eq!(held.as_slice(), &record(0, 0)[..]);

    drop(held);
    partition.finish().unwrap();
    let rest = drain(&view, &listener);
    assert_eq!(rest.len(), 9);
    assert_eq!(rest[0], record(0, 1));
}
