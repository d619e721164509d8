use hybrid_shuffle::{
    BlockingListener, GlobalBufferPool, IoExecutor, NoOpListener, PartitionRegistry,
    ReadBufferPool, ResultPartition, ResultPartitionBuilder, ResultPartitionId, ShuffleError,
    ShuffleEvent,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const BUFFER_SIZE: usize = 512;

fn create_partition(
    dir: &TempDir,
    global: &Arc<GlobalBufferPool>,
    num_subpartitions: usize,
    pool_size: usize,
) -> Arc<ResultPartition> {
    let global = Arc::clone(global);
    ResultPartitionBuilder::new()
        .with_num_subpartitions(num_subpartitions)
        .with_buffer_size(BUFFER_SIZE)
        .with_buffer_pool_factory(move || global.create_buffer_pool(pool_size))
        .with_read_buffer_pool(ReadBufferPool::new(16 * BUFFER_SIZE, BUFFER_SIZE).unwrap())
        .with_read_io_executor(Arc::new(IoExecutor::new(4)))
        .with_spill_path(dir.path().join("concurrent"))
        .build()
        .unwrap()
}

#[test]
fn test_producer_blocks_until_reader_recycles() {
    let temp_dir = TempDir::new().unwrap();
    let global = GlobalBufferPool::new(2, BUFFER_SIZE).unwrap();
    let partition = create_partition(&temp_dir, &global, 1, 2);
    let view = partition
        .create_subpartition_view(0, Arc::new(NoOpListener))
        .unwrap();

    partition.emit_record(&[1u8; BUFFER_SIZE], 0).unwrap();
    partition.emit_record(&[2u8; BUFFER_SIZE], 0).unwrap();
    let held: Vec<_> = (0..2)
        .map(|_| view.get_next_buffer().unwrap().unwrap().into_buffer())
        .collect();
    assert!(!partition.is_available());

    let producer = {
        let partition = Arc::clone(&partition);
        thread::spawn(move || partition.emit_record(&[3u8; BUFFER_SIZE], 0))
    };

    // Nothing is left in memory to spill, so the producer has to wait.
    thread::sleep(Duration::from_millis(50));
    assert!(!producer.is_finished());

    drop(held);
    producer.join().unwrap().unwrap();
    assert_eq!(
        view.get_next_buffer().unwrap().unwrap().buffer().as_slice(),
        &[3u8; BUFFER_SIZE][..]
    );
}

#[test]
fn test_close_unblocks_waiting_producer() {
    let temp_dir = TempDir::new().unwrap();
    let global = GlobalBufferPool::new(1, BUFFER_SIZE).unwrap();
    let partition = create_partition(&temp_dir, &global, 1, 1);
    let view = partition
        .create_subpartition_view(0, Arc::new(NoOpListener))
        .unwrap();

    partition.emit_record(b"only", 0).unwrap();
    let _held = view.get_next_buffer().unwrap().unwrap();

    let producer = {
        let partition = Arc::clone(&partition);
        thread::spawn(move || partition.emit_record(b"blocked", 0))
    };
    thread::sleep(Duration::from_millis(20));
    partition.close().unwrap();

    let err = producer.join().unwrap().unwrap_err();
    assert!(err.is_illegal_state(), "unexpected error: {}", err);
}

#[test]
fn test_release_during_concurrent_reads() {
    let temp_dir = TempDir::new().unwrap();
    let global = GlobalBufferPool::new(16, BUFFER_SIZE).unwrap();
    let num_subpartitions = 4;
    let partition = create_partition(&temp_dir, &global, num_subpartitions, 8);

    let mut readers = Vec::new();
    for subpartition in 0..num_subpartitions {
        let listener = Arc::new(BlockingListener::new());
        let view = partition
            .create_subpartition_view(subpartition, listener.clone())
            .unwrap();
        readers.push(thread::spawn(move || {
            let mut received = 0usize;
            loop {
                match view.get_next_buffer() {
                    Ok(Some(next)) => {
                        if !next.buffer().is_buffer() {
                            return Ok(received);
                        }
                        received += 1;
                        // Slow consumers keep the spill path busy.
                        thread::sleep(Duration::from_micros(200));
                    }
                    Ok(None) => {
                        listener.wait_for_data_timeout(Duration::from_millis(100));
                    }
                    Err(e) => return Err(e),
                }
            }
        }));
    }

    for i in 0..400usize {
        let result = if i % 5 == 0 {
            partition.broadcast_record(&[i as u8; BUFFER_SIZE])
        } else {
            partition.emit_record(&[i as u8; BUFFER_SIZE], i % num_subpartitions)
        };
        result.unwrap();
    }
    partition.release();

    for reader in readers {
        match reader.join().unwrap() {
            Ok(_) | Err(ShuffleError::PartitionReleased { .. }) => {}
            Err(e) => panic!("unexpected reader error: {}", e),
        }
    }
    assert!(!partition.spill_path().exists());
    assert_eq!(global.num_available_segments(), global.total_segments());
}

#[test]
fn test_partitions_share_read_pool_and_executor() {
    let temp_dir = TempDir::new().unwrap();
    let global = GlobalBufferPool::new(8, BUFFER_SIZE).unwrap();
    let read_pool = ReadBufferPool::new(4 * BUFFER_SIZE, BUFFER_SIZE).unwrap();
    let executor = Arc::new(IoExecutor::new(2));
    let registry = Arc::new(PartitionRegistry::new());

    let partitions: Vec<Arc<ResultPartition>> = (0..2u32)
        .map(|index| {
            let global = Arc::clone(&global);
            ResultPartitionBuilder::new()
                .with_partition_id(ResultPartitionId::new(77, index))
                .with_buffer_size(BUFFER_SIZE)
                .with_buffer_pool_factory(move || global.create_buffer_pool(2))
                .with_read_buffer_pool(Arc::clone(&read_pool))
                .with_read_io_executor(Arc::clone(&executor))
                .with_spill_path(temp_dir.path().join(format!("shared-{}", index)))
                .with_registry(Arc::clone(&registry))
                .build()
                .unwrap()
        })
        .collect();
    assert_eq!(registry.len(), 2);

    for partition in &partitions {
        for i in 0..10u8 {
            partition.emit_record(&[i; BUFFER_SIZE], 0).unwrap();
        }
        partition
            .broadcast_event(&ShuffleEvent::EndOfPartition, false)
            .unwrap();
    }

    let handles: Vec<_> = partitions
        .iter()
        .map(|partition| {
            let listener = Arc::new(BlockingListener::new());
            let view = registry
                .create_subpartition_view(&partition.id(), 0, listener.clone())
                .unwrap();
            thread::spawn(move || {
                let mut values = Vec::new();
                loop {
                    match view.get_next_buffer().unwrap() {
                        Some(next) if next.buffer().is_buffer() => {
                            values.push(next.buffer().as_slice()[0]);
                        }
                        Some(_) => return values,
                        None => assert!(listener.wait_for_data_timeout(Duration::from_secs(10))),
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), (0..10u8).collect::<Vec<_>>());
    }

    registry.release_all();
    assert!(registry.is_empty());
    assert_eq!(read_pool.num_available_buffers(), read_pool.num_total_buffers());
    assert_eq!(global.num_available_segments(), global.total_segments());
}
