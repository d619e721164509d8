//! The result partition: write path, lifecycle and view creation.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, instrument, warn};

use crate::buffer::{Buffer, DataType};
use crate::concurrency::IoExecutor;
use crate::config::HybridShuffleConfig;
use crate::event::ShuffleEvent;
use crate::metrics::IoMetrics;
use crate::pool::{BufferPool, PooledSegment};
use crate::read_pool::ReadBufferPool;
use crate::registry::PartitionRegistry;
use crate::spill::SpillFile;
use crate::strategy::{Decision, SpillingInfo, SpillingStrategy};
use crate::subpartition::Subpartition;
use crate::view::{AvailabilityListener, SubpartitionView};
use crate::{Result, ShuffleError};

/// Default size of a write buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Size of the read pool created when none is supplied.
pub const DEFAULT_READ_POOL_BYTES: usize = 32 * 1024 * 1024;

static NEXT_PRODUCER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a result partition within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResultPartitionId {
    pub producer_id: u64,
    pub partition_index: u32,
}

impl ResultPartitionId {
    pub fn new(producer_id: u64, partition_index: u32) -> Self {
        Self {
            producer_id,
            partition_index,
        }
    }

    /// Creates an id whose producer id is unique within this process.
    pub fn generate(partition_index: u32) -> Self {
        Self::new(
            NEXT_PRODUCER_ID.fetch_add(1, Ordering::Relaxed),
            partition_index,
        )
    }
}

impl fmt::Display for ResultPartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.producer_id, self.partition_index)
    }
}

/// Lifecycle of a result partition. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PartitionState {
    /// Accepting records and events.
    Open,
    /// End-of-partition appended; no more writes.
    Finished,
    /// Write pool destroyed; written data stays readable.
    Closed,
    /// Everything freed. Terminal.
    Released,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionState::Open => "OPEN",
            PartitionState::Finished => "FINISHED",
            PartitionState::Closed => "CLOSED",
            PartitionState::Released => "RELEASED",
        };
        f.write_str(name)
    }
}

/// The output of one producing task, split into subpartitions.
///
/// A single producer thread calls the write methods; any number of reader
/// threads consume through [`SubpartitionView`]s concurrently. `release` may
/// be called from any thread at any time.
pub struct ResultPartition {
    id: ResultPartitionId,
    owning_task_name: String,
    num_target_key_groups: usize,
    buffer_size: usize,
    state: Mutex<PartitionState>,
    producer: Mutex<()>,
    write_pool: Arc<BufferPool>,
    read_pool: Arc<ReadBufferPool>,
    executor: Arc<IoExecutor>,
    spill: Arc<SpillFile>,
    subpartitions: Vec<Arc<Subpartition>>,
    strategy: SpillingStrategy,
    config: HybridShuffleConfig,
    metrics: Arc<IoMetrics>,
    registry: Option<Weak<PartitionRegistry>>,
}

impl ResultPartition {
    pub fn id(&self) -> ResultPartitionId {
        self.id
    }

    pub fn owning_task_name(&self) -> &str {
        &self.owning_task_name
    }

    pub fn num_subpartitions(&self) -> usize {
        self.subpartitions.len()
    }

    pub fn num_target_key_groups(&self) -> usize {
        self.num_target_key_groups
    }

    /// Records longer than this span several buffers.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn state(&self) -> PartitionState {
        *self.state.lock()
    }

    pub fn is_released(&self) -> bool {
        self.state() == PartitionState::Released
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.write_pool
    }

    pub fn read_buffer_pool(&self) -> &Arc<ReadBufferPool> {
        &self.read_pool
    }

    pub fn config(&self) -> &HybridShuffleConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<IoMetrics> {
        &self.metrics
    }

    /// Location of the spill file. It only exists after the first spill.
    pub fn spill_path(&self) -> &Path {
        self.spill.path()
    }

    /// Spilled buffers not yet consumed.
    pub fn num_spilled_buffers(&self) -> usize {
        self.subpartitions.iter().map(|s| s.num_spilled()).sum()
    }

    /// Buffers of one subpartition not yet delivered to its reader.
    pub fn backlog(&self, subpartition: usize) -> Result<usize> {
        Ok(self.subpartition(subpartition)?.backlog())
    }

    /// False while the producer would block on the write pool.
    pub fn is_available(&self) -> bool {
        self.write_pool.is_available()
    }

    /// Writes a record to one subpartition, blocking while the write pool is exhausted.
    ///
    /// If a later chunk of a multi-buffer record fails, the chunks the reader
    /// has not reached yet are taken back.
    pub fn emit_record(&self, record: &[u8], subpartition: usize) -> Result<()> {
        let target = self.subpartition(subpartition)?;
        let _producer = self.producer.lock();
        self.check_writable("emit record")?;

        let start = [(target, target.next_sequence())];
        let mut num_buffers = 0;
        for chunk in record.chunks(self.buffer_size) {
            let buffer = self
                .write_chunk(chunk)
                .map_err(|e| self.abort_record("emit record", &start, e))?;
            target.append(buffer);
            num_buffers += 1;
        }

        self.metrics
            .record_emit(self.id, num_buffers, record.len() as u64);
        Ok(())
    }

    /// Writes a record to every subpartition, sharing one copy of the payload.
    pub fn broadcast_record(&self, record: &[u8]) -> Result<()> {
        let _producer = self.producer.lock();
        self.check_writable("broadcast record")?;

        let starts: Vec<_> = self
            .subpartitions
            .iter()
            .map(|subpartition| (subpartition, subpartition.next_sequence()))
            .collect();
        let mut num_buffers = 0;
        for chunk in record.chunks(self.buffer_size) {
            let buffer = self
                .write_chunk(chunk)
                .map_err(|e| self.abort_record("broadcast record", &starts, e))?;
            for subpartition in &self.subpartitions {
                subpartition.append(buffer.retain());
            }
            num_buffers += 1;
        }

        self.metrics.record_broadcast(
            self.id,
            num_buffers,
            record.len() as u64,
            self.subpartitions.len() as u64,
        );
        Ok(())
    }

    /// Appends an event to every subpartition without touching the write pool.
    ///
    /// Broadcasting [`ShuffleEvent::EndOfPartition`] finishes the partition.
    /// An encoded event must fit in one buffer.
    pub fn broadcast_event(&self, event: &ShuffleEvent, is_priority: bool) -> Result<()> {
        if event.is_end_of_partition() {
            return self.finish();
        }

        let buffer = event.to_buffer()?;
        if buffer.readable_bytes() > self.buffer_size {
            return Err(ShuffleError::EventTooLarge {
                size: buffer.readable_bytes(),
                limit: self.buffer_size,
            });
        }
        let _producer = self.producer.lock();
        self.check_writable("broadcast event")?;

        debug!(partition = %self.id, ?event, is_priority, "Broadcasting event");
        for subpartition in &self.subpartitions {
            subpartition.append(buffer.retain());
        }
        Ok(())
    }

    /// Appends end-of-partition to every subpartition. No writes are accepted afterwards.
    pub fn finish(&self) -> Result<()> {
        let buffer = ShuffleEvent::EndOfPartition.to_buffer()?;
        let _producer = self.producer.lock();
        {
            let mut state = self.state.lock();
            if *state != PartitionState::Open {
                return Err(ShuffleError::IllegalState {
                    operation: "finish",
                    state: *state,
                });
            }
            *state = PartitionState::Finished;
        }

        for subpartition in &self.subpartitions {
            subpartition.finish(buffer.retain());
        }
        info!(partition = %self.id, task = %self.owning_task_name, "Finished result partition");
        Ok(())
    }

    /// Releases the write side. Everything written so far stays readable.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state >= PartitionState::Closed {
                return Ok(());
            }
            *state = PartitionState::Closed;
        }

        // Wakes a producer blocked on the pool so the producer lock frees up.
        self.write_pool.destroy();
        let _producer = self.producer.lock();
        self.spill.finish_writing()?;

        info!(partition = %self.id, task = %self.owning_task_name, "Closed result partition");
        Ok(())
    }

    /// Frees all buffers, deletes the spill file and fails every view.
    ///
    /// Idempotent. Failing to delete the spill file is logged, never returned.
    pub fn release(&self) {
        {
            let mut state = self.state.lock();
            if *state == PartitionState::Released {
                return;
            }
            *state = PartitionState::Released;
        }

        self.write_pool.destroy();
        for subpartition in &self.subpartitions {
            subpartition.release();
        }
        if let Err(e) = self.spill.delete() {
            warn!(partition = %self.id, "Failed to delete spill file: {}", e);
        }
        if let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) {
            registry.unregister(&self.id);
        }

        info!(partition = %self.id, task = %self.owning_task_name, "Released result partition");
    }

    /// Creates the reader of one subpartition. Each subpartition has at most one.
    pub fn create_subpartition_view(
        &self,
        subpartition: usize,
        listener: Arc<dyn AvailabilityListener>,
    ) -> Result<SubpartitionView> {
        let target = self.subpartition(subpartition)?;
        let state = self.state();
        if state == PartitionState::Released {
            return Err(ShuffleError::IllegalState {
                operation: "create subpartition view",
                state,
            });
        }

        target.create_view(listener)?;
        debug!(partition = %self.id, subpartition, "Created subpartition view");
        Ok(SubpartitionView::new(
            Arc::clone(target),
            Arc::clone(&self.executor),
        ))
    }

    fn subpartition(&self, index: usize) -> Result<&Arc<Subpartition>> {
        self.subpartitions
            .get(index)
            .ok_or(ShuffleError::SubpartitionOutOfRange {
                index,
                num_subpartitions: self.subpartitions.len(),
            })
    }

    fn check_writable(&self, operation: &'static str) -> Result<()> {
        let state = self.state();
        if state == PartitionState::Open {
            Ok(())
        } else {
            Err(ShuffleError::IllegalState { operation, state })
        }
    }

    /// Reports writes interrupted by close or release as misuse.
    fn write_error(&self, operation: &'static str, err: ShuffleError) -> ShuffleError {
        let state = self.state();
        if state >= PartitionState::Closed {
            ShuffleError::IllegalState { operation, state }
        } else {
            err
        }
    }

    /// Takes back the queued chunks of a record that could not be completed.
    fn abort_record(
        &self,
        operation: &'static str,
        starts: &[(&Arc<Subpartition>, u64)],
        err: ShuffleError,
    ) -> ShuffleError {
        let discarded: usize = starts
            .iter()
            .map(|(subpartition, sequence)| subpartition.discard_from(*sequence))
            .sum();
        if discarded > 0 {
            warn!(partition = %self.id, discarded, "Discarded partially written record: {}", err);
        }
        self.write_error(operation, err)
    }

    fn write_chunk(&self, chunk: &[u8]) -> Result<Buffer> {
        let mut segment = self.request_write_segment()?;
        segment.append(chunk);
        Ok(Buffer::new(segment.freeze(), DataType::DataBuffer))
    }

    /// Takes a write segment, spilling first if the strategy asks for it.
    fn request_write_segment(&self) -> Result<PooledSegment> {
        loop {
            let in_use = self.write_pool.num_used_buffers();
            let mut spilled = 0;
            if self.strategy.should_evaluate(in_use) {
                let decision = self.strategy.decide(&self.spilling_info(in_use));
                spilled = self.spill(&decision)?;
            }

            if let Some(segment) = self.write_pool.try_request_segment()? {
                return Ok(segment);
            }
            // Nothing left to move to disk: wait for readers to recycle.
            if spilled == 0 {
                return self.write_pool.request_segment_blocking();
            }
        }
    }

    fn spilling_info(&self, num_requested_buffers: usize) -> SpillingInfo {
        SpillingInfo {
            pool_size: self.write_pool.capacity(),
            num_requested_buffers,
            subpartitions: self
                .subpartitions
                .iter()
                .map(|s| s.spilling_info())
                .collect(),
        }
    }

    #[instrument(skip(self, decision), fields(partition = %self.id, planned = decision.num_buffers()))]
    fn spill(&self, decision: &Decision) -> Result<usize> {
        let mut spilled = 0;
        for range in &decision.to_spill {
            let Some(subpartition) = self.subpartitions.get(range.subpartition) else {
                continue;
            };
            let buffers = subpartition.resident_buffers(range.sequences.clone());
            if buffers.is_empty() {
                continue;
            }
            self.spill.append(range.subpartition, &buffers)?;
            spilled += subpartition.mark_spilled(buffers.iter().map(|(sequence, _)| *sequence));
        }

        if spilled > 0 {
            debug!(spilled, "Spilled buffers to disk");
        }
        Ok(spilled)
    }
}

impl fmt::Debug for ResultPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultPartition")
            .field("id", &self.id)
            .field("owning_task_name", &self.owning_task_name)
            .field("num_subpartitions", &self.subpartitions.len())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for ResultPartition {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(partition = %self.id, "Failed to close result partition on drop: {}", e);
        }
    }
}

type BufferPoolFactory = Box<dyn FnOnce() -> Result<Arc<BufferPool>> + Send>;

/// Builder for [`ResultPartition`].
pub struct ResultPartitionBuilder {
    id: Option<ResultPartitionId>,
    owning_task_name: String,
    num_subpartitions: usize,
    num_target_key_groups: Option<usize>,
    buffer_size: usize,
    buffer_pool_factory: Option<BufferPoolFactory>,
    read_pool: Option<Arc<ReadBufferPool>>,
    executor: Option<Arc<IoExecutor>>,
    spill_path: Option<PathBuf>,
    config: HybridShuffleConfig,
    metrics: Option<Arc<IoMetrics>>,
    registry: Option<Arc<PartitionRegistry>>,
}

impl Default for ResultPartitionBuilder {
    fn default() -> Self {
        Self {
            id: None,
            owning_task_name: "unknown".to_string(),
            num_subpartitions: 1,
            num_target_key_groups: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffer_pool_factory: None,
            read_pool: None,
            executor: None,
            spill_path: None,
            config: HybridShuffleConfig::default(),
            metrics: None,
            registry: None,
        }
    }
}

impl ResultPartitionBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the partition id. A process-unique id is generated otherwise.
    pub fn with_partition_id(mut self, id: ResultPartitionId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the name of the producing task, used in logs.
    pub fn with_owning_task_name(mut self, name: impl Into<String>) -> Self {
        self.owning_task_name = name.into();
        self
    }

    pub fn with_num_subpartitions(mut self, num_subpartitions: usize) -> Self {
        self.num_subpartitions = num_subpartitions;
        self
    }

    /// Sets the total key-group count; defaults to the number of subpartitions.
    pub fn with_num_target_key_groups(mut self, num_target_key_groups: usize) -> Self {
        self.num_target_key_groups = Some(num_target_key_groups);
        self
    }

    /// Sets the payload capacity of each write buffer.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Sets the supplier of the write pool, invoked once by `build`.
    pub fn with_buffer_pool_factory<F>(mut self, factory: F) -> Self
    where
        F: FnOnce() -> Result<Arc<BufferPool>> + Send + 'static,
    {
        self.buffer_pool_factory = Some(Box::new(factory));
        self
    }

    /// Uses an existing write pool.
    pub fn with_buffer_pool(self, pool: Arc<BufferPool>) -> Self {
        self.with_buffer_pool_factory(move || Ok(pool))
    }

    /// Sets the read pool shared with other partitions.
    pub fn with_read_buffer_pool(mut self, pool: Arc<ReadBufferPool>) -> Self {
        self.read_pool = Some(pool);
        self
    }

    /// Sets the executor running disk reads.
    pub fn with_read_io_executor(mut self, executor: Arc<IoExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Sets the spill base path. The file itself gets a `.data` suffix.
    pub fn with_spill_path(mut self, path: impl AsRef<Path>) -> Self {
        self.spill_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_config(mut self, config: HybridShuffleConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the metrics sink, shareable between partitions.
    pub fn with_metrics(mut self, metrics: Arc<IoMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Registers the partition on build and unregisters it on release.
    pub fn with_registry(mut self, registry: Arc<PartitionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<Arc<ResultPartition>> {
        self.config.validate()?;

        let num_subpartitions = self.num_subpartitions;
        if num_subpartitions == 0 {
            return Err(ShuffleError::InvalidConfiguration(
                "a result partition needs at least one subpartition".to_string(),
            ));
        }
        let num_target_key_groups = self.num_target_key_groups.unwrap_or(num_subpartitions);
        if num_target_key_groups < num_subpartitions {
            return Err(ShuffleError::InvalidConfiguration(format!(
                "{} target key groups cannot cover {} subpartitions",
                num_target_key_groups, num_subpartitions
            )));
        }
        let end_of_partition_size = ShuffleEvent::EndOfPartition.to_bytes()?.len();
        if self.buffer_size < end_of_partition_size {
            return Err(ShuffleError::InvalidConfiguration(format!(
                "buffer size must be at least {} bytes",
                end_of_partition_size
            )));
        }

        let factory = self.buffer_pool_factory.ok_or_else(|| {
            ShuffleError::InvalidConfiguration("a write buffer pool is required".to_string())
        })?;
        let write_pool = factory()?;
        if write_pool.segment_size() < self.buffer_size {
            return Err(ShuffleError::InvalidConfiguration(format!(
                "write pool segments of {} bytes cannot hold buffers of {} bytes",
                write_pool.segment_size(),
                self.buffer_size
            )));
        }

        let read_pool = match self.read_pool {
            Some(pool) => pool,
            None => ReadBufferPool::new(
                DEFAULT_READ_POOL_BYTES.max(self.buffer_size),
                self.buffer_size,
            )?,
        };
        if read_pool.buffer_size() < self.buffer_size {
            return Err(ShuffleError::InvalidConfiguration(format!(
                "read pool buffers of {} bytes are smaller than write buffers of {} bytes",
                read_pool.buffer_size(),
                self.buffer_size
            )));
        }

        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(IoExecutor::with_default_threads()));
        let id = self.id.unwrap_or_else(|| ResultPartitionId::generate(0));
        let spill_path = self.spill_path.unwrap_or_else(|| {
            std::env::temp_dir().join(format!(
                "hybrid-shuffle-{}-{}",
                id.producer_id, id.partition_index
            ))
        });

        let spill = Arc::new(SpillFile::new(&spill_path, num_subpartitions));
        let subpartitions = (0..num_subpartitions)
            .map(|index| {
                Arc::new(Subpartition::new(
                    index,
                    Arc::clone(&spill),
                    Arc::clone(&read_pool),
                ))
            })
            .collect();
        let strategy = SpillingStrategy::from_config(&self.config, write_pool.capacity());

        let partition = Arc::new(ResultPartition {
            id,
            owning_task_name: self.owning_task_name,
            num_target_key_groups,
            buffer_size: self.buffer_size,
            state: Mutex::new(PartitionState::Open),
            producer: Mutex::new(()),
            write_pool,
            read_pool,
            executor,
            spill,
            subpartitions,
            strategy,
            config: self.config,
            metrics: self.metrics.unwrap_or_default(),
            registry: self.registry.as_ref().map(Arc::downgrade),
        });

        if let Some(registry) = &self.registry {
            registry.register(Arc::clone(&partition))?;
        }

        info!(
            partition = %partition.id,
            task = %partition.owning_task_name,
            num_subpartitions,
            buffer_size = partition.buffer_size,
            pool_size = partition.write_pool.capacity(),
            strategy = ?partition.config.spilling_strategy,
            "Created result partition"
        );
        Ok(partition)
    }
}
