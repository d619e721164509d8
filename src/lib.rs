//! hybrid-shuffle - A result partition engine that keeps shuffle data in memory or on disk
//!
//! A [`ResultPartition`] accepts records from one producer and splits them into
//! subpartitions, each consumed in order by a single [`SubpartitionView`].
//! Buffers come from a bounded write pool. When the pool runs dry, a
//! [`SpillingStrategy`](strategy::SpillingStrategy) moves queued buffers to a
//! per-partition spill file, and views load them back through a shared
//! [`ReadBufferPool`] and an [`IoExecutor`].
//!
//! ```no_run
//! use hybrid_shuffle::{
//!     BlockingListener, GlobalBufferPool, IoExecutor, ReadBufferPool, ResultPartitionBuilder,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> hybrid_shuffle::Result<()> {
//! let global = GlobalBufferPool::new(64, 32 * 1024)?;
//! let partition = ResultPartitionBuilder::new()
//!     .with_num_subpartitions(4)
//!     .with_buffer_pool_factory(move || global.create_buffer_pool(16))
//!     .with_read_buffer_pool(ReadBufferPool::new(4 * 1024 * 1024, 32 * 1024)?)
//!     .with_read_io_executor(Arc::new(IoExecutor::new(2)))
//!     .with_spill_path("/tmp/shuffle-0")
//!     .build()?;
//!
//! partition.emit_record(b"record", 2)?;
//! partition.finish()?;
//!
//! let listener = Arc::new(BlockingListener::new());
//! let view = partition.create_subpartition_view(2, listener.clone())?;
//! loop {
//!     match view.get_next_buffer()? {
//!         Some(next) if next.buffer().is_buffer() => println!("{:?}", next.buffer()),
//!         Some(_) => break,
//!         None => listener.wait_for_data(),
//!     }
//! }
//! partition.release();
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod cgroup;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod partition;
pub mod pool;
pub mod read_pool;
pub mod registry;
pub mod spill;
pub mod strategy;
mod subpartition;
pub mod view;

pub use buffer::{Buffer, BufferAndBacklog, DataType};
pub use concurrency::IoExecutor;
pub use config::{HybridShuffleConfig, SpillOrder, SpillingStrategyType};
pub use error::{Result, ShuffleError};
pub use event::ShuffleEvent;
pub use metrics::{IoMetrics, IoMetricsSnapshot};
pub use partition::{PartitionState, ResultPartition, ResultPartitionBuilder, ResultPartitionId};
pub use pool::{BufferPool, GlobalBufferPool};
pub use read_pool::ReadBufferPool;
pub use registry::PartitionRegistry;
pub use view::{AvailabilityListener, BlockingListener, NoOpListener, SubpartitionView};
