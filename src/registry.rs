//! Process-wide index of live result partitions.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tracing::{debug, info};

use crate::partition::{ResultPartition, ResultPartitionId};
use crate::view::{AvailabilityListener, SubpartitionView};
use crate::{Result, ShuffleError};

/// Maps partition ids to live partitions.
///
/// A partition built with a registry is inserted on creation and removed when
/// it is released.
#[derive(Default)]
pub struct PartitionRegistry {
    partitions: DashMap<ResultPartitionId, Arc<ResultPartition>>,
}

impl PartitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, partition: Arc<ResultPartition>) -> Result<()> {
        let id = partition.id();
        match self.partitions.entry(id) {
            Entry::Occupied(_) => Err(ShuffleError::PartitionAlreadyRegistered { id }),
            Entry::Vacant(slot) => {
                slot.insert(partition);
                debug!(partition = %id, "Registered result partition");
                Ok(())
            }
        }
    }

    /// Removes a partition without releasing it.
    pub fn unregister(&self, id: &ResultPartitionId) -> Option<Arc<ResultPartition>> {
        self.partitions.remove(id).map(|(_, partition)| partition)
    }

    pub fn get(&self, id: &ResultPartitionId) -> Option<Arc<ResultPartition>> {
        self.partitions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Opens the reader of one subpartition of a registered partition.
    pub fn create_subpartition_view(
        &self,
        id: &ResultPartitionId,
        subpartition: usize,
        listener: Arc<dyn AvailabilityListener>,
    ) -> Result<SubpartitionView> {
        let partition = self
            .get(id)
            .ok_or(ShuffleError::PartitionNotFound { id: *id })?;
        partition.create_subpartition_view(subpartition, listener)
    }

    /// Releases and removes one partition.
    pub fn release_partition(&self, id: &ResultPartitionId) -> Result<()> {
        let partition = self
            .unregister(id)
            .ok_or(ShuffleError::PartitionNotFound { id: *id })?;
        partition.release();
        Ok(())
    }

    /// Releases every registered partition.
    pub fn release_all(&self) {
        let ids: Vec<ResultPartitionId> = self.partitions.iter().map(|e| *e.key()).collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "Releasing all result partitions");
        }
        for id in ids {
            if let Some(partition) = self.unregister(&id) {
                partition.release();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}
