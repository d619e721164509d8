//! Output counters of result partitions.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::Result;
use crate::partition::ResultPartitionId;

/// Cumulative output counters, shareable between partitions of one task.
#[derive(Debug, Default)]
pub struct IoMetrics {
    num_buffers_out: AtomicU64,
    num_bytes_out: AtomicU64,
    bytes_produced: DashMap<ResultPartitionId, u64>,
}

/// Point-in-time copy of [`IoMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoMetricsSnapshot {
    pub num_buffers_out: u64,
    pub num_bytes_out: u64,
    /// Keyed by the partition id's display form.
    pub bytes_produced: BTreeMap<String, u64>,
}

impl IoMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a record of `bytes` bytes written to one subpartition in `buffers` buffers.
    pub fn record_emit(&self, partition: ResultPartitionId, buffers: u64, bytes: u64) {
        self.num_buffers_out.fetch_add(buffers, Ordering::Relaxed);
        self.num_bytes_out.fetch_add(bytes, Ordering::Relaxed);
        *self.bytes_produced.entry(partition).or_insert(0) += bytes;
    }

    /// Records a record shared by `num_subpartitions` subpartitions.
    ///
    /// Every subpartition counts as an output, but the bytes were produced once.
    pub fn record_broadcast(
        &self,
        partition: ResultPartitionId,
        buffers: u64,
        bytes: u64,
        num_subpartitions: u64,
    ) {
        self.num_buffers_out
            .fetch_add(buffers * num_subpartitions, Ordering::Relaxed);
        self.num_bytes_out
            .fetch_add(bytes * num_subpartitions, Ordering::Relaxed);
        *self.bytes_produced.entry(partition).or_insert(0) += bytes;
    }

    pub fn num_buffers_out(&self) -> u64 {
        self.num_buffers_out.load(Ordering::Relaxed)
    }

    pub fn num_bytes_out(&self) -> u64 {
        self.num_bytes_out.load(Ordering::Relaxed)
    }

    /// Bytes produced by one partition, zero if it never wrote anything.
    pub fn bytes_produced(&self, partition: &ResultPartitionId) -> u64 {
        self.bytes_produced.get(partition).map_or(0, |v| *v)
    }

    pub fn snapshot(&self) -> IoMetricsSnapshot {
        IoMetricsSnapshot {
            num_buffers_out: self.num_buffers_out(),
            num_bytes_out: self.num_bytes_out(),
            bytes_produced: self
                .bytes_produced
                .iter()
                .map(|entry| (entry.key().to_string(), *entry.value()))
                .collect(),
        }
    }
}

impl IoMetricsSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_counts_outputs_per_subpartition() {
        let metrics = IoMetrics::new();
        let id = ResultPartitionId::new(1, 0);

        metrics.record_emit(id, 1, 1024);
        metrics.record_broadcast(id, 1, 1024, 2);

        assert_eq!(metrics.num_buffers_out(), 3);
        assert_eq!(metrics.num_bytes_out(), 3 * 1024);
        assert_eq!(metrics.bytes_produced(&id), 2 * 1024);
        assert_eq!(metrics.bytes_produced(&ResultPartitionId::new(1, 1)), 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = IoMetrics::new();
        let id = ResultPartitionId::new(7, 3);
        metrics.record_emit(id, 2, 10);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.bytes_produced.get(&id.to_string()), Some(&10));

        let json = snapshot.to_json().unwrap();
        let parsed: IoMetricsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snapshot);
    }
}
