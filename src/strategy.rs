//! Spilling decisions.
//!
//! A strategy is a pure function from a snapshot of write-pool usage and
//! per-subpartition occupancy to the buffers that should move to disk now.
//! It never sees buffers already handed to a reader, so it cannot spill
//! anything a view is consuming.

use std::ops::Range;
use tracing::debug;

use crate::config::{HybridShuffleConfig, SpillOrder, SpillingStrategyType};

/// Occupancy of one subpartition at decision time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubpartitionSpillingInfo {
    pub subpartition: usize,
    /// Buffers not yet delivered to the reader, resident or spilled.
    pub backlog: usize,
    /// Sequence number the reader will consume next.
    pub next_sequence_to_consume: u64,
    /// Sequence numbers of buffers still held in memory, ascending.
    pub resident: Vec<u64>,
}

/// Snapshot handed to [`SpillingStrategy::decide`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpillingInfo {
    /// Capacity of the write pool.
    pub pool_size: usize,
    /// Segments of the write pool currently in use.
    pub num_requested_buffers: usize,
    pub subpartitions: Vec<SubpartitionSpillingInfo>,
}

/// A run of consecutive buffers of one subpartition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillRange {
    pub subpartition: usize,
    pub sequences: Range<u64>,
}

/// Buffers to spill, in the order they should be written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decision {
    pub to_spill: Vec<SpillRange>,
}

impl Decision {
    pub const NO_ACTION: Decision = Decision {
        to_spill: Vec::new(),
    };

    pub fn is_empty(&self) -> bool {
        self.to_spill.is_empty()
    }

    /// Total number of buffers covered by the decision.
    pub fn num_buffers(&self) -> u64 {
        self.to_spill
            .iter()
            .map(|r| r.sequences.end - r.sequences.start)
            .sum()
    }
}

/// Spills whole subpartitions once usage reaches a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullSpillingStrategy {
    trigger: usize,
    release_target: usize,
    order: SpillOrder,
}

/// Spills the buffers farthest away from each reader's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectiveSpillingStrategy {
    threshold: usize,
    spill_count: usize,
}

/// The closed set of spilling strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpillingStrategy {
    Full(FullSpillingStrategy),
    Selective(SelectiveSpillingStrategy),
}

impl SpillingStrategy {
    /// Resolves the configured ratios against a write pool of `pool_size` buffers.
    pub fn from_config(config: &HybridShuffleConfig, pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        match config.spilling_strategy {
            SpillingStrategyType::Full => {
                let trigger = config
                    .full_strategy_num_buffers_trigger_spilling
                    .unwrap_or_else(|| share(pool_size, config.full_strategy_trigger_ratio))
                    .min(pool_size)
                    .max(1);
                let release_target = ((pool_size as f64 * config.full_strategy_release_ratio)
                    .floor() as usize)
                    .min(trigger - 1);
                SpillingStrategy::Full(FullSpillingStrategy {
                    trigger,
                    release_target,
                    order: config.full_strategy_spill_order,
                })
            }
            SpillingStrategyType::Selective => {
                SpillingStrategy::Selective(SelectiveSpillingStrategy {
                    threshold: share(pool_size, config.selective_strategy_spill_threshold_ratio)
                        .max(1),
                    spill_count: ((pool_size as f64
                        * config.selective_strategy_spill_buffer_ratio)
                        .floor() as usize)
                        .max(1),
                })
            }
        }
    }

    /// Cheap pre-check; a snapshot is only worth building when this is true.
    pub fn should_evaluate(&self, num_requested_buffers: usize) -> bool {
        match self {
            SpillingStrategy::Full(full) => num_requested_buffers >= full.trigger,
            SpillingStrategy::Selective(selective) => {
                num_requested_buffers >= selective.threshold
            }
        }
    }

    /// Decides which buffers to spill now.
    pub fn decide(&self, info: &SpillingInfo) -> Decision {
        if !self.should_evaluate(info.num_requested_buffers) {
            return Decision::NO_ACTION;
        }

        let decision = match self {
            SpillingStrategy::Full(full) => full.decide(info),
            SpillingStrategy::Selective(selective) => selective.decide(info),
        };

        if !decision.is_empty() {
            debug!(
                num_requested = info.num_requested_buffers,
                pool_size = info.pool_size,
                buffers = decision.num_buffers(),
                ranges = decision.to_spill.len(),
                "Spilling decision"
            );
        }
        decision
    }
}

impl FullSpillingStrategy {
    fn decide(&self, info: &SpillingInfo) -> Decision {
        let need = info.num_requested_buffers.saturating_sub(self.release_target);

        let mut candidates: Vec<&SubpartitionSpillingInfo> = info
            .subpartitions
            .iter()
            .filter(|s| !s.resident.is_empty())
            .collect();

        match self.order {
            SpillOrder::MostBacklogFirst => candidates.sort_by(|a, b| {
                b.backlog
                    .cmp(&a.backlog)
                    .then(a.subpartition.cmp(&b.subpartition))
            }),
            SpillOrder::MostResidentFirst => candidates.sort_by(|a, b| {
                b.resident
                    .len()
                    .cmp(&a.resident.len())
                    .then(a.subpartition.cmp(&b.subpartition))
            }),
            SpillOrder::IndexOrder => candidates.sort_by_key(|s| s.subpartition),
        }

        let mut to_spill = Vec::new();
        let mut planned = 0;
        for candidate in candidates {
            if planned >= need {
                break;
            }
            to_spill.extend(contiguous_ranges(candidate.subpartition, &candidate.resident));
            planned += candidate.resident.len();
        }

        Decision { to_spill }
    }
}

impl SelectiveSpillingStrategy {
    fn decide(&self, info: &SpillingInfo) -> Decision {
        // (distance from reader, subpartition, sequence)
        let mut candidates: Vec<(u64, usize, u64)> = info
            .subpartitions
            .iter()
            .flat_map(|s| {
                s.resident.iter().map(move |&seq| {
                    (
                        seq.saturating_sub(s.next_sequence_to_consume),
                        s.subpartition,
                        seq,
                    )
                })
            })
            .collect();

        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        candidates.truncate(self.spill_count);

        let mut per_subpartition: Vec<(usize, u64)> =
            candidates.into_iter().map(|(_, s, seq)| (s, seq)).collect();
        per_subpartition.sort_unstable();

        let mut to_spill = Vec::new();
        let mut start = 0;
        while start < per_subpartition.len() {
            let subpartition = per_subpartition[start].0;
            let mut end = start;
            while end < per_subpartition.len() && per_subpartition[end].0 == subpartition {
                end += 1;
            }
            let seqs: Vec<u64> = per_subpartition[start..end]
                .iter()
                .map(|&(_, seq)| seq)
                .collect();
            to_spill.extend(contiguous_ranges(subpartition, &seqs));
            start = end;
        }

        Decision { to_spill }
    }
}

fn share(pool_size: usize, ratio: f64) -> usize {
    (pool_size as f64 * ratio).ceil() as usize
}

/// Groups ascending sequence numbers into runs of consecutive values.
fn contiguous_ranges(subpartition: usize, sequences: &[u64]) -> Vec<SpillRange> {
    let mut ranges: Vec<SpillRange> = Vec::new();
    for &seq in sequences {
        match ranges.last_mut() {
            Some(last) if last.sequences.end == seq => last.sequences.end = seq + 1,
            _ => ranges.push(SpillRange {
                subpartition,
                sequences: seq..seq + 1,
            }),
        }
    }
    ranges
}
