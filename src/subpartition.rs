//! Ordered buffer queue of one subpartition.
//!
//! Every appended buffer receives the next sequence number of its
//! subpartition and keeps it while it moves from memory to the spill file and
//! back. The queue always holds a contiguous run of sequence numbers starting
//! at the next one the reader will consume, so delivery order never depends
//! on where a buffer currently lives.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, error};

use crate::buffer::{Buffer, BufferAndBacklog, DataType};
use crate::concurrency::{IoExecutor, IoTask};
use crate::pool::PooledSegment;
use crate::read_pool::ReadBufferPool;
use crate::spill::{SpillFile, SpillRegion};
use crate::strategy::SubpartitionSpillingInfo;
use crate::view::AvailabilityListener;
use crate::{Result, ShuffleError};

enum Load {
    OnDisk,
    Loading,
    Loaded(Buffer),
    Failed(String),
}

enum Entry {
    Resident {
        sequence: u64,
        buffer: Buffer,
    },
    Spilled {
        sequence: u64,
        data_type: DataType,
        load: Load,
    },
}

impl Entry {
    fn sequence(&self) -> u64 {
        match self {
            Entry::Resident { sequence, .. } | Entry::Spilled { sequence, .. } => *sequence,
        }
    }

    fn data_type(&self) -> DataType {
        match self {
            Entry::Resident { buffer, .. } => buffer.data_type(),
            Entry::Spilled { data_type, .. } => *data_type,
        }
    }

    /// True if polling this entry yields a buffer or an error.
    fn is_actionable(&self) -> bool {
        match self {
            Entry::Resident { .. } => true,
            Entry::Spilled { load, .. } => matches!(load, Load::Loaded(_) | Load::Failed(_)),
        }
    }
}

/// What the reader would find at the head of the queue.
enum Front {
    Empty,
    Ready(DataType),
    Pending,
    OnDisk,
    Failed { sequence: u64, details: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ViewState {
    NotCreated,
    Active,
    Released,
}

type ReadOutcome = Option<std::result::Result<Buffer, String>>;

struct State {
    queue: VecDeque<Entry>,
    next_sequence: u64,
    end_of_partition: Option<u64>,
    released: bool,
    view: ViewState,
    listener: Option<Arc<dyn AvailabilityListener>>,
    needs_notify: bool,
}

impl State {
    fn front_sequence(&self) -> u64 {
        self.queue
            .front()
            .map_or(self.next_sequence, Entry::sequence)
    }

    fn entry_mut(&mut self, sequence: u64) -> Option<&mut Entry> {
        let offset = sequence.checked_sub(self.queue.front()?.sequence())?;
        self.queue.get_mut(usize::try_from(offset).ok()?)
    }

    fn front(&self) -> Front {
        match self.queue.front() {
            None => Front::Empty,
            Some(Entry::Resident { buffer, .. }) => Front::Ready(buffer.data_type()),
            Some(Entry::Spilled {
                sequence,
                data_type,
                load,
            }) => match load {
                Load::Loaded(_) => Front::Ready(*data_type),
                Load::Loading => Front::Pending,
                Load::OnDisk => Front::OnDisk,
                Load::Failed(details) => Front::Failed {
                    sequence: *sequence,
                    details: details.clone(),
                },
            },
        }
    }

    /// Pops the head if it is in memory. The flag tells whether it came from disk.
    fn pop_ready(&mut self) -> Option<(u64, Buffer, bool)> {
        let buffer = match self.queue.front()? {
            Entry::Resident { buffer, .. } => buffer.retain(),
            Entry::Spilled {
                load: Load::Loaded(buffer),
                ..
            } => buffer.retain(),
            Entry::Spilled { .. } => return None,
        };
        let entry = self.queue.pop_front()?;
        let from_disk = matches!(entry, Entry::Spilled { .. });
        Some((entry.sequence(), buffer, from_disk))
    }

    /// Hands out the listener once if the reader waits and has something to poll.
    fn take_notification(&mut self) -> Option<Arc<dyn AvailabilityListener>> {
        let actionable = self.queue.front().is_some_and(Entry::is_actionable);
        if self.needs_notify && self.view == ViewState::Active && actionable {
            self.needs_notify = false;
            self.listener.clone()
        } else {
            None
        }
    }
}

pub(crate) struct Subpartition {
    index: usize,
    spill: Arc<SpillFile>,
    read_pool: Arc<ReadBufferPool>,
    state: Mutex<State>,
}

impl Subpartition {
    pub(crate) fn new(index: usize, spill: Arc<SpillFile>, read_pool: Arc<ReadBufferPool>) -> Self {
        Self {
            index,
            spill,
            read_pool,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                next_sequence: 0,
                end_of_partition: None,
                released: false,
                view: ViewState::NotCreated,
                listener: None,
                needs_notify: false,
            }),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Appends a data or event buffer.
    pub(crate) fn append(&self, buffer: Buffer) {
        self.push(buffer, false);
    }

    /// Appends the end-of-partition event. Nothing may follow it.
    pub(crate) fn finish(&self, end_of_partition: Buffer) {
        self.push(end_of_partition, true);
    }

    fn push(&self, buffer: Buffer, end_of_partition: bool) {
        let listener = {
            let mut state = self.state.lock();
            // Nobody will ever read it.
            if state.released || state.view == ViewState::Released {
                return;
            }
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            if end_of_partition {
                state.end_of_partition = Some(sequence);
            }
            state.queue.push_back(Entry::Resident { sequence, buffer });
            state.take_notification()
        };
        notify(listener);
    }

    /// Sequence number the next appended buffer will get.
    pub(crate) fn next_sequence(&self) -> u64 {
        self.state.lock().next_sequence
    }

    /// Takes back the buffers from `sequence` on that the reader has not reached.
    ///
    /// Entries already being loaded for the reader stay, together with
    /// everything in front of them. Returns the number of buffers removed.
    pub(crate) fn discard_from(&self, sequence: u64) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            let mut discarded = Vec::new();
            while let Some(last) = state.queue.back() {
                let reached = matches!(
                    last,
                    Entry::Spilled {
                        load: Load::Loading | Load::Loaded(_) | Load::Failed(_),
                        ..
                    }
                );
                if reached || last.sequence() < sequence {
                    break;
                }
                discarded.extend(state.queue.pop_back());
            }
            if let Some(first) = discarded.last() {
                state.next_sequence = first.sequence();
            }
            discarded
        };

        for entry in &discarded {
            if let Entry::Spilled { sequence, .. } = entry {
                self.spill.remove_region(self.index, *sequence);
            }
        }
        discarded.len()
    }

    /// Buffers not yet delivered to the reader.
    pub(crate) fn backlog(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub(crate) fn num_spilled(&self) -> usize {
        self.state
            .lock()
            .queue
            .iter()
            .filter(|e| matches!(e, Entry::Spilled { .. }))
            .count()
    }

    pub(crate) fn spilling_info(&self) -> SubpartitionSpillingInfo {
        let state = self.state.lock();
        SubpartitionSpillingInfo {
            subpartition: self.index,
            backlog: state.queue.len(),
            next_sequence_to_consume: state.front_sequence(),
            resident: state
                .queue
                .iter()
                .filter_map(|e| match e {
                    Entry::Resident { sequence, .. } => Some(*sequence),
                    Entry::Spilled { .. } => None,
                })
                .collect(),
        }
    }

    /// Takes extra references to the resident buffers within `sequences`.
    pub(crate) fn resident_buffers(&self, sequences: Range<u64>) -> Vec<(u64, Buffer)> {
        let state = self.state.lock();
        if state.released {
            return Vec::new();
        }
        state
            .queue
            .iter()
            .filter_map(|e| match e {
                Entry::Resident { sequence, buffer } if sequences.contains(sequence) => {
                    Some((*sequence, buffer.retain()))
                }
                _ => None,
            })
            .collect()
    }

    /// Swaps written buffers for their spill file location.
    ///
    /// Buffers consumed while they were being written keep nothing on disk.
    /// Returns the number of buffers that left memory.
    pub(crate) fn mark_spilled(&self, sequences: impl IntoIterator<Item = u64>) -> usize {
        let mut state = self.state.lock();
        let mut converted = 0;
        for sequence in sequences {
            match state.entry_mut(sequence) {
                Some(entry) if matches!(entry, Entry::Resident { .. }) => {
                    let data_type = entry.data_type();
                    *entry = Entry::Spilled {
                        sequence,
                        data_type,
                        load: Load::OnDisk,
                    };
                    converted += 1;
                }
                _ => {
                    self.spill.remove_region(self.index, sequence);
                }
            }
        }
        converted
    }

    /// Binds the single reader of this subpartition.
    pub(crate) fn create_view(&self, listener: Arc<dyn AvailabilityListener>) -> Result<()> {
        let listener = {
            let mut state = self.state.lock();
            if state.released {
                return Err(ShuffleError::PartitionReleased {
                    subpartition: self.index,
                });
            }
            if state.view != ViewState::NotCreated {
                return Err(ShuffleError::ViewAlreadyCreated {
                    subpartition: self.index,
                });
            }
            state.view = ViewState::Active;
            state.listener = Some(listener);
            state.needs_notify = true;
            state.take_notification()
        };
        notify(listener);
        Ok(())
    }

    pub(crate) fn is_view_released(&self) -> bool {
        let state = self.state.lock();
        state.released || state.view == ViewState::Released
    }

    /// Polls the head of the queue without blocking.
    ///
    /// A spilled head is fetched on `executor` and `Ok(None)` is returned
    /// until it has been loaded; the listener fires once it is.
    pub(crate) fn get_next_buffer(
        self: &Arc<Self>,
        executor: &IoExecutor,
    ) -> Result<Option<BufferAndBacklog>> {
        let mut state = self.state.lock();
        if state.view == ViewState::Released {
            return Ok(None);
        }
        if state.released {
            return Err(ShuffleError::PartitionReleased {
                subpartition: self.index,
            });
        }

        let mut front = state.front();
        if matches!(front, Front::OnDisk) {
            self.schedule_read(&mut state, executor);
            front = state.front();
        }
        match front {
            Front::Ready(_) => {}
            Front::Failed { sequence, details } => {
                return Err(ShuffleError::ReadFailed {
                    subpartition: self.index,
                    sequence,
                    details,
                });
            }
            Front::Empty | Front::Pending | Front::OnDisk => {
                state.needs_notify = true;
                return Ok(None);
            }
        }

        let Some((sequence, buffer, from_disk)) = state.pop_ready() else {
            return Ok(None);
        };
        if from_disk {
            self.spill.remove_region(self.index, sequence);
        }

        if state.end_of_partition == Some(sequence) {
            debug!(subpartition = self.index, "Delivered end of partition");
            state.view = ViewState::Released;
            state.listener = None;
            state.needs_notify = false;
            return Ok(Some(BufferAndBacklog::new(
                buffer,
                0,
                DataType::None,
                sequence,
            )));
        }

        let next_data_type = match state.front() {
            Front::Ready(data_type) => data_type,
            Front::OnDisk => {
                self.schedule_read(&mut state, executor);
                state.needs_notify = true;
                DataType::None
            }
            _ => {
                state.needs_notify = true;
                DataType::None
            }
        };

        Ok(Some(BufferAndBacklog::new(
            buffer,
            state.queue.len(),
            next_data_type,
            sequence,
        )))
    }

    /// Starts loading the spilled buffers at the head of the queue.
    fn schedule_read(self: &Arc<Self>, state: &mut State, executor: &IoExecutor) {
        let quota = self.read_pool.buffers_per_request();
        let mut requests = Vec::new();

        for entry in state.queue.iter_mut() {
            if requests.len() >= quota {
                break;
            }
            let Entry::Spilled { sequence, load, .. } = entry else {
                break;
            };
            if !matches!(load, Load::OnDisk) {
                break;
            }
            match self.spill.region(self.index, *sequence) {
                Some(region) => {
                    *load = Load::Loading;
                    requests.push((*sequence, region));
                }
                None => {
                    *load = Load::Failed("no spill region indexed".to_string());
                    break;
                }
            }
        }

        if requests.is_empty() {
            return;
        }

        let sequences: Vec<u64> = requests.iter().map(|(sequence, _)| *sequence).collect();
        debug!(
            subpartition = self.index,
            first = sequences[0],
            count = sequences.len(),
            "Scheduling spill read"
        );

        let subpartition = Arc::clone(self);
        let task: IoTask = Box::new(move || subpartition.read_spilled(requests));
        if let Err(e) = executor.submit(task) {
            error!(subpartition = self.index, "Failed to submit spill read: {}", e);
            for sequence in sequences {
                if let Some(Entry::Spilled { load, .. }) = state.entry_mut(sequence) {
                    *load = Load::Failed(e.to_string());
                }
            }
        }
    }

    /// Runs on an I/O thread.
    fn read_spilled(&self, requests: Vec<(u64, SpillRegion)>) {
        if self.is_view_released() {
            return;
        }

        let segments = match self.read_pool.request_buffers(requests.len()) {
            Ok(segments) => segments,
            Err(e) => {
                error!(subpartition = self.index, "Failed to acquire read buffers: {}", e);
                let results = requests
                    .iter()
                    .map(|(sequence, _)| (*sequence, Some(Err(e.to_string()))))
                    .collect();
                self.complete_read(results);
                return;
            }
        };

        let mut segments = segments.into_iter();
        let mut results: Vec<(u64, ReadOutcome)> = Vec::with_capacity(requests.len());
        for (sequence, region) in requests {
            let Some(segment) = segments.next() else {
                results.push((sequence, None));
                continue;
            };
            let outcome = self.read_region(&region, segment).map_err(|e| {
                error!(
                    subpartition = self.index,
                    sequence, "Failed to read spilled buffer: {}", e
                );
                e.to_string()
            });
            results.push((sequence, Some(outcome)));
        }

        self.complete_read(results);
    }

    fn read_region(&self, region: &SpillRegion, mut segment: PooledSegment) -> Result<Buffer> {
        let dst = segment.fill(region.length).ok_or_else(|| {
            ShuffleError::DataCorruption(format!(
                "spilled buffer of {} bytes does not fit a read buffer",
                region.length
            ))
        })?;
        self.spill.read(region, dst)?;
        Ok(Buffer::new(segment.freeze(), region.data_type))
    }

    /// Publishes read results. Buffers nobody will consume are recycled on drop.
    fn complete_read(&self, results: Vec<(u64, ReadOutcome)>) {
        let listener = {
            let mut state = self.state.lock();
            if state.released || state.view == ViewState::Released {
                return;
            }
            for (sequence, outcome) in results {
                let Some(Entry::Spilled { load, .. }) = state.entry_mut(sequence) else {
                    continue;
                };
                if !matches!(load, Load::Loading) {
                    continue;
                }
                *load = match outcome {
                    Some(Ok(buffer)) => Load::Loaded(buffer),
                    Some(Err(details)) => Load::Failed(details),
                    None => Load::OnDisk,
                };
            }
            state.take_notification()
        };
        notify(listener);
    }

    /// Detaches the reader and discards everything it did not consume.
    pub(crate) fn release_view(&self) {
        let drained = {
            let mut state = self.state.lock();
            if state.view == ViewState::Released {
                return;
            }
            state.view = ViewState::Released;
            state.listener = None;
            state.needs_notify = false;
            std::mem::take(&mut state.queue)
        };
        self.spill.remove_subpartition(self.index);
        drop(drained);
    }

    /// Drops all buffers and wakes the reader so it observes the release.
    pub(crate) fn release(&self) {
        let (drained, listener) = {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            state.released = true;
            state.needs_notify = false;
            let listener = match state.view {
                ViewState::Active => state.listener.take(),
                _ => None,
            };
            (std::mem::take(&mut state.queue), listener)
        };
        self.spill.remove_subpartition(self.index);
        drop(drained);
        notify(listener);
    }
}

fn notify(listener: Option<Arc<dyn AvailabilityListener>>) {
    if let Some(listener) = listener {
        listener.notify_data_available();
    }
}
