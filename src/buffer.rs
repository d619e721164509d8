//! Buffers handed between the producer, subpartition queues and readers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag carried by every buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Nothing is currently available.
    None,
    /// Serialized user records.
    DataBuffer,
    /// Serialized control event such as end-of-partition.
    EventBuffer,
}

impl DataType {
    /// Returns true for record data.
    pub fn is_buffer(self) -> bool {
        self == DataType::DataBuffer
    }

    /// Returns true for control events.
    pub fn is_event(self) -> bool {
        self == DataType::EventBuffer
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::None => "NONE",
            DataType::DataBuffer => "DATA_BUFFER",
            DataType::EventBuffer => "EVENT_BUFFER",
        };
        f.write_str(name)
    }
}

/// An immutable byte range tagged with its [`DataType`].
///
/// The payload is reference counted. Pooled payloads go back to the pool they
/// came from when the last holder drops its `Buffer`, so recycling happens
/// exactly once without any explicit release call.
pub struct Buffer {
    data: Bytes,
    data_type: DataType,
}

impl Buffer {
    /// Wraps a payload.
    pub fn new(data: Bytes, data_type: DataType) -> Self {
        Self { data, data_type }
    }

    /// Gets the data type.
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Returns true if this buffer carries record data.
    pub fn is_buffer(&self) -> bool {
        self.data_type.is_buffer()
    }

    /// Number of readable bytes.
    pub fn readable_bytes(&self) -> usize {
        self.data.len()
    }

    /// Gets the readable bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the buffer and returns its payload.
    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    /// Takes another shared reference to the same payload.
    pub(crate) fn retain(&self) -> Buffer {
        Buffer {
            data: self.data.clone(),
            data_type: self.data_type,
        }
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("data_type", &self.data_type)
            .field("readable_bytes", &self.data.len())
            .finish()
    }
}

/// A buffer returned by a view together with the reader-side bookkeeping.
#[derive(Debug)]
pub struct BufferAndBacklog {
    buffer: Buffer,
    buffers_in_backlog: usize,
    next_data_type: DataType,
    sequence_number: u64,
}

impl BufferAndBacklog {
    pub(crate) fn new(
        buffer: Buffer,
        buffers_in_backlog: usize,
        next_data_type: DataType,
        sequence_number: u64,
    ) -> Self {
        Self {
            buffer,
            buffers_in_backlog,
            next_data_type,
            sequence_number,
        }
    }

    /// Gets the buffer.
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Consumes self and returns the buffer.
    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }

    /// Buffers still queued in the subpartition after this one.
    pub fn buffers_in_backlog(&self) -> usize {
        self.buffers_in_backlog
    }

    /// Data type of the following buffer, or [`DataType::None`] if it is not ready yet.
    pub fn next_data_type(&self) -> DataType {
        self.next_data_type
    }

    /// Position of this buffer within its subpartition.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }
}
