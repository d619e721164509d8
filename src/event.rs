//! Control events carried in event buffers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::buffer::{Buffer, DataType};

/// A control event broadcast to every subpartition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShuffleEvent {
    /// Terminal event; always the last buffer of a subpartition.
    EndOfPartition,
    /// The producer has emitted all of its records but has not finished yet.
    EndOfData,
    /// Opaque caller-defined payload.
    Custom(Vec<u8>),
}

impl ShuffleEvent {
    /// Serializes the event into an unpooled payload.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    /// Deserializes an event payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Decodes the event held by an event buffer.
    pub fn from_buffer(buffer: &Buffer) -> Result<Self> {
        Self::from_bytes(buffer.as_slice())
    }

    /// Serializes the event into an event buffer.
    pub(crate) fn to_buffer(&self) -> Result<Buffer> {
        Ok(Buffer::new(self.to_bytes()?, DataType::EventBuffer))
    }

    pub fn is_end_of_partition(&self) -> bool {
        matches!(self, ShuffleEvent::EndOfPartition)
    }
}
