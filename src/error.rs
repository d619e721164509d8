//! Error types for hybrid-shuffle.

use std::path::PathBuf;
use thiserror::Error;

use crate::partition::{PartitionState, ResultPartitionId};

/// Result type alias for hybrid-shuffle operations.
pub type Result<T> = std::result::Result<T, ShuffleError>;

/// Main error type for hybrid-shuffle operations.
#[derive(Error, Debug)]
pub enum ShuffleError {
    #[error("Cannot {operation} result partition in state {state}")]
    IllegalState {
        operation: &'static str,
        state: PartitionState,
    },

    #[error("Subpartition index {index} out of range [0, {num_subpartitions})")]
    SubpartitionOutOfRange {
        index: usize,
        num_subpartitions: usize,
    },

    #[error("A view has already been created for subpartition {subpartition}")]
    ViewAlreadyCreated { subpartition: usize },

    #[error("Result partition owning subpartition {subpartition} has been released")]
    PartitionReleased { subpartition: usize },

    #[error("Buffer pool has been destroyed")]
    BufferPoolDestroyed,

    #[error("Insufficient segments: required {required}, available {available}")]
    InsufficientSegments { required: usize, available: usize },

    #[error("Failed to read buffer {sequence} of subpartition {subpartition}: {details}")]
    ReadFailed {
        subpartition: usize,
        sequence: u64,
        details: String,
    },

    #[error("Result partition {id} is already registered")]
    PartitionAlreadyRegistered { id: ResultPartitionId },

    #[error("Result partition {id} not found")]
    PartitionNotFound { id: ResultPartitionId },

    #[error("Event of {size} bytes does not fit a buffer of {limit} bytes")]
    EventTooLarge { size: usize, limit: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Data corruption detected: {0}")]
    DataCorruption(String),

    #[error("IO error at path {path:?}: {source}")]
    IoWithPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bincode serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Channel send error for {channel}")]
    ChannelSend { channel: String },

    #[error("IO executor has been shut down")]
    ExecutorShutDown,
}

impl<T> From<crossbeam_channel::SendError<T>> for ShuffleError {
    fn from(err: crossbeam_channel::SendError<T>) -> Self {
        ShuffleError::ChannelSend {
            channel: format!("{:?}", err),
        }
    }
}

impl ShuffleError {
    /// Returns true for misuse errors raised against a partition in the wrong lifecycle state.
    pub fn is_illegal_state(&self) -> bool {
        matches!(
            self,
            ShuffleError::IllegalState { .. } | ShuffleError::PartitionReleased { .. }
        )
    }
}
