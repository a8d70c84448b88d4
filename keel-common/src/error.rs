use crate::types::{LogIndex, NodeId, Term};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeelError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Encoding Error: {0}")]
    Encode(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    /// The caller supplied something that can never be valid.
    #[error("Validation Error: {0}")]
    Validation(String),

    /// Client commands are only accepted by the leader.
    #[error("Not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    /// The journal could not durably store a block. Fatal to the node.
    #[error("Durability Error: {0}")]
    Durability(String),

    #[error("Corrupted journal block at segment {segment} offset {offset}: {cause}")]
    Corruption {
        segment: u64,
        offset: u64,
        cause: String,
    },

    #[error("Decompression Error: {0}")]
    Decompress(String),

    /// A journal frame failed its header or checksum check.
    #[error("Invalid journal block: {0}")]
    InvalidBlock(String),

    /// A committed entry could not be decoded while applying it.
    #[error("Command decode failed at index {index}: {cause}")]
    Serialization { index: LogIndex, cause: String },

    #[error("Unknown command type '{0}'")]
    UnknownCommandType(String),

    #[error("Command handler failed: {0}")]
    CommandFailed(String),

    /// The command's log slot belongs to a term that has been superseded.
    #[error("Command at ({term}, {index}) superseded by term {current_term}")]
    StaleTerm {
        term: Term,
        index: LogIndex,
        current_term: Term,
    },

    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Node is shutting down")]
    Shutdown,
}

impl KeelError {
    /// Errors after which the node must stop serving.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KeelError::Durability(_))
    }
}

pub type Result<T> = std::result::Result<T, KeelError>;

impl From<bincode::Error> for KeelError {
    fn from(err: bincode::Error) -> Self {
        KeelError::Encode(format!("Bincode Error: {}", err))
    }
}
