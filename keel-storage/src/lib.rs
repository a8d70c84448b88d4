//! Replicated, crash-durable command log: a Raft node whose entries pass
//! through an ordered schedule/append/apply pipeline backed by a
//! sector-aware write-ahead journal.

pub mod journal;
pub mod raft;

pub use journal::Journal;
pub use raft::{Bootstrap, NodeRole, RaftNode};
