use super::log::LogEntry;
use async_trait::async_trait;
use keel_common::error::Result;
use keel_common::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// Sent by leader to replicate log entries or as heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,                // Leader’s term
    pub leader_id: NodeId,         // Leader's ID
    pub prev_log_index: LogIndex,  // Index of log entry before new ones
    pub prev_log_term: Term,       // Term of that entry
    pub entries: Vec<LogEntry>,    // New log entries to store
    pub leader_commit: LogIndex,   // Leader’s commit index
}

/// Response from follower to AppendEntries RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,    // Current term (may be newer)
    pub success: bool, // True if follower appended entries
}

/// RequestVote RPC: Candidate → Peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Response to RequestVote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Carries RPCs to other members. The binding to an actual network lives
/// outside this crate.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;
}
