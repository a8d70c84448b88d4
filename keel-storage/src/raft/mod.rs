// Raft consensus: log, RPC shapes, command pipeline and node behavior
pub mod command;
mod election;
pub mod hard_state;
pub mod log;
pub mod node;
mod pipeline;
pub mod register;
mod replication;
pub mod rpc;
pub mod timer;

pub use command::{Command, CommandExecutionResult, CommandPayload, CommandRegistry};
pub use hard_state::{FileHardStateStorage, HardState, HardStateStorage, MemHardStateStorage};
pub use log::{EntryPayload, LogEntry, RaftLog};
pub use node::{Bootstrap, NodeRole, RaftNode};
pub use register::{CommandRegister, PendingCommand};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RaftTransport, RequestVoteRequest,
    RequestVoteResponse,
};
