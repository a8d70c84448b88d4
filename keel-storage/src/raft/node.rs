use super::command::{Command, CommandExecutionResult, CommandPayload, CommandRegistry};
use super::hard_state::{HardState, HardStateStorage};
use super::log::{LogEntry, RaftLog};
use super::pipeline::{self, AppendWork, ScheduleRequest};
use super::register::{CommandRegister, CommandScheduled, PendingCommand};
use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RaftTransport, RequestVoteRequest,
    RequestVoteResponse,
};
use super::timer::ElectionTimer;
use crate::journal::Journal;
use keel_common::error::{KeelError, Result};
use keel_common::types::{ClusterConfig, LogIndex, NodeId, Term};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Role of the node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Initial,
    Follower,
    Candidate,
    Leader,
    Final,
}

/// How a starting node leaves `Initial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bootstrap {
    /// Sole member of a new cluster; becomes leader straight away.
    SingleNode,
    /// Member of a cluster that elects its leader by vote.
    Join,
}

/// Everything guarded by the node lock.
#[derive(Debug)]
pub(crate) struct ConsensusState {
    pub role: NodeRole,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub log: RaftLog,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub durable_index: LogIndex, // Highest index known to be in the journal

    pub votes: HashSet<NodeId>,
    pub next_index: HashMap<NodeId, LogIndex>, // For each peer: next entry to send
    pub match_index: HashMap<NodeId, LogIndex>, // For each peer: last index known replicated
}

pub(crate) struct NodeInner {
    pub id: NodeId,
    pub config: ClusterConfig,
    pub peers: Vec<NodeId>,
    pub state: Mutex<ConsensusState>,
    pub register: CommandRegister,
    pub registry: CommandRegistry,
    pub hard_state: Arc<dyn HardStateStorage>,
    pub transport: Arc<dyn RaftTransport>,
    pub timer: ElectionTimer,
    pub timer_task: Mutex<Option<AbortHandle>>,
    pub schedule_tx: mpsc::Sender<ScheduleRequest>,
    pub append_tx: mpsc::Sender<AppendWork>,
    pub apply_notify: Notify,
    pub replicate_notify: Notify,
    /// Bumped whenever `durable_index`, the term or the role changes.
    pub durable_tx: watch::Sender<LogIndex>,
    pub shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A Raft node: controls its own state and participates in consensus.
///
/// Cheap to clone; every clone drives the same node.
#[derive(Clone)]
pub struct RaftNode {
    inner: Arc<NodeInner>,
}

impl RaftNode {
    /// Recovers the node from `journal` and `hard_state`, spawns the pipeline
    /// stages and leaves `Initial` as `bootstrap` says. Must be called from
    /// within a Tokio runtime.
    pub fn start(
        config: ClusterConfig,
        journal: Journal,
        hard_state: Arc<dyn HardStateStorage>,
        registry: CommandRegistry,
        transport: Arc<dyn RaftTransport>,
        bootstrap: Bootstrap,
    ) -> Result<Self> {
        config.validate()?;
        let saved = hard_state.load()?.unwrap_or_default();
        let log = RaftLog::recover(&journal.reader())?;
        let last_applied = saved.last_applied.min(log.last_index());
        info!(
            node = %config.node_id,
            term = saved.current_term,
            last_index = log.last_index(),
            last_applied,
            "recovered node state"
        );

        let (schedule_tx, schedule_rx) = mpsc::channel(config.pipeline_capacity);
        let (append_tx, append_rx) = mpsc::channel(config.pipeline_capacity);
        let (shutdown_tx, _) = watch::channel(false);
        let (durable_tx, _) = watch::channel(log.last_index());

        let state = ConsensusState {
            role: NodeRole::Initial,
            current_term: saved.current_term,
            voted_for: saved.voted_for,
            leader_id: None,
            durable_index: log.last_index(),
            log,
            commit_index: last_applied,
            last_applied,
            votes: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        };
        let inner = Arc::new(NodeInner {
            id: config.node_id,
            peers: config.peers(),
            timer: ElectionTimer::new(config.election_timeout_range()),
            config,
            state: Mutex::new(state),
            register: CommandRegister::new(),
            registry,
            hard_state,
            transport,
            timer_task: Mutex::new(None),
            schedule_tx,
            append_tx,
            apply_notify: Notify::new(),
            replicate_notify: Notify::new(),
            durable_tx,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let append_node = Arc::downgrade(&inner);
        let tasks = vec![
            tokio::spawn(pipeline::schedule_stage(
                inner.clone(),
                schedule_rx,
                inner.shutdown_tx.subscribe(),
            )),
            tokio::task::spawn_blocking(move || {
                pipeline::append_stage(append_node, journal, append_rx)
            }),
            tokio::spawn(pipeline::apply_stage(
                inner.clone(),
                inner.shutdown_tx.subscribe(),
            )),
        ];
        *inner.tasks.lock() = tasks;

        match bootstrap {
            Bootstrap::SingleNode => inner.bootstrap_single()?,
            Bootstrap::Join => inner.join(),
        }
        Ok(Self { inner })
    }

    /// Handles a RequestVote RPC. Any vote or term change is durable before
    /// the response is returned.
    pub async fn request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.inner.handle_request_vote(request)
    }

    /// Handles an AppendEntries RPC. New entries are durable before success
    /// is reported.
    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.inner.handle_append_entries(request).await
    }

    /// Schedules a command and returns its pending result. Fails straight
    /// away with [`KeelError::NotLeader`] unless this node leads.
    pub async fn submit(&self, command: CommandPayload) -> Result<PendingCommand> {
        self.inner.ensure_leader()?;

        let (scheduled, pending) = CommandScheduled::new(command);
        debug!(
            id = %scheduled.id,
            command_type = %scheduled.command.command_type,
            "command submitted"
        );
        if self
            .inner
            .schedule_tx
            .send(ScheduleRequest::Command(scheduled))
            .await
            .is_err()
        {
            return Err(KeelError::Shutdown);
        }
        Ok(pending)
    }

    /// Replicates `command` and waits until it has been applied.
    pub async fn execute<C: Command>(&self, command: &C) -> Result<CommandExecutionResult> {
        self.execute_payload(CommandPayload::encode(command)?).await
    }

    pub async fn execute_payload(&self, command: CommandPayload) -> Result<CommandExecutionResult> {
        self.submit(command).await?.wait().await
    }

    /// Moves to `Final`, fails every pending command and stops the pipeline.
    pub async fn shutdown(&self) {
        self.inner.fail(KeelError::Shutdown);
        let _ = self.inner.append_tx.send(AppendWork::Stop).await;

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(node = %self.inner.id, error = %e, "pipeline stage ended abnormally");
            }
        }
        info!(node = %self.inner.id, "node stopped");
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn role(&self) -> NodeRole {
        self.inner.state.lock().role
    }

    pub fn is_leader(&self) -> bool {
        self.role() == NodeRole::Leader
    }

    pub fn current_term(&self) -> Term {
        self.inner.state.lock().current_term
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.inner.state.lock().leader_id
    }

    pub fn commit_index(&self) -> LogIndex {
        self.inner.state.lock().commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.inner.state.lock().last_applied
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.inner.state.lock().log.last_index()
    }

    pub fn log_term_at(&self, index: LogIndex) -> Option<Term> {
        self.inner.state.lock().log.term_at(index)
    }

    /// Number of commands still waiting for their entry to apply.
    pub fn pending_commands(&self) -> usize {
        self.inner.register.len()
    }
}

impl NodeInner {
    fn bootstrap_single(self: &Arc<Self>) -> Result<()> {
        if !self.peers.is_empty() {
            return Err(KeelError::Config(format!(
                "single node bootstrap with {} peers configured",
                self.peers.len()
            )));
        }

        let term = {
            let mut st = self.state.lock();
            st.current_term += 1;
            st.voted_for = Some(self.id);
            self.persist_or_halt(&mut st)?;
            self.become_leader(&mut st)
        };
        self.start_leading(term);
        Ok(())
    }

    fn join(self: &Arc<Self>) {
        let mut st = self.state.lock();
        st.role = NodeRole::Follower;
        info!(node = %self.id, term = st.current_term, "joined cluster as follower");
        self.reset_election_timer();
    }

    fn ensure_leader(&self) -> Result<()> {
        let st = self.state.lock();
        match st.role {
            NodeRole::Leader => Ok(()),
            NodeRole::Final => Err(KeelError::Shutdown),
            _ => Err(KeelError::NotLeader {
                leader_hint: st.leader_id,
            }),
        }
    }

    fn handle_request_vote(
        self: &Arc<Self>,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let mut st = self.state.lock();
        if st.role == NodeRole::Final {
            return Err(KeelError::Shutdown);
        }

        let mut dirty = false;
        if request.term > st.current_term {
            self.step_down(&mut st, request.term, None);
            dirty = true;
        }

        let granted = request.term == st.current_term
            && st.voted_for.map_or(true, |v| v == request.candidate_id)
            && st
                .log
                .is_up_to_date(request.last_log_index, request.last_log_term);
        if granted && st.voted_for.is_none() {
            st.voted_for = Some(request.candidate_id);
            dirty = true;
        }
        if dirty {
            self.persist_or_halt(&mut st)?;
        }
        if granted {
            self.reset_election_timer();
        }

        debug!(
            node = %self.id,
            candidate = %request.candidate_id,
            term = st.current_term,
            granted,
            "vote requested"
        );
        Ok(RequestVoteResponse {
            term: st.current_term,
            vote_granted: granted,
        })
    }

    async fn handle_append_entries(
        self: &Arc<Self>,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let last_new = request.prev_log_index + request.entries.len() as u64;

        let (work, mut durable_rx) = {
            let mut st = self.state.lock();
            if st.role == NodeRole::Final {
                return Err(KeelError::Shutdown);
            }
            if request.term < st.current_term {
                debug!(
                    node = %self.id,
                    term = request.term,
                    current = st.current_term,
                    "stale append rejected"
                );
                return Ok(reject(st.current_term));
            }

            if request.term > st.current_term || st.role != NodeRole::Follower {
                if st.role == NodeRole::Leader && request.term == st.current_term {
                    warn!(
                        node = %self.id,
                        rival = %request.leader_id,
                        term = request.term,
                        "second leader in term"
                    );
                    return Ok(reject(st.current_term));
                }
                let bumped = request.term > st.current_term;
                self.step_down(&mut st, request.term, Some(request.leader_id));
                if bumped {
                    self.persist_or_halt(&mut st)?;
                }
            } else {
                st.leader_id = Some(request.leader_id);
            }
            self.reset_election_timer();

            if !st.log.matches(request.prev_log_index, request.prev_log_term) {
                debug!(
                    node = %self.id,
                    prev_index = request.prev_log_index,
                    prev_term = request.prev_log_term,
                    "log mismatch"
                );
                return Ok(reject(st.current_term));
            }

            let fresh = self.merge_entries(&mut st, request.entries)?;
            // entries already in the log may still be on their way to disk
            let durable_rx = self.durable_tx.subscribe();
            if fresh.is_empty() {
                (None, durable_rx)
            } else {
                let (done, durable) = oneshot::channel();
                let work = AppendWork::Replicated {
                    entries: fresh,
                    done,
                };
                (Some((work, durable)), durable_rx)
            }
        };

        if let Some((work, durable)) = work {
            self.append_tx
                .send(work)
                .await
                .map_err(|_| KeelError::Shutdown)?;
            durable.await.map_err(|_| KeelError::Shutdown)??;
        }

        loop {
            {
                let mut st = self.state.lock();
                if st.role == NodeRole::Final {
                    return Err(KeelError::Shutdown);
                }
                if st.current_term != request.term {
                    return Ok(reject(st.current_term));
                }
                if st.durable_index >= last_new {
                    self.advance_follower_commit(&mut st, request.leader_commit, last_new);
                    return Ok(AppendEntriesResponse {
                        term: st.current_term,
                        success: true,
                    });
                }
            }
            durable_rx
                .changed()
                .await
                .map_err(|_| KeelError::Shutdown)?;
        }
    }

    /// Adds the entries this log lacks, cutting off a conflicting suffix
    /// first. Returns the entries that were new.
    fn merge_entries(
        &self,
        st: &mut ConsensusState,
        entries: Vec<LogEntry>,
    ) -> Result<Vec<LogEntry>> {
        let mut fresh = Vec::new();
        for entry in entries {
            if fresh.is_empty() {
                match st.log.term_at(entry.index) {
                    Some(term) if term == entry.term => continue,
                    Some(_) => {
                        if entry.index <= st.commit_index {
                            return Err(KeelError::Validation(format!(
                                "leader conflicts with committed entry {}",
                                entry.index
                            )));
                        }
                        let removed = st.log.truncate_from(entry.index);
                        st.durable_index = st.durable_index.min(entry.index - 1);
                        self.durable_tx.send_replace(st.durable_index);
                        warn!(
                            node = %self.id,
                            from = entry.index,
                            removed,
                            "truncated conflicting log suffix"
                        );
                    }
                    None => {}
                }
            }
            st.log.append(entry.clone())?;
            fresh.push(entry);
        }
        Ok(fresh)
    }

    fn advance_follower_commit(
        &self,
        st: &mut ConsensusState,
        leader_commit: LogIndex,
        last_new: LogIndex,
    ) {
        let target = leader_commit.min(last_new);
        if target > st.commit_index {
            st.commit_index = target;
            self.apply_notify.notify_one();
        }
    }

    /// Adopts `term` if it is newer and returns to `Follower`.
    ///
    /// Only a former leader gets a fresh election deadline here; anyone else
    /// keeps the one it had until a vote is granted or a leader is heard.
    pub(crate) fn step_down(
        self: &Arc<Self>,
        st: &mut ConsensusState,
        term: Term,
        leader: Option<NodeId>,
    ) {
        let previous = st.role;
        if previous == NodeRole::Final {
            return;
        }
        if term > st.current_term {
            st.current_term = term;
            st.voted_for = None;
            self.register.on_term_changed(term);
            self.durable_tx.send_replace(st.durable_index);
        }
        st.role = NodeRole::Follower;
        st.leader_id = leader;
        st.votes.clear();
        if previous != NodeRole::Follower {
            info!(node = %self.id, term, from = ?previous, "stepped down to follower");
        }
        if previous == NodeRole::Leader {
            self.reset_election_timer();
        }
    }

    pub(crate) fn become_leader(&self, st: &mut ConsensusState) -> Term {
        st.role = NodeRole::Leader;
        st.leader_id = Some(self.id);
        st.votes.clear();

        let next = st.log.last_index() + 1;
        st.next_index = self.peers.iter().map(|p| (*p, next)).collect();
        st.match_index = self.peers.iter().map(|p| (*p, 0)).collect();
        self.cancel_election_timer();

        info!(node = %self.id, term = st.current_term, "became leader");
        st.current_term
    }

    /// Quorum commit rule: only entries of the current term commit by count.
    pub(crate) fn advance_commit(&self, st: &mut ConsensusState) {
        if st.role != NodeRole::Leader {
            return;
        }

        let mut matched: Vec<LogIndex> = self
            .peers
            .iter()
            .map(|p| st.match_index.get(p).copied().unwrap_or(0))
            .collect();
        matched.push(st.durable_index);
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let majority = (self.peers.len() + 1) / 2;
        let candidate = matched[majority];
        if candidate > st.commit_index && st.log.term_at(candidate) == Some(st.current_term) {
            debug!(node = %self.id, commit_index = candidate, "commit index advanced");
            st.commit_index = candidate;
            self.apply_notify.notify_one();
        }
    }

    pub(crate) fn has_quorum(&self, votes: usize) -> bool {
        votes > (self.peers.len() + 1) / 2
    }

    /// Stage one: stamps the next index and term on a request.
    pub(crate) fn schedule(&self, request: ScheduleRequest) -> Option<LogEntry> {
        let mut st = self.state.lock();
        if st.role != NodeRole::Leader {
            if let ScheduleRequest::Command(scheduled) = request {
                let err = if st.role == NodeRole::Final {
                    KeelError::Shutdown
                } else {
                    KeelError::NotLeader {
                        leader_hint: st.leader_id,
                    }
                };
                scheduled.resolve(Err(err));
            }
            return None;
        }

        let index = st.log.last_index() + 1;
        let term = st.current_term;
        match request {
            ScheduleRequest::Noop { term: noop_term } => {
                if noop_term != term {
                    return None;
                }
                let entry = LogEntry::noop(index, term);
                st.log.append(entry.clone()).ok()?;
                Some(entry)
            }
            ScheduleRequest::Command(mut scheduled) => {
                let entry = LogEntry::command(index, term, scheduled.command.clone());
                if let Err(e) = st.log.append(entry.clone()) {
                    scheduled.resolve(Err(e));
                    return None;
                }
                scheduled.entry = Some(entry.clone());
                self.register.add(term, index, scheduled);
                Some(entry)
            }
        }
    }

    /// Drops entries that no longer sit in the log under the same term.
    pub(crate) fn retain_current(&self, entries: Vec<LogEntry>) -> Vec<LogEntry> {
        let st = self.state.lock();
        if st.role == NodeRole::Final {
            return Vec::new();
        }
        entries
            .into_iter()
            .filter(|e| st.log.term_at(e.index) == Some(e.term))
            .collect()
    }

    /// Stage two finished `written`; moves the durable index along the
    /// contiguous prefix that is still in the log.
    pub(crate) fn on_durable(&self, written: &[LogEntry]) {
        let mut st = self.state.lock();
        let mut durable = st.durable_index;
        for entry in written {
            if entry.index > durable + 1 || st.log.term_at(entry.index) != Some(entry.term) {
                break;
            }
            durable = durable.max(entry.index);
        }
        if durable == st.durable_index {
            return;
        }
        st.durable_index = durable;
        self.durable_tx.send_replace(durable);

        if st.role == NodeRole::Leader {
            self.advance_commit(&mut st);
            self.replicate_notify.notify_waiters();
        }
        self.apply_notify.notify_one();
    }

    /// Next entries stage three may apply.
    pub(crate) fn next_apply_batch(&self) -> Vec<LogEntry> {
        let st = self.state.lock();
        let upto = st.commit_index.min(st.durable_index);
        if st.last_applied >= upto {
            return Vec::new();
        }
        let count = (upto - st.last_applied) as usize;
        st.log
            .entries_from(st.last_applied + 1, count.min(self.config.max_append_batch.max(1)))
    }

    pub(crate) fn mark_applied(&self, index: LogIndex) -> Result<()> {
        let mut st = self.state.lock();
        if index <= st.last_applied {
            return Ok(());
        }
        st.last_applied = index;
        self.persist_or_halt(&mut st)
    }

    fn persist(&self, st: &ConsensusState) -> Result<()> {
        let state = HardState {
            current_term: st.current_term,
            voted_for: st.voted_for,
            last_applied: st.last_applied,
        };
        self.hard_state
            .save(&state)
            .map_err(|e| KeelError::Durability(format!("failed to persist hard state: {}", e)))
    }

    /// Persists hard state; a failure takes the node to `Final`.
    pub(crate) fn persist_or_halt(&self, st: &mut ConsensusState) -> Result<()> {
        if let Err(e) = self.persist(st) {
            error!(node = %self.id, error = %e, "hard state write failed, halting node");
            let cause = e.to_string();
            self.halt(st, || KeelError::Durability(cause.clone()));
            return Err(e);
        }
        Ok(())
    }

    /// Moves to `Final` and fails every pending command with `err`.
    pub(crate) fn fail(&self, err: KeelError) {
        let mut st = self.state.lock();
        let cause = err.to_string();
        let fatal = err.is_fatal();
        self.halt(&mut st, || {
            if fatal {
                KeelError::Durability(cause.clone())
            } else {
                KeelError::Shutdown
            }
        });
    }

    fn halt(&self, st: &mut ConsensusState, make_err: impl Fn() -> KeelError) {
        if st.role == NodeRole::Final {
            return;
        }
        info!(node = %self.id, from = ?st.role, term = st.current_term, "entering final state");
        st.role = NodeRole::Final;
        st.leader_id = None;
        self.cancel_election_timer();
        self.shutdown_tx.send_replace(true);
        self.durable_tx.send_replace(st.durable_index);

        let failed = self.register.fail_all(make_err);
        if failed > 0 {
            debug!(node = %self.id, failed, "failed pending commands");
        }
    }
}

fn reject(term: Term) -> AppendEntriesResponse {
    AppendEntriesResponse {
        term,
        success: false,
    }
}
