use super::node::{NodeInner, NodeRole};
use super::rpc::{RequestVoteRequest, RequestVoteResponse};
use keel_common::types::{NodeId, Term};
use std::sync::Arc;
use tracing::{debug, info};

impl NodeInner {
    /// Cancels the pending election deadline and schedules a new one.
    pub(crate) fn reset_election_timer(self: &Arc<Self>) {
        let deadline = self.timer.rearm();
        let node = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(deadline.duration).await;
            node.on_election_timeout(deadline.generation);
        });

        if let Some(previous) = self.timer_task.lock().replace(task.abort_handle()) {
            previous.abort();
        }
    }

    pub(crate) fn cancel_election_timer(&self) {
        self.timer.disarm();
        if let Some(task) = self.timer_task.lock().take() {
            task.abort();
        }
    }

    /// Follower → Candidate. A timer whose generation was superseded does nothing.
    fn on_election_timeout(self: &Arc<Self>, generation: u64) {
        let request = {
            let mut st = self.state.lock();
            if !self.timer.fire(generation) {
                return;
            }
            if !matches!(st.role, NodeRole::Follower | NodeRole::Candidate) {
                return;
            }

            st.current_term += 1;
            st.role = NodeRole::Candidate;
            st.voted_for = Some(self.id);
            st.leader_id = None;
            st.votes.clear();
            st.votes.insert(self.id);
            self.register.on_term_changed(st.current_term);
            if self.persist_or_halt(&mut st).is_err() {
                return;
            }
            info!(node = %self.id, term = st.current_term, "election timeout, starting election");

            if self.has_quorum(st.votes.len()) {
                let term = self.become_leader(&mut st);
                drop(st);
                self.start_leading(term);
                return;
            }

            // split votes end in another timeout
            self.reset_election_timer();
            RequestVoteRequest {
                term: st.current_term,
                candidate_id: self.id,
                last_log_index: st.log.last_index(),
                last_log_term: st.log.last_term(),
            }
        };

        for peer in self.peers.iter().copied() {
            let node = Arc::clone(self);
            let request = request.clone();
            tokio::spawn(async move {
                let term = request.term;
                match node.transport.request_vote(peer, request).await {
                    Ok(response) => node.on_vote_response(peer, term, response),
                    Err(e) => debug!(node = %node.id, %peer, error = %e, "vote request failed"),
                }
            });
        }
    }

    /// Candidate → Leader once a strict majority voted in `term`.
    fn on_vote_response(self: &Arc<Self>, peer: NodeId, term: Term, response: RequestVoteResponse) {
        let mut st = self.state.lock();
        if response.term > st.current_term {
            self.step_down(&mut st, response.term, None);
            let _ = self.persist_or_halt(&mut st);
            return;
        }
        if st.role != NodeRole::Candidate || st.current_term != term || !response.vote_granted {
            return;
        }

        st.votes.insert(peer);
        debug!(node = %self.id, %peer, term, votes = st.votes.len(), "vote received");
        if self.has_quorum(st.votes.len()) {
            let term = self.become_leader(&mut st);
            drop(st);
            self.start_leading(term);
        }
    }
}
