use super::node::{NodeInner, NodeRole};
use super::pipeline::ScheduleRequest;
use super::rpc::{AppendEntriesRequest, AppendEntriesResponse};
use keel_common::types::{NodeId, Term};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::debug;

impl NodeInner {
    /// Starts one replication loop per peer and queues the term's noop.
    pub(crate) fn start_leading(self: &Arc<Self>, term: Term) {
        for peer in self.peers.iter().copied() {
            tokio::spawn(Arc::clone(self).replicate_to(peer, term));
        }

        match self.schedule_tx.try_send(ScheduleRequest::Noop { term }) {
            Ok(()) => {}
            Err(TrySendError::Full(noop)) => {
                let node = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = node.schedule_tx.send(noop).await;
                });
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Sends heartbeats and entries to `peer` for as long as this node leads
    /// in `term`.
    async fn replicate_to(self: Arc<Self>, peer: NodeId, term: Term) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut send_now = true;
        loop {
            if !send_now {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = heartbeat.tick() => {}
                    _ = self.replicate_notify.notified() => {}
                }
            }

            let Some(request) = self.append_request_for(peer, term) else {
                break;
            };
            send_now = match self.transport.append_entries(peer, request.clone()).await {
                Ok(response) => self.on_append_response(peer, term, &request, response),
                Err(e) => {
                    debug!(node = %self.id, %peer, error = %e, "append entries failed");
                    false
                }
            };
        }
        debug!(node = %self.id, %peer, term, "replication stopped");
    }

    fn append_request_for(&self, peer: NodeId, term: Term) -> Option<AppendEntriesRequest> {
        let st = self.state.lock();
        if st.role != NodeRole::Leader || st.current_term != term {
            return None;
        }

        let next = st
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(st.log.last_index() + 1)
            .clamp(1, st.log.last_index() + 1);
        let prev_log_index = next - 1;
        Some(AppendEntriesRequest {
            term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: st.log.term_at(prev_log_index).unwrap_or(0),
            entries: st.log.entries_from(next, self.config.max_append_batch),
            leader_commit: st.commit_index,
        })
    }

    /// Returns true if `peer` should be sent to again right away.
    fn on_append_response(
        self: &Arc<Self>,
        peer: NodeId,
        term: Term,
        request: &AppendEntriesRequest,
        response: AppendEntriesResponse,
    ) -> bool {
        let mut st = self.state.lock();
        if response.term > st.current_term {
            self.step_down(&mut st, response.term, None);
            let _ = self.persist_or_halt(&mut st);
            return false;
        }
        if st.role != NodeRole::Leader || st.current_term != term {
            return false;
        }

        if response.success {
            let replicated = request.prev_log_index + request.entries.len() as u64;
            let matched = st.match_index.entry(peer).or_insert(0);
            *matched = (*matched).max(replicated);
            let matched = *matched;

            let next = st.next_index.entry(peer).or_insert(1);
            *next = (*next).max(matched + 1);
            self.advance_commit(&mut st);
            matched < st.log.last_index()
        } else {
            // step back past the mismatched entry and try again
            let retry = request.prev_log_index.max(1);
            let next = st.next_index.entry(peer).or_insert(1);
            if retry < *next {
                *next = retry;
            }
            debug!(
                node = %self.id,
                %peer,
                next_index = *next,
                "follower rejected append, backing off"
            );
            request.prev_log_index > 0
        }
    }
}
