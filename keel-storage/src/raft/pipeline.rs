//! The three ordered stages every log entry passes through:
//! schedule (leader only), durable append, then apply.
//!
//! Each stage is a single consumer, so entries leave a stage in the order
//! they entered it. Apply never runs past the durable index, so nothing is
//! applied before the journal holds it.

use super::command::CommandExecutionResult;
use super::log::{EntryPayload, LogEntry};
use super::node::NodeInner;
use super::register::CommandScheduled;
use crate::journal::Journal;
use keel_common::error::{KeelError, Result};
use keel_common::types::Term;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, trace, warn};

/// Work for the schedule stage.
#[derive(Debug)]
pub(crate) enum ScheduleRequest {
    Command(CommandScheduled),
    /// Written by a new leader so entries of earlier terms can commit.
    Noop { term: Term },
}

/// Work for the durable append stage.
#[derive(Debug)]
pub(crate) enum AppendWork {
    /// An entry the leader scheduled itself.
    Local(LogEntry),
    /// Entries received from the leader; `done` fires once they are durable.
    Replicated {
        entries: Vec<LogEntry>,
        done: oneshot::Sender<Result<()>>,
    },
    Stop,
}

pub(crate) async fn schedule_stage(
    node: Arc<NodeInner>,
    mut requests: mpsc::Receiver<ScheduleRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        let request = tokio::select! {
            _ = shutdown.changed() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let Some(entry) = node.schedule(request) else {
            continue;
        };
        trace!(index = entry.index, term = entry.term, "entry scheduled");
        if node.append_tx.send(AppendWork::Local(entry)).await.is_err() {
            break;
        }
    }
    debug!(node = %node.id, "schedule stage stopped");
}

/// Owns the journal. Runs on a blocking thread since every write may wait on
/// the device.
///
/// Holds the node weakly: once every handle and task is gone the work
/// channel closes and this thread exits.
pub(crate) fn append_stage(
    node: Weak<NodeInner>,
    mut journal: Journal,
    mut work: mpsc::Receiver<AppendWork>,
) {
    let Some((id, max_batch)) = node
        .upgrade()
        .map(|n| (n.id, n.config.max_append_batch.max(1)))
    else {
        return;
    };

    while let Some(first) = work.blocking_recv() {
        let mut batch = vec![first];
        while batch.len() < max_batch {
            match work.try_recv() {
                Ok(next) => batch.push(next),
                Err(_) => break,
            }
        }

        let mut stop = false;
        let mut entries = Vec::new();
        let mut acks = Vec::new();
        for item in batch {
            match item {
                AppendWork::Local(entry) => entries.push(entry),
                AppendWork::Replicated { entries: replicated, done } => {
                    entries.extend(replicated);
                    acks.push(done);
                }
                AppendWork::Stop => stop = true,
            }
        }

        let Some(node) = node.upgrade() else {
            break;
        };
        match write_durable(&node, &mut journal, entries) {
            Ok(()) => {
                for ack in acks {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(e) => {
                error!(node = %id, error = %e, "durable append failed, halting node");
                let cause = e.to_string();
                for ack in acks {
                    let _ = ack.send(Err(KeelError::Durability(cause.clone())));
                }
                node.fail(KeelError::Durability(cause));
                stop = true;
            }
        }

        if stop {
            break;
        }
    }
    debug!(node = %id, "append stage stopped");
}

fn write_durable(node: &NodeInner, journal: &mut Journal, entries: Vec<LogEntry>) -> Result<()> {
    // entries truncated away while queued must not reach the journal
    let entries = node.retain_current(entries);
    if entries.is_empty() {
        return Ok(());
    }

    let blocks = entries
        .iter()
        .map(LogEntry::encode)
        .collect::<Result<Vec<_>>>()?;
    journal.write_blocks(&blocks)?;

    trace!(
        first = entries[0].index,
        count = entries.len(),
        "entries durable"
    );
    node.on_durable(&entries);
    Ok(())
}

pub(crate) async fn apply_stage(node: Arc<NodeInner>, mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = node.apply_notify.notified() => {}
        }

        if let Err(e) = apply_committed(&node) {
            error!(node = %node.id, error = %e, "apply stage failed, halting node");
            node.fail(e);
            break;
        }
    }
    debug!(node = %node.id, "apply stage stopped");
}

/// Applies everything that is both committed and durable, in index order.
fn apply_committed(node: &NodeInner) -> Result<()> {
    loop {
        let batch = node.next_apply_batch();
        let Some(last) = batch.last().map(|e| e.index) else {
            return Ok(());
        };

        let mut completions = Vec::new();
        for entry in &batch {
            if let Some(done) = apply_entry(node, entry) {
                completions.push(done);
            }
        }

        // callers only hear back once the applied marker is durable
        node.mark_applied(last)?;
        for (row, result) in completions {
            row.resolve(result);
        }
    }
}

type Completion = (CommandScheduled, Result<CommandExecutionResult>);

fn apply_entry(node: &NodeInner, entry: &LogEntry) -> Option<Completion> {
    let outcome = match &entry.payload {
        EntryPayload::Noop => None,
        EntryPayload::Command(command) => Some(node.registry.dispatch(entry.index, command)),
    };
    trace!(index = entry.index, term = entry.term, "entry applied");

    // no row means no local caller: a follower, or a purged term
    let Some(row) = node.register.take(entry.term, entry.index) else {
        if let Some(Err(e)) = outcome {
            warn!(
                index = entry.index,
                term = entry.term,
                error = %e,
                "committed entry failed to apply"
            );
        }
        return None;
    };

    let result = outcome.unwrap_or_else(|| Ok(Vec::new())).map(|output| CommandExecutionResult {
        id: row.id,
        index: entry.index,
        term: entry.term,
        output,
    });
    Some((row, result))
}
