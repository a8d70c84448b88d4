use super::command::{CommandExecutionResult, CommandPayload};
use super::log::LogEntry;
use dashmap::DashMap;
use keel_common::error::{KeelError, Result};
use keel_common::types::{CommandId, LogIndex, Term};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A client command waiting for its log entry to be applied.
#[derive(Debug)]
pub struct CommandScheduled {
    pub id: CommandId,
    pub command: CommandPayload,
    pub entry: Option<LogEntry>,
    promise: oneshot::Sender<Result<CommandExecutionResult>>,
}

impl CommandScheduled {
    pub fn new(command: CommandPayload) -> (Self, PendingCommand) {
        let id = CommandId::new_v4();
        let (promise, rx) = oneshot::channel();
        (
            Self {
                id,
                command,
                entry: None,
                promise,
            },
            PendingCommand { id, rx },
        )
    }

    /// Completes the caller's future. A caller that stopped waiting is ignored.
    pub fn resolve(self, result: Result<CommandExecutionResult>) {
        if self.promise.send(result).is_err() {
            debug!(id = %self.id, "command caller went away before completion");
        }
    }
}

/// Caller side of a scheduled command.
#[derive(Debug)]
pub struct PendingCommand {
    pub id: CommandId,
    rx: oneshot::Receiver<Result<CommandExecutionResult>>,
}

impl PendingCommand {
    pub async fn wait(self) -> Result<CommandExecutionResult> {
        self.rx.await.map_err(|_| KeelError::Shutdown)?
    }
}

/// In-flight commands keyed by the (term, index) of their log slot.
#[derive(Debug, Default)]
pub struct CommandRegister {
    rows: DashMap<(Term, LogIndex), CommandScheduled>,
}

impl CommandRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a row. A row already at this key is replaced and its caller
    /// told the slot was lost.
    pub fn add(&self, term: Term, index: LogIndex, scheduled: CommandScheduled) {
        if let Some(previous) = self.rows.insert((term, index), scheduled) {
            warn!(term, index, id = %previous.id, "register slot overwritten");
            previous.resolve(Err(KeelError::StaleTerm {
                term,
                index,
                current_term: term,
            }));
        }
    }

    /// Id of the command waiting on (`term`, `index`), if any.
    pub fn get(&self, term: Term, index: LogIndex) -> Option<CommandId> {
        self.rows.get(&(term, index)).map(|row| row.id)
    }

    /// Removes and returns the row so the caller can resolve it.
    pub fn take(&self, term: Term, index: LogIndex) -> Option<CommandScheduled> {
        self.rows.remove(&(term, index)).map(|(_, row)| row)
    }

    /// Removes every row from a term older than `new_term` and fails its
    /// caller with [`KeelError::StaleTerm`]. Returns how many rows went.
    pub fn on_term_changed(&self, new_term: Term) -> usize {
        let stale: Vec<(Term, LogIndex)> = self
            .rows
            .iter()
            .filter(|row| row.key().0 < new_term)
            .map(|row| *row.key())
            .collect();

        let mut purged = 0;
        for key in stale {
            // a concurrent `take` may already own this row
            if let Some((_, row)) = self.rows.remove(&key) {
                row.resolve(Err(KeelError::StaleTerm {
                    term: key.0,
                    index: key.1,
                    current_term: new_term,
                }));
                purged += 1;
            }
        }
        if purged > 0 {
            debug!(new_term, purged, "purged superseded commands");
        }
        purged
    }

    /// Fails every row with `make_err`; used on shutdown.
    pub fn fail_all(&self, make_err: impl Fn() -> KeelError) -> usize {
        let keys: Vec<(Term, LogIndex)> = self.rows.iter().map(|row| *row.key()).collect();
        let mut failed = 0;
        for key in keys {
            if let Some((_, row)) = self.rows.remove(&key) {
                row.resolve(Err(make_err()));
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduled() -> (CommandScheduled, PendingCommand) {
        CommandScheduled::new(CommandPayload::new("test", vec![1]))
    }

    #[tokio::test]
    async fn test_term_change_purges_and_resolves_older_rows() {
        let register = CommandRegister::new();
        let (cmd, pending) = scheduled();
        register.add(1, 3, cmd);

        assert_eq!(register.on_term_changed(2), 1);
        assert!(register.get(1, 3).is_none());

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(
            err,
            KeelError::StaleTerm {
                term: 1,
                index: 3,
                current_term: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_rows_of_the_new_term_survive() {
        let register = CommandRegister::new();
        let (cmd, pending) = scheduled();
        let id = cmd.id;
        register.add(2, 3, cmd);

        assert_eq!(register.on_term_changed(2), 0);
        assert_eq!(register.get(2, 3), Some(id));
        assert_eq!(pending.id, id);
    }

    #[tokio::test]
    async fn test_take_removes_row_once() {
        let register = CommandRegister::new();
        let (cmd, pending) = scheduled();
        register.add(2, 5, cmd);

        let row = register.take(2, 5).unwrap();
        assert!(register.take(2, 5).is_none());
        assert!(register.is_empty());

        row.resolve(Ok(CommandExecutionResult {
            id: pending.id,
            index: 5,
            term: 2,
            output: vec![],
        }));
        assert_eq!(pending.wait().await.unwrap().index, 5);
    }

    #[tokio::test]
    async fn test_overwrite_resolves_replaced_row() {
        let register = CommandRegister::new();
        let (first, first_pending) = scheduled();
        let (second, _second_pending) = scheduled();
        let second_id = second.id;

        register.add(1, 1, first);
        register.add(1, 1, second);

        assert_eq!(register.get(1, 1), Some(second_id));
        assert!(first_pending.wait().await.is_err());
    }

    #[tokio::test]
    async fn test_fail_all_drains_register() {
        let register = CommandRegister::new();
        let mut waiting = Vec::new();
        for index in 1..=3 {
            let (cmd, pending) = scheduled();
            register.add(1, index, cmd);
            waiting.push(pending);
        }

        assert_eq!(register.fail_all(|| KeelError::Shutdown), 3);
        for pending in waiting {
            assert!(matches!(pending.wait().await, Err(KeelError::Shutdown)));
        }
    }
}
