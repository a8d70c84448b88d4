use keel_common::error::{KeelError, Result};
use keel_common::types::{CommandId, LogIndex, Term};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// A client command that can be replicated through the log.
///
/// `COMMAND_TYPE` is the tag stored next to the encoded command; the node
/// looks it up in the [`CommandRegistry`] when the entry is applied.
pub trait Command: Serialize + DeserializeOwned + Send + 'static {
    const COMMAND_TYPE: &'static str;
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

/// Tagged, encoded command as stored in a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command_type: String,
    pub data: Vec<u8>,
}

impl CommandPayload {
    pub fn new(command_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            command_type: command_type.into(),
            data,
        }
    }

    pub fn encode<C: Command>(command: &C) -> Result<Self> {
        Ok(Self::new(C::COMMAND_TYPE, bincode::serialize(command)?))
    }
}

/// Outcome delivered to the caller of `execute` once its entry is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandExecutionResult {
    pub id: CommandId,
    pub index: LogIndex,
    pub term: Term,
    pub output: Vec<u8>,
}

impl CommandExecutionResult {
    pub fn decode<R: DeserializeOwned>(&self) -> Result<R> {
        bincode::deserialize(&self.output).map_err(|e| KeelError::Serialization {
            index: self.index,
            cause: e.to_string(),
        })
    }
}

/// Applies one kind of command to application state.
pub trait CommandHandler: Send + Sync {
    /// Decodes and applies `data`, returning the encoded response.
    fn apply(&self, index: LogIndex, data: &[u8]) -> Result<Vec<u8>>;
}

struct TypedHandler<C, F> {
    apply: F,
    _command: PhantomData<fn(C)>,
}

impl<C, F> CommandHandler for TypedHandler<C, F>
where
    C: Command,
    F: Fn(C) -> anyhow::Result<C::Response> + Send + Sync,
{
    fn apply(&self, index: LogIndex, data: &[u8]) -> Result<Vec<u8>> {
        let command: C = bincode::deserialize(data).map_err(|e| KeelError::Serialization {
            index,
            cause: e.to_string(),
        })?;
        let response =
            (self.apply)(command).map_err(|e| KeelError::CommandFailed(format!("{:#}", e)))?;
        Ok(bincode::serialize(&response)?)
    }
}

/// Maps command tags to their handlers.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed handler for `C`, replacing any previous one.
    pub fn register<C, F>(&mut self, apply: F) -> &mut Self
    where
        C: Command,
        F: Fn(C) -> anyhow::Result<C::Response> + Send + Sync + 'static,
    {
        self.register_handler(
            C::COMMAND_TYPE,
            Arc::new(TypedHandler::<C, F> {
                apply,
                _command: PhantomData,
            }),
        )
    }

    pub fn register_handler(
        &mut self,
        command_type: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> &mut Self {
        self.handlers.insert(command_type.into(), handler);
        self
    }

    pub fn contains(&self, command_type: &str) -> bool {
        self.handlers.contains_key(command_type)
    }

    pub fn dispatch(&self, index: LogIndex, payload: &CommandPayload) -> Result<Vec<u8>> {
        let handler = self
            .handlers
            .get(&payload.command_type)
            .ok_or_else(|| KeelError::UnknownCommandType(payload.command_type.clone()))?;
        handler.apply(index, &payload.data)
    }
}
