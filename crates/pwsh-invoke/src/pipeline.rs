use std::sync::Arc;

use crate::state::PsInvocationStateInfo;
use crate::PwshInvokeError;

/// Represents a parameter or output value in business logic terms.
#[derive(Debug, Clone, PartialEq)]
pub enum PsValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Array(Vec<PsValue>),
    Null,
}

/// Represents a single parameter for a command.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: Option<PsValue>,
}

/// Represents a single command in a pipeline, in business logic terms.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineCommand {
    pub command_text: String,
    pub is_script: bool,
    pub parameters: Vec<Parameter>,
    /// True when this command closes a statement; the next command starts a
    /// new statement and the whole invocation becomes a batch.
    pub end_of_statement: bool,
}

impl PipelineCommand {
    pub fn new_script(script: String) -> Self {
        Self {
            command_text: script,
            is_script: true,
            parameters: Vec::new(),
            end_of_statement: false,
        }
    }

    pub fn new_command(command: String) -> Self {
        Self {
            command_text: command,
            is_script: false,
            parameters: Vec::new(),
            end_of_statement: false,
        }
    }

    pub fn add_parameter(&mut self, name: String, value: PsValue) {
        self.parameters.push(Parameter {
            name,
            value: Some(value),
        });
    }

    pub fn add_switch_parameter(&mut self, name: String) {
        self.parameters.push(Parameter { name, value: None });
    }

    pub fn mark_end_of_statement(&mut self) {
        self.end_of_statement = true;
    }
}

/// The runnable definition handed to a runspace: an ordered command list plus
/// invocation options.
#[derive(Debug, Clone, Default)]
pub struct PipelineSpec {
    pub commands: Vec<PipelineCommand>,
    pub is_nested: bool,
    pub add_to_history: bool,
}

impl PipelineSpec {
    pub fn new(commands: Vec<PipelineCommand>) -> Self {
        Self {
            commands,
            is_nested: false,
            add_to_history: false,
        }
    }

    /// A pipeline is batching when any command in it closes a statement.
    pub fn has_statement_separators(&self) -> bool {
        self.commands.iter().any(|command| command.end_of_statement)
    }

    /// Walk the command list, accumulating commands into a statement until an
    /// end-of-statement marker, then start the next one. Empty groups (for
    /// example a trailing marker) are discarded.
    pub fn split_statements(&self) -> Vec<Self> {
        let mut statements = Vec::new();
        let mut current = Vec::new();
        for command in &self.commands {
            let closes = command.end_of_statement;
            current.push(command.clone());
            if closes {
                statements.push(Self {
                    commands: std::mem::take(&mut current),
                    is_nested: self.is_nested,
                    add_to_history: self.add_to_history,
                });
            }
        }
        if !current.is_empty() {
            statements.push(Self {
                commands: current,
                is_nested: self.is_nested,
                add_to_history: self.add_to_history,
            });
        }
        statements
    }
}

pub type PipelineStateHandler = Arc<dyn Fn(PsInvocationStateInfo) + Send + Sync>;

/// The consumed pipeline-executor contract: a constructed, runnable graph of
/// bound commands. How commands are scheduled inside is not this crate's
/// concern; the invocation engine only starts, stops and observes it.
pub trait Pipeline: Send + Sync {
    /// Run to completion on the calling thread. State notifications fire
    /// through the registered handler before this returns an execution error.
    fn invoke(&self) -> Result<(), PwshInvokeError>;

    /// Start execution and return immediately.
    fn invoke_async(&self) -> Result<(), PwshInvokeError>;

    /// Cooperatively stop, blocking until the stop is acknowledged.
    fn stop(&self) -> Result<(), PwshInvokeError>;

    /// Request a cooperative stop without blocking.
    fn stop_async(&self) -> Result<(), PwshInvokeError>;

    /// Replace (or with `None`, detach) the state-changed subscription.
    fn set_state_changed(&self, handler: Option<PipelineStateHandler>);

    fn state(&self) -> PsInvocationStateInfo;
}
