use std::fmt;
use std::io;

use thiserror::Error;

/// The pthread attribute call that failed while creating a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrStep {
    Init,
    InheritSched,
    DetachState,
    SchedPolicy,
    Priority,
    StackSize,
}

impl fmt::Display for AttrStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttrStep::Init => "attr init",
            AttrStep::InheritSched => "set explicit sched",
            AttrStep::DetachState => "set detach state",
            AttrStep::SchedPolicy => "set scheduling policy",
            AttrStep::Priority => "set priority",
            AttrStep::StackSize => "set stack size",
        };
        f.write_str(s)
    }
}

/// Coarse classification used to pick the reaction to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, reported before any real-time resource exists.
    Configuration,
    /// Fatal for the run; already-created resources are torn down.
    ResourceCreation,
    /// A single failed wait; logged and the run continues.
    TransientWait,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{step} failed for task '{task}' with err={code}")]
    Attribute {
        task: String,
        step: AttrStep,
        code: i32,
    },

    #[error("timer {op} failed for task '{task}': {source}")]
    Timer {
        task: String,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to create thread '{task}' with err={code}")]
    Spawn { task: String, code: i32 },

    #[error("set name failed for thread '{task}' with err={code}")]
    Naming { task: String, code: i32 },

    #[error("failed to create {mechanism}: {source}")]
    SyncCreate {
        mechanism: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{mechanism} wait failed: {reason}")]
    Wait {
        mechanism: &'static str,
        reason: String,
    },

    #[error("{mechanism} closed")]
    Closed { mechanism: &'static str },

    #[error("task '{0}' terminated without handing back its samples")]
    TaskLost(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Configuration,
            Error::Wait { .. } | Error::Closed { .. } => ErrorKind::TransientWait,
            _ => ErrorKind::ResourceCreation,
        }
    }

    /// Process exit status for an error that ends the program.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Configuration => 2,
            _ => 1,
        }
    }
}
