//! Error handling for subproc.
use std::{fmt, io, process::ExitStatus};

use strum_macros::{AsRefStr, Display};
use thiserror::Error;

/// Errors returned by the supervisor manager and its configuration layer.
#[derive(Debug, Error)]
pub enum SubprocError {
    /// The manager has been stopped and no longer accepts mutations.
    #[error("subproc manager is closed")]
    ManagerClosed,

    /// A predicate-based operation matched zero workers.
    #[error("no such worker")]
    NoMatch,

    /// A command name that cannot name a process or thread.
    #[error("Invalid command name {0:?}")]
    InvalidCommand(String),

    /// The supervising thread for a worker could not be spawned.
    #[error("Failed to spawn supervisor thread for '{cmd}': {source}")]
    ThreadSpawn {
        /// Command name of the worker.
        cmd: String,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Error reading a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// A configuration value was syntactically valid YAML but semantically wrong.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Lifecycle stage a hook is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum HookStage {
    StartBefore,
    StartAfter,
    WaitBefore,
    WaitAfter,
}

/// Error returned by a user supplied lifecycle hook.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HookError(Box<dyn std::error::Error + Send + Sync>);

impl HookError {
    /// Wraps any error type.
    pub fn new<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self(err.into())
    }

    /// Builds a hook error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self(message.into().into())
    }
}

/// What the parent learned from the result pipe of a failed child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitDetail {
    /// Nothing decodable was read from the result pipe.
    Decode(String),
    /// The child reported a failure message.
    Message(String),
    /// The child reported success but still exited non-zero.
    Unreported,
}

impl fmt::Display for ExitDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitDetail::Decode(err) => write!(f, ", Failed to get result: {err}"),
            ExitDetail::Message(message) => write!(f, ", Message: {message}"),
            ExitDetail::Unreported => Ok(()),
        }
    }
}

/// Errors produced while spawning, waiting on, or signalling a child process.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The operating system refused to create the process.
    #[error("Failed to spawn '{cmd}': {source}")]
    Spawn {
        /// Entrypoint name that was being spawned.
        cmd: String,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The result pipe could not be created or read.
    #[error("Result pipe failed: {0}")]
    Pipe(#[source] io::Error),

    /// A configured stdio file could not be duplicated for the child.
    #[error("Failed to configure stdio: {0}")]
    Stdio(#[source] io::Error),

    /// A lifecycle hook returned an error.
    #[error("{stage} hook failed: {source}")]
    Hook {
        /// Stage the failing hook was attached to.
        stage: HookStage,
        /// The error returned by the hook.
        #[source]
        source: HookError,
    },

    /// Waiting on the child process failed.
    #[error("Failed to wait for child: {0}")]
    Wait(#[source] io::Error),

    /// The child exited unsuccessfully or reported a failure.
    #[error("Command Error: {status}{detail}")]
    Exit {
        /// Exit status reported by the operating system.
        status: ExitStatus,
        /// Detail recovered from the result pipe.
        detail: ExitDetail,
    },

    /// The reported payload did not fit the response slot.
    #[error("Failed to decode response payload: {0}")]
    Response(#[source] serde_json::Error),

    /// A signal could not be delivered to the child.
    #[error("Failed to signal child: {0}")]
    Signal(#[source] nix::errno::Errno),

    /// The handle has no live child to operate on.
    #[error("command has not been started")]
    NotStarted,

    /// The handle was already used for a spawn attempt.
    #[error("command has already been started")]
    AlreadyStarted,
}

impl CommandError {
    /// Message the child reported through the result pipe, if any.
    pub fn reported_message(&self) -> Option<&str> {
        match self {
            CommandError::Exit {
                detail: ExitDetail::Message(message),
                ..
            } => Some(message),
            _ => None,
        }
    }

    /// Exit status of the child, if it ran to completion.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self {
            CommandError::Exit { status, .. } => Some(*status),
            _ => None,
        }
    }
}
