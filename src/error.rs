use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::core::RefId;

/// An error shared between every request that waited on the same failed task.
#[derive(Debug, Clone)]
pub struct SharedError(pub(crate) Arc<anyhow::Error>);

impl SharedError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// The underlying error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

// anyhow::Error does not implement std::error::Error itself, so the chain is
// forwarded by hand.
impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<Arc<anyhow::Error>> for SharedError {
    fn from(e: Arc<anyhow::Error>) -> Self {
        SharedError(e)
    }
}

impl From<anyhow::Error> for SharedError {
    fn from(e: anyhow::Error) -> Self {
        SharedError(Arc::new(e))
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to build runtime")]
    Runtime(#[from] tokio::io::Error),

    #[error("Ref {0} does not exist")]
    UnknownRef(RefId),

    #[error("{ref_type} {id} has no hardpoint \"{key}\", declared hardpoints are: {declared}")]
    UnknownHardpoint {
        id: RefId,
        ref_type: &'static str,
        key: String,
        declared: String,
    },

    #[error("No producer can load hardpoint \"{key}\" for {ref_type} {id}")]
    NoProducer {
        id: RefId,
        ref_type: &'static str,
        key: String,
    },

    #[error("Hardpoint \"{key}\" on {id} was never requested")]
    NotRequested { id: RefId, key: String },

    #[error("Hardpoint \"{key}\" on {id} is still pending")]
    StillPending { id: RefId, key: String },

    #[error("Hardpoint \"{key}\" on {id} already has attached data")]
    AlreadyAttached { id: RefId, key: String },

    #[error("Producer '{producer}' returned a value for {id}, which was not in its batch")]
    BadRefKey { producer: &'static str, id: RefId },

    #[error("No repository is available in this environment")]
    NoRepository,

    #[error("No conduit client is available in this environment")]
    NoConduit,

    #[error(
        "Hardpoint resolution stalled after {rounds} rounds without progress, \
         no operations are in flight.\nBlocked tasks:\n{blocked}{}",
        .cycle.as_ref().map(|c| format!("\nCycle: {c}")).unwrap_or_default()
    )]
    Stalled {
        rounds: usize,
        blocked: String,
        cycle: Option<String>,
    },

    #[error(transparent)]
    Failed(#[from] SharedError),
}

/// Failure of one external operation. Timeouts are reported separately from
/// ordinary failures.
#[derive(Debug, Error)]
pub enum FutureError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command `{command}` failed with status {status}.\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stdout: String,
        stderr: String,
    },

    #[error(
        "Command `{command}` killed by timeout after running for more than {} seconds.",
        .timeout.as_secs_f64()
    )]
    Killed { command: String, timeout: Duration },

    #[error("Conduit method `{method}` failed: {code}: {info}")]
    Conduit {
        method: String,
        code: String,
        info: String,
    },

    #[error("Conduit transport error calling `{method}`:\n{message}")]
    Transport { method: String, message: String },

    #[error("I/O error while waiting on `{command}`")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation panicked: {0}")]
    Panicked(String),

    #[error("Operation produced a value of an unexpected type")]
    Type,
}

/// Errors raised by the framed JSON channel. All of them are fatal to the
/// channel they occur on.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(
        "Expected an 8-character, zero-padded numeric frame length, got {header:?} \
         ({buffered} bytes buffered)"
    )]
    BadLength { header: String, buffered: usize },

    #[error("Frame of {0} bytes is too large for an 8-digit length header")]
    TooLarge(usize),

    #[error("Only JSON objects may be sent over the channel, got {0}")]
    NotAnObject(&'static str),

    #[error("Failed to decode JSON frame")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Malformed or ambiguous user input. Surfaced verbatim, never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UsageError {
    #[error(
        "Commit symbol {0:?} contains a newline. This is not a valid character in a commit symbol."
    )]
    NewlineInSymbol(String),

    #[error("Symbol {symbol:?} is not a valid {kind} symbol.")]
    BadSymbol { kind: &'static str, symbol: String },

    #[error("Symbol is empty.")]
    EmptySymbol,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Unexpected message on the agent channel: {0}")]
    Message(serde_json::Error),

    #[error("Command {key:?} is already running")]
    DuplicateKey { key: String },

    #[error(transparent)]
    Future(#[from] FutureError),

    #[error("Command resolution task failed")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum SymbolError {
    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}
