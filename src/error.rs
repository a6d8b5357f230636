// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// Failure descriptor carried by a `TaskResult` or `ExitResult` when the
/// child side could not produce a value: a remote exception kind, a
/// message, and an optional stack trace string.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RemoteFailure {
    pub kind: String,
    pub message: String,
    pub stack: Option<String>,
}

impl RemoteFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A failure produced by `Task::run`. Applications construct this directly,
/// or get one for free via `From<E: std::error::Error>`.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TaskFailure(pub RemoteFailure);

impl<E: std::error::Error> From<E> for TaskFailure {
    fn from(err: E) -> Self {
        TaskFailure(RemoteFailure::new(
            std::any::type_name::<E>(),
            err.to_string(),
        ))
    }
}

/// The six error kinds of spec.md §7. Every non-`SerializationException`
/// variant is fatal to the `Context`/`Worker` that produced it; callers are
/// expected to match on kind, so no catch-all `anyhow` variant is offered
/// here.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Illegal operation for the current lifecycle state (start-twice,
    /// enqueue-after-shutdown, receive-before-start). Programmer error,
    /// never retried.
    #[error("status error: {0}")]
    StatusError(String),

    /// The executor died or the channel broke. Terminal for the owning
    /// `Context` and `Worker`.
    #[error("context exception: {0}")]
    ContextException(String),

    /// A payload for one task could not be encoded or decoded. Scoped to
    /// that task; other tasks on the same worker continue.
    #[error("serialization exception: {0}")]
    SerializationException(String),

    /// The worker cancelled pending tasks, e.g. in response to `kill`.
    #[error("worker exception: {0}")]
    WorkerException(String),

    /// Protocol violation by the child (unexpected `ExitResult`, malformed
    /// `TaskResult`, unknown job id). Terminal for the owning `Worker`.
    #[error("synchronization error: {0}")]
    SynchronizationError(String),

    /// A failure descriptor surfaced from the child side: a remote
    /// exception, a bad bootstrap, or a task that failed.
    #[error("panic error: {0}")]
    PanicError(RemoteFailure),
}

pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    pub fn context(msg: impl Into<String>) -> Self {
        PoolError::ContextException(msg.into())
    }

    pub fn status(msg: impl Into<String>) -> Self {
        PoolError::StatusError(msg.into())
    }

    pub fn worker(msg: impl Into<String>) -> Self {
        PoolError::WorkerException(msg.into())
    }

    pub fn sync(msg: impl Into<String>) -> Self {
        PoolError::SynchronizationError(msg.into())
    }
}

impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        PoolError::ContextException(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for PoolError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        PoolError::SerializationException(err.to_string())
    }
}
