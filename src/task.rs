// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::environment::Environment;
use crate::error::{RemoteFailure, TaskFailure};

/// Unique id of a `Job`, stable per job and preserved across a
/// serialize/deserialize round-trip: the child never mints new ids, it
/// only ever echoes back the id it was given (spec.md REDESIGN FLAGS).
pub type JobId = Uuid;

/// An opaque, serialisable unit of work carrying one `run(environment)`
/// method. `Output` must itself be serialisable.
///
/// `run` is synchronous in signature; the child runtime runs it on a
/// blocking thread pool (`tokio::task::spawn_blocking`) so a long `run`
/// cannot starve other in-flight jobs on the same worker. Applications
/// whose work is naturally `async fn` should implement [`AsyncTask`]
/// instead.
pub trait Task: Serialize + DeserializeOwned + Send + 'static {
    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn run(&self, env: &Environment) -> Result<Self::Output, TaskFailure>;
}

/// Convenience variant of [`Task`] for work that is itself asynchronous.
/// The child runtime spawns this directly onto the async executor instead
/// of `spawn_blocking`.
#[async_trait::async_trait]
pub trait AsyncTask: Serialize + DeserializeOwned + Send + 'static {
    type Output: Serialize + DeserializeOwned + Send + 'static;

    async fn run_async(&self, env: &Environment) -> Result<Self::Output, TaskFailure>;
}

/// Bridges an [`AsyncTask`] into a [`Task`] so it can be submitted to the
/// same `Pool`/`Worker`/`Context` substrate: the child runtime always
/// dispatches through `Task::run` on a blocking thread, so this adapter
/// drives the inner future to completion with a handle to the runtime
/// that's already running on that thread (the blocking-pool thread is
/// free to block, unlike a worker thread).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Async<A>(pub A);

impl<A: AsyncTask> Task for Async<A> {
    type Output = A::Output;

    fn run(&self, env: &Environment) -> Result<Self::Output, TaskFailure> {
        tokio::runtime::Handle::current().block_on(self.0.run_async(env))
    }
}

/// A `Task` plus a unique identifier, assigned once by the parent and
/// preserved verbatim through serialization.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Job<T> {
    pub id: JobId,
    pub task: T,
}

impl<T> Job<T> {
    pub fn new(task: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
        }
    }
}

/// The outcome of running one `Job`: a value, or a failure descriptor.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Outcome<O> {
    Ok(O),
    Err(RemoteFailure),
}

/// Pairs a `JobId` with its outcome. Always carries the id of the `Job`
/// it answers.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TaskResult<O> {
    pub id: JobId,
    pub outcome: Outcome<O>,
}

impl<O> TaskResult<O> {
    pub fn ok(id: JobId, value: O) -> Self {
        Self {
            id,
            outcome: Outcome::Ok(value),
        }
    }

    pub fn err(id: JobId, failure: RemoteFailure) -> Self {
        Self {
            id,
            outcome: Outcome::Err(failure),
        }
    }
}

/// Sent exactly once by the child runtime, as its final message before a
/// clean exit. No further user messages follow an `ExitResult` on a
/// `Channel`.
///
/// This crate ships exactly one child program per `Context` — the
/// worker event loop of spec.md §4.4 — whose own "top-level callable"
/// always completes with a small numeric code (0 on a clean stop), not a
/// user value; per-task outputs travel as `TaskResult`s instead. An
/// embedding application that wants a general-purpose `Context` running
/// an arbitrary bootstrap would carry its own exit value type; that use
/// case is out of scope here (see DESIGN.md).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum ExitResult {
    Ok(i32),
    Err(RemoteFailure),
}

/// One frame of the wire protocol (spec.md §6). `T` is the concrete task
/// type a `Pool`/`Worker`/`Context` triple is instantiated over; `T` and
/// `T::Output` are the same Rust type on both sides of the channel, since
/// parent and child are the same compiled binary.
#[derive(Deserialize, Serialize)]
#[serde(bound = "T: Task")]
pub enum WireMessage<T: Task> {
    /// P -> C: execute this job.
    Job(Job<T>),
    /// P -> C: stop the event loop and exit cleanly.
    Stop,
    /// C -> P: answer to a `Job`.
    Result(TaskResult<T::Output>),
    /// C -> P: terminal message before child exit.
    Exit(ExitResult),
    /// P -> C, first message only: an initial bootstrap argument, if the
    /// embedding application configured one.
    Bootstrap(Vec<u8>),
}

impl<T: Task> std::fmt::Debug for WireMessage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireMessage::Job(job) => write!(f, "WireMessage::Job({})", job.id),
            WireMessage::Stop => write!(f, "WireMessage::Stop"),
            WireMessage::Result(r) => write!(f, "WireMessage::Result({})", r.id),
            WireMessage::Exit(_) => write!(f, "WireMessage::Exit"),
            WireMessage::Bootstrap(_) => write!(f, "WireMessage::Bootstrap"),
        }
    }
}

/// A human-readable description of a message's type, for
/// `SynchronizationError` messages when an `ExitResult` shows up where a
/// `TaskResult` was expected (spec.md §4.1).
pub fn message_kind<T: Task>(msg: &WireMessage<T>) -> &'static str {
    match msg {
        WireMessage::Job(_) => "Job",
        WireMessage::Stop => "Stop",
        WireMessage::Result(_) => "TaskResult",
        WireMessage::Exit(_) => "ExitResult",
        WireMessage::Bootstrap(_) => "Bootstrap",
    }
}
