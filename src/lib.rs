// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A parallel-execution substrate: offload serializable units of work
//! (`Task`) to child processes or dedicated OS threads, each running the
//! fixed worker event loop of [`child::serve`], multiplexed by [`worker::Worker`]
//! and pooled by [`pool::Pool`].
//!
//! Applications define a `Task` (or `AsyncTask`), build a [`pool::Pool`]
//! over it, and call [`pool::Pool::enqueue`]. Embedding binaries must call
//! [`child::is_worker_entry`] at the top of `main` and hand off to
//! [`child::serve_stdio`] when it returns `true` — see the crate's
//! `demos/echo_worker.rs` for the minimal pattern.

pub mod channel;
pub mod child;
pub mod context;
pub mod environment;
pub mod error;
pub mod fixtures;
pub mod pool;
pub mod task;
pub mod worker;

pub use context::{Context, ContextConfig};
pub use environment::Environment;
pub use error::{PoolError, RemoteFailure, Result, TaskFailure};
pub use pool::{Pool, PoolConfig};
pub use task::{Async, AsyncTask, Job, JobId, Task};
pub use worker::Worker;
