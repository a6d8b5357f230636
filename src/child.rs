// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The event loop that runs inside the executor (spec.md §4.4): receive a
//! `Job`, run the `Task` concurrently with any other in-flight jobs, send
//! back a `TaskResult`; on the stop sentinel, emit one `ExitResult` and
//! return.
//!
//! Embedding binaries call [`is_worker_entry`] at the very top of `main`
//! and, if it returns `true`, hand off to [`serve_stdio`] instead of
//! running their normal entry point — the Rust-native reading of
//! spec.md's "known entry script" (SPEC_FULL.md §0).

use std::sync::Arc;

use crate::channel::{pipe_channel, ChannelRx, ChannelTx};
use crate::context::WORKER_ENTRY_MARKER;
use crate::environment::Environment;
use crate::error::RemoteFailure;
use crate::task::{ExitResult, Task, TaskResult, WireMessage};

/// True if this process was spawned by `Context::start` to run the worker
/// event loop rather than the embedding application's normal `main`.
pub fn is_worker_entry() -> bool {
    std::env::var(WORKER_ENTRY_MARKER).is_ok()
}

/// `Environment` key a `WireMessage::Bootstrap` is stored under, if
/// `ContextConfig::bootstrap` was set. Every `Task::run` on this worker can
/// read it back with `env.get::<Vec<u8>>(BOOTSTRAP_ENV_KEY)`.
pub const BOOTSTRAP_ENV_KEY: &str = "__bootstrap__";

/// Runs the worker event loop over the process's stdio, for a process
/// spawned with [`is_worker_entry`] true. Call this (and then exit) from
/// `main` before doing anything else.
pub async fn serve_stdio<T: Task>() {
    let (tx, rx) = pipe_channel(tokio::io::stdout(), tokio::io::stdin());
    serve(tx, rx).await;
}

/// Runs the worker event loop over an arbitrary transport. Exposed
/// separately from [`serve_stdio`] so a thread-backed `Context` can drive
/// it over an in-memory channel instead.
pub async fn serve<T: Task, Tx: ChannelTx<T>, Rx: ChannelRx<T>>(mut tx: Tx, mut rx: Rx) {
    let env = Arc::new(Environment::new());
    let (result_tx, mut result_rx) = tokio::sync::mpsc::channel::<TaskResult<T::Output>>(64);

    loop {
        tokio::select! {
            incoming = rx.recv() => {
                match incoming {
                    Ok(WireMessage::Job(job)) => {
                        spawn_job(job, env.clone(), result_tx.clone());
                    }
                    Ok(WireMessage::Stop) => break,
                    Ok(WireMessage::Bootstrap(bytes)) => {
                        env.set(BOOTSTRAP_ENV_KEY, bytes, None);
                    }
                    Ok(other) => {
                        log::warn!("worker event loop received unexpected message: {other:?}");
                    }
                    Err(err) => {
                        log::error!("worker event loop channel error: {err}");
                        return;
                    }
                }
            }
            Some(result) = result_rx.recv() => {
                if tx.send(WireMessage::Result(result)).await.is_err() {
                    return;
                }
            }
        }
    }

    drop(result_tx);
    while let Some(result) = result_rx.recv().await {
        if tx.send(WireMessage::Result(result)).await.is_err() {
            return;
        }
    }

    let _ = tx.send(WireMessage::Exit(ExitResult::Ok(0))).await;
}

fn spawn_job<T: Task>(
    job: crate::task::Job<T>,
    env: Arc<Environment>,
    result_tx: tokio::sync::mpsc::Sender<TaskResult<T::Output>>,
) {
    tokio::spawn(async move {
        let id = job.id;
        let task = job.task;
        let outcome = tokio::task::spawn_blocking(move || task.run(&env)).await;

        let result = match outcome {
            Ok(Ok(value)) => TaskResult::ok(id, value),
            Ok(Err(failure)) => TaskResult::err(id, failure.0),
            Err(join_err) => TaskResult::err(id, RemoteFailure::new("JoinError", join_err.to_string())),
        };

        let _ = result_tx.send(result).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory_channel;
    use crate::fixtures::ReadBootstrap;
    use crate::task::Job;

    #[tokio::test]
    async fn bootstrap_message_is_readable_from_the_environment() {
        let (mut parent, child) = memory_channel::<ReadBootstrap>(8);
        tokio::spawn(serve(child.0, child.1));

        parent
            .0
            .send(WireMessage::Bootstrap(b"seed data".to_vec()))
            .await
            .unwrap();

        let job = Job::new(ReadBootstrap);
        let id = job.id;
        parent.0.send(WireMessage::Job(job)).await.unwrap();

        match parent.1.recv().await.unwrap() {
            WireMessage::Result(result) => {
                assert_eq!(result.id, id);
                match result.outcome {
                    crate::task::Outcome::Ok(bytes) => assert_eq!(bytes, b"seed data".to_vec()),
                    crate::task::Outcome::Err(failure) => panic!("task failed: {failure:?}"),
                }
            }
            other => panic!("unexpected message: {other:?}"),
        }

        parent.0.send(WireMessage::Stop).await.unwrap();
        match parent.1.recv().await.unwrap() {
            WireMessage::Exit(ExitResult::Ok(0)) => {}
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
