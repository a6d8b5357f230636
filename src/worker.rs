// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The parent-side job multiplexer (spec.md §4.3): many outstanding tasks
//! share one `Context`, correlated by `JobId`.
//!
//! Ownership is collapsed into a single actor task (REDESIGN FLAGS: "model
//! as a Worker object owning its pending map; the receive loop is a
//! method on the Worker, not a reentrant closure"). The actor owns the
//! `Context`'s send half and the pending map directly — no locks — and a
//! second, dedicated task owns the receive half and does nothing but pump
//! frames into the actor's inbox. Splitting send and receive this way is
//! what lets `Worker::enqueue` post a new job while the actor is already
//! awaiting the next result, instead of serializing all I/O behind one
//! `&mut Context`. See DESIGN.md for the full rationale.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::channel::{ChannelRx, ChannelTx};
use crate::context::{Context, ContextConfig};
use crate::error::{PoolError, Result};
use crate::task::{Job, JobId, Outcome, Task, WireMessage};

type TaskReply<T> = oneshot::Sender<std::result::Result<<T as Task>::Output, PoolError>>;

enum Command<T: Task> {
    Enqueue { task: T, reply: TaskReply<T> },
    Shutdown { reply: oneshot::Sender<Result<i32>> },
    Kill { reply: oneshot::Sender<()> },
}

/// Owns one `Context` and multiplexes many outstanding tasks over it.
pub struct Worker<T: Task> {
    cmd_tx: mpsc::Sender<Command<T>>,
    pending_count: Arc<AtomicUsize>,
    running: Arc<std::sync::atomic::AtomicBool>,
}

impl<T: Task> Worker<T> {
    /// Builds a process-backed worker. The `Context` is not started until
    /// the first `enqueue`.
    pub fn new_process(config: ContextConfig) -> Self {
        Self::spawn(Context::process(config))
    }

    /// Builds a thread-backed worker.
    pub fn new_thread() -> Self {
        Self::spawn(Context::thread())
    }

    fn spawn(context: Context<T>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let pending_count = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(std::sync::atomic::AtomicBool::new(false));

        tokio::spawn(run_actor(
            context,
            cmd_rx,
            pending_count.clone(),
            running.clone(),
        ));

        Self {
            cmd_tx,
            pending_count,
            running,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// `isIdle() ≡ pending map empty` (spec.md §3 invariant).
    pub fn is_idle(&self) -> bool {
        self.pending_count.load(Ordering::SeqCst) == 0
    }

    pub fn pending_count(&self) -> usize {
        self.pending_count.load(Ordering::SeqCst)
    }

    /// Submits one task. Lazily starts the `Context` on the first call.
    pub async fn enqueue(&self, task: T) -> Result<T::Output> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Enqueue { task, reply })
            .await
            .map_err(|_| PoolError::status("worker is not running"))?;
        reply_rx
            .await
            .map_err(|_| PoolError::worker("worker actor terminated before replying"))?
    }

    /// Drains every pending awaiter, sends the stop sentinel, joins the
    /// `Context`, and returns its exit code.
    pub async fn shutdown(self) -> Result<i32> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { reply })
            .await
            .map_err(|_| PoolError::status("worker is not running"))?;
        reply_rx
            .await
            .map_err(|_| PoolError::worker("worker actor terminated before replying"))?
    }

    /// Cancels every pending awaiter with `WorkerException` and kills the
    /// `Context`. Awaits the actor's confirmation that `running` has
    /// already flipped to `false` before returning, so `is_running()` is
    /// guaranteed to read `false` immediately after `kill()` returns
    /// (spec.md §8 scenario 5). Idempotent.
    pub async fn kill(&self) {
        let (reply, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Kill { reply }).await.is_ok() {
            let _ = reply_rx.await;
        }
    }
}

async fn run_actor<T: Task>(
    mut context: Context<T>,
    mut cmd_rx: mpsc::Receiver<Command<T>>,
    pending_count: Arc<AtomicUsize>,
    running: Arc<std::sync::atomic::AtomicBool>,
) {
    let mut tx: Option<Box<dyn ChannelTx<T> + Send>> = None;
    let mut pending: HashMap<JobId, TaskReply<T>> = HashMap::new();
    let (frame_tx, mut frame_rx) = mpsc::channel::<Result<WireMessage<T>>>(64);
    let mut shut_down = false;
    let mut stopping: Option<oneshot::Sender<Result<i32>>> = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Enqueue { task, reply } => {
                        if shut_down {
                            let _ = reply.send(Err(PoolError::status("worker has been shut down")));
                            continue;
                        }
                        if tx.is_none() {
                            match context.start().await {
                                Ok((started_tx, rx)) => {
                                    tx = Some(started_tx);
                                    running.store(true, Ordering::SeqCst);
                                    spawn_pump(rx, frame_tx.clone());
                                }
                                Err(err) => {
                                    let _ = reply.send(Err(err));
                                    continue;
                                }
                            }
                        }

                        let job = Job::new(task);
                        let id = job.id;
                        match tx.as_mut().unwrap().send(WireMessage::Job(job)).await {
                            Ok(()) => {
                                pending.insert(id, reply);
                                pending_count.store(pending.len(), Ordering::SeqCst);
                            }
                            Err(PoolError::SerializationException(msg)) => {
                                let _ = reply.send(Err(PoolError::SerializationException(msg)));
                            }
                            Err(err) => {
                                log::error!("worker send failed, killing context: {err}");
                                let _ = reply.send(Err(PoolError::worker(err.to_string())));
                                fail_all(&mut pending, &pending_count, "context send failed");
                                context.kill().await;
                                running.store(false, Ordering::SeqCst);
                                shut_down = true;
                            }
                        }
                    }
                    Command::Shutdown { reply } => {
                        if tx.is_none() {
                            let _ = reply.send(Ok(0));
                            break;
                        }
                        shut_down = true;
                        if pending.is_empty() {
                            if let Err(err) = tx.as_mut().unwrap().send(WireMessage::Stop).await {
                                let _ = reply.send(Err(err));
                                break;
                            }
                            stopping = Some(reply);
                        } else {
                            // Wait for every pending awaiter to settle; the
                            // Result branch below sends Stop once drained.
                            stopping = Some(reply);
                        }
                    }
                    Command::Kill { reply } => {
                        fail_all(&mut pending, &pending_count, "worker killed");
                        context.kill().await;
                        running.store(false, Ordering::SeqCst);
                        let _ = reply.send(());
                        break;
                    }
                }
            }
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                match frame {
                    Ok(WireMessage::Result(result)) => {
                        if let Some(reply) = pending.remove(&result.id) {
                            pending_count.store(pending.len(), Ordering::SeqCst);
                            let mapped = match result.outcome {
                                Outcome::Ok(value) => Ok(value),
                                Outcome::Err(failure) => Err(PoolError::PanicError(failure)),
                            };
                            let _ = reply.send(mapped);
                        } else {
                            log::error!("received a TaskResult for unknown job id {}", result.id);
                            fail_all(&mut pending, &pending_count, "received result for unknown job id");
                            context.kill().await;
                            running.store(false, Ordering::SeqCst);
                            break;
                        }

                        if pending.is_empty() && shut_down {
                            if let Some(reply) = stopping.take() {
                                if let Err(err) = tx.as_mut().unwrap().send(WireMessage::Stop).await {
                                    let _ = reply.send(Err(err));
                                    break;
                                }
                                stopping = Some(reply);
                            }
                        }
                    }
                    Ok(WireMessage::Exit(exit)) if stopping.is_some() => {
                        let reply = stopping.take().unwrap();
                        let outcome = context.wait_exit(exit).await;
                        let _ = reply.send(outcome);
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                    Ok(other) => {
                        let kind = crate::task::message_kind(&other);
                        fail_all(&mut pending, &pending_count, &format!("protocol violation: unexpected {kind}"));
                        if let Some(reply) = stopping.take() {
                            let _ = reply.send(Err(PoolError::sync(format!("unexpected {kind} while shutting down"))));
                        }
                        context.kill().await;
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                    Err(err) => {
                        fail_all(&mut pending, &pending_count, &err.to_string());
                        if let Some(reply) = stopping.take() {
                            let _ = reply.send(Err(PoolError::context(format!("failed to receive result: {err}"))));
                        }
                        context.kill().await;
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }
    }
}

fn spawn_pump<T: Task>(
    mut rx: Box<dyn ChannelRx<T> + Send>,
    frame_tx: mpsc::Sender<Result<WireMessage<T>>>,
) {
    tokio::spawn(async move {
        loop {
            let frame = rx.recv().await;
            let is_err = frame.is_err();
            if frame_tx.send(frame).await.is_err() || is_err {
                break;
            }
        }
    });
}

fn fail_all<T: Task>(
    pending: &mut HashMap<JobId, TaskReply<T>>,
    pending_count: &Arc<AtomicUsize>,
    reason: &str,
) {
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(PoolError::worker(reason.to_string())));
    }
    pending_count.store(0, Ordering::SeqCst);
}
