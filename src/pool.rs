// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A capacity-bounded, lazily-growing pool of `Worker`s (spec.md §4.5):
//! dispatch prefers an idle worker (oldest-idle-first), falls back to the
//! least-loaded worker under its per-worker concurrency cap, grows a new
//! worker if under `max_size`, and otherwise queues the caller until a slot
//! frees up.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};

use crate::context::ContextConfig;
use crate::error::Result;
use crate::task::Task;
use crate::worker::Worker;

/// How a `Pool`'s workers are backed. Process workers are the default;
/// thread workers trade process isolation for lower spawn latency.
#[derive(Clone, Debug)]
pub enum WorkerBackend {
    Process(ContextConfig),
    Thread,
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Hard cap on the number of workers the pool will grow to.
    pub max_size: usize,
    /// How many jobs a single worker may have outstanding before it is
    /// considered "at capacity" for new dispatch. Defaults to 1: one
    /// worker per concurrently-running task, matching a pool of processes
    /// rather than a thread-pool-style work-stealing scheduler.
    pub max_concurrency_per_worker: NonZeroUsize,
    pub backend: WorkerBackend,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 4,
            max_concurrency_per_worker: NonZeroUsize::new(1).unwrap(),
            backend: WorkerBackend::Thread,
        }
    }
}

struct Slot<T: Task> {
    worker: Arc<Worker<T>>,
    pending: usize,
}

struct Inner<T: Task> {
    slots: Vec<Slot<T>>,
    idle: VecDeque<usize>,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// A pool of workers shared behind `enqueue`; cheap to `clone` (an `Arc`
/// internally) so callers can fan a single pool out across tasks.
pub struct Pool<T: Task> {
    inner: Arc<Mutex<Inner<T>>>,
    config: PoolConfig,
    size: Arc<AtomicUsize>,
}

impl<T: Task> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            config: self.config.clone(),
            size: self.size.clone(),
        }
    }
}

impl<T: Task> Pool<T> {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                slots: Vec::new(),
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
            })),
            config,
            size: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of workers currently grown (not necessarily idle).
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    /// Submits a task to some worker, growing the pool or waiting for
    /// capacity as needed, and awaits its result.
    pub async fn enqueue(&self, task: T) -> Result<T::Output> {
        let worker = self.lease_worker().await;
        let result = worker.enqueue(task).await;
        self.release_worker(&worker).await;
        result
    }

    /// Checks a worker out of the pool for exclusive use (spec.md §4.5
    /// `getWorker`), growing the pool or waiting for capacity exactly as
    /// `enqueue` does. Unlike `enqueue`, the worker is excluded from the
    /// pool's normal dispatch until the returned `WorkerLease` is released
    /// or dropped — useful for pinning several tasks to one `Worker` to
    /// share its `Environment`, without another caller's `enqueue` landing
    /// on it in between.
    pub async fn get_worker(&self) -> WorkerLease<T> {
        let worker = self.lease_worker().await;
        WorkerLease {
            pool: self.clone(),
            worker: Some(worker),
        }
    }

    async fn lease_worker(&self) -> Arc<Worker<T>> {
        loop {
            let wait = {
                let mut inner = self.inner.lock().await;

                if let Some(idx) = inner.idle.pop_front() {
                    inner.slots[idx].pending += 1;
                    return inner.slots[idx].worker.clone();
                }

                let cap = self.config.max_concurrency_per_worker.get();
                let least_loaded = inner
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(_, slot)| slot.pending < cap)
                    .min_by_key(|(idx, slot)| (slot.pending, *idx))
                    .map(|(idx, _)| idx);

                if let Some(idx) = least_loaded {
                    inner.slots[idx].pending += 1;
                    return inner.slots[idx].worker.clone();
                }

                if inner.slots.len() < self.config.max_size {
                    let worker = Arc::new(self.spawn_worker());
                    inner.slots.push(Slot { worker: worker.clone(), pending: 1 });
                    self.size.store(inner.slots.len(), Ordering::SeqCst);
                    return worker;
                }

                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(tx);
                rx
            };

            // A slot freed up (or the pool shut down and dropped us); loop
            // around and retry dispatch rather than assuming which worker.
            let _ = wait.await;
        }
    }

    /// Returns a worker to the pool's normal dispatch, or evicts it if it
    /// is no longer running (spec.md §4.5: "dead Workers are removed when
    /// detected — a failed enqueue or a non-running Worker observed on
    /// lease return"). A worker that died mid-job surfaces here the next
    /// time its lessee releases it, since `enqueue`/`WorkerLease::release`
    /// both route through this method regardless of whether the job
    /// itself succeeded.
    async fn release_worker(&self, worker: &Arc<Worker<T>>) {
        let mut inner = self.inner.lock().await;
        if let Some(idx) = inner.slots.iter().position(|slot| Arc::ptr_eq(&slot.worker, worker)) {
            if worker.is_running() {
                inner.slots[idx].pending = inner.slots[idx].pending.saturating_sub(1);
                if inner.slots[idx].pending == 0 {
                    inner.idle.push_back(idx);
                }
            } else {
                inner.slots.remove(idx);
                inner.idle.retain(|&i| i != idx);
                for i in inner.idle.iter_mut() {
                    if *i > idx {
                        *i -= 1;
                    }
                }
                self.size.store(inner.slots.len(), Ordering::SeqCst);
            }
        }
        if let Some(tx) = inner.waiters.pop_front() {
            let _ = tx.send(());
        }
    }

    fn spawn_worker(&self) -> Worker<T> {
        match &self.config.backend {
            WorkerBackend::Process(context_config) => Worker::new_process(context_config.clone()),
            WorkerBackend::Thread => Worker::new_thread(),
        }
    }

    /// Stops every worker in insertion order, propagating the first error
    /// encountered (if any) after every worker has been asked to shut down.
    pub async fn shutdown(self) -> Result<()> {
        let slots = {
            let mut inner = self.inner.lock().await;
            inner.waiters.clear();
            std::mem::take(&mut inner.slots)
        };

        let mut first_err = None;
        for slot in slots {
            let worker = match Arc::try_unwrap(slot.worker) {
                Ok(worker) => worker,
                Err(shared) => {
                    // Still referenced by an in-flight `enqueue` caller;
                    // kill rather than leak a half-shut-down worker.
                    shared.kill().await;
                    continue;
                }
            };
            if let Err(err) = worker.shutdown().await {
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Kills every worker immediately. Idempotent.
    pub async fn kill(&self) {
        let mut inner = self.inner.lock().await;
        for tx in inner.waiters.drain(..) {
            let _ = tx.send(());
        }
        for slot in &inner.slots {
            slot.worker.kill().await;
        }
    }
}

/// A `Worker` checked out of a `Pool` via [`Pool::get_worker`]. Held out of
/// the pool's normal dispatch until released, so the holder can submit
/// several tasks to the same `Worker` in a row (for instance, to build up
/// state in its `Environment`) without another caller's `enqueue` landing
/// on it in between.
pub struct WorkerLease<T: Task> {
    pool: Pool<T>,
    worker: Option<Arc<Worker<T>>>,
}

impl<T: Task> WorkerLease<T> {
    /// The leased worker.
    pub fn worker(&self) -> &Arc<Worker<T>> {
        self.worker.as_ref().expect("lease already released")
    }

    /// Submits a task directly to the leased worker.
    pub async fn enqueue(&self, task: T) -> Result<T::Output> {
        self.worker().enqueue(task).await
    }

    /// Returns the worker to the pool's normal dispatch.
    pub async fn release(mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.release_worker(&worker).await;
        }
    }
}

impl<T: Task> Drop for WorkerLease<T> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                pool.release_worker(&worker).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::error::TaskFailure;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct AddOne(i64);

    impl Task for AddOne {
        type Output = i64;

        fn run(&self, _env: &Environment) -> std::result::Result<i64, TaskFailure> {
            Ok(self.0 + 1)
        }
    }

    #[tokio::test]
    async fn enqueue_runs_on_a_thread_worker() {
        let pool = Pool::<AddOne>::new(PoolConfig {
            max_size: 2,
            max_concurrency_per_worker: NonZeroUsize::new(1).unwrap(),
            backend: WorkerBackend::Thread,
        });

        let result = pool.enqueue(AddOne(41)).await.unwrap();
        assert_eq!(result, 42);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn leased_worker_runs_several_tasks_in_a_row() {
        let pool = Pool::<AddOne>::new(PoolConfig {
            max_size: 2,
            max_concurrency_per_worker: NonZeroUsize::new(1).unwrap(),
            backend: WorkerBackend::Thread,
        });

        let lease = pool.get_worker().await;
        assert_eq!(lease.enqueue(AddOne(1)).await.unwrap(), 2);
        assert_eq!(lease.enqueue(AddOne(2)).await.unwrap(), 3);
        lease.release().await;

        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn concurrent_enqueues_grow_the_pool_up_to_max_size() {
        let pool = Pool::<AddOne>::new(PoolConfig {
            max_size: 2,
            max_concurrency_per_worker: NonZeroUsize::new(1).unwrap(),
            backend: WorkerBackend::Thread,
        });

        let a = pool.enqueue(AddOne(1));
        let b = pool.enqueue(AddOne(2));
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap(), 2);
        assert_eq!(b.unwrap(), 3);
        assert_eq!(pool.size(), 2);
    }
}
