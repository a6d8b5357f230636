// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::num::NonZeroUsize;
use std::time::Duration;

use parallel_pool::environment::Environment;
use parallel_pool::error::TaskFailure;
use parallel_pool::pool::{Pool, PoolConfig, WorkerBackend};
use parallel_pool::task::Task;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Sleep(u64);

impl Task for Sleep {
    type Output = u64;

    fn run(&self, _env: &Environment) -> Result<u64, TaskFailure> {
        std::thread::sleep(Duration::from_millis(self.0));
        Ok(self.0)
    }
}

fn config(max_size: usize) -> PoolConfig {
    PoolConfig {
        max_size,
        max_concurrency_per_worker: NonZeroUsize::new(1).unwrap(),
        backend: WorkerBackend::Thread,
    }
}

#[tokio::test]
async fn pool_grows_lazily_up_to_max_size() {
    let pool = Pool::<Sleep>::new(config(3));
    assert_eq!(pool.size(), 0);

    let jobs: Vec<_> = (0..3).map(|_| pool.enqueue(Sleep(20))).collect();
    futures::future::join_all(jobs).await;

    assert_eq!(pool.size(), 3);
}

#[tokio::test]
async fn pool_reuses_idle_workers_instead_of_growing_past_demand() {
    let pool = Pool::<Sleep>::new(config(4));

    pool.enqueue(Sleep(5)).await.unwrap();
    pool.enqueue(Sleep(5)).await.unwrap();
    pool.enqueue(Sleep(5)).await.unwrap();

    // Three sequential jobs never overlap, so one worker should have
    // handled all of them.
    assert_eq!(pool.size(), 1);
}

#[tokio::test]
async fn extra_jobs_queue_until_a_worker_frees_up_at_max_size() {
    let pool = Pool::<Sleep>::new(config(2));

    let jobs: Vec<_> = (0..5).map(|_| pool.enqueue(Sleep(15))).collect();
    let results = futures::future::join_all(jobs).await;

    assert!(results.into_iter().all(|r| r.is_ok()));
    assert_eq!(pool.size(), 2);
}

#[tokio::test]
async fn dead_worker_is_evicted_instead_of_reidled() {
    let pool = Pool::<Sleep>::new(config(2));

    let lease = pool.get_worker().await;
    lease.worker().kill().await;
    lease.release().await;

    assert_eq!(pool.size(), 0);
}

#[tokio::test]
async fn shutdown_stops_every_worker() {
    let pool = Pool::<Sleep>::new(config(2));
    pool.enqueue(Sleep(1)).await.unwrap();
    pool.enqueue(Sleep(1)).await.unwrap();
    pool.shutdown().await.unwrap();
}
