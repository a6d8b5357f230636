// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end coverage over a real child process: spawns the `echo_worker`
//! companion binary, round-trips jobs through it via a `Worker`, and shuts
//! it down cleanly.

use parallel_pool::context::ContextConfig;
use parallel_pool::fixtures::Echo;
use parallel_pool::worker::Worker;

fn echo_worker_config() -> ContextConfig {
    ContextConfig {
        executable: Some(env!("CARGO_BIN_EXE_echo_worker").into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn single_job_round_trips_through_a_child_process() {
    let worker = Worker::<Echo>::new_process(echo_worker_config());

    let result = worker.enqueue(Echo::new("hello from the parent")).await.unwrap();
    assert_eq!(result, "hello from the parent");

    let code = worker.shutdown().await.unwrap();
    assert_eq!(code, 0);
}

#[tokio::test]
async fn concurrent_jobs_share_one_child_process() {
    let worker = Worker::<Echo>::new_process(echo_worker_config());

    let a = worker.enqueue(Echo::new("a"));
    let b = worker.enqueue(Echo::new("b"));
    let c = worker.enqueue(Echo::new("c"));
    let (a, b, c) = tokio::join!(a, b, c);

    assert_eq!(a.unwrap(), "a");
    assert_eq!(b.unwrap(), "b");
    assert_eq!(c.unwrap(), "c");

    assert_eq!(worker.shutdown().await.unwrap(), 0);
}

#[tokio::test]
async fn killing_a_worker_fails_its_pending_job() {
    let worker = Worker::<Echo>::new_process(echo_worker_config());

    let pending = worker.enqueue(Echo::new("never arrives"));
    worker.kill().await;

    assert!(pending.await.is_err());
}

#[tokio::test]
async fn jobs_complete_out_of_order_and_correlate_by_id() {
    let worker = Worker::<Echo>::new_process(echo_worker_config());

    let slow = worker.enqueue(Echo::after("slow", 150));
    let fast = worker.enqueue(Echo::after("fast", 10));

    // `fast` was submitted second but sleeps far less than `slow`; it
    // must resolve well before `slow` does, which is only possible if
    // the child actually ran both concurrently rather than serializing
    // them. Racing against a short timeout makes that a hard assertion
    // rather than an ordering assumption.
    let fast_result = tokio::select! {
        biased;
        result = fast => result,
        _ = tokio::time::sleep(std::time::Duration::from_millis(80)) => {
            panic!("fast job should have completed well before the slow one");
        }
    };
    assert_eq!(fast_result.unwrap(), "fast");

    let slow_result = slow.await.unwrap();
    assert_eq!(slow_result, "slow");

    assert_eq!(worker.shutdown().await.unwrap(), 0);
}
