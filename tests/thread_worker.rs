// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Thread-backed `Worker` coverage: no serialization or process spawn is
//! involved, so these exercise the multiplexing and `Environment` paths
//! directly rather than the wire protocol (see `process_worker.rs` for
//! that).

use parallel_pool::fixtures::{AlwaysFails, Echo, RoundTripEnvironment};
use parallel_pool::worker::Worker;

#[tokio::test]
async fn thread_worker_round_trips_a_job() {
    let worker = Worker::<Echo>::new_thread();
    let result = worker.enqueue(Echo::new("ping")).await.unwrap();
    assert_eq!(result, "ping");
    assert_eq!(worker.shutdown().await.unwrap(), 0);
}

#[tokio::test]
async fn thread_worker_is_idle_between_jobs() {
    let worker = Worker::<Echo>::new_thread();
    assert!(worker.is_idle());
    let handle = worker.enqueue(Echo::new("x"));
    handle.await.unwrap();
    assert!(worker.is_idle());
    assert_eq!(worker.pending_count(), 0);
}

#[tokio::test]
async fn environment_persists_across_jobs_on_the_same_worker() {
    let worker = Worker::<RoundTripEnvironment>::new_thread();

    let first = worker
        .enqueue(RoundTripEnvironment {
            key: "counter".into(),
            value: 1,
        })
        .await
        .unwrap();
    assert_eq!(first, 1);

    let second = worker
        .enqueue(RoundTripEnvironment {
            key: "counter".into(),
            value: 2,
        })
        .await
        .unwrap();
    assert_eq!(second, 2);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn jobs_complete_out_of_order_and_correlate_by_id() {
    let worker = Worker::<Echo>::new_thread();

    let slow = worker.enqueue(Echo::after("slow", 150));
    let fast = worker.enqueue(Echo::after("fast", 10));

    let fast_result = tokio::select! {
        biased;
        result = fast => result,
        _ = tokio::time::sleep(std::time::Duration::from_millis(80)) => {
            panic!("fast job should have completed well before the slow one");
        }
    };
    assert_eq!(fast_result.unwrap(), "fast");
    assert_eq!(slow.await.unwrap(), "slow");

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn a_failing_task_surfaces_as_a_panic_error_without_killing_the_worker() {
    let worker = Worker::<AlwaysFails>::new_thread();

    let err = worker.enqueue(AlwaysFails("boom".into())).await.unwrap_err();
    assert!(matches!(err, parallel_pool::error::PoolError::PanicError(_)));

    // The worker itself is unaffected; it can still take more work.
    assert!(worker.is_running());
    worker.shutdown().await.unwrap();
}
