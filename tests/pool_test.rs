//! Integration tests for the bounded worker pool.

use brokerq::pool::Pool;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;

// ---------------------------------------------------------------------------
// Concurrency bound
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_runs_more_than_size_tasks() {
    let pool = Pool::new(3).unwrap();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..20 {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        let done = Arc::clone(&done);
        pool.submit(async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            done.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(())
        })
        .await
        .unwrap();
    }

    timeout(Duration::from_secs(5), pool.drain())
        .await
        .expect("drain timed out");
    assert_eq!(done.load(Ordering::SeqCst), 20);
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 3, "peak concurrency was {peak}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submit_blocks_while_every_slot_is_taken() {
    let pool = Pool::new(2).unwrap();
    let gate = Arc::new(Semaphore::new(0));

    for _ in 0..2 {
        let gate = Arc::clone(&gate);
        pool.submit(async move {
            let _permit = gate.acquire().await?;
            anyhow::Ok(())
        })
        .await
        .unwrap();
    }
    assert_eq!(pool.pending() + pool.in_flight(), 2);

    // Full: a third submission must wait.
    let blocked = timeout(
        Duration::from_millis(100),
        pool.submit(async { anyhow::Ok(()) }),
    )
    .await;
    assert!(blocked.is_err(), "submit should block while the pool is full");

    // Free one slot; the next submission goes through.
    gate.add_permits(1);
    timeout(Duration::from_secs(2), pool.submit(async { anyhow::Ok(()) }))
        .await
        .expect("submit should resume after a completion")
        .unwrap();

    gate.add_permits(1);
    timeout(Duration::from_secs(2), pool.drain())
        .await
        .expect("drain timed out");
    assert_eq!(pool.in_flight(), 0);
    assert_eq!(pool.pending(), 0);
}

// ---------------------------------------------------------------------------
// Failure isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_and_panicking_tasks_do_not_stop_the_worker() {
    let pool = Pool::new(1).unwrap();
    let ran = Arc::new(AtomicBool::new(false));

    pool.submit(async { Err::<(), _>(anyhow::anyhow!("task exploded")) })
        .await
        .unwrap();
    pool.submit(async {
        if true {
            panic!("task panicked");
        }
        anyhow::Ok(())
    })
    .await
    .unwrap();
    let flag = Arc::clone(&ran);
    pool.submit(async move {
        flag.store(true, Ordering::SeqCst);
        anyhow::Ok(())
    })
    .await
    .unwrap();

    timeout(Duration::from_secs(2), pool.drain())
        .await
        .expect("drain timed out");
    assert!(ran.load(Ordering::SeqCst));
}

// ---------------------------------------------------------------------------
// Construction and drain
// ---------------------------------------------------------------------------

#[tokio::test]
async fn drain_on_idle_pool_returns_immediately() {
    let pool = Pool::new(4).unwrap();
    assert_eq!(pool.size(), 4);
    timeout(Duration::from_millis(100), pool.drain())
        .await
        .expect("idle pool should drain at once");
}

#[tokio::test]
async fn zero_sized_pool_is_rejected() {
    assert!(matches!(Pool::new(0), Err(brokerq::Error::Config(_))));
}
