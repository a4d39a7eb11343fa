use std::sync::Arc;
use std::time::Duration;

use billing_state::backend::MemoryLocks;
use billing_state::{LeaseCoordinator, RetryStrategy, StateError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const TTL: Duration = Duration::from_secs(60);

fn coordinator() -> (Arc<MemoryLocks>, LeaseCoordinator) {
    let locks = Arc::new(MemoryLocks::new());
    (locks.clone(), LeaseCoordinator::new(locks))
}

#[tokio::test(start_paused = true)]
async fn only_one_concurrent_acquirer_wins() {
    let (_, leases) = coordinator();
    let cancel = CancellationToken::new();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let leases = leases.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            leases
                .acquire(&cancel, "sub_1-populate", TTL, &RetryStrategy::no_retry())
                .await
        }));
    }

    let mut winners = Vec::new();
    let mut losers = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(lease) => winners.push(lease),
            Err(e) => {
                assert!(e.is_contention(), "unexpected error: {e}");
                losers += 1;
            }
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(losers, 7);
}

#[tokio::test(start_paused = true)]
async fn waiter_obtains_lease_after_release() {
    let (_, leases) = coordinator();
    let cancel = CancellationToken::new();
    let mut holder = leases
        .acquire(&cancel, "mutex-ds", TTL, &RetryStrategy::no_retry())
        .await
        .unwrap();

    let waiter = {
        let leases = leases.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let retry =
                RetryStrategy::exponential(Duration::from_millis(100), Duration::from_secs(1))
                    .with_max_wait(Duration::from_secs(5));
            leases.acquire(&cancel, "mutex-ds", TTL, &retry).await
        })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    holder.release().await;
    assert!(holder.is_released());

    let lease = waiter.await.unwrap().unwrap();
    assert_eq!(lease.key(), "mutex-ds");
}

#[tokio::test(start_paused = true)]
async fn acquisition_gives_up_within_budget() {
    let (_, leases) = coordinator();
    let cancel = CancellationToken::new();
    let _holder = leases
        .acquire(&cancel, "mutex-ds", TTL, &RetryStrategy::no_retry())
        .await
        .unwrap();

    let retry = RetryStrategy::exponential(Duration::from_millis(100), Duration::from_millis(400))
        .with_max_wait(Duration::from_secs(1));
    let started = Instant::now();
    let err = leases
        .acquire(&cancel, "mutex-ds", TTL, &retry)
        .await
        .unwrap_err();

    assert!(matches!(err, StateError::NotObtained { ref key } if key == "mutex-ds"));
    assert!(started.elapsed() <= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_backoff() {
    let (_, leases) = coordinator();
    let cancel = CancellationToken::new();
    let _holder = leases
        .acquire(&cancel, "mutex-ds", TTL, &RetryStrategy::no_retry())
        .await
        .unwrap();

    let waiter_cancel = CancellationToken::new();
    let waiter = {
        let leases = leases.clone();
        let cancel = waiter_cancel.clone();
        tokio::spawn(async move {
            let retry = RetryStrategy::exponential(Duration::from_secs(1), Duration::from_secs(10))
                .with_max_wait(Duration::from_secs(600));
            leases.acquire(&cancel, "mutex-ds", TTL, &retry).await
        })
    };

    tokio::time::sleep(Duration::from_millis(2500)).await;
    waiter_cancel.cancel();
    let err = waiter.await.unwrap().unwrap_err();
    assert!(err.is_canceled());
}

#[tokio::test(start_paused = true)]
async fn refresh_fails_once_lease_expired() {
    let (locks, leases) = coordinator();
    let cancel = CancellationToken::new();
    let lease = leases
        .acquire(
            &cancel,
            "sub_1-populate",
            Duration::from_secs(1),
            &RetryStrategy::no_retry(),
        )
        .await
        .unwrap();

    lease.refresh(&cancel, Duration::from_secs(1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let err = lease
        .refresh(&cancel, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::LeaseExpired { .. }));
    assert!(locks.holder("sub_1-populate").is_none());
}

#[tokio::test(start_paused = true)]
async fn dropped_lease_is_released_in_background() {
    let (locks, leases) = coordinator();
    let cancel = CancellationToken::new();
    let lease = leases
        .acquire(&cancel, "mutex-ds", TTL, &RetryStrategy::no_retry())
        .await
        .unwrap();
    assert!(locks.holder("mutex-ds").is_some());

    drop(lease);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(locks.holder("mutex-ds").is_none());
    leases
        .acquire(&cancel, "mutex-ds", TTL, &RetryStrategy::no_retry())
        .await
        .unwrap();
}
