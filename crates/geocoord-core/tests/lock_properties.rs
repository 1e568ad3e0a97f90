//! Lock manager behaviour across simulated instances sharing one store.

mod common;

use std::time::Duration;

use common::SimCluster;
use geocoord_core::config::JobMode;
use geocoord_core::testing::FaultMode;
use geocoord_core::{CoordError, FencedResource, FencingToken, LockHandle};
use proptest::prelude::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_acquire_exactly_one_wins() {
    let cluster = SimCluster::new(2, JobMode::Polling);
    let a = cluster.instances[0].locks.clone();
    let b = cluster.instances[1].locks.clone();

    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { a.acquire("layer:buildings", Duration::from_secs(5)).await }),
        tokio::spawn(async move { b.acquire("layer:buildings", Duration::from_secs(5)).await }),
    );
    let results = [ra.unwrap(), rb.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(matches!(loser, CoordError::LockContention { resource, .. } if resource == "layer:buildings"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_instances_one_holder_per_round() {
    let cluster = SimCluster::new(8, JobMode::Polling);
    let mut last_token = FencingToken::new(0);

    for _round in 0..10 {
        let tasks: Vec<_> = cluster
            .instances
            .iter()
            .map(|inst| {
                let locks = inst.locks.clone();
                tokio::spawn(async move { locks.acquire("tileset:roads", Duration::from_secs(5)).await })
            })
            .collect();

        let mut winners: Vec<LockHandle> = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok(handle) => winners.push(handle),
                Err(CoordError::LockContention { .. }) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(winners.len(), 1);
        let mut handle = winners.pop().unwrap();
        assert!(handle.fencing_token() > last_token);
        last_token = handle.fencing_token();
        handle.release().await.unwrap();
    }
    assert_eq!(last_token, FencingToken::new(10));
}

#[tokio::test]
async fn test_stale_holder_is_fenced_after_expiry() {
    let cluster = SimCluster::new(2, JobMode::Polling);
    let a = &cluster.instances[0].locks;
    let b = &cluster.instances[1].locks;
    let resource = FencedResource::new();

    let mut stale = a.acquire("layer:parcels", Duration::from_secs(5)).await.unwrap();
    resource.check("layer:parcels", stale.fencing_token()).unwrap();

    // a pauses past its lease; b takes over and writes.
    cluster.advance(5_000);
    let fresh = b.acquire("layer:parcels", Duration::from_secs(5)).await.unwrap();
    assert!(fresh.fencing_token() > stale.fencing_token());
    resource.check("layer:parcels", fresh.fencing_token()).unwrap();

    // a wakes up: its late write and renewal are both rejected.
    assert!(matches!(
        resource.check("layer:parcels", stale.fencing_token()),
        Err(CoordError::LeaseExpired { .. })
    ));
    assert!(matches!(
        stale.renew(Duration::from_secs(5)).await,
        Err(CoordError::LeaseExpired { .. })
    ));
    // Releasing the stale handle must not free b's lock.
    let _ = stale.release().await;
    let current = b.current("layer:parcels").await.unwrap().unwrap();
    assert_eq!(current.fencing_token, fresh.fencing_token());
}

#[tokio::test]
async fn test_contention_and_store_outage_are_distinct() {
    let cluster = SimCluster::new(2, JobMode::Polling);
    let _held = cluster.instances[0]
        .locks
        .acquire("layer:water", Duration::from_secs(5))
        .await
        .unwrap();

    let err = cluster.instances[1]
        .locks
        .acquire("layer:water", Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::LockContention { .. }));

    cluster.instances[1].set_store_mode(FaultMode::Fail);
    let err = cluster.instances[1]
        .locks
        .acquire("layer:water", Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::StoreUnavailable { .. }));

    cluster.instances[1].set_store_mode(FaultMode::Hang);
    let err = cluster.instances[1]
        .locks
        .acquire("layer:water", Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::StoreUnavailable { .. }));
    assert_eq!(cluster.instances[1].health.consecutive_failures(), 2);
}

#[derive(Debug, Clone)]
enum Op {
    Acquire(usize),
    Release(usize),
    Renew(usize),
    Advance(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..3).prop_map(Op::Acquire),
        (0usize..3).prop_map(Op::Release),
        (0usize..3).prop_map(Op::Renew),
        (0u64..4_000).prop_map(Op::Advance),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_single_live_holder_and_increasing_tokens(ops in proptest::collection::vec(op_strategy(), 1..80)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let violations = rt.block_on(async move {
            let cluster = SimCluster::new(3, JobMode::Polling);
            let ttl = Duration::from_secs(3);
            let mut held: Vec<Option<LockHandle>> = vec![None, None, None];
            let mut highest = FencingToken::new(0);
            let mut violations = Vec::new();

            for op in ops {
                match op {
                    Op::Acquire(i) => {
                        if let Ok(handle) = cluster.instances[i].locks.acquire("k", ttl).await {
                            if handle.fencing_token() <= highest {
                                violations.push(format!("token {} not above {}", handle.fencing_token(), highest));
                            }
                            highest = handle.fencing_token();
                            held[i] = Some(handle);
                        }
                    }
                    Op::Release(i) => {
                        if let Some(mut handle) = held[i].take() {
                            let _ = handle.release().await;
                        }
                    }
                    Op::Renew(i) => {
                        if let Some(handle) = held[i].as_mut() {
                            if handle.renew(ttl).await.is_err() {
                                held[i] = None;
                            }
                        }
                    }
                    Op::Advance(ms) => cluster.advance(ms),
                }

                let now = cluster.now_ms();
                let live = held
                    .iter()
                    .flatten()
                    .filter(|h| h.expires_at_ms() > now)
                    .count();
                if live > 1 {
                    violations.push(format!("{} live holders at {}", live, now));
                }
            }
            violations
        });
        prop_assert!(violations.is_empty(), "{:?}", violations);
    }
}
