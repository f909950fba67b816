//! Property-based tests for connection pool bounds
//!
//! Whatever the sizing and the number of concurrent callers, the pool must
//! never open more sessions than its maximum, and every checkout must be
//! returned once its holder is done.

use std::sync::Arc;
use std::time::Duration;

use pgwarden::{Pool, PoolSettings, PoolSize, PoolState};
use pgwarden_testing::FakeManager;
use proptest::prelude::*;

fn settings(max: u8, min: usize) -> PoolSettings {
    PoolSettings {
        max_connections: PoolSize::new(max).expect("valid pool size"),
        min_connections: min,
        acquire_timeout: Duration::from_secs(10),
        drain_timeout: Duration::from_secs(5),
        maintenance_interval: Duration::from_secs(3600),
        ..PoolSettings::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: live sessions never exceed max, under any contention
    #[test]
    fn prop_pool_never_exceeds_max(
        max in 1u8..8,
        min_fraction in 0usize..=100,
        callers in 1usize..24,
        hold_ms in 0u64..3,
    ) {
        let min = max as usize * min_fraction / 100;
        tokio_test::block_on(async {
            let manager = FakeManager::new();
            let pool = Pool::connect(manager.clone(), settings(max, min))
                .await
                .expect("pool should connect");

            let mut handles = Vec::new();
            for _ in 0..callers {
                let pool = pool.clone();
                handles.push(tokio::spawn(async move {
                    let conn = pool.acquire().await?;
                    tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                    let stats = pool.stats();
                    drop(conn);
                    Ok::<_, pgwarden::WardenError>(stats)
                }));
            }

            for handle in handles {
                let stats = handle.await.expect("task should not panic").expect("acquire should succeed");
                prop_assert!(stats.total <= max as usize);
                prop_assert!(stats.in_use <= max as usize);
            }

            prop_assert!(manager.peak() <= max as usize);
            let stats = pool.stats();
            prop_assert_eq!(stats.in_use, 0);
            prop_assert_eq!(stats.state, PoolState::Connected);

            pool.shutdown().await;
            prop_assert_eq!(manager.live(), 0);
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn waiters_are_served_in_turn_when_pool_is_tiny() {
    let manager = FakeManager::new();
    let pool = Arc::new(
        Pool::connect(manager.clone(), settings(1, 1))
            .await
            .expect("pool should connect"),
    );

    let mut handles = Vec::new();
    for _ in 0..10 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            let _conn = pool.acquire().await.expect("acquire should succeed");
            tokio::task::yield_now().await;
        }));
    }
    for handle in handles {
        handle.await.expect("task should not panic");
    }

    assert_eq!(manager.peak(), 1);
    assert_eq!(manager.connects(), 1);
    pool.shutdown().await;
}
