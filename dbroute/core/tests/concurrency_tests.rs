//! Concurrency tests
//!
//! Execution contexts are confined to their thread or task, while the entity
//! registry and failure tracker are shared by all of them.

mod common;

use std::sync::{Arc, Barrier};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::task::JoinSet;

use dbroute_core::{context, ConnectionDescriptor, RouterError};

use common::{failing_on, ran_on, Harness};

const WORKERS: usize = 8;

#[test]
fn test_threads_do_not_see_each_other() {
    let h = Harness::new().order(&["S1", "S2"]);
    let barrier = Arc::new(Barrier::new(WORKERS));

    std::thread::scope(|s| {
        for worker in 0..WORKERS {
            let router = h.router.clone();
            let barrier = Arc::clone(&barrier);
            s.spawn(move || {
                let own = ConnectionDescriptor::new(format!("W{worker}"));
                router
                    .with_connection("Order", &own, |conn| {
                        // every worker is inside its own block at this point
                        barrier.wait();
                        assert_eq!(context::current_depth("Order"), 1);
                        assert_eq!(
                            context::active_connection("Order").map(|c| c.name().to_string()),
                            Some(conn.name().to_string())
                        );
                        barrier.wait();
                        Ok(())
                    })
                    .unwrap();
                assert!(context::is_top_level("Order"));
            });
        }
    });
}

#[test]
fn test_failure_visible_across_threads() {
    let h = Harness::new().order(&["S1", "S2"]);
    let s1 = ConnectionDescriptor::new("S1");

    std::thread::scope(|s| {
        s.spawn(|| {
            let on = h
                .router
                .with_slave_on("Order", Some(&s1), failing_on(&["S1"]))
                .unwrap();
            assert_eq!(on, "S2");
        });
    });

    std::thread::scope(|s| {
        for _ in 0..WORKERS {
            s.spawn(|| {
                for _ in 0..20 {
                    assert_eq!(h.router.with_slave("Order", ran_on).unwrap(), "S2");
                }
            });
        }
    });
}

#[test]
fn test_forcing_override_stays_on_its_thread() {
    let h = Harness::new().order(&["S1"]);

    h.router.with_forced_slave_reads("Order", true, || {
        assert_eq!(h.router.first_level_on_slave("Order", ran_on).unwrap(), "S1");
        std::thread::scope(|s| {
            s.spawn(|| {
                assert!(!h.router.force_slave_reads("Order"));
                assert_eq!(h.router.first_level_on_slave("Order", ran_on).unwrap(), "M");
            });
        });
    });
}

#[test]
fn test_process_wide_forcing_reaches_every_thread() {
    let h = Harness::new().order(&["S1"]);
    h.router.set_force_slave_reads(true);

    std::thread::scope(|s| {
        for _ in 0..WORKERS {
            s.spawn(|| {
                assert_eq!(h.router.first_level_on_slave("Order", ran_on).unwrap(), "S1");
            });
        }
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tasks_keep_their_own_context() {
    let h = Harness::new().order(&["S1"]);
    let mut tasks = JoinSet::new();

    for worker in 0..WORKERS {
        let router = h.router.clone();
        tasks.spawn(async move {
            let own = ConnectionDescriptor::new(format!("T{worker}"));
            router
                .with_connection_async("Order", &own, |conn| async move {
                    for _ in 0..10 {
                        // may resume on another worker thread
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        let active = context::active_connection("Order")
                            .map(|c| c.name().to_string());
                        assert_eq!(active, Some(conn.name().to_string()));
                        assert_eq!(context::current_depth("Order"), 1);
                    }
                    Ok::<_, RouterError>(conn.name().to_string())
                })
                .await
        });
    }

    let mut finished = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        finished.push(joined.unwrap().unwrap());
    }
    finished.sort();
    let mut expected: Vec<String> = (0..WORKERS).map(|w| format!("T{w}")).collect();
    expected.sort();
    assert_eq!(finished, expected);
}

#[tokio::test]
async fn test_child_scope_inherits_remappings_not_depth() {
    let h = Harness::new().order(&["S1"]);
    h.factory.establish("cache");
    let mut table = std::collections::HashMap::new();
    table.insert("master".to_string(), ConnectionDescriptor::new("cache"));

    context::scope(async {
        context::set_remappings(table).unwrap();
        let router = h.router.clone();
        let nested = h
            .router
            .with_slave_async("Order", |_| {
                let router = router.clone();
                async move {
                    // a fresh scope starts at depth zero, so the remap applies again
                    let remapped = context::scope(router.with_master_async("Order", |conn| async move {
                        Ok::<_, RouterError>(conn.name().to_string())
                    }))
                    .await?;
                    assert_eq!(remapped, "cache");

                    // nested in the current scope it does not
                    router
                        .with_master_async("Order", |conn| async move {
                            Ok::<_, RouterError>(conn.name().to_string())
                        })
                        .await
                }
            })
            .await
            .unwrap();
        assert_eq!(nested, "M");
    })
    .await;
}

#[tokio::test]
async fn test_joined_blocks_in_one_task_keep_their_own_nesting() {
    let h = Harness::new().order(&["S1"]);
    h.factory.establish("cache");
    let mut table = std::collections::HashMap::new();
    table.insert("master".to_string(), ConnectionDescriptor::new("cache"));

    context::scope(async {
        context::set_remappings(table).unwrap();

        let block = |name: &'static str, pause_ms: u64| {
            let router = h.router.clone();
            async move {
                router
                    .with_connection_async("Order", &ConnectionDescriptor::new(name), |conn| async move {
                        // "A" finishes while "B" is still open
                        tokio::time::sleep(Duration::from_millis(pause_ms)).await;
                        assert_eq!(
                            context::active_connection("Order").map(|c| c.name().to_string()),
                            Some(conn.name().to_string())
                        );
                        assert_eq!(context::current_depth("Order"), 1);
                        Ok::<_, RouterError>(conn.name().to_string())
                    })
                    .await
            }
        };
        let (a, b) = tokio::join!(block("A", 10), block("B", 50));
        assert_eq!((a.unwrap(), b.unwrap()), ("A".to_string(), "B".to_string()));

        assert!(context::is_top_level("Order"));
        assert!(context::active_connection("Order").is_none());
        let master = h
            .router
            .with_master_async("Order", |conn| async move {
                Ok::<_, RouterError>(conn.name().to_string())
            })
            .await
            .unwrap();
        assert_eq!(master, "cache");
    })
    .await;
}
