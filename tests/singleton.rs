//! The process-wide pool and its debounced reset.

use pdfraster::testing::EngineScript;
use pdfraster::{PipelineConfig, RecoveryBus, WorkerPool};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

fn fresh_pool() -> Arc<WorkerPool> {
    let (factory, _probe) = EngineScript::new(1).into_factory();
    let config = PipelineConfig::builder().reset_grace_ms(50).build().unwrap();
    WorkerPool::with_bus(config, factory, RecoveryBus::default())
}

/// Drop whatever instance an earlier test left behind.
async fn clear_instance() {
    WorkerPool::reset_instance();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(WorkerPool::current_instance().is_none());
}

#[tokio::test]
#[serial]
async fn get_instance_returns_one_shared_pool() {
    clear_instance().await;
    let first = WorkerPool::get_instance(fresh_pool);
    let second = WorkerPool::get_instance(|| unreachable!("pool already exists"));
    assert!(Arc::ptr_eq(&first, &second));
    clear_instance().await;
}

#[tokio::test]
#[serial]
async fn reset_takes_effect_after_the_grace_window() {
    clear_instance().await;
    let pool = WorkerPool::get_instance(fresh_pool);

    WorkerPool::reset_instance();
    WorkerPool::reset_instance();
    assert!(WorkerPool::current_instance().is_some());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(WorkerPool::current_instance().is_none());
    assert!(pool.stats().terminated);
}

#[tokio::test]
#[serial]
async fn get_instance_within_the_window_cancels_the_reset() {
    clear_instance().await;
    let pool = WorkerPool::get_instance(fresh_pool);

    WorkerPool::reset_instance();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let again = WorkerPool::get_instance(fresh_pool);
    assert!(Arc::ptr_eq(&pool, &again));

    tokio::time::sleep(Duration::from_millis(150)).await;
    let current = WorkerPool::current_instance().expect("reset was cancelled");
    assert!(Arc::ptr_eq(&pool, &current));
    assert!(!pool.stats().terminated);
    clear_instance().await;
}

#[test]
#[serial]
fn reset_outside_a_runtime_is_immediate() {
    WorkerPool::reset_instance();
    let pool = WorkerPool::get_instance(fresh_pool);
    // Any reset left pending by an earlier test was cancelled above.
    WorkerPool::reset_instance();
    assert!(WorkerPool::current_instance().is_none());
    assert!(pool.stats().terminated);
}
