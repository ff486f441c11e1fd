use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use scheduler_domain::{
    Clock, Execution, ExecutionKey, ExecutionStore, RescheduleUpdate, SchedulerState,
    SettableClock, TaskInstance, Tasks,
};
use scheduler_infrastructure::{InMemoryExecutionStore, MetricsCollector};
use scheduler_testing_utils::{test_time, BlockingHandler, TestEnv};
use scheduler_worker::{CurrentlyExecutingMap, ExecutionRunner, HeartbeatManager, WorkerPool};

struct Engine {
    store: Arc<InMemoryExecutionStore>,
    clock: SettableClock,
    executing: Arc<CurrentlyExecutingMap>,
    runner: Arc<ExecutionRunner>,
    heartbeats: HeartbeatManager,
    pool: WorkerPool,
}

fn engine() -> Engine {
    let store = Arc::new(InMemoryExecutionStore::new());
    let clock = SettableClock::new(test_time());
    let executing = Arc::new(CurrentlyExecutingMap::new());
    let runner = Arc::new(ExecutionRunner::new(
        store.clone(),
        Arc::new(clock.clone()),
        executing.clone(),
        MetricsCollector::new(),
        "node-a",
        SchedulerState::new(),
    ));
    let heartbeats = HeartbeatManager::new(
        store.clone(),
        Arc::new(clock.clone()),
        executing.clone(),
        MetricsCollector::new(),
        Duration::from_secs(10),
    );
    Engine {
        store,
        clock,
        executing,
        runner,
        heartbeats,
        pool: WorkerPool::new(4),
    }
}

async fn claim(engine: &Engine, id: &str) -> Execution {
    let instance = TaskInstance::new("long", id);
    let key = instance.key();
    engine
        .store
        .insert(&Execution::new(instance, test_time()))
        .await
        .unwrap();
    assert!(engine
        .store
        .try_claim(&key, 1, "node-a", engine.clock.now())
        .await
        .unwrap());
    engine.store.get(&key).await.unwrap().unwrap()
}

/// 心跳推进版本后，完成写入使用最新版本
#[tokio::test]
async fn test_completion_uses_version_after_heartbeats() {
    let engine = engine();
    let blocking = BlockingHandler::new();
    let task = Arc::new(
        Tasks::one_time("long")
            .execute(blocking.handler()),
    );
    let claimed = claim(&engine, "1").await;
    let key = claimed.key();

    let permit = engine.pool.try_acquire().unwrap();
    let running = engine.runner.dispatch(task, claimed, permit).await;
    assert!(blocking.wait_started(1, Duration::from_secs(2)).await);

    for _ in 0..3 {
        engine.clock.advance(ChronoDuration::seconds(10));
        assert_eq!(engine.heartbeats.update_heartbeats().await.renewed, 1);
    }
    assert_eq!(engine.store.get(&key).await.unwrap().unwrap().version, 5);

    blocking.release();
    running.await.unwrap();

    assert!(engine.store.get(&key).await.unwrap().is_none());
    assert!(engine.executing.is_empty().await);
    assert_eq!(engine.pool.free_slots(), 4);
}

/// 执行期间被其他进程复活并重新认领：心跳失败，完成结果被丢弃，新持有者不受影响
#[tokio::test]
async fn test_taken_over_execution_discards_result() {
    let engine = engine();
    let blocking = BlockingHandler::new();
    let task = Arc::new(Tasks::one_time("long").execute(blocking.handler()));
    let claimed = claim(&engine, "1").await;
    let key: ExecutionKey = claimed.key();

    let permit = engine.pool.try_acquire().unwrap();
    let running = engine.runner.dispatch(task, claimed, permit).await;
    assert!(blocking.wait_started(1, Duration::from_secs(2)).await);

    // 另一个进程判定死亡、复活并重新认领
    assert!(engine
        .store
        .reschedule(&key, 2, &RescheduleUpdate::revive(engine.clock.now()))
        .await
        .unwrap());
    assert!(engine
        .store
        .try_claim(&key, 3, "node-b", engine.clock.now())
        .await
        .unwrap());

    let report = engine.heartbeats.update_heartbeats().await;
    assert_eq!(report.lost, 1);

    blocking.release();
    running.await.unwrap();

    let stored = engine.store.get(&key).await.unwrap().unwrap();
    assert!(stored.picked);
    assert_eq!(stored.picked_by.as_deref(), Some("node-b"));
    assert_eq!(stored.version, 4);
}

/// 多个执行并发占用槽位
#[tokio::test]
async fn test_pool_slots_track_running_executions() {
    let engine = engine();
    let blocking = BlockingHandler::new();
    let task = Arc::new(Tasks::one_time("long").execute(blocking.handler()));

    let mut handles = Vec::new();
    for id in ["a", "b", "c"] {
        let claimed = claim(&engine, id).await;
        let permit = engine.pool.try_acquire().unwrap();
        handles.push(engine.runner.dispatch(task.clone(), claimed, permit).await);
    }
    assert!(blocking.wait_started(3, Duration::from_secs(2)).await);
    assert_eq!(engine.pool.free_slots(), 1);
    assert_eq!(engine.executing.len().await, 3);

    blocking.release();
    for handle in handles {
        handle.await.unwrap();
    }
    assert!(
        TestEnv::wait_until(|| engine.pool.free_slots() == 4, Duration::from_secs(1)).await
    );
    assert!(engine.store.is_empty().await);
}
