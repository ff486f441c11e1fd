//! 各存储实现共用的契约检查
#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use scheduler_domain::{Execution, ExecutionKey, ExecutionStore, RescheduleUpdate, TaskInstance};

pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, minute, 0).unwrap()
}

pub fn execution(task: &str, id: &str, minute: u32) -> Execution {
    Execution::new(TaskInstance::new(task, id), at(minute))
}

pub async fn insert_is_unique(store: &dyn ExecutionStore) {
    let exec = execution("report", "1", 0);
    assert!(store.insert(&exec).await.unwrap());
    assert!(!store.insert(&execution("report", "1", 10)).await.unwrap());

    let stored = store.get(&exec.key()).await.unwrap().unwrap();
    assert_eq!(stored.execution_time, at(0));
    assert_eq!(stored.version, Execution::INITIAL_VERSION);
    assert!(!stored.picked);
}

pub async fn data_survives_storage(store: &dyn ExecutionStore) {
    let instance = TaskInstance::new("mail", "42")
        .with_data(&vec!["ops@example.com".to_string()])
        .unwrap();
    store
        .insert(&Execution::new(instance.clone(), at(0)))
        .await
        .unwrap();

    let stored = store.get(&instance.key()).await.unwrap().unwrap();
    assert_eq!(
        stored.task_instance.data_as::<Vec<String>>().unwrap(),
        vec!["ops@example.com".to_string()]
    );
}

pub async fn fetch_due_is_ordered_and_limited(store: &dyn ExecutionStore) {
    store.insert(&execution("t", "b", 1)).await.unwrap();
    store.insert(&execution("t", "a", 1)).await.unwrap();
    store.insert(&execution("t", "c", 0)).await.unwrap();
    store.insert(&execution("t", "later", 30)).await.unwrap();

    let due = store.fetch_due(at(10), 10).await.unwrap();
    let ids: Vec<&str> = due.iter().map(|e| e.instance_id()).collect();
    assert_eq!(ids, vec!["c", "a", "b"]);
    assert_eq!(store.fetch_due(at(10), 1).await.unwrap().len(), 1);

    let key = ExecutionKey::new("t", "c");
    assert!(store.try_claim(&key, 1, "node-a", at(10)).await.unwrap());
    let due = store.fetch_due(at(10), 10).await.unwrap();
    assert_eq!(due.len(), 2);
}

pub async fn fetch_due_skips_excluded_tasks(store: &dyn ExecutionStore) {
    store.insert(&execution("retired", "1", 0)).await.unwrap();
    store.insert(&execution("retired", "2", 0)).await.unwrap();
    store.insert(&execution("live", "1", 5)).await.unwrap();

    let due = store
        .fetch_due_excluding(at(10), 1, &["retired".to_string()])
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].task_name(), "live");
    assert_eq!(store.fetch_due(at(10), 10).await.unwrap().len(), 3);
}

pub async fn claim_is_conditional(store: &dyn ExecutionStore) {
    let exec = execution("t", "1", 0);
    let key = exec.key();
    store.insert(&exec).await.unwrap();

    assert!(store.try_claim(&key, 1, "node-a", at(1)).await.unwrap());
    assert!(!store.try_claim(&key, 1, "node-b", at(1)).await.unwrap());
    assert!(!store.try_claim(&key, 2, "node-b", at(1)).await.unwrap());

    let stored = store.get(&key).await.unwrap().unwrap();
    assert!(stored.picked);
    assert_eq!(stored.picked_by.as_deref(), Some("node-a"));
    assert_eq!(stored.last_heartbeat, Some(at(1)));
    assert_eq!(stored.version, 2);
}

pub async fn heartbeat_and_stale(store: &dyn ExecutionStore) {
    let exec = execution("t", "1", 0);
    let key = exec.key();
    store.insert(&exec).await.unwrap();
    store.try_claim(&key, 1, "node-a", at(1)).await.unwrap();

    assert!(!store.update_heartbeat(&key, 1, at(2)).await.unwrap());
    assert!(store.update_heartbeat(&key, 2, at(2)).await.unwrap());

    assert!(store.fetch_stale(at(2)).await.unwrap().is_empty());
    let stale = store.fetch_stale(at(5)).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].version, 3);
    assert_eq!(stale[0].last_heartbeat, Some(at(2)));
}

pub async fn reschedule_after_success_and_failure(store: &dyn ExecutionStore) {
    let instance = TaskInstance::new("t", "1").with_data(&1u32).unwrap();
    let key = instance.key();
    store
        .insert(&Execution::new(instance, at(0)))
        .await
        .unwrap();
    store.try_claim(&key, 1, "node-a", at(0)).await.unwrap();

    let failure = RescheduleUpdate::after_failure(at(10), at(1), 1);
    assert!(store.reschedule(&key, 2, &failure).await.unwrap());
    let stored = store.get(&key).await.unwrap().unwrap();
    assert!(!stored.picked);
    assert!(stored.picked_by.is_none());
    assert!(stored.last_heartbeat.is_none());
    assert_eq!(stored.consecutive_failures, 1);
    assert_eq!(stored.last_failure, Some(at(1)));
    assert_eq!(stored.execution_time, at(10));
    assert_eq!(stored.task_instance.data_as::<u32>().unwrap(), 1);
    assert_eq!(stored.version, 3);

    store.try_claim(&key, 3, "node-a", at(10)).await.unwrap();
    let success = RescheduleUpdate::after_success(at(20), Some(b"2".to_vec()), at(11));
    assert!(!store.reschedule(&key, 3, &success).await.unwrap());
    assert!(store.reschedule(&key, 4, &success).await.unwrap());

    let stored = store.get(&key).await.unwrap().unwrap();
    assert_eq!(stored.consecutive_failures, 0);
    assert_eq!(stored.last_success, Some(at(11)));
    assert_eq!(stored.last_failure, Some(at(1)));
    assert_eq!(stored.task_instance.data_as::<u32>().unwrap(), 2);
    assert_eq!(stored.execution_time, at(20));
}

pub async fn remove_is_conditional(store: &dyn ExecutionStore) {
    let exec = execution("t", "1", 0);
    let key = exec.key();
    store.insert(&exec).await.unwrap();

    assert!(!store.remove(&key, 5).await.unwrap());
    assert!(store.remove(&key, 1).await.unwrap());
    assert!(!store.remove(&key, 1).await.unwrap());
    assert!(store.get(&key).await.unwrap().is_none());
}

pub async fn remove_unresolved_only_touches_unknown(store: &dyn ExecutionStore) {
    store.insert(&execution("known", "1", 0)).await.unwrap();
    store.insert(&execution("retired", "old", 0)).await.unwrap();
    store.insert(&execution("retired", "recent", 50)).await.unwrap();

    let removed = store
        .remove_unresolved(at(0) + Duration::minutes(30), &["known".to_string()])
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let remaining: Vec<String> = store
        .get_scheduled_executions()
        .await
        .unwrap()
        .iter()
        .map(|e| e.key().to_string())
        .collect();
    assert_eq!(remaining, vec!["known/1", "retired/recent"]);
}
