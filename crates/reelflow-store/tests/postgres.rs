//! Integration tests against a real Postgres instance.
//!
//! Run with `REELFLOW_TEST_DB_URL=postgres://... cargo test -- --ignored`.
//! Each test uses its own schema namespace via a fresh database pool and
//! unique channel ids, so tests can run against a shared dev database.

use std::collections::HashSet;

use reelflow_store::{NewTask, StoreError, TaskFilter, TaskStore};
use reelflow_types::{
    BrandingPaths, Channel, Priority, StorageStrategy, TaskPatch, TaskStatus, UPLOAD_COST_UNITS,
};

fn test_channel(id: &str, max_concurrent: u32) -> Channel {
    Channel {
        id: id.to_string(),
        name: format!("test {id}"),
        active: true,
        max_concurrent,
        voice_id: "voice-test".to_string(),
        storage_strategy: StorageStrategy::Filesystem,
        branding: BrandingPaths::default(),
        credentials_encrypted: Default::default(),
        kling_concurrency: None,
    }
}

fn queued_task(channel: &str, title: &str, priority: Priority) -> NewTask {
    NewTask {
        channel_id: channel.to_string(),
        planning_page_id: None,
        title: title.to_string(),
        topic: None,
        story_direction: None,
        priority,
        status: TaskStatus::Queued,
    }
}

async fn store() -> TaskStore {
    let url = std::env::var("REELFLOW_TEST_DB_URL").expect("REELFLOW_TEST_DB_URL");
    let store = TaskStore::connect(&url).await.expect("connect");
    store.migrate().await.expect("migrate");
    store
}

fn unique(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore = "requires a Postgres instance via REELFLOW_TEST_DB_URL"]
async fn concurrent_claims_partition_the_pool() {
    let store = store().await;
    let channel = unique("ch_part");
    store.upsert_channel(&test_channel(&channel, 100)).await.expect("channel");

    for i in 0..20 {
        store
            .create_task(queued_task(&channel, &format!("t{i}"), Priority::Normal))
            .await
            .expect("create");
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            while let Some(task) = store.claim_next().await.expect("claim") {
                mine.push(task.id);
            }
            mine
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.expect("join"));
    }
    let distinct: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 20, "every task claimed exactly once");
    assert_eq!(distinct.len(), 20, "no task claimed twice");
}

#[tokio::test]
#[ignore = "requires a Postgres instance via REELFLOW_TEST_DB_URL"]
async fn claim_order_rotates_channels_within_a_priority_tier() {
    let store = store().await;
    let prefix = unique("rr");
    let ch_a = format!("{prefix}_a");
    let ch_b = format!("{prefix}_b");
    store.upsert_channel(&test_channel(&ch_a, 10)).await.expect("a");
    store.upsert_channel(&test_channel(&ch_b, 10)).await.expect("b");

    let a1 = store.create_task(queued_task(&ch_a, "A1", Priority::Normal)).await.expect("a1");
    let a2 = store.create_task(queued_task(&ch_a, "A2", Priority::Normal)).await.expect("a2");
    let b1 = store.create_task(queued_task(&ch_b, "B1", Priority::Normal)).await.expect("b1");
    let b2 = store.create_task(queued_task(&ch_b, "B2", Priority::Normal)).await.expect("b2");
    let high = store.create_task(queued_task(&ch_b, "HIGH", Priority::High)).await.expect("high");

    // Claims stay in flight for the whole trace: in-progress rows hold
    // their channel slot in the ranking, which is what makes the next
    // claim rotate to the other channel.
    let mut order = Vec::new();
    while let Some(task) = store.claim_next().await.expect("claim") {
        order.push(task.id);
    }

    // Priority first; then channels rotate within the tier; FIFO inside
    // each channel.
    assert_eq!(order, vec![high.id, a1.id, b1.id, a2.id, b2.id]);
}

#[tokio::test]
#[ignore = "requires a Postgres instance via REELFLOW_TEST_DB_URL"]
async fn channel_concurrency_cap_blocks_further_claims() {
    let store = store().await;
    let channel = unique("ch_cap");
    store.upsert_channel(&test_channel(&channel, 1)).await.expect("channel");

    store.create_task(queued_task(&channel, "first", Priority::Normal)).await.expect("t1");
    store.create_task(queued_task(&channel, "second", Priority::Normal)).await.expect("t2");

    let first = store.claim_next().await.expect("claim").expect("first");
    assert_eq!(first.status, TaskStatus::Claimed);

    // Cap of one: the second task stays queued until the first resolves.
    assert!(store.claim_next().await.expect("claim").is_none());

    store
        .update_status(first.id, TaskStatus::Claimed, TaskStatus::Cancelled, TaskPatch::default())
        .await
        .expect("finish first");
    assert!(store.claim_next().await.expect("claim").is_some());
}

#[tokio::test]
#[ignore = "requires a Postgres instance via REELFLOW_TEST_DB_URL"]
async fn inactive_channels_are_never_claimed() {
    let store = store().await;
    let channel = unique("ch_off");
    let mut config = test_channel(&channel, 5);
    config.active = false;
    store.upsert_channel(&config).await.expect("channel");
    store.create_task(queued_task(&channel, "parked", Priority::High)).await.expect("t");

    assert!(store.claim_next().await.expect("claim").is_none());
}

#[tokio::test]
#[ignore = "requires a Postgres instance via REELFLOW_TEST_DB_URL"]
async fn duplicate_planning_page_is_already_exists() {
    let store = store().await;
    let channel = unique("ch_dup");
    store.upsert_channel(&test_channel(&channel, 5)).await.expect("channel");

    let page = uuid::Uuid::new_v4().simple().to_string();
    let mut new = queued_task(&channel, "once", Priority::Normal);
    new.planning_page_id = Some(page.clone());
    store.create_task(new.clone()).await.expect("first");

    match store.create_task(new).await {
        Err(StoreError::AlreadyExists) => {}
        other => panic!("expected AlreadyExists, got {other:?}"),
    }
}

#[tokio::test]
#[ignore = "requires a Postgres instance via REELFLOW_TEST_DB_URL"]
async fn status_cas_rejects_the_second_writer() {
    let store = store().await;
    let channel = unique("ch_cas");
    store.upsert_channel(&test_channel(&channel, 5)).await.expect("channel");
    let task = store.create_task(queued_task(&channel, "contended", Priority::Normal)).await.expect("t");

    store
        .update_status(task.id, TaskStatus::Queued, TaskStatus::Claimed, TaskPatch::default())
        .await
        .expect("first transition");

    match store
        .update_status(task.id, TaskStatus::Queued, TaskStatus::Claimed, TaskPatch::default())
        .await
    {
        Err(StoreError::Conflict { .. }) => {}
        other => panic!("expected Conflict, got {other:?}"),
    }
}

#[tokio::test]
#[ignore = "requires a Postgres instance via REELFLOW_TEST_DB_URL"]
async fn illegal_transitions_never_reach_the_database() {
    let store = store().await;
    let channel = unique("ch_dag");
    store.upsert_channel(&test_channel(&channel, 5)).await.expect("channel");
    let task = store.create_task(queued_task(&channel, "strict", Priority::Normal)).await.expect("t");

    match store
        .update_status(task.id, TaskStatus::Queued, TaskStatus::Published, TaskPatch::default())
        .await
    {
        Err(StoreError::IllegalTransition { .. }) => {}
        other => panic!("expected IllegalTransition, got {other:?}"),
    }
}

#[tokio::test]
#[ignore = "requires a Postgres instance via REELFLOW_TEST_DB_URL"]
async fn updated_at_strictly_increases_and_cost_only_adds() {
    let store = store().await;
    let channel = unique("ch_mono");
    store.upsert_channel(&test_channel(&channel, 5)).await.expect("channel");
    let task = store.create_task(queued_task(&channel, "mono", Priority::Normal)).await.expect("t");

    let after_claim = store
        .update_status(task.id, TaskStatus::Queued, TaskStatus::Claimed, TaskPatch::default())
        .await
        .expect("claim");
    assert!(after_claim.updated_at > task.updated_at);

    store.record_cost(task.id, 0.42).await.expect("cost");
    store.record_cost(task.id, 0.08).await.expect("cost");
    assert!(store.record_cost(task.id, -0.01).await.is_err());

    let latest = store.get_task(task.id).await.expect("get");
    assert!((latest.cost_usd - 0.5).abs() < 1e-9);
    assert!(latest.updated_at > after_claim.updated_at);
}

#[tokio::test]
#[ignore = "requires a Postgres instance via REELFLOW_TEST_DB_URL"]
async fn webhook_replays_are_no_ops() {
    let store = store().await;
    let event_id = unique("evt");
    let payload = serde_json::json!({"page_id": "abc"});

    assert!(store.record_webhook(&event_id, &payload).await.expect("first"));
    assert!(!store.record_webhook(&event_id, &payload).await.expect("replay"));
    assert!(!store.record_webhook(&event_id, &payload).await.expect("replay again"));
}

#[tokio::test]
#[ignore = "requires a Postgres instance via REELFLOW_TEST_DB_URL"]
async fn quota_counters_upsert_and_purge() {
    let store = store().await;
    let channel = unique("ch_quota");
    let today = chrono::Utc::now().date_naive();

    let fresh = store.quota_get(&channel, today).await.expect("get");
    assert_eq!(fresh.units_used, 0);
    assert_eq!(fresh.daily_limit, 10_000);

    store.quota_add(&channel, today, UPLOAD_COST_UNITS).await.expect("add");
    store.quota_add(&channel, today, UPLOAD_COST_UNITS).await.expect("add");
    let used = store.quota_get(&channel, today).await.expect("get");
    assert_eq!(used.units_used, 2 * UPLOAD_COST_UNITS);

    assert!(store.quota_add(&channel, today, -1).await.is_err());

    let old_day = today - chrono::Duration::days(30);
    store.quota_add(&channel, old_day, 1).await.expect("old row");
    let purged = store.quota_purge(7).await.expect("purge");
    assert!(purged >= 1);
    let after = store.quota_get(&channel, old_day).await.expect("get old");
    assert_eq!(after.units_used, 0);
}

#[tokio::test]
#[ignore = "requires a Postgres instance via REELFLOW_TEST_DB_URL"]
async fn stale_claims_are_reclaimed_for_rerun() {
    let store = store().await;
    let channel = unique("ch_stale");
    store.upsert_channel(&test_channel(&channel, 5)).await.expect("channel");
    store.create_task(queued_task(&channel, "orphan", Priority::Normal)).await.expect("t");

    let claimed = store.claim_next().await.expect("claim").expect("task");
    assert_eq!(claimed.status, TaskStatus::Claimed);

    // Nothing is stale yet.
    assert_eq!(
        store.reclaim_stale(std::time::Duration::from_secs(3600)).await.expect("none"),
        0
    );

    // With a zero threshold the claimed row is immediately reclaimable.
    let reclaimed = store.reclaim_stale(std::time::Duration::from_secs(0)).await.expect("reclaim");
    assert!(reclaimed >= 1);

    let back = store
        .list_tasks(TaskFilter {
            status: Some(TaskStatus::Queued),
            channel_id: Some(channel.clone()),
            limit: None,
        })
        .await
        .expect("list");
    assert_eq!(back.len(), 1);
    assert!(back[0].error_log.contains("reclaimed"));
}
