//! Integration tests for TaskScheduling on PostgreSQL.
//!
//! These tests run against a real PostgreSQL database using testcontainers.
//! Requires Docker to be available on the system.

mod common;

use common::{fast_config, wait_for_state, TestDatabase};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use taskbox_jobs::{
    DrainOutcome, EnqueueError, HandlerError, Json, JobState, JobStore, Priority, RawJson, SendOptions, SetupError,
    StoreError, TaskScheduling,
};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WelcomeEmail {
    to: String,
}

#[tokio::test]
async fn test_job_completes_with_single_delivery() {
    let db = TestDatabase::new().await;
    let scheduling = TaskScheduling::connect("emails", db.config(), fast_config("signup"))
        .await
        .expect("Failed to set up scheduling");
    let (tx, mut rx) = mpsc::unbounded_channel();

    scheduling
        .work("emails", Json::<WelcomeEmail>::new(), move |email, ctx| {
            let tx = tx.clone();
            async move {
                tx.send((email, ctx.attempt, ctx.queue)).ok();
                Ok(())
            }
        })
        .await
        .expect("Failed to register handler");

    let email = WelcomeEmail {
        to: "user@example.com".to_string(),
    };
    let id = scheduling.send(&email, SendOptions::new()).await.expect("Failed to send");

    let job = wait_for_state(scheduling.store(), id, JobState::Completed).await;
    assert_eq!(job.attempts, 1);
    assert_eq!(job.queue, "signup.emails");
    assert!(job.lock_token.is_none());
    assert!(job.completed_at.is_some());

    let (received, attempt, queue) = rx.recv().await.expect("Handler never ran");
    assert_eq!(received, email);
    assert_eq!(attempt, 1);
    assert_eq!(queue, "signup.emails");

    assert_eq!(scheduling.stop().await, DrainOutcome::Drained);
}

#[tokio::test]
async fn test_failing_job_exhausts_retries() {
    let db = TestDatabase::new().await;
    let scheduling = TaskScheduling::connect("emails", db.config(), fast_config("signup"))
        .await
        .expect("Failed to set up scheduling");

    scheduling
        .work("emails", RawJson, |_, ctx| async move {
            Err(HandlerError::failed(format!("smtp down on attempt {}", ctx.attempt)))
        })
        .await
        .expect("Failed to register handler");

    let id = scheduling
        .send(&json!({"to": "user@example.com"}), SendOptions::new().retry_limit(2))
        .await
        .expect("Failed to send");

    let job = wait_for_state(scheduling.store(), id, JobState::Failed).await;
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_error.as_deref(), Some("Handler failed: smtp down on attempt 3"));
    assert_eq!(scheduling.stats().jobs_failed, 1);

    scheduling.stop().await;
}

#[tokio::test]
async fn test_singleton_key_held_until_terminal() {
    let db = TestDatabase::new().await;
    let scheduling = TaskScheduling::connect("reports", db.config(), fast_config("billing"))
        .await
        .expect("Failed to set up scheduling");
    let options = SendOptions::new().singleton_key("nightly");

    let first = scheduling.send(&json!({"run": 1}), options.clone()).await.expect("Failed to send");
    let err = scheduling.send(&json!({"run": 2}), options.clone()).await.unwrap_err();
    assert!(matches!(err, EnqueueError::SingletonConflict { ref key, .. } if key == "nightly"));

    scheduling
        .work("reports", RawJson, |_, _| async { Ok(()) })
        .await
        .expect("Failed to register handler");
    wait_for_state(scheduling.store(), first, JobState::Completed).await;

    // the key is free again once the holder is terminal
    let second = scheduling.send(&json!({"run": 3}), options).await.expect("Failed to resend");
    assert_ne!(first, second);

    scheduling.stop().await;
}

#[tokio::test]
async fn test_send_in_transaction_follows_commit() {
    let db = TestDatabase::new().await;
    let scheduling = TaskScheduling::connect("orders", db.config(), fast_config("shop"))
        .await
        .expect("Failed to set up scheduling");
    let store = scheduling.store();

    sqlx::query("CREATE TABLE orders (id BIGSERIAL PRIMARY KEY, item TEXT NOT NULL)")
        .execute(store.pool())
        .await
        .expect("Failed to create orders table");

    // rolled back: neither the order nor the job exists
    let mut tx = store.begin().await.expect("Failed to begin");
    sqlx::query("INSERT INTO orders (item) VALUES ($1)")
        .bind("book")
        .execute(&mut *tx)
        .await
        .expect("Failed to insert order");
    let rolled_back = scheduling
        .send_in_transaction(&mut *tx, &json!({"item": "book"}), SendOptions::new())
        .await
        .expect("Failed to send in transaction");
    tx.rollback().await.expect("Failed to roll back");

    assert!(store.get_job(rolled_back).await.expect("Query failed").is_none());
    let (orders,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders")
        .fetch_one(store.pool())
        .await
        .expect("Query failed");
    assert_eq!(orders, 0);

    // committed: the job is invisible until commit, then processed
    let mut tx = store.begin().await.expect("Failed to begin");
    sqlx::query("INSERT INTO orders (item) VALUES ($1)")
        .bind("lamp")
        .execute(&mut *tx)
        .await
        .expect("Failed to insert order");
    let committed = scheduling
        .send_in_transaction(&mut *tx, &json!({"item": "lamp"}), SendOptions::new())
        .await
        .expect("Failed to send in transaction");
    assert!(store.get_job(committed).await.expect("Query failed").is_none());
    tx.commit().await.expect("Failed to commit");

    scheduling
        .work("orders", RawJson, |_, _| async { Ok(()) })
        .await
        .expect("Failed to register handler");
    wait_for_state(store, committed, JobState::Completed).await;

    scheduling.stop().await;
}

#[tokio::test]
async fn test_singleton_conflict_leaves_transaction_usable() {
    let db = TestDatabase::new().await;
    let scheduling = TaskScheduling::connect("sync", db.config(), fast_config("crm"))
        .await
        .expect("Failed to set up scheduling");
    let store = scheduling.store();
    let options = SendOptions::new().singleton_key("account-7");

    scheduling.send(&json!({"account": 7}), options.clone()).await.expect("Failed to send");

    let mut tx = store.begin().await.expect("Failed to begin");
    let err = scheduling
        .send_in_transaction(&mut *tx, &json!({"account": 7}), options)
        .await
        .unwrap_err();
    assert!(matches!(err, EnqueueError::SingletonConflict { .. }));

    let other = scheduling
        .send_in_transaction(&mut *tx, &json!({"account": 8}), SendOptions::new())
        .await
        .expect("Transaction should still accept work");
    tx.commit().await.expect("Failed to commit");

    assert!(store.get_job(other).await.expect("Query failed").is_some());
    assert_eq!(scheduling.list_jobs(None, 10).await.expect("Query failed").len(), 2);

    scheduling.stop().await;
}

#[tokio::test]
async fn test_expired_lease_is_redelivered() {
    let db = TestDatabase::new().await;
    let scheduling = TaskScheduling::connect("imports", db.config(), fast_config("etl"))
        .await
        .expect("Failed to set up scheduling");
    let store = scheduling.store();
    let queue = scheduling.queue().full_name();

    let id = scheduling
        .send(&json!({"file": "a.csv"}), SendOptions::new().expire_in(Duration::from_millis(200)))
        .await
        .expect("Failed to send");

    let first = store
        .claim_next(queue, "crashed-worker", Uuid::new_v4())
        .await
        .expect("Claim failed")
        .expect("Job not claimable");
    assert_eq!(first.id, id);
    assert_eq!(first.attempts, 1);

    // leased: nobody else sees it
    assert!(store
        .claim_next(queue, "other-worker", Uuid::new_v4())
        .await
        .expect("Claim failed")
        .is_none());

    tokio::time::sleep(Duration::from_millis(400)).await;

    let second = store
        .claim_next(queue, "other-worker", Uuid::new_v4())
        .await
        .expect("Claim failed")
        .expect("Expired lease not redelivered");
    assert_eq!(second.id, id);
    assert_eq!(second.attempts, 2);
    assert_eq!(second.locked_by.as_deref(), Some("other-worker"));

    // the first worker's late result is discarded
    let stale = first.lease().expect("Claimed job carries a lease");
    assert!(!store.complete(&stale).await.expect("Complete failed"));

    let current = second.lease().expect("Claimed job carries a lease");
    assert!(store.complete(&current).await.expect("Complete failed"));

    scheduling.stop().await;
}

#[tokio::test]
async fn test_exhausted_lease_is_failed_by_sweep() {
    let db = TestDatabase::new().await;
    let scheduling = TaskScheduling::connect("imports", db.config(), fast_config("etl"))
        .await
        .expect("Failed to set up scheduling");
    let store = scheduling.store();
    let queue = scheduling.queue().full_name();

    let options = SendOptions::new().retry_limit(0).expire_in(Duration::from_millis(100));
    let id = scheduling.send(&json!({}), options).await.expect("Failed to send");

    store
        .claim_next(queue, "crashed-worker", Uuid::new_v4())
        .await
        .expect("Claim failed")
        .expect("Job not claimable");
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert!(store
        .claim_next(queue, "other-worker", Uuid::new_v4())
        .await
        .expect("Claim failed")
        .is_none());
    assert_eq!(store.expire_exhausted(queue).await.expect("Sweep failed"), 1);

    let job = store.get_job(id).await.expect("Query failed").expect("Job not found");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.is_some());

    scheduling.stop().await;
}

#[tokio::test]
async fn test_concurrent_claims_never_share_a_job() {
    let db = TestDatabase::new().await;
    let scheduling = TaskScheduling::connect("bulk", db.config(), fast_config("etl"))
        .await
        .expect("Failed to set up scheduling");
    let queue = scheduling.queue().full_name().to_string();

    let mut sent = HashSet::new();
    for n in 0..40 {
        sent.insert(scheduling.send(&json!({"n": n}), SendOptions::new()).await.expect("Failed to send"));
    }

    let mut claimers = Vec::new();
    for worker in 0..8 {
        let store = db.store().await;
        let queue = queue.clone();
        claimers.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            let worker_id = format!("worker-{}", worker);
            while let Some(job) = store
                .claim_next(&queue, &worker_id, Uuid::new_v4())
                .await
                .expect("Claim failed")
            {
                claimed.push(job.id);
            }
            store.close().await;
            claimed
        }));
    }

    let mut delivered = Vec::new();
    for claimer in claimers {
        delivered.extend(claimer.await.expect("Claimer panicked"));
    }

    let unique: HashSet<_> = delivered.iter().copied().collect();
    assert_eq!(delivered.len(), 40, "every job delivered exactly once");
    assert_eq!(unique, sent);

    scheduling.stop().await;
}

#[tokio::test]
async fn test_claim_order_follows_priority_and_delay() {
    let db = TestDatabase::new().await;
    let scheduling = TaskScheduling::connect("mixed", db.config(), fast_config("etl"))
        .await
        .expect("Failed to set up scheduling");
    let store = scheduling.store();
    let queue = scheduling.queue().full_name();

    let low = scheduling
        .send(&json!("low"), SendOptions::new().priority(Priority::Low))
        .await
        .expect("Failed to send");
    let delayed = scheduling
        .send(
            &json!("delayed"),
            SendOptions::new().priority(Priority::Critical).delay(Duration::from_secs(3600)),
        )
        .await
        .expect("Failed to send");
    let high = scheduling
        .send(&json!("high"), SendOptions::new().priority(Priority::High))
        .await
        .expect("Failed to send");

    let mut order = Vec::new();
    while let Some(job) = store
        .claim_next(queue, "worker", Uuid::new_v4())
        .await
        .expect("Claim failed")
    {
        order.push(job.id);
    }
    assert_eq!(order, vec![high, low]);

    let pending = scheduling
        .list_jobs(Some(JobState::Pending), 10)
        .await
        .expect("Query failed");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, delayed);

    scheduling.stop().await;
}

#[tokio::test]
async fn test_stop_closes_store_and_rejects_sends() {
    let db = TestDatabase::new().await;
    let scheduling = TaskScheduling::connect("emails", db.config(), fast_config("signup"))
        .await
        .expect("Failed to set up scheduling");

    scheduling
        .work("emails", RawJson, |_, _| async { Ok(()) })
        .await
        .expect("Failed to register handler");

    assert_eq!(scheduling.stop().await, DrainOutcome::Drained);
    assert_eq!(scheduling.stop().await, DrainOutcome::AlreadyStopped);
    assert!(scheduling.store().pool().is_closed());

    assert!(matches!(
        scheduling.send(&json!({}), SendOptions::new()).await,
        Err(EnqueueError::Stopped)
    ));
    assert!(matches!(
        scheduling.work("emails", RawJson, |_, _| async { Ok(()) }).await,
        Err(SetupError::Stopped)
    ));
}

#[tokio::test]
async fn test_ensure_queue_reports_single_creator() {
    let db = TestDatabase::new().await;
    let first = TaskScheduling::connect("shared", db.config(), fast_config("svc"))
        .await
        .expect("Failed to set up scheduling");
    let second = TaskScheduling::connect("shared", db.config(), fast_config("svc"))
        .await
        .expect("Failed to set up scheduling");

    assert!(first.queue().created());
    assert!(!second.queue().created());
    assert_eq!(first.queue().full_name(), second.queue().full_name());

    first.stop().await;
    second.stop().await;
}

#[tokio::test]
async fn test_insert_into_unknown_queue_fails() {
    let db = TestDatabase::new().await;
    let store = db.store().await;

    let job = taskbox_jobs::job::NewJob {
        id: taskbox_jobs::JobId::new(),
        queue: "nobody.registered".to_string(),
        payload: json!({}),
        priority: 0,
        retry_limit: 0,
        retry_policy: taskbox_jobs::RetryPolicy::default(),
        expire_in: Duration::from_secs(60),
        start_after: None,
        delay: Duration::ZERO,
        singleton_key: None,
    };

    let err = store.insert(&job).await.unwrap_err();
    assert!(matches!(err, StoreError::UnknownQueue(ref queue) if queue == "nobody.registered"));
    store.close().await;
}

#[tokio::test]
async fn test_stop_leaves_application_pool_open() {
    let db = TestDatabase::new().await;
    let owner = db.store().await;
    let app_pool = owner.pool().clone();

    let store = taskbox_jobs::PgJobStore::with_pool(app_pool.clone());
    let scheduling = TaskScheduling::create(store, "emails", fast_config("signup"))
        .await
        .expect("Failed to set up scheduling");
    let (tx, mut rx) = mpsc::unbounded_channel();

    scheduling
        .work("emails", RawJson, move |_, ctx| {
            let tx = tx.clone();
            async move {
                tx.send(ctx.job_id).ok();
                Ok(())
            }
        })
        .await
        .expect("Failed to register handler");

    let id = scheduling
        .send(&json!({ "to": "a@example.com" }), SendOptions::new())
        .await
        .expect("Failed to send");
    let delivered = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("Timed out waiting for delivery")
        .expect("Channel closed");
    assert_eq!(delivered, id);

    assert_eq!(scheduling.stop().await, DrainOutcome::Drained);
    assert!(!app_pool.is_closed());

    let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM taskbox_jobs WHERE id = $1")
        .bind(id.as_uuid())
        .fetch_one(&app_pool)
        .await
        .expect("Application pool should still serve queries");
    assert_eq!(count, 1);

    owner.close().await;
    assert!(app_pool.is_closed());
}

#[tokio::test]
async fn test_direct_insert_rejects_out_of_range_values() {
    let db = TestDatabase::new().await;
    let scheduling = TaskScheduling::connect("bounds", db.config(), fast_config("svc"))
        .await
        .expect("Failed to set up scheduling");
    let store = scheduling.store();
    let queue = scheduling.queue().full_name().to_string();

    let job = |retry_limit: u32, expire_in: Duration| taskbox_jobs::job::NewJob {
        id: taskbox_jobs::JobId::new(),
        queue: queue.clone(),
        payload: json!({}),
        priority: 0,
        retry_limit,
        retry_policy: taskbox_jobs::RetryPolicy::default(),
        expire_in,
        start_after: None,
        delay: Duration::ZERO,
        singleton_key: None,
    };

    let err = store.insert(&job(u32::MAX, Duration::from_secs(60))).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidJob(_)));

    let beyond = taskbox_jobs::options::MAX_SCHEDULE_HORIZON + Duration::from_secs(1);
    let err = store.insert(&job(0, beyond)).await.unwrap_err();
    assert!(matches!(err, StoreError::Database(_)));

    let accepted = job(2, taskbox_jobs::options::MAX_SCHEDULE_HORIZON);
    let record = store
        .insert(&accepted)
        .await
        .expect("Insert failed")
        .expect("Job should be stored");
    assert_eq!(record.retry_limit, 2);
    assert_eq!(record.expire_in, taskbox_jobs::options::MAX_SCHEDULE_HORIZON);

    scheduling.stop().await;
}

#[tokio::test]
async fn test_retry_waits_for_exponential_backoff() {
    let db = TestDatabase::new().await;
    let scheduling = TaskScheduling::connect("emails", db.config(), fast_config("signup"))
        .await
        .expect("Failed to set up scheduling");
    let policy = taskbox_jobs::RetryPolicy::exponential(Duration::from_millis(300));

    scheduling
        .work("emails", RawJson, |_, _| async { Err(HandlerError::failed("smtp unavailable")) })
        .await
        .expect("Failed to register handler");

    let id = scheduling
        .send(&json!({}), SendOptions::new().retry_limit(1).retry_policy(policy))
        .await
        .expect("Failed to send");

    let waiting = wait_for_state(scheduling.store(), id, JobState::Retry).await;
    assert_eq!(waiting.attempts, 1);
    let started_at = waiting.started_at.expect("Claimed job has a start time");
    let backoff = chrono::Duration::from_std(policy.delay_for_attempt(1)).expect("Backoff fits chrono");
    assert!(waiting.run_at - started_at >= backoff);

    let failed = wait_for_state(scheduling.store(), id, JobState::Failed).await;
    assert_eq!(failed.attempts, 2);
    assert!(failed.started_at.expect("Claimed job has a start time") >= waiting.run_at);

    scheduling.stop().await;
}
