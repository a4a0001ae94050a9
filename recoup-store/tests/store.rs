//! Store integration tests. These need a live Postgres; point `DATABASE_URL`
//! at a scratch database and run with `cargo test -- --ignored`.

use std::sync::Arc;

use chrono::{Duration, Utc};
use recoup_common::{aes::TokenCipher, rng::SysRng, time};
use recoup_store::{
    Store,
    models::{MetricType, TaskStatus, TaskType},
};
use uuid::Uuid;

async fn test_store() -> Store {
    let url = std::env::var("DATABASE_URL")
        .expect("Set DATABASE_URL to run store tests");
    let cipher = Arc::new(TokenCipher::ephemeral(&SysRng::new()));
    Store::connect(&url, cipher)
        .await
        .expect("Failed to connect to test database")
}

#[tokio::test]
#[ignore = "requires a local Postgres (DATABASE_URL)"]
async fn event_lock_first_writer_wins() {
    let store = test_store().await;
    let event_id = format!("evt_{}", Uuid::new_v4());

    assert!(store.attempt_event_lock(&event_id).await.unwrap());
    assert!(!store.attempt_event_lock(&event_id).await.unwrap());
}

#[tokio::test]
#[ignore = "requires a local Postgres (DATABASE_URL)"]
async fn event_lock_exclusive_under_contention() {
    let store = test_store().await;
    let event_id = format!("evt_{}", Uuid::new_v4());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let event_id = event_id.clone();
        handles.push(tokio::spawn(async move {
            store.attempt_event_lock(&event_id).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
#[ignore = "requires a local Postgres (DATABASE_URL)"]
async fn claim_returns_each_task_to_exactly_one_caller() {
    let store = test_store().await;
    let merchant_id = Uuid::new_v4().to_string();

    let task = store
        .enqueue_task(
            &merchant_id,
            TaskType::DunningRetry,
            serde_json::json!({"invoiceId": "in_claim_test"}),
            Utc::now() - Duration::seconds(1),
        )
        .await
        .unwrap();

    // Drain the ready set from two concurrent claimants, counting how many
    // times our task is handed out. The queue may contain unrelated ready
    // tasks from other tests, which is fine.
    let mut claims_of_ours = 0;
    loop {
        let (a, b) = tokio::join!(
            store.claim_next_task(),
            store.claim_next_task()
        );
        let claimed: Vec<_> = [a.unwrap(), b.unwrap()]
            .into_iter()
            .flatten()
            .collect();
        if claimed.is_empty() {
            break;
        }
        for c in &claimed {
            assert_eq!(c.status, TaskStatus::Running);
            if c.id == task.id {
                claims_of_ours += 1;
            }
        }
    }
    assert_eq!(claims_of_ours, 1);
}

#[tokio::test]
#[ignore = "requires a local Postgres (DATABASE_URL)"]
async fn future_tasks_are_not_ready() {
    let store = test_store().await;
    let merchant_id = Uuid::new_v4().to_string();

    let task = store
        .enqueue_task(
            &merchant_id,
            TaskType::SendWeeklyDigest,
            serde_json::json!({}),
            Utc::now() + Duration::days(7),
        )
        .await
        .unwrap();

    // Drain everything ready; our future task must never be claimed.
    while let Some(claimed) = store.claim_next_task().await.unwrap() {
        assert_ne!(claimed.id, task.id);
    }

    let reloaded = store.task(task.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, TaskStatus::Pending);
}

#[tokio::test]
#[ignore = "requires a local Postgres (DATABASE_URL)"]
async fn usage_log_rolls_up_atomically() {
    let store = test_store().await;
    let merchant_id = Uuid::new_v4();
    let today = time::utc_date(Utc::now());

    let before = store.metric_totals(merchant_id, today).await.unwrap();

    let log = store
        .create_usage_log(merchant_id, &MetricType::DunningEmailSent, 2)
        .await
        .unwrap();
    assert_eq!(log.amount, 2);
    assert!(log.reported_at.is_none());

    // Non-email metrics must not bump emails_sent.
    store
        .create_usage_log(merchant_id, &MetricType::TaskScheduled, 1)
        .await
        .unwrap();

    let after = store.metric_totals(merchant_id, today).await.unwrap();
    assert_eq!(after.emails_sent, before.emails_sent + 2);

    let count = store.monthly_dunning_count(merchant_id).await.unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
#[ignore = "requires a local Postgres (DATABASE_URL)"]
async fn reported_at_is_set_at_most_once() {
    let store = test_store().await;
    let merchant_id = Uuid::new_v4();

    let log = store
        .create_usage_log(merchant_id, &MetricType::DunningEmailSent, 1)
        .await
        .unwrap();

    assert_eq!(store.mark_usage_reported(&[log.id]).await.unwrap(), 1);
    // Second stamp is a no-op thanks to the IS NULL guard.
    assert_eq!(store.mark_usage_reported(&[log.id]).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires a local Postgres (DATABASE_URL)"]
async fn zombie_tasks_are_rescued() {
    let store = test_store().await;
    let merchant_id = Uuid::new_v4().to_string();

    let task = store
        .enqueue_task(
            &merchant_id,
            TaskType::DunningRetry,
            serde_json::json!({"invoiceId": "in_zombie"}),
            Utc::now() + Duration::days(365),
        )
        .await
        .unwrap();

    // Simulate a worker that claimed the task 11 minutes ago and died.
    let url = std::env::var("DATABASE_URL").unwrap();
    let pool = sqlx::PgPool::connect(&url).await.unwrap();
    sqlx::query(
        "UPDATE tasks SET status = 'running', \
         created_at = now() - interval '11 minutes' WHERE id = $1",
    )
    .bind(task.id)
    .execute(&pool)
    .await
    .unwrap();

    let cutoff = Utc::now() - Duration::minutes(10);
    let rescued = store.rescue_zombie_tasks(cutoff).await.unwrap();
    assert!(rescued >= 1);

    let reloaded = store.task(task.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, TaskStatus::Pending);
    assert!(reloaded.run_at <= Utc::now() + Duration::seconds(5));
}

#[tokio::test]
#[ignore = "requires a local Postgres (DATABASE_URL)"]
async fn provisioning_is_race_safe() {
    let store = test_store().await;
    let auth_user_id = format!("auth0|{}", Uuid::new_v4());

    let (first, created_first) = store
        .provision_merchant(&auth_user_id, Some("m@example.com"))
        .await
        .unwrap();
    let (second, created_second) = store
        .provision_merchant(&auth_user_id, Some("m@example.com"))
        .await
        .unwrap();

    assert!(created_first);
    assert!(!created_second);
    assert_eq!(first.id, second.id);
    assert_eq!(first.subscription_plan_id, "price_free");
}

#[tokio::test]
#[ignore = "requires a local Postgres (DATABASE_URL)"]
async fn oauth_tokens_roundtrip_encrypted() {
    let store = test_store().await;
    let auth_user_id = format!("auth0|{}", Uuid::new_v4());
    let (merchant, _) = store
        .provision_merchant(&auth_user_id, None)
        .await
        .unwrap();

    let account = format!("acct_{}", Uuid::new_v4().simple());
    store
        .connect_merchant(merchant.id, &account, "sk_live_123", Some("rt_9"))
        .await
        .unwrap();

    let reloaded = store.merchant(merchant.id).await.unwrap().unwrap();
    assert_eq!(reloaded.pp_account_id.as_deref(), Some(account.as_str()));
    assert_eq!(reloaded.access_token.as_deref(), Some("sk_live_123"));
    assert_eq!(reloaded.refresh_token.as_deref(), Some("rt_9"));
    assert_eq!(reloaded.oauth_state, None);

    // The column itself must not hold plaintext.
    let url = std::env::var("DATABASE_URL").unwrap();
    let pool = sqlx::PgPool::connect(&url).await.unwrap();
    let raw: Option<String> = sqlx::query_scalar(
        "SELECT access_token FROM merchants WHERE id = $1",
    )
    .bind(merchant.id)
    .fetch_one(&pool)
    .await
    .unwrap();
    let raw = raw.unwrap();
    assert_ne!(raw, "sk_live_123");
    assert!(!raw.contains("sk_live"));
}

#[tokio::test]
#[ignore = "requires a local Postgres (DATABASE_URL)"]
async fn erasure_cascades_cleanly() {
    let store = test_store().await;
    let auth_user_id = format!("auth0|{}", Uuid::new_v4());
    let (merchant, _) = store
        .provision_merchant(&auth_user_id, Some("gone@example.com"))
        .await
        .unwrap();

    store
        .enqueue_task(
            &merchant.id.to_string(),
            TaskType::DunningRetry,
            serde_json::json!({"invoiceId": "in_erase"}),
            Utc::now(),
        )
        .await
        .unwrap();
    store
        .create_usage_log(merchant.id, &MetricType::DunningEmailSent, 1)
        .await
        .unwrap();
    store
        .upsert_email_template(merchant.id, 1, "subject", "<p>body</p>")
        .await
        .unwrap();

    store.erase_merchant(merchant.id).await.unwrap();

    assert!(store.merchant(merchant.id).await.unwrap().is_none());
    let tasks = store
        .list_tasks(&merchant.id.to_string(), None, 100)
        .await
        .unwrap();
    assert!(tasks.is_empty());
    let activity =
        store.recent_activity(merchant.id, None, 100).await.unwrap();
    assert!(activity.is_empty());
}
