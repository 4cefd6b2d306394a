//! Progress Store Integration Tests
//!
//! Tests for the job lifecycle as seen through the in-memory store.

use std::time::Duration;

use chrono::Utc;
use digestion::domain::JobStatus;
use digestion::progress::{InMemoryProgressStore, ProgressStore, Retention};

#[tokio::test]
async fn test_start_then_query_is_digesting_at_zero() {
    let store = InMemoryProgressStore::new();
    store.start_tracking("cap-1", "user-1").await.unwrap();

    let progress = store.get_progress("cap-1").await.unwrap().unwrap();
    assert_eq!(progress.status, JobStatus::Digesting);
    assert_eq!(progress.percentage, 0);
    assert_eq!(progress.user_id, "user-1");
    assert!(progress.completed_at.is_none());
}

#[tokio::test]
async fn test_complete_yields_full_percentage_and_duration() {
    let store = InMemoryProgressStore::new();
    store.start_tracking("cap-1", "user-1").await.unwrap();
    store.update_progress("cap-1", 45).await.unwrap();

    let done = store.complete_tracking("cap-1").await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.percentage, 100);
    assert!(done.duration_ms.is_some());
    assert!(done.completed_at.is_some());

    // Still visible during the retention window
    let stored = store.get_progress("cap-1").await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_first_terminal_state_wins() {
    let store = InMemoryProgressStore::new();
    store.start_tracking("cap-1", "user-1").await.unwrap();

    store
        .fail_tracking("cap-1", "Digestion was cancelled")
        .await
        .unwrap();
    store.complete_tracking("cap-1").await.unwrap();
    store.update_progress("cap-1", 90).await.unwrap();

    let progress = store.get_progress("cap-1").await.unwrap().unwrap();
    assert_eq!(progress.status, JobStatus::Failed);
    assert_eq!(progress.error.as_deref(), Some("Digestion was cancelled"));
}

#[tokio::test]
async fn test_update_unknown_job_is_ignored() {
    let store = InMemoryProgressStore::new();
    store.update_progress("ghost", 50).await.unwrap();
    assert!(store.get_progress("ghost").await.unwrap().is_none());
    assert!(store.complete_tracking("ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn test_user_active_jobs_only_lists_digesting() {
    let store = InMemoryProgressStore::new();
    store.start_tracking("cap-1", "user-1").await.unwrap();
    store.start_tracking("cap-2", "user-1").await.unwrap();
    store.start_tracking("cap-3", "user-2").await.unwrap();
    store.complete_tracking("cap-2").await.unwrap();

    let active = store.get_user_active_jobs("user-1").await.unwrap();
    let ids: Vec<&str> = active.iter().map(|p| p.capture_id.as_str()).collect();
    assert_eq!(ids, vec!["cap-1"]);

    assert!(store.get_user_active_jobs("user-3").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sweep_drops_expired_entries() {
    let store = InMemoryProgressStore::with_retention(Retention {
        active_ttl: Duration::from_secs(600),
        terminal: Duration::from_secs(300),
    });
    store.start_tracking("running", "user-1").await.unwrap();
    store.start_tracking("finished", "user-1").await.unwrap();
    store.complete_tracking("finished").await.unwrap();

    let now = Utc::now();
    assert_eq!(store.sweep_at(now).await, 0);

    // Past terminal retention, inside the active TTL
    assert_eq!(store.sweep_at(now + chrono::Duration::seconds(301)).await, 1);
    assert!(store.get_progress("finished").await.unwrap().is_none());
    assert!(store.get_progress("running").await.unwrap().is_some());

    // An abandoned active entry goes once its TTL passes
    assert_eq!(store.sweep_at(now + chrono::Duration::seconds(601)).await, 1);
    assert!(store.is_empty().await);
}
