//! Scheduler Integration Tests
//!
//! Tests for priority ordering, the prefetch limit, retry backoff,
//! dead-lettering and journal replay.

use std::time::Duration;

use chrono::Utc;
use digestion::domain::{ContentType, DigestionJob, Priority};
use digestion::queue::{JobQueue, NackOutcome, QueueConfig, QueueError};
use tempfile::TempDir;

fn job(id: &str, priority: Priority) -> DigestionJob {
    DigestionJob::new(id, "user-1", ContentType::Text, priority)
}

fn config(prefetch: usize) -> QueueConfig {
    QueueConfig {
        prefetch,
        ..QueueConfig::default()
    }
}

#[tokio::test]
async fn test_high_priority_dequeued_first() {
    let queue = JobQueue::in_memory(config(10));

    queue.enqueue(job("normal-1", Priority::Normal)).await.unwrap();
    queue.enqueue(job("high-1", Priority::High)).await.unwrap();
    queue.enqueue(job("normal-2", Priority::Normal)).await.unwrap();
    queue.enqueue(job("high-2", Priority::High)).await.unwrap();

    let mut order = Vec::new();
    while let Some(job) = queue.dequeue().await.unwrap() {
        order.push(job.capture_id);
    }

    assert_eq!(order, vec!["high-1", "high-2", "normal-1", "normal-2"]);
}

#[tokio::test]
async fn test_prefetch_limit_holds_back_jobs() {
    let queue = JobQueue::in_memory(config(2));
    for id in ["a", "b", "c"] {
        queue.enqueue(job(id, Priority::Normal)).await.unwrap();
    }

    assert!(queue.dequeue().await.unwrap().is_some());
    assert!(queue.dequeue().await.unwrap().is_some());
    assert_eq!(queue.in_flight_count(), 2);

    // At the limit nothing is handed out, even though "c" is ready
    assert!(queue.dequeue().await.unwrap().is_none());
    assert_eq!(queue.depth(), 1);

    queue.ack("a").await.unwrap();
    let next = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(next.capture_id, "c");
}

#[tokio::test]
async fn test_backoff_then_dead_letter() {
    let queue = JobQueue::in_memory(config(1));
    queue.enqueue(job("cap-1", Priority::Normal)).await.unwrap();

    let mut now = Utc::now();
    let expected = [5000u64, 15000, 45000];

    for (attempt, delay_ms) in expected.iter().enumerate() {
        let dispatched = queue.dequeue_at(now).await.unwrap().unwrap();
        assert_eq!(dispatched.retry_count, attempt as u32);

        let outcome = queue.nack_at("cap-1", now).await.unwrap();
        assert_eq!(
            outcome,
            NackOutcome::RetryScheduled {
                retry_count: attempt as u32 + 1,
                delay: Duration::from_millis(*delay_ms),
            }
        );

        // Not ready a millisecond early
        let early = now + chrono::Duration::milliseconds(*delay_ms as i64 - 1);
        assert!(queue.dequeue_at(early).await.unwrap().is_none());

        now += chrono::Duration::milliseconds(*delay_ms as i64);
    }

    let last = queue.dequeue_at(now).await.unwrap().unwrap();
    assert_eq!(last.retry_count, 3);
    assert_eq!(queue.nack_at("cap-1", now).await.unwrap(), NackOutcome::DeadLettered);

    // Never rescheduled
    let far_future = now + chrono::Duration::hours(1);
    assert!(queue.dequeue_at(far_future).await.unwrap().is_none());
    assert_eq!(queue.depth(), 0);

    let dead = queue.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job.capture_id, "cap-1");
    assert_eq!(dead[0].job.retry_count, 3);
    assert_eq!(dead[0].reason, "retries exhausted");
}

#[tokio::test]
async fn test_reject_skips_retries() {
    let queue = JobQueue::in_memory(config(1));
    queue.enqueue(job("cap-1", Priority::Normal)).await.unwrap();
    queue.dequeue().await.unwrap();

    queue.reject("cap-1", "validation_failed").await.unwrap();

    let stats = queue.stats().await;
    assert_eq!(stats.depth, 0);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.dead_letters, 1);
    assert_eq!(queue.dead_letters().await[0].reason, "validation_failed");
}

#[tokio::test]
async fn test_one_active_job_per_capture() {
    let queue = JobQueue::in_memory(config(1));
    queue.enqueue(job("cap-1", Priority::Normal)).await.unwrap();
    queue.dequeue().await.unwrap();

    let err = queue
        .enqueue(job("cap-1", Priority::High))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::AlreadyQueued(id) if id == "cap-1"));

    // Free again once acknowledged
    queue.ack("cap-1").await.unwrap();
    queue.enqueue(job("cap-1", Priority::High)).await.unwrap();
}

#[tokio::test]
async fn test_overload_flag_tracks_threshold() {
    let queue = JobQueue::in_memory(QueueConfig {
        overload_threshold: 2,
        ..config(1)
    });

    assert!(!queue.enqueue(job("a", Priority::Normal)).await.unwrap().overloaded);
    assert!(!queue.enqueue(job("b", Priority::Normal)).await.unwrap().overloaded);
    let third = queue.enqueue(job("c", Priority::Normal)).await.unwrap();
    assert!(third.overloaded);
    assert_eq!(third.depth, 3);

    queue.dequeue().await.unwrap();
    assert!(!queue.is_overloaded());
}

#[tokio::test]
async fn test_journal_redelivers_in_flight_jobs() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("queue.jsonl");

    {
        let queue = JobQueue::open(&path, config(1)).await.unwrap();
        queue.enqueue(job("normal-1", Priority::Normal)).await.unwrap();
        queue.enqueue(job("normal-2", Priority::Normal)).await.unwrap();
        queue.enqueue(job("high-1", Priority::High)).await.unwrap();

        let dispatched = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(dispatched.capture_id, "high-1");
        // Process stops before the ack
    }

    let queue = JobQueue::open(&path, config(10)).await.unwrap();
    assert_eq!(queue.depth(), 3);
    assert_eq!(queue.in_flight_count(), 0);

    let mut order = Vec::new();
    while let Some(job) = queue.dequeue().await.unwrap() {
        order.push(job.capture_id);
    }
    assert_eq!(order, vec!["high-1", "normal-1", "normal-2"]);
}

#[tokio::test]
async fn test_journal_keeps_delays_and_dead_letters() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("queue.jsonl");
    let now = Utc::now();

    {
        let queue = JobQueue::open(&path, config(2)).await.unwrap();
        queue.enqueue(job("retry-me", Priority::Normal)).await.unwrap();
        queue.enqueue(job("bad", Priority::Normal)).await.unwrap();
        queue.enqueue(job("done", Priority::Normal)).await.unwrap();

        queue.dequeue_at(now).await.unwrap();
        queue.dequeue_at(now).await.unwrap();
        queue.nack_at("retry-me", now).await.unwrap();
        queue.reject("bad", "extraction_failed").await.unwrap();

        queue.dequeue_at(now).await.unwrap();
        queue.ack("done").await.unwrap();
    }

    // Reopen twice: the second open reads the compacted journal
    drop(JobQueue::open(&path, config(2)).await.unwrap());
    let queue = JobQueue::open(&path, config(2)).await.unwrap();

    let stats = queue.stats().await;
    assert_eq!(stats.depth, 1);
    assert_eq!(stats.delayed, 1);
    assert_eq!(stats.dead_letters, 1);
    assert_eq!(queue.dead_letters().await[0].reason, "extraction_failed");

    assert!(queue.dequeue_at(now).await.unwrap().is_none());
    let due = now + chrono::Duration::milliseconds(5000);
    let retried = queue.dequeue_at(due).await.unwrap().unwrap();
    assert_eq!(retried.capture_id, "retry-me");
    assert_eq!(retried.retry_count, 1);
}

#[tokio::test]
async fn test_remove_withdraws_queued_job() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("queue.jsonl");

    {
        let queue = JobQueue::open(&path, config(1)).await.unwrap();
        queue.enqueue(job("keep", Priority::Normal)).await.unwrap();
        queue.enqueue(job("drop", Priority::Normal)).await.unwrap();
        assert!(queue.remove("drop").await.unwrap());
        assert!(!queue.remove("missing").await.unwrap());
    }

    let queue = JobQueue::open(&path, config(1)).await.unwrap();
    assert_eq!(queue.depth(), 1);
    assert_eq!(queue.position("keep").await, Some(0));
    assert_eq!(queue.position("drop").await, None);
}
