//! Integration tests for `JobTracker` over the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use futures::StreamExt;
use opsdeck_core::error::CoreError;
use opsdeck_core::events::{EventPayload, JobEvent, EVENT_CHANNEL_PATTERN};
use opsdeck_core::job::{JobStatus, JobUpdate, NewJob};
use opsdeck_store::keys::MAX_LOG_ENTRIES;
use opsdeck_store::{JobTracker, MemoryStore, StateStore, StoreError, StoreTaskQueue, TaskQueue};

fn tracker() -> (JobTracker, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(StoreTaskQueue::new(store.clone()));
    (JobTracker::new(store.clone(), queue), store)
}

fn new_job(id: &str, owner: Option<&str>) -> NewJob {
    NewJob {
        job_id: Some(id.to_string()),
        name: "site.yml".to_string(),
        owner_id: owner.map(str::to_string),
        target_descriptor: serde_json::json!({"playbook": "site.yml", "hosts": ["web1"]}),
    }
}

// ---------------------------------------------------------------------------
// Test: create is idempotent and never resets status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_is_idempotent() {
    let (tracker, _) = tracker();

    let id = tracker.create(new_job("j1", Some("alice"))).await.expect("create");
    assert_eq!(id, "j1");
    tracker
        .update("j1", &JobUpdate::status(JobStatus::Started))
        .await
        .expect("update");

    let again = tracker.create(new_job("j1", Some("alice"))).await.expect("create");
    assert_eq!(again, "j1");

    let job = tracker.get("j1").await.expect("get").expect("job exists");
    assert_eq!(job.status, JobStatus::Started);

    // Only one index entry for the owner.
    let jobs = tracker.list_for_owner("alice", None, 10).await.expect("list");
    assert_eq!(jobs.len(), 1);
}

#[tokio::test]
async fn create_without_id_generates_one() {
    let (tracker, _) = tracker();
    let id = tracker
        .create(NewJob {
            name: "ping.yml".to_string(),
            ..Default::default()
        })
        .await
        .expect("create");

    assert_eq!(id.len(), 36);
    let job = tracker.get(&id).await.expect("get").expect("job exists");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.progress, 0);
}

// ---------------------------------------------------------------------------
// Test: terminal status is final
// ---------------------------------------------------------------------------

#[tokio::test]
async fn terminal_status_is_monotonic() {
    let (tracker, _) = tracker();
    tracker.create(new_job("j1", None)).await.expect("create");

    tracker
        .update("j1", &JobUpdate::status(JobStatus::Started))
        .await
        .expect("update");
    tracker
        .update("j1", &JobUpdate::status(JobStatus::Revoked))
        .await
        .expect("update");
    let end_time = tracker.get("j1").await.expect("get").expect("job").end_time;
    assert!(end_time.is_some());

    for status in [JobStatus::Started, JobStatus::Success, JobStatus::Failure] {
        let applied = tracker
            .update("j1", &JobUpdate::status(status).with_progress(50))
            .await
            .expect("update");
        assert!(applied);
    }

    let job = tracker.get("j1").await.expect("get").expect("job");
    assert_eq!(job.status, JobStatus::Revoked);
    assert_eq!(job.end_time, end_time);
    assert_eq!(job.progress, 50);
}

#[tokio::test]
async fn update_of_unknown_job_returns_false() {
    let (tracker, _) = tracker();
    let applied = tracker
        .update("ghost", &JobUpdate::status(JobStatus::Started))
        .await
        .expect("update");
    assert!(!applied);
}

#[tokio::test]
async fn concurrent_updates_keep_every_field() {
    let (tracker, _) = tracker();
    tracker.create(new_job("j1", None)).await.expect("create");

    let mut handles = Vec::new();
    for i in 0..8u8 {
        let tracker = tracker.clone();
        handles.push(tokio::spawn(async move {
            let update = if i == 0 {
                JobUpdate::status(JobStatus::Started)
            } else {
                JobUpdate::default().with_step(format!("step {i}"))
            };
            tracker.update("j1", &update).await
        }));
    }
    for handle in handles {
        assert!(handle.await.expect("join").expect("update"));
    }

    let job = tracker.get("j1").await.expect("get").expect("job");
    assert_eq!(job.status, JobStatus::Started);
    assert!(job.start_time.is_some());
    assert!(job.current_step.is_some());
}

// ---------------------------------------------------------------------------
// Test: events are published for every write
// ---------------------------------------------------------------------------

#[tokio::test]
async fn writes_are_published() {
    let (tracker, store) = tracker();
    let mut sub = store.psubscribe(EVENT_CHANNEL_PATTERN).await.expect("subscribe");

    tracker.create(new_job("j1", None)).await.expect("create");
    tracker
        .update(
            "j1",
            &JobUpdate::status(JobStatus::Started)
                .with_progress(0)
                .with_step("Starting playbook"),
        )
        .await
        .expect("update");
    tracker.append_log("j1", "PLAY [all]").await.expect("log");
    tracker.publish_error("j1", "boom", Some("E1")).await;

    let msg = sub.next().await.expect("status event");
    assert_eq!(msg.channel, "events:j1");
    let event = JobEvent::from_json(&msg.payload).expect("valid event");
    assert_matches!(event.payload, EventPayload::Status(ref s) if s.status == Some(JobStatus::Started)
        && s.progress == Some(0)
        && s.start_time.is_some()
        && s.end_time.is_none());

    let msg = sub.next().await.expect("log event");
    let event = JobEvent::from_json(&msg.payload).expect("valid event");
    assert_matches!(event.payload, EventPayload::Log(ref l) if l.message.ends_with("] PLAY [all]"));

    let msg = sub.next().await.expect("error event");
    let event = JobEvent::from_json(&msg.payload).expect("valid event");
    assert_matches!(event.payload, EventPayload::Error(ref e) if e.error_message == "boom"
        && e.error_code.as_deref() == Some("E1"));
}

// ---------------------------------------------------------------------------
// Test: log ordering, format and cap
// ---------------------------------------------------------------------------

#[tokio::test]
async fn logs_keep_order_and_format() {
    let (tracker, _) = tracker();
    tracker.create(new_job("j1", None)).await.expect("create");

    for line in ["PLAY [all]", "TASK [ping]", "ok: [web1]"] {
        tracker.append_log("j1", line).await.expect("log");
    }

    let logs = tracker.get_logs("j1", 100).await.expect("logs");
    assert_eq!(logs.len(), 3);
    assert!(logs[0].ends_with("] PLAY [all]"));
    assert!(logs[2].ends_with("] ok: [web1]"));

    // "[YYYY-MM-DD HH:MM:SS] "
    assert_eq!(&logs[0][0..1], "[");
    assert_eq!(&logs[0][20..22], "] ");

    let last = tracker.get_logs("j1", 2).await.expect("logs");
    assert_eq!(last.len(), 2);
    assert!(last[0].ends_with("TASK [ping]"));
    assert!(tracker.get_logs("j1", 0).await.expect("logs").is_empty());
}

#[tokio::test]
async fn logs_are_capped() {
    let (tracker, _) = tracker();
    tracker.create(new_job("j1", None)).await.expect("create");

    for i in 0..MAX_LOG_ENTRIES + 5 {
        tracker.append_log("j1", &format!("line {i}")).await.expect("log");
    }

    let logs = tracker.get_logs("j1", usize::MAX).await.expect("logs");
    assert_eq!(logs.len(), MAX_LOG_ENTRIES);
    assert!(logs[0].ends_with("] line 5"));
}

// ---------------------------------------------------------------------------
// Test: owner listing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_for_owner_sorts_and_filters() {
    let (tracker, _) = tracker();
    for id in ["a", "b", "c"] {
        tracker.create(new_job(id, Some("alice"))).await.expect("create");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    tracker.create(new_job("x", Some("bob"))).await.expect("create");
    tracker
        .update("b", &JobUpdate::status(JobStatus::Success))
        .await
        .expect("update");

    let all = tracker.list_for_owner("alice", None, 10).await.expect("list");
    let ids: Vec<&str> = all.iter().map(|j| j.job_id.as_str()).collect();
    assert_eq!(ids, vec!["c", "b", "a"]);

    let done = tracker
        .list_for_owner("alice", Some(JobStatus::Success), 10)
        .await
        .expect("list");
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].job_id, "b");

    let limited = tracker.list_for_owner("alice", None, 2).await.expect("list");
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].job_id, "c");
}

// ---------------------------------------------------------------------------
// Test: cancel and submit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_revokes_running_job() {
    let (tracker, _) = tracker();
    tracker.create(new_job("j1", None)).await.expect("create");
    tracker
        .update("j1", &JobUpdate::status(JobStatus::Started))
        .await
        .expect("update");

    assert!(tracker.cancel("j1").await.expect("cancel"));
    assert!(tracker.queue().is_revoked("j1").await.expect("is_revoked"));

    let job = tracker.get("j1").await.expect("get").expect("job");
    assert_eq!(job.status, JobStatus::Revoked);
    assert!(job.end_time.is_some());

    // Second cancel finds a terminal job.
    assert!(!tracker.cancel("j1").await.expect("cancel"));
    assert!(!tracker.cancel("ghost").await.expect("cancel"));
}

#[tokio::test]
async fn submit_enqueues_and_rejects_finished_ids() {
    let (tracker, _) = tracker();

    let id = tracker.submit(new_job("j1", None)).await.expect("submit");
    let queued = tracker
        .queue()
        .next(Duration::from_millis(10))
        .await
        .expect("next");
    assert_eq!(queued.as_deref(), Some(id.as_str()));

    tracker
        .update("j1", &JobUpdate::status(JobStatus::Failure))
        .await
        .expect("update");

    let err = tracker
        .submit(new_job("j1", None))
        .await
        .expect_err("terminal id must be rejected");
    assert_matches!(err, StoreError::Core(CoreError::Conflict(_)));
}

#[tokio::test]
async fn ids_clashing_with_log_keys_are_rejected() {
    let (tracker, _) = tracker();
    tracker.create(new_job("x", None)).await.expect("create");
    tracker.append_log("x", "hello").await.expect("append");

    let err = tracker
        .create(new_job("x:logs", None))
        .await
        .expect_err("separator in id");
    assert_matches!(err, StoreError::Core(CoreError::Validation(_)));

    let err = tracker
        .submit(new_job("x:logs", None))
        .await
        .expect_err("separator in id");
    assert_matches!(err, StoreError::Core(CoreError::Validation(_)));

    assert_eq!(tracker.get_logs("x", 10).await.expect("logs").len(), 1);
    let queued = tracker
        .queue()
        .next(Duration::from_millis(10))
        .await
        .expect("next");
    assert_eq!(queued, None);
}

// ---------------------------------------------------------------------------
// Test: retention sweep
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cleanup_removes_old_jobs_only() {
    let (tracker, store) = tracker();
    tracker.create(new_job("old", Some("alice"))).await.expect("create");
    tracker.append_log("old", "hello").await.expect("log");

    assert_eq!(tracker.cleanup_expired(7).await.expect("cleanup"), 0);
    assert!(tracker.get("old").await.expect("get").is_some());

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(tracker.cleanup_expired(0).await.expect("cleanup"), 1);

    assert!(tracker.get("old").await.expect("get").is_none());
    assert!(tracker.get_logs("old", 10).await.expect("logs").is_empty());
    assert!(store
        .range("owner:alice:jobs", 0, -1)
        .await
        .expect("range")
        .is_empty());
}
