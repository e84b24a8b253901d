use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use tracelink_domain::event::EventType;
use tracelink_domain::outbox::OutboxStatus;
use tracelink_relay::domain::repository::{OutboxStore, Projector, StreamPublisher};
use tracelink_relay::domain::types::{ClaimRequest, ProjectScope};
use tracelink_relay::usecase::health::{OutboxHealthUseCase, RequeueDeadLetterUseCase};
use tracelink_relay::usecase::sweep::RetrySweepUseCase;

use crate::helpers::{
    DedupProjector, FlakyPublisher, MemoryStream, SlowPublisher, append_event,
    create_requirement, poller, setup_db, store,
};

fn aggregate_order(stream: &MemoryStream, aggregate_id: &str) -> Vec<String> {
    stream
        .entries()
        .into_iter()
        .filter(|e| e.aggregate_id == aggregate_id)
        .map(|e| e.event_type)
        .collect()
}

// ── Delivery ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn should_publish_committed_events_and_mark_them_published() {
    let db = setup_db().await;
    let outcome = create_requirement(&db, "req-1", "Trace uploads").await;
    let stream = MemoryStream::default();

    let report = poller(&db, stream.clone(), 5).execute().await.unwrap();

    assert_eq!(report.published, 1);
    let entries = stream.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outbox_id, outcome.id());
    assert_eq!(entries[0].event_type, "REQUIREMENT_CREATED");
    let row = store(&db).find(outcome.id()).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Published);
    assert!(row.published_at.is_some());
}

#[tokio::test]
async fn should_publish_events_committed_before_restart() {
    let db = setup_db().await;
    create_requirement(&db, "req-1", "Trace uploads").await;
    create_requirement(&db, "req-2", "Audit trail").await;

    // No poller ran before the "restart"; a fresh instance picks everything up.
    let stream = MemoryStream::default();
    let report = poller(&db, stream.clone(), 5).execute().await.unwrap();

    assert_eq!(report.published, 2);
    assert_eq!(stream.entries().len(), 2);
}

#[tokio::test]
async fn should_preserve_order_within_aggregate() {
    let db = setup_db().await;
    append_event(&db, EventType::TaskCreated, "task-1").await;
    append_event(&db, EventType::TaskCreated, "task-2").await;
    append_event(&db, EventType::TaskAssigned, "task-1").await;
    append_event(&db, EventType::TaskStatusChanged, "task-1").await;
    let stream = MemoryStream::default();

    poller(&db, stream.clone(), 5).execute().await.unwrap();

    assert_eq!(
        aggregate_order(&stream, "task-1"),
        vec!["TASK_CREATED", "TASK_ASSIGNED", "TASK_STATUS_CHANGED"]
    );
}

#[tokio::test]
async fn should_carry_remaining_rows_over_when_batch_is_full() {
    let db = setup_db().await;
    append_event(&db, EventType::TaskCreated, "task-1").await;
    append_event(&db, EventType::TaskCreated, "task-2").await;
    append_event(&db, EventType::TaskAssigned, "task-1").await;
    append_event(&db, EventType::TaskCreated, "task-3").await;
    append_event(&db, EventType::TaskAssigned, "task-2").await;
    append_event(&db, EventType::TaskStatusChanged, "task-1").await;
    let stream = MemoryStream::default();
    let mut poller = poller(&db, stream.clone(), 5);
    poller.settings.batch_size = 4;

    let first = poller.execute().await.unwrap();
    assert_eq!(first.claimed, 4);
    assert_eq!(first.published, 4);

    let second = poller.execute().await.unwrap();
    assert_eq!(second.claimed, 2);
    assert_eq!(second.published, 2);

    assert_eq!(
        aggregate_order(&stream, "task-1"),
        vec!["TASK_CREATED", "TASK_ASSIGNED", "TASK_STATUS_CHANGED"]
    );
    assert_eq!(
        aggregate_order(&stream, "task-2"),
        vec!["TASK_CREATED", "TASK_ASSIGNED"]
    );
}

#[tokio::test]
async fn should_defer_rows_the_lease_cannot_cover() {
    let db = setup_db().await;
    append_event(&db, EventType::SprintCreated, "sprint-1").await;
    append_event(&db, EventType::SprintStarted, "sprint-1").await;
    append_event(&db, EventType::SprintCreated, "sprint-2").await;
    let publisher = SlowPublisher {
        stream: MemoryStream::default(),
        delay: Duration::from_millis(150),
    };
    // Publishing may start only in the first 100 ms of the lease; one
    // publish outlasts that window.
    let mut poller = poller(&db, publisher.clone(), 5);
    poller.settings.claim_ttl = Duration::from_millis(400);
    poller.settings.publish_timeout = Duration::from_millis(300);

    let first = poller.execute().await.unwrap();
    assert_eq!(first.claimed, 3);
    assert_eq!(first.published, 1);
    assert_eq!(first.deferred, 2);

    // Deferred rows are released, not left leased: the next tick takes them.
    let mut published = first.published;
    for _ in 0..5 {
        if published == 3 {
            break;
        }
        let report = poller.execute().await.unwrap();
        assert!(report.published >= 1);
        published += report.published;
    }
    assert_eq!(published, 3);
    assert_eq!(
        aggregate_order(&publisher.stream, "sprint-1"),
        vec!["SPRINT_CREATED", "SPRINT_STARTED"]
    );
}

// ── Failure and retry ────────────────────────────────────────────────────────

#[tokio::test]
async fn should_hold_back_aggregate_until_failed_event_is_retried() {
    let db = setup_db().await;
    append_event(&db, EventType::StoryCreated, "story-1").await;
    append_event(&db, EventType::StoryCreated, "story-2").await;
    append_event(&db, EventType::StoryStatusChanged, "story-1").await;
    let publisher = FlakyPublisher::default();
    publisher.fail("story-1", 1);
    let poller = poller(&db, publisher.clone(), 5);

    let first = poller.execute().await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(first.published, 1);
    assert_eq!(first.deferred, 1);

    // story-1 has a retryable failure: its later event must wait.
    let second = poller.execute().await.unwrap();
    assert_eq!(second.claimed, 0);

    let requeued = RetrySweepUseCase {
        store: store(&db),
        max_retries: 5,
    }
    .execute()
    .await
    .unwrap();
    assert_eq!(requeued, 1);

    let third = poller.execute().await.unwrap();
    assert_eq!(third.published, 2);
    assert_eq!(
        aggregate_order(&publisher.stream, "story-1"),
        vec!["STORY_CREATED", "STORY_STATUS_CHANGED"]
    );
}

#[tokio::test]
async fn should_not_let_failing_aggregate_starve_others() {
    let db = setup_db().await;
    append_event(&db, EventType::TaskCreated, "task-a").await;
    append_event(&db, EventType::TaskAssigned, "task-a").await;
    append_event(&db, EventType::TaskStatusChanged, "task-a").await;
    append_event(&db, EventType::TaskCreated, "task-b").await;
    let publisher = FlakyPublisher::default();
    publisher.fail("task-a", usize::MAX);
    let mut poller = poller(&db, publisher.clone(), 5);
    poller.settings.batch_size = 2;

    let first = poller.execute().await.unwrap();
    assert_eq!(first.claimed, 2);
    assert_eq!(first.failed, 1);
    assert_eq!(first.deferred, 1);

    // task-a is held back by its retryable failure; the batch goes to task-b.
    let second = poller.execute().await.unwrap();
    assert_eq!(second.claimed, 1);
    assert_eq!(second.published, 1);
    assert_eq!(aggregate_order(&publisher.stream, "task-b"), vec!["TASK_CREATED"]);
    assert!(aggregate_order(&publisher.stream, "task-a").is_empty());
}

#[tokio::test]
async fn should_dead_letter_after_max_retries() {
    let db = setup_db().await;
    let id = append_event(&db, EventType::SprintStarted, "sprint-1").await;
    let publisher = FlakyPublisher::default();
    publisher.fail("sprint-1", usize::MAX);
    let poller = poller(&db, publisher.clone(), 3);
    let sweep = RetrySweepUseCase {
        store: store(&db),
        max_retries: 3,
    };

    for attempt in 1..=3u32 {
        let report = poller.execute().await.unwrap();
        assert_eq!(report.failed, 1, "attempt {attempt}");
        let row = store(&db).find(id).await.unwrap().unwrap();
        assert_eq!(row.retry_count, attempt);
        assert_eq!(row.status, OutboxStatus::Failed);
        assert_eq!(
            row.last_error.as_deref(),
            Some("stream transport error: connection reset by peer")
        );
        sweep.execute().await.unwrap();
    }

    // Budget exhausted: the sweep leaves it alone and the poller never sees it.
    let row = store(&db).find(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
    assert!(row.is_dead_lettered(3));
    assert_eq!(sweep.execute().await.unwrap(), 0);
    assert_eq!(poller.execute().await.unwrap().claimed, 0);

    let health = OutboxHealthUseCase {
        store: store(&db),
        lag_threshold: Duration::from_secs(300),
        max_retries: 3,
    }
    .execute(ProjectScope::default())
    .await
    .unwrap();
    assert_eq!(health.dead_lettered, 1);
    assert!(!health.is_healthy());

    // Operator fixes the downstream and requeues.
    publisher.heal("sprint-1");
    RequeueDeadLetterUseCase {
        store: store(&db),
        max_retries: 3,
    }
    .execute(id)
    .await
    .unwrap();
    assert_eq!(poller.execute().await.unwrap().published, 1);
    assert_eq!(publisher.stream.entries().len(), 1);
}

// ── Crash and concurrency ────────────────────────────────────────────────────

#[tokio::test]
async fn should_redeliver_after_crash_between_publish_and_mark() {
    let db = setup_db().await;
    let id = append_event(&db, EventType::RfpUploaded, "rfp-1").await;
    let stream = MemoryStream::default();

    // A relay instance claims with a short lease, publishes, then dies before
    // recording the outcome.
    let now = Utc::now();
    let claimed = store(&db)
        .claim_pending(&ClaimRequest {
            token: Uuid::now_v7(),
            batch_size: 10,
            now,
            lease_until: now + chrono::Duration::milliseconds(500),
            max_retries: 5,
        })
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    stream.publish(&claimed[0].to_stream_entry()).await.unwrap();

    // While the lease is live nobody else may take the row.
    assert_eq!(poller(&db, stream.clone(), 5).execute().await.unwrap().claimed, 0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let report = poller(&db, stream.clone(), 5).execute().await.unwrap();
    assert_eq!(report.published, 1);

    // At-least-once: the entry is in the stream twice, the projection applies it once.
    let entries = stream.entries();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.outbox_id == id));
    let projector = DedupProjector::default();
    for entry in &entries {
        projector.project(entry).await.unwrap();
    }
    assert_eq!(projector.applied_ids(), vec![id]);
}

#[tokio::test]
async fn should_not_double_publish_with_concurrent_pollers() {
    let db = setup_db().await;
    for i in 0..20 {
        append_event(&db, EventType::TaskCreated, &format!("task-{i}")).await;
    }
    let stream = MemoryStream::default();
    let a = poller(&db, stream.clone(), 5);
    let b = poller(&db, stream.clone(), 5);

    let (ra, rb) = tokio::join!(a.execute(), b.execute());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.published + rb.published, 20);
    let ids: HashSet<_> = stream.entries().into_iter().map(|e| e.outbox_id).collect();
    assert_eq!(ids.len(), 20);
    assert_eq!(stream.entries().len(), 20);
}

#[tokio::test]
async fn should_not_touch_row_after_claim_was_lost() {
    let db = setup_db().await;
    let id = append_event(&db, EventType::TaskCreated, "task-1").await;
    let store = store(&db);
    let now = Utc::now();
    let stale = Uuid::now_v7();
    store
        .claim_pending(&ClaimRequest {
            token: stale,
            batch_size: 1,
            now,
            lease_until: now + chrono::Duration::seconds(30),
            max_retries: 5,
        })
        .await
        .unwrap();

    assert!(!store.mark_published(id, Uuid::now_v7(), Utc::now()).await.unwrap());
    assert_eq!(store.mark_failed(id, Uuid::now_v7(), "boom").await.unwrap(), None);
    assert!(store.mark_published(id, stale, Utc::now()).await.unwrap());
    let row = store.find(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Published);
}
