//! Worker processing against the in-memory store and a scripted model.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use skillq::config::WorkerSettings;
use skillq::engine::{ShutdownFlag, Worker};
use skillq::llm::{CallFailure, ModelClient};
use skillq::model::{ItemId, NewTicket, RunStatus, SourceRecord, Status};
use skillq::store::{MemoryStore, QueueReader, WorkQueue};
use tokio::sync::Barrier;

/// Replies in order, then repeats `fallback`.
struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, CallFailure>>>,
    fallback: Result<String, CallFailure>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedModel {
    fn always(reply: Result<&str, CallFailure>) -> Self {
        Self::scripted(Vec::new(), reply)
    }

    fn scripted(replies: Vec<Result<&str, CallFailure>>, fallback: Result<&str, CallFailure>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| r.map(str::to_string)).collect()),
            fallback: fallback.map(str::to_string),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn analyze(&self, _ticket_text: &str) -> Result<String, CallFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.replies.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

fn settings() -> WorkerSettings {
    WorkerSettings {
        batch_size: 10,
        max_token_threshold: 8000,
        max_attempts: 3,
        idle_secs: 0,
        poll_interval_secs: 0,
        item_timeout_secs: 30,
    }
}

async fn seed(store: &MemoryStore, tickets: &[(i64, &str)]) -> Vec<ItemId> {
    for (id, text) in tickets {
        let ticket = NewTicket::from_record(&SourceRecord {
            ticket_id: *id,
            summary: Some(text.to_string()),
            ..Default::default()
        })
        .unwrap();
        store.insert_if_absent(&ticket).await.unwrap();
    }
    store
        .list_items(None, 100)
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect()
}

fn worker<M: ModelClient>(
    id: &str,
    store: &Arc<MemoryStore>,
    model: &Arc<M>,
    settings: WorkerSettings,
) -> Worker<MemoryStore, M> {
    Worker::new(
        id,
        1,
        Arc::clone(store),
        Arc::clone(model),
        settings,
        Arc::new(ShutdownFlag::new()),
    )
}

#[tokio::test]
async fn completes_items_with_parsed_skills() {
    let store = Arc::new(MemoryStore::new());
    let ids = seed(&store, &[(1, "reset exchange mailbox"), (2, "rebuild raid array")]).await;
    let model = Arc::new(ScriptedModel::always(Ok(r#"["Exchange", "exchange", "PowerShell"]"#)));

    let run = worker("w1", &store, &model, settings()).run().await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.worker_id, "w1");
    assert_eq!(run.cycle, 1);
    assert_eq!(run.items_processed, 2);
    assert_eq!(run.items_failed, 0);
    for id in ids {
        let item = store.get_item(id).await.unwrap();
        assert_eq!(item.status, Status::Complete);
        assert_eq!(item.attempt_count, 1);
        assert_eq!(
            store.skills_for_item(id).await.unwrap(),
            vec!["Exchange", "PowerShell"]
        );
    }
}

#[tokio::test]
async fn oversized_items_never_reach_the_model() {
    let store = Arc::new(MemoryStore::new());
    let huge = "event log dump ".repeat(100);
    let ids = seed(&store, &[(1, &huge), (2, "unlock account")]).await;
    let model = Arc::new(ScriptedModel::always(Ok(r#"["Active Directory"]"#)));
    let settings = WorkerSettings {
        max_token_threshold: 100,
        ..settings()
    };

    let run = worker("w1", &store, &model, settings).run().await;

    assert_eq!(model.calls(), 1);
    assert_eq!(run.items_processed, 1);
    assert_eq!(run.items_failed, 1);
    let oversized = store.get_item(ids[0]).await.unwrap();
    assert_eq!(oversized.status, Status::Failed);
    assert_eq!(oversized.attempt_count, 0);
    assert!(oversized.claimed_by.is_none());
    assert!(oversized.failure_reason.unwrap().starts_with("oversized"));
}

#[tokio::test]
async fn retries_within_the_claim_until_a_reply_parses() {
    let store = Arc::new(MemoryStore::new());
    let ids = seed(&store, &[(1, "printer queue stuck")]).await;
    let model = Arc::new(ScriptedModel::scripted(
        vec![
            Err(CallFailure::timeout("no reply in 90s")),
            Ok("I think the skills are printers"),
        ],
        Ok(r#"{"skills": ["Print Spooler"]}"#),
    ));

    let run = worker("w1", &store, &model, settings()).run().await;

    assert_eq!(run.items_processed, 1);
    assert_eq!(model.calls(), 3);
    let item = store.get_item(ids[0]).await.unwrap();
    assert_eq!(item.status, Status::Complete);
    assert_eq!(item.attempt_count, 3);
    assert_eq!(store.skills_for_item(ids[0]).await.unwrap(), vec!["Print Spooler"]);
}

#[tokio::test]
async fn fails_after_max_attempts_with_last_model_error() {
    let store = Arc::new(MemoryStore::new());
    let ids = seed(&store, &[(1, "dns not resolving")]).await;
    let model = Arc::new(ScriptedModel::always(Err(CallFailure::server("HTTP 500"))));
    let settings = WorkerSettings {
        max_attempts: 2,
        ..settings()
    };

    let run = worker("w1", &store, &model, settings).run().await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.items_failed, 1);
    assert_eq!(model.calls(), 2);
    let item = store.get_item(ids[0]).await.unwrap();
    assert_eq!(item.status, Status::Failed);
    assert_eq!(item.attempt_count, 2);
    let reason = item.failure_reason.unwrap();
    assert!(reason.starts_with("model call failed"), "{reason}");
    assert!(reason.contains("HTTP 500"));
}

#[tokio::test]
async fn parse_failure_is_recorded_as_the_reason() {
    let store = Arc::new(MemoryStore::new());
    let ids = seed(&store, &[(1, "teams crashing")]).await;
    let model = Arc::new(ScriptedModel::always(Ok("Sorry, I cannot help with that.")));

    worker("w1", &store, &model, settings()).run().await;

    let item = store.get_item(ids[0]).await.unwrap();
    assert_eq!(item.status, Status::Failed);
    assert!(item.failure_reason.unwrap().starts_with("parse failed"));
}

#[tokio::test]
async fn reclaimed_item_at_the_ceiling_fails_without_a_call() {
    let store = Arc::new(MemoryStore::new());
    let ids = seed(&store, &[(1, "vpn tunnel flapping")]).await;

    // A previous owner used up every attempt, then crashed.
    store.claim_batch("crashed", 1, u32::MAX).await.unwrap();
    for _ in 0..3 {
        store.record_attempt(ids[0], "crashed").await.unwrap();
    }
    store.sweep_stale(Duration::ZERO).await.unwrap();

    let model = Arc::new(ScriptedModel::always(Ok(r#"["VPN"]"#)));
    let run = worker("w2", &store, &model, settings()).run().await;

    assert_eq!(model.calls(), 0);
    assert_eq!(run.items_failed, 1);
    let item = store.get_item(ids[0]).await.unwrap();
    assert_eq!(item.status, Status::Failed);
    assert_eq!(item.failure_reason.as_deref(), Some("attempts exhausted (3)"));
}

#[tokio::test]
async fn reclaimed_item_gets_only_the_remaining_attempts() {
    let store = Arc::new(MemoryStore::new());
    let ids = seed(&store, &[(1, "sharepoint permissions")]).await;
    store.claim_batch("crashed", 1, u32::MAX).await.unwrap();
    store.record_attempt(ids[0], "crashed").await.unwrap();
    store.record_attempt(ids[0], "crashed").await.unwrap();
    store.sweep_stale(Duration::ZERO).await.unwrap();

    let model = Arc::new(ScriptedModel::always(Err(CallFailure::connection("refused"))));
    worker("w2", &store, &model, settings()).run().await;

    assert_eq!(model.calls(), 1);
    assert_eq!(store.get_item(ids[0]).await.unwrap().attempt_count, 3);
}

#[tokio::test(start_paused = true)]
async fn slow_items_fail_on_the_item_timeout() {
    let store = Arc::new(MemoryStore::new());
    let ids = seed(&store, &[(1, "slow ticket")]).await;
    let model = Arc::new(ScriptedModel::always(Ok(r#"["SQL"]"#)).slow(Duration::from_secs(60)));
    let settings = WorkerSettings {
        item_timeout_secs: 5,
        ..settings()
    };

    let run = worker("w1", &store, &model, settings).run().await;

    assert_eq!(run.items_failed, 1);
    let item = store.get_item(ids[0]).await.unwrap();
    assert_eq!(item.status, Status::Failed);
    assert_eq!(item.failure_reason.as_deref(), Some("timed out after 5s"));
}

#[tokio::test]
async fn shutdown_before_start_claims_nothing() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &[(1, "password reset")]).await;
    let model = Arc::new(ScriptedModel::always(Ok("[]")));
    let flag = ShutdownFlag::new();
    flag.request();

    let run = Worker::new(
        "w1",
        1,
        Arc::clone(&store),
        Arc::clone(&model),
        settings(),
        Arc::new(flag),
    )
    .run()
    .await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.items_processed, 0);
    assert_eq!(store.pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn passed_deadline_stops_claiming() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &[(1, "password reset")]).await;
    let model = Arc::new(ScriptedModel::always(Ok("[]")));

    let run = worker("w1", &store, &model, settings())
        .with_deadline(tokio::time::Instant::now())
        .run()
        .await;

    assert_eq!(run.items_processed, 0);
    assert_eq!(model.calls(), 0);
    assert_eq!(store.pending_count().await.unwrap(), 1);
}

/// Simulates the sweep handing the item to another worker mid-call.
struct StealingModel {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl ModelClient for StealingModel {
    async fn analyze(&self, _ticket_text: &str) -> Result<String, CallFailure> {
        self.store.sweep_stale(Duration::ZERO).await.unwrap();
        self.store.claim_batch("thief", 1, u32::MAX).await.unwrap();
        Ok(r#"["SQL"]"#.to_string())
    }
}

#[tokio::test]
async fn lost_claim_is_left_to_the_new_owner() {
    let store = Arc::new(MemoryStore::new());
    let ids = seed(&store, &[(1, "sql job failing")]).await;
    let model = Arc::new(StealingModel {
        store: Arc::clone(&store),
    });

    let run = Worker::new(
        "w1",
        1,
        Arc::clone(&store),
        model,
        settings(),
        Arc::new(ShutdownFlag::new()),
    )
    .run()
    .await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.items_processed, 0);
    assert_eq!(run.items_failed, 0);
    let item = store.get_item(ids[0]).await.unwrap();
    assert_eq!(item.status, Status::Claimed);
    assert_eq!(item.claimed_by.as_deref(), Some("thief"));
}

/// Holds the first call until a second caller arrives, so both workers have
/// claimed before either finishes an item.
struct MeetingModel {
    meet: Barrier,
    calls: AtomicUsize,
}

#[async_trait]
impl ModelClient for MeetingModel {
    async fn analyze(&self, _ticket_text: &str) -> Result<String, CallFailure> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < 2 {
            self.meet.wait().await;
        }
        Ok(r#"["Networking"]"#.to_string())
    }
}

/// Sweeps anything claimed more than 20ms ago, then takes 30ms to answer.
struct SweepingModel {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl ModelClient for SweepingModel {
    async fn analyze(&self, _ticket_text: &str) -> Result<String, CallFailure> {
        self.store
            .sweep_stale(Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok(r#"["DHCP"]"#.to_string())
    }
}

#[tokio::test]
async fn long_batch_is_not_swept_while_the_worker_is_busy() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, &[(1, "scope exhausted"), (2, "lease conflict"), (3, "relay down")]).await;
    let model = Arc::new(SweepingModel {
        store: Arc::clone(&store),
    });

    let run = worker("w1", &store, &model, settings()).run().await;

    assert_eq!(run.items_claimed, 3);
    assert_eq!(run.items_processed, 3);
    let counts = store.status_counts().await.unwrap();
    assert_eq!((counts.complete, counts.pending, counts.claimed), (3, 0, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_workers_drain_the_queue_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    let ids = seed(&store, &[(1, "a"), (2, "b"), (3, "c")]).await;
    let settings = WorkerSettings {
        batch_size: 2,
        ..settings()
    };

    let model = Arc::new(MeetingModel {
        meet: Barrier::new(2),
        calls: AtomicUsize::new(0),
    });

    let a = worker("w1", &store, &model, settings.clone());
    let b = worker("w2", &store, &model, settings);
    let (run_a, run_b) = tokio::join!(a.run(), b.run());

    let mut claimed = [run_a.items_claimed, run_b.items_claimed];
    claimed.sort();
    assert_eq!(claimed, [1, 2]);
    assert_eq!(run_a.items_processed + run_b.items_processed, 3);
    assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    let done: HashSet<_> = store
        .list_items(Some(Status::Complete), 10)
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(done, ids.into_iter().collect());
    assert!(store.in_flight().await.unwrap().is_empty());
}
