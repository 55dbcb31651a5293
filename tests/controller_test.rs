use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use skillq::config::Settings;
use skillq::engine::{Controller, ShutdownFlag, ShutdownSignal, StopFile};
use skillq::llm::{CallFailure, ModelClient};
use skillq::model::{ControllerStatus, NewTicket, RunStatus, SourceRecord};
use skillq::source::StaticFeed;
use skillq::store::{MemoryStore, QueueReader, WorkQueue};

/// Answers every call and asks for shutdown on the first one.
struct TripwireModel {
    flag: ShutdownFlag,
}

#[async_trait]
impl ModelClient for TripwireModel {
    async fn analyze(&self, _ticket_text: &str) -> Result<String, CallFailure> {
        self.flag.request();
        Ok(r#"["Networking", "DHCP"]"#.to_string())
    }
}

fn records(n: i64) -> Vec<SourceRecord> {
    (1..=n)
        .map(|id| SourceRecord {
            ticket_id: id,
            summary: Some(format!("site {id} lost dhcp leases")),
            resolution: Some("restarted scope".to_string()),
            ..Default::default()
        })
        .collect()
}

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.worker.idle_secs = 0;
    settings.worker.poll_interval_secs = 0;
    settings.controller.worker_count = 2;
    settings.controller.cycle_sleep_secs = 3600;
    settings
}

fn controller(
    store: &Arc<MemoryStore>,
    feed: StaticFeed,
    flag: &ShutdownFlag,
    settings: &Settings,
) -> Controller<MemoryStore, StaticFeed, TripwireModel> {
    let model = TripwireModel { flag: flag.clone() };
    Controller::new(
        Arc::clone(store),
        Arc::new(feed),
        Arc::new(model),
        settings,
        Arc::new(flag.clone()),
    )
    .with_instance("test")
}

#[tokio::test]
async fn halts_after_finishing_the_cycle_in_flight() {
    let store = Arc::new(MemoryStore::new());
    let flag = ShutdownFlag::new();
    let settings = settings();

    let run = controller(&store, StaticFeed::new(records(3)), &flag, &settings)
        .run()
        .await
        .unwrap();

    assert_eq!(run.status, ControllerStatus::Halted);
    assert_eq!(run.cycles, 1);
    assert!(run.ended_at.is_some());

    // The batch claimed before shutdown was seen still finished.
    let counts = store.status_counts().await.unwrap();
    assert_eq!(counts.complete, 3);
    assert_eq!(counts.claimed, 0);

    let worker_runs = store.recent_worker_runs(10).await.unwrap();
    assert_eq!(worker_runs.len(), 2);
    assert!(worker_runs.iter().all(|r| r.status == RunStatus::Completed));
    assert_eq!(
        worker_runs.iter().map(|r| r.items_processed).sum::<u32>(),
        3
    );

    let controller_runs = store.controller_runs().unwrap();
    assert_eq!(controller_runs.len(), 1);
    assert_eq!(controller_runs[0].status, ControllerStatus::Halted);
    assert_eq!(controller_runs[0].cycles, 1);
}

#[tokio::test]
async fn stop_file_halts_and_is_consumed() {
    let dir = tempfile::tempdir().unwrap();
    let stop = StopFile::new(dir.path().join("stop.txt"));
    stop.request().unwrap();
    assert!(stop.is_requested());

    let store = Arc::new(MemoryStore::new());
    let model = TripwireModel {
        flag: ShutdownFlag::new(),
    };
    let run = Controller::new(
        Arc::clone(&store),
        Arc::new(StaticFeed::new(records(2))),
        Arc::new(model),
        &settings(),
        Arc::new(stop.clone()),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(run.status, ControllerStatus::Halted);
    assert_eq!(run.cycles, 1);
    assert!(!stop.path().exists());

    // Workers saw the request before claiming; nothing is stranded.
    assert!(store.in_flight().await.unwrap().is_empty());
    assert_eq!(store.pending_count().await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_is_observed_while_sleeping_between_cycles() {
    let store = Arc::new(MemoryStore::new());
    let flag = ShutdownFlag::new();
    let settings = settings();
    let controller = controller(&store, StaticFeed::new(Vec::new()), &flag, &settings);

    let later = flag.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        later.request();
    });

    let run = controller.run().await.unwrap();
    assert_eq!(run.status, ControllerStatus::Halted);
    assert_eq!(run.cycles, 1);
    assert!(store.recent_worker_runs(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn cycle_sweeps_stale_claims_and_names_workers() {
    let store = Arc::new(MemoryStore::new());
    let stranded = NewTicket::from_record(&records(9)[8]).unwrap();
    store.insert_if_absent(&stranded).await.unwrap();
    store.claim_batch("crashed", 1, u32::MAX).await.unwrap();

    let mut settings = settings();
    settings.controller.stale_claim_secs = 0;
    let model = TripwireModel {
        flag: ShutdownFlag::new(),
    };
    let controller = Controller::new(
        Arc::clone(&store),
        Arc::new(StaticFeed::new(records(2))),
        Arc::new(model),
        &settings,
        Arc::new(ShutdownFlag::new()),
    )
    .with_instance("test");

    let report = controller.run_cycle(2).await.unwrap();
    assert_eq!(report.swept, 1);
    assert_eq!(report.population.unwrap().inserted, 2);
    assert_eq!(report.pending, 3);
    let ids: Vec<_> = report.runs.iter().map(|r| r.worker_id.as_str()).collect();
    assert_eq!(ids, vec!["test-c2-w1", "test-c2-w2"]);
    assert!(report.runs.iter().all(|r| r.cycle == 2));
    assert!(report.made_progress());

    let counts = store.status_counts().await.unwrap();
    assert_eq!(counts.complete, 3);
    assert_eq!(store.recent_worker_runs(10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn cycle_without_pending_work_launches_nothing() {
    let store = Arc::new(MemoryStore::new());
    let flag = ShutdownFlag::new();
    let feed = StaticFeed::new(records(2));
    feed.set_unavailable(true).unwrap();
    let controller = controller(&store, feed, &flag, &settings());

    let report = controller.run_cycle(1).await.unwrap();
    assert!(report.population.is_none());
    assert_eq!(report.pending, 0);
    assert!(report.runs.is_empty());
    assert!(!report.made_progress());
}

/// Notes when the first call arrives, then panics the worker task.
#[derive(Default)]
struct PanickingModel {
    first_call: std::sync::Mutex<Option<chrono::DateTime<chrono::Utc>>>,
}

#[async_trait]
impl ModelClient for PanickingModel {
    async fn analyze(&self, _ticket_text: &str) -> Result<String, CallFailure> {
        self.first_call
            .lock()
            .unwrap()
            .get_or_insert_with(chrono::Utc::now);
        tokio::time::sleep(Duration::from_millis(50)).await;
        panic!("model client bug");
    }
}

#[tokio::test]
async fn aborted_workers_record_when_they_were_started() {
    let store = Arc::new(MemoryStore::new());
    for record in records(2) {
        let ticket = NewTicket::from_record(&record).unwrap();
        store.insert_if_absent(&ticket).await.unwrap();
    }
    let mut settings = settings();
    settings.worker.batch_size = 1;
    let model = Arc::new(PanickingModel::default());
    let controller = Controller::new(
        Arc::clone(&store),
        Arc::new(StaticFeed::new(Vec::new())),
        Arc::clone(&model),
        &settings,
        Arc::new(ShutdownFlag::new()),
    )
    .with_instance("test");

    let report = controller.run_cycle(1).await.unwrap();

    let first_call = model.first_call.lock().unwrap().unwrap();
    assert_eq!(report.runs.len(), 2);
    for run in &report.runs {
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.as_deref().unwrap().contains("aborted"));
        assert!(run.started_at <= first_call, "{} started late", run.worker_id);
    }
}
