//! Controller: the long-running supervision loop.
//!
//! Each cycle sweeps stale claims, runs population, and if anything is
//! pending starts a fixed pool of workers and waits for them. Every worker
//! pass is written to the run ledger. The shutdown signal is checked at
//! cycle boundaries and while sleeping between idle cycles.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{Instrument, error, info, warn};

use crate::config::{ControllerSettings, Settings, WorkerSettings};
use crate::engine::launcher::{LaunchPlan, Launcher};
use crate::engine::shutdown::ShutdownSignal;
use crate::error::Result;
use crate::llm::ModelClient;
use crate::model::{ControllerRun, ControllerStatus, RunStatus, WorkerRun};
use crate::population::{Population, PopulationReport};
use crate::source::SourceFeed;
use crate::store::Store;
use crate::telemetry::metrics;

/// Consecutive failed cycles before the controller gives up.
const MAX_FAILED_CYCLES: u32 = 5;

/// Granularity of the shutdown check while sleeping.
const SHUTDOWN_POLL: Duration = Duration::from_secs(1);

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub swept: usize,
    /// `None` when population failed this cycle.
    pub population: Option<PopulationReport>,
    pub pending: u64,
    pub runs: Vec<WorkerRun>,
}

impl CycleReport {
    /// True when some worker moved an item to a terminal status.
    pub fn made_progress(&self) -> bool {
        self.runs
            .iter()
            .any(|r| r.items_processed + r.items_failed > 0)
    }
}

pub struct Controller<S: ?Sized, F: ?Sized, M: ?Sized> {
    store: Arc<S>,
    population: Population<S, F>,
    model: Arc<M>,
    settings: ControllerSettings,
    worker_settings: WorkerSettings,
    launcher: Launcher,
    shutdown: Arc<dyn ShutdownSignal>,
    instance: String,
}

impl<S, F, M> Controller<S, F, M>
where
    S: Store + ?Sized + 'static,
    F: SourceFeed + ?Sized,
    M: ModelClient + ?Sized + 'static,
{
    pub fn new(
        store: Arc<S>,
        feed: Arc<F>,
        model: Arc<M>,
        settings: &Settings,
        shutdown: Arc<dyn ShutdownSignal>,
    ) -> Self {
        let population = Population::new(
            Arc::clone(&store),
            feed,
            settings.population.source_id.clone(),
            settings.population.page_size,
        );
        Self {
            store,
            population,
            model,
            settings: settings.controller.clone(),
            worker_settings: settings.worker.clone(),
            launcher: Launcher::InProcess,
            shutdown,
            instance: default_instance(),
        }
    }

    pub fn with_launcher(mut self, launcher: Launcher) -> Self {
        self.launcher = launcher;
        self
    }

    /// Prefix for worker ids, so ids stay unique across controllers.
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    /// Run cycles until shutdown is requested. Returns the finished run
    /// record.
    pub async fn run(&self) -> Result<ControllerRun> {
        let mut run = self.store.start_controller_run().await?;
        info!(run_id = %run.id, instance = %self.instance, "controller started");

        let mut failed_cycles = 0u32;
        let status = loop {
            run.cycles += 1;
            let cycle = run.cycles;
            let span = tracing::info_span!("controller.cycle", run_id = %run.id, cycle);

            let progressed = match self.run_cycle(cycle).instrument(span).await {
                Ok(report) => {
                    failed_cycles = 0;
                    report.made_progress()
                }
                Err(e) => {
                    failed_cycles += 1;
                    error!(cycle, error = %e, failed_cycles, "cycle failed");
                    if failed_cycles >= MAX_FAILED_CYCLES {
                        break ControllerStatus::Failed;
                    }
                    false
                }
            };

            if self.shutdown.is_requested() {
                info!(cycle, "shutdown requested, halting");
                break ControllerStatus::Halted;
            }
            if !progressed && self.sleep_until_next_cycle().await {
                info!(cycle, "shutdown requested while idle, halting");
                break ControllerStatus::Halted;
            }
        };

        self.store
            .finish_controller_run(run.id, status, run.cycles)
            .await?;
        if status == ControllerStatus::Halted {
            self.shutdown.acknowledge();
        }
        run.status = status;
        run.ended_at = Some(Utc::now());
        info!(run_id = %run.id, %status, cycles = run.cycles, "controller stopped");
        Ok(run)
    }

    /// One supervision cycle.
    ///
    /// # Errors
    /// Queue errors from the sweep or the pending count. Population errors
    /// are logged and retried next cycle; worker failures are recorded in
    /// their run rows.
    pub async fn run_cycle(&self, cycle: u64) -> Result<CycleReport> {
        let mut report = CycleReport {
            cycle,
            ..Default::default()
        };

        let swept = self.store.sweep_stale(self.settings.stale_claim()).await?;
        if !swept.is_empty() {
            metrics::stale_claims_recovered().add(swept.len() as u64, &[]);
            warn!(count = swept.len(), "returned stale claims to pending");
        }
        report.swept = swept.len();

        report.population = match self.population.run_cycle().await {
            Ok(population) => Some(population),
            Err(e) => {
                warn!(error = %e, "population failed, retrying next cycle");
                None
            }
        };

        report.pending = self.store.pending_count().await?;
        if report.pending == 0 {
            info!("no pending tickets");
            return Ok(report);
        }

        let worker_ids: Vec<String> = (1..=self.settings.worker_count)
            .map(|i| format!("{}-c{cycle}-w{i}", self.instance))
            .collect();
        info!(pending = report.pending, workers = worker_ids.len(), "starting workers");

        let plan = LaunchPlan {
            cycle,
            worker_ids,
            deadline: Instant::now() + self.settings.cycle_deadline(),
            settings: &self.worker_settings,
        };
        report.runs = self
            .launcher
            .launch(plan, &self.store, &self.model, &self.shutdown)
            .await;

        for run in &report.runs {
            if run.status == RunStatus::Failed {
                warn!(worker = %run.worker_id, error = ?run.error, "worker run failed");
            }
            if let Err(e) = self.store.record_worker_run(run).await {
                error!(worker = %run.worker_id, error = %e, "could not record worker run");
            }
        }

        let processed: u32 = report.runs.iter().map(|r| r.items_processed).sum();
        let failed: u32 = report.runs.iter().map(|r| r.items_failed).sum();
        info!(processed, failed, "cycle complete");
        Ok(report)
    }

    /// Sleep `cycle_sleep`, checking the shutdown signal as it goes.
    /// Returns true if shutdown was requested.
    async fn sleep_until_next_cycle(&self) -> bool {
        let wake = Instant::now() + self.settings.cycle_sleep();
        info!(secs = self.settings.cycle_sleep_secs, "sleeping until next cycle");
        loop {
            if self.shutdown.is_requested() {
                return true;
            }
            let now = Instant::now();
            if now >= wake {
                return false;
            }
            tokio::time::sleep(SHUTDOWN_POLL.min(wake - now)).await;
        }
    }
}

fn default_instance() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "skillq".to_string());
    format!("{host}-{}", std::process::id())
}
