//! Worker: claim batches, run each item through the model and the parser,
//! and move it to Complete or Failed.
//!
//! A worker holds no state outside the queue. It stops when a shutdown is
//! requested, when the cycle deadline passes, or after `idle_secs` without
//! claimable work. Infrastructure errors end the pass; everything that goes
//! wrong with a single item ends up in that item's failure reason.

use std::sync::Arc;

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::config::WorkerSettings;
use crate::engine::shutdown::ShutdownSignal;
use crate::error::{Error, Result};
use crate::llm::ModelClient;
use crate::model::{FailureReason, QueueItem, Status, WorkerRun, WorkerStats};
use crate::parser::{self, ParseFailure};
use crate::store::WorkQueue;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_item_span};

/// What happened to one claimed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Completed,
    Failed,
    /// The claim was swept and taken over; the new owner finishes it.
    Lost,
}

/// Result of the model/parse loop, before it is written back.
enum Resolution {
    Skills(Vec<String>),
    Failed(FailureReason),
}

pub struct Worker<S: ?Sized, M: ?Sized> {
    id: String,
    cycle: u64,
    store: Arc<S>,
    model: Arc<M>,
    settings: WorkerSettings,
    shutdown: Arc<dyn ShutdownSignal>,
    stop_claiming_at: Option<Instant>,
}

impl<S, M> Worker<S, M>
where
    S: WorkQueue + ?Sized,
    M: ModelClient + ?Sized,
{
    pub fn new(
        id: impl Into<String>,
        cycle: u64,
        store: Arc<S>,
        model: Arc<M>,
        settings: WorkerSettings,
        shutdown: Arc<dyn ShutdownSignal>,
    ) -> Self {
        Self {
            id: id.into(),
            cycle,
            store,
            model,
            settings,
            shutdown,
            stop_claiming_at: None,
        }
    }

    /// Stop claiming new batches after `at`. The batch in hand is finished.
    pub fn with_deadline(mut self, at: Instant) -> Self {
        self.stop_claiming_at = Some(at);
        self
    }

    /// Run one pass and return its audit record. Never fails: an
    /// infrastructure error is captured in the record.
    pub async fn run(&self) -> WorkerRun {
        let started_at = Utc::now();
        let mut stats = WorkerStats::default();
        let span = tracing::info_span!("worker.run", "worker.id" = %self.id, cycle = self.cycle);

        match self.run_pass(&mut stats).instrument(span).await {
            Ok(()) => {
                info!(
                    worker = %self.id,
                    processed = stats.items_processed,
                    failed = stats.items_failed,
                    batches = stats.batches,
                    "worker finished"
                );
                WorkerRun::completed(&self.id, self.cycle, started_at, stats)
            }
            Err(e) => {
                error!(worker = %self.id, error = %e, "worker stopped on error");
                WorkerRun::failed(&self.id, self.cycle, started_at, stats, e.to_string())
            }
        }
    }

    async fn run_pass(&self, stats: &mut WorkerStats) -> Result<()> {
        let threshold = self.settings.max_token_threshold;
        let mut idle_since: Option<Instant> = None;

        loop {
            if self.shutdown.is_requested() {
                info!("shutdown requested, not claiming more work");
                return Ok(());
            }
            if self.stop_claiming_at.is_some_and(|at| Instant::now() >= at) {
                info!("cycle deadline reached, not claiming more work");
                return Ok(());
            }

            for item in self.store.fail_oversized(threshold).await? {
                let reason = FailureReason::Oversized {
                    estimated_tokens: item.estimated_tokens,
                    threshold,
                };
                warn!(item = %item.id, ticket = item.source_ticket_id, %reason, "rejected oversized ticket");
                record_outcome(Status::Failed, "oversized");
                stats.items_failed += 1;
            }

            let batch = self
                .store
                .claim_batch(&self.id, self.settings.batch_size, threshold)
                .await?;

            if batch.is_empty() {
                let since = *idle_since.get_or_insert_with(Instant::now);
                let idle = self.settings.idle();
                if since.elapsed() >= idle {
                    info!("no pending work, worker going idle");
                    return Ok(());
                }
                let wait = self
                    .settings
                    .poll_interval()
                    .min(idle.saturating_sub(since.elapsed()));
                tokio::time::sleep(wait).await;
                continue;
            }
            idle_since = None;

            stats.batches += 1;
            stats.items_claimed += batch.len() as u32;
            metrics::items_claimed().add(batch.len() as u64, &[]);
            debug!(size = batch.len(), "claimed batch");

            for item in batch {
                match self.process_item(item).await? {
                    ItemOutcome::Completed => stats.items_processed += 1,
                    ItemOutcome::Failed => stats.items_failed += 1,
                    ItemOutcome::Lost => {}
                }
            }
        }
    }

    async fn process_item(&self, item: QueueItem) -> Result<ItemOutcome> {
        let span = start_item_span(&self.id, item.id, item.source_ticket_id);
        let id = item.id;
        let result = self
            .process_claimed(&item, &span)
            .instrument(span.clone())
            .await;

        match result {
            Err(Error::ClaimLost { .. }) => {
                span.in_scope(|| warn!(item = %id, "claim lost, leaving item to its new owner"));
                Ok(ItemOutcome::Lost)
            }
            other => other,
        }
    }

    async fn process_claimed(&self, item: &QueueItem, span: &Span) -> Result<ItemOutcome> {
        let max_attempts = self.settings.max_attempts;
        if item.attempt_count >= max_attempts {
            let reason = FailureReason::AttemptsExhausted {
                attempts: item.attempt_count,
            };
            return self.fail_item(item, reason, span).await;
        }

        let timeout = self.settings.item_timeout();
        let resolution = match tokio::time::timeout(timeout, self.resolve(item, span)).await {
            Ok(resolution) => resolution?,
            Err(_) => Resolution::Failed(FailureReason::ItemTimeout {
                seconds: timeout.as_secs(),
            }),
        };

        match resolution {
            Resolution::Skills(skills) => {
                self.store.complete(item.id, &self.id, &skills).await?;
                record_state_transition(span, Status::Claimed, Status::Complete);
                record_outcome(Status::Complete, "ok");
                info!(skills = skills.len(), "ticket complete");
                Ok(ItemOutcome::Completed)
            }
            Resolution::Failed(reason) => self.fail_item(item, reason, span).await,
        }
    }

    /// Attempt the model call until it parses or the attempt ceiling is hit.
    /// Retries happen inside the claim; the attempt count is persisted before
    /// each call so a reclaimed item cannot exceed the ceiling.
    async fn resolve(&self, item: &QueueItem, span: &Span) -> Result<Resolution> {
        let max_attempts = self.settings.max_attempts;
        let mut attempts = item.attempt_count;
        let mut last_failure = None;

        while attempts < max_attempts {
            attempts = self.store.record_attempt(item.id, &self.id).await?;
            span.record("item.attempts", attempts);

            match self.model.analyze(&item.raw_text).await {
                Ok(raw) => match parser::parse(&raw) {
                    Ok(skills) => return Ok(Resolution::Skills(skills)),
                    Err(failure) => {
                        metrics::parse_failures()
                            .add(1, &[KeyValue::new("kind", parse_failure_kind(&failure))]);
                        warn!(attempt = attempts, error = %failure, "model reply did not parse");
                        last_failure = Some(FailureReason::Parse(failure));
                    }
                },
                Err(failure) => {
                    warn!(attempt = attempts, error = %failure, "model call failed");
                    last_failure = Some(FailureReason::ModelCall(failure));
                }
            }
        }

        Ok(Resolution::Failed(
            last_failure.unwrap_or(FailureReason::AttemptsExhausted { attempts }),
        ))
    }

    async fn fail_item(
        &self,
        item: &QueueItem,
        reason: FailureReason,
        span: &Span,
    ) -> Result<ItemOutcome> {
        self.store
            .fail(item.id, &self.id, &reason.to_string())
            .await?;
        record_state_transition(span, Status::Claimed, Status::Failed);
        record_outcome(Status::Failed, reason_label(&reason));
        warn!(%reason, "ticket failed");
        Ok(ItemOutcome::Failed)
    }
}

fn record_outcome(status: Status, reason: &'static str) {
    metrics::item_outcomes().add(
        1,
        &[
            KeyValue::new("status", status.as_str()),
            KeyValue::new("reason", reason),
        ],
    );
}

fn reason_label(reason: &FailureReason) -> &'static str {
    match reason {
        FailureReason::Oversized { .. } => "oversized",
        FailureReason::AttemptsExhausted { .. } => "attempts_exhausted",
        FailureReason::ModelCall(_) => "model_call",
        FailureReason::Parse(_) => "parse",
        FailureReason::ItemTimeout { .. } => "timeout",
    }
}

fn parse_failure_kind(failure: &ParseFailure) -> &'static str {
    match failure {
        ParseFailure::Empty => "empty",
        ParseFailure::NoPayload => "no_payload",
        ParseFailure::Malformed(_) => "malformed",
        ParseFailure::MissingSkills => "missing_skills",
    }
}
