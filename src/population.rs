//! Population: copy new source records into the work queue and move the
//! checkpoint past them.
//!
//! One cycle reads the checkpoint, fetches one page of records strictly after
//! it, inserts each record unless its ticket is already queued, then advances
//! the checkpoint to the highest key stored. If an insert fails, the
//! checkpoint only moves past the records before it, so nothing is skipped;
//! re-running is safe because inserts are idempotent.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::NewTicket;
use crate::source::SourceFeed;
use crate::store::{CheckpointStore, WorkQueue};
use crate::telemetry::metrics;

/// What one population cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PopulationReport {
    pub fetched: usize,
    pub inserted: usize,
    /// Already queued; treated as success.
    pub duplicates: usize,
    /// Blank records passed over without queueing.
    pub skipped: usize,
    pub checkpoint_before: i64,
    pub checkpoint_after: i64,
}

pub struct Population<S: ?Sized, F: ?Sized> {
    store: Arc<S>,
    feed: Arc<F>,
    source_id: String,
    page_size: u32,
}

impl<S, F> Population<S, F>
where
    S: CheckpointStore + WorkQueue + ?Sized,
    F: SourceFeed + ?Sized,
{
    pub fn new(store: Arc<S>, feed: Arc<F>, source_id: impl Into<String>, page_size: u32) -> Self {
        Self {
            store,
            feed,
            source_id: source_id.into(),
            page_size,
        }
    }

    /// Run one population cycle.
    ///
    /// # Errors
    /// Source fetch failures leave the checkpoint untouched. Insert failures
    /// advance it only past records stored before the failure.
    pub async fn run_cycle(&self) -> Result<PopulationReport> {
        let before = self
            .store
            .checkpoint(&self.source_id)
            .await?
            .map(|c| c.last_seen_position)
            .unwrap_or(0);
        debug!(source = %self.source_id, checkpoint = before, "population cycle starting");

        let records = self.feed.fetch_new_since(before, self.page_size).await?;
        let mut report = PopulationReport {
            fetched: records.len(),
            checkpoint_before: before,
            checkpoint_after: before,
            ..Default::default()
        };
        if records.is_empty() {
            info!(source = %self.source_id, checkpoint = before, "no new source records");
            return Ok(report);
        }

        let mut high_water = before;
        for record in &records {
            let outcome = match NewTicket::from_record(record) {
                None => {
                    debug!(ticket = record.ticket_id, "skipping blank source record");
                    report.skipped += 1;
                    "skipped"
                }
                Some(ticket) => match self.store.insert_if_absent(&ticket).await {
                    Ok(true) => {
                        report.inserted += 1;
                        "inserted"
                    }
                    Ok(false) => {
                        report.duplicates += 1;
                        "duplicate"
                    }
                    Err(e) => {
                        warn!(
                            ticket = record.ticket_id,
                            error = %e,
                            inserted = report.inserted,
                            "insert failed, checkpoint held before this record"
                        );
                        self.advance(high_water, &mut report).await?;
                        return Err(e);
                    }
                },
            };
            metrics::tickets_populated().add(1, &[KeyValue::new("result", outcome)]);
            high_water = high_water.max(record.ticket_id);
        }

        self.advance(high_water, &mut report).await?;
        info!(
            source = %self.source_id,
            fetched = report.fetched,
            inserted = report.inserted,
            duplicates = report.duplicates,
            skipped = report.skipped,
            checkpoint = report.checkpoint_after,
            "population cycle complete"
        );
        Ok(report)
    }

    async fn advance(&self, position: i64, report: &mut PopulationReport) -> Result<()> {
        if position > report.checkpoint_before {
            report.checkpoint_after = self
                .store
                .advance_checkpoint(&self.source_id, position)
                .await?;
        }
        Ok(())
    }
}
