//! Durable state seams.
//!
//! The checkpoint store, work queue and run ledger are the only shared
//! mutable state in the pipeline. Every operation here is atomic on its own;
//! components coordinate through these calls and hold no in-process locks.
//!
//! [`crate::db::Db`] is the Postgres implementation. [`MemoryStore`] keeps
//! the same guarantees behind a mutex and backs tests and dry runs.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    Checkpoint, ControllerRun, ControllerStatus, ItemId, NewTicket, QueueItem, SkillCount, Status,
    StatusCounts, WorkerRun,
};

pub use memory::MemoryStore;

/// Last imported position per source feed.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn checkpoint(&self, source_id: &str) -> Result<Option<Checkpoint>>;

    /// Move the checkpoint forward to `position`. Never moves it backwards;
    /// returns the position actually stored.
    async fn advance_checkpoint(&self, source_id: &str, position: i64) -> Result<i64>;
}

/// The ticket queue.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Insert a Pending item unless `source_ticket_id` is already queued.
    /// Returns `false` for a duplicate.
    async fn insert_if_absent(&self, ticket: &NewTicket) -> Result<bool>;

    /// Pending → Failed for every item estimated above `max_tokens`.
    async fn fail_oversized(&self, max_tokens: u32) -> Result<Vec<QueueItem>>;

    /// Atomically claim up to `batch_size` Pending items, oldest first, that
    /// fit under `max_tokens`. Concurrent callers never receive the same item.
    async fn claim_batch(
        &self,
        worker_id: &str,
        batch_size: u32,
        max_tokens: u32,
    ) -> Result<Vec<QueueItem>>;

    /// Count one model attempt against a claimed item and refresh `claimed_at`
    /// on every item the worker holds. Returns the new total.
    async fn record_attempt(&self, id: ItemId, worker_id: &str) -> Result<u32>;

    /// Claimed → Complete, storing the skills in the same write.
    async fn complete(&self, id: ItemId, worker_id: &str, skills: &[String]) -> Result<()>;

    /// Claimed → Failed with a diagnostic reason.
    async fn fail(&self, id: ItemId, worker_id: &str, reason: &str) -> Result<()>;

    /// Claimed → Pending for claims older than `older_than`. Touches nothing
    /// else, so it is safe alongside live claiming.
    async fn sweep_stale(&self, older_than: Duration) -> Result<Vec<ItemId>>;

    async fn pending_count(&self) -> Result<u64>;
}

/// Append-only audit of worker passes, plus the controller's own run row.
#[async_trait]
pub trait RunLedger: Send + Sync {
    async fn record_worker_run(&self, run: &WorkerRun) -> Result<()>;

    async fn start_controller_run(&self) -> Result<ControllerRun>;

    async fn finish_controller_run(
        &self,
        id: Uuid,
        status: ControllerStatus,
        cycles: u64,
    ) -> Result<()>;
}

/// Read-only queries for dashboards and the CLI.
#[async_trait]
pub trait QueueReader: Send + Sync {
    async fn status_counts(&self) -> Result<StatusCounts>;

    async fn get_item(&self, id: ItemId) -> Result<QueueItem>;

    async fn list_items(&self, status: Option<Status>, limit: u32) -> Result<Vec<QueueItem>>;

    /// Skills stored for an item, in extraction order.
    async fn skills_for_item(&self, id: ItemId) -> Result<Vec<String>>;

    /// Items currently Claimed, oldest claim first.
    async fn in_flight(&self) -> Result<Vec<QueueItem>>;

    /// Most recent worker runs first.
    async fn recent_worker_runs(&self, limit: u32) -> Result<Vec<WorkerRun>>;

    async fn top_skills(&self, limit: u32) -> Result<Vec<SkillCount>>;
}

/// Everything the controller needs from one backend.
pub trait Store: CheckpointStore + WorkQueue + RunLedger + QueueReader {}

impl<T: CheckpointStore + WorkQueue + RunLedger + QueueReader> Store for T {}
