//! In-memory store.
//!
//! Each trait method takes the mutex once, so every operation is atomic the
//! same way a single SQL statement is. Used by tests and `--in-memory` dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use uuid::Uuid;

use super::{CheckpointStore, QueueReader, RunLedger, WorkQueue};
use crate::error::{Error, Result};
use crate::model::{
    Checkpoint, ControllerRun, ControllerStatus, FailureReason, ItemId, NewTicket, QueueItem,
    SkillCount, Status, StatusCounts, WorkerRun,
};

#[derive(Default)]
struct Inner {
    next_id: i64,
    items: BTreeMap<ItemId, QueueItem>,
    by_source: HashMap<i64, ItemId>,
    skills: HashMap<ItemId, Vec<String>>,
    checkpoints: HashMap<String, Checkpoint>,
    worker_runs: Vec<WorkerRun>,
    controller_runs: Vec<ControllerRun>,
    failing_inserts: HashSet<i64>,
}

impl Inner {
    /// Borrow an item that `worker_id` still holds a claim on.
    fn owned_mut(&mut self, id: ItemId, worker_id: &str) -> Result<&mut QueueItem> {
        let item = self
            .items
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("queue item {id}")))?;
        if item.status != Status::Claimed || item.claimed_by.as_deref() != Some(worker_id) {
            return Err(Error::ClaimLost {
                item: id.0,
                worker: worker_id.to_string(),
            });
        }
        Ok(item)
    }
}

/// Mutex-guarded store with the same contract as the Postgres backend.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Other("memory store lock poisoned".to_string()))
    }

    /// Make inserts of `source_ticket_id` fail with a storage error.
    /// Lets tests exercise population's partial-page handling.
    pub fn fail_inserts_for(&self, source_ticket_id: i64) -> Result<()> {
        self.lock()?.failing_inserts.insert(source_ticket_id);
        Ok(())
    }

    /// All controller run rows, oldest first.
    pub fn controller_runs(&self) -> Result<Vec<ControllerRun>> {
        Ok(self.lock()?.controller_runs.clone())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn checkpoint(&self, source_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.lock()?.checkpoints.get(source_id).cloned())
    }

    async fn advance_checkpoint(&self, source_id: &str, position: i64) -> Result<i64> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let checkpoint = inner
            .checkpoints
            .entry(source_id.to_string())
            .or_insert_with(|| Checkpoint {
                source_id: source_id.to_string(),
                last_seen_position: position,
                updated_at: now,
            });
        if position > checkpoint.last_seen_position {
            checkpoint.last_seen_position = position;
            checkpoint.updated_at = now;
        }
        Ok(checkpoint.last_seen_position)
    }
}

#[async_trait]
impl WorkQueue for MemoryStore {
    async fn insert_if_absent(&self, ticket: &NewTicket) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner.failing_inserts.contains(&ticket.source_ticket_id) {
            return Err(Error::Other(format!(
                "insert rejected for source ticket {}",
                ticket.source_ticket_id
            )));
        }
        if inner.by_source.contains_key(&ticket.source_ticket_id) {
            return Ok(false);
        }

        inner.next_id += 1;
        let id = ItemId(inner.next_id);
        let now = Utc::now();
        inner.items.insert(
            id,
            QueueItem {
                id,
                source_ticket_id: ticket.source_ticket_id,
                raw_text: ticket.raw_text.clone(),
                technician: ticket.technician.clone(),
                closed_at: ticket.closed_at,
                estimated_tokens: ticket.estimated_tokens,
                status: Status::Pending,
                claimed_by: None,
                claimed_at: None,
                result: None,
                failure_reason: None,
                attempt_count: 0,
                created_at: now,
                updated_at: now,
            },
        );
        inner.by_source.insert(ticket.source_ticket_id, id);
        Ok(true)
    }

    async fn fail_oversized(&self, max_tokens: u32) -> Result<Vec<QueueItem>> {
        let mut inner = self.lock()?;
        let mut failed = Vec::new();
        for item in inner.items.values_mut() {
            if item.status == Status::Pending && item.estimated_tokens > max_tokens {
                item.transition(Status::Failed)?;
                item.failure_reason = Some(
                    FailureReason::Oversized {
                        estimated_tokens: item.estimated_tokens,
                        threshold: max_tokens,
                    }
                    .to_string(),
                );
                failed.push(item.clone());
            }
        }
        Ok(failed)
    }

    async fn claim_batch(
        &self,
        worker_id: &str,
        batch_size: u32,
        max_tokens: u32,
    ) -> Result<Vec<QueueItem>> {
        let mut inner = self.lock()?;
        let mut claimed = Vec::new();
        for item in inner
            .items
            .values_mut()
            .filter(|item| item.status == Status::Pending && item.estimated_tokens <= max_tokens)
            .take(batch_size as usize)
        {
            item.transition(Status::Claimed)?;
            item.claimed_by = Some(worker_id.to_string());
            item.claimed_at = Some(item.updated_at);
            claimed.push(item.clone());
        }
        Ok(claimed)
    }

    async fn record_attempt(&self, id: ItemId, worker_id: &str) -> Result<u32> {
        let mut inner = self.lock()?;
        let item = inner.owned_mut(id, worker_id)?;
        item.attempt_count += 1;
        let attempts = item.attempt_count;

        let now = Utc::now();
        for held in inner
            .items
            .values_mut()
            .filter(|i| i.status == Status::Claimed && i.claimed_by.as_deref() == Some(worker_id))
        {
            held.claimed_at = Some(now);
        }
        if let Some(item) = inner.items.get_mut(&id) {
            item.updated_at = now;
        }
        Ok(attempts)
    }

    async fn complete(&self, id: ItemId, worker_id: &str, skills: &[String]) -> Result<()> {
        let mut inner = self.lock()?;
        let item = inner.owned_mut(id, worker_id)?;
        item.transition(Status::Complete)?;
        item.result = Some(serde_json::json!({ "skills": skills }));
        item.failure_reason = None;
        inner.skills.insert(id, skills.to_vec());
        Ok(())
    }

    async fn fail(&self, id: ItemId, worker_id: &str, reason: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let item = inner.owned_mut(id, worker_id)?;
        item.transition(Status::Failed)?;
        item.failure_reason = Some(reason.to_string());
        Ok(())
    }

    async fn sweep_stale(&self, older_than: Duration) -> Result<Vec<ItemId>> {
        let Some(cutoff) = TimeDelta::from_std(older_than)
            .ok()
            .and_then(|delta| Utc::now().checked_sub_signed(delta))
        else {
            return Ok(Vec::new());
        };

        let mut inner = self.lock()?;
        let mut recovered = Vec::new();
        for item in inner.items.values_mut() {
            let expired = item.claimed_at.is_some_and(|at| at <= cutoff);
            if item.status == Status::Claimed && expired {
                item.transition(Status::Pending)?;
                item.claimed_by = None;
                item.claimed_at = None;
                recovered.push(item.id);
            }
        }
        Ok(recovered)
    }

    async fn pending_count(&self) -> Result<u64> {
        let inner = self.lock()?;
        Ok(inner
            .items
            .values()
            .filter(|item| item.status == Status::Pending)
            .count() as u64)
    }
}

#[async_trait]
impl RunLedger for MemoryStore {
    async fn record_worker_run(&self, run: &WorkerRun) -> Result<()> {
        self.lock()?.worker_runs.push(run.clone());
        Ok(())
    }

    async fn start_controller_run(&self) -> Result<ControllerRun> {
        let run = ControllerRun {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            status: ControllerStatus::Running,
            cycles: 0,
        };
        self.lock()?.controller_runs.push(run.clone());
        Ok(run)
    }

    async fn finish_controller_run(
        &self,
        id: Uuid,
        status: ControllerStatus,
        cycles: u64,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let run = inner
            .controller_runs
            .iter_mut()
            .find(|run| run.id == id)
            .ok_or_else(|| Error::NotFound(format!("controller run {id}")))?;
        run.status = status;
        run.cycles = cycles;
        run.ended_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl QueueReader for MemoryStore {
    async fn status_counts(&self) -> Result<StatusCounts> {
        let inner = self.lock()?;
        let mut counts = StatusCounts::default();
        for item in inner.items.values() {
            match item.status {
                Status::Pending => counts.pending += 1,
                Status::Claimed => counts.claimed += 1,
                Status::Complete => counts.complete += 1,
                Status::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn get_item(&self, id: ItemId) -> Result<QueueItem> {
        self.lock()?
            .items
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("queue item {id}")))
    }

    async fn list_items(&self, status: Option<Status>, limit: u32) -> Result<Vec<QueueItem>> {
        let inner = self.lock()?;
        Ok(inner
            .items
            .values()
            .filter(|item| status.is_none_or(|s| item.status == s))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn skills_for_item(&self, id: ItemId) -> Result<Vec<String>> {
        Ok(self.lock()?.skills.get(&id).cloned().unwrap_or_default())
    }

    async fn in_flight(&self) -> Result<Vec<QueueItem>> {
        let inner = self.lock()?;
        let mut claimed: Vec<QueueItem> = inner
            .items
            .values()
            .filter(|item| item.status == Status::Claimed)
            .cloned()
            .collect();
        claimed.sort_by_key(|item| (item.claimed_at, item.id));
        Ok(claimed)
    }

    async fn recent_worker_runs(&self, limit: u32) -> Result<Vec<WorkerRun>> {
        let inner = self.lock()?;
        Ok(inner
            .worker_runs
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn top_skills(&self, limit: u32) -> Result<Vec<SkillCount>> {
        let inner = self.lock()?;
        let mut counts: HashMap<&str, u64> = HashMap::new();
        for skills in inner.skills.values() {
            for skill in skills {
                *counts.entry(skill.as_str()).or_default() += 1;
            }
        }
        let mut ranked: Vec<SkillCount> = counts
            .into_iter()
            .map(|(skill_name, frequency)| SkillCount {
                skill_name: skill_name.to_string(),
                frequency,
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.frequency
                .cmp(&a.frequency)
                .then_with(|| a.skill_name.cmp(&b.skill_name))
        });
        ranked.truncate(limit as usize);
        Ok(ranked)
    }
}
