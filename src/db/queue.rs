//! Ticket queue operations: idempotent insert, atomic claim, guarded
//! transitions, staleness sweep, and read queries.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::Db;
use crate::error::{Error, Result};
use crate::model::{ItemId, NewTicket, QueueItem, SkillCount, Status, StatusCounts, WorkerRun};
use crate::store::{QueueReader, WorkQueue};

const ITEM_COLUMNS: &str = "id, source_ticket_id, raw_text, technician, closed_at, estimated_tokens, status, claimed_by, claimed_at, result, failure_reason, attempt_count, created_at, updated_at";

fn claim_lost(id: ItemId, worker_id: &str) -> Error {
    Error::ClaimLost {
        item: id.0,
        worker: worker_id.to_string(),
    }
}

#[async_trait]
impl WorkQueue for Db {
    async fn insert_if_absent(&self, ticket: &NewTicket) -> Result<bool> {
        let inserted: Option<(i64,)> = sqlx::query_as(
            "INSERT INTO ticket_queue (source_ticket_id, raw_text, technician, closed_at, estimated_tokens)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (source_ticket_id) DO NOTHING
             RETURNING id",
        )
        .bind(ticket.source_ticket_id)
        .bind(&ticket.raw_text)
        .bind(&ticket.technician)
        .bind(ticket.closed_at)
        .bind(i32::try_from(ticket.estimated_tokens).unwrap_or(i32::MAX))
        .fetch_optional(self.pool())
        .await?;
        Ok(inserted.is_some())
    }

    async fn fail_oversized(&self, max_tokens: u32) -> Result<Vec<QueueItem>> {
        let rows: Vec<QueueItemRow> = sqlx::query_as(&format!(
            "UPDATE ticket_queue
             SET status = 'failed',
                 failure_reason = format('oversized (%s tokens > %s)', estimated_tokens, $1::integer),
                 updated_at = now()
             WHERE status = 'pending' AND estimated_tokens > $1
             RETURNING {ITEM_COLUMNS}"
        ))
        .bind(i32::try_from(max_tokens).unwrap_or(i32::MAX))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(QueueItemRow::try_into_item).collect()
    }

    async fn claim_batch(
        &self,
        worker_id: &str,
        batch_size: u32,
        max_tokens: u32,
    ) -> Result<Vec<QueueItem>> {
        // Select and update in one statement. SKIP LOCKED lets concurrent
        // claimers pass over each other's rows instead of blocking or sharing them.
        let rows: Vec<QueueItemRow> = sqlx::query_as(&format!(
            "WITH claimable AS (
                 SELECT id FROM ticket_queue
                 WHERE status = 'pending' AND estimated_tokens <= $3
                 ORDER BY id
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE ticket_queue q
             SET status = 'claimed', claimed_by = $1, claimed_at = now(), updated_at = now()
             FROM claimable c
             WHERE q.id = c.id
             RETURNING {}",
            ITEM_COLUMNS
                .split(", ")
                .map(|col| format!("q.{col}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(worker_id)
        .bind(i64::from(batch_size))
        .bind(i32::try_from(max_tokens).unwrap_or(i32::MAX))
        .fetch_all(self.pool())
        .await?;

        let mut items = rows
            .into_iter()
            .map(QueueItemRow::try_into_item)
            .collect::<Result<Vec<_>>>()?;
        items.sort_by_key(|item| item.id);
        Ok(items)
    }

    async fn record_attempt(&self, id: ItemId, worker_id: &str) -> Result<u32> {
        // Refreshes claimed_at on everything the worker still holds, so the
        // rest of a long batch is not swept as abandoned.
        let row: Option<(i32,)> = sqlx::query_as(
            "WITH attempt AS (
                UPDATE ticket_queue
                SET attempt_count = attempt_count + 1, claimed_at = now(), updated_at = now()
                WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
                RETURNING attempt_count
             ), held AS (
                UPDATE ticket_queue SET claimed_at = now()
                WHERE status = 'claimed' AND claimed_by = $2 AND id <> $1
                  AND EXISTS (SELECT 1 FROM attempt)
             )
             SELECT attempt_count FROM attempt",
        )
        .bind(id.0)
        .bind(worker_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(|(n,)| n as u32)
            .ok_or_else(|| claim_lost(id, worker_id))
    }

    async fn complete(&self, id: ItemId, worker_id: &str, skills: &[String]) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        let result = serde_json::json!({ "skills": skills });
        let rows_affected = sqlx::query(
            "UPDATE ticket_queue
             SET status = 'complete', result = $3, failure_reason = NULL, updated_at = now()
             WHERE id = $1 AND status = 'claimed' AND claimed_by = $2",
        )
        .bind(id.0)
        .bind(worker_id)
        .bind(&result)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Dropping the transaction rolls it back.
            return Err(claim_lost(id, worker_id));
        }

        sqlx::query(
            "INSERT INTO skill_results (queue_item_id, position, skill_name)
             SELECT $1, (s.ord - 1)::integer, s.name
             FROM UNNEST($2::text[]) WITH ORDINALITY AS s(name, ord)",
        )
        .bind(id.0)
        .bind(skills)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn fail(&self, id: ItemId, worker_id: &str, reason: &str) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE ticket_queue SET status = 'failed', failure_reason = $3, updated_at = now()
             WHERE id = $1 AND status = 'claimed' AND claimed_by = $2",
        )
        .bind(id.0)
        .bind(worker_id)
        .bind(reason)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(claim_lost(id, worker_id));
        }
        Ok(())
    }

    async fn sweep_stale(&self, older_than: Duration) -> Result<Vec<ItemId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "UPDATE ticket_queue
             SET status = 'pending', claimed_by = NULL, claimed_at = NULL, updated_at = now()
             WHERE status = 'claimed' AND claimed_at < now() - ($1 * interval '1 second')
             RETURNING id",
        )
        .bind(older_than.as_secs_f64())
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(id,)| ItemId(id)).collect())
    }

    async fn pending_count(&self) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM ticket_queue WHERE status = 'pending'")
                .fetch_one(self.pool())
                .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl QueueReader for Db {
    async fn status_counts(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM ticket_queue GROUP BY status")
                .fetch_all(self.pool())
                .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            let n = n as u64;
            match status.parse()? {
                Status::Pending => counts.pending = n,
                Status::Claimed => counts.claimed = n,
                Status::Complete => counts.complete = n,
                Status::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    async fn get_item(&self, id: ItemId) -> Result<QueueItem> {
        let row: Option<QueueItemRow> =
            sqlx::query_as(&format!("SELECT {ITEM_COLUMNS} FROM ticket_queue WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("queue item {id}")))?
            .try_into_item()
    }

    async fn list_items(&self, status: Option<Status>, limit: u32) -> Result<Vec<QueueItem>> {
        let rows: Vec<QueueItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM ticket_queue
             WHERE ($1::text IS NULL OR status = $1)
             ORDER BY id
             LIMIT $2"
        ))
        .bind(status.map(Status::as_str))
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(QueueItemRow::try_into_item).collect()
    }

    async fn skills_for_item(&self, id: ItemId) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT skill_name FROM skill_results WHERE queue_item_id = $1 ORDER BY position",
        )
        .bind(id.0)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn in_flight(&self) -> Result<Vec<QueueItem>> {
        let rows: Vec<QueueItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM ticket_queue WHERE status = 'claimed' ORDER BY claimed_at, id"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(QueueItemRow::try_into_item).collect()
    }

    async fn recent_worker_runs(&self, limit: u32) -> Result<Vec<WorkerRun>> {
        super::runs::recent_worker_runs(self, limit).await
    }

    async fn top_skills(&self, limit: u32) -> Result<Vec<SkillCount>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT skill_name, COUNT(*) AS frequency FROM skill_results
             GROUP BY skill_name
             ORDER BY frequency DESC, skill_name
             LIMIT $1",
        )
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|(skill_name, frequency)| SkillCount {
                skill_name,
                frequency: frequency as u64,
            })
            .collect())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct QueueItemRow {
    id: i64,
    source_ticket_id: i64,
    raw_text: String,
    technician: Option<String>,
    closed_at: Option<DateTime<Utc>>,
    estimated_tokens: i32,
    status: String,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
    failure_reason: Option<String>,
    attempt_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl QueueItemRow {
    fn try_into_item(self) -> Result<QueueItem> {
        Ok(QueueItem {
            id: ItemId(self.id),
            source_ticket_id: self.source_ticket_id,
            raw_text: self.raw_text,
            technician: self.technician,
            closed_at: self.closed_at,
            estimated_tokens: self.estimated_tokens.max(0) as u32,
            status: self.status.parse()?,
            claimed_by: self.claimed_by,
            claimed_at: self.claimed_at,
            result: self.result,
            failure_reason: self.failure_reason,
            attempt_count: self.attempt_count.max(0) as u32,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
