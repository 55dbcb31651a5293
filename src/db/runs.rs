//! Worker run audit rows and the controller run record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Db;
use crate::error::{Error, Result};
use crate::model::{ControllerRun, ControllerStatus, WorkerRun};
use crate::store::RunLedger;

#[async_trait]
impl RunLedger for Db {
    async fn record_worker_run(&self, run: &WorkerRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO worker_runs
                 (worker_id, cycle, started_at, ended_at, items_claimed, items_processed, items_failed, status, error)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&run.worker_id)
        .bind(run.cycle as i64)
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(run.items_claimed as i32)
        .bind(run.items_processed as i32)
        .bind(run.items_failed as i32)
        .bind(run.status.as_str())
        .bind(&run.error)
        .execute(self.pool())
        .await?;
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
        sqlx::query(
            "INSERT INTO controller_runs (id, started_at, status, cycles) VALUES ($1, $2, $3, 0)",
        )
        .bind(run.id)
        .bind(run.started_at)
        .bind(run.status.as_str())
        .execute(self.pool())
        .await?;
        Ok(run)
    }

    async fn finish_controller_run(
        &self,
        id: Uuid,
        status: ControllerStatus,
        cycles: u64,
    ) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE controller_runs SET status = $2, cycles = $3, ended_at = now()
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(cycles as i64)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(format!("running controller run {id}")));
        }
        Ok(())
    }
}

type WorkerRunRow = (
    String,
    i64,
    DateTime<Utc>,
    DateTime<Utc>,
    i32,
    i32,
    i32,
    String,
    Option<String>,
);

pub(super) async fn recent_worker_runs(db: &Db, limit: u32) -> Result<Vec<WorkerRun>> {
    let rows: Vec<WorkerRunRow> = sqlx::query_as(
        "SELECT worker_id, cycle, started_at, ended_at, items_claimed, items_processed, items_failed, status, error
         FROM worker_runs
         ORDER BY started_at DESC, id DESC
         LIMIT $1",
    )
    .bind(i64::from(limit))
    .fetch_all(db.pool())
    .await?;

    rows.into_iter()
        .map(
            |(worker_id, cycle, started_at, ended_at, claimed, processed, failed, status, error)| {
                Ok(WorkerRun {
                    worker_id,
                    cycle: cycle.max(0) as u64,
                    started_at,
                    ended_at,
                    items_claimed: claimed.max(0) as u32,
                    items_processed: processed.max(0) as u32,
                    items_failed: failed.max(0) as u32,
                    status: status.parse()?,
                    error,
                })
            },
        )
        .collect()
}
