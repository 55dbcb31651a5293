//! Checkpoint rows: one per source feed, only ever moved forward.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::Db;
use crate::error::Result;
use crate::model::Checkpoint;
use crate::store::CheckpointStore;

#[async_trait]
impl CheckpointStore for Db {
    async fn checkpoint(&self, source_id: &str) -> Result<Option<Checkpoint>> {
        let row: Option<(String, i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT source_id, last_seen_position, updated_at FROM checkpoints WHERE source_id = $1",
        )
        .bind(source_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|(source_id, last_seen_position, updated_at)| Checkpoint {
            source_id,
            last_seen_position,
            updated_at,
        }))
    }

    async fn advance_checkpoint(&self, source_id: &str, position: i64) -> Result<i64> {
        // GREATEST keeps the position monotonic even if two populators race.
        let (stored,): (i64,) = sqlx::query_as(
            "INSERT INTO checkpoints (source_id, last_seen_position, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (source_id) DO UPDATE
             SET last_seen_position = GREATEST(checkpoints.last_seen_position, EXCLUDED.last_seen_position),
                 updated_at = now()
             RETURNING last_seen_position",
        )
        .bind(source_id)
        .bind(position)
        .fetch_one(self.pool())
        .await?;
        Ok(stored)
    }
}
