//! Source feed backed by a Postgres table or view.
//!
//! The relation must expose `ticket_id BIGINT`, `summary`, `description`,
//! `resolution`, `technician` (text, nullable) and `closed_at TIMESTAMPTZ`.
//! Anything upstream of that contract (the ticketing system's own schema)
//! belongs in the view definition, not here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::{Error, Result};
use crate::model::SourceRecord;
use crate::source::SourceFeed;

type SourceRow = (
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<DateTime<Utc>>,
);

pub struct PgSourceFeed {
    pool: PgPool,
    query: String,
}

impl PgSourceFeed {
    /// `relation` may be schema-qualified (`reporting.closed_tickets`).
    pub fn new(db: &super::Db, relation: &str) -> Result<Self> {
        let valid = !relation.is_empty()
            && relation
                .split('.')
                .all(|part| {
                    !part.is_empty()
                        && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                });
        if !valid {
            return Err(Error::Config(format!("invalid source relation: {relation}")));
        }
        Ok(Self {
            pool: db.pool().clone(),
            query: format!(
                "SELECT ticket_id, summary, description, resolution, technician, closed_at
                 FROM {relation}
                 WHERE ticket_id > $1
                 ORDER BY ticket_id
                 LIMIT $2"
            ),
        })
    }
}

#[async_trait]
impl SourceFeed for PgSourceFeed {
    async fn fetch_new_since(&self, position: i64, limit: u32) -> Result<Vec<SourceRecord>> {
        let rows: Vec<SourceRow> = sqlx::query_as(&self.query)
            .bind(position)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Source(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(
                |(ticket_id, summary, description, resolution, technician, closed_at)| {
                    SourceRecord {
                        ticket_id,
                        summary,
                        description,
                        resolution,
                        technician,
                        closed_at,
                    }
                },
            )
            .collect())
    }
}
