//! Source feed seam: read-only access to closed tickets, ordered by their
//! source-native key.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::SourceRecord;

#[async_trait]
pub trait SourceFeed: Send + Sync {
    /// Records with `ticket_id > position`, ascending, at most `limit`.
    async fn fetch_new_since(&self, position: i64, limit: u32) -> Result<Vec<SourceRecord>>;
}

/// Fixed in-memory feed. Backs tests and `--in-memory` dry runs.
#[derive(Default)]
pub struct StaticFeed {
    records: Mutex<Vec<SourceRecord>>,
    unavailable: Mutex<bool>,
}

impl StaticFeed {
    pub fn new(mut records: Vec<SourceRecord>) -> Self {
        records.sort_by_key(|r| r.ticket_id);
        Self {
            records: Mutex::new(records),
            unavailable: Mutex::new(false),
        }
    }

    /// Add records as if they had just closed in the source system.
    pub fn push(&self, record: SourceRecord) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| Error::Other("static feed lock poisoned".to_string()))?;
        records.push(record);
        records.sort_by_key(|r| r.ticket_id);
        Ok(())
    }

    /// Make every fetch fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) -> Result<()> {
        *self
            .unavailable
            .lock()
            .map_err(|_| Error::Other("static feed lock poisoned".to_string()))? = unavailable;
        Ok(())
    }
}

#[async_trait]
impl SourceFeed for StaticFeed {
    async fn fetch_new_since(&self, position: i64, limit: u32) -> Result<Vec<SourceRecord>> {
        let unavailable = *self
            .unavailable
            .lock()
            .map_err(|_| Error::Other("static feed lock poisoned".to_string()))?;
        if unavailable {
            return Err(Error::Source("static feed unavailable".to_string()));
        }
        let records = self
            .records
            .lock()
            .map_err(|_| Error::Other("static feed lock poisoned".to_string()))?;
        Ok(records
            .iter()
            .filter(|r| r.ticket_id > position)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
