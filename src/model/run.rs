//! Audit records for worker passes and controller runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Counters a worker accumulates over one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub batches: u32,
    pub items_claimed: u32,
    /// Items that reached Complete.
    pub items_processed: u32,
    /// Items that reached Failed.
    pub items_failed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The pass drained its work (or hit the idle/deadline/shutdown stop).
    Completed,
    /// Infrastructure failure, panic, or a worker process exiting non-zero.
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(crate::error::Error::Other(format!(
                "unknown run status: {other}"
            ))),
        }
    }
}

/// One worker's pass in one controller cycle. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRun {
    pub worker_id: String,
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub items_claimed: u32,
    pub items_processed: u32,
    pub items_failed: u32,
    pub status: RunStatus,
    pub error: Option<String>,
}

impl WorkerRun {
    pub fn completed(
        worker_id: impl Into<String>,
        cycle: u64,
        started_at: DateTime<Utc>,
        stats: WorkerStats,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            cycle,
            started_at,
            ended_at: Utc::now(),
            items_claimed: stats.items_claimed,
            items_processed: stats.items_processed,
            items_failed: stats.items_failed,
            status: RunStatus::Completed,
            error: None,
        }
    }

    pub fn failed(
        worker_id: impl Into<String>,
        cycle: u64,
        started_at: DateTime<Utc>,
        stats: WorkerStats,
        error: impl Into<String>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            cycle,
            started_at,
            ended_at: Utc::now(),
            items_claimed: stats.items_claimed,
            items_processed: stats.items_processed,
            items_failed: stats.items_failed,
            status: RunStatus::Failed,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerStatus {
    Running,
    /// Stopped by the shutdown signal after finishing a cycle.
    Halted,
    Failed,
}

impl ControllerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ControllerStatus::Running => "running",
            ControllerStatus::Halted => "halted",
            ControllerStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifetime record of one controller process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: ControllerStatus,
    pub cycles: u64,
}
