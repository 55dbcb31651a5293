//! Core data model.
//!
//! A queue item is one source ticket waiting for (or done with) skill
//! extraction. Population creates items; workers own every transition after
//! that.

pub mod run;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::llm::CallFailure;
use crate::parser::ParseFailure;

pub use run::{ControllerRun, ControllerStatus, RunStatus, WorkerRun, WorkerStats};

// ---------------------------------------------------------------------------
// Queue Item
// ---------------------------------------------------------------------------

/// A ticket tracked by the work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// Queue-local identity. Monotonic, so it doubles as insertion order.
    pub id: ItemId,

    /// Ticket number in the source system. Unique across the queue.
    pub source_ticket_id: i64,

    /// Text sent to the model.
    pub raw_text: String,

    pub technician: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,

    /// Rough token count of `raw_text`, fixed at insert time.
    pub estimated_tokens: u32,

    pub status: Status,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,

    /// Completion payload (`{"skills": [...]}`), set with the Complete transition.
    pub result: Option<serde_json::Value>,

    /// Diagnostic text recorded with the Failed transition.
    pub failure_reason: Option<String>,

    /// Model attempts made over the item's whole lifetime.
    pub attempt_count: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    /// Move to `to`, rejecting moves the lifecycle does not allow.
    pub fn transition(&mut self, to: Status) -> Result<(), Error> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Newtype for queue item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub i64);

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Inserted by population, waiting for a worker.
    Pending,
    /// Owned by exactly one worker.
    Claimed,
    /// Skills extracted and stored. Terminal.
    Complete,
    /// Gave up on this item. Terminal.
    Failed,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, Claimed)
                | (Pending, Failed)     // oversized, never reaches the model
                | (Claimed, Complete)
                | (Claimed, Failed)
                | (Claimed, Pending) // stale claim swept
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Complete | Status::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Claimed => "claimed",
            Status::Complete => "complete",
            Status::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "claimed" => Ok(Status::Claimed),
            "complete" => Ok(Status::Complete),
            "failed" => Ok(Status::Failed),
            other => Err(Error::Other(format!("unknown status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Source records
// ---------------------------------------------------------------------------

/// A closed ticket as the source feed reports it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Source-native monotonic key.
    pub ticket_id: i64,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub resolution: Option<String>,
    pub technician: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl SourceRecord {
    /// Summary, initial description and resolution notes, separated by `---`.
    pub fn full_text(&self) -> String {
        [&self.summary, &self.description, &self.resolution]
            .iter()
            .map(|part| part.as_deref().unwrap_or(""))
            .collect::<Vec<_>>()
            .join("\n---\n")
    }
}

/// A ticket ready to be inserted into the queue.
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub source_ticket_id: i64,
    pub raw_text: String,
    pub technician: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
    pub estimated_tokens: u32,
}

impl NewTicket {
    /// Build a queue row from a source record. `None` when the record has no text.
    pub fn from_record(record: &SourceRecord) -> Option<Self> {
        let raw_text = record.full_text();
        if raw_text.replace("---", "").trim().is_empty() {
            return None;
        }
        let technician = record
            .technician
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        Some(Self {
            source_ticket_id: record.ticket_id,
            estimated_tokens: estimate_tokens(&raw_text),
            raw_text,
            technician,
            closed_at: record.closed_at,
        })
    }
}

/// Approximate token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Import progress against one source feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_id: String,
    pub last_seen_position: i64,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Failure reasons
// ---------------------------------------------------------------------------

/// Why an item ended up Failed.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// Estimated tokens over the threshold. Never sent to the model.
    Oversized { estimated_tokens: u32, threshold: u32 },
    /// Reclaimed with no attempts left (a previous owner used them up).
    AttemptsExhausted { attempts: u32 },
    /// Last attempt failed at the model endpoint.
    ModelCall(CallFailure),
    /// Last attempt returned text the parser could not use.
    Parse(ParseFailure),
    /// Processing the item ran past the per-item timeout.
    ItemTimeout { seconds: u64 },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Oversized {
                estimated_tokens,
                threshold,
            } => write!(f, "oversized ({estimated_tokens} tokens > {threshold})"),
            FailureReason::AttemptsExhausted { attempts } => {
                write!(f, "attempts exhausted ({attempts})")
            }
            FailureReason::ModelCall(failure) => write!(f, "model call failed: {failure}"),
            FailureReason::Parse(failure) => write!(f, "parse failed: {failure}"),
            FailureReason::ItemTimeout { seconds } => write!(f, "timed out after {seconds}s"),
        }
    }
}

// ---------------------------------------------------------------------------
// Read models
// ---------------------------------------------------------------------------

/// Item counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub claimed: u64,
    pub complete: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.claimed + self.complete + self.failed
    }
}

/// How often a skill was extracted across completed items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillCount {
    pub skill_name: String,
    pub frequency: u64,
}
