//! Pipeline tuning loaded from TOML.
//!
//! ```toml
//! [population]
//! source_id = "connectwise"
//! page_size = 1000
//!
//! [worker]
//! batch_size = 10
//! max_attempts = 3
//!
//! [controller]
//! worker_count = 4
//! launch = "subprocess"
//!
//! [model]
//! name = "llama3"
//! ```
//!
//! Every key is optional; missing keys take the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub population: PopulationSettings,
    pub worker: WorkerSettings,
    pub controller: ControllerSettings,
    pub model: ModelSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PopulationSettings {
    /// Checkpoint key for this feed.
    pub source_id: String,
    /// Table or view the Postgres feed reads from.
    pub source_relation: String,
    /// Records pulled per population cycle.
    pub page_size: u32,
}

impl Default for PopulationSettings {
    fn default() -> Self {
        Self {
            source_id: "connectwise".to_string(),
            source_relation: "closed_tickets".to_string(),
            page_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub batch_size: u32,
    /// Items estimated above this many tokens fail as oversized.
    pub max_token_threshold: u32,
    /// Model attempts per item over its lifetime.
    pub max_attempts: u32,
    /// Stop after this long without pending work.
    pub idle_secs: u64,
    /// Wait between empty claims while idling.
    pub poll_interval_secs: u64,
    /// Bound on processing one item, all attempts included.
    pub item_timeout_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_token_threshold: 8000,
            max_attempts: 3,
            idle_secs: 30,
            poll_interval_secs: 5,
            item_timeout_secs: 300,
        }
    }
}

impl WorkerSettings {
    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }
}

/// How the controller starts workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    /// Tokio tasks inside the controller process.
    InProcess,
    /// `skillq worker` child processes.
    Subprocess,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub worker_count: u32,
    /// Claims older than this are returned to pending by the sweep.
    pub stale_claim_secs: u64,
    /// Sleep between cycles that found no pending work.
    pub cycle_sleep_secs: u64,
    /// Workers stop claiming new batches this long after a cycle starts.
    pub cycle_deadline_secs: u64,
    /// Presence of this file requests a graceful shutdown.
    pub stop_file: PathBuf,
    pub launch: LaunchMode,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            stale_claim_secs: 1800,
            cycle_sleep_secs: 3600,
            cycle_deadline_secs: 7200,
            stop_file: PathBuf::from("stop.txt"),
            launch: LaunchMode::InProcess,
        }
    }
}

impl ControllerSettings {
    pub fn stale_claim(&self) -> Duration {
        Duration::from_secs(self.stale_claim_secs)
    }

    pub fn cycle_sleep(&self) -> Duration {
        Duration::from_secs(self.cycle_sleep_secs)
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.cycle_deadline_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub name: String,
    pub prompt_path: PathBuf,
    /// HTTP request timeout for one model call.
    pub timeout_secs: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            name: "llama3".to_string(),
            prompt_path: PathBuf::from("prompts/skills.txt"),
            timeout_secs: 90,
        }
    }
}

impl ModelSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Settings {
    /// Load settings from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let settings = Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad settings file {}: {e}", path.display())))?;
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would stall the pipeline.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("population.page_size", self.population.page_size as u64),
            ("worker.batch_size", self.worker.batch_size as u64),
            ("worker.max_attempts", self.worker.max_attempts as u64),
            ("worker.max_token_threshold", self.worker.max_token_threshold as u64),
            ("worker.item_timeout_secs", self.worker.item_timeout_secs),
            ("worker.poll_interval_secs", self.worker.poll_interval_secs),
            ("controller.worker_count", self.controller.worker_count as u64),
            ("controller.stale_claim_secs", self.controller.stale_claim_secs),
            ("controller.cycle_deadline_secs", self.controller.cycle_deadline_secs),
            ("model.timeout_secs", self.model.timeout_secs),
        ];
        for (key, value) in checks {
            if value == 0 {
                return Err(Error::Config(format!("{key} must be greater than zero")));
            }
        }
        // Claims are refreshed once per model attempt, so one item must fit
        // inside the staleness window.
        if self.controller.stale_claim_secs <= self.worker.item_timeout_secs {
            return Err(Error::Config(format!(
                "controller.stale_claim_secs ({}) must exceed worker.item_timeout_secs ({})",
                self.controller.stale_claim_secs, self.worker.item_timeout_secs
            )));
        }
        if self.population.source_id.trim().is_empty() {
            return Err(Error::Config("population.source_id must not be empty".to_string()));
        }
        Ok(())
    }
}
