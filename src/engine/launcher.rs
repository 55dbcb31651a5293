//! Starting workers for a cycle: tokio tasks in this process, or
//! `skillq worker` child processes that report back on stdout.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use chrono::Utc;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::config::WorkerSettings;
use crate::engine::shutdown::ShutdownSignal;
use crate::engine::worker::Worker;
use crate::llm::ModelClient;
use crate::model::{WorkerRun, WorkerStats};
use crate::store::WorkQueue;

/// A child process invocation: `program [args..] worker --worker-id ..`.
#[derive(Debug, Clone)]
pub struct ChildCommand {
    pub program: PathBuf,
    /// Global flags placed before the `worker` subcommand.
    pub args: Vec<OsString>,
}

impl ChildCommand {
    /// Re-invoke the running executable.
    pub fn current_exe(args: Vec<OsString>) -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args,
        })
    }
}

#[derive(Debug, Clone)]
pub enum Launcher {
    InProcess,
    Subprocess(ChildCommand),
}

/// What one launch needs to know about its cycle.
pub(crate) struct LaunchPlan<'a> {
    pub cycle: u64,
    pub worker_ids: Vec<String>,
    pub deadline: Instant,
    pub settings: &'a WorkerSettings,
}

impl Launcher {
    /// Start every worker in the plan and wait for all of them. Returns one
    /// run record per worker in plan order, whatever became of it.
    pub(crate) async fn launch<S, M>(
        &self,
        plan: LaunchPlan<'_>,
        store: &Arc<S>,
        model: &Arc<M>,
        shutdown: &Arc<dyn ShutdownSignal>,
    ) -> Vec<WorkerRun>
    where
        S: WorkQueue + ?Sized + 'static,
        M: ModelClient + ?Sized + 'static,
    {
        match self {
            Launcher::InProcess => {
                let handles: Vec<_> = plan
                    .worker_ids
                    .iter()
                    .map(|id| {
                        let worker = Worker::new(
                            id.clone(),
                            plan.cycle,
                            Arc::clone(store),
                            Arc::clone(model),
                            plan.settings.clone(),
                            Arc::clone(shutdown),
                        )
                        .with_deadline(plan.deadline);
                        let started_at = Utc::now();
                        let handle = tokio::spawn(async move { worker.run().await });
                        (id.clone(), started_at, handle)
                    })
                    .collect();

                let mut runs = Vec::with_capacity(handles.len());
                for (id, started_at, handle) in handles {
                    let run = match handle.await {
                        Ok(run) => run,
                        Err(e) => {
                            error!(worker = %id, error = %e, "worker task aborted");
                            WorkerRun::failed(
                                id,
                                plan.cycle,
                                started_at,
                                WorkerStats::default(),
                                format!("worker task aborted: {e}"),
                            )
                        }
                    };
                    runs.push(run);
                }
                runs
            }
            Launcher::Subprocess(command) => {
                let deadline_secs = plan
                    .deadline
                    .saturating_duration_since(Instant::now())
                    .as_secs();
                let handles: Vec<_> = plan
                    .worker_ids
                    .iter()
                    .map(|id| {
                        let command = command.clone();
                        let id = id.clone();
                        let cycle = plan.cycle;
                        (Utc::now(), tokio::spawn(run_child(command, id, cycle, deadline_secs)))
                    })
                    .collect();

                let mut runs = Vec::with_capacity(handles.len());
                for (id, (started_at, handle)) in plan.worker_ids.iter().zip(handles) {
                    runs.push(handle.await.unwrap_or_else(|e| {
                        WorkerRun::failed(
                            id.clone(),
                            plan.cycle,
                            started_at,
                            WorkerStats::default(),
                            format!("worker supervisor aborted: {e}"),
                        )
                    }));
                }
                runs
            }
        }
    }
}

async fn run_child(command: ChildCommand, id: String, cycle: u64, deadline_secs: u64) -> WorkerRun {
    let started_at = Utc::now();
    debug!(worker = %id, program = %command.program.display(), "spawning worker process");

    let output = Command::new(&command.program)
        .args(&command.args)
        .arg("worker")
        .arg("--worker-id")
        .arg(&id)
        .arg("--cycle")
        .arg(cycle.to_string())
        .arg("--deadline-secs")
        .arg(deadline_secs.to_string())
        .arg("--report")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .output()
        .await;

    let failed = |error: String| {
        error!(worker = %id, %error, "worker process failed");
        WorkerRun::failed(id.clone(), cycle, started_at, WorkerStats::default(), error)
    };

    let output = match output {
        Ok(output) => output,
        Err(e) => return failed(format!("could not start worker process: {e}")),
    };
    if !output.status.success() {
        return failed(format!(
            "worker process exited with status {}",
            output.status.code().unwrap_or(-1)
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    match parse_report(&stdout) {
        Some(run) => run,
        None => failed("worker process produced no readable report".to_string()),
    }
}

/// The report is the last non-empty stdout line, a JSON [`WorkerRun`].
pub(crate) fn parse_report(stdout: &str) -> Option<WorkerRun> {
    stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| serde_json::from_str(line.trim()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_is_last_non_empty_line() {
        let line = r#"{"worker_id":"w1","cycle":2,"started_at":"2024-01-01T00:00:00Z","ended_at":"2024-01-01T00:01:00Z","items_processed":3,"items_failed":1,"status":"completed","error":null}"#;
        let stdout = format!("noise\n{line}\n\n");
        let run = parse_report(&stdout).unwrap();
        assert_eq!(run.worker_id, "w1");
        assert_eq!(run.cycle, 2);
        assert_eq!(run.items_processed, 3);
        assert_eq!(run.items_failed, 1);
    }

    #[test]
    fn garbage_report_is_rejected() {
        assert!(parse_report("").is_none());
        assert!(parse_report("worker done\n").is_none());
    }
}
