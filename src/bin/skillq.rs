//! skillq CLI: run the pipeline and inspect the queue.

use std::ffi::OsString;
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use skillq::config::{Config, LaunchMode, Settings};
use skillq::db::{Db, PgSourceFeed};
use skillq::engine::{AnySignal, ChildCommand, Controller, Launcher, ShutdownFlag, StopFile, Worker};
use skillq::llm::{ModelClient, OllamaClient, PromptTemplate};
use skillq::model::{ItemId, SourceRecord, Status};
use skillq::population::Population;
use skillq::source::StaticFeed;
use skillq::store::{MemoryStore, QueueReader, RunLedger, Store, WorkQueue};
use skillq::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "skillq", about = "Skill extraction queue for service tickets")]
struct Cli {
    /// Pipeline settings file
    #[arg(long, global = true, default_value = "skillq.toml")]
    settings: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller loop until stopped
    Serve {
        /// Use an in-memory queue seeded from a JSON file of source records
        #[arg(long, value_name = "SEED")]
        in_memory: Option<PathBuf>,
    },
    /// Run one worker pass against the queue
    Worker {
        #[arg(long)]
        worker_id: Option<String>,
        /// Controller cycle this pass belongs to
        #[arg(long, default_value_t = 0)]
        cycle: u64,
        /// Stop claiming new batches after this many seconds
        #[arg(long)]
        deadline_secs: Option<u64>,
        /// Print the run record as JSON on stdout instead of storing it
        #[arg(long)]
        report: bool,
    },
    /// Run one population cycle
    Populate,
    /// Return stale claims to pending
    Sweep {
        /// Override controller.stale_claim_secs
        #[arg(long)]
        older_than_secs: Option<u64>,
    },
    /// Queue counts, in-flight items, recent worker runs, top skills
    Status {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// List queue items
    List {
        /// Filter by status (pending, claimed, complete, failed)
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Show one queue item and its skills
    Show { id: i64 },
    /// Parse model output from stdin and print the skills
    Parse,
    /// Ask a running controller to halt after its current cycle
    Stop,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let _guard = init_telemetry(TelemetryConfig::from_env("skillq"))?;

    let settings = Settings::load(&cli.settings)?;

    match cli.command {
        Command::Serve { in_memory } => match in_memory {
            Some(seed) => cmd_serve_in_memory(&settings, &seed).await,
            None => cmd_serve(&cli.settings, &settings).await,
        },
        Command::Worker {
            worker_id,
            cycle,
            deadline_secs,
            report,
        } => cmd_worker(&settings, worker_id, cycle, deadline_secs, report).await,
        Command::Parse => cmd_parse(),
        Command::Stop => {
            let stop = StopFile::new(&settings.controller.stop_file);
            stop.request()
                .with_context(|| format!("writing {}", stop.path().display()))?;
            println!("Stop requested: {}", stop.path().display());
            Ok(())
        }
        Command::Populate => {
            let config = Config::from_env()?;
            let db = connect_queue(&config).await?;
            cmd_populate(&config, &settings, db).await
        }
        Command::Sweep { older_than_secs } => {
            let db = connect_queue(&Config::from_env()?).await?;
            let older_than = older_than_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| settings.controller.stale_claim());
            let swept = db.sweep_stale(older_than).await?;
            println!("Returned {} stale claim(s) to pending", swept.len());
            Ok(())
        }
        Command::Status { limit } => {
            let db = connect_queue(&Config::from_env()?).await?;
            cmd_status(&db, limit).await
        }
        Command::List { status, limit } => {
            let db = connect_queue(&Config::from_env()?).await?;
            cmd_list(&db, status, limit).await
        }
        Command::Show { id } => {
            let db = connect_queue(&Config::from_env()?).await?;
            cmd_show(&db, ItemId(id)).await
        }
    }
}

async fn connect_queue(config: &Config) -> anyhow::Result<Db> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    Ok(db)
}

fn ollama_client(config_url: &str, settings: &Settings) -> anyhow::Result<OllamaClient> {
    let prompt = PromptTemplate::load(&settings.model.prompt_path);
    Ok(OllamaClient::new(
        config_url,
        settings.model.name.clone(),
        prompt,
        settings.model.timeout(),
    )?)
}

const HALT_ON_INTERRUPT: &str = "interrupt received, halting after the current cycle";

/// Interrupt or stop file. Subprocess workers share the controller's
/// terminal, so they get the same signal and finish their batch on Ctrl-C.
fn shutdown_signal(settings: &Settings, on_interrupt: &'static str) -> anyhow::Result<AnySignal> {
    Ok(AnySignal::new()
        .with(ShutdownFlag::on_interrupt(on_interrupt)?)
        .with(StopFile::new(&settings.controller.stop_file)))
}

async fn cmd_serve(settings_path: &Path, settings: &Settings) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let pool_size = settings.controller.worker_count + 2;
    let db = Db::connect_with(config.database_url.expose_secret(), pool_size).await?;
    db.migrate().await?;
    let source_db = Db::connect(config.source_database_url.expose_secret()).await?;
    let feed = PgSourceFeed::new(&source_db, &settings.population.source_relation)?;
    let model = ollama_client(&config.ollama_url, settings)?;

    let launcher = match settings.controller.launch {
        LaunchMode::InProcess => Launcher::InProcess,
        LaunchMode::Subprocess => Launcher::Subprocess(ChildCommand::current_exe(vec![
            OsString::from("--settings"),
            settings_path.as_os_str().to_owned(),
        ])?),
    };

    let controller = Controller::new(
        Arc::new(db),
        Arc::new(feed),
        Arc::new(model),
        settings,
        Arc::new(shutdown_signal(settings, HALT_ON_INTERRUPT)?),
    )
    .with_launcher(launcher);

    let run = controller.run().await?;
    println!("Controller {} {} after {} cycle(s)", run.id, run.status, run.cycles);
    Ok(())
}

/// Dry run: in-memory queue, seed records from a file, real model endpoint.
async fn cmd_serve_in_memory(settings: &Settings, seed: &Path) -> anyhow::Result<()> {
    if settings.controller.launch == LaunchMode::Subprocess {
        anyhow::bail!("an in-memory queue cannot be shared with worker processes");
    }
    let content =
        std::fs::read_to_string(seed).with_context(|| format!("reading {}", seed.display()))?;
    let records: Vec<SourceRecord> = serde_json::from_str(&content)
        .with_context(|| format!("parsing source records in {}", seed.display()))?;
    let ollama_url =
        std::env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string());
    let model = ollama_client(&ollama_url, settings)?;

    let store = Arc::new(MemoryStore::new());
    let controller = Controller::new(
        Arc::clone(&store),
        Arc::new(StaticFeed::new(records)),
        Arc::new(model),
        settings,
        Arc::new(shutdown_signal(settings, HALT_ON_INTERRUPT)?),
    );
    let run = controller.run().await?;

    let counts = store.status_counts().await?;
    println!(
        "Controller {} {} after {} cycle(s): {} complete, {} failed, {} pending",
        run.id, run.status, run.cycles, counts.complete, counts.failed, counts.pending
    );
    for skill in store.top_skills(20).await? {
        println!("  {:>5}  {}", skill.frequency, skill.skill_name);
    }
    Ok(())
}

async fn cmd_worker(
    settings: &Settings,
    worker_id: Option<String>,
    cycle: u64,
    deadline_secs: Option<u64>,
    report: bool,
) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let db = Arc::new(Db::connect_with(config.database_url.expose_secret(), 2).await?);
    let model: Arc<dyn ModelClient> = Arc::new(ollama_client(&config.ollama_url, settings)?);
    let worker_id = worker_id.unwrap_or_else(|| format!("worker-{}", std::process::id()));

    let signal = shutdown_signal(settings, "interrupt received, finishing the current batch")?;
    let mut worker = Worker::new(
        worker_id,
        cycle,
        Arc::clone(&db),
        model,
        settings.worker.clone(),
        Arc::new(signal),
    );
    if let Some(secs) = deadline_secs {
        worker = worker.with_deadline(tokio::time::Instant::now() + Duration::from_secs(secs));
    }

    let run = worker.run().await;
    if report {
        println!("{}", serde_json::to_string(&run)?);
    } else {
        db.record_worker_run(&run).await?;
        println!(
            "Worker {} {}: {} processed, {} failed",
            run.worker_id, run.status, run.items_processed, run.items_failed
        );
    }
    Ok(())
}

async fn cmd_populate(config: &Config, settings: &Settings, db: Db) -> anyhow::Result<()> {
    let source_db = Db::connect(config.source_database_url.expose_secret()).await?;
    let feed = PgSourceFeed::new(&source_db, &settings.population.source_relation)?;
    let population = Population::new(
        Arc::new(db),
        Arc::new(feed),
        settings.population.source_id.clone(),
        settings.population.page_size,
    );
    let report = population.run_cycle().await?;
    println!(
        "Fetched {}, inserted {}, duplicates {}, skipped {}; checkpoint {} -> {}",
        report.fetched,
        report.inserted,
        report.duplicates,
        report.skipped,
        report.checkpoint_before,
        report.checkpoint_after
    );
    Ok(())
}

async fn cmd_status<S: Store>(store: &S, limit: u32) -> anyhow::Result<()> {
    let counts = store.status_counts().await?;
    println!(
        "Pending: {}  Claimed: {}  Complete: {}  Failed: {}  Total: {}",
        counts.pending,
        counts.claimed,
        counts.complete,
        counts.failed,
        counts.total()
    );

    let in_flight = store.in_flight().await?;
    if !in_flight.is_empty() {
        println!("\nIn flight:");
        for item in &in_flight {
            println!(
                "  {:<8}  {:<24}  {}",
                item.id,
                item.claimed_by.as_deref().unwrap_or("-"),
                item.claimed_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
    }

    let runs = store.recent_worker_runs(limit).await?;
    if !runs.is_empty() {
        println!("\nRecent worker runs:");
        for run in &runs {
            println!(
                "  {:<28}  cycle {:<4}  {:<9}  {:>4} claimed  {:>4} ok  {:>4} failed  {}",
                run.worker_id,
                run.cycle,
                run.status,
                run.items_claimed,
                run.items_processed,
                run.items_failed,
                run.error.as_deref().unwrap_or("")
            );
        }
    }

    let skills = store.top_skills(limit).await?;
    if !skills.is_empty() {
        println!("\nTop skills:");
        for skill in &skills {
            println!("  {:>6}  {}", skill.frequency, skill.skill_name);
        }
    }
    Ok(())
}

async fn cmd_list<S: Store>(store: &S, status: Option<String>, limit: u32) -> anyhow::Result<()> {
    let status: Option<Status> = match status {
        Some(s) => Some(s.parse().map_err(|_| anyhow::anyhow!("invalid status: {s}"))?),
        None => None,
    };

    let items = store.list_items(status, limit).await?;
    if items.is_empty() {
        println!("No queue items found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<10}  {:<9}  {:<6}  {:<4}  REASON",
        "ID", "TICKET", "STATUS", "TOKENS", "TRY"
    );
    println!("{}", "-".repeat(80));
    for item in &items {
        println!(
            "{:<8}  {:<10}  {:<9}  {:<6}  {:<4}  {}",
            item.id,
            item.source_ticket_id,
            item.status,
            item.estimated_tokens,
            item.attempt_count,
            item.failure_reason.as_deref().unwrap_or("")
        );
    }
    println!("\n{} item(s)", items.len());
    Ok(())
}

async fn cmd_show<S: Store>(store: &S, id: ItemId) -> anyhow::Result<()> {
    let item = store.get_item(id).await?;

    println!("ID:         {}", item.id);
    println!("Ticket:     {}", item.source_ticket_id);
    println!("Status:     {}", item.status);
    println!("Technician: {}", item.technician.as_deref().unwrap_or("-"));
    if let Some(closed) = item.closed_at {
        println!("Closed:     {closed}");
    }
    println!("Tokens:     {}", item.estimated_tokens);
    println!("Attempts:   {}", item.attempt_count);
    println!("Claimed By: {}", item.claimed_by.as_deref().unwrap_or("-"));
    println!("Created:    {}", item.created_at);
    if item.status.is_terminal() {
        println!("Finished:   {}", item.updated_at);
    } else {
        println!("Updated:    {}", item.updated_at);
    }
    if let Some(ref reason) = item.failure_reason {
        println!("Failure:    {reason}");
    }
    if item.status == Status::Complete {
        let skills = store.skills_for_item(id).await?;
        println!("---");
        println!("Skills ({}):", skills.len());
        for skill in &skills {
            println!("  - {skill}");
        }
    }
    Ok(())
}

fn cmd_parse() -> anyhow::Result<()> {
    let mut raw = String::new();
    std::io::stdin().read_to_string(&mut raw)?;
    match skillq::parser::parse(&raw) {
        Ok(skills) => {
            println!("{}", serde_json::to_string_pretty(&skills)?);
            Ok(())
        }
        Err(failure) => anyhow::bail!("unparseable model output: {failure}"),
    }
}
