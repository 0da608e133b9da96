use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use archive_ingest::artifact::ArtifactResolver;
use archive_ingest::config::{self, IngestConfig};
use archive_ingest::db::open_database;
use archive_ingest::schema::{pipeline_specs, MigrationEngine, MigrationError, SpecOutcome};
use archive_ingest::triage::{
    run_cycle, start_worker, supervise, CommandExecutor, DefaultFailurePolicy, ProcessingRecord,
    RecordStatus, RecordStore, RecordTable, SqliteRecordStore, Stage, StageExecutor, StageResult,
    TriageScheduler, WorkerConfig,
};

#[derive(Parser)]
#[command(name = "archive-ingest", version)]
#[command(about = "Schema migration, artifact resolution and OCR/summary triage for the archive", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// SQLite database file
    #[arg(long, global = true, env = "ARCHIVE_DB_PATH")]
    db: Option<PathBuf>,

    /// Application root; the storage tree lives under it
    #[arg(long, global = true, env = "ARCHIVE_ROOT")]
    root: Option<PathBuf>,

    /// Name of the storage directory under the root
    #[arg(long, global = true, env = "ARCHIVE_STORAGE_ANCHOR")]
    anchor: Option<String>,

    /// Records claimed per scheduler call
    #[arg(long, global = true, env = "ARCHIVE_BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Executor failures at this attempt become terminal
    #[arg(long, global = true, env = "ARCHIVE_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,

    /// Treat a missing source file as a terminal failure
    #[arg(long, global = true)]
    missing_is_terminal: bool,

    /// Accept resolved files outside the storage root
    #[arg(long, global = true)]
    unconfined: bool,

    /// Fallback log filter when RUST_LOG is unset
    #[arg(long, global = true, env = "ARCHIVE_LOG")]
    log: Option<String>,
}

impl GlobalArgs {
    fn into_config(self) -> IngestConfig {
        let defaults = IngestConfig::default();
        IngestConfig {
            db_path: self.db.unwrap_or(defaults.db_path),
            root_dir: self.root.unwrap_or(defaults.root_dir),
            storage_anchor: self.anchor.unwrap_or(defaults.storage_anchor),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            retry_missing_artifact: !self.missing_is_terminal,
            confine_to_storage: !self.unconfined,
            log_filter: self.log.unwrap_or(defaults.log_filter),
            ..defaults
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the database schema up to date
    Migrate {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Status counts and recent failures
    Stats {
        #[arg(long)]
        table: Vec<RecordTable>,
        /// Recent failures to show per table
        #[arg(long, default_value_t = 10)]
        errors: usize,
        #[arg(long)]
        json: bool,
    },
    /// Resolve a recorded file reference on this host
    Resolve { reference: String },
    /// Move one record back to an earlier status
    Reset {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        to: RecordStatus,
        #[arg(long, default_value = "documents")]
        table: RecordTable,
    },
    /// Reset every record in `error`
    RetryErrors {
        #[arg(long, default_value = "downloaded")]
        to: RecordStatus,
        #[arg(long)]
        table: Vec<RecordTable>,
    },
    /// Run OCR / summarization workers
    Work {
        /// Stages to run (default: every stage with a command)
        #[arg(long)]
        stage: Vec<Stage>,
        #[arg(long)]
        table: Vec<RecordTable>,
        /// OCR program; receives the file path as its last argument
        #[arg(long, env = "ARCHIVE_OCR_CMD")]
        ocr_cmd: Option<String>,
        /// Summarizer program; reads OCR text on stdin, prints JSON
        #[arg(long, env = "ARCHIVE_SUMMARIZE_CMD")]
        summarize_cmd: Option<String>,
        /// Seconds between passes
        #[arg(long, env = "ARCHIVE_POLL_SECS")]
        poll_secs: Option<u64>,
        /// Claims older than this many seconds are released
        #[arg(long, env = "ARCHIVE_STALE_CLAIM_SECS")]
        stale_claim_secs: Option<u64>,
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = cli.global.into_config();
    archive_ingest::init_tracing(&config.log_filter);
    tracing::debug!("{} v{}", config::APP_NAME, config::APP_VERSION);

    match run(cli.command, config) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands, mut config: IngestConfig) -> Result<ExitCode> {
    match command {
        Commands::Migrate { json } => migrate(&config, json),
        Commands::Stats {
            table,
            errors,
            json,
        } => {
            stats(&config, &tables_or_all(table), errors, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Resolve { reference } => {
            let resolver = ArtifactResolver::from_config(&config);
            match resolver.resolve(&reference) {
                Some(resolution) => {
                    println!("{}\t{}", resolution.path.display(), resolution.strategy)
                }
                None => println!("unresolved"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Reset { id, to, table } => {
            open_store(&config, table)?
                .reset_record(id, to)
                .with_context(|| format!("Failed to reset {table} record {id}"))?;
            println!("{table} #{id} -> {to}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::RetryErrors { to, table } => {
            for table in tables_or_all(table) {
                let count = open_store(&config, table)?
                    .reset_errors(to)
                    .with_context(|| format!("Failed to reset {table} errors"))?;
                println!("{table}: {count} record(s) -> {to}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Work {
            stage,
            table,
            ocr_cmd,
            summarize_cmd,
            poll_secs,
            stale_claim_secs,
            once,
        } => {
            if let Some(secs) = poll_secs {
                config.poll_interval_secs = secs;
            }
            if let Some(secs) = stale_claim_secs {
                config.stale_claim_secs = secs;
            }
            let executors = build_executors(&stage, ocr_cmd.as_deref(), summarize_cmd.as_deref())?;
            work(&config, &tables_or_all(table), executors, once)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn migrate(config: &IngestConfig, json: bool) -> Result<ExitCode> {
    let conn = open_database(&config.db_path)
        .with_context(|| format!("Failed to open {}", config.db_path.display()))?;

    let report = match MigrationEngine::new(&conn).apply(&pipeline_specs()) {
        Ok(report) => report,
        Err(e @ MigrationError::Introspection { .. }) => {
            eprintln!("error: {e}");
            return Ok(ExitCode::from(2));
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for entry in &report.entries {
            println!("{:<8} {:<6} {}", outcome_label(&entry.outcome), entry.kind, entry.label);
            if let SpecOutcome::Warning(message) = &entry.outcome {
                println!("         {message}");
            }
        }
        println!(
            "{} applied, {} skipped, {} warnings in {} ms",
            report.applied(),
            report.skipped(),
            report.warnings(),
            report.duration_ms
        );
    }

    if report.is_blocking() {
        eprintln!("error: required schema changes are missing");
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}

fn outcome_label(outcome: &SpecOutcome) -> &'static str {
    match outcome {
        SpecOutcome::Applied => "applied",
        SpecOutcome::Skipped => "skipped",
        SpecOutcome::Warning(_) => "WARNING",
    }
}

fn stats(config: &IngestConfig, tables: &[RecordTable], errors: usize, json: bool) -> Result<()> {
    let mut all = BTreeMap::new();
    for &table in tables {
        let store = open_store(config, table)?;
        let counts = store.status_counts()?;
        let recent = store.recent_errors(errors)?;
        if !json {
            println!("{table}");
            for status in RecordStatus::ALL {
                println!("  {:<16} {}", status.as_str(), counts.get(status).copied().unwrap_or(0));
            }
            for entry in &recent {
                println!(
                    "  ! #{} {} at {}: {}",
                    entry.record_id, entry.step, entry.created_at, entry.message
                );
            }
        }
        all.insert(
            table.as_str(),
            serde_json::json!({ "counts": counts, "recent_errors": recent }),
        );
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&all)?);
    }
    Ok(())
}

fn build_executors(
    stages: &[Stage],
    ocr_cmd: Option<&str>,
    summarize_cmd: Option<&str>,
) -> Result<Vec<Box<dyn StageExecutor>>> {
    let command_for = |stage: Stage| match stage {
        Stage::Ocr => ocr_cmd,
        Stage::Summarize => summarize_cmd,
    };
    let stages: Vec<Stage> = if stages.is_empty() {
        Stage::ALL
            .iter()
            .copied()
            .filter(|s| command_for(*s).is_some())
            .collect()
    } else {
        stages.to_vec()
    };
    if stages.is_empty() {
        bail!("No stage to run: pass --ocr-cmd and/or --summarize-cmd");
    }

    let mut executors: Vec<Box<dyn StageExecutor>> = Vec::new();
    for stage in stages {
        let line = command_for(stage)
            .with_context(|| format!("Stage {stage} needs a command (--{stage}-cmd)"))?;
        let executor = CommandExecutor::from_command_line(stage, line)
            .with_context(|| format!("Empty command for stage {stage}"))?;
        executors.push(Box::new(executor));
    }
    Ok(executors)
}

fn work(
    config: &IngestConfig,
    tables: &[RecordTable],
    executors: Vec<Box<dyn StageExecutor>>,
    once: bool,
) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
        .context("Failed to install signal handler")?;

    let resolver = Arc::new(ArtifactResolver::from_config(config));
    let worker_config = WorkerConfig::from_config(config);
    let executors: Vec<Arc<dyn StageExecutor>> = executors.into_iter().map(Arc::from).collect();

    let mut handles = Vec::new();
    for &table in tables {
        let scheduler = Arc::new(TriageScheduler::new(
            Arc::new(open_store(config, table)?),
            Box::new(DefaultFailurePolicy::from_config(config)),
            config.batch_size,
        ));
        let table_executors: Vec<Box<dyn StageExecutor>> = executors
            .iter()
            .map(|e| Box::new(SharedExecutor(Arc::clone(e))) as Box<dyn StageExecutor>)
            .collect();

        if once {
            let results = run_cycle(
                &scheduler,
                &table_executors,
                &resolver,
                worker_config.stale_claim_age,
                Some(&stop),
            )
            .with_context(|| format!("Pass over {table} failed"))?;
            for (stage, summary) in results {
                println!("{table}/{stage}: {}", serde_json::to_string(&summary)?);
            }
        } else {
            handles.push(start_worker(
                scheduler,
                table_executors,
                Arc::clone(&resolver),
                worker_config.clone(),
            ));
        }
    }

    supervise(handles, &stop);
    Ok(())
}

fn open_store(config: &IngestConfig, table: RecordTable) -> Result<SqliteRecordStore> {
    SqliteRecordStore::open(&config.db_path, table)
        .with_context(|| format!("Failed to open {}", config.db_path.display()))
}

fn tables_or_all(tables: Vec<RecordTable>) -> Vec<RecordTable> {
    if tables.is_empty() {
        RecordTable::ALL.to_vec()
    } else {
        tables
    }
}

/// One executor serving several table workers.
struct SharedExecutor(Arc<dyn StageExecutor>);

impl StageExecutor for SharedExecutor {
    fn stage(&self) -> Stage {
        self.0.stage()
    }

    fn run(&self, record: &ProcessingRecord, artifact: Option<&Path>) -> StageResult {
        self.0.run(record, artifact)
    }
}
