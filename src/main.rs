//! # planline
//!
//! Command-line front end over a [`Planner`]: inspect and edit the task
//! outline, read the event log, force a snapshot or rebuild the task table
//! from the log.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use planline_core::settings::load_settings_from_path;
use planline_core::{ConstraintType, PlanlineSettings, Task, TaskId, TaskPatch};
use planline_engine::{parse_date_input, OperationResult, Planner};
use planline_store::{DataLoader, Database, EventLog};
use planline_telemetry::{init_telemetry, TelemetryConfig};
use tracing::debug;

/// Event-sourced task planner.
#[derive(Parser, Debug)]
#[command(name = "planline", about = "Event-sourced task planner")]
struct Cli {
    /// Path to the `SQLite` database (overrides settings).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Path to a JSON settings file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the task outline.
    List,
    /// Add a task at the end of its group, or below `--after`.
    Add {
        name: String,
        #[arg(long)]
        parent: Option<String>,
        #[arg(long)]
        after: Option<String>,
        /// Duration in working days.
        #[arg(long)]
        duration: Option<f64>,
        /// Start no earlier than this date (YYYY-MM-DD).
        #[arg(long)]
        snet: Option<String>,
    },
    /// Rename a task.
    Rename { id: String, name: String },
    /// Delete a task. Without `--cascade` its children move up a level.
    Delete {
        id: String,
        #[arg(long)]
        cascade: bool,
    },
    /// Import a JSON array of tasks as one step.
    Import {
        file: PathBuf,
        /// Label recorded in the import event. Defaults to the file name.
        #[arg(long)]
        source: Option<String>,
    },
    /// Show the newest log entries.
    Events {
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Write a snapshot of the current state.
    Snapshot,
    /// Rebuild the task table from the latest snapshot and the log.
    Rebuild,
}

fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".planline").join("settings.json")
}

fn load_settings(cli: &Cli) -> Result<PlanlineSettings> {
    let path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(db) = &cli.db {
        settings.database.path = db.clone();
    }
    Ok(settings)
}

fn open_db(path: &Path) -> Result<Database> {
    Database::open(path).with_context(|| format!("Failed to open database: {}", path.display()))
}

fn check(result: OperationResult) -> Result<OperationResult> {
    if !result.success {
        bail!(result.message);
    }
    Ok(result)
}

fn print_outline(tasks: &[Task]) {
    let mut depth: HashMap<&TaskId, usize> = HashMap::new();
    for task in tasks {
        let level = task
            .parent_id
            .as_ref()
            .and_then(|p| depth.get(p))
            .map_or(0, |d| d + 1);
        let _ = depth.insert(&task.id, level);
        let indent = "  ".repeat(level);
        if task.is_blank() {
            println!("{indent}{}. -  [{}]", task.display_order, task.id);
        } else {
            println!(
                "{indent}{}. {}  ({}d)  [{}]",
                task.display_order, task.name, task.duration, task.id
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    let _ = init_telemetry(&TelemetryConfig::from_settings(&settings.logging));
    debug!(db = %settings.database.path.display(), command = ?cli.command, "starting");
    let db = open_db(&settings.database.path)?;

    match cli.command {
        Command::List => {
            let planner = Planner::open(db, &settings)?;
            print_outline(&planner.outline());
        }
        Command::Add {
            name,
            parent,
            after,
            duration,
            snet,
        } => {
            let planner = Planner::open(db, &settings)?;
            let mut task = Task::new(TaskId::new(), name);
            task.parent_id = parent.map(TaskId::from_raw);
            if let Some(duration) = duration {
                task.duration = duration;
            }
            if let Some(snet) = snet {
                task.constraint_type = ConstraintType::Snet;
                task.constraint_date = Some(parse_date_input(&snet)?);
            }
            let result = check(planner.add_task(task, after.map(TaskId::from_raw)).await?)?;
            if let Some(id) = result.task_id {
                println!("{id}");
            }
            let _ = planner.shutdown().await?;
        }
        Command::Rename { id, name } => {
            let planner = Planner::open(db, &settings)?;
            let patch = TaskPatch {
                name: Some(name),
                ..TaskPatch::default()
            };
            let result = check(planner.update_task(TaskId::from_raw(id), patch).await?)?;
            println!("{}", result.message);
            let _ = planner.shutdown().await?;
        }
        Command::Delete { id, cascade } => {
            let planner = Planner::open(db, &settings)?;
            let result = check(planner.delete_task(TaskId::from_raw(id), cascade).await?)?;
            println!("{}", result.message);
            let _ = planner.shutdown().await?;
        }
        Command::Import { file, source } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let tasks: Vec<Task> = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse tasks from {}", file.display()))?;
            let source = source.unwrap_or_else(|| {
                file.file_name()
                    .map_or_else(|| file.display().to_string(), |n| n.to_string_lossy().into_owned())
            });
            let planner = Planner::open(db, &settings)?;
            let count = planner.import_tasks(source, tasks).await?;
            let report = planner.shutdown().await?;
            println!("imported {count} task(s), {} event(s) written", report.persisted);
        }
        Command::Events { limit } => {
            let events = db.with_conn(|conn| EventLog::tail(conn, limit))?;
            for stored in events {
                println!(
                    "{}  {}  {:<16}  {}",
                    stored.event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    stored.id,
                    stored.event.event_type(),
                    stored.event.target_id
                );
            }
        }
        Command::Snapshot => {
            let planner = Planner::open(db, &settings)?;
            let record = {
                let store = planner.store().lock();
                planner
                    .snapshots()
                    .create_snapshot(store.tasks(), store.calendar())?
            };
            println!(
                "snapshot of {} task(s) at {}",
                record.tasks.len(),
                record.event_id.map_or_else(|| "empty log".to_string(), |id| id.to_string())
            );
        }
        Command::Rebuild => {
            let state = DataLoader::new(db).rebuild_from_log()?;
            println!("rebuilt {} task(s) from the log", state.tasks.len());
        }
    }
    Ok(())
}
