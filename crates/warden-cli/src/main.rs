//! `warden-cli` – the `warden` command line.
//!
//! 1. Loads `~/.warden/config.toml` (defaults plus `WARDEN_*` overrides
//!    when absent).
//! 2. Wires the shipped capabilities into a [`PluginRegistry`]: the
//!    OpenAI-compatible [`LlmDriver`], [`LlmPlanner`], [`DefaultContext`],
//!    [`SqliteMemoryStore`] and the built-in file tools.
//! 3. Runs or resumes a Task with the console answering human requests.
//! 4. Intercepts **Ctrl-C** to cancel the run; the Task is checkpointed and
//!    `warden resume <id>` picks it up again.

mod builtin_tools;
mod config;
mod console;

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use warden_memory::{SqliteMemoryStore, SqliteTaskStore};
use warden_runtime::{
    ContextCapability, DefaultContext, LlmCapability, LlmDriver, LlmPlanner, MemoryCapability,
    Orchestrator, PlanningCapability, PluginRegistry, RunOutcome, TaskStore, ToolCapability,
    init_tracing,
};
use warden_types::{StepStatus, Task, TaskStatus, WardenError};

use crate::builtin_tools::BuiltinTools;
use crate::config::Config;

#[derive(Parser)]
#[command(name = "warden", version, about = "Run LLM agent tasks behind a safety kernel")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a task for GOAL and run it.
    Run {
        goal: String,
        /// Extra detail shown to the model alongside the goal.
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Continue a paused or interrupted task from its checkpoint.
    Resume { task_id: Uuid },
    /// List tasks, most recently updated first.
    List,
    /// Show the step log of a task.
    Steps { task_id: Uuid },
    /// Show the effective configuration.
    Config {
        /// Write a default config file if none exists.
        #[arg(long)]
        init: bool,
    },
    /// List long-term memories.
    Memories {
        /// Delete the memory with this id instead.
        #[arg(long)]
        forget: Option<Uuid>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _telemetry = init_tracing("warden");

    match dispatch(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Command) -> Result<(), String> {
    if let Command::Config { init } = command {
        return cmd_config(init);
    }
    let cfg = config::load_or_default()?;
    match command {
        Command::Run { goal, description } => cmd_run(&cfg, &goal, &description).await,
        Command::Resume { task_id } => run_task(&cfg, open_tasks(&cfg)?, task_id).await,
        Command::List => cmd_list(&cfg),
        Command::Steps { task_id } => cmd_steps(&cfg, task_id),
        Command::Memories { forget } => cmd_memories(&cfg, forget),
        Command::Config { .. } => Ok(()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Running tasks
// ─────────────────────────────────────────────────────────────────────────────

fn open_tasks(cfg: &Config) -> Result<Arc<SqliteTaskStore>, String> {
    ensure_parent(&cfg.db_path)?;
    SqliteTaskStore::open(&cfg.db_path)
        .map(Arc::new)
        .map_err(|e| format!("cannot open {}: {e}", cfg.db_path.display()))
}

fn open_memory(cfg: &Config) -> Result<SqliteMemoryStore, String> {
    ensure_parent(&cfg.db_path)?;
    SqliteMemoryStore::open(&cfg.db_path).map_err(|e| format!("cannot open {}: {e}", cfg.db_path.display()))
}

fn ensure_parent(path: &std::path::Path) -> Result<(), String> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create {}: {e}", parent.display())),
        None => Ok(()),
    }
}

fn build_registry(cfg: &Config) -> Result<PluginRegistry, String> {
    let llm: Arc<dyn LlmCapability> = Arc::new(
        LlmDriver::new(&cfg.base_url, &cfg.model)
            .with_api_key(cfg.api_key.clone())
            .with_rate_limit(cfg.requests_per_minute),
    );
    let mut registry = PluginRegistry::new();
    registry.register::<dyn PlanningCapability>(Arc::new(LlmPlanner::new(llm.clone())));
    registry.register::<dyn LlmCapability>(llm);
    registry.register::<dyn ContextCapability>(Arc::new(DefaultContext::new(cfg.runtime.context.clone())));
    registry.register::<dyn MemoryCapability>(Arc::new(open_memory(cfg)?));
    registry.register::<dyn ToolCapability>(Arc::new(BuiltinTools::new()));
    Ok(registry)
}

async fn cmd_run(cfg: &Config, goal: &str, description: &str) -> Result<(), String> {
    let store = open_tasks(cfg)?;
    let task = Task::new(goal, description);
    store.save_task(&task).map_err(|e| e.to_string())?;
    println!("  {} {}", "task".bold(), task.id.to_string().cyan());
    run_task(cfg, store, task.id).await
}

async fn run_task(cfg: &Config, store: Arc<SqliteTaskStore>, task_id: Uuid) -> Result<(), String> {
    let registry = Arc::new(build_registry(cfg)?);
    let mut orchestrator = Orchestrator::new(cfg.runtime.clone(), registry, store);

    let cancel = CancellationToken::new();
    let on_ctrlc = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – checkpointing the task …".yellow().bold());
        on_ctrlc.cancel();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; the run cannot be interrupted cleanly");
    }

    println!("  model {} at {}", cfg.model.bold(), cfg.base_url.dimmed());
    let console = console::spawn(orchestrator.subscribe(), orchestrator.responder());
    let outcome = orchestrator.run(task_id, cancel.clone()).await;

    // Closing the bus ends the console once it has drained.
    drop(orchestrator);
    if cancel.is_cancelled() {
        console.abort();
    } else {
        let _ = console.await;
    }

    let resume_hint = format!("warden resume {task_id}");
    match outcome {
        Ok(RunOutcome::Completed) => println!("\n  {}", "Task completed.".green().bold()),
        Ok(RunOutcome::Aborted) => println!("\n  {}", "Task aborted.".yellow().bold()),
        Ok(RunOutcome::Paused(reason)) => println!(
            "\n  {} ({reason}). Continue with `{}`.",
            "Task paused".yellow().bold(),
            resume_hint.bold()
        ),
        Err(WardenError::Cancelled) => println!(
            "\n  {} Continue with `{}`.",
            "Run interrupted.".yellow().bold(),
            resume_hint.bold()
        ),
        Err(e) => return Err(e.to_string()),
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Inspection commands
// ─────────────────────────────────────────────────────────────────────────────

fn colored_status(status: TaskStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        TaskStatus::Completed => text.green(),
        TaskStatus::Running | TaskStatus::Created => text.cyan(),
        TaskStatus::Paused => text.yellow(),
        TaskStatus::Aborted | TaskStatus::Failed => text.red(),
    }
}

fn cmd_list(cfg: &Config) -> Result<(), String> {
    let tasks = open_tasks(cfg)?.list_tasks().map_err(|e| e.to_string())?;
    if tasks.is_empty() {
        println!("  No tasks yet. Start one with `{}`.", "warden run <goal>".bold());
        return Ok(());
    }
    for task in tasks {
        let paused_at = task
            .state
            .checkpoint
            .as_ref()
            .map(|cp| format!(" (checkpoint: {} at step {})", cp.reason, cp.paused_at_step))
            .unwrap_or_default();
        println!(
            "  {}  {:<10} {:>3} steps  {}  {}{}",
            task.id.to_string().cyan(),
            colored_status(task.status),
            task.state.step_count,
            task.updated_at.format("%Y-%m-%d %H:%M").to_string().dimmed(),
            task.goal,
            paused_at.dimmed()
        );
    }
    Ok(())
}

fn cmd_steps(cfg: &Config, task_id: Uuid) -> Result<(), String> {
    let store = open_tasks(cfg)?;
    let task = store.load_task(task_id).map_err(|e| e.to_string())?;
    println!("  {} {}", task.goal.bold(), colored_status(task.status));
    for step in store.steps(task_id).map_err(|e| e.to_string())? {
        let status = match step.status {
            StepStatus::Completed => step.status.to_string().green(),
            StepStatus::Failed => step.status.to_string().red(),
            _ => step.status.to_string().yellow(),
        };
        println!("  {:>3}. {} {}", step.sequence, step.title, format!("[{status}]").dimmed());
        for outcome in &step.tool_results {
            println!("       {} {}", outcome.tool.cyan(), outcome.summary);
        }
        if let Some(decision) = &step.human_decision {
            let input = step.human_input.as_deref().unwrap_or("");
            println!("       {} {} {}", "operator:".yellow(), decision, input);
        }
        if let Some(reason) = &step.failure_reason {
            println!("       {} {}", "failed:".red(), reason);
        }
    }
    Ok(())
}

fn cmd_memories(cfg: &Config, forget: Option<Uuid>) -> Result<(), String> {
    let memory = open_memory(cfg)?;
    if let Some(id) = forget {
        return match memory.delete(id).map_err(|e| e.to_string())? {
            true => {
                println!("  {} forgot {id}", "✓".green());
                Ok(())
            }
            false => Err(format!("no memory with id {id}")),
        };
    }
    let entries = memory.all_entries().map_err(|e| e.to_string())?;
    if entries.is_empty() {
        println!("  No memories yet.");
    }
    for entry in entries {
        println!(
            "  {}  {}  {} {}",
            entry.id.to_string().dimmed(),
            entry.timestamp.format("%Y-%m-%d").to_string().dimmed(),
            format!("[{}]", entry.category).cyan(),
            entry.content
        );
    }
    Ok(())
}

fn cmd_config(init: bool) -> Result<(), String> {
    let path = config::config_path();
    if init {
        if config::load()?.is_some() {
            println!("  Config already exists at {}", path.display().to_string().bold());
        } else {
            config::save(&Config::default())?;
            println!("  {} Config written to {}", "✓".green().bold(), path.display().to_string().bold());
        }
    }
    let cfg = config::load_or_default()?;
    println!("  {} {}", "source:".dimmed(), path.display());
    println!("{cfg:#?}");
    Ok(())
}
