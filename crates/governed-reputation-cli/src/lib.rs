//! Command surface for the governed agent reputation ledger.
//!
//! Hosts embed the ledger through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteReputationStore`].
//! - [`run_self_report`] for the single-purpose `self-report` binary agents call.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use governed_reputation_core::{policy_table, ReputationError, TaskContract, TaskReport};
use governed_reputation_store_sqlite::SqliteReputationStore;
use tracing::debug;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_DB_PATH: &str = "./reputation.sqlite3";
pub const DB_ENV_VAR: &str = "REPUTATION_DB";
pub const LOG_ENV_VAR: &str = "REPUTATION_LOG";
pub const DEFAULT_REPORTER: &str = "self-report";

const EXIT_FAILURE: u8 = 1;
const EXIT_VALIDATION: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "reputation")]
#[command(about = "Governed agent reputation ledger")]
pub struct Cli {
    #[arg(long, global = true, env = DB_ENV_VAR, default_value = DEFAULT_DB_PATH)]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

/// Entry point handed to sub-agents: exactly the five report fields.
#[derive(Debug, Parser)]
#[command(name = "self-report")]
#[command(about = "Report a governed task outcome to the reputation ledger")]
pub struct SelfReportCli {
    #[arg(long, env = DB_ENV_VAR, default_value = DEFAULT_DB_PATH)]
    db: PathBuf,

    #[command(flatten)]
    report: ReportArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the ledger schema if it does not exist.
    Init,
    /// Record one task outcome.
    Report(ReportArgs),
    /// Show an agent's most recent outcomes, newest first.
    History(HistoryArgs),
    /// Show every outcome reported for a task id.
    Task(TaskArgs),
    /// Show aggregate statistics for an agent.
    Stats(StatsArgs),
    /// Print the status to score policy.
    Policy,
    /// Mint a task id and print the instructions for a sub-agent.
    Contract(ContractArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ReportArgs {
    #[arg(long, allow_hyphen_values = true)]
    task_id: String,
    #[arg(long, allow_hyphen_values = true)]
    agent_id: String,
    #[arg(long, allow_hyphen_values = true)]
    objective: String,
    #[arg(long, allow_hyphen_values = true)]
    status: String,
    #[arg(long, allow_hyphen_values = true)]
    details: String,
}

impl From<ReportArgs> for TaskReport {
    fn from(args: ReportArgs) -> Self {
        Self {
            task_id: args.task_id,
            agent_id: args.agent_id,
            objective: args.objective,
            status: args.status,
            details: args.details,
        }
    }
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long)]
    agent_id: String,
    #[arg(long, default_value_t = 10)]
    limit: usize,
    /// Keep only rows for this task id.
    #[arg(long)]
    task_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct TaskArgs {
    #[arg(long)]
    task_id: String,
}

#[derive(Debug, Args)]
pub struct StatsArgs {
    #[arg(long)]
    agent_id: String,
}

#[derive(Debug, Args)]
pub struct ContractArgs {
    #[arg(long, allow_hyphen_values = true)]
    objective: String,
    #[arg(long)]
    model: String,
    #[arg(long = "criterion")]
    criteria: Vec<String>,
    #[arg(long = "file")]
    files: Vec<String>,
    /// Command the sub-agent runs to report back.
    #[arg(long, default_value = DEFAULT_REPORTER)]
    reporter: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, serde::Serialize)]
struct ContractPayload<'a> {
    contract: &'a TaskContract,
    agent_id: String,
    instructions: String,
}

/// Installs the stderr log subscriber, filtered by `REPUTATION_LOG`.
///
/// Defaults to `warn` so stdout carries only command output.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open, initialization, or command execution
/// fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_command_with_db(&cli.db, cli.command)
}

/// Executes a command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/init fails or the requested command fails.
pub fn run_command_with_db(db_path: &Path, command: Command) -> Result<()> {
    match command {
        Command::Policy => run_policy(),
        Command::Contract(args) => run_contract(args),
        store_command => {
            let mut store = open_store(db_path)?;
            run_command(store_command, &mut store)
        }
    }
}

/// Executes a command against an existing store handle.
///
/// # Errors
/// Returns an error when validation, persistence, or retrieval fails.
pub fn run_command(command: Command, store: &mut SqliteReputationStore) -> Result<()> {
    match command {
        Command::Init => {
            store.init()?;
            print_json(&serde_json::json!({ "initialized": true }))
        }
        Command::Report(args) => {
            let outcome = store.record_report(&args.into())?;
            print_json(&outcome)
        }
        Command::History(args) => {
            let mut history = store.get_task_history(&args.agent_id, args.limit)?;
            if let Some(task_id) = args.task_id.as_deref() {
                history.retain(|item| item.task_id == task_id);
            }
            print_json(&history)
        }
        Command::Task(args) => {
            let outcomes = store.get_task(&args.task_id)?;
            print_json(&outcomes)
        }
        Command::Stats(args) => {
            let stats = store.get_agent_stats(&args.agent_id)?;
            print_json(&stats)
        }
        Command::Policy => run_policy(),
        Command::Contract(args) => run_contract(args),
    }
}

/// Records one report from the `self-report` binary.
///
/// # Errors
/// Returns an error when the report is invalid or cannot be persisted.
pub fn run_self_report(cli: SelfReportCli) -> Result<()> {
    let mut store = open_store(&cli.db)?;
    let outcome = store.record_report(&cli.report.into())?;
    print_json(&outcome)
}

/// Maps a command failure to the process exit code.
///
/// Validation failures exit with `2`, matching clap's usage errors.
/// Persistence failures and anything unclassified exit with `1`.
#[must_use]
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<ReputationError>() {
        Some(ReputationError::Validation(_)) => EXIT_VALIDATION,
        Some(ReputationError::Persistence(_)) | None => EXIT_FAILURE,
    }
}

/// Prints a failure to stderr and returns the matching exit code.
#[must_use]
pub fn report_failure(err: &anyhow::Error) -> ExitCode {
    let code = exit_code_for(err);
    debug!(exit_code = code, "command failed");
    eprintln!("error: {err:#}");
    ExitCode::from(code)
}

fn open_store(db_path: &Path) -> Result<SqliteReputationStore> {
    let store = SqliteReputationStore::open(db_path)?;
    store
        .init()
        .with_context(|| format!("failed to initialize ledger at {}", db_path.display()))?;
    debug!(db = %db_path.display(), "reputation store ready");
    Ok(store)
}

fn run_policy() -> Result<()> {
    print_json(&policy_table())
}

fn run_contract(args: ContractArgs) -> Result<()> {
    let contract = TaskContract::for_task(&args.objective, &args.model, args.criteria, args.files)?;
    let instructions = contract.report_instructions(&args.reporter);

    if args.json {
        return print_json(&ContractPayload {
            contract: &contract,
            agent_id: contract.agent_id(),
            instructions,
        });
    }

    write_output(std::io::stdout().lock(), &instructions)
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    let mut rendered = serde_json::to_string_pretty(value)?;
    rendered.push('\n');
    write_output(std::io::stdout().lock(), &rendered)
}

/// Writes command output after the command has taken effect; a closed reader
/// (`BrokenPipe`) is not reported as a failure.
fn write_output(mut out: impl Write, text: &str) -> Result<()> {
    match out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
        Err(err) if err.kind() != ErrorKind::BrokenPipe => {
            Err(err).context("failed to write command output")
        }
        _ => Ok(()),
    }
}
