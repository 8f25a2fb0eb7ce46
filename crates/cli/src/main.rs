//! Portline CLI - coordination for concurrent coding agents.
//!
//! Every command prints JSON on stdout. Logs go to stderr, filtered by
//! `PORTLINE_LOG` (default `warn`).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use portline_core::{
    Config, EscalationId, EscalationKind, EscalationStatus, LoopId, NewEscalation,
    NewFeedbackLoop, Severity, UnitStatus, VerificationResult, WorkerContext,
};
use portline_escalation::{EscalationService, TriggerEngine};
use portline_execution::{LockManager, PipelineService, UnitPlacement};
use portline_feedback::{FeedbackController, FeedbackError, StorageRelay};
use portline_storage::{SqliteStorage, Storage};
use serde::Serialize;
use serde_json::json;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "portline")]
#[command(about = "Coordinate work units, resource locks and escalations across agents", long_about = None)]
struct Cli {
    /// Directory holding the coordination database and config.json
    #[arg(long, global = true, default_value = ".portline")]
    storage: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execution plans and their units
    #[command(subcommand)]
    Pipeline(PipelineCommand),
    /// Work units and their global status
    #[command(subcommand)]
    Unit(UnitCommand),
    /// Resource locks
    #[command(subcommand)]
    Lock(LockCommand),
    /// Escalation records and trigger checks
    #[command(subcommand)]
    Escalation(EscalationCommand),
    /// Implementer/verifier feedback loops
    #[command(subcommand)]
    Feedback(FeedbackCommand),
    /// Messages relayed on a channel
    Messages {
        /// Channel ID
        channel: String,
    },
    /// Configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum PipelineCommand {
    /// Create a pipeline
    Create {
        /// Pipeline ID
        id: String,
        /// Display name
        #[arg(long, default_value = "")]
        name: String,
    },
    /// List pipelines
    List,
    /// Show a pipeline with its members
    Show {
        /// Pipeline ID
        id: String,
    },
    /// Delete a pipeline
    Delete {
        /// Pipeline ID
        id: String,
    },
    /// Cancel a pipeline
    Cancel {
        /// Pipeline ID
        id: String,
    },
    /// Completion counts
    Progress {
        /// Pipeline ID
        id: String,
    },
    /// Pending units whose dependencies are complete
    Ready {
        /// Pipeline ID
        id: String,
    },
    /// Check whether a unit may start
    CanRun {
        /// Pipeline ID
        id: String,
        /// Unit ID
        unit: String,
    },
    /// Add a unit to a pipeline
    AddUnit {
        /// Pipeline ID
        id: String,
        /// Unit ID
        unit: String,
        /// Execution wave
        #[arg(long, default_value = "0")]
        group: i64,
        /// Prerequisite units
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<String>,
    },
    /// Remove a unit from a pipeline
    RemoveUnit {
        /// Pipeline ID
        id: String,
        /// Unit ID
        unit: String,
    },
    /// Claim a ready unit
    Claim {
        /// Pipeline ID
        id: String,
        /// Unit ID
        unit: String,
    },
    /// Report a unit's status
    Report {
        /// Pipeline ID
        id: String,
        /// Unit ID
        unit: String,
        /// New status (complete, failed, skipped, cancelled); use claim to start
        status: UnitStatus,
    },
}

#[derive(Subcommand)]
enum UnitCommand {
    /// List every unit
    List,
    /// Show a unit with its prerequisites
    Show {
        /// Unit ID
        id: String,
    },
}

#[derive(Subcommand)]
enum LockCommand {
    /// Acquire one or more resources
    Acquire {
        /// Holder identity
        #[arg(long)]
        holder: String,
        /// Resources
        #[arg(required = true)]
        resources: Vec<String>,
    },
    /// Release resources
    Release {
        /// Resources
        #[arg(required = true)]
        resources: Vec<String>,
    },
    /// List held locks
    List,
    /// Release every lock
    Clear,
    /// Release every lock held by one holder
    ReleaseHolder {
        /// Holder identity
        holder: String,
    },
}

#[derive(Subcommand)]
enum EscalationCommand {
    /// Raise an escalation by hand
    Create {
        /// What went wrong
        #[arg(long)]
        issue: String,
        /// What a human could do about it
        #[arg(long, default_value = "")]
        suggestion: String,
        /// Escalation kind
        #[arg(long, default_value = "manual")]
        kind: String,
        /// Severity
        #[arg(long, default_value = "medium")]
        severity: Severity,
        /// Originating identity
        #[arg(long)]
        origin: Option<String>,
        /// Related unit
        #[arg(long)]
        unit: Option<String>,
    },
    /// List escalations
    List {
        /// Only this status
        #[arg(long)]
        status: Option<EscalationStatus>,
    },
    /// Show an escalation
    Show {
        /// Escalation ID
        id: EscalationId,
    },
    /// Mark an escalation resolved
    Resolve {
        /// Escalation ID
        id: EscalationId,
    },
    /// Dismiss an escalation
    Dismiss {
        /// Escalation ID
        id: EscalationId,
    },
    /// Evaluate triggers against a worker snapshot (JSON, or stdin)
    Check {
        /// Worker context JSON
        #[arg(long)]
        context: Option<String>,
    },
}

#[derive(Subcommand)]
enum FeedbackCommand {
    /// Open a feedback loop
    Create {
        /// Channel ID
        channel: String,
        /// Implementer identity
        #[arg(long)]
        implementer: String,
        /// Verifier identity
        #[arg(long)]
        verifier: String,
        /// Related unit
        #[arg(long)]
        unit: Option<String>,
        /// Retry bound
        #[arg(long, allow_negative_numbers = true)]
        max_retries: Option<i64>,
    },
    /// Show a loop
    Show {
        /// Loop ID
        id: LoopId,
    },
    /// Most recent loop on a channel
    Channel {
        /// Channel ID
        channel: String,
    },
    /// Running loop for a unit
    Unit {
        /// Unit ID
        unit: String,
    },
    /// Submit a verification result (JSON, or stdin)
    Verify {
        /// Loop ID
        id: LoopId,
        /// Verification result JSON
        #[arg(long)]
        result: Option<String>,
    },
    /// Mark a loop failed
    Fail {
        /// Loop ID
        id: LoopId,
    },
    /// List running loops
    Active,
    /// Aggregate statistics
    Stats,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Write the effective configuration to config.json
    Init,
}

/// Handles shared by every command.
struct App {
    config: Config,
    storage: SqliteStorage,
    shared: Arc<dyn Storage>,
}

impl App {
    async fn open(storage_dir: PathBuf) -> Result<Self> {
        let config = Config::load(&storage_dir)
            .with_context(|| format!("loading config from {}", storage_dir.display()))?;
        let storage = SqliteStorage::open(&config.database_path())
            .await
            .with_context(|| format!("opening {}", config.database_path().display()))?;
        debug!("Using database {}", config.database_path().display());

        Ok(Self {
            shared: Arc::new(storage.clone()),
            storage,
            config,
        })
    }

    fn triggers(&self) -> TriggerEngine {
        TriggerEngine::with_defaults(&self.config.triggers)
    }

    fn pipelines(&self) -> PipelineService<SqliteStorage> {
        PipelineService::new(self.storage.clone())
    }

    fn locks(&self) -> LockManager<SqliteStorage> {
        LockManager::new(self.storage.clone())
    }

    fn escalations(&self) -> EscalationService {
        EscalationService::new(self.shared.clone(), self.triggers())
    }

    fn feedback(&self) -> FeedbackController {
        let relay = Arc::new(StorageRelay::new(self.shared.clone()));
        FeedbackController::new(self.shared.clone(), relay)
            .with_triggers(self.triggers())
            .with_default_max_retries(self.config.default_max_retries)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_env("PORTLINE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Config(command) = &cli.command {
        return run_config(command, &cli.storage);
    }

    let app = App::open(cli.storage).await?;
    match cli.command {
        Commands::Pipeline(command) => run_pipeline(&app, command).await,
        Commands::Unit(command) => run_unit(&app, command).await,
        Commands::Lock(command) => run_lock(&app, command).await,
        Commands::Escalation(command) => run_escalation(&app, command).await,
        Commands::Feedback(command) => run_feedback(&app, command).await,
        Commands::Messages { channel } => {
            print_json(&app.storage.list_messages(&channel).await?)
        }
        Commands::Config(_) => Ok(()),
    }
}

fn run_config(command: &ConfigCommand, storage_dir: &Path) -> Result<()> {
    let config = Config::load(storage_dir)?;
    match command {
        ConfigCommand::Show => print_json(&config),
        ConfigCommand::Init => {
            config.save()?;
            print_json(&config)
        }
    }
}

async fn run_pipeline(app: &App, command: PipelineCommand) -> Result<()> {
    let pipelines = app.pipelines();

    match command {
        PipelineCommand::Create { id, name } => print_json(&pipelines.create(&id, &name).await?),
        PipelineCommand::List => print_json(&pipelines.list().await?),
        PipelineCommand::Show { id } => print_json(&pipelines.show(&id).await?),
        PipelineCommand::Delete { id } => {
            pipelines.delete(&id).await?;
            print_json(&json!({ "deleted": id }))
        }
        PipelineCommand::Cancel { id } => print_json(&pipelines.cancel(&id).await?),
        PipelineCommand::Progress { id } => {
            let progress = pipelines.progress(&id).await?;
            print_json(&json!({
                "progress": progress,
                "percentage": progress.percentage(),
            }))
        }
        PipelineCommand::Ready { id } => print_json(&pipelines.ready_units(&id).await?),
        PipelineCommand::CanRun { id, unit } => {
            let resolution = pipelines.can_run(&id, &unit).await?;
            print_json(&json!({
                "pipeline_id": id,
                "unit_id": unit,
                "eligible": resolution.is_ready(),
                "blocking": resolution.blocking(),
            }))
        }
        PipelineCommand::AddUnit {
            id,
            unit,
            group,
            depends_on,
        } => {
            let placement = UnitPlacement::new(group).with_dependencies(depends_on);
            print_json(&pipelines.add_unit(&id, &unit, placement).await?)
        }
        PipelineCommand::RemoveUnit { id, unit } => {
            pipelines.remove_unit(&id, &unit).await?;
            print_json(&json!({ "pipeline_id": id, "removed": unit }))
        }
        PipelineCommand::Claim { id, unit } => print_json(&pipelines.claim(&id, &unit).await?),
        PipelineCommand::Report { id, unit, status } => {
            print_json(&pipelines.report(&id, &unit, status).await?)
        }
    }
}

async fn run_unit(app: &App, command: UnitCommand) -> Result<()> {
    let pipelines = app.pipelines();

    match command {
        UnitCommand::List => print_json(&pipelines.units().await?),
        UnitCommand::Show { id } => print_json(&pipelines.unit(&id).await?),
    }
}

async fn run_lock(app: &App, command: LockCommand) -> Result<()> {
    let locks = app.locks();

    match command {
        LockCommand::Acquire { holder, resources } => {
            if let [resource] = resources.as_slice() {
                print_json(&locks.acquire(resource, &holder).await?)
            } else {
                print_json(&locks.acquire_all(&resources, &holder).await?)
            }
        }
        LockCommand::Release { resources } => {
            let mut released = Vec::new();
            for resource in resources {
                if locks.release(&resource).await? {
                    released.push(resource);
                }
            }
            print_json(&json!({ "released": released }))
        }
        LockCommand::List => print_json(&locks.list().await?),
        LockCommand::Clear => print_json(&json!({ "cleared": locks.clear().await? })),
        LockCommand::ReleaseHolder { holder } => print_json(&locks.release_holder(&holder).await?),
    }
}

async fn run_escalation(app: &App, command: EscalationCommand) -> Result<()> {
    let escalations = app.escalations();

    match command {
        EscalationCommand::Create {
            issue,
            suggestion,
            kind,
            severity,
            origin,
            unit,
        } => {
            let new = NewEscalation {
                origin,
                unit_id: unit,
                kind: EscalationKind::from(kind),
                severity,
                issue,
                suggestion,
                auto_resolve: false,
            };
            print_json(&escalations.create(new).await?)
        }
        EscalationCommand::List { status } => print_json(&escalations.list(status).await?),
        EscalationCommand::Show { id } => print_json(&escalations.show(id).await?),
        EscalationCommand::Resolve { id } => print_json(&escalations.resolve(id).await?),
        EscalationCommand::Dismiss { id } => print_json(&escalations.dismiss(id).await?),
        EscalationCommand::Check { context } => {
            let ctx: WorkerContext = serde_json::from_str(&read_input(context)?)
                .context("parsing worker context")?;
            let severity = escalations.engine().evaluate_severity(&ctx);
            let raised = escalations.raise(&ctx).await?;
            print_json(&json!({
                "severity": severity,
                "fired": raised.fired,
                "persisted": raised.persisted,
            }))
        }
    }
}

async fn run_feedback(app: &App, command: FeedbackCommand) -> Result<()> {
    let feedback = app.feedback();

    match command {
        FeedbackCommand::Create {
            channel,
            implementer,
            verifier,
            unit,
            max_retries,
        } => {
            let request = NewFeedbackLoop {
                channel_id: channel,
                implementer,
                verifier,
                unit_id: unit,
                max_retries,
            };
            print_json(&feedback.create(request).await?)
        }
        FeedbackCommand::Show { id } => print_json(&feedback.get(id).await?),
        FeedbackCommand::Channel { channel } => print_json(&feedback.get_by_channel(&channel).await?),
        FeedbackCommand::Unit { unit } => print_json(&feedback.get_active_for_unit(&unit).await?),
        FeedbackCommand::Verify { id, result } => {
            let result: VerificationResult = serde_json::from_str(&read_input(result)?)
                .context("parsing verification result")?;

            match feedback.process_verification_result(id, result).await {
                Ok(record) => print_json(&record),
                Err(FeedbackError::ExhaustedRetries {
                    loop_id,
                    current_retry,
                    max_retries,
                    record,
                }) => {
                    let escalated = escalate_exhausted(app, loop_id, &record.escalations).await?;
                    print_json(&json!({
                        "status": "escalated",
                        "record": record,
                        "escalations": escalated,
                    }))?;
                    bail!(
                        "feedback loop {} exhausted its retries ({}/{})",
                        loop_id,
                        current_retry,
                        max_retries
                    )
                }
                Err(e) => Err(e.into()),
            }
        }
        FeedbackCommand::Fail { id } => print_json(&feedback.fail(id).await?),
        FeedbackCommand::Active => print_json(&feedback.list_active().await?),
        FeedbackCommand::Stats => print_json(&feedback.stats().await?),
    }
}

/// Turn an exhausted loop into stored escalations.
///
/// Uses the escalations fired by the result's worker snapshot when there
/// are any, otherwise evaluates a snapshot built from the loop itself.
async fn escalate_exhausted(
    app: &App,
    loop_id: LoopId,
    fired: &[NewEscalation],
) -> Result<Vec<portline_core::Escalation>> {
    let escalations = app.escalations();

    if fired.iter().any(|e| !e.auto_resolve) {
        return Ok(escalations.record(fired).await?);
    }

    let feedback_loop = app.feedback().get(loop_id).await?;
    let mut ctx = WorkerContext::new()
        .with_worker(feedback_loop.implementer.clone())
        .with_retries(feedback_loop.current_retry, feedback_loop.max_retries);
    ctx.unit_id = feedback_loop.unit_id.clone();

    let raised = escalations.raise(&ctx).await?;
    warn!(
        "Feedback loop {} escalated with {} records",
        loop_id,
        raised.persisted.len()
    );
    Ok(raised.persisted)
}

/// Use `arg` when given, otherwise read all of stdin.
fn read_input(arg: Option<String>) -> Result<String> {
    match arg {
        Some(raw) => Ok(raw),
        None => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("reading stdin")?;
            Ok(raw)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
