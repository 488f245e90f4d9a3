use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::application::{Application, InitBuilder};
use crate::callbacks::{ApprovalPayload, Decision, MergeResolution, SourceConflictDecision};
use crate::engine::RunOutcome;
use crate::types::{CreateObjectParams, HaltAction, ObjectListFilter, ObjectStatus, WorkflowObject};
use crate::workflows::ARTICLE_WORKFLOW;

#[derive(Parser)]
#[command(name = "holdingpen")]
#[command(about = "Holding pen - curation workflow orchestration for literature records", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Database URL (overrides config file and env vars)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Keep state in process memory instead of Postgres
    #[arg(long, global = true)]
    pub in_memory: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run database migrations
    Migrate,

    /// Create a workflow object from a JSON record and run it
    Start {
        /// Path to the record JSON
        file: String,

        /// Workflow to run
        #[arg(short = 'w', long = "workflow", default_value = ARTICLE_WORKFLOW)]
        workflow: String,
    },

    /// Get the status of a workflow object
    Status {
        /// Workflow object ID to query
        id: String,
    },

    /// List workflow objects
    List {
        /// Filter by status
        #[arg(short = 's', long = "status")]
        status: Option<String>,

        /// Filter by workflow name
        #[arg(short = 'w', long = "workflow")]
        workflow: Option<String>,

        /// Number of results (default: 20)
        #[arg(short = 'l', long = "limit", default_value = "20")]
        limit: i64,
    },

    /// Answer a pending approval (accept, accept_core or reject)
    Approve {
        /// Workflow object ID
        id: String,

        /// Decision
        decision: String,

        /// Reason recorded with the decision
        #[arg(long)]
        reason: Option<String>,
    },

    /// Submit the curated record for a merge approval
    ResolveMerge {
        /// Workflow object ID
        id: String,

        /// Path to the curated record JSON, or to {"data": ..., "extra_data": {...}, "conflicts": [...]}
        file: String,
    },

    /// Restart a workflow object from the beginning
    Restart {
        /// Workflow object ID
        id: String,
    },

    /// Stop an object halted on a source conflict in favour of the other one
    Stop {
        /// Workflow object ID
        id: String,
    },
}

/// Run the CLI by parsing process arguments
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli).await
}

/// Run the CLI with provided arguments
pub async fn run_cli_from_args(args: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(args);
    run_cli_with_args(cli).await
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).with_context(|| format!("Invalid workflow object ID: {}", id))
}

fn read_json(path: &str) -> Result<JsonValue> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {} as JSON", path))
}

async fn load_or_exit(app: &Application, id: Uuid) -> Result<WorkflowObject> {
    match app.engine.store().get(id).await? {
        Some(obj) => Ok(obj),
        None => {
            eprintln!("Workflow object {} not found", id);
            std::process::exit(1);
        }
    }
}

fn print_outcome(id: Uuid, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed => println!("Workflow object {} completed", id),
        RunOutcome::Stopped => println!("Workflow object {} stopped", id),
        RunOutcome::Suspended(s) => {
            println!("Workflow object {} is {} ({})", id, s.status, s.action);
            println!("  {}", s.message);
        }
    }
}

/// Internal function that handles CLI commands
async fn run_cli_with_args(cli: Cli) -> Result<()> {
    let mut builder = InitBuilder::new().in_memory(cli.in_memory);
    if let Some(config_path) = cli.config {
        builder = builder.config_path(config_path);
    }
    if let Some(database_url) = cli.database_url {
        builder = builder.database_url(database_url);
    }

    // Migrations only run when asked for.
    let migrate = matches!(cli.command, Commands::Migrate);
    let app = builder.auto_migrate(migrate).init().await?;
    init_tracing(&app.config().logging.level);

    match cli.command {
        Commands::Migrate => {
            if app.pool().is_none() {
                println!("Nothing to migrate in memory");
            } else {
                println!("Migrations complete!");
            }
        }

        Commands::Start { file, workflow } => {
            let data = read_json(&file)?;
            let (obj, outcome) = app
                .engine
                .start(CreateObjectParams {
                    workflow_name: workflow,
                    data,
                    ..Default::default()
                })
                .await?;
            println!("Created workflow object {}", obj.id);
            print_outcome(obj.id, &outcome);
        }

        Commands::Status { id } => {
            let obj = load_or_exit(&app, parse_id(&id)?).await?;
            println!("Workflow object: {}", obj.id);
            println!("Workflow: {}", obj.workflow_name);
            println!("Status: {}", obj.status_label());
            println!("Cursor: {:?}", obj.callback_pos);
            println!("Created: {}", obj.created_at);
            println!("Modified: {}", obj.modified_at);

            if let Some(source) = obj.source() {
                println!("Source: {}", source);
            }
            if let Some(cn) = obj.control_number() {
                println!("Control number: {}", cn);
            }
            if let Some(halt) = &obj.extra_data.halt {
                println!("\nAction: {}", halt.action);
                println!("  {}", halt.message);
            }
            if !obj.extra_data.holdingpen_matches.is_empty() {
                println!("\nBlocked by:");
                for blocker in &obj.extra_data.holdingpen_matches {
                    println!("  {}", blocker);
                }
            }
            if !obj.extra_data.validation_errors.is_empty() {
                println!("\nValidation errors:");
                for error in &obj.extra_data.validation_errors {
                    println!("  {}", error);
                }
            }
            if let Some(error) = &obj.extra_data.error_msg {
                println!("\nError:");
                println!("  {}", error);
            }
        }

        Commands::List {
            status,
            workflow,
            limit,
        } => {
            let status = status
                .map(|s| ObjectStatus::from_str(&s))
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let filter = ObjectListFilter {
                workflow_name: workflow,
                status,
                not_completed: false,
                limit: Some(limit),
            };
            let objects = app.engine.store().list(&filter).await?;

            if objects.is_empty() {
                println!("No workflow objects found");
            } else {
                println!("{:<38} {:<10} {:<40} {:<25}", "ID", "WORKFLOW", "STATUS", "MODIFIED");
                println!("{}", "-".repeat(113));
                for obj in objects {
                    println!(
                        "{:<38} {:<10} {:<40} {:<25}",
                        obj.id,
                        obj.workflow_name,
                        obj.status_label(),
                        obj.modified_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }

        Commands::Approve {
            id,
            decision,
            reason,
        } => {
            let id = parse_id(&id)?;
            let value = Decision::from_str(&decision)?;
            let obj = load_or_exit(&app, id).await?;
            let action = match obj.current_halt() {
                Some(
                    action @ (HaltAction::HepApproval
                    | HaltAction::CoreApproval
                    | HaltAction::CoreSelectionApproval),
                ) => action,
                _ => HaltAction::HepApproval,
            };

            let response = app
                .callbacks
                .resolve_approval(id, action, ApprovalPayload { value, reason })
                .await?;
            println!("Workflow object {} is {}", response.workflow_id, response.status);
            println!("  {}", response.message);
        }

        Commands::ResolveMerge { id, file } => {
            let id = parse_id(&id)?;
            let raw = read_json(&file)?;
            let resolution = match raw.get("data") {
                Some(data) if data.is_object() => serde_json::from_value::<MergeResolution>(raw)
                    .context("Failed to parse merge resolution")?,
                _ => MergeResolution {
                    data: raw,
                    extra_data: None,
                    conflicts: Vec::new(),
                },
            };

            let response = app.callbacks.resolve_merge_conflicts(id, resolution).await?;
            println!("Workflow object {} is {}", response.workflow_id, response.status);
            println!("  {}", response.message);
        }

        Commands::Restart { id } => {
            let mut obj = load_or_exit(&app, parse_id(&id)?).await?;
            println!("Restarting workflow object {} (was {})", obj.id, obj.status_label());
            let outcome = app.engine.restart(&mut obj).await?;
            print_outcome(obj.id, &outcome);
        }

        Commands::Stop { id } => {
            let id = parse_id(&id)?;
            let response = app
                .callbacks
                .resolve_source_conflict(id, SourceConflictDecision::Stop)
                .await?;
            println!("Workflow object {} is {}", response.workflow_id, response.status);
            println!("  {}", response.message);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_approve() {
        let cli = Cli::parse_from([
            "holdingpen",
            "--in-memory",
            "approve",
            "5b2e0a9e-3c4f-4d7e-9a61-0c2d7f1e8b3a",
            "accept_core",
            "--reason",
            "core paper",
        ]);
        assert!(cli.in_memory);
        match cli.command {
            Commands::Approve {
                decision, reason, ..
            } => {
                assert_eq!(decision, "accept_core");
                assert_eq!(reason.as_deref(), Some("core paper"));
            }
            _ => panic!("expected approve"),
        }
    }

    #[test]
    fn test_parse_list_defaults() {
        let cli = Cli::parse_from(["holdingpen", "list", "--status", "halted"]);
        match cli.command {
            Commands::List { status, workflow, limit } => {
                assert_eq!(status.as_deref(), Some("halted"));
                assert!(workflow.is_none());
                assert_eq!(limit, 20);
            }
            _ => panic!("expected list"),
        }
    }

    #[test]
    fn test_invalid_id_is_reported() {
        let err = parse_id("not-a-uuid").unwrap_err();
        assert!(err.to_string().contains("not-a-uuid"));
    }
}
