//! warden CLI: thin shell over the library.
//!
//! Subcommands cover the plan lifecycle (propose, approve, reject, execute,
//! status) and port inspection. All state lives under the data directory as
//! file-per-record JSON, so commands compose across invocations.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use warden::{
    ApprovalGate, Endorsement, FileCheckpointStore, FilePlanStore, HttpOracle, LogSink,
    PlanExecutor, PlanStore, PortResourceManager, Rejection, Role, WardenConfig, WardenResult,
};

#[derive(Parser)]
#[command(name = "warden", about = "Action execution core: gated, checkpointed, self-healing")]
struct Cli {
    /// Path to a TOML config file; defaults apply when omitted.
    #[arg(long, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for plan and checkpoint records.
    #[arg(long, env = "WARDEN_DATA_DIR", default_value = ".warden")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a prompt to the oracle and persist the proposed plan.
    Propose {
        prompt: String,
        #[arg(long, default_value = "")]
        context: String,
    },
    /// Endorse a pending plan.
    Approve {
        plan_id: String,
        #[arg(long)]
        approver: String,
        #[arg(long, value_parser = parse_role, default_value = "member")]
        role: Role,
    },
    /// Reject a pending plan.
    Reject {
        plan_id: String,
        #[arg(long)]
        approver: String,
        #[arg(long)]
        reason: String,
    },
    /// Execute an approved plan's actions.
    Execute {
        plan_id: String,
        /// Action indices to run; all actions when omitted.
        #[arg(long, value_delimiter = ',')]
        indices: Option<Vec<usize>>,
    },
    /// Show one plan, or all plans.
    Status { plan_id: Option<String> },
    /// Port inspection and conflict resolution.
    Ports {
        #[command(subcommand)]
        command: PortsCommand,
    },
}

#[derive(Subcommand)]
enum PortsCommand {
    /// Probe a port and report its owner when busy.
    Check { port: u16 },
    /// Terminate whatever listens on the port (explicit confirmation).
    Free {
        port: u16,
        #[arg(long)]
        confirm: bool,
    },
}

fn parse_role(s: &str) -> Result<Role, String> {
    match s {
        "member" => Ok(Role::Member),
        "team_lead" => Ok(Role::TeamLead),
        "security" => Ok(Role::Security),
        "admin" => Ok(Role::Admin),
        other => Err(format!(
            "unknown role '{}'; expected member|team_lead|security|admin",
            other
        )),
    }
}

#[tokio::main]
async fn main() -> WardenResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("warden=info".parse().unwrap()),
        )
        .with_ansi(false)
        .init();
    let _ = tracing_log::LogTracer::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => WardenConfig::from_file(path)?,
        None => WardenConfig::from_env()?,
    };

    let plans = Arc::new(FilePlanStore::open(cli.data_dir.join("plans")).await?);
    let checkpoints = Arc::new(FileCheckpointStore::open(cli.data_dir.join("checkpoints")).await?);

    // Startup sweeps: expire overdue plans, recover interrupted executions.
    let expired = plans.check_expirations().await?;
    if !expired.is_empty() {
        info!("expired {} overdue plan(s)", expired.len());
    }
    let recovered = plans.recover_interrupted().await?;
    if !recovered.is_empty() {
        info!("recovered {} interrupted plan(s) back to approved", recovered.len());
    }

    let gate = ApprovalGate::new(plans.clone(), config.approval.plan_ttl_hours);
    let mut executor = PlanExecutor::new(&config, plans.clone(), checkpoints)?;
    executor.add_sink(Arc::new(LogSink));

    match cli.command {
        Command::Propose { prompt, context } => {
            let oracle = HttpOracle::new(config.oracle.clone())?;
            let (message, plan) = executor.propose(&oracle, &gate, &prompt, &context).await?;
            println!("{}", message);
            println!(
                "plan {} ({} action(s), tier {}, status {})",
                plan.id,
                plan.actions.len(),
                plan.required_approval,
                plan.status
            );
            for (i, action) in plan.actions.iter().enumerate() {
                println!("  [{}] {} (risk {:?})", i, action.kind, action.risk_level);
            }
        }
        Command::Approve {
            plan_id,
            approver,
            role,
        } => {
            let plan = gate.endorse(&plan_id, Endorsement::new(approver, role)).await?;
            println!("plan {} is now {}", plan.id, plan.status);
        }
        Command::Reject {
            plan_id,
            approver,
            reason,
        } => {
            let plan = gate
                .reject(
                    &plan_id,
                    Rejection {
                        approver,
                        reason,
                        at: chrono::Utc::now(),
                    },
                )
                .await?;
            println!("plan {} is now {}", plan.id, plan.status);
        }
        Command::Execute { plan_id, indices } => {
            let plan = gate.get(&plan_id).await?;
            let indices = indices.unwrap_or_else(|| (0..plan.actions.len()).collect());
            let report = executor.execute_plan(&plan_id, indices, None).await?;
            for (index, outcome) in &report.outcomes {
                let mark = if outcome.success { "ok" } else { "FAILED" };
                println!("  [{}] {}", index, mark);
                if let Some(diagnosis) = &outcome.diagnosis {
                    println!("      cause: {}", diagnosis.likely_cause);
                    for fix in &diagnosis.suggested_fixes {
                        println!("      fix: {}", fix);
                    }
                }
            }
            println!("plan {}: {}", report.plan_id, report.status);
        }
        Command::Status { plan_id } => match plan_id {
            Some(id) => {
                let plan = gate.get(&id).await?;
                println!("{}", serde_json::to_string_pretty(&plan)?);
            }
            None => {
                for plan in plans.list().await? {
                    println!(
                        "{}  {}  tier {}  {} action(s)",
                        plan.id,
                        plan.status,
                        plan.required_approval,
                        plan.actions.len()
                    );
                }
            }
        },
        Command::Ports { command } => {
            let ports = PortResourceManager::new(config.ports.clone());
            match command {
                PortsCommand::Check { port } => {
                    let status = ports.check_port(port).await?;
                    println!("{}", serde_json::to_string_pretty(&status)?);
                }
                PortsCommand::Free { port, confirm } => {
                    let outcome = ports.kill_on_port(port, confirm).await?;
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                }
            }
        }
    }
    Ok(())
}
