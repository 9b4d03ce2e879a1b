mod local_tools;
mod terminal_ui;

use anyhow::{Result, anyhow};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tandem_bridge::BackendBridge;
use tandem_checkpoint::CheckpointService;
use tandem_core::{
    ApiBlock, AutonomyMode, AutonomySettings, EngineConfig, TaskMode,
};
use tandem_engine::{TaskLoop, TaskOutcome};
use tandem_model::HttpModelClient;
use tandem_observe::Observer;
use tandem_state::StateManager;
use tandem_store::TaskStore;
use tandem_tools::ToolExecutor;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "tandem", about = "Autonomous coding-agent task engine", version)]
struct Cli {
    /// The task goal. Omit with --list or --resume.
    goal: Option<String>,

    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Planning only, no edits.
    #[arg(long)]
    plan: bool,

    /// Autonomy: "turn", "steps:N" or "full".
    #[arg(long, default_value = "turn")]
    autonomy: String,

    /// Resume a prior task by id.
    #[arg(long)]
    resume: Option<Uuid>,

    /// List prior tasks and exit.
    #[arg(long)]
    list: bool,

    #[arg(long)]
    verbose: bool,
}

fn parse_autonomy(raw: &str) -> Result<AutonomySettings> {
    let mode = match raw {
        "turn" => AutonomyMode::TurnBased,
        "full" => AutonomyMode::Full,
        other => {
            let steps = other
                .strip_prefix("steps:")
                .and_then(|n| n.parse::<u32>().ok())
                .ok_or_else(|| anyhow!("invalid autonomy '{other}' (turn | steps:N | full)"))?;
            AutonomyMode::StepLimited { max_steps: steps }
        }
    };
    Ok(AutonomySettings::new(mode))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let workspace = cli.workspace.canonicalize()?;
    let config = EngineConfig::load(&workspace)?;
    let store = Arc::new(TaskStore::new(&workspace)?);

    if cli.list {
        for item in store.list_history_items()? {
            println!(
                "{}  {:>8} tok  ${:.4}  {}",
                item.task_id,
                item.metrics.total_tokens(),
                item.metrics.total_cost,
                item.goal
            );
        }
        return Ok(());
    }

    let mut observer = Observer::new(&workspace)?;
    observer.set_verbose(cli.verbose);
    let observer = Arc::new(observer);
    let ui = Arc::new(terminal_ui::TerminalUi::new());

    let state = match cli.resume {
        Some(task_id) => StateManager::resume(task_id, store.clone(), ui.clone())?,
        None => {
            let goal = cli
                .goal
                .clone()
                .ok_or_else(|| anyhow!("a goal is required (or --list / --resume)"))?;
            StateManager::new(Uuid::now_v7(), goal, store.clone(), ui.clone())
        }
    };
    let initial = match cli.resume {
        Some(_) => vec![ApiBlock::text(
            "The task was interrupted and has been resumed. Reassess the workspace state \
             and continue from where it left off.",
        )],
        None => vec![ApiBlock::text(state.goal().to_string())],
    };
    let state = Arc::new(Mutex::new(state));

    let executor = Arc::new(ToolExecutor::new(
        Arc::new(local_tools::WorkspaceFiles::new(&workspace)),
        Arc::new(local_tools::ShellRunner::new(&workspace)),
        Arc::new(local_tools::NoBrowser),
        Arc::new(local_tools::NoHub),
    ));
    let checkpoints = CheckpointService::new(&workspace, state.clone(), observer.clone());
    let transport = Arc::new(HttpModelClient::new(config.model.clone())?);
    let bridge = match &config.backend {
        Some(launch) => Some(Arc::new(BackendBridge::spawn(launch, observer.clone())?)),
        None => None,
    };

    let mut task = TaskLoop::new(
        if cli.plan { TaskMode::Plan } else { TaskMode::Act },
        parse_autonomy(&cli.autonomy)?,
        config,
        state,
        transport,
        executor,
        checkpoints,
        bridge,
        observer,
    );

    match task.run(initial)? {
        TaskOutcome::Completed { result } => {
            println!("\n{result}");
            Ok(())
        }
        TaskOutcome::Aborted => {
            println!("\ntask aborted");
            Ok(())
        }
    }
}
