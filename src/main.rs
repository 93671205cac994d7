use anyhow::{Context, Result};
use clap::Parser;
use desktop_orchestrator_lib::audit::{AuditLogger, JsonlAuditLog, MemoryAuditLog};
use desktop_orchestrator_lib::config::{load_config_from, load_default_config};
use desktop_orchestrator_lib::engine::{ExecutionStatus, PauseReason, PlanExecutionEngine};
use desktop_orchestrator_lib::events::ExecutionEvent;
use desktop_orchestrator_lib::permission::PolicyPermissionGate;
use desktop_orchestrator_lib::plan::{ActionCategory, ExecutionPlan};
use desktop_orchestrator_lib::Actuators;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Run a desktop automation plan.
#[derive(Parser, Debug)]
#[command(name = "desktop-orchestrator", version)]
struct Cli {
    /// Plan file (JSON).
    plan: PathBuf,

    /// Engine configuration file. Defaults to the per-user config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Append audit entries to this JSON-lines file.
    #[arg(long)]
    audit_log: Option<PathBuf>,

    /// Leave applied steps in place when a step fails.
    #[arg(long)]
    no_rollback: bool,

    /// Deny every action of this category (repeatable).
    #[arg(long = "deny", value_name = "CATEGORY")]
    deny: Vec<ActionCategory>,

    /// Approve high-risk steps without prompting.
    #[arg(long)]
    auto_confirm: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let content = tokio::fs::read_to_string(&cli.plan)
        .await
        .with_context(|| format!("failed to read plan {}", cli.plan.display()))?;
    let plan: ExecutionPlan = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse plan {}", cli.plan.display()))?;

    let mut config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_default_config(),
    };
    if cli.no_rollback {
        config.auto_rollback = false;
    }
    let policy = cli
        .deny
        .iter()
        .fold(config.permissions.clone(), |policy, category| {
            policy.deny_category(*category)
        });

    let audit: Arc<dyn AuditLogger> = match &cli.audit_log {
        Some(path) => Arc::new(JsonlAuditLog::new(path)),
        None => Arc::new(MemoryAuditLog::new()),
    };
    let actuators = Actuators::system(&config);
    let engine = Arc::new(PlanExecutionEngine::new(
        config,
        actuators,
        Arc::new(PolicyPermissionGate::new(policy)),
        audit,
    ));

    let plan_id = plan.id.clone();
    let watcher = tokio::spawn(watch_events(
        Arc::clone(&engine),
        engine.subscribe(),
        plan_id.clone(),
        cli.auto_confirm,
    ));
    {
        let engine = Arc::clone(&engine);
        let plan_id = plan_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("interrupt received, cancelling plan {}", plan_id);
                engine.cancel(&plan_id).await;
            }
        });
    }

    let mut execution = engine.execute(plan).await;
    if execution.status == ExecutionStatus::Paused {
        if let Some(PauseReason::ConfirmationRequired { step_id, .. }) = &execution.pause_reason {
            log::warn!(
                "plan {} stopped before high-risk step {}; rerun with --auto-confirm to approve it",
                plan_id,
                step_id
            );
        }
    }
    // A confirmation approved by the watcher resumes on its own task; wait
    // for the registry to settle on a final state.
    while !execution.status.is_terminal() && cli.auto_confirm {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        match engine.get_execution(&plan_id).await {
            Some(latest) => execution = latest,
            None => break,
        }
    }

    watcher.abort();
    engine.close().await;

    println!("{}", serde_json::to_string_pretty(&execution)?);
    if execution.status != ExecutionStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}

async fn watch_events(
    engine: Arc<PlanExecutionEngine>,
    mut events: broadcast::Receiver<ExecutionEvent>,
    plan_id: String,
    auto_confirm: bool,
) {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                log::warn!("event stream lagged, {} event(s) skipped", missed);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if event.plan_id() != plan_id {
            continue;
        }
        log::info!("{}", event.name());

        match event {
            ExecutionEvent::InputRequired { prompt, .. } => {
                eprintln!("{}", prompt);
                match stdin.next_line().await {
                    Ok(Some(line)) => {
                        engine.provide_input(&plan_id, line).await;
                    }
                    Ok(None) => log::warn!("stdin closed before input was provided"),
                    Err(err) => log::error!("failed to read input: {}", err),
                }
            }
            ExecutionEvent::ExecutionPaused {
                reason: PauseReason::ConfirmationRequired { step_id, .. },
                ..
            } if auto_confirm => {
                log::info!("auto-confirming high-risk step {}", step_id);
                let engine = Arc::clone(&engine);
                let plan_id = plan_id.clone();
                tokio::spawn(async move {
                    engine.resume(&plan_id).await;
                });
            }
            _ => {}
        }
    }
}
