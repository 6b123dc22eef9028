mod logging;
mod scenario;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;
use logging::LogSettings;
use scenario::{Scenario, ScriptedBackend};
use stagewatch_core::{Request, RequestKind, Stage};
use stagewatch_engine::{PollPhase, PollingConfig, ViewingSession};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

const MAX_DRAIN: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "stagewatch")]
#[command(about = "Replay a scripted request lifecycle through the polling engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario file and print every stream emission
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    scenario: PathBuf,
    #[arg(long)]
    kind: Option<RequestKind>,
    #[arg(long)]
    stage_period_ms: Option<u64>,
    #[arg(long)]
    output_period_ms: Option<u64>,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

struct RunConfig {
    scenario: Scenario,
    kind: RequestKind,
    polling: PollingConfig,
    logging: LogSettings,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            let config = load_config(args)?;
            logging::init(&config.logging)?;
            run(config).await
        }
    }
}

fn load_config(args: RunArgs) -> Result<RunConfig> {
    let scenario = Scenario::load(&args.scenario)?;

    let mut polling = PollingConfig::default();
    polling.apply_table(&scenario.polling);
    let mut polling = polling
        .apply_env()
        .context("Invalid polling environment")?;
    if let Some(ms) = args.stage_period_ms {
        polling.stage_period = Duration::from_millis(ms);
    }
    if let Some(ms) = args.output_period_ms {
        polling.output_period = Duration::from_millis(ms);
    }
    polling.validate().context("Invalid polling periods")?;

    let kind = args
        .kind
        .or(scenario.request.kind)
        .unwrap_or_default();
    let logging = LogSettings::from_env(args.debug, &args.log_dir, &scenario.request.id);
    Ok(RunConfig {
        kind,
        polling,
        logging,
        scenario,
    })
}

async fn run(config: RunConfig) -> Result<()> {
    let backend = Arc::new(ScriptedBackend::new(&config.scenario));
    let session = ViewingSession::new(config.polling, backend.clone(), backend);
    let orchestrator = session.orchestrator(config.kind);
    let request = Request::new(config.scenario.request.id.clone(), Utc::now());

    let mut stages = orchestrator.stages();
    let mut errors = orchestrator.has_error();
    let mut phase = orchestrator.phase_changes();
    let (output_tx, mut outputs) = mpsc::unbounded_channel::<(String, String)>();
    let mut tailed: HashSet<String> = HashSet::new();

    info!(
        event = "scenario_start",
        request_id = %request.id,
        kind = %config.kind,
        stage_period_ms = config.polling.stage_period.as_millis() as u64,
        output_period_ms = config.polling.output_period.as_millis() as u64
    );
    orchestrator.start_polling(request.clone());
    if let Err(err) = orchestrator.get_all(&request).await {
        warn!(event = "scenario_initial_fetch_failed", error = %err);
    }

    let outcome = loop {
        tokio::select! {
            Some(snapshot) = stages.next() => {
                print_stages(&snapshot);
                for stage in &snapshot {
                    if !tailed.insert(stage.id.clone()) {
                        continue;
                    }
                    let mut output = session.tail_stage(
                        &request.id,
                        &stage.id,
                        orchestrator.stage_feed(stage.id.clone()),
                    );
                    let stage_id = stage.id.clone();
                    let output_tx = output_tx.clone();
                    tokio::spawn(async move {
                        while let Some(content) = output.next().await {
                            if output_tx.send((stage_id.clone(), content)).is_err() {
                                break;
                            }
                        }
                    });
                }
            }
            Some(flag) = errors.next() => println!("error: {flag}"),
            Some((stage_id, content)) = outputs.recv() => println!("output[{stage_id}]: {content:?}"),
            changed = phase.changed() => {
                if changed.is_err() {
                    break PollPhase::Idle;
                }
                let current = *phase.borrow_and_update();
                if matches!(current, PollPhase::Retired | PollPhase::PausedOnError) {
                    break current;
                }
            }
            else => break orchestrator.phase(),
        }
    };

    // the terminal snapshot and the tails' last emissions trail the phase change
    while let Some(snapshot) = stages.try_recv() {
        print_stages(&snapshot);
    }
    while let Some(flag) = errors.try_recv() {
        println!("error: {flag}");
    }
    let drain = config.polling.output_period.min(MAX_DRAIN);
    while let Ok(Some((stage_id, content))) = tokio::time::timeout(drain, outputs.recv()).await {
        println!("output[{stage_id}]: {content:?}");
    }

    match outcome {
        PollPhase::Retired => println!("retired"),
        PollPhase::PausedOnError => println!("paused: waiting for a manual retry"),
        other => println!("stopped: {}", other.as_str()),
    }
    info!(event = "scenario_end", request_id = %request.id, phase = outcome.as_str());
    Ok(())
}

fn print_stages(stages: &[Stage]) {
    let rendered: Vec<String> = stages
        .iter()
        .map(|stage| format!("{}({})={}", stage.id, stage.stage_type, stage.state))
        .collect();
    println!("stages: {}", rendered.join(" "));
}
