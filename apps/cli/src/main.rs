use std::{fmt::Write as _, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::{derive_ws_base_url, load_settings_from, SETTINGS_FILE},
    engine::StageStatus,
    simulator::{script, Fixture, FixtureShape},
    AnalysisClient, ClientError, ClientEvent, ClientSettings, Outcome, ProducerMode, RenderModel,
};
use shared::domain::Report;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "polyview", about = "Stream a multi-perspective analysis of a topic")]
struct Cli {
    /// Settings file; defaults to ./polyview.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a topic and follow the analysis until it finishes.
    Analyze {
        topic: String,
        #[arg(long)]
        simulated: bool,
        #[arg(long)]
        api_base_url: Option<String>,
        #[arg(long)]
        ws_base_url: Option<String>,
        #[arg(long)]
        idle_timeout_secs: Option<u64>,
        #[arg(long)]
        fixture: Option<PathBuf>,
        #[arg(long)]
        snapshot_only: bool,
        #[arg(long)]
        tick_ms: Option<u64>,
        /// Print the final render model as JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Print the simulation fixture as JSON, or with `--frames` its frame sequence as JSON lines.
    Fixture {
        #[arg(long)]
        fixture: Option<PathBuf>,
        #[arg(long)]
        frames: bool,
        #[arg(long)]
        snapshot_only: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(SETTINGS_FILE));

    match cli.command {
        Command::Analyze {
            topic,
            simulated,
            api_base_url,
            ws_base_url,
            idle_timeout_secs,
            fixture,
            snapshot_only,
            tick_ms,
            json,
        } => {
            let mut settings = load_settings_from(&config_path, |key| std::env::var(key).ok());
            apply_overrides(
                &mut settings,
                Overrides {
                    simulated,
                    api_base_url,
                    ws_base_url,
                    idle_timeout_secs,
                    fixture,
                    snapshot_only,
                    tick_ms,
                },
            );
            run_analysis(&settings, &topic, json).await
        }
        Command::Fixture {
            fixture,
            frames,
            snapshot_only,
        } => {
            let fixture = match fixture {
                Some(path) => Fixture::load(&path)?,
                None => Fixture::builtin(),
            };
            if !frames {
                println!("{}", serde_json::to_string_pretty(&fixture)?);
                return Ok(());
            }
            for frame in script(&fixture, shape_for(snapshot_only)) {
                println!("{}", serde_json::to_string(&frame)?);
            }
            Ok(())
        }
    }
}

struct Overrides {
    simulated: bool,
    api_base_url: Option<String>,
    ws_base_url: Option<String>,
    idle_timeout_secs: Option<u64>,
    fixture: Option<PathBuf>,
    snapshot_only: bool,
    tick_ms: Option<u64>,
}

fn shape_for(snapshot_only: bool) -> FixtureShape {
    if snapshot_only {
        FixtureShape::SnapshotOnly
    } else {
        FixtureShape::Incremental
    }
}

fn apply_overrides(settings: &mut ClientSettings, overrides: Overrides) {
    if overrides.simulated || overrides.fixture.is_some() {
        settings.mode = ProducerMode::Simulated;
    }
    if let Some(api_base_url) = overrides.api_base_url {
        settings.api_base_url = api_base_url.trim_end_matches('/').to_string();
        if overrides.ws_base_url.is_none() {
            if let Some(derived) = derive_ws_base_url(&settings.api_base_url) {
                settings.ws_base_url = derived;
            }
        }
    }
    if let Some(ws_base_url) = overrides.ws_base_url {
        settings.ws_base_url = ws_base_url;
    }
    if let Some(secs) = overrides.idle_timeout_secs {
        settings.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(path) = overrides.fixture {
        settings.simulation.fixture_path = Some(path);
    }
    if overrides.snapshot_only {
        settings.simulation.shape = FixtureShape::SnapshotOnly;
    }
    if let Some(ms) = overrides.tick_ms {
        settings.simulation.tick = Duration::from_millis(ms);
    }
}

async fn run_analysis(settings: &ClientSettings, topic: &str, json: bool) -> Result<()> {
    let client = Arc::new(
        AnalysisClient::from_settings(settings).context("failed to configure analysis client")?,
    );
    let mut events = client.subscribe_events();
    client.submit_topic(topic).await?;
    eprintln!("Analyzing \"{}\" ({:?} mode)", topic.trim(), client.mode());

    let mut printer = ProgressPrinter::default();
    loop {
        match events.recv().await {
            Ok(ClientEvent::ViewUpdated(model)) => {
                for line in printer.advance(&model) {
                    eprintln!("{line}");
                }
                if model.is_terminal() {
                    break;
                }
            }
            Ok(ClientEvent::PhaseChanged { from, to }) => debug!(?from, ?to, "phase changed"),
            Ok(ClientEvent::Error(message)) => eprintln!("error: {message}"),
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "progress events skipped"),
            Err(RecvError::Closed) => break,
        }
    }

    let outcome = client.wait_for_outcome().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&client.view().await)?);
    }
    match outcome {
        Some(Outcome::Report(report)) => {
            if !json {
                print!("{}", render_report(&report));
            }
            Ok(())
        }
        Some(Outcome::Failure(failure)) => Err(ClientError::from(failure).into()),
        None => bail!("analysis ended without an outcome"),
    }
}

/// Emits only what changed between successive render models.
#[derive(Default)]
struct ProgressPrinter {
    latest_status: Option<String>,
    done_stages: usize,
    resolved: usize,
    expected: usize,
}

impl ProgressPrinter {
    fn advance(&mut self, model: &RenderModel) -> Vec<String> {
        let mut lines = Vec::new();
        if model.latest_status.is_some() && model.latest_status != self.latest_status {
            self.latest_status = model.latest_status.clone();
            if let Some(status) = &self.latest_status {
                lines.push(format!("  {status}"));
            }
        }
        let done = model
            .stages
            .iter()
            .filter(|stage| stage.status == StageStatus::Done)
            .count();
        if done > self.done_stages && !model.is_terminal() {
            self.done_stages = done;
            lines.push(format!("  [{done}/{}] stages done", model.stages.len()));
        }
        let resolved = model.resolved_count();
        if resolved != self.resolved || model.slots.len() != self.expected {
            self.resolved = resolved;
            self.expected = model.slots.len();
            lines.push(format!("  perspectives {resolved}/{}", self.expected));
        }
        lines
    }
}

fn render_report(report: &Report) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}", report.topic);
    let _ = writeln!(out);
    if !report.overall_summary.is_empty() {
        let _ = writeln!(out, "{}", report.overall_summary);
        let _ = writeln!(out);
    }
    for (index, perspective) in report.perspectives.iter().enumerate() {
        let strength = perspective
            .rated_strength
            .map(|s| format!(" ({:.1}/5)", s.value()))
            .unwrap_or_default();
        let _ = writeln!(out, "{}. {}{strength}", index + 1, perspective.title);
        if !perspective.narrative_summary.is_empty() {
            let _ = writeln!(out, "   {}", perspective.narrative_summary);
        }
        for evidence in &perspective.evidence {
            let _ = writeln!(out, "   - {}", evidence.statement());
        }
    }
    out
}
