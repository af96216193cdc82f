use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use maestro_core::config::MaestroConfig;
use maestro_core::event::{EventBus, OrchestrationEvent};
use maestro_core::traits::UnitContext;
use maestro_core::types::{value_text, Invocation, Trace};
use maestro_engine::{BuildContext, Topology};

#[derive(Parser)]
#[command(name = "maestro", version, about = "Graph and swarm orchestration for agent units")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "maestro.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a topology file without running it
    Validate {
        /// Topology TOML file
        file: PathBuf,
    },
    /// Run a topology once and print its output
    Run {
        /// Topology TOML file
        file: PathBuf,
        /// Task text (read from stdin if omitted)
        #[arg(short, long)]
        input: Option<String>,
        /// Print the full result and trace as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn load_config(path: &Path) -> anyhow::Result<MaestroConfig> {
    if path.exists() {
        Ok(MaestroConfig::load(path)?)
    } else {
        Ok(MaestroConfig::default())
    }
}

fn init_tracing(config: &MaestroConfig) {
    let filter = EnvFilter::try_from_env("MAESTRO_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(&config.log.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "maestro", &mut io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_tracing(&config);
    if !cli.config.exists() {
        info!(path = %cli.config.display(), "No config file found, using defaults");
    }

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate { file } => {
            let topology = Topology::load(&file)?;
            topology.build(&BuildContext::new(config))?;
            println!(
                "{}: {} '{}' with {} node(s) is valid",
                file.display(),
                topology.kind(),
                topology.name(),
                topology.node_count()
            );
        }
        Commands::Run { file, input, json } => {
            let task = match input {
                Some(text) => text,
                None => read_stdin(),
            };
            run_topology(&file, config, task, json).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn read_stdin() -> String {
    io::stdin()
        .lock()
        .lines()
        .map_while(|l| l.ok())
        .collect::<Vec<_>>()
        .join("\n")
}

async fn run_topology(
    file: &Path,
    config: MaestroConfig,
    task: String,
    json: bool,
) -> anyhow::Result<()> {
    let topology = Topology::load(file)?;
    let event_bus = Arc::new(EventBus::default());
    let unit = topology.build(&BuildContext::new(config).with_event_bus(event_bus.clone()))?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            ctrl_c.cancel();
        }
    });

    let progress = if json {
        None
    } else {
        Some(tokio::spawn(print_progress(event_bus.subscribe())))
    };

    let invocation = Invocation::new(task);
    let mut ctx = UnitContext::root(topology.name(), &invocation);
    ctx.cancel = cancel;
    let outcome = unit.execute(invocation, ctx).await?;
    drop(unit);
    drop(event_bus);
    if let Some(handle) = progress {
        let _ = handle.await;
    }

    if json {
        let trace = match &outcome.trace {
            Some(t) => serde_json::to_value(t)?,
            None => serde_json::Value::Null,
        };
        let report = serde_json::json!({
            "status": outcome.status,
            "output": outcome.output,
            "trace": trace,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", value_text(&outcome.output));
        eprintln!("status: {}", outcome.status);
        if let Some(Trace::Swarm(trace)) = &outcome.trace {
            let path: Vec<&str> = trace.node_history.iter().map(|n| n.as_str()).collect();
            eprintln!("path: {}", path.join(" -> "));
        }
    }

    if outcome.status.is_usable() {
        Ok(())
    } else {
        anyhow::bail!("run ended with status {}", outcome.status)
    }
}

async fn print_progress(mut rx: tokio::sync::broadcast::Receiver<OrchestrationEvent>) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match rx.recv().await {
            Ok(OrchestrationEvent::NodeStarted {
                node_id,
                execution_index,
                ..
            }) => eprintln!("  > {} (#{})", node_id, execution_index + 1),
            Ok(OrchestrationEvent::NodeFinished {
                node_id,
                status,
                elapsed_ms,
                ..
            }) => eprintln!("  < {} {} in {}ms", node_id, status.as_str(), elapsed_ms),
            Ok(OrchestrationEvent::NodeSkipped { node_id, .. }) => {
                eprintln!("  - {} skipped", node_id)
            }
            Ok(OrchestrationEvent::Handoff { from, to, .. }) => {
                eprintln!("  {} handed off to {}", from, to)
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "Progress output lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
