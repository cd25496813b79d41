//! `wf` -- validate, schedule and run task graphs, and serve generated apps.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use wf_core::config::Config;
use wf_core::types::ServiceKind;
use wf_daemon::daemon::{load_graph, load_inputs};
use wf_daemon::Daemon;
use wf_engine::scheduler;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "wf", version, about)]
struct Cli {
    /// Config file (defaults to ~/.weft/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a graph file and print the validation report.
    Validate {
        graph: PathBuf,
    },

    /// Print the execution levels of a graph file.
    Levels {
        graph: PathBuf,
    },

    /// Execute a graph file and print the execution record.
    Run {
        graph: PathBuf,
        /// JSON file with external inputs (`{"files": [...]}`).
        #[arg(long)]
        inputs: Option<PathBuf>,
    },

    /// Deploy an app file and serve it until ctrl-c.
    Deploy {
        /// streamlit, gradio or flask.
        kind: ServiceKind,
        app: PathBuf,
    },

    /// Print the effective configuration.
    Config,
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let cfg = match path {
        Some(path) => Config::load_from(&path).with_context(|| format!("loading config {}", path.display()))?,
        None => Config::load().context("loading config")?,
    };
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;
    wf_telemetry::logging::init("wf", &config.general.log_level, config.general.json_logs);

    match cli.command {
        Commands::Validate { graph } => {
            let graph = load_graph(&graph)?;
            let report = scheduler::validate(&graph);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_valid() {
                anyhow::bail!("graph {} is invalid", graph.id);
            }
        }
        Commands::Levels { graph } => {
            let graph = load_graph(&graph)?;
            let levels = scheduler::levels(&graph)?;
            for (idx, level) in levels.iter().enumerate() {
                println!("level {idx}: {}", level.join(", "));
            }
        }
        Commands::Run { graph, inputs } => {
            let graph = load_graph(&graph)?;
            let inputs = load_inputs(inputs.as_deref())?;
            let daemon = Daemon::new(config);
            let _signals = daemon.install_signal_handlers();

            let record = daemon.run_graph(graph, inputs).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);

            daemon.shutdown();
            daemon.wait_for_shutdown().await;
        }
        Commands::Deploy { kind, app } => {
            let daemon = Daemon::new(config);
            let _signals = daemon.install_signal_handlers();

            let service = daemon.serve(kind, &app).await?;
            println!("{} running at {} (service {})", service.kind, service.url, service.service_id);
            info!(service_id = %service.service_id, "serving until ctrl-c");

            daemon.wait_for_shutdown().await;
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
