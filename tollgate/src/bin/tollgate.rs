//! Tollgate CLI
//!
//! ## Commands
//!
//! - `run`: Run a build and its dependency closure, print the report as JSON
//! - `order`: Print the resolved execution order of a build

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tollgate::config::EngineConfig;
use tollgate::core::{Project, RunRequest};
use tollgate::engine::Engine;
use tollgate::observability::{init_tracing, LogFormat};
use tollgate::pipeline::resolve;
use tracing::info;

#[derive(Parser)]
#[command(name = "tollgate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run CI/CD build pipelines", long_about = None)]
struct Cli {
    /// Log output format: pretty, json or compact
    #[arg(long, global = true, default_value = "pretty", env = "TOLLGATE_LOG_FORMAT")]
    log_format: LogFormat,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a build with everything it depends on
    Run {
        /// Project document (JSON)
        #[arg(short, long)]
        project: PathBuf,

        /// Build id to run
        #[arg(short, long)]
        build: String,

        /// Branch to build
        #[arg(long, default_value = "main")]
        branch: String,

        /// Treat the branch as the VCS root's default branch
        #[arg(long)]
        default_branch: bool,

        /// Engine configuration (JSON)
        #[arg(short, long, env = "TOLLGATE_CONFIG")]
        config: Option<PathBuf>,

        /// Run parameters, `name=value`
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// Print the execution order of a build
    Order {
        /// Project document (JSON)
        #[arg(short, long)]
        project: PathBuf,

        /// Build id to resolve
        #[arg(short, long)]
        build: String,
    },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))
}

fn load_project(path: &Path) -> Result<Project> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read project document {}", path.display()))?;
    Project::from_json(&json).with_context(|| format!("Invalid project document {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, &cli.log_level);

    match cli.command {
        Commands::Run {
            project,
            build,
            branch,
            default_branch,
            config,
            params,
        } => {
            let project = load_project(&project)?;
            let config = match config {
                Some(path) => EngineConfig::from_file(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => EngineConfig::default(),
            }
            .with_env_overrides()?;

            let engine = Engine::builder(project).config(config).build()?;
            let request = params
                .into_iter()
                .fold(RunRequest::manual(build, branch, default_branch), |request, (name, value)| {
                    request.with_param(name, value)
                });

            let report = engine.run(request).await?;
            info!(
                target = %report.target,
                status = ?report.status,
                duration_ms = report.duration_ms,
                "Orchestration finished"
            );
            println!("{}", serde_json::to_string_pretty(&report)?);

            if !report.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Order { project, build } => {
            let project = load_project(&project)?;
            let order = resolve(&project, &build)?;
            println!("{}", serde_json::to_string_pretty(&order)?);
        }
    }

    Ok(())
}
