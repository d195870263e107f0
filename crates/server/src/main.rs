//! Apiary CLI and trigger server
//!
//! `apiary run` drives one pipeline run in the foreground, `apiary serve`
//! accepts run requests over HTTP, and `apiary tool ...` holds the helpers
//! the orchestrator agent calls from inside its sandbox.

mod api;

use anyhow::{Context, Result};
use apiary_core::config::{PipelineConfig, StateBackend};
use apiary_core::state::io::get_runtime_path;
use apiary_core::state::{open_store, StateStore};
use apiary_core::swarm::{run_pipeline, PipelineStage, RunRequest};
use apiary_core::task::ResearchTaskDraft;
use apiary_core::telemetry::Telemetry;
use apiary_core::tools::{research_tasks, search};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Clone)]
#[command(author, version, about = "Apiary - Research pipeline that grows a knowledge base")]
struct Args {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Run state backend (overrides .apiary/config.json)
    #[arg(long, global = true)]
    state_backend: Option<StateBackend>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Clone)]
enum CliCommand {
    /// Run (or resume) the pipeline for a knowledge-base repository
    Run {
        /// Knowledge-base repository name, or owner/name
        repo: String,
        /// Project/requirements document
        #[arg(short, long)]
        project: PathBuf,
        /// Concurrent research workers
        #[arg(long)]
        research_workers: Option<usize>,
        /// Concurrent review workers
        #[arg(long)]
        review_workers: Option<usize>,
        /// Stage to restart from: orchestrator, research or review
        #[arg(long, default_value = "orchestrator")]
        start_from: PipelineStage,
        /// Key the run state is stored under (defaults to the repo name)
        #[arg(long)]
        run_id: Option<String>,
        /// Telemetry session id
        #[arg(long)]
        session_id: Option<String>,
    },
    /// Accept pipeline runs over HTTP
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8111")]
        port: u16,
    },
    /// Print a stored run state
    Status {
        /// Run key (repo name or run id)
        run_key: String,
    },
    /// Helpers for agents running inside a sandbox
    Tool {
        #[command(subcommand)]
        tool: ToolCommand,
    },
}

#[derive(Subcommand, Clone)]
enum ToolCommand {
    /// Record a research task for the pipeline to pick up
    CreateTask {
        /// The topic of the research task
        #[arg(long)]
        topic: String,
        /// Instructions for the researcher
        #[arg(long)]
        prompt: String,
        /// Knowledge-base file the researcher edits
        #[arg(long)]
        file_path: String,
        /// Website the browser agent starts from
        #[arg(long, default_value = "")]
        websites: String,
        /// Directory task files are written to
        #[arg(long, default_value = research_tasks::RESEARCH_TASKS_DIR)]
        dir: PathBuf,
    },
    /// Search the web and write the results as JSON
    SearchWeb {
        /// What to search for
        objective: String,
        /// File the results are written to
        output: PathBuf,
    },
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(state_backend: Option<StateBackend>) -> PipelineConfig {
    let mut config = PipelineConfig::load();
    if let Some(backend) = state_backend {
        config.state_backend = backend;
    }
    config
}

fn open_configured_store(config: &PipelineConfig) -> Result<Arc<dyn StateStore>> {
    open_store(config.state_backend, &get_runtime_path())
        .context("Failed to open run state store")
}

#[allow(clippy::too_many_arguments)]
async fn run_command(
    mut config: PipelineConfig,
    repo: String,
    project: PathBuf,
    research_workers: Option<usize>,
    review_workers: Option<usize>,
    start_from: PipelineStage,
    run_id: Option<String>,
    session_id: Option<String>,
) -> Result<bool> {
    if let Some(n) = research_workers {
        config.research_workers = n;
    }
    if let Some(n) = review_workers {
        config.review_workers = n;
    }
    let project_spec = std::fs::read_to_string(&project)
        .with_context(|| format!("Failed to read project document {:?}", project))?;

    let store = open_configured_store(&config)?;
    let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let telemetry = Telemetry::from_env(&session_id);

    let request = RunRequest {
        run_key: run_id,
        start_from,
        ..RunRequest::new(&repo, &project_spec)
    };
    let result = run_pipeline(config, store, request, telemetry.clone()).await;
    telemetry.shutdown().await;

    let summary = result?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(summary.success)
}

fn tool_command(tool: ToolCommand) -> Result<()> {
    match tool {
        ToolCommand::CreateTask {
            topic,
            prompt,
            file_path,
            websites,
            dir,
        } => {
            let draft = ResearchTaskDraft {
                topic,
                prompt,
                file_path,
                websites,
            };
            let path = research_tasks::create_task(&dir, &draft)?;
            println!("Research task saved to {}", path.display());
            println!("  Topic:    {}", draft.topic);
            println!("  File:     {}", draft.file_path);
            println!("  Websites: {}", draft.websites);
        }
        ToolCommand::SearchWeb { objective, output } => {
            let api_key = std::env::var("PARALLEL_API_KEY").context("Set PARALLEL_API_KEY")?;
            let results = search::search_web(&api_key, &objective)?;
            search::write_results(&output, &results)?;
            println!("Results written to {}", output.display());
        }
    }
    Ok(())
}

async fn serve_command(config: PipelineConfig, port: u16) -> Result<()> {
    let store = open_configured_store(&config)?;
    let secret = std::env::var("APIARY_SECRET_KEY").ok().filter(|s| !s.is_empty());
    if secret.is_none() {
        tracing::warn!("APIARY_SECRET_KEY is not set; every /start request will be rejected");
    }
    let state = Arc::new(api::AppState::new(config, store, secret));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Apiary server listening on http://{}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, api::router(state)).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    init_tracing(&args.log_level);
    let config = load_config(args.state_backend);

    match args.command {
        CliCommand::Run {
            repo,
            project,
            research_workers,
            review_workers,
            start_from,
            run_id,
            session_id,
        } => {
            let success = run_command(
                config,
                repo,
                project,
                research_workers,
                review_workers,
                start_from,
                run_id,
                session_id,
            )
            .await?;
            if !success {
                std::process::exit(1);
            }
        }
        CliCommand::Serve { port } => serve_command(config, port).await?,
        CliCommand::Status { run_key } => {
            let store = open_configured_store(&config)?;
            if !store.exists(&run_key)? {
                anyhow::bail!("No run state stored for '{}'", run_key);
            }
            let state = store.load(&run_key)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        CliCommand::Tool { tool } => {
            tokio::task::spawn_blocking(move || tool_command(tool)).await??
        }
    }
    Ok(())
}
