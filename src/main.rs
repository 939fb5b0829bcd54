use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use patchrun::config::Config;
use patchrun::domain::{EventRecord, Run};
use patchrun::github::GithubClient;
use patchrun::llm::{Agent, AgentRole, ModelClient, OpenRouterClient};
use patchrun::review::{ReviewOutcome, ReviewStage};
use patchrun::vcs::GitCli;
use patchrun::{
    CreateRunRequest, RunExecutor, RunOutcome, RunService, RunState, RunStore, SqliteStore, WorkerPool, work_queue,
};

mod cli;

use cli::Cli;
use cli::commands::Commands;

fn setup_logging(cli: &Cli, config: &Config) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("patchrun")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("patchrun.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    let mut builder = env_logger::Builder::from_default_env();
    if cli.is_verbose() {
        builder.filter_level(log::LevelFilter::Debug);
    } else if std::env::var_os("RUST_LOG").is_none()
        && let Some(level) = config.log_level.as_deref()
    {
        let level = log::LevelFilter::from_str(level)
            .map_err(|_| eyre::eyre!("Invalid log_level in config: {}", level))?;
        builder.filter_level(level);
    }
    builder.target(env_logger::Target::Pipe(target)).init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

/// Long-lived collaborators shared by the commands
struct App {
    config: Arc<Config>,
    store: Arc<dyn RunStore>,
}

impl App {
    fn open(config: Config) -> Result<Self> {
        let store = SqliteStore::open(&config.storage.database_path)
            .context("Failed to open run store")?
            .with_lock_ttl(config.storage.lock_ttl());
        info!("Using run store at {}", config.storage.database_path.display());
        Ok(Self {
            config: Arc::new(config),
            store: Arc::new(store),
        })
    }

    fn model_client(&self) -> Result<Arc<dyn ModelClient>> {
        let client = OpenRouterClient::from_config(&self.config.model, &self.config.retry)
            .context("Failed to create model client")?;
        Ok(Arc::new(client))
    }

    fn executor(&self) -> Result<RunExecutor> {
        let github = GithubClient::from_config(&self.config.github).context("Failed to create GitHub client")?;
        let executor = RunExecutor::new(
            Arc::clone(&self.config),
            self.model_client()?,
            Arc::new(github),
            Arc::new(GitCli::from_config(&self.config.git)),
            Arc::clone(&self.store),
        )?;
        Ok(executor)
    }

    fn get_run(&self, run_id: &str) -> Result<Run> {
        self.store
            .get_run(run_id)?
            .ok_or_else(|| eyre::eyre!("Run not found: {}", run_id))
    }
}

async fn run_application(cli: &Cli, app: &App) -> Result<()> {
    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Create {
            repo_url,
            issue,
            model,
            max_iterations,
            now,
        } => {
            handle_create_command(
                app,
                CreateRunRequest {
                    repo_url: repo_url.clone(),
                    issue_number: Some(*issue),
                    model: model.clone(),
                    max_iterations: *max_iterations,
                },
                *now,
            )
            .await
        }
        Commands::Process { run_id } => handle_process_command(app, run_id).await,
        Commands::Work { workers } => handle_work_command(app, *workers).await,
        Commands::Retry { repo_url, issue } => handle_retry_command(app, repo_url, *issue),
        Commands::Review { run_id, summary } => handle_review_command(app, run_id, summary).await,
        Commands::Status { run_id } => handle_status_command(app, run_id.as_deref()),
        Commands::Logs { run_id, payload } => handle_logs_command(app, run_id, *payload),
    }
}

fn colored_state(state: RunState) -> ColoredString {
    match state {
        RunState::Done => state.as_str().green(),
        RunState::Failed => state.as_str().red(),
        RunState::NeedsFix => state.as_str().yellow(),
        RunState::Reviewing | RunState::CiRunning | RunState::PrOpened => state.as_str().cyan(),
        _ => state.as_str().normal(),
    }
}

fn print_outcome(run_id: &str, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Reviewing { iteration } => {
            println!(
                "{} {} iteration {} on {}",
                "Reviewing:".green(),
                run_id,
                iteration.index,
                iteration.branch
            );
            if let Some(url) = &iteration.pr_url {
                println!("  PR: {}", url);
            }
        }
        RunOutcome::Failed(reason) => {
            println!("{} {} [{}] {}", "Failed:".red(), run_id, reason.code(), reason);
        }
        RunOutcome::Skipped(why) => println!("{} {} ({})", "Skipped:".yellow(), run_id, why),
    }
}

async fn handle_create_command(app: &App, request: CreateRunRequest, now: bool) -> Result<()> {
    let (queue, _receiver) = work_queue();
    let service = RunService::new(Arc::clone(&app.config), Arc::clone(&app.store), queue);
    let run = service.create_run(request)?;
    println!("{} {}", "Created:".green(), run.id);
    println!(
        "  {} #{} model={} max_iterations={}",
        run.repo_url,
        run.issue_number.unwrap_or_default(),
        run.model,
        run.max_iterations
    );

    if now {
        let outcome = app.executor()?.process(&run.id).await?;
        print_outcome(&run.id, &outcome);
    }
    Ok(())
}

async fn handle_process_command(app: &App, run_id: &str) -> Result<()> {
    info!("Processing run {}", run_id);
    let outcome = app.executor()?.process(run_id).await?;
    print_outcome(run_id, &outcome);
    Ok(())
}

async fn handle_work_command(app: &App, workers: Option<usize>) -> Result<()> {
    let (queue, receiver) = work_queue();
    let pending = RunService::new(Arc::clone(&app.config), Arc::clone(&app.store), queue).enqueue_pending()?;
    if pending == 0 {
        println!("{}", "No pending runs".yellow());
        return Ok(());
    }

    let workers = workers.unwrap_or(app.config.workers.count);
    println!("{} {} run(s) with {} worker(s)", "Working:".cyan(), pending, workers);
    let pool = WorkerPool::new(Arc::new(app.executor()?), workers);
    let report = pool.run(receiver).await;
    println!(
        "{} {} processed: {} reviewing, {} failed, {} skipped, {} errors",
        "Done:".green(),
        report.processed(),
        report.reviewing,
        report.failed,
        report.skipped,
        report.errors
    );
    Ok(())
}

fn handle_retry_command(app: &App, repo_url: &str, issue: i64) -> Result<()> {
    let (queue, _receiver) = work_queue();
    let service = RunService::new(Arc::clone(&app.config), Arc::clone(&app.store), queue);
    let run = service.retry_issue(repo_url, issue)?;
    println!("{} {} is {}", "Retry:".green(), run.id, colored_state(run.state));
    Ok(())
}

async fn handle_review_command(app: &App, run_id: &str, summary: &str) -> Result<()> {
    let model = app.config.model.role_models.get(AgentRole::Reviewer.as_str()).cloned();
    let reviewer = Agent::new(AgentRole::Reviewer, app.model_client()?).with_model(model);
    let stage = ReviewStage::new(Arc::clone(&app.store), reviewer)?;
    match stage.review(run_id, summary).await? {
        ReviewOutcome::Reviewed { report, state } => {
            println!("{} {} -> {}", "Review:".green(), report.verdict, colored_state(state));
            if !report.summary.is_empty() {
                println!("  {}", report.summary);
            }
        }
        ReviewOutcome::Skipped(why) => println!("{} {} ({})", "Skipped:".yellow(), run_id, why),
    }
    Ok(())
}

fn handle_status_command(app: &App, run_id: Option<&str>) -> Result<()> {
    let Some(run_id) = run_id else {
        let runs = app.store.list_runs()?;
        if runs.is_empty() {
            println!("{}", "No runs".yellow());
        }
        for run in runs {
            println!(
                "{}  {:<10}  {} #{}",
                run.id,
                colored_state(run.state),
                run.repo_url,
                run.issue_number.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string())
            );
        }
        return Ok(());
    };

    let run = app.get_run(run_id)?;
    println!("{} {}", "Run:".green(), run.id);
    println!("  state:      {}", colored_state(run.state));
    println!("  repo:       {}", run.repo_url);
    if let Some(n) = run.issue_number {
        println!("  issue:      #{}", n);
    }
    println!("  model:      {}", run.model);
    println!("  created:    {}", run.created_at.to_rfc3339());
    let iterations = app.store.list_iterations(&run.id)?;
    println!("  iterations: {}/{}", iterations.len(), run.max_iterations);
    for it in iterations {
        println!(
            "    {}. {} {} {}",
            it.index,
            it.branch,
            &it.patch_hash[..it.patch_hash.len().min(12)],
            it.pr_url.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn print_event(event: &EventRecord, payload: bool) {
    println!(
        "{} {:<18} {}",
        event.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
        event.kind.cyan(),
        event.message
    );
    if payload && !event.payload.is_null() {
        println!("    {}", event.payload);
    }
}

fn handle_logs_command(app: &App, run_id: &str, payload: bool) -> Result<()> {
    let run = app.get_run(run_id)?;
    for event in app.store.list_logs(&run.id)? {
        print_event(&event, payload);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    setup_logging(&cli, &config).context("Failed to setup logging")?;
    info!("Starting with config from: {:?}", cli.config);

    let app = App::open(config)?;
    run_application(&cli, &app).await.context("Application failed")?;

    Ok(())
}
