mod driver;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use patchflow_agent::stages::{intake, locator, patcher};
use patchflow_agent::{Executor, Graph, StageDeps, StageError, ValidationError};
use patchflow_core::config::AppConfig;
use patchflow_core::error::PatchflowError;
use patchflow_tools::{GithubIssueSource, SandboxSession};

use driver::{Driver, DriverError};

#[derive(Parser)]
#[command(name = "patchflow", version, about = "Turn GitHub issues into applied patches")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "patchflow.toml", global = true)]
    config: PathBuf,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch issues and run intake, locator and patcher on each
    Run {
        /// Repository in owner/name form
        repo: String,
        /// Only process this issue number
        #[arg(long)]
        issue: Option<u64>,
        /// Override patcher.max_attempts
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Print the execution layers of the stage graphs
    Plan {
        /// Stage to show (all when omitted)
        #[arg(value_enum)]
        stage: Option<Stage>,
    },
    /// Show current configuration (secrets masked)
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Stage {
    Intake,
    Locator,
    Patcher,
}

impl Stage {
    const ALL: [Stage; 3] = [Stage::Intake, Stage::Locator, Stage::Patcher];

    fn name(self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::Locator => "locator",
            Stage::Patcher => "patcher",
        }
    }

    fn build(self, deps: &StageDeps) -> Result<Graph, ValidationError> {
        match self {
            Stage::Intake => intake::build_intake_graph(deps),
            Stage::Locator => locator::build_locator_graph(deps),
            Stage::Patcher => patcher::build_patcher_graph(deps),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.verbose { "patchflow=debug,info" } else { "patchflow=info,warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_target(false)
        .init();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "patchflow failed");
            eprintln!("Error: {:#}", e);
            ExitCode::from(failure_code(&e))
        }
    }
}

/// 2 for configuration and graph validation problems, 1 for everything else.
fn failure_code(e: &anyhow::Error) -> u8 {
    let config_error = |p: &PatchflowError| {
        matches!(
            p,
            PatchflowError::Config(_) | PatchflowError::ConfigNotFound(_) | PatchflowError::UnsupportedProvider(_)
        )
    };
    if let Some(p) = e.downcast_ref::<PatchflowError>() {
        return if config_error(p) { 2 } else { 1 };
    }
    match e.downcast_ref::<DriverError>() {
        Some(DriverError::Stage(_)) => 2,
        Some(DriverError::Host(p)) if config_error(p) => 2,
        Some(_) => 1,
        None if e.downcast_ref::<StageError>().is_some() || e.downcast_ref::<ValidationError>().is_some() => 2,
        None => 1,
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    // Completions need no config
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "patchflow", &mut std::io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&masked(&config))?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Plan { stage } => {
            let deps = StageDeps::offline(config);
            let stages = stage.map_or_else(|| Stage::ALL.to_vec(), |s| vec![s]);
            for stage in stages {
                let graph = stage.build(&deps)?;
                println!("{} ({} nodes)", stage.name(), graph.len());
                print!("{}", graph.plan());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            repo,
            issue,
            max_attempts,
        } => {
            if let Some(n) = max_attempts {
                config.patcher.max_attempts = n;
            }
            let code = run(config, &repo, issue).await?;
            Ok(ExitCode::from(code))
        }
        Commands::Completions { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn load_config(path: &PathBuf) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        return Ok(AppConfig::load(path)?);
    }
    warn!(
        path = %path.display(),
        "No config file found, using OPENAI_API_KEY, GITHUB_TOKEN and GBOX_API_KEY from the environment"
    );
    Ok(AppConfig::from_env())
}

async fn run(config: AppConfig, repo: &str, issue: Option<u64>) -> anyhow::Result<u8> {
    if repo.trim_matches('/').split('/').count() != 2 {
        return Err(PatchflowError::Config(format!("expected owner/name, got '{}'", repo)).into());
    }

    let (model, llm) = patchflow_llm::build_client(&config)?;
    info!(provider = %model.provider, model = %model.model_id, "LLM client ready");
    let issues = Arc::new(GithubIssueSource::new(&config.github));

    // Graceful shutdown on Ctrl-C
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("Interrupted, stopping after the running layer");
        cancel_clone.cancel();
    });

    let executor = Executor::from_config(&config.engine).with_cancel_token(cancel);
    let sandbox = patchflow_tools::acquire(&config).await?;
    let config = Arc::new(config);
    let llm: Arc<dyn patchflow_core::traits::LlmClient> = Arc::from(llm);

    // Cancellation stops the executor between layers, so in-flight sandbox
    // commands finish before the session is released
    let reports = SandboxSession::scoped(sandbox, |sandbox| async move {
        let deps = StageDeps::new(llm, model, sandbox, config);
        Driver::new(deps, issues, executor).run(repo, issue).await
    })
    .await?;

    let applied = reports.iter().filter(|r| r.applied()).count();
    info!(processed = reports.len(), applied, "Run finished");
    println!("{} of {} issue(s) patched", applied, reports.len());
    Ok(driver::exit_code(&reports))
}

/// A copy of the config safe to print.
fn masked(config: &AppConfig) -> AppConfig {
    fn mask(secret: &mut Option<String>) {
        if secret.as_deref().is_some_and(|s| !s.is_empty()) {
            *secret = Some("********".to_string());
        }
    }
    let mut config = config.clone();
    mask(&mut config.model.api_key);
    for fb in &mut config.fallback_models {
        mask(&mut fb.api_key);
    }
    mask(&mut config.github.token);
    mask(&mut config.sandbox.api_key);
    config
}
