use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tutorbox_core::{
    CleanupSweeper, ConfigLoader, ContainerRuntime, DockerRuntime, ExecutionBroker,
    ExecutionRequest, SandboxConfig,
};

#[derive(Parser, Debug)]
#[clap(name = "tutorbox", author, version, about = "Sandboxed code execution broker")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(
        long,
        short,
        default_value = "tutorbox.yaml",
        help = "Configuration file; built-in defaults and TUTORBOX_* variables are used when it does not exist"
    )]
    config: PathBuf,

    #[clap(long, short, help = "Log level, overrides logging.level from the configuration")]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a source file in a fresh sandbox and print the result as JSON
    Run {
        file: PathBuf,

        #[clap(long, help = "Opaque lesson id carried into the result")]
        lesson_id: Option<String>,

        #[clap(long, help = "Opaque exercise id carried into the result")]
        exercise_id: Option<String>,

        #[clap(long, help = "Test code appended after the submitted file")]
        tests: Option<PathBuf>,
    },
    /// Remove orphaned sandbox containers once and print the report
    Sweep,
    /// Run the cleanup sweeper until interrupted
    Daemon,
    /// Validate the configuration and check the container engine
    Check,
}

async fn load_config(path: &Path) -> Result<SandboxConfig> {
    if path.exists() {
        ConfigLoader::from_file(path)
            .await
            .with_context(|| format!("Failed to load {}", path.display()))
    } else {
        ConfigLoader::from_env().context("Invalid default configuration")
    }
}

fn init_logging(cli_level: Option<&str>, config: &SandboxConfig) {
    let level = cli_level.unwrap_or(&config.logging.level);
    let log_level_filter = level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();
}

async fn connect(config: &SandboxConfig) -> Result<Arc<DockerRuntime>> {
    let runtime = DockerRuntime::connect(config.broker.max_output_bytes)?;
    runtime
        .ping()
        .await
        .context("Docker engine is not answering")?;
    if config.runtime.pull_missing_image {
        runtime
            .ensure_image(&config.runtime.image)
            .await
            .with_context(|| format!("Execution image {} is not available", config.runtime.image))?;
    }
    Ok(Arc::new(runtime))
}

async fn run_file(
    config: &SandboxConfig,
    file: &Path,
    lesson_id: Option<String>,
    exercise_id: Option<String>,
    tests: Option<&Path>,
) -> Result<bool> {
    let code = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let mut request = ExecutionRequest::new(code);
    request.lesson_id = lesson_id;
    request.exercise_id = exercise_id;

    let runtime = connect(config).await?;
    let broker = ExecutionBroker::from_config(runtime, config)?;

    let result = match tests {
        Some(path) => {
            let test_code = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            broker.submit_with_tests(&request, &test_code).await?
        }
        None => broker.submit(&request).await?,
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.success)
}

async fn run_daemon(config: &SandboxConfig) -> Result<()> {
    if !config.sweeper.enabled {
        bail!("sweeper.enabled is false; nothing to run");
    }
    let runtime = connect(config).await?;
    let sweeper = Arc::new(CleanupSweeper::from_config(runtime, config)?);
    let shutdown = CancellationToken::new();
    let task = sweeper.spawn(shutdown.clone());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("Shutting down");
    shutdown.cancel();
    task.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;
    init_logging(cli.log_level.as_deref(), &config);

    match cli.command {
        Commands::Run {
            file,
            lesson_id,
            exercise_id,
            tests,
        } => {
            let success =
                run_file(&config, &file, lesson_id, exercise_id, tests.as_deref()).await?;
            if !success {
                std::process::exit(1);
            }
        }
        Commands::Sweep => {
            let runtime = DockerRuntime::connect(config.broker.max_output_bytes)?;
            let sweeper = CleanupSweeper::from_config(Arc::new(runtime), &config)?;
            let report = sweeper.sweep_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Daemon => run_daemon(&config).await?,
        Commands::Check => {
            connect(&config).await?;
            println!(
                "configuration ok, engine reachable, image {} present",
                config.runtime.image
            );
        }
    }

    Ok(())
}
