//! ferry - Extract WhatsApp and email messages into dated local archives.

mod summary;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use ferry_core::config::{LoggingConfig, ScheduleMode};
use ferry_core::{CredentialStore, Orchestrator, PipelineConfig, PipelineRun, PipelineScheduler};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit code when the configuration cannot be loaded or is invalid.
const EXIT_INVALID_CONFIG: u8 = 1;
/// Exit code when every enabled source failed.
const EXIT_ALL_FAILED: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "ferry",
    version,
    about = "Extract WhatsApp and email messages with their attachments into local storage."
)]
struct Args {
    /// Pipeline configuration file (YAML, TOML or JSON)
    #[arg(long, value_name = "PATH")]
    config: PathBuf,

    /// Check the configuration and exit without extracting
    #[arg(long)]
    validate_only: bool,

    /// Use synthetic in-memory sources instead of the real providers
    #[arg(long)]
    mock_mode: bool,

    /// Run a single extraction even when a schedule is configured
    #[arg(long)]
    once: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Logs go to stderr so stdout carries only the run summary.
fn init_tracing(logging: &LoggingConfig, force_json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    if force_json || logging.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Print validation problems; returns whether the config may run.
fn check_config(config: &PipelineConfig, credentials: &CredentialStore, mock_mode: bool) -> bool {
    let mut fatal = 0;
    for problem in config.validate(credentials) {
        if mock_mode && problem.is_credential() {
            warn!(field = %problem.field, "ignored in mock mode: {}", problem.message);
            continue;
        }
        eprintln!("config error: {}", problem);
        fatal += 1;
    }
    if fatal > 0 {
        error!(errors = fatal, "configuration is invalid");
    }
    fatal == 0
}

async fn run_once(orchestrator: &Orchestrator, config: &PipelineConfig) -> anyhow::Result<ExitCode> {
    let report = orchestrator
        .run(config)
        .await
        .context("extraction run could not start")?;
    print!("{}", summary::render(&report));

    if report.success {
        Ok(ExitCode::SUCCESS)
    } else {
        error!(run_id = %report.run_id, "every enabled source failed");
        Ok(ExitCode::from(EXIT_ALL_FAILED))
    }
}

async fn run_scheduled(orchestrator: Orchestrator, config: PipelineConfig) -> anyhow::Result<ExitCode> {
    let config = Arc::new(config);
    let job = Arc::new(PipelineRun::new(Arc::new(orchestrator), Arc::clone(&config)));
    let mut scheduler = PipelineScheduler::new(&config.scheduler, job)
        .await
        .context("failed to create scheduler")?;

    scheduler.start().await?;
    info!(mode = %config.scheduler.mode, "waiting for scheduled runs, press Ctrl+C to stop");

    shutdown_signal().await;
    info!("shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;
    Ok(ExitCode::SUCCESS)
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let config = match PipelineConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cannot load {}: {}", args.config.display(), e);
            return Ok(ExitCode::from(EXIT_INVALID_CONFIG));
        }
    };

    init_tracing(&config.logging, args.log_json);

    let credentials = CredentialStore::from_env();
    if !check_config(&config, &credentials, args.mock_mode) {
        return Ok(ExitCode::from(EXIT_INVALID_CONFIG));
    }
    if args.validate_only {
        println!("configuration {} is valid", args.config.display());
        return Ok(ExitCode::SUCCESS);
    }

    let orchestrator = Orchestrator::new(ferry_extractors::factory_for(args.mock_mode), credentials);
    if args.mock_mode {
        info!("mock mode: providers replaced by synthetic sources");
    }

    let scheduled = config.scheduler.enabled && config.scheduler.mode != ScheduleMode::Once;
    if scheduled && !args.once {
        run_scheduled(orchestrator, config).await
    } else {
        run_once(&orchestrator, &config).await
    }
}

/// Exit code for a command line clap refused to parse. Help and version
/// requests are not failures.
fn parse_failure_code(err: &clap::Error) -> u8 {
    use clap::error::ErrorKind;
    match err.kind() {
        ErrorKind::DisplayHelp
        | ErrorKind::DisplayVersion
        | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => 0,
        _ => EXIT_INVALID_CONFIG,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(parse_failure_code(&e));
        }
    };
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("ferry: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_config_flag_is_required() {
        assert!(Args::try_parse_from(["ferry"]).is_err());

        let args = Args::try_parse_from(["ferry", "--config", "ferry.yaml", "--mock-mode", "--once"])
            .unwrap();
        assert_eq!(args.config, PathBuf::from("ferry.yaml"));
        assert!(args.mock_mode);
        assert!(args.once);
        assert!(!args.validate_only);
    }

    #[test]
    fn test_bad_command_line_exits_as_invalid_config() {
        let missing = Args::try_parse_from(["ferry"]).unwrap_err();
        assert_eq!(parse_failure_code(&missing), EXIT_INVALID_CONFIG);

        let unknown = Args::try_parse_from(["ferry", "--config", "f.yaml", "--bogus"]).unwrap_err();
        assert_eq!(parse_failure_code(&unknown), EXIT_INVALID_CONFIG);

        let help = Args::try_parse_from(["ferry", "--help"]).unwrap_err();
        assert_eq!(parse_failure_code(&help), 0);
    }
}
