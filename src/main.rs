use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use psc_demo::config::{Config, Overrides};
use psc_demo::driver::Driver;
use psc_demo::gcp::client::GcpClient;
use psc_demo::gcp::error::ApiError;
use psc_demo::provision::api::ComputeApi;
use psc_demo::provision::memory::InMemoryCompute;
use psc_demo::report::{DetailLevel, RunReport, StepStatus};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Project used for dry runs when none is configured
const DRY_RUN_PROJECT: &str = "psc-demo-dry-run";

/// Private Service Connect demo on GCP
#[derive(Parser, Debug)]
#[command(name = "psc-demo", version = psc_demo::VERSION, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// GCP project to use
    #[arg(short, long, global = true)]
    project: Option<String>,

    /// GCP region to use
    #[arg(short, long, global = true)]
    region: Option<String>,

    /// GCP zone to use
    #[arg(short, long, global = true)]
    zone: Option<String>,

    /// Config file (JSON or YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level for debugging
    #[arg(long, value_enum, default_value = "info", global = true)]
    log_level: LogLevel,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Run against an in-process Compute API; nothing is created
    #[arg(long, global = true)]
    dry_run: bool,

    /// Compute API endpoint
    #[arg(long, global = true, env = "PSC_DEMO_ENDPOINT")]
    endpoint: Option<String>,

    /// Give up waiting on a single operation after this many seconds
    #[arg(long, global = true)]
    operation_timeout: Option<u64>,

    /// Report detail: minimal, detailed or verbose
    #[arg(long, global = true, default_value = "detailed")]
    detail: String,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Create networks, VMs and the PSC chain, then verify
    Up,
    /// Check an existing deployment
    Verify,
    /// Delete everything `up` created
    Down,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

fn setup_logging(
    level: LogLevel,
    log_file: Option<&Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_directive()));

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
        return Ok(None);
    };

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("psc-demo {} started with log level: {:?}", psc_demo::VERSION, level);
    tracing::info!("Log file: {:?}", log_path);

    Ok(Some(guard))
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::load(args.config.as_deref())?;
    config.apply_env();
    config.apply_overrides(Overrides {
        project: args.project.clone(),
        region: args.region.clone(),
        zone: args.zone.clone(),
        operation_timeout_secs: args.operation_timeout,
    });
    if args.dry_run && config.effective_project().is_none() {
        config.project_id = Some(DRY_RUN_PROJECT.to_string());
    }
    config.resolve()
}

async fn connect(args: &Args, config: &Config) -> Result<Arc<dyn ComputeApi>> {
    if args.dry_run {
        tracing::info!("Dry run: using the in-process Compute API");
        return Ok(Arc::new(InMemoryCompute::new(config.project())));
    }

    let mut client = GcpClient::new(config.project()).await?;
    if let Some(endpoint) = &args.endpoint {
        client = client.with_endpoint(endpoint)?;
    }
    Ok(Arc::new(client))
}

/// Print the aborting step with its resource and the remote error payload
fn print_failure(report: &RunReport) {
    let Some(record) = report.failure() else {
        return;
    };
    eprintln!();
    eprintln!(
        "Step '{}' failed on {} {} ({})",
        record.step, record.resource.kind, record.resource.name, record.resource.scope
    );
    let StepStatus::Failed(err) = &record.status else {
        return;
    };
    eprintln!("  {}", err);
    if let Some(api_error) = std::error::Error::source(err).and_then(|s| s.downcast_ref::<ApiError>()) {
        eprintln!("  hint: {}", api_error.hint());
    }
    if let Some(detail) = err.remote_detail() {
        let rendered = serde_json::to_string_pretty(detail).unwrap_or_else(|_| detail.to_string());
        eprintln!("  remote detail: {}", rendered);
    }
    if err.is_cancelled() {
        eprintln!("Interrupted. Re-run the same command to resume.");
    } else {
        eprintln!("Re-run the same command to resume.");
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let _log_guard = setup_logging(args.log_level, args.log_file.as_deref())?;

    let config = Arc::new(load_config(&args)?);
    let detail = DetailLevel::from_str(&args.detail);
    tracing::info!(
        "Project {} region {} zone {}",
        config.project(),
        config.region(),
        config.zone()
    );

    let api = connect(&args, &config).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping after in-flight requests");
            on_signal.cancel();
        }
    });

    let driver = Driver::new(config, api, cancel);

    let success = match args.command {
        Command::Up => {
            let report = driver.up().await?;
            print!("{}", report.run.render(detail));
            if let Some(verification) = &report.verification {
                println!();
                println!("{}", verification);
            }
            print_failure(&report.run);
            if let Some(err) = &report.verification_error {
                eprintln!();
                eprintln!("Provisioning succeeded but verification failed: {}", err);
            }
            report.is_success()
        }
        Command::Verify => {
            let verification = driver.verify().await?;
            println!("{}", verification);
            verification.is_connected()
        }
        Command::Down => {
            let report = driver.down().await?;
            print!("{}", report.render(detail));
            print_failure(&report);
            report.is_success()
        }
    };

    Ok(if success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
