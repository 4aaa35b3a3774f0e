//! Binary entry point for the Ostriv CLI.

use std::io::{self, Write};
use std::process;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use ostriv::{
    ActivityProber, ExtendError, ExtendOrchestrator, ExtendRequest, LaunchTemplate, OstrivConfig,
    ProcessCommandRunner, RecreateError, RecreateOrchestrator, RecreateRequest, RemoteConfig,
    RemoteExecutor, ScalewayError, ScalewayProvider, StdinPrompt, TrustStore, TrustStoreError,
};

#[derive(Debug, Parser)]
#[command(
    name = "ostriv",
    about = "Manage a cloud development VM: recreate it in place, hold it, and curate host trust",
    arg_required_else_help = true
)]
enum Cli {
    #[command(about = "Replace the VM's instance while preserving its volume, address, and name")]
    Recreate(RecreateCommand),
    #[command(about = "Hold the VM against recreation for a number of hours")]
    Extend(ExtendCommand),
    #[command(subcommand, about = "Manage trust-on-first-use host records")]
    Trust(TrustCommand),
}

#[derive(Debug, Parser)]
struct RecreateCommand {
    /// Stable VM name.
    name: String,
    /// Skip the typed-name confirmation.
    #[arg(long, short = 'y')]
    yes: bool,
    /// Skip the activity probes and recreate even a busy VM.
    #[arg(long)]
    ignore_activity: bool,
}

#[derive(Debug, Parser)]
struct ExtendCommand {
    /// Stable VM name.
    name: String,
    /// Hold duration in hours from now.
    #[arg(long)]
    hours: u64,
}

#[derive(Debug, Subcommand)]
enum TrustCommand {
    #[command(about = "Drop the stored host fingerprint for a VM")]
    Forget {
        /// Stable VM name.
        name: String,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("control-plane client error: {0}")]
    Provider(String),
    #[error(transparent)]
    Recreate(#[from] RecreateError<ScalewayError>),
    #[error(transparent)]
    Extend(#[from] ExtendError<ScalewayError>),
    #[error(transparent)]
    Trust(#[from] TrustStoreError),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Recreate(command) => recreate_command(command).await,
        Cli::Extend(command) => extend_command(command).await,
        Cli::Trust(TrustCommand::Forget { name }) => trust_forget(&name),
    }
}

struct App {
    config: OstrivConfig,
    provider: ScalewayProvider,
    executor: RemoteExecutor<ProcessCommandRunner>,
    trust: TrustStore,
}

fn app() -> Result<App, CliError> {
    let config =
        OstrivConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;

    let provider = ScalewayProvider::new(
        config.secret_key.clone(),
        config.project_id.clone(),
        config.zone.clone(),
    )
    .map_err(|err| CliError::Provider(err.to_string()))?;

    let executor = RemoteExecutor::new(
        RemoteConfig::for_user(config.ssh_user.clone()),
        ProcessCommandRunner,
    );

    let trust_path = match &config.trust_store_path {
        Some(path) => Utf8PathBuf::from(path),
        None => TrustStore::default_location()?,
    };
    let trust = TrustStore::open(trust_path);

    Ok(App {
        config,
        provider,
        executor,
        trust,
    })
}

async fn recreate_command(command: RecreateCommand) -> Result<i32, CliError> {
    let app = app()?;
    let script = std::fs::read_to_string(&app.config.bootstrap_script).map_err(|err| {
        CliError::Config(format!(
            "cannot read bootstrap script {}: {err}",
            app.config.bootstrap_script
        ))
    })?;

    let template = LaunchTemplate {
        image_label: app.config.image.clone(),
        architecture: app.config.architecture.clone(),
        instance_type: app.config.instance_type.clone(),
        project_id: app.config.project_id.clone(),
        bootstrap_script: script,
        bootstrap_script_sha256: app.config.bootstrap_script_sha256.clone(),
    };
    let prober = ActivityProber::new(app.config.assistant_process.clone());
    let prompt = StdinPrompt;

    let orchestrator = RecreateOrchestrator::new(
        &app.provider,
        &app.executor,
        &prober,
        &app.trust,
        &prompt,
        app.config.owner.clone(),
        template,
    );
    let outcome = orchestrator
        .run(&RecreateRequest {
            vm_name: command.name.clone(),
            assume_yes: command.yes,
            ignore_activity: command.ignore_activity,
        })
        .await?;

    let mut stdout = io::stdout();
    writeln!(
        stdout,
        "recreated '{}' as instance {}",
        command.name, outcome.instance_id
    )
    .ok();
    if let Some(address) = outcome.address {
        writeln!(stdout, "reachable at {address}").ok();
    }
    Ok(0)
}

async fn extend_command(command: ExtendCommand) -> Result<i32, CliError> {
    let app = app()?;
    let orchestrator = ExtendOrchestrator::new(
        &app.provider,
        &app.executor,
        &app.trust,
        app.config.owner.clone(),
    );
    let outcome = orchestrator
        .run(&ExtendRequest {
            vm_name: command.name.clone(),
            hours: command.hours,
        })
        .await?;

    writeln!(
        io::stdout(),
        "'{}' is held until epoch {}",
        command.name,
        outcome.until_epoch
    )
    .ok();
    Ok(0)
}

fn trust_forget(name: &str) -> Result<i32, CliError> {
    let app = app()?;
    let removed = app.trust.forget(name)?;
    let mut stdout = io::stdout();
    if removed {
        writeln!(stdout, "dropped host trust for '{name}'").ok();
    } else {
        writeln!(stdout, "no host trust recorded for '{name}'").ok();
    }
    Ok(0)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
