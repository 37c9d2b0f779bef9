use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use userland::config::Config;
use userland::events::Event;
use userland::executor::ExecutionRequest;
use userland::provision::Distro;
use userland::service::{Service, SetupOutcome};

mod logging;

const BAR_SCALE: f64 = 1000.0;

#[derive(Parser)]
#[command(name = "userland", version, about = "Provision Linux root filesystems and run commands inside them with proot")]
struct Cli {
    /// Data directory holding the sandbox binary and environments
    #[arg(long, global = true, env = "USERLAND_HOME")]
    data_dir: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a base image, unpack it and install Python
    Setup {
        #[arg(value_enum)]
        distro: Distro,
        env_id: String,
    },
    /// Run a shell command inside an environment
    Exec {
        env_id: String,
        command: String,
        /// Working directory inside the environment
        #[arg(long, default_value = "/")]
        cwd: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Report whether an environment is installed
    Installed { env_id: String },
    /// Replace the sandbox binary if a newer release exists
    Update,
    /// Print the directory environments live in
    Path,
    /// Show storage usage and the installed sandbox binary
    Info,
    /// Print the device CPU ABI
    Arch,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = logging::init_tracing(cli.verbose, cli.log_json) {
        eprintln!("{} {err:#}", "warning".yellow().bold());
    }

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err:#}", "error".red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::load(cli.data_dir).context("Failed to load configuration")?;
    let service = Arc::new(Service::new(config));

    match cli.command {
        Commands::Setup { distro, env_id } => setup(service, distro, &env_id).await,
        Commands::Exec {
            env_id,
            command,
            cwd,
            timeout_ms,
        } => {
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| service.config().command_timeout());
            let request = ExecutionRequest::new(env_id, command)
                .with_working_dir(cwd)
                .with_timeout(timeout);
            exec(service, request).await
        }
        Commands::Installed { env_id } => {
            let installed = service.is_environment_installed(&env_id);
            println!("{installed}");
            Ok(if installed {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
        Commands::Update => {
            let report = service.check_sandbox_update().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if report.error.is_some() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Commands::Path => {
            println!("{}", service.get_environment_path().display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Info => {
            let info = service
                .get_storage_info()
                .await
                .context("Failed to read storage information")?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Arch => {
            println!("{}", service.get_device_arch());
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn setup(service: Arc<Service>, distro: Distro, env_id: &str) -> Result<ExitCode> {
    let bar = ProgressBar::new(BAR_SCALE as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {percent:>3}% {wide_msg}")?
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(120));

    let mut events = service.subscribe();
    let render = {
        let bar = bar.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(Event::Progress(progress)) => {
                        bar.set_position((progress.progress * BAR_SCALE) as u64);
                        bar.set_message(progress.message);
                    }
                    Ok(Event::Output(line)) => bar.println(line.tagged().dimmed().to_string()),
                    Ok(Event::SandboxUpdated { version }) => {
                        bar.println(format!("{} proot updated to {version}", "info".blue().bold()))
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };
    let canceller = cancel_on_ctrl_c(service.clone());

    let outcome = service.setup_environment(distro, env_id).await;
    canceller.abort();
    render.abort();
    bar.finish_and_clear();

    Ok(match outcome {
        SetupOutcome::Ready { path } => {
            println!("{} {env_id} ready at {}", "✓".green(), path.display());
            ExitCode::SUCCESS
        }
        SetupOutcome::Cancelled => {
            eprintln!("{} setup cancelled", "!".yellow().bold());
            ExitCode::from(130)
        }
        SetupOutcome::Failed { message } => {
            eprintln!("{} {message}", "error".red().bold());
            ExitCode::FAILURE
        }
    })
}

async fn exec(service: Arc<Service>, request: ExecutionRequest) -> Result<ExitCode> {
    let canceller = cancel_on_ctrl_c(service.clone());
    let result = service.execute_command(request).await;
    canceller.abort();

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(result.stdout.as_bytes())?;
    stdout.flush()?;
    eprint!("{}", result.stderr);

    Ok(ExitCode::from(result.exit_code.rem_euclid(256) as u8))
}

fn cancel_on_ctrl_c(service: Arc<Service>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            service.cancel_setup();
        }
    })
}
