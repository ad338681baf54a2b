use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use transcode_relay::admin;
use transcode_relay::config::{Config, LoggingConfig, CONFIG_ENV_VAR};
use transcode_relay::ledger::{HostRef, Ledger};
use transcode_relay::runner::{Context, InvocationMode, JobRunner, INTERNAL_FAILURE};
use transcode_relay::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "transcode-relay")]
#[command(version)]
#[command(about = "Dispatch ffmpeg/ffprobe jobs to a pool of remote transcode hosts")]
#[command(propagate_version = true)]
struct Args {
    /// Configuration file
    #[arg(long, short = 'c', global = true, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Create (or recreate) the ledger. Destroys existing hosts and history.
    Init {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,

        /// Allow running as a non-root user
        #[arg(long)]
        no_root_check: bool,
    },

    /// Add a host to the pool
    Add {
        /// Relative capacity; higher weights absorb more concurrent jobs
        #[arg(short, long, default_value = "1")]
        weight: i64,

        /// Hostname or IP address
        address: String,
    },

    /// Remove a host by ID or address
    Remove { host: String },

    /// Show hosts, their state and running jobs
    Status {
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Clear process rows and state history (resets bad hosts) for one host or all hosts
    Clear { host: Option<String> },

    /// Run an ffmpeg job through the dispatcher
    Run {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Logging
// =============================================================================

fn env_filter(logging: &LoggingConfig) -> EnvFilter {
    let default = if logging.debug { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Dispatch-mode logging: logfile only. stdout and stderr carry the wrapped
/// binary's output, so an unusable logfile means no logging at all.
fn init_file_logging(logging: &LoggingConfig) {
    if !logging.log_to_file {
        return;
    }
    if let Some(parent) = logging.logfile.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let Ok(file) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&logging.logfile)
    else {
        return;
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(logging))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
}

fn init_admin_logging(logging: &LoggingConfig) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(logging))
        .with_writer(io::stderr)
        .init();
}

// =============================================================================
// Dispatch
// =============================================================================

async fn dispatch(config: Config, mode: InvocationMode, args: Vec<String>) -> i32 {
    let shutdown = match install_shutdown_handler() {
        Ok(guard) => guard,
        Err(e) => {
            tracing::error!(error = %e, "Failed to install signal handlers");
            eprintln!("transcode-relay: failed to install signal handlers: {}", e);
            return INTERNAL_FAILURE;
        }
    };

    let ctx = match Context::new(config, mode, shutdown) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!(error = %e, "Cannot start job");
            eprintln!("transcode-relay: {}", e);
            return INTERNAL_FAILURE;
        }
    };

    JobRunner::new(&ctx).run(&args).await
}

// =============================================================================
// Admin Command Handlers
// =============================================================================

fn confirm(prompt: &str) -> bool {
    eprint!("{} [y/N] ", prompt);
    let _ = io::stderr().flush();
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes" | "YES")
}

fn handle_init(
    config: &Config,
    yes: bool,
    no_root_check: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !no_root_check && !nix::unistd::Uid::effective().is_root() {
        return Err("init must be run as root (or pass --no-root-check)".into());
    }

    let path = config.ledger_path();
    let prompt = format!(
        "This will erase all hosts and state in {}. Continue?",
        path.display()
    );
    admin::initialize(config, || yes || confirm(&prompt))?;
    println!("Ledger initialized at {}", path.display());
    Ok(())
}

fn handle_status(ledger: &Ledger, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let report = admin::status(ledger)?;
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => print!("{}", admin::render_table(&report)),
    }
    Ok(())
}

fn open_ledger(path: &Path) -> Result<Ledger, Box<dyn std::error::Error>> {
    Ok(Ledger::open(path)?)
}

async fn run_admin(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    match args.command {
        Commands::Init { yes, no_root_check } => {
            init_admin_logging(&config.logging);
            handle_init(&config, yes, no_root_check)?;
        }
        Commands::Add { weight, address } => {
            init_admin_logging(&config.logging);
            let ledger = open_ledger(&config.ledger_path())?;
            let id = ledger.add_host(&address, weight)?;
            println!("Added host {} ({}) with weight {}", id, address, weight);
        }
        Commands::Remove { host } => {
            init_admin_logging(&config.logging);
            let ledger = open_ledger(&config.ledger_path())?;
            let host_ref: HostRef = host.parse()?;
            let removed = ledger.remove_host(&host_ref)?;
            println!("Removed host {} ({})", removed.id, removed.address);
        }
        Commands::Status { output } => {
            init_admin_logging(&config.logging);
            let ledger = open_ledger(&config.ledger_path())?;
            handle_status(&ledger, &output)?;
        }
        Commands::Clear { host } => {
            init_admin_logging(&config.logging);
            let ledger = open_ledger(&config.ledger_path())?;
            let host_ref = host.map(|h| h.parse::<HostRef>()).transpose()?;
            let cleared = admin::clear(&ledger, host_ref.as_ref())?;
            println!(
                "Cleared {} process rows and {} state events",
                cleared.processes, cleared.states
            );
        }
        Commands::Run { args } => {
            init_file_logging(&config.logging);
            let code = dispatch(config, InvocationMode::Transcode, args).await;
            std::process::exit(code);
        }
    }

    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let mut argv = std::env::args_os();
    let argv0 = argv.next().unwrap_or_default();

    // Installed as ffmpeg/ffprobe: behave exactly like the wrapped binary.
    if let Some(mode) = InvocationMode::from_program_name(&argv0) {
        let args: Vec<String> = argv.map(|a| a.to_string_lossy().into_owned()).collect();
        let config = match Config::load() {
            Ok(config) => config,
            Err(e) => {
                eprintln!("transcode-relay: {}", e);
                std::process::exit(INTERNAL_FAILURE);
            }
        };
        init_file_logging(&config.logging);
        let code = dispatch(config, mode, args).await;
        std::process::exit(code);
    }

    if let Err(e) = run_admin(Args::parse()).await {
        eprintln!("Error: {}", e);
        std::process::exit(INTERNAL_FAILURE);
    }
}
