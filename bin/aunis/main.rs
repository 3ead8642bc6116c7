use aunis::{
    AppConfig, Console, DispatchMode, EventLog, EventRecord, NanonisError, RunSummary,
    TcpTransport, load_config_or_default,
};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{LevelFilter, error, info, warn};
use std::{
    fs,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// Nanonis command console
#[derive(Parser, Debug)]
#[command(name = "aunis")]
#[command(about = "Send commands and run scripts against a Nanonis controller", long_about = None)]
struct Args {
    /// Path to configuration file (defaults to ./aunis.toml when present)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Override the Nanonis host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Override the Nanonis port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Fail on unknown commands and wrong argument counts instead of skipping them
    #[arg(long, global = true)]
    strict: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a script file
    Run {
        script: PathBuf,
    },
    /// Execute a single command
    Exec {
        alias: String,
        args: Vec<String>,
    },
    /// List every command name a script may use
    Commands,
    /// List the configured external interfaces
    Interfaces,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = load_config_or_default(args.config.as_deref());
    apply_overrides(&mut config, &args);

    let log_level = args
        .log_level
        .clone()
        .unwrap_or(config.logging.log_level.clone());
    initialize_logging(&log_level)?;

    let console = Console::from_config(&config)?;

    match args.command {
        Command::Commands => {
            for name in console.command_names() {
                println!("{name}");
            }
            Ok(())
        }
        Command::Interfaces => {
            for interface in console.list_external_interfaces() {
                println!("{}\t{}:{}", interface.name, interface.host, interface.port);
            }
            Ok(())
        }
        Command::Exec { alias, args } => {
            connect(&console, &config)?;
            let response = console.execute(&alias, &args)?;
            if !response.is_empty() {
                println!("{response}");
            }
            console.disconnect();
            Ok(())
        }
        Command::Run { script } => {
            let text = fs::read_to_string(&script).map_err(|source| NanonisError::Io {
                source,
                context: format!("Could not read script {}", script.display()),
            })?;
            info!("=== aunis script runner ===");
            info!("Script: {}", script.display());
            connect(&console, &config)?;

            let shutdown_flag = setup_shutdown_handler()?;
            let summary = run_and_report(&console, &config, &text, shutdown_flag)?;
            console.disconnect();

            if summary.failed > 0 {
                return Err(format!("{} command(s) failed", summary.failed).into());
            }
            Ok(())
        }
    }
}

fn apply_overrides(config: &mut AppConfig, args: &Args) {
    if let Some(host) = &args.host {
        config.nanonis.host = host.clone();
    }
    if let Some(port) = args.port {
        config.nanonis.port = port;
    }
    if args.strict {
        config.dispatch.mode = DispatchMode::Strict;
    }
}

fn connect(
    console: &Console<TcpTransport>,
    config: &AppConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let (host, port) = (&config.nanonis.host, config.nanonis.port);
    if !console.connect(host, port) {
        return Err(format!("Could not connect to Nanonis at {host}:{port}").into());
    }
    Ok(())
}

/// Setup Ctrl+C handler for graceful script cancellation
fn setup_shutdown_handler() -> Result<Arc<AtomicBool>, Box<dyn std::error::Error>> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping after the current line...");
        shutdown_flag_clone.store(true, Ordering::SeqCst);
    })?;

    Ok(shutdown_flag)
}

/// Run the script, echo its events and report the outcome
fn run_and_report(
    console: &Console<TcpTransport>,
    config: &AppConfig,
    text: &str,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<RunSummary, Box<dyn std::error::Error>> {
    let mut event_log = match &config.logging.event_log {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            Some(EventLog::new(path, 100))
        }
        None => None,
    };

    let (events, received) = crossbeam_channel::unbounded();
    let handle = console.run_script_with_cancel(text, events, shutdown_flag)?;

    for event in received {
        let record = EventRecord::now(&event);
        println!("{}", record.to_line());
        if let Some(log) = event_log.as_mut() {
            log.add(record)?;
        }
    }

    let summary = handle.join();
    if let Some(mut log) = event_log {
        log.flush()?;
        info!("Events written to {}", log.path().display());
    }

    if summary.cancelled {
        warn!("Script stopped by user");
    } else if summary.failed > 0 {
        error!(
            "Script finished with {} failed command(s) out of {}",
            summary.failed,
            summary.executed + summary.failed
        );
    } else {
        info!("Script completed: {} command(s)", summary.executed);
    }

    Ok(summary)
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    Ok(())
}
