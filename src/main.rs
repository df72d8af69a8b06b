//! Stream Relay Daemon
//!
//! Serves resumable event streams over HTTP and cancellable agent runs over
//! WebSocket.

mod api;
mod buffer;
mod client;
mod codec;
mod config;
mod error;
mod models;
mod orchestrator;
mod runs;
mod session;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::client::TailOptions;
use crate::config::Config;
use crate::models::{Event, EventKind};

const AURORA_BLUE: &str = "\x1b[38;5;117m";
const COSMIC_VIOLET: &str = "\x1b[38;5;147m";
const PULSE_CYAN: &str = "\x1b[38;5;51m";
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";

#[derive(Parser)]
#[command(name = "stream-relay")]
#[command(about = "Resumable event streams and cancellable agent runs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay daemon
    Serve {
        /// Path to config file
        #[arg(short, long)]
        config: Option<String>,

        /// Host to bind to
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Follow a pull stream and print its events
    Tail {
        /// Base URL of the relay
        #[arg(short, long, default_value = "http://127.0.0.1:8765")]
        url: String,

        /// Topic to follow
        #[arg(short, long)]
        topic: Option<String>,

        /// Resume after this id
        #[arg(short, long)]
        last_event_id: Option<u64>,
    },

    /// Manage configuration
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,

        /// Initialize default configuration file
        #[arg(short, long)]
        init: bool,
    },

    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, host, port } => {
            let mut config = load_config(config.as_deref())?;
            init_logging(cli.verbose, cli.debug, &config.log_level);
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.http_port = port;
            }
            run_serve(config).await?;
        }
        Commands::Tail { url, topic, last_event_id } => {
            init_logging(cli.verbose, cli.debug, "warn");
            run_tail(TailOptions { url, topic, last_event_id }).await?;
        }
        Commands::Config { show, init } => {
            manage_config(show, init)?;
        }
        Commands::Version => {
            print_version();
        }
    }

    Ok(())
}

/// `--debug` and `--verbose` win over the configured level; `RUST_LOG` wins over both.
fn init_logging(verbose: bool, debug: bool, configured: &str) {
    let level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        configured
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn load_config(path: Option<&str>) -> Result<Config> {
    if let Some(path) = path {
        return Config::load(path);
    }
    let default_path = Config::default_path();
    if default_path.exists() {
        Config::load(&default_path.to_string_lossy())
    } else {
        Ok(Config::default())
    }
}

fn print_version() {
    println!(
        "  {}✦{} {}Stream Relay{} {}v{}{}",
        BOLD, RESET, BOLD, RESET, AURORA_BLUE, env!("CARGO_PKG_VERSION"), RESET
    );
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
}

async fn run_serve(config: Config) -> Result<()> {
    println!(
        "{}╭─────────────────────────────────────────────────────╮{}",
        AURORA_BLUE, RESET
    );
    println!(
        "{}│{} {}✦ Stream Relay Starting{}",
        AURORA_BLUE, RESET, BOLD, RESET
    );
    println!(
        "{}│{} {}🌐 Listen:{}  http://{}:{}",
        AURORA_BLUE, RESET, DIM, RESET, config.host, config.http_port
    );
    println!(
        "{}│{} {}📚 History:{} {} events ({:?})",
        AURORA_BLUE, RESET, DIM, RESET, config.history_capacity, config.capacity_scope
    );
    println!(
        "{}╰─────────────────────────────────────────────────────╯{}",
        AURORA_BLUE, RESET
    );

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    info!("Starting Stream Relay");
    api::run_web_server(&config, shutdown).await?;

    println!("  {}✦ Shut down gracefully{}", COSMIC_VIOLET, RESET);
    Ok(())
}

async fn run_tail(opts: TailOptions) -> Result<()> {
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    println!("{}✦ Following {}{}", DIM, opts.url, RESET);
    client::tail(&opts, shutdown, print_event).await
}

fn print_event(event: &Event) {
    let color = match event.kind {
        EventKind::Message => PULSE_CYAN,
        EventKind::Heartbeat => DIM,
    };
    println!(
        "{}{:>6}{} {}{:<9}{} {}",
        BOLD, event.id, RESET, color, event.kind.as_str(), RESET, event.payload
    );
}

fn manage_config(show: bool, init: bool) -> Result<()> {
    let config_path = Config::default_path();
    let config_path_str = config_path.to_string_lossy().to_string();

    if init {
        if let Some(dir) = config_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        Config::default().save(&config_path_str)?;
        println!("{}✦ Configuration created at {}{}", PULSE_CYAN, config_path_str, RESET);
        return Ok(());
    }

    if show || !init {
        let config = if config_path.exists() {
            Config::load(&config_path_str)?
        } else {
            println!("{}✦ No config file found, showing defaults{}", COSMIC_VIOLET, RESET);
            Config::default()
        };
        println!("{}", serde_json::to_string_pretty(&config)?);
    }

    Ok(())
}
