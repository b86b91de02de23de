use clap::{Parser, Subcommand};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use dronehub::{api, config::HubConfig, hub::Hub, paths};

#[derive(Parser)]
#[command(name = "dronehub")]
#[command(version)]
#[command(about = "Control plane for ephemeral, per-task development containers")]
#[command(long_about = "\
dronehub orchestrates fleets of per-task development containers (drones).

Each drone runs an LLM coding agent against a cloned working copy of a host
repository and exposes a terminal session, a working-tree diff surface, and
HTTP preview ports. The hub aggregates fleet state, routes prompts, relays
terminal I/O, and moves code between drone branches and the host repo with
native git.")]
#[command(after_long_help = "\
QUICK START:
    dronehub daemon
    curl -X POST localhost:3080/api/repos -d '{\"path\":\"~/project\"}'
    curl -X POST localhost:3080/api/drones -d @queue.json

ENVIRONMENT VARIABLES:
    RUST_LOG              Log level filter (default: dronehub=info)
    DRONEHUB_DATA_DIR     Base data directory (default: ~/.dronehub)
    DRONEHUB_LOG_FORMAT   'text' (default) or 'json'
    DRONEHUB_BIND_ADDR    HTTP bind address (default: 127.0.0.1)
    GITHUB_TOKEN          Hosting-service API token
    DRONEHUB_NAMING_KEY   API key for the name-draft endpoint

FILE LOCATIONS:
    ~/.dronehub/               Base directory for all data
    ~/.dronehub/registry.json  Drone registry snapshot
    ~/.dronehub/config.toml    Main configuration file
    ~/.dronehub/logs/          Log files (daily rotation)

Use 'dronehub config' to inspect current configuration and paths.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the hub daemon
    Daemon {
        /// HTTP server port
        #[arg(long)]
        http_port: Option<u16>,

        /// HTTP bind address
        #[arg(long, env = "DRONEHUB_BIND_ADDR")]
        bind_addr: Option<String>,
    },

    /// Print the resolved configuration and data paths
    Config,
}

fn init_tracing() -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let logs_dir = paths::logs_dir();
    std::fs::create_dir_all(&logs_dir)?;
    let file_appender = tracing_appender::rolling::daily(&logs_dir, "dronehub.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dronehub=info"));

    let json_format = std::env::var("DRONEHUB_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let stderr_layer = if json_format {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed()
    };
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .boxed();

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

#[tokio::main]
#[allow(clippy::print_stdout, reason = "the config subcommand prints to stdout")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing()?;

    match cli.command {
        Commands::Daemon {
            http_port,
            bind_addr,
        } => {
            let mut config = HubConfig::load()?;
            if let Some(port) = http_port {
                config.http_port = port;
            }
            if let Some(addr) = bind_addr {
                config.bind_addr = addr;
            }
            run_daemon(config).await
        }
        Commands::Config => {
            let config = HubConfig::load()?;
            let rendered = toml::to_string_pretty(&config)?;
            tracing::info!(
                data_dir = %paths::data_dir().display(),
                snapshot = %paths::registry_snapshot_path().display(),
                "resolved paths"
            );
            println!("{rendered}");
            Ok(())
        }
    }
}

async fn run_daemon(config: HubConfig) -> anyhow::Result<()> {
    let bind_addr = config.bind_addr.clone();
    let http_port = config.http_port;

    let hub = Hub::new(config, &paths::registry_snapshot_path())?;
    hub.startup().await;

    // Ctrl-C flips the shutdown token: streams close with 1001, watcher
    // tasks stop, the server drains.
    let shutdown_hub = std::sync::Arc::clone(&hub);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            shutdown_hub.begin_shutdown();
        }
    });

    api::serve(hub, &bind_addr, http_port).await
}
