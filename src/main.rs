use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

use advice_board::{api, config::Config, utils};

#[derive(Parser)]
#[command(name = "advice-board", version, about = "Community advice board and bulletin API")]
struct AppCli {
    /// Run in daemon mode (background)
    #[arg(long)]
    daemon: bool,

    /// Config file path
    #[arg(short, long, default_value = "config.json", global = true)]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        /// Overrides the configured port
        #[arg(long)]
        port: Option<u16>,
    },
}

fn run_daemon() -> Result<()> {
    use daemonize::Daemonize;
    let daemonize = Daemonize::new()
        .pid_file("advice-board.pid")
        .working_directory(".")
        .umask(0o027)
        .privileged_action(|| {
            info!("daemon started");
        });

    daemonize.start().map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}

fn main() -> Result<()> {
    let args = AppCli::parse();
    // Fork before the runtime starts its worker threads.
    if args.daemon {
        run_daemon()?;
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(args))
}

async fn run(args: AppCli) -> Result<()> {
    utils::logging::init();

    let config = Config::load(&args.config)?;
    let port = match args.command {
        Some(Commands::Serve { port: Some(port) }) => port,
        Some(Commands::Serve { port: None }) | None => config.port,
    };

    info!(version = advice_board::VERSION, port, "starting advice board");
    let state = Arc::new(api::AppState::new(config)?);
    api::serve(state, port).await
}
