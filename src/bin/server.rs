use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use maze_game_server::console::{PromptSink, PromptWriter};
use maze_game_server::server::{Server, ServerOptions};

#[derive(Parser, Debug)]
#[command(
    name = "maze-game-server",
    version,
    about = "Authoritative server for the multi-layer 3D maze game"
)]
struct Args {
    /// HTTP port; the game socket listens one port above
    #[arg(short = 'p', long, default_value_t = 8080)]
    port: u16,

    /// Data directory for persisted state
    #[arg(short = 'd', long, default_value = "./Data")]
    data: PathBuf,

    /// Web root for static assets
    #[arg(short = 'w', long, default_value = "./web")]
    web: PathBuf,

    /// Disable console log output
    #[arg(long)]
    no_console_log: bool,

    /// Disable file log output
    #[arg(long)]
    no_file_log: bool,

    /// Log level
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

fn init_logging(args: &Args, sink: Arc<PromptSink>) -> Result<(), String> {
    let filter: LevelFilter = args.log_level.into();

    let console_layer = if args.no_console_log {
        None
    } else {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(PromptWriter::new(sink))
                .with_target(false)
                .with_filter(filter),
        )
    };

    let file_layer = if args.no_file_log {
        None
    } else {
        let path = args.data.join("server.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|error| format!("cannot open log file {}: {error}", path.display()))?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .with_filter(filter),
        )
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args = Args::parse();

    if let Err(error) = std::fs::create_dir_all(&args.data) {
        eprintln!("cannot create data directory {}: {error}", args.data.display());
        return 1;
    }
    let sink = Arc::new(PromptSink::new());
    if let Err(message) = init_logging(&args, sink.clone()) {
        eprintln!("{message}");
        return 1;
    }

    let options = ServerOptions {
        port: args.port,
        data_dir: args.data.clone(),
        web_root: args.web.clone(),
        console: Some(sink),
    };
    let mut server = match Server::start(options).await {
        Ok(server) => server,
        Err(error) => {
            error!(%error, "initialization failed");
            return 1;
        }
    };

    info!("web surface:  http://localhost:{}", server.http_addr.port());
    info!("game socket:  ws://localhost:{}", server.ws_addr.port());
    info!("type 'help' for operator commands, 'quit' to stop");

    server.wait_for_shutdown_signal().await;
    server.shutdown().await;
    0
}
