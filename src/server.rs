use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::console::{Console, PromptSink};
use crate::constants::TICK_MS;
use crate::engine::GameEngine;
use crate::http_api::{self, ApiContext};
use crate::mazegen::MazeGenerator;
use crate::net;
use crate::registry::PlayerRegistry;
use crate::state::{now_ms, ServerState, SharedState};
use crate::store::DataStore;

pub struct ServerOptions {
    pub port: u16,
    pub data_dir: PathBuf,
    pub web_root: PathBuf,
    /// Interactive operator console; off for tests and service deployments
    /// without a terminal.
    pub console: Option<Arc<PromptSink>>,
}

/// The running server: all workers wired, shutdown ordering owned here.
pub struct Server {
    pub http_addr: SocketAddr,
    pub ws_addr: SocketAddr,
    pub state: SharedState,
    pub broadcaster: Arc<Broadcaster>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_request_rx: mpsc::Receiver<()>,
    listener_task: JoinHandle<()>,
    http_task: JoinHandle<()>,
    tick_task: JoinHandle<()>,
    console_task: Option<JoinHandle<()>>,
}

impl Server {
    /// Construction order: store, config, maze (loaded or generated),
    /// engine, registry, sockets, workers. Any failure here aborts startup.
    pub async fn start(options: ServerOptions) -> io::Result<Server> {
        let store = DataStore::open(&options.data_dir)?;
        let config = store.load_config();

        let maze_data = match store.load_maze() {
            Some(data) => {
                info!("loaded existing maze data");
                data
            }
            None => {
                info!("no maze data found, generating a new maze");
                let data = MazeGenerator::new(
                    config.maze_width,
                    config.maze_height,
                    config.maze_layers,
                    now_ms() as u32,
                )
                .generate();
                store.save_maze(&data);
                data
            }
        };
        let engine = GameEngine::new(maze_data, now_ms() as u32);
        let registry = PlayerRegistry::load(store.players_path());

        let http_listener =
            TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], options.port))).await?;
        let http_addr = http_listener.local_addr()?;
        // the game socket rides one port above the http surface
        let ws_port = if options.port == 0 { 0 } else { options.port + 1 };
        let ws_listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], ws_port))).await?;
        let ws_addr = ws_listener.local_addr()?;

        let state: SharedState = Arc::new(Mutex::new(ServerState::new(
            engine,
            registry,
            store,
            config,
            ws_addr.port(),
        )));
        let broadcaster = Arc::new(Broadcaster::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (shutdown_request_tx, shutdown_request_rx) = mpsc::channel(1);

        let listener_task = tokio::spawn(net::run_listener(
            ws_listener,
            state.clone(),
            broadcaster.clone(),
            shutdown_rx.clone(),
        ));

        let app = http_api::router(
            ApiContext {
                state: state.clone(),
                broadcaster: broadcaster.clone(),
            },
            options.web_root.clone(),
        );
        let http_shutdown = shutdown_rx.clone();
        let http_task = tokio::spawn(async move {
            if let Err(error) = http_api::serve(http_listener, app, http_shutdown).await {
                error!(%error, "http surface failed");
            }
        });

        let tick_task = tokio::spawn(tick_loop(state.clone(), shutdown_rx.clone()));

        let console_task = options.console.map(|sink| {
            let console = Console::new(state.clone(), broadcaster.clone());
            tokio::spawn(crate::console::run_console(
                console,
                sink,
                shutdown_rx,
                shutdown_request_tx,
            ))
        });

        info!(%http_addr, %ws_addr, "server started");
        Ok(Server {
            http_addr,
            ws_addr,
            state,
            broadcaster,
            shutdown_tx,
            shutdown_request_rx,
            listener_task,
            http_task,
            tick_task,
            console_task,
        })
    }

    /// Blocks until SIGINT, SIGTERM, or a console `quit` arrives.
    pub async fn wait_for_shutdown_signal(&mut self) {
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(signal) => signal,
                Err(error) => {
                    error!(%error, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                _ = sigterm.recv() => info!("terminate received"),
                _ = self.shutdown_request_rx.recv() => info!("shutdown requested"),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                _ = self.shutdown_request_rx.recv() => info!("shutdown requested"),
            }
        }
    }

    /// Strict teardown: flag, listener (which closes and joins every
    /// connection), tick loop, console, then durable state.
    pub async fn shutdown(self) {
        info!("shutting down");
        let _ = self.shutdown_tx.send(true);

        if tokio::time::timeout(Duration::from_secs(3), self.listener_task)
            .await
            .is_err()
        {
            warn!("game listener missed the shutdown deadline");
        }
        if tokio::time::timeout(Duration::from_secs(2), self.http_task)
            .await
            .is_err()
        {
            warn!("http surface missed the shutdown deadline");
        }
        if tokio::time::timeout(Duration::from_secs(1), self.tick_task)
            .await
            .is_err()
        {
            warn!("tick loop missed the shutdown deadline");
        }
        if let Some(console_task) = self.console_task {
            if tokio::time::timeout(Duration::from_secs(1), console_task)
                .await
                .is_err()
            {
                warn!("console detached during shutdown");
            }
        }

        // persistence failures must never halt the shutdown
        let guard = self.state.lock().await;
        guard.registry.save();
        guard.store.create_backup();
        info!("shutdown complete");
    }
}

/// Fixed-period driver for the engine's timers. A missed deadline bursts
/// one immediate catch-up tick, then the cadence resumes.
async fn tick_loop(state: SharedState, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_millis(TICK_MS));
    interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                let mut guard = state.lock().await;
                let report = guard.engine.tick(now_ms());
                if report.walls_repaired > 0 || report.traps_expired > 0 {
                    debug!(
                        walls = report.walls_repaired,
                        traps = report.traps_expired,
                        "tick expirations"
                    );
                }
            }
        }
    }
    debug!("tick loop stopped");
}
