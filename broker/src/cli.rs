//! CLI argument parsing and process entry.
//!
//! All three long-running processes bootstrap identically: validate env,
//! warm the clients, register signal handlers, run until shutdown.

use std::time::Duration;

use argh::FromArgs;
use numio_api::server::{LayerConfig, spawn_server_task};
use numio_tokio::notify_once::NotifyOnce;
use numio_tokio::task::{self, NxTask};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::Config;
use crate::context::AppContext;
use crate::{server, socket, worker};

/// How long workers get to drain after the shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(FromArgs)]
/// numio marketplace broker
pub struct Args {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Api(ApiCommand),
    Worker(WorkerCommand),
    Socket(SocketCommand),
}

/// Run the HTTP API server.
#[derive(FromArgs)]
#[argh(subcommand, name = "api")]
struct ApiCommand {}

/// Run the queue worker.
#[derive(FromArgs)]
#[argh(subcommand, name = "worker")]
struct WorkerCommand {}

/// Run the WebSocket fan-out server.
#[derive(FromArgs)]
#[argh(subcommand, name = "socket")]
struct SocketCommand {}

impl Args {
    pub fn run(self) -> anyhow::Result<()> {
        let config = Config::from_env()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;

        match self.command {
            Command::Api(_) => runtime.block_on(run_api(config)),
            Command::Worker(_) => runtime.block_on(run_worker(config)),
            Command::Socket(_) => runtime.block_on(run_socket(config)),
        }
    }
}

/// Trip the shutdown signal on SIGINT/SIGTERM.
fn spawn_signal_handler(shutdown: NotifyOnce) -> NxTask<()> {
    NxTask::spawn("signal-handler", async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            )
            .expect("Failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => (),
                _ = sigterm.recv() => (),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("Shutdown signal received");
        shutdown.send();
    })
}

async fn run_api(config: Config) -> anyhow::Result<()> {
    let (ctx, mut tasks) = AppContext::build(&config, "api").await?;
    let shutdown = ctx.shutdown.clone();
    spawn_signal_handler(shutdown.clone()).detach();

    let router = server::router(ctx.clone());
    let (server_task, addr) = spawn_server_task(
        config.bind_addr,
        router,
        LayerConfig::default(),
        "api",
        shutdown.clone(),
    )
    .await?;
    info!("API server on {addr}");
    tasks.push(server_task);

    let (_eph_tx, eph_rx) = mpsc::channel(16);
    task::join_tasks_and_shutdown(
        "api",
        tasks,
        eph_rx,
        shutdown,
        SHUTDOWN_TIMEOUT,
    )
    .await;
    Ok(())
}

async fn run_worker(config: Config) -> anyhow::Result<()> {
    let (ctx, mut tasks) = AppContext::build(&config, "worker").await?;
    let shutdown = ctx.shutdown.clone();
    spawn_signal_handler(shutdown.clone()).detach();

    let worker_ctx = ctx.clone();
    let worker_shutdown = shutdown.clone();
    tasks.push(NxTask::spawn("worker-loop", async move {
        if let Err(e) = worker::run(worker_ctx, worker_shutdown).await {
            tracing::error!("Worker loop errored: {e:#}");
        }
    }));

    let (_eph_tx, eph_rx) = mpsc::channel(16);
    task::join_tasks_and_shutdown(
        "worker",
        tasks,
        eph_rx,
        shutdown,
        SHUTDOWN_TIMEOUT,
    )
    .await;
    Ok(())
}

async fn run_socket(config: Config) -> anyhow::Result<()> {
    let (ctx, mut tasks) = AppContext::build(&config, "socket").await?;
    let shutdown = ctx.shutdown.clone();
    spawn_signal_handler(shutdown.clone()).detach();

    let feed = socket::EventFeed::new();
    tasks.push(socket::spawn_redis_relay(
        config.redis_url.clone(),
        feed.clone(),
        shutdown.clone(),
    ));

    let (server_task, addr) = socket::serve(
        ctx.clone(),
        feed,
        config.socket_bind_addr,
        shutdown.clone(),
    )
    .await?;
    info!("Socket server on {addr}");
    tasks.push(server_task);

    let (_eph_tx, eph_rx) = mpsc::channel(16);
    task::join_tasks_and_shutdown(
        "socket",
        tasks,
        eph_rx,
        shutdown,
        SHUTDOWN_TIMEOUT,
    )
    .await;
    Ok(())
}
