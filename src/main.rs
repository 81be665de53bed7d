//! Nagare proxy binary.
//!
//! Starts every protocol surface against one shared state backend and runs
//! until SIGINT/SIGTERM, then drains within the configured grace window.
//!
//! ## Usage
//!
//! ```bash
//! # Single-proxy deployment, in-memory state
//! nagare
//!
//! # Fleet deployment, shared state in Redis
//! PROXY_LOAD_BALANCER_TYPE=redis PROXY_REDIS_HOST=10.0.0.9 nagare
//! ```

use std::future::Future;

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use nagare::{api, balancer, proxy, Config, LoadBalancerKind, SessionTracker, StreamRouter};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nagare=info".parse().unwrap()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env()?;
    info!("Nagare proxy starting");
    info!("  RTMP server: {}", config.rtmp_server);
    info!("  HTTP server: {}", config.http_server);
    info!("  HTTP API: {}", config.http_api);
    info!("  WebRTC server (udp): {}", config.webrtc_server);
    info!("  SRT server (udp): {}", config.srt_server);
    info!("  System API: {}", config.system_api);
    match config.load_balancer {
        LoadBalancerKind::Memory => info!("  State backend: memory"),
        LoadBalancerKind::Redis => {
            info!("  State backend: redis {}:{}/{}", config.redis_host, config.redis_port, config.redis_db)
        }
    }

    let cancel = CancellationToken::new();

    let lb = balancer::new_load_balancer(&config);
    lb.initialize(&config, cancel.clone()).await?;

    let router = StreamRouter::new(lb.clone());
    let tracker = SessionTracker::new(lb.clone());

    let tasks = TaskTracker::new();
    spawn_server(&tasks, &cancel, "rtmp", proxy::run_rtmp_server(
        router.clone(),
        config.rtmp_server,
        cancel.clone(),
    ));
    spawn_server(&tasks, &cancel, "http", proxy::run_http_server(
        router.clone(),
        tracker.clone(),
        config.http_server,
        config.static_files.clone(),
        cancel.clone(),
    ));
    spawn_server(&tasks, &cancel, "http-api", proxy::run_http_api_server(
        router.clone(),
        tracker.clone(),
        config.http_api,
        cancel.clone(),
    ));
    spawn_server(&tasks, &cancel, "webrtc", proxy::run_webrtc_server(
        router.clone(),
        tracker.clone(),
        config.webrtc_server,
        cancel.clone(),
    ));
    spawn_server(&tasks, &cancel, "srt", proxy::run_srt_server(
        router,
        config.srt_server,
        cancel.clone(),
    ));
    spawn_server(&tasks, &cancel, "system-api", api::run_system_api(
        lb,
        config.system_api,
        cancel.clone(),
    ));

    // Shutdown on SIGINT/SIGTERM.
    let mut term = signal(SignalKind::terminate())?;
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        info!("shutdown signal received");
        signal_cancel.cancel();
    });

    cancel.cancelled().await;

    // Watchdog on a plain OS thread: it outlives the grace window and the
    // runtime teardown, so a wedged drain still terminates the process. A
    // clean exit ends the process first and the thread with it.
    let force_quit = config.force_quit_timeout;
    std::thread::spawn(move || {
        std::thread::sleep(force_quit);
        warn!("force quit timeout reached, exiting");
        std::process::exit(1);
    });

    tasks.close();
    if tokio::time::timeout(config.grace_quit_timeout, tasks.wait())
        .await
        .is_err()
    {
        warn!("grace quit timeout reached with tasks still running");
    }

    info!("Nagare proxy done");
    Ok(())
}

fn spawn_server<F>(tasks: &TaskTracker, cancel: &CancellationToken, name: &'static str, server: F)
where
    F: Future<Output = nagare::Result<()>> + Send + 'static,
{
    let cancel = cancel.clone();
    tasks.spawn(async move {
        match server.await {
            Ok(()) => info!(server = name, "server stopped"),
            Err(e) => {
                error!(server = name, error = %e, "server failed");
                // One dead surface takes the proxy down rather than limping.
                cancel.cancel();
            }
        }
    });
}
