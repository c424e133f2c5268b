#![allow(dead_code)]

mod admission;
mod common;
mod config;
mod crypto;
mod error;
mod inbound;
mod relay;
mod stats;
mod tls;
mod tunnel;
mod ws;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{error, info, warn};

pub use config::Config;
pub use error::{ConfigError, StartupError};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// How long a graceful shutdown waits for in-flight flows to drain on
/// their own before the process exits regardless.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Runs the proxy to completion: loads configuration, binds both inbound
/// listeners, spawns the accept loops and background counters, then waits
/// for a shutdown signal before draining in-flight flows and returning.
pub async fn run() -> ExitCode {
	let config = match Config::from_env() {
		Ok(config) => Arc::new(config),
		Err(err) => {
			error!(error = %err, "failed to load configuration");
			return ExitCode::FAILURE;
		}
	};

	let (socks_listener, http_listener) = match admission::bind_listeners(&config).await {
		Ok(listeners) => listeners,
		Err(err) => {
			error!(error = %err, "failed to bind listener");
			return ExitCode::FAILURE;
		}
	};

	let stats = stats::Stats::new();
	let gate = Arc::new(Semaphore::new(config.tunables.max_concurrent_connections));

	info!(
		name = %config.name,
		socks_port = config.socks_port,
		http_port = config.http_port,
		"secure-proxy starting"
	);

	let socks_task = tokio::spawn(admission::accept_loop(
		socks_listener,
		admission::Protocol::Socks5,
		Arc::clone(&config),
		Arc::clone(&stats),
		Arc::clone(&gate),
	));
	let http_task = tokio::spawn(admission::accept_loop(
		http_listener,
		admission::Protocol::HttpConnect,
		Arc::clone(&config),
		Arc::clone(&stats),
		Arc::clone(&gate),
	));
	let reporter_task = tokio::spawn(stats::traffic_reporter(Arc::clone(&stats)));
	let health_task = tokio::spawn(stats::health_monitor(Arc::clone(&stats)));

	wait_for_shutdown_signal().await;
	info!("shutdown signal received, no longer accepting new flows");

	socks_task.abort();
	http_task.abort();
	reporter_task.abort();
	health_task.abort();

	drain(&stats).await;

	ExitCode::SUCCESS
}

/// Waits for SIGINT or SIGTERM. Falls back to only `ctrl_c` on platforms
/// without Unix signals.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
	use tokio::signal::unix::{signal, SignalKind};

	let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

	tokio::select! {
		_ = tokio::signal::ctrl_c() => {}
		_ = sigterm.recv() => {}
	}
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
}

/// Polls the active-connection counter until it reaches zero or
/// [`SHUTDOWN_GRACE_PERIOD`] elapses, whichever comes first.
async fn drain(stats: &Arc<stats::Stats>) {
	let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE_PERIOD;

	while tokio::time::Instant::now() < deadline {
		if stats.active_connections.load(std::sync::atomic::Ordering::Relaxed) <= 0 {
			info!("all flows drained, exiting");
			return;
		}
		tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
	}

	warn!("shutdown grace period elapsed with flows still active, exiting anyway");
}
