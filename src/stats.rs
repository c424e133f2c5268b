//! Process-wide traffic and health counters, plus the periodic reporter
//! and health-monitor loops that read them.

// ----------

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

const REPORT_INTERVAL: Duration = Duration::from_secs(5);
const EMA_ALPHA: f64 = 0.2;
const DEGRADED_FAILURE_RATIO: f64 = 0.5;
const DEGRADED_ENTER_THRESHOLD: i64 = 10;

// --------------------------------------------------
// Stats

/// Process-lifetime counters, shared across every flow via `Arc`.
#[derive(Default)]
pub(crate) struct Stats {
	pub(crate) traffic_up: AtomicU64,
	pub(crate) traffic_down: AtomicU64,
	pub(crate) active_connections: AtomicI64,
	pub(crate) success_connections: AtomicU64,
	pub(crate) failed_connections: AtomicU64,
	pub(crate) timeout_connections: AtomicU64,
	pub(crate) buffer_overflows: AtomicU64,
	pub(crate) drain_operations: AtomicU64,
	pub(crate) health_failures: AtomicI64,
	pub(crate) degraded_mode: AtomicBool,
}

impl Stats {
	pub(crate) fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Called on admission: reserves one unit of `active_connections`.
	pub(crate) fn admit(&self) {
		self.active_connections.fetch_add(1, Ordering::Relaxed);
	}

	/// Called exactly once per admitted flow on any exit path.
	pub(crate) fn release(&self) {
		self.active_connections.fetch_sub(1, Ordering::Relaxed);
	}
}

// --------------------------------------------------------------------------------

/// Every [`REPORT_INTERVAL`], computes up/down throughput for the elapsed
/// window, updates an exponential moving average and peak of the
/// downstream speed, resets the window counters, and logs the result.
pub(crate) async fn traffic_reporter(stats: Arc<Stats>) {
	let mut avg_down_kbps = 0.0f64;
	let mut peak_down_kbps = 0.0f64;

	loop {
		tokio::time::sleep(REPORT_INTERVAL).await;

		let up = stats.traffic_up.swap(0, Ordering::Relaxed);
		let down = stats.traffic_down.swap(0, Ordering::Relaxed);

		let secs = REPORT_INTERVAL.as_secs_f64();
		let up_kbps = up as f64 / 1024.0 / secs;
		let down_kbps = down as f64 / 1024.0 / secs;

		avg_down_kbps = EMA_ALPHA * down_kbps + (1.0 - EMA_ALPHA) * avg_down_kbps;
		peak_down_kbps = peak_down_kbps.max(down_kbps);

		info!(
			up_kbps = format!("{up_kbps:.1}"),
			down_kbps = format!("{down_kbps:.1}"),
			avg_down_kbps = format!("{avg_down_kbps:.1}"),
			peak_down_kbps = format!("{peak_down_kbps:.1}"),
			active = stats.active_connections.load(Ordering::Relaxed),
			"traffic report"
		);
	}
}

/// Every [`REPORT_INTERVAL`], inspects the rolling success/failure ratio
/// and walks `health_failures` toward or away from `degraded_mode`.
pub(crate) async fn health_monitor(stats: Arc<Stats>) {
	loop {
		tokio::time::sleep(REPORT_INTERVAL).await;

		let success = stats.success_connections.load(Ordering::Relaxed);
		let failed = stats.failed_connections.load(Ordering::Relaxed);
		let total = success + failed;

		let failing = total > 0 && (failed as f64 / total as f64) > DEGRADED_FAILURE_RATIO;

		let failures = if failing {
			stats.health_failures.fetch_add(1, Ordering::Relaxed) + 1
		} else {
			let previous = stats.health_failures.load(Ordering::Relaxed);
			if previous > 0 {
				stats.health_failures.fetch_sub(1, Ordering::Relaxed) - 1
			} else {
				previous
			}
		};

		let was_degraded = stats.degraded_mode.load(Ordering::Relaxed);

		if failures >= DEGRADED_ENTER_THRESHOLD && !was_degraded {
			stats.degraded_mode.store(true, Ordering::Relaxed);
			warn!(failures, "entering degraded mode: failure rate exceeded threshold");
		} else if failures <= 0 && was_degraded {
			stats.degraded_mode.store(false, Ordering::Relaxed);
			info!("recovered from degraded mode");
		}
	}
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn admit_and_release_are_balanced() {
		let stats = Stats::new();

		stats.admit();
		stats.admit();
		assert_eq!(stats.active_connections.load(Ordering::Relaxed), 2);

		stats.release();
		stats.release();
		assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn health_monitor_enters_and_recovers_degraded_mode() {
		let stats = Stats::new();
		for _ in 0..20 {
			stats.failed_connections.fetch_add(1, Ordering::Relaxed);
		}

		let handle = tokio::spawn(health_monitor(Arc::clone(&stats)));

		for _ in 0..10 {
			tokio::time::advance(REPORT_INTERVAL).await;
			tokio::task::yield_now().await;
		}
		assert!(stats.degraded_mode.load(Ordering::Relaxed));

		stats.failed_connections.store(0, Ordering::Relaxed);
		stats.success_connections.fetch_add(1, Ordering::Relaxed);

		for _ in 0..10 {
			tokio::time::advance(REPORT_INTERVAL).await;
			tokio::task::yield_now().await;
		}
		assert!(!stats.degraded_mode.load(Ordering::Relaxed));

		handle.abort();
	}
}
