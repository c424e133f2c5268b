//! Connection admission: the two loopback listeners, the concurrency
//! gate, and the per-flow supervisor that wires the inbound protocol
//! parser to the tunnel and the relay loop.

// ----------

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{FlowError, StartupError};
use crate::inbound::{http_connect, socks5};
use crate::relay;
use crate::stats::Stats;
use crate::tunnel;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

const LISTEN_BACKLOG: u32 = 256;

#[derive(Clone, Copy)]
pub(crate) enum Protocol {
	Socks5,
	HttpConnect,
}

// --------------------------------------------------------------------------------

/// Binds both loopback listeners. Returns a [`StartupError`] if either
/// bind fails; the process is expected to exit non-zero in that case.
pub(crate) async fn bind_listeners(config: &Config) -> Result<(TcpListener, TcpListener), StartupError> {
	let socks_addr = format!("127.0.0.1:{}", config.socks_port);
	let socks_listener = bind(&socks_addr).await?;

	let http_addr = format!("127.0.0.1:{}", config.http_port);
	let http_listener = bind(&http_addr).await?;

	Ok((socks_listener, http_listener))
}

async fn bind(addr: &str) -> Result<TcpListener, StartupError> {
	let bind_err = |source| StartupError::ListenerBindFailed {
		addr: addr.to_string(),
		source,
	};

	let socket_addr: std::net::SocketAddr = addr
		.parse()
		.map_err(|err| bind_err(std::io::Error::new(std::io::ErrorKind::InvalidInput, err)))?;

	let socket = socket2::Socket::new(
		socket2::Domain::for_address(socket_addr),
		socket2::Type::STREAM,
		Some(socket2::Protocol::TCP),
	)
	.map_err(bind_err)?;

	socket.set_reuse_address(true).map_err(bind_err)?;
	socket.set_nonblocking(true).map_err(bind_err)?;
	socket.bind(&socket_addr.into()).map_err(bind_err)?;
	socket
		.listen(LISTEN_BACKLOG as i32)
		.map_err(bind_err)?;

	TcpListener::from_std(socket.into()).map_err(bind_err)
}

/// Accepts connections on `listener` forever, admitting each one through
/// `gate` and spawning its flow supervisor. Never returns under normal
/// operation; an accept error is logged and the loop continues.
pub(crate) async fn accept_loop(
	listener: TcpListener,
	protocol: Protocol,
	config: Arc<Config>,
	stats: Arc<Stats>,
	gate: Arc<Semaphore>,
) {
	loop {
		let (inbound, peer) = match listener.accept().await {
			Ok(pair) => pair,
			Err(err) => {
				warn!(error = %err, "accept failed");
				continue;
			}
		};

		let Ok(permit) = Arc::clone(&gate).acquire_owned().await else {
			// The semaphore is never closed, so this is unreachable in
			// practice; drop the connection defensively if it happens.
			continue;
		};

		let guard = AdmissionGuard::new(permit, Arc::clone(&stats));
		let config = Arc::clone(&config);
		let stats = Arc::clone(&stats);

		tokio::spawn(async move {
			let _guard = guard;
			run_flow(inbound, peer, protocol, &config, &stats).await;
		});
	}
}

/// Holds one semaphore permit and reserves one unit of `active_connections`
/// for the lifetime of a single flow. Releasing both happens in `Drop`
/// rather than as a separate statement after the flow runs, so a panic
/// unwinding out of `run_flow` still frees the slot and decrements the
/// counter exactly once.
struct AdmissionGuard {
	_permit: OwnedSemaphorePermit,
	stats: Arc<Stats>,
}

impl AdmissionGuard {
	fn new(permit: OwnedSemaphorePermit, stats: Arc<Stats>) -> Self {
		stats.admit();
		AdmissionGuard {
			_permit: permit,
			stats,
		}
	}
}

impl Drop for AdmissionGuard {
	fn drop(&mut self) {
		self.stats.release();
	}
}

/// Runs one admitted flow end to end: parse the inbound protocol request,
/// reject self-targeting loops, establish the tunnel within the
/// connection budget, reply to the client, then relay until either side
/// ends or the session deadline is hit. Every error is swallowed here —
/// the client only ever observes a closed socket.
///
/// This is the flow's single exit point for counter bookkeeping: exactly
/// one of `success_connections` or `failed_connections` is incremented
/// here for every admitted flow, regardless of which stage the flow
/// failed at (inbound parse, loop prevention, tunnel establishment, or
/// the outer connection-timeout below), with `timeout_connections` also
/// incremented whenever the terminal error is a timeout.
async fn run_flow(mut inbound: TcpStream, peer: std::net::SocketAddr, protocol: Protocol, config: &Config, stats: &Arc<Stats>) {
	if let Err(err) = tune_inbound(&inbound) {
		warn!(error = %err, "failed to tune inbound socket");
	}

	let established = timeout(
		config.tunables.connection_timeout,
		establish_flow(&mut inbound, protocol, config),
	)
	.await;

	let mut tunnel = match established {
		Ok(Ok(tunnel)) => {
			stats.success_connections.fetch_add(1, Ordering::Relaxed);
			tunnel
		}
		Ok(Err(err)) => {
			stats.failed_connections.fetch_add(1, Ordering::Relaxed);
			if err.is_timeout() {
				stats.timeout_connections.fetch_add(1, Ordering::Relaxed);
			}
			warn!(%peer, error = %err, "flow establishment failed");
			return;
		}
		Err(_) => {
			stats.failed_connections.fetch_add(1, Ordering::Relaxed);
			stats.timeout_connections.fetch_add(1, Ordering::Relaxed);
			warn!(%peer, "flow establishment exceeded the connection budget");
			return;
		}
	};

	relay::run(inbound, &mut tunnel, &config.tunables, stats).await;
}

/// Parses the inbound protocol request, rejects self-targeting loops,
/// establishes the tunnel, and replies to the client. Bounded by the
/// caller's `connection_timeout`; the relay phase that follows has its
/// own, separate session deadline.
async fn establish_flow(
	inbound: &mut TcpStream,
	protocol: Protocol,
	config: &Config,
) -> Result<tunnel::Tunnel, FlowError> {
	let target = match protocol {
		Protocol::Socks5 => socks5::parse_request(inbound).await?,
		Protocol::HttpConnect => http_connect::parse_request(inbound).await?,
	};

	let (host, port) = split_host_port(&target)?;

	if config.is_self_target(host, port) {
		return Err(FlowError::LoopPrevention);
	}

	let tunnel = tunnel::establish(config, &target).await?;

	match protocol {
		Protocol::Socks5 => socks5::write_success(inbound).await?,
		Protocol::HttpConnect => http_connect::write_success(inbound).await?,
	}

	info!(target = %target, "flow established");

	Ok(tunnel)
}

fn split_host_port(target: &str) -> Result<(&str, u16), FlowError> {
	let (host, port) = target
		.rsplit_once(':')
		.ok_or_else(|| FlowError::InboundProtocolError("missing port in target".into()))?;
	let port: u16 = port
		.parse()
		.map_err(|_| FlowError::InboundProtocolError("invalid port in target".into()))?;
	Ok((host, port))
}

fn tune_inbound(stream: &TcpStream) -> std::io::Result<()> {
	let sock_ref = socket2::SockRef::from(stream);
	sock_ref.set_nodelay(true)
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn splits_host_and_port() {
		assert_eq!(split_host_port("example.com:443").unwrap(), ("example.com", 443));
		assert_eq!(split_host_port("127.0.0.1:1080").unwrap(), ("127.0.0.1", 1080));
	}

	#[test]
	fn rejects_target_without_port() {
		assert!(split_host_port("example.com").is_err());
	}

	#[test]
	fn rejects_target_with_non_numeric_port() {
		assert!(split_host_port("example.com:https").is_err());
	}

	#[tokio::test]
	async fn loop_prevention_rejection_counts_as_a_failed_connection() {
		use tokio::io::{AsyncReadExt, AsyncWriteExt};

		let config = Config::from_json_str(
			r#"{
				"name": "loop-test",
				"sni_host": "example.com",
				"path": "/ws",
				"socks_port": 19999,
				"http_port": 28888,
				"pre_shared_key": "00112233445566778899aabbccddeeff"
			}"#,
		)
		.unwrap();

		let stats = Stats::new();

		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let local_addr = listener.local_addr().unwrap();

		// A SOCKS5 CONNECT targeting the proxy's own `socks_port` (loop
		// prevention fires before `tunnel::establish` is ever reached).
		let client_task = tokio::spawn(async move {
			let mut client = TcpStream::connect(local_addr).await.unwrap();

			client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
			let mut no_auth = [0u8; 2];
			client.read_exact(&mut no_auth).await.unwrap();
			assert_eq!(no_auth, [0x05, 0x00]);

			let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
			request.extend_from_slice(&19999u16.to_be_bytes());
			client.write_all(&request).await.unwrap();

			let mut buf = [0u8; 16];
			let n = client.read(&mut buf).await.unwrap();
			assert_eq!(n, 0, "loop-prevented flow must close without a success reply");
		});

		let (inbound, peer) = listener.accept().await.unwrap();
		run_flow(inbound, peer, Protocol::Socks5, &config, &stats).await;

		client_task.await.unwrap();

		assert_eq!(stats.failed_connections.load(Ordering::Relaxed), 1);
		assert_eq!(stats.success_connections.load(Ordering::Relaxed), 0);
		assert_eq!(stats.timeout_connections.load(Ordering::Relaxed), 0);
	}
}
