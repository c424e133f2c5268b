//! The two-way full-duplex copy loop between an inbound loopback socket
//! and an authenticated [`Tunnel`], with drain-based backpressure and a
//! hard session deadline.

// ----------

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use crate::config::Tunables;
use crate::crypto::{self, SessionKey};
use crate::error::FlowError;
use crate::stats::Stats;
use crate::tunnel::Tunnel;
use crate::ws::frame;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// Runs both copy directions until either side ends, then returns. Any
/// loop exit cancels the other (by dropping its future, via `select!`)
/// and the tunnel is marked closed so neither direction sends another
/// frame afterwards.
///
/// `tunnel.reader` and `tunnel.writer` are disjoint fields of the same
/// struct, so destructuring through the `&mut Tunnel` below borrows each
/// independently — both directions can be polled concurrently by
/// `select!` without either one needing exclusive access to the whole
/// tunnel.
pub(crate) async fn run(
	inbound: TcpStream,
	tunnel: &mut Tunnel,
	tunables: &Tunables,
	stats: &Arc<Stats>,
) {
	let (inbound_read, inbound_write) = inbound.into_split();

	let Tunnel {
		reader, writer, send_key, recv_key, ..
	} = tunnel;
	let send_key = send_key.clone();
	let recv_key = recv_key.clone();

	let result = tokio::select! {
		result = upstream_loop(inbound_read, writer, &send_key, tunables, stats) => {
			debug!(direction = "upstream", ?result, "relay direction ended");
			result
		}
		result = downstream_loop(inbound_write, reader, &recv_key, tunables, stats) => {
			debug!(direction = "downstream", ?result, "relay direction ended");
			result
		}
		_ = tokio::time::sleep(tunables.session_timeout) => {
			debug!("relay ended: session timeout reached");
			Err(FlowError::SessionTimeout)
		}
	};

	if let Err(err) = result {
		warn!(error = %err, "relay ended with error");
	}

	tunnel.mark_closed();
}

/// Client → server: read from the inbound socket, encrypt, send as one
/// WebSocket frame. EOF ends the loop cleanly.
async fn upstream_loop(
	mut inbound_read: OwnedReadHalf,
	writer: &mut WriteHalf<TlsStream<TcpStream>>,
	send_key: &SessionKey,
	tunables: &Tunables,
	stats: &Arc<Stats>,
) -> Result<(), FlowError> {
	let mut buf = vec![0u8; tunables.read_buffer_size];

	loop {
		let n = timeout(tunables.recv_timeout, inbound_read.read(&mut buf))
			.await
			.map_err(|_| FlowError::SessionTimeout)?
			.map_err(FlowError::Io)?;

		if n == 0 {
			return Ok(());
		}

		let ciphertext = crypto::encrypt(send_key, &buf[..n]);
		frame::send_frame(writer, &ciphertext)
			.await
			.map_err(FlowError::Io)?;
		stats.traffic_up.fetch_add(n as u64, Ordering::Relaxed);
	}
}

/// Server → client: receive one frame, decrypt, write to the inbound
/// socket, then apply drain-based backpressure if the write buffer has
/// grown past the watermark.
async fn downstream_loop(
	mut inbound_write: OwnedWriteHalf,
	reader: &mut BufReader<ReadHalf<TlsStream<TcpStream>>>,
	recv_key: &SessionKey,
	tunables: &Tunables,
	stats: &Arc<Stats>,
) -> Result<(), FlowError> {
	loop {
		let plaintext = timeout(tunables.recv_timeout, recv_next(reader, recv_key))
			.await
			.map_err(|_| FlowError::SessionTimeout)??;

		let Some(plaintext) = plaintext else {
			return Ok(());
		};

		inbound_write
			.write_all(&plaintext)
			.await
			.map_err(FlowError::Io)?;
		stats
			.traffic_down
			.fetch_add(plaintext.len() as u64, Ordering::Relaxed);

		if plaintext.len() >= tunables.drain_watermark() {
			match timeout(tunables.drain_timeout, inbound_write.flush()).await {
				Ok(Ok(())) => {
					stats.drain_operations.fetch_add(1, Ordering::Relaxed);
				}
				Ok(Err(err)) => return Err(FlowError::Io(err)),
				Err(_) => {
					stats.buffer_overflows.fetch_add(1, Ordering::Relaxed);
				}
			}
		}
	}
}

/// Receives and decrypts one frame directly off the tunnel's read half,
/// or `Ok(None)` on an orderly close.
async fn recv_next(
	reader: &mut BufReader<ReadHalf<TlsStream<TcpStream>>>,
	recv_key: &SessionKey,
) -> Result<Option<Vec<u8>>, FlowError> {
	match frame::recv_frame(reader).await {
		Ok(frame::Frame::Binary(ciphertext)) => crypto::decrypt(recv_key, &ciphertext)
			.map(Some)
			.map_err(|_| FlowError::CryptoAuthFailed),
		Ok(frame::Frame::Close) => Ok(None),
		Err(_) => Err(FlowError::InboundProtocolError(
			"malformed websocket frame from tunnel server".into(),
		)),
	}
}
