//! Per-flow tunnel establishment: TLS dial, WebSocket upgrade, ephemeral
//! key exchange, mutual HMAC authentication, and the CONNECT command.

// ----------

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::io::{split, AsyncRead, AsyncWrite, BufReader, ReadHalf, WriteHalf};
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::Config;
use crate::crypto::{self, SessionKey};
use crate::error::FlowError;
use crate::tls;
use crate::ws::{frame, handshake};

type HmacSha256 = Hmac<Sha256>;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

const PUBLIC_NONCE_LEN: usize = 32;

// --------------------------------------------------
// Tunnel

/// An authenticated duplex channel carrying one inbound flow's traffic,
/// encrypted with its own pair of directional session keys.
///
/// The underlying TLS stream is split into independent read/write halves
/// right after the TLS handshake so the relay's two directions can poll
/// them concurrently — `reader` and `writer` are disjoint fields, which
/// lets `relay::run` borrow each mutably in its own `select!` branch
/// without the two directions contending for a single `&mut Tunnel`.
pub(crate) struct Tunnel {
	pub(crate) reader: BufReader<ReadHalf<TlsStream<TcpStream>>>,
	pub(crate) writer: WriteHalf<TlsStream<TcpStream>>,
	pub(crate) send_key: SessionKey,
	pub(crate) recv_key: SessionKey,
	closed: bool,
}

impl Tunnel {
	/// Marks the tunnel closed once the relay phase ends, so a second call
	/// into `relay::run` (there never is one, but every exit path must stay
	/// idempotent) can tell at a glance that no further frames should move.
	pub(crate) fn mark_closed(&mut self) {
		self.closed = true;
	}

	pub(crate) fn is_closed(&self) -> bool {
		self.closed
	}
}

// --------------------------------------------------------------------------------

/// Establishes a tunnel to `target` (already validated not to be the
/// proxy's own loopback listener), retrying once after a short backoff
/// for non-timeout failures as described in the tunnel establisher's
/// design.
///
/// Counter bookkeeping (success/failed/timeout) is deliberately not done
/// here: it happens once, at the flow supervisor's single exit point in
/// `admission::run_flow`, so a flow that never reaches this function (a
/// parse error, loop prevention, or the outer connection-timeout) still
/// increments exactly one counter instead of none.
pub(crate) async fn establish(config: &Config, target: &str) -> Result<Tunnel, FlowError> {
	let mut attempt = 0;

	loop {
		match try_establish(config, target).await {
			Ok(tunnel) => {
				debug!(target, "tunnel established");
				return Ok(tunnel);
			}
			Err(err) if err.is_timeout() || attempt >= config.tunables.max_retries => {
				warn!(target, error = %err, "tunnel establishment failed");
				return Err(err);
			}
			Err(err) => {
				debug!(target, error = %err, "tunnel attempt failed, retrying once");
				tokio::time::sleep(config.tunables.retry_delay).await;
				attempt += 1;
			}
		}
	}
}

async fn try_establish(config: &Config, target: &str) -> Result<Tunnel, FlowError> {
	let step_timeout = config.tunables.handshake_step_timeout;

	let tls_stream = timeout(
		config.tunables.connect_timeout,
		tls::dial(&config.sni_host, config.server_port, &config.sni_host),
	)
	.await
	.map_err(|_| FlowError::ConnectTimeout)?
	.map_err(FlowError::ConnectFailed)?;

	// Split right away: the handshake steps below and the later relay
	// phase both read and write, and a split stream lets the relay poll
	// both directions concurrently without contending for one `&mut`.
	let (read_half, write_half) = split(tls_stream);
	let mut reader = BufReader::new(read_half);
	let mut writer = write_half;

	let host_header = format!("{}:{}", config.sni_host, config.server_port);
	timeout(
		step_timeout,
		handshake::upgrade(&mut reader, &mut writer, &host_header, &config.path),
	)
	.await
	.map_err(|_| FlowError::ConnectTimeout)?
	.map_err(|_| FlowError::HandshakeRejected)?;

	let (send_key, recv_key) = timeout(
		step_timeout,
		key_exchange(&mut reader, &mut writer, &config.pre_shared_key),
	)
	.await
	.map_err(|_| FlowError::ConnectTimeout)??;

	timeout(
		step_timeout,
		authenticate(&mut reader, &mut writer, &send_key, &recv_key),
	)
	.await
	.map_err(|_| FlowError::ConnectTimeout)??;

	timeout(
		step_timeout,
		send_connect_command(&mut reader, &mut writer, &send_key, &recv_key, target),
	)
	.await
	.map_err(|_| FlowError::ConnectTimeout)??;

	Ok(Tunnel {
		reader,
		writer,
		send_key,
		recv_key,
		closed: false,
	})
}

async fn key_exchange<R, W>(
	reader: &mut BufReader<R>,
	writer: &mut W,
	psk: &[u8],
) -> Result<(SessionKey, SessionKey), FlowError>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut client_pub = [0u8; PUBLIC_NONCE_LEN];
	rand::thread_rng().fill_bytes(&mut client_pub);
	frame::send_frame(writer, &client_pub)
		.await
		.map_err(FlowError::Io)?;

	let server_pub = match frame::recv_frame(reader).await {
		Ok(frame::Frame::Binary(bytes)) if bytes.len() == PUBLIC_NONCE_LEN => bytes,
		Ok(_) => return Err(FlowError::HandshakeMalformed),
		Err(_) => return Err(FlowError::HandshakeMalformed),
	};

	let mut salt = Vec::with_capacity(PUBLIC_NONCE_LEN * 2);
	salt.extend_from_slice(&client_pub);
	salt.extend_from_slice(&server_pub);

	Ok(crypto::derive_keys(psk, &salt))
}

async fn authenticate<R, W>(
	reader: &mut BufReader<R>,
	writer: &mut W,
	send_key: &SessionKey,
	recv_key: &SessionKey,
) -> Result<(), FlowError>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let auth_tag = hmac_tag(send_key, b"auth");
	frame::send_frame(writer, &auth_tag).await.map_err(FlowError::Io)?;

	let expected = hmac_tag(recv_key, b"ok");
	let received = match frame::recv_frame(reader).await {
		Ok(frame::Frame::Binary(bytes)) => bytes,
		_ => return Err(FlowError::AuthFailed),
	};

	if received.len() != expected.len() || received.ct_eq(&expected).unwrap_u8() != 1 {
		return Err(FlowError::AuthFailed);
	}

	Ok(())
}

fn hmac_tag(key: &SessionKey, message: &[u8]) -> Vec<u8> {
	let mut mac =
		HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC-SHA256 accepts any key length");
	mac.update(message);
	mac.finalize().into_bytes().to_vec()
}

async fn send_connect_command<R, W>(
	reader: &mut BufReader<R>,
	writer: &mut W,
	send_key: &SessionKey,
	recv_key: &SessionKey,
	target: &str,
) -> Result<(), FlowError>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let command = format!("CONNECT {target}");
	let ciphertext = crypto::encrypt(send_key, command.as_bytes());
	frame::send_frame(writer, &ciphertext).await.map_err(FlowError::Io)?;

	let reply = match frame::recv_frame(reader).await {
		Ok(frame::Frame::Binary(bytes)) => bytes,
		_ => {
			return Err(FlowError::ConnectRejected {
				reason: "no reply from tunnel server".into(),
			})
		}
	};

	let plaintext = crypto::decrypt(recv_key, &reply).map_err(|_| FlowError::CryptoAuthFailed)?;

	if plaintext == b"OK" {
		Ok(())
	} else {
		Err(FlowError::ConnectRejected {
			reason: String::from_utf8_lossy(&plaintext).into_owned(),
		})
	}
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod test {
	use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

	use super::*;

	#[test]
	fn hmac_tags_are_key_dependent() {
		let (key_a, _) = crypto::derive_keys(b"psk-one", b"salt");
		let (key_b, _) = crypto::derive_keys(b"psk-two", b"salt");

		assert_ne!(hmac_tag(&key_a, b"auth"), hmac_tag(&key_b, b"auth"));
	}

	#[test]
	fn hmac_tags_are_deterministic() {
		let (key, _) = crypto::derive_keys(b"psk", b"salt");

		assert_eq!(hmac_tag(&key, b"auth"), hmac_tag(&key, b"auth"));
	}

	// A stub server side for the handshake steps below: enough of the wire
	// format to unmask what the client sends and reply with server-style
	// (unmasked) frames, without pulling in the real frame module's
	// client-only `send_frame`.

	async fn read_client_frame<S: AsyncReadExt + Unpin>(stream: &mut S) -> Vec<u8> {
		let mut head = [0u8; 2];
		stream.read_exact(&mut head).await.unwrap();

		let len = match head[1] & 0x7f {
			127 => {
				let mut buf = [0u8; 8];
				stream.read_exact(&mut buf).await.unwrap();
				u64::from_be_bytes(buf) as usize
			}
			126 => {
				let mut buf = [0u8; 2];
				stream.read_exact(&mut buf).await.unwrap();
				u16::from_be_bytes(buf) as usize
			}
			short => short as usize,
		};

		let mut mask = [0u8; 4];
		stream.read_exact(&mut mask).await.unwrap();

		let mut payload = vec![0u8; len];
		stream.read_exact(&mut payload).await.unwrap();
		for (i, byte) in payload.iter_mut().enumerate() {
			*byte ^= mask[i % 4];
		}
		payload
	}

	async fn write_server_frame<S: AsyncWriteExt + Unpin>(stream: &mut S, payload: &[u8]) {
		let mut header = Vec::with_capacity(10);
		header.push(0b1000_0010);

		let len = payload.len();
		if len <= 125 {
			header.push(len as u8);
		} else if len <= u16::MAX as usize {
			header.push(126);
			header.extend_from_slice(&(len as u16).to_be_bytes());
		} else {
			header.push(127);
			header.extend_from_slice(&(len as u64).to_be_bytes());
		}

		stream.write_all(&header).await.unwrap();
		stream.write_all(payload).await.unwrap();
	}

	#[tokio::test]
	async fn full_handshake_succeeds_and_establishes_matching_session_keys() {
		let (client, mut server) = duplex(8192);
		let (client_read, mut client_write) = split(client);
		let mut client_read = BufReader::new(client_read);

		let psk = b"correct-horse-battery-staple-01".to_vec();
		let psk_for_server = psk.clone();

		let server_task = tokio::spawn(async move {
			let client_pub = read_client_frame(&mut server).await;
			let server_pub = [0x42u8; PUBLIC_NONCE_LEN];
			write_server_frame(&mut server, &server_pub).await;

			let mut salt = Vec::with_capacity(PUBLIC_NONCE_LEN * 2);
			salt.extend_from_slice(&client_pub);
			salt.extend_from_slice(&server_pub);
			let (server_send, server_recv) = crypto::derive_keys(&psk_for_server, &salt);

			let client_auth_tag = read_client_frame(&mut server).await;
			assert_eq!(client_auth_tag, hmac_tag(&server_recv, b"auth"));
			write_server_frame(&mut server, &hmac_tag(&server_send, b"ok")).await;

			let connect_ciphertext = read_client_frame(&mut server).await;
			let connect_plain = crypto::decrypt(&server_recv, &connect_ciphertext).unwrap();
			assert_eq!(connect_plain, b"CONNECT example.com:443");
			write_server_frame(&mut server, &crypto::encrypt(&server_send, b"OK")).await;
		});

		let (send_key, recv_key) = key_exchange(&mut client_read, &mut client_write, &psk)
			.await
			.unwrap();
		authenticate(&mut client_read, &mut client_write, &send_key, &recv_key)
			.await
			.unwrap();
		send_connect_command(
			&mut client_read,
			&mut client_write,
			&send_key,
			&recv_key,
			"example.com:443",
		)
		.await
		.unwrap();

		server_task.await.unwrap();
	}

	#[tokio::test]
	async fn key_exchange_rejects_truncated_server_public_value() {
		let (client, mut server) = duplex(4096);
		let (client_read, mut client_write) = split(client);
		let mut client_read = BufReader::new(client_read);

		tokio::spawn(async move {
			let _client_pub = read_client_frame(&mut server).await;
			write_server_frame(&mut server, &[0u8; 16]).await;
		});

		let err = key_exchange(&mut client_read, &mut client_write, b"some-psk")
			.await
			.unwrap_err();
		assert!(matches!(err, FlowError::HandshakeMalformed));
	}

	#[tokio::test]
	async fn authenticate_rejects_a_wrong_server_tag() {
		let (client, mut server) = duplex(4096);
		let (client_read, mut client_write) = split(client);
		let mut client_read = BufReader::new(client_read);

		let (send_key, recv_key) = crypto::derive_keys(b"some-psk-value", b"salt");

		tokio::spawn(async move {
			let _auth_tag = read_client_frame(&mut server).await;
			write_server_frame(&mut server, &[0u8; 32]).await;
		});

		let err = authenticate(&mut client_read, &mut client_write, &send_key, &recv_key)
			.await
			.unwrap_err();
		assert!(matches!(err, FlowError::AuthFailed));
	}

	#[tokio::test]
	async fn connect_command_surfaces_the_server_rejection_reason() {
		let (client, mut server) = duplex(4096);
		let (client_read, mut client_write) = split(client);
		let mut client_read = BufReader::new(client_read);

		let (send_key, recv_key) = crypto::derive_keys(b"some-psk-value", b"salt");

		tokio::spawn(async move {
			let _command = read_client_frame(&mut server).await;
			write_server_frame(&mut server, &crypto::encrypt(&recv_key, b"host not permitted")).await;
		});

		let err = send_connect_command(
			&mut client_read,
			&mut client_write,
			&send_key,
			&recv_key,
			"blocked.example:443",
		)
		.await
		.unwrap_err();

		match err {
			FlowError::ConnectRejected { reason } => assert_eq!(reason, "host not permitted"),
			other => panic!("expected ConnectRejected, got {other:?}"),
		}
	}
}
