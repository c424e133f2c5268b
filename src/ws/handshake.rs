//! Client-side HTTP/1.1 Upgrade handshake that bootstraps the WebSocket
//! framing in [`super::frame`].

// ----------

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::common::ImplError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

const USER_AGENT: &str =
	"Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Performs the client-side Upgrade handshake over an already-connected
/// (TLS-wrapped) stream, given as separate read/write halves. The
/// `Sec-WebSocket-Accept` response header is intentionally not validated
/// against the sent key — see the design notes on this decision.
pub(crate) async fn upgrade<R, W>(
	reader: &mut BufReader<R>,
	writer: &mut W,
	host: &str,
	path: &str,
) -> Result<(), HandshakeError>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut key_bytes = [0u8; 16];
	rand::thread_rng().fill_bytes(&mut key_bytes);
	let sec_websocket_key = STANDARD.encode(key_bytes);

	let request = format!(
		"GET {path} HTTP/1.1\r\n\
		 Host: {host}\r\n\
		 Upgrade: websocket\r\n\
		 Connection: Upgrade\r\n\
		 Sec-WebSocket-Key: {sec_websocket_key}\r\n\
		 Sec-WebSocket-Version: 13\r\n\
		 User-Agent: {USER_AGENT}\r\n\
		 \r\n"
	);

	writer.write_all(request.as_bytes()).await?;
	writer.flush().await?;

	let response = read_http_head(reader).await?;

	let status_line = response
		.lines()
		.next()
		.ok_or(HandshakeError::Rejected)?;

	if !status_line.contains("101") {
		return Err(HandshakeError::Rejected);
	}

	Ok(())
}

/// Reads lines off `stream` until the header-terminating blank line,
/// returning everything read so far (status line included).
async fn read_http_head<S>(stream: &mut BufReader<S>) -> Result<String, HandshakeError>
where
	S: AsyncRead + Unpin,
{
	let mut raw = Vec::new();
	let mut line = Vec::new();

	loop {
		line.clear();
		let bytes_read = read_line(stream, &mut line).await?;
		if bytes_read == 0 {
			return Err(HandshakeError::UnexpectedEof);
		}

		raw.extend_from_slice(&line);

		if line == b"\r\n" || line == b"\n" {
			break;
		}

		if raw.len() > MAX_HEADER_BYTES {
			return Err(HandshakeError::HeadersTooLarge);
		}
	}

	// A final parse pass with httparse validates the header block is
	// well-formed HTTP/1.1, matching the parser used on the inbound side.
	let mut headers = [httparse::EMPTY_HEADER; 32];
	let mut response = httparse::Response::new(&mut headers);
	response
		.parse(&raw)
		.map_err(|_| HandshakeError::Rejected)?;

	String::from_utf8(raw).map_err(|_| HandshakeError::Rejected)
}

async fn read_line<S>(stream: &mut BufReader<S>, out: &mut Vec<u8>) -> Result<usize, HandshakeError>
where
	S: AsyncRead + Unpin,
{
	use tokio::io::AsyncBufReadExt;

	let n = stream.read_until(b'\n', out).await?;
	Ok(n)
}

// --------------------------------------------------------------------------------

#[derive(Debug, ImplError)]
pub(crate) enum HandshakeError {
	#[error("server did not reply with HTTP 101")]
	Rejected,
	#[error("connection closed before the handshake response completed")]
	UnexpectedEof,
	#[error("handshake response headers exceeded the size limit")]
	HeadersTooLarge,
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

// --------------------------------------------------------------------------------
