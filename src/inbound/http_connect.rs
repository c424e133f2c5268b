//! HTTP CONNECT parser (a single request line plus headers, no body).

// ----------

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::FlowError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

const PROTOCOL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);
const MAX_HEADER_LINES: usize = 64;
const MAX_LINE_LEN: usize = 8 * 1024;

const DEFAULT_PORT: u16 = 443;

// --------------------------------------------------------------------------------

/// Parses an `HTTP/1.1 CONNECT host[:port]` request and consumes the
/// following header block, one byte at a time so the stream is left
/// exactly at the first byte after the blank line — no bytes are ever
/// buffered past what the relay loop will read next. Returns the
/// requested `host:port` on success; a non-CONNECT request gets a `405`
/// reply and an error.
pub(crate) async fn parse_request<S>(stream: &mut S) -> Result<String, FlowError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let request_line = read_line(stream).await?;

	let mut parts = request_line.split_whitespace();
	let method = parts.next().unwrap_or("");
	let target = parts.next().unwrap_or("");

	if method != "CONNECT" {
		let _ = write_timeout(stream, b"HTTP/1.1 405 Method Not Allowed\r\n\r\n").await;
		return Err(FlowError::InboundProtocolError(format!(
			"expected CONNECT, got {method}"
		)));
	}

	let target = parse_authority(target)?;

	consume_headers(stream).await?;

	Ok(target)
}

/// Writes the `200 Connection Established` reply once the tunnel is up.
pub(crate) async fn write_success<S>(stream: &mut S) -> Result<(), FlowError>
where
	S: AsyncWrite + Unpin,
{
	write_timeout(stream, b"HTTP/1.1 200 Connection Established\r\n\r\n").await
}

fn parse_authority(target: &str) -> Result<String, FlowError> {
	if target.is_empty() {
		return Err(FlowError::InboundProtocolError(
			"missing CONNECT target".into(),
		));
	}

	match target.rsplit_once(':') {
		Some((host, port)) if !host.is_empty() => {
			let port: u16 = port
				.parse()
				.map_err(|_| FlowError::InboundProtocolError("invalid CONNECT port".into()))?;
			Ok(format!("{host}:{port}"))
		}
		_ => Ok(format!("{target}:{DEFAULT_PORT}")),
	}
}

async fn consume_headers<S>(stream: &mut S) -> Result<(), FlowError>
where
	S: AsyncRead + Unpin,
{
	for _ in 0..MAX_HEADER_LINES {
		let line = read_line(stream).await?;
		if line.is_empty() {
			return Ok(());
		}
	}

	Err(FlowError::InboundProtocolError(
		"too many header lines in CONNECT request".into(),
	))
}

/// Reads one `\r\n`-terminated line, one byte at a time, up to
/// [`MAX_LINE_LEN`]. Slow, but this runs once per request line on a
/// loopback socket during the protocol phase only.
async fn read_line<S>(stream: &mut S) -> Result<String, FlowError>
where
	S: AsyncRead + Unpin,
{
	let mut line = Vec::new();
	let mut byte = [0u8; 1];

	loop {
		timeout(PROTOCOL_TIMEOUT, stream.read_exact(&mut byte))
			.await
			.map_err(|_| FlowError::InboundProtocolError("timed out reading CONNECT request".into()))?
			.map_err(FlowError::Io)?;

		if byte[0] == b'\n' {
			break;
		}
		if byte[0] != b'\r' {
			line.push(byte[0]);
		}

		if line.len() > MAX_LINE_LEN {
			return Err(FlowError::InboundProtocolError(
				"CONNECT request line too long".into(),
			));
		}
	}

	String::from_utf8(line)
		.map_err(|_| FlowError::InboundProtocolError("non-UTF-8 CONNECT request".into()))
}

async fn write_timeout<S>(stream: &mut S, buf: &[u8]) -> Result<(), FlowError>
where
	S: AsyncWrite + Unpin,
{
	timeout(PROTOCOL_TIMEOUT, stream.write_all(buf))
		.await
		.map_err(|_| FlowError::InboundProtocolError("timed out writing CONNECT reply".into()))?
		.map_err(FlowError::Io)
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod test {
	use super::*;
	use tokio::io::duplex;

	#[tokio::test]
	async fn parses_connect_with_explicit_port() {
		let (mut client, mut server) = duplex(4096);

		let client_task = tokio::spawn(async move {
			client
				.write_all(b"CONNECT example.com:8443 HTTP/1.1\r\nHost: example.com\r\n\r\n")
				.await
				.unwrap();
			let mut reply = [0u8; 39];
			client.read_exact(&mut reply).await.unwrap();
			assert_eq!(&reply, b"HTTP/1.1 200 Connection Established\r\n\r\n");
		});

		let target = parse_request(&mut server).await.unwrap();
		assert_eq!(target, "example.com:8443");
		write_success(&mut server).await.unwrap();

		client_task.await.unwrap();
	}

	#[tokio::test]
	async fn parses_connect_without_port_defaults_to_443() {
		let (mut client, mut server) = duplex(4096);

		tokio::spawn(async move {
			client
				.write_all(b"CONNECT example.com HTTP/1.1\r\n\r\n")
				.await
				.unwrap();
		});

		let target = parse_request(&mut server).await.unwrap();
		assert_eq!(target, "example.com:443");
	}

	#[tokio::test]
	async fn rejects_non_connect_method() {
		let (mut client, mut server) = duplex(4096);

		let client_task = tokio::spawn(async move {
			client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
			let mut reply = [0u8; 35];
			client.read_exact(&mut reply).await.unwrap();
			assert_eq!(&reply, b"HTTP/1.1 405 Method Not Allowed\r\n\r\n");
		});

		let err = parse_request(&mut server).await.unwrap_err();
		assert!(matches!(err, FlowError::InboundProtocolError(_)));

		client_task.await.unwrap();
	}

	#[tokio::test]
	async fn consumes_multiple_header_lines() {
		let (mut client, mut server) = duplex(4096);

		tokio::spawn(async move {
			client
				.write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test\r\n\r\n")
				.await
				.unwrap();
		});

		let target = parse_request(&mut server).await.unwrap();
		assert_eq!(target, "example.com:443");
	}
}
