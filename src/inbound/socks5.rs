//! SOCKS5 greeting/request parser (RFC 1928 subset: no-auth, CONNECT,
//! IPv4/domain-name address types only).

// ----------

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::FlowError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

const VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;

const PROTOCOL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

// --------------------------------------------------------------------------------

/// Parses the SOCKS5 greeting and CONNECT request, returning the
/// requested `host:port`. The NO AUTH reply is written as part of the
/// greeting exchange; the final success reply is written by
/// [`write_success`] once the tunnel is established.
pub(crate) async fn parse_request<S>(stream: &mut S) -> Result<String, FlowError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let mut greeting = [0u8; 2];
	read(stream, &mut greeting).await?;

	if greeting[0] != VERSION {
		return Err(FlowError::InboundProtocolError("not a SOCKS5 client".into()));
	}

	let nmethods = greeting[1] as usize;
	let mut methods = vec![0u8; nmethods];
	read(stream, &mut methods).await?;

	write(stream, &[VERSION, 0x00]).await?;

	let mut request = [0u8; 4];
	read(stream, &mut request).await?;

	if request[0] != VERSION || request[1] != CMD_CONNECT {
		return Err(FlowError::InboundProtocolError(
			"unsupported SOCKS5 command".into(),
		));
	}

	let host = match request[3] {
		ATYP_IPV4 => {
			let mut octets = [0u8; 4];
			read(stream, &mut octets).await?;
			format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3])
		}
		ATYP_DOMAIN => {
			let mut len_buf = [0u8; 1];
			read(stream, &mut len_buf).await?;
			let mut name = vec![0u8; len_buf[0] as usize];
			read(stream, &mut name).await?;
			String::from_utf8(name)
				.map_err(|_| FlowError::InboundProtocolError("non-UTF-8 hostname".into()))?
		}
		_ => {
			return Err(FlowError::InboundProtocolError(
				"unsupported SOCKS5 address type".into(),
			))
		}
	};

	let mut port_buf = [0u8; 2];
	read(stream, &mut port_buf).await?;
	let port = u16::from_be_bytes(port_buf);

	Ok(format!("{host}:{port}"))
}

/// Writes the SOCKS5 CONNECT success reply (bound address is ignored by
/// every client that matters here, per the design).
pub(crate) async fn write_success<S>(stream: &mut S) -> Result<(), FlowError>
where
	S: AsyncWrite + Unpin,
{
	timeout(
		PROTOCOL_TIMEOUT,
		stream.write_all(&[0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]),
	)
	.await
	.map_err(|_| FlowError::InboundProtocolError("timed out writing SOCKS5 reply".into()))?
	.map_err(FlowError::Io)
}

async fn read<S>(stream: &mut S, buf: &mut [u8]) -> Result<(), FlowError>
where
	S: AsyncRead + Unpin,
{
	timeout(PROTOCOL_TIMEOUT, stream.read_exact(buf))
		.await
		.map_err(|_| FlowError::InboundProtocolError("timed out reading SOCKS5 request".into()))?
		.map_err(FlowError::Io)?;
	Ok(())
}

async fn write<S>(stream: &mut S, buf: &[u8]) -> Result<(), FlowError>
where
	S: AsyncWrite + Unpin,
{
	timeout(PROTOCOL_TIMEOUT, stream.write_all(buf))
		.await
		.map_err(|_| FlowError::InboundProtocolError("timed out writing SOCKS5 reply".into()))?
		.map_err(FlowError::Io)?;
	Ok(())
}

// --------------------------------------------------------------------------------
