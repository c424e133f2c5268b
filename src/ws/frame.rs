//! Masked client-side WebSocket frame encode/decode, bolted directly onto
//! an already-established TLS byte stream. No third-party WebSocket crate
//! is used: the wire format implemented here is the minimal binary-opcode
//! subset of RFC 6455 this proxy's protocol actually needs.

// ----------

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::ImplError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;

const FIN_AND_BINARY: u8 = 0b1000_0000 | OPCODE_BINARY;

const MASK_BIT: u8 = 0x80;
const LEN_MASK: u8 = 0x7f;

const LEN16_MARKER: u8 = 126;
const LEN64_MARKER: u8 = 127;

// --------------------------------------------------------------------------------

/// Encodes `payload` as a single masked binary frame and writes it to
/// `writer`, then flushes.
pub(crate) async fn send_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
	W: AsyncWrite + Unpin,
{
	let mut header = Vec::with_capacity(10);
	header.push(FIN_AND_BINARY);

	let len = payload.len();
	if len <= 125 {
		header.push(MASK_BIT | len as u8);
	} else if len <= u16::MAX as usize {
		header.push(MASK_BIT | LEN16_MARKER);
		header.extend_from_slice(&(len as u16).to_be_bytes());
	} else {
		header.push(MASK_BIT | LEN64_MARKER);
		header.extend_from_slice(&(len as u64).to_be_bytes());
	}

	let mut mask = [0u8; 4];
	rand::thread_rng().fill_bytes(&mut mask);
	header.extend_from_slice(&mask);

	let mut masked = Vec::with_capacity(len);
	masked.extend(
		payload
			.iter()
			.enumerate()
			.map(|(i, byte)| byte ^ mask[i % 4]),
	);

	writer.write_all(&header).await?;
	writer.write_all(&masked).await?;
	writer.flush().await?;

	Ok(())
}

/// One frame received from the peer, either a binary payload or an
/// orderly close.
pub(crate) enum Frame {
	Binary(Vec<u8>),
	Close,
}

/// Reads and decodes exactly one frame from `reader`. Server frames are
/// unmasked, so the payload is returned verbatim.
pub(crate) async fn recv_frame<R>(reader: &mut R) -> Result<Frame, FrameError>
where
	R: AsyncRead + Unpin,
{
	let mut head = [0u8; 2];
	reader.read_exact(&mut head).await?;

	let opcode = head[0] & 0x0f;
	let len_byte = head[1] & LEN_MASK;

	let len = match len_byte {
		LEN64_MARKER => {
			let mut buf = [0u8; 8];
			reader.read_exact(&mut buf).await?;
			u64::from_be_bytes(buf) as usize
		}
		LEN16_MARKER => {
			let mut buf = [0u8; 2];
			reader.read_exact(&mut buf).await?;
			u16::from_be_bytes(buf) as usize
		}
		short => short as usize,
	};

	let mut payload = vec![0u8; len];
	if len > 0 {
		reader.read_exact(&mut payload).await?;
	}

	match opcode {
		OPCODE_BINARY => Ok(Frame::Binary(payload)),
		OPCODE_CLOSE => Ok(Frame::Close),
		other => Err(FrameError::UnsupportedOpcode(other)),
	}
}

#[derive(Debug, ImplError)]
pub(crate) enum FrameError {
	#[error("unsupported websocket opcode {0:#x}")]
	UnsupportedOpcode(u8),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod test {
	use super::*;

	async fn round_trip(payload: &[u8]) -> Vec<u8> {
		let mut buf = Vec::new();
		send_frame(&mut buf, payload).await.unwrap();

		let mut cursor = std::io::Cursor::new(buf);
		match recv_frame(&mut cursor).await.unwrap() {
			Frame::Binary(bytes) => bytes,
			Frame::Close => panic!("expected a binary frame"),
		}
	}

	#[tokio::test]
	async fn round_trips_boundary_lengths() {
		for len in [0usize, 1, 125, 126, 127, 65_535, 65_536] {
			let payload = vec![0xab; len];
			let decoded = round_trip(&payload).await;
			assert_eq!(decoded, payload, "length {len} did not round-trip");
		}
	}

	#[tokio::test]
	async fn frame_is_masked_on_the_wire() {
		let payload = vec![0u8; 64];

		let mut buf = Vec::new();
		send_frame(&mut buf, &payload).await.unwrap();

		assert_eq!(buf[0], FIN_AND_BINARY);
		assert_eq!(buf[1] & MASK_BIT, MASK_BIT);

		// With an all-zero payload the masked bytes on the wire equal the
		// mask itself, repeated; a non-trivial mask means the wire bytes
		// are not all zero.
		let masked_region = &buf[6..6 + payload.len()];
		assert!(masked_region.iter().any(|&b| b != 0));
	}

	#[tokio::test]
	async fn consecutive_frames_use_fresh_masks() {
		let mut first = Vec::new();
		send_frame(&mut first, &[0u8; 16]).await.unwrap();
		let mut second = Vec::new();
		send_frame(&mut second, &[0u8; 16]).await.unwrap();

		assert_ne!(&first[2..6], &second[2..6]);
	}

	#[tokio::test]
	async fn close_opcode_is_recognized() {
		// FIN=1, opcode=close, no mask bit (server-style frame), zero length.
		let buf = [0b1000_1000u8, 0x00];
		let mut cursor = std::io::Cursor::new(buf);

		assert!(matches!(
			recv_frame(&mut cursor).await.unwrap(),
			Frame::Close
		));
	}
}
