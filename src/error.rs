//! Error types for configuration loading and per-flow tunnel handling.

// ----------

use std::io::Error as IoError;

use crate::common::ImplError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

// --------------------------------------------------
// ConfigError

/// Returned when the process configuration cannot be loaded or fails validation.
///
/// Both variants are fatal at startup; the process exits non-zero on either.
#[derive(Debug, ImplError)]
pub enum ConfigError {
	#[error("{0} environment variable is not set")]
	Missing(&'static str),
	#[error("invalid configuration: {0}")]
	Invalid(String),
}

// --------------------------------------------------
// StartupError

/// Fatal errors that can occur while bringing the process up, before any
/// flow has been admitted.
#[derive(Debug, ImplError)]
pub enum StartupError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("failed to bind listener on {addr}: {source}")]
	ListenerBindFailed { addr: String, source: IoError },
}

// --------------------------------------------------
// FlowError

/// Errors that can abort a single inbound flow.
///
/// Every variant is recovered locally by the flow supervisor: the flow is
/// torn down, its admission slot released, and the appropriate counter
/// incremented. None of these ever produce a client-visible diagnostic
/// beyond the closed socket (see the proxy's error handling design).
#[non_exhaustive]
#[derive(Debug, ImplError)]
pub enum FlowError {
	#[error("inbound protocol error: {0}")]
	InboundProtocolError(String),
	#[error("target resolves to the proxy's own loopback listener")]
	LoopPrevention,
	#[error("connect to upstream server failed: {0}")]
	ConnectFailed(#[source] IoError),
	#[error("connect to upstream server timed out")]
	ConnectTimeout,
	#[error("websocket upgrade was rejected by the server")]
	HandshakeRejected,
	#[error("websocket handshake produced a malformed message")]
	HandshakeMalformed,
	#[error("mutual authentication failed")]
	AuthFailed,
	#[error("server rejected the CONNECT command: {reason}")]
	ConnectRejected { reason: String },
	#[error("AEAD authentication failed while decrypting a frame")]
	CryptoAuthFailed,
	#[error("the session exceeded its lifetime budget")]
	SessionTimeout,
	#[error("i/o error: {0}")]
	Io(#[from] IoError),
}

impl FlowError {
	/// Whether this error should be counted as a timeout rather than a
	/// generic failure.
	pub(crate) fn is_timeout(&self) -> bool {
		matches!(self, FlowError::ConnectTimeout | FlowError::SessionTimeout)
	}
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn timeout_classification() {
		assert!(FlowError::ConnectTimeout.is_timeout());
		assert!(FlowError::SessionTimeout.is_timeout());
		assert!(!FlowError::AuthFailed.is_timeout());
		assert!(!FlowError::LoopPrevention.is_timeout());
	}
}
