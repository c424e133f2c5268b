//! Process configuration: loaded once from the environment at startup and
//! never mutated afterwards.

// ----------

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

const CONFIG_ENV_VAR: &str = "SECURE_PROXY_CONFIG";

// --------------------------------------------------
// Config

/// Validated, immutable process configuration.
#[derive(Debug, Clone)]
pub struct Config {
	pub name: String,
	pub sni_host: String,
	pub path: String,
	pub server_port: u16,
	pub socks_port: u16,
	pub http_port: u16,
	pub pre_shared_key: Vec<u8>,
	pub tunables: Tunables,
}

impl Config {
	/// Loads and validates the configuration from the `SECURE_PROXY_CONFIG`
	/// environment variable.
	pub fn from_env() -> Result<Self, ConfigError> {
		let raw = std::env::var(CONFIG_ENV_VAR).map_err(|_| ConfigError::Missing(CONFIG_ENV_VAR))?;

		Self::from_json_str(&raw)
	}

	pub(crate) fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
		let raw: RawConfig =
			serde_json::from_str(raw).map_err(|err| ConfigError::Invalid(err.to_string()))?;

		raw.validate()
	}

	/// The loopback address this flow's target must not resolve to, to
	/// prevent the proxy from tunneling into itself.
	pub(crate) fn is_self_target(&self, host: &str, port: u16) -> bool {
		let is_loopback = host == "127.0.0.1" || host == "localhost" || host == "::1";

		is_loopback && (port == self.socks_port || port == self.http_port)
	}
}

// --------------------------------------------------
// RawConfig

#[derive(Debug, Deserialize)]
struct RawConfig {
	name: String,
	sni_host: String,
	path: String,
	#[serde(default = "default_server_port")]
	server_port: u16,
	socks_port: u16,
	http_port: u16,
	pre_shared_key: String,
	#[serde(flatten, default)]
	tunables: RawTunables,
}

fn default_server_port() -> u16 {
	443
}

impl RawConfig {
	fn validate(self) -> Result<Config, ConfigError> {
		if !self.path.starts_with('/') {
			return Err(ConfigError::Invalid(format!(
				"path must begin with '/', got {:?}",
				self.path
			)));
		}

		let pre_shared_key = hex::decode(&self.pre_shared_key)
			.map_err(|err| ConfigError::Invalid(format!("pre_shared_key is not valid hex: {err}")))?;

		if pre_shared_key.len() < 16 {
			return Err(ConfigError::Invalid(format!(
				"pre_shared_key must decode to at least 16 bytes, got {}",
				pre_shared_key.len()
			)));
		}

		Ok(Config {
			name: self.name,
			sni_host: self.sni_host,
			path: self.path,
			server_port: self.server_port,
			socks_port: self.socks_port,
			http_port: self.http_port,
			pre_shared_key,
			tunables: self.tunables.into(),
		})
	}
}

// --------------------------------------------------
// Tunables

/// Tunable knobs with the defaults from the external interfaces section of
/// the design; every field may be overridden from the same configuration
/// blob.
#[derive(Debug, Clone, Copy)]
pub struct Tunables {
	pub read_buffer_size: usize,
	pub write_buffer_size: usize,
	pub max_concurrent_connections: usize,
	pub connect_timeout: Duration,
	pub handshake_step_timeout: Duration,
	pub connection_timeout: Duration,
	pub recv_timeout: Duration,
	pub send_timeout: Duration,
	pub drain_threshold: f64,
	pub drain_timeout: Duration,
	pub session_timeout: Duration,
	pub max_retries: u32,
	pub retry_delay: Duration,
}

impl Default for Tunables {
	fn default() -> Self {
		Tunables {
			read_buffer_size: 6 * 1024 * 1024,
			write_buffer_size: 640 * 1024,
			max_concurrent_connections: 200,
			connect_timeout: Duration::from_secs(3),
			handshake_step_timeout: Duration::from_secs(2),
			connection_timeout: Duration::from_secs(5),
			recv_timeout: Duration::from_secs(15),
			send_timeout: Duration::from_secs(10),
			drain_threshold: 0.7,
			drain_timeout: Duration::from_secs(1),
			session_timeout: Duration::from_secs(300),
			max_retries: 1,
			retry_delay: Duration::from_millis(100),
		}
	}
}

impl Tunables {
	pub(crate) fn drain_watermark(&self) -> usize {
		(self.write_buffer_size as f64 * self.drain_threshold) as usize
	}
}

#[derive(Debug, Deserialize, Default)]
struct RawTunables {
	read_buffer_size: Option<usize>,
	write_buffer_size: Option<usize>,
	max_concurrent_connections: Option<usize>,
	connect_timeout_secs: Option<u64>,
	handshake_step_timeout_secs: Option<u64>,
	connection_timeout_secs: Option<u64>,
	recv_timeout_secs: Option<u64>,
	send_timeout_secs: Option<u64>,
	drain_threshold: Option<f64>,
	drain_timeout_secs: Option<u64>,
	session_timeout_secs: Option<u64>,
	max_retries: Option<u32>,
	retry_delay_millis: Option<u64>,
}

impl From<RawTunables> for Tunables {
	fn from(raw: RawTunables) -> Self {
		let default = Tunables::default();

		Tunables {
			read_buffer_size: raw.read_buffer_size.unwrap_or(default.read_buffer_size),
			write_buffer_size: raw.write_buffer_size.unwrap_or(default.write_buffer_size),
			max_concurrent_connections: raw
				.max_concurrent_connections
				.unwrap_or(default.max_concurrent_connections),
			connect_timeout: raw
				.connect_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(default.connect_timeout),
			handshake_step_timeout: raw
				.handshake_step_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(default.handshake_step_timeout),
			connection_timeout: raw
				.connection_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(default.connection_timeout),
			recv_timeout: raw
				.recv_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(default.recv_timeout),
			send_timeout: raw
				.send_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(default.send_timeout),
			drain_threshold: raw.drain_threshold.unwrap_or(default.drain_threshold),
			drain_timeout: raw
				.drain_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(default.drain_timeout),
			session_timeout: raw
				.session_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(default.session_timeout),
			max_retries: raw.max_retries.unwrap_or(default.max_retries),
			retry_delay: raw
				.retry_delay_millis
				.map(Duration::from_millis)
				.unwrap_or(default.retry_delay),
		}
	}
}

// --------------------------------------------------------------------------------

#[cfg(test)]
mod test {
	use super::*;

	const MINIMAL: &str = r#"{
		"name": "home",
		"sni_host": "cdn.example.com",
		"path": "/ws",
		"socks_port": 1080,
		"http_port": 8080,
		"pre_shared_key": "00112233445566778899aabbccddeeff"
	}"#;

	#[test]
	fn loads_minimal_config_with_defaults() {
		let config = Config::from_json_str(MINIMAL).unwrap();

		assert_eq!(config.server_port, 443);
		assert_eq!(config.socks_port, 1080);
		assert_eq!(config.pre_shared_key.len(), 17);
		assert_eq!(config.tunables.max_concurrent_connections, 200);
		assert_eq!(config.tunables.session_timeout, Duration::from_secs(300));
	}

	#[test]
	fn rejects_path_without_leading_slash() {
		let bad = MINIMAL.replace("\"/ws\"", "\"ws\"");

		let err = Config::from_json_str(&bad).unwrap_err();
		assert!(matches!(err, ConfigError::Invalid(_)));
	}

	#[test]
	fn rejects_short_psk() {
		let bad = MINIMAL.replace(
			"00112233445566778899aabbccddeeff",
			"0011223344556677",
		);

		let err = Config::from_json_str(&bad).unwrap_err();
		assert!(matches!(err, ConfigError::Invalid(_)));
	}

	#[test]
	fn rejects_malformed_json() {
		let err = Config::from_json_str("{not json").unwrap_err();
		assert!(matches!(err, ConfigError::Invalid(_)));
	}

	#[test]
	fn honors_tunable_overrides() {
		let with_override = MINIMAL.trim_end().trim_end_matches('}').to_string()
			+ ", \"max_concurrent_connections\": 50 }";

		let config = Config::from_json_str(&with_override).unwrap();
		assert_eq!(config.tunables.max_concurrent_connections, 50);
	}

	#[test]
	fn detects_self_target() {
		let config = Config::from_json_str(MINIMAL).unwrap();

		assert!(config.is_self_target("127.0.0.1", 1080));
		assert!(config.is_self_target("localhost", 8080));
		assert!(!config.is_self_target("127.0.0.1", 443));
		assert!(!config.is_self_target("example.com", 1080));
	}

	#[test]
	fn drain_watermark_is_percentage_of_write_buffer() {
		let tunables = Tunables::default();
		assert_eq!(tunables.drain_watermark(), (640.0 * 1024.0 * 0.7) as usize);
	}
}
