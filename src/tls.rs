//! TLS client dial and best-effort raw-socket tuning for the outbound
//! tunnel connection.
//!
//! Certificate validation against a trust store is deliberately disabled:
//! the cryptographic binding between client and server is the pre-shared
//! key exchanged in the tunnel handshake, not the TLS certificate.

// ----------

use std::sync::{Arc, Once};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use socket2::SockRef;
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::debug;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

static INSTALL_CRYPTO_PROVIDER: Once = Once::new();

fn ensure_crypto_provider_installed() {
	INSTALL_CRYPTO_PROVIDER.call_once(|| {
		let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
	});
}

// --------------------------------------------------
// NoCertificateVerification

/// Accepts any certificate chain without validation. See the module
/// documentation for why this is the intended, not an accidental, design.
#[derive(Debug)]
struct NoCertificateVerification(Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for NoCertificateVerification {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls12_signature(
			message,
			cert,
			dss,
			&self.0.signature_verification_algorithms,
		)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls13_signature(
			message,
			cert,
			dss,
			&self.0.signature_verification_algorithms,
		)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.0.signature_verification_algorithms.supported_schemes()
	}
}

fn client_config() -> ClientConfig {
	ensure_crypto_provider_installed();

	let provider = rustls::crypto::aws_lc_rs::default_provider();

	ClientConfig::builder()
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(NoCertificateVerification(Arc::new(provider))))
		.with_no_client_auth()
}

// --------------------------------------------------------------------------------

const TARGET_RCVBUF: usize = 6 * 1024 * 1024;
const TARGET_SNDBUF: usize = 640 * 1024;

/// Applies the proxy's outbound socket tuning: `TCP_NODELAY`,
/// `SO_KEEPALIVE`, `SO_LINGER(on=1, linger=0)`, and generous buffer
/// sizes. Every setsockopt is best-effort; a platform rejecting one is
/// logged at `debug` and otherwise ignored.
fn tune_socket(stream: &TcpStream) {
	let sock_ref = SockRef::from(stream);

	if let Err(err) = sock_ref.set_nodelay(true) {
		debug!(%err, "failed to set TCP_NODELAY on tunnel socket");
	}

	let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(30));
	if let Err(err) = sock_ref.set_tcp_keepalive(&keepalive) {
		debug!(%err, "failed to set SO_KEEPALIVE on tunnel socket");
	}

	if let Err(err) = sock_ref.set_linger(Some(Duration::from_secs(0))) {
		debug!(%err, "failed to set SO_LINGER on tunnel socket");
	}

	if let Err(err) = sock_ref.set_recv_buffer_size(TARGET_RCVBUF) {
		debug!(%err, "failed to set SO_RCVBUF on tunnel socket");
	}

	if let Err(err) = sock_ref.set_send_buffer_size(TARGET_SNDBUF) {
		debug!(%err, "failed to set SO_SNDBUF on tunnel socket");
	}
}

/// Dials `(host, port)` over TCP, applies socket tuning, then performs a
/// TLS handshake with `server_name` as the SNI value and certificate
/// verification disabled.
pub(crate) async fn dial(host: &str, port: u16, server_name: &str) -> std::io::Result<TlsStream<TcpStream>> {
	let tcp_stream = TcpStream::connect((host, port)).await?;
	tune_socket(&tcp_stream);

	let connector = TlsConnector::from(Arc::new(client_config()));
	let dns_name = ServerName::try_from(server_name.to_string())
		.map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;

	connector.connect(dns_name, tcp_stream).await
}
