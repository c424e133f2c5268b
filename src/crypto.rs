//! Cryptographic facade: key derivation and authenticated encryption.
//!
//! The wire protocol treats these as opaque byte-in/byte-out operations;
//! the concrete choice of HKDF-SHA256 and ChaCha20-Poly1305 is an
//! implementation detail behind [`SessionKey`], [`encrypt`] and [`decrypt`].

// ----------

use chacha20poly1305::{
	aead::{Aead, KeyInit},
	ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::common::ImplError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

const SEND_INFO: &[u8] = b"secure-proxy send";
const RECV_INFO: &[u8] = b"secure-proxy recv";

// --------------------------------------------------
// SessionKey

/// A 32-byte directional AEAD key. Zeroized when dropped so a derived key
/// never lingers in process memory after its session ends.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
	pub(crate) fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}
}

impl std::fmt::Debug for SessionKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("SessionKey(..)")
	}
}

impl PartialEq for SessionKey {
	fn eq(&self, other: &Self) -> bool {
		use subtle::ConstantTimeEq;

		self.0.ct_eq(&other.0).into()
	}
}

// --------------------------------------------------------------------------------

/// Derives the two directional session keys from a pre-shared key and a
/// handshake salt. Deterministic: the same `(psk, salt)` always yields the
/// same `(send_key, recv_key)`.
pub(crate) fn derive_keys(psk: &[u8], salt: &[u8]) -> (SessionKey, SessionKey) {
	let hk = Hkdf::<Sha256>::new(Some(salt), psk);

	let mut send = [0u8; 32];
	hk.expand(SEND_INFO, &mut send)
		.expect("32 bytes is a valid HKDF-SHA256 output length");

	let mut recv = [0u8; 32];
	hk.expand(RECV_INFO, &mut recv)
		.expect("32 bytes is a valid HKDF-SHA256 output length");

	(SessionKey(send), SessionKey(recv))
}

/// Encrypts `plaintext` under `key`, drawing a fresh random nonce for this
/// call and prepending it to the returned ciphertext. The authentication
/// tag covers the nonce-prefixed ciphertext as a whole.
pub(crate) fn encrypt(key: &SessionKey, plaintext: &[u8]) -> Vec<u8> {
	let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

	let mut nonce_bytes = [0u8; NONCE_LEN];
	rand::thread_rng().fill_bytes(&mut nonce_bytes);
	let nonce = Nonce::from_slice(&nonce_bytes);

	let mut out = Vec::with_capacity(NONCE_LEN + plaintext.len() + TAG_LEN);
	out.extend_from_slice(&nonce_bytes);
	out.extend(
		cipher
			.encrypt(nonce, plaintext)
			.expect("chacha20poly1305 encryption over an in-memory buffer cannot fail"),
	);

	out
}

/// Decrypts a ciphertext produced by [`encrypt`] under the peer's matching
/// key. Fails with [`CryptoAuthFailed`] if the ciphertext is truncated,
/// tampered, or was sealed under a different key.
pub(crate) fn decrypt(key: &SessionKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoAuthFailed> {
	if ciphertext.len() < NONCE_LEN + TAG_LEN {
		return Err(CryptoAuthFailed);
	}

	let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
	let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
	let nonce = Nonce::from_slice(nonce_bytes);

	cipher.decrypt(nonce, sealed).map_err(|_| CryptoAuthFailed)
}

/// Returned when [`decrypt`] cannot authenticate a ciphertext.
#[derive(Debug, ImplError)]
#[error("AEAD authentication failed")]
pub(crate) struct CryptoAuthFailed;

// --------------------------------------------------------------------------------
