//! Hand-rolled client-side WebSocket layer: the HTTP/1.1 Upgrade
//! handshake plus masked binary frame encode/decode. No third-party
//! WebSocket crate sits between this module and the TLS byte stream.

// ----------

pub(crate) mod frame;
pub(crate) mod handshake;
