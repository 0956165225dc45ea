//! flexlink-transport: network transport helpers for flexlink.
//!
//! Three small modules cover the radio's three wire surfaces:
//!
//! - [`tcp`] -- timeout-wrapped TCP connect and the [`NetStream`]
//!   plain/TLS stream wrapper used by the control connection.
//! - [`tls`] -- TLS connector for the vendor endpoints (WAN control and
//!   SmartLink broker), with an accept-all verifier scoped to this module.
//! - [`udp`] -- UDP socket wrapper with a reuse/broadcast binding mode
//!   for the shared discovery and DAX ports.

pub mod tcp;
pub mod tls;
pub mod udp;

pub use tcp::NetStream;
pub use udp::UdpTransport;
