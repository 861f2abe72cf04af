//! AKE control channel transports for the DTCP-IP session manager.
//!
//! The manager talks to the network through three small traits:
//! [`AkeChannel`] (one framed, bidirectional control connection),
//! [`AkeAcceptor`] (a cancellable listener) and [`TransportFactory`]
//! (binds acceptors, dials channels). Two implementations ship here:
//! - [`tcp::TcpTransport`] over `std::net` with length-delimited frames,
//!   used in production;
//! - [`memory::MemoryNetwork`], an in-process registry of listeners and
//!   mpsc-backed duplex channels, used for deterministic tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod memory;
pub mod tcp;
pub mod traits;

pub use error::{Error, Result};
pub use memory::MemoryNetwork;
pub use tcp::TcpTransport;
pub use traits::{AkeAcceptor, AkeChannel, TransportFactory};

/// Largest accepted control frame in bytes.
///
/// AKE frames are small (a certificate exchange is under 200 bytes); the
/// cap exists so a garbage length prefix cannot trigger a huge allocation.
pub const MAX_FRAME_LEN: usize = 16 * 1024;
