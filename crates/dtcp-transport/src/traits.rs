//! Transport trait boundary between the manager and the network.

use crate::Result;
use std::net::SocketAddr;

/// One framed, bidirectional AKE control connection.
///
/// Frames are opaque byte strings; the protocol layer parses them. `recv`
/// blocks until a frame arrives or the peer disconnects
/// ([`crate::Error::Disconnected`], never a silent EOF).
pub trait AkeChannel: Send {
    /// Send one frame.
    fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Receive one frame, blocking.
    fn recv(&mut self) -> Result<Vec<u8>>;

    /// Close the connection. Further sends fail and the peer's pending
    /// `recv` unblocks with `Disconnected`.
    fn close(&mut self);
}

/// A cancellable listener for inbound AKE connections.
pub trait AkeAcceptor: Send {
    /// Accept a pending connection, if any, without blocking.
    ///
    /// Returns `Ok(None)` when no connection is waiting; the caller polls.
    fn poll_accept(&mut self) -> Result<Option<(Box<dyn AkeChannel>, SocketAddr)>>;

    /// The port this acceptor is bound to.
    fn local_port(&self) -> u16;
}

/// Binds acceptors and dials channels.
pub trait TransportFactory: Send + Sync {
    /// Bind a listener on the given interface and port.
    ///
    /// `interface` is an IP address in string form; implementations may
    /// fall back to a wildcard address for names they cannot resolve.
    fn bind(&self, interface: &str, port: u16) -> Result<Box<dyn AkeAcceptor>>;

    /// Open a connection to a remote listener.
    fn connect(&self, addr: SocketAddr) -> Result<Box<dyn AkeChannel>>;
}
