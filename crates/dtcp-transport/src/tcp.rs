//! TCP transport over `std::net` with length-delimited frames.
//!
//! Each frame travels as a 4-byte little-endian length prefix followed by
//! the frame bytes. The listener socket is nonblocking so
//! [`AkeAcceptor::poll_accept`] never stalls the listener thread; accepted
//! connections are switched back to blocking mode for the handshake.

use crate::traits::{AkeAcceptor, AkeChannel, TransportFactory};
use crate::{Error, Result, MAX_FRAME_LEN};
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};

/// The production transport: plain TCP on the AKE control port.
#[derive(Debug, Default, Clone)]
pub struct TcpTransport;

impl TcpTransport {
    /// Create the TCP transport factory.
    pub fn new() -> Self {
        Self
    }
}

impl TransportFactory for TcpTransport {
    fn bind(&self, interface: &str, port: u16) -> Result<Box<dyn AkeAcceptor>> {
        // Interface names cannot be resolved portably; anything that is
        // not an IP literal binds the wildcard address.
        let ip: IpAddr = interface
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let listener = TcpListener::bind((ip, port))
            .map_err(|e| Error::BindFailed(format!("{}:{}: {}", interface, port, e)))?;
        listener.set_nonblocking(true)?;
        let local_port = listener.local_addr()?.port();
        tracing::debug!(%ip, port = local_port, "bound AKE listener");

        Ok(Box::new(TcpAcceptor {
            listener,
            local_port,
        }))
    }

    fn connect(&self, addr: SocketAddr) -> Result<Box<dyn AkeChannel>> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpChannel { stream }))
    }
}

struct TcpAcceptor {
    listener: TcpListener,
    local_port: u16,
}

impl AkeAcceptor for TcpAcceptor {
    fn poll_accept(&mut self) -> Result<Option<(Box<dyn AkeChannel>, SocketAddr)>> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                tracing::debug!(%peer, "accepted AKE connection");
                Ok(Some((Box::new(TcpChannel { stream }), peer)))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }
}

struct TcpChannel {
    stream: TcpStream,
}

fn map_io(e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => Error::Disconnected,
        _ => Error::Io(e),
    }
}

impl AkeChannel for TcpChannel {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(frame.len()));
        }

        let len = (frame.len() as u32).to_le_bytes();
        self.stream.write_all(&len).map_err(map_io)?;
        self.stream.write_all(frame).map_err(map_io)?;
        self.stream.flush().map_err(map_io)?;
        Ok(())
    }

    fn recv(&mut self) -> Result<Vec<u8>> {
        let mut len_bytes = [0u8; 4];
        self.stream.read_exact(&mut len_bytes).map_err(map_io)?;

        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(len));
        }

        let mut frame = vec![0u8; len];
        self.stream.read_exact(&mut frame).map_err(map_io)?;
        Ok(frame)
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
