//! In-process transport for deterministic tests.
//!
//! A [`MemoryNetwork`] is a registry of listeners keyed by port. Cloning
//! the network shares the registry, so two managers constructed with clones
//! of one network can dial each other without touching the OS network
//! stack. Channels are mpsc-backed duplex pairs with the same blocking
//! semantics as the TCP transport.

use crate::traits::{AkeAcceptor, AkeChannel, TransportFactory};
use crate::{Error, Result, MAX_FRAME_LEN};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{mpsc, Arc, Mutex};

/// First port handed out for wildcard binds.
const EPHEMERAL_BASE: u16 = 49152;

type Inbound = (MemoryChannel, SocketAddr);

/// An in-process network of listeners and duplex channels.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    listeners: HashMap<u16, Sender<Inbound>>,
    next_ephemeral: u16,
    next_peer_port: u16,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        // The registry holds no user code, so a poisoned lock only follows
        // a panic elsewhere in the same test.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl TransportFactory for MemoryNetwork {
    fn bind(&self, _interface: &str, port: u16) -> Result<Box<dyn AkeAcceptor>> {
        let mut registry = self.lock();

        let port = if port == 0 {
            loop {
                let candidate = EPHEMERAL_BASE + registry.next_ephemeral;
                registry.next_ephemeral += 1;
                if !registry.listeners.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            if registry.listeners.contains_key(&port) {
                return Err(Error::BindFailed(format!("port {} already bound", port)));
            }
            port
        };

        let (tx, rx) = mpsc::channel();
        registry.listeners.insert(port, tx);

        Ok(Box::new(MemoryAcceptor {
            network: self.clone(),
            rx,
            port,
        }))
    }

    fn connect(&self, addr: SocketAddr) -> Result<Box<dyn AkeChannel>> {
        let mut registry = self.lock();

        let peer_port = 40000 + registry.next_peer_port;
        registry.next_peer_port += 1;

        let listener = registry
            .listeners
            .get(&addr.port())
            .ok_or_else(|| Error::ConnectionFailed(format!("no listener on {}", addr)))?;

        let (local, remote) = duplex();
        let peer_addr = SocketAddr::from(([127, 0, 0, 1], peer_port));
        listener
            .send((remote, peer_addr))
            .map_err(|_| Error::ConnectionFailed(format!("listener on {} is gone", addr)))?;

        Ok(Box::new(local))
    }
}

fn duplex() -> (MemoryChannel, MemoryChannel) {
    let (tx_a, rx_b) = mpsc::channel();
    let (tx_b, rx_a) = mpsc::channel();
    (
        MemoryChannel {
            tx: Some(tx_a),
            rx: rx_a,
        },
        MemoryChannel {
            tx: Some(tx_b),
            rx: rx_b,
        },
    )
}

struct MemoryAcceptor {
    network: MemoryNetwork,
    rx: Receiver<Inbound>,
    port: u16,
}

impl AkeAcceptor for MemoryAcceptor {
    fn poll_accept(&mut self) -> Result<Option<(Box<dyn AkeChannel>, SocketAddr)>> {
        match self.rx.try_recv() {
            Ok((channel, peer)) => Ok(Some((Box::new(channel), peer))),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

impl Drop for MemoryAcceptor {
    fn drop(&mut self) {
        self.network.lock().listeners.remove(&self.port);
    }
}

struct MemoryChannel {
    tx: Option<Sender<Vec<u8>>>,
    rx: Receiver<Vec<u8>>,
}

impl AkeChannel for MemoryChannel {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(frame.len()));
        }

        self.tx
            .as_ref()
            .ok_or(Error::Disconnected)?
            .send(frame.to_vec())
            .map_err(|_| Error::Disconnected)
    }

    fn recv(&mut self) -> Result<Vec<u8>> {
        self.rx.recv().map_err(|_| Error::Disconnected)
    }

    fn close(&mut self) {
        // Dropping the sender unblocks the peer's pending recv.
        self.tx = None;
    }
}
