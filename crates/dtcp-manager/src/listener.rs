//! AKE listener: accepts inbound handshakes and registers the sessions
//! they establish.

use crate::driver;
use crate::session::{AkeLink, Pipeline, SessionEntry};
use crate::table::SessionTable;
use dtcp_core::{DeviceType, SinkPipeline, SourcePipeline};
use dtcp_crypto::DeviceKeyStore;
use dtcp_transport::{AkeAcceptor, AkeChannel};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Packet size bounds applied to sessions created by inbound handshakes.
#[derive(Debug, Clone, Copy)]
pub struct SessionDefaults {
    /// Minimum PCP payload size for inbound source sessions.
    pub min_packet_size: usize,
    /// Maximum PCP payload size.
    pub max_packet_size: usize,
}

/// A running accept loop bound to one interface.
pub struct Listener {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    port: u16,
}

impl Listener {
    /// Spawn the accept loop on an already-bound acceptor.
    pub fn spawn(
        acceptor: Box<dyn AkeAcceptor>,
        store: Arc<dyn DeviceKeyStore>,
        table: Arc<SessionTable>,
        defaults: SessionDefaults,
    ) -> Self {
        let port = acceptor.local_port();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = std::thread::spawn(move || {
            accept_loop(acceptor, store, table, defaults, stop_flag);
        });

        tracing::info!(port, "AKE listener started");
        Self {
            stop,
            handle: Some(handle),
            port,
        }
    }

    /// Port the listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting and join the accept thread. Idempotent.
    ///
    /// Handler threads for connections already accepted are not joined;
    /// they exit when their peer disconnects.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            tracing::info!(port = self.port, "AKE listener stopped");
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    mut acceptor: Box<dyn AkeAcceptor>,
    store: Arc<dyn DeviceKeyStore>,
    table: Arc<SessionTable>,
    defaults: SessionDefaults,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::SeqCst) {
        match acceptor.poll_accept() {
            Ok(Some((channel, peer))) => {
                tracing::debug!(%peer, "inbound AKE connection");
                let store = store.clone();
                let table = table.clone();
                std::thread::spawn(move || {
                    handle_connection(channel, peer, store, table, defaults);
                });
            }
            Ok(None) => std::thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(e) => {
                tracing::warn!(error = %e, "accept failed, listener exiting");
                break;
            }
        }
    }
}

fn handle_connection(
    mut channel: Box<dyn AkeChannel>,
    peer: SocketAddr,
    store: Arc<dyn DeviceKeyStore>,
    table: Arc<SessionTable>,
    defaults: SessionDefaults,
) {
    let (outcome, local_type) = match driver::run_responder(store.clone(), channel.as_mut()) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "inbound handshake failed");
            channel.close();
            return;
        }
    };

    match local_type {
        DeviceType::Source => {
            let pipeline = match SourcePipeline::new(
                outcome.exchange_key.clone(),
                outcome.key_label,
                defaults.min_packet_size,
                defaults.max_packet_size,
            ) {
                Ok(pipeline) => pipeline,
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "source pipeline setup failed");
                    channel.close();
                    return;
                }
            };

            let entry = SessionEntry {
                device_type: DeviceType::Source,
                remote_addr: peer,
                key_label: outcome.key_label,
                unique_key: outcome.unique_key,
                min_packet_size: defaults.min_packet_size,
                max_packet_size: defaults.max_packet_size,
                degraded: false,
                pipeline: Pipeline::Source(pipeline),
                link: None,
            };

            let key_label = outcome.key_label;
            let handle = match table.insert(entry) {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "rejecting inbound session");
                    channel.close();
                    return;
                }
            };
            let serve_entry = match table.get(handle) {
                Ok(entry) => Arc::downgrade(&entry),
                Err(_) => {
                    channel.close();
                    return;
                }
            };
            tracing::info!(%peer, key_label, "source session established");

            // Serve the sink's key renewal requests until it disconnects
            // or the session is deleted.
            driver::serve_renewals(
                channel,
                store,
                serve_entry,
                outcome.auth_key,
                outcome.initiator_random,
                outcome.responder_random,
                key_label,
                1,
            );
        }
        DeviceType::Sink => {
            let pipeline = SinkPipeline::new(
                outcome.exchange_key.clone(),
                outcome.key_label,
                defaults.max_packet_size,
            );

            let entry = SessionEntry {
                device_type: DeviceType::Sink,
                remote_addr: peer,
                key_label: outcome.key_label,
                unique_key: outcome.unique_key,
                min_packet_size: 0,
                max_packet_size: defaults.max_packet_size,
                degraded: false,
                pipeline: Pipeline::Sink(pipeline),
                link: Some(AkeLink {
                    channel,
                    auth_key: outcome.auth_key,
                    initiator_random: outcome.initiator_random,
                    responder_random: outcome.responder_random,
                    wrap_epoch: 1,
                }),
            };

            let key_label = outcome.key_label;
            match table.insert(entry) {
                Ok(_) => tracing::info!(%peer, key_label, "sink session established"),
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "rejecting inbound session");
                }
            }
        }
        DeviceType::Unknown => unreachable!("responder never assumes an unknown role"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtcp_core::ake::AkeMachine;
    use dtcp_crypto::{SoftwareKeyStore, TrustAnchor};
    use dtcp_transport::{MemoryNetwork, TransportFactory};

    fn provisioned(anchor: &TrustAnchor, id: u8) -> Arc<dyn DeviceKeyStore> {
        Arc::new(SoftwareKeyStore::provision(anchor, [id; 5], 0).unwrap())
    }

    #[test]
    fn test_inbound_sink_creates_source_session() {
        let anchor = TrustAnchor::generate().unwrap();
        let server_store = provisioned(&anchor, 1);
        let client_store = provisioned(&anchor, 2);

        let network = MemoryNetwork::new();
        let table = Arc::new(SessionTable::new(4));
        let acceptor = network.bind("0.0.0.0", 0).unwrap();
        let port = acceptor.local_port();

        let mut listener = Listener::spawn(
            acceptor,
            server_store,
            table.clone(),
            SessionDefaults {
                min_packet_size: 0,
                max_packet_size: 1024,
            },
        );

        let mut channel = network
            .connect(SocketAddr::from(([127, 0, 0, 1], port)))
            .unwrap();
        let machine = AkeMachine::new_initiator(client_store, DeviceType::Sink, None, false);
        driver::run_initiator(machine, channel.as_mut()).unwrap();

        // The serve thread registers the session after the final status.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while table.count(DeviceType::Source) == 0 {
            assert!(std::time::Instant::now() < deadline, "session never appeared");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(table.count(DeviceType::Source), 1);

        channel.close();
        listener.stop();
    }

    #[test]
    fn test_failed_handshake_registers_nothing() {
        let server_store = provisioned(&TrustAnchor::generate().unwrap(), 1);
        // Different anchor: certificate validation must fail.
        let client_store = provisioned(&TrustAnchor::generate().unwrap(), 2);

        let network = MemoryNetwork::new();
        let table = Arc::new(SessionTable::new(4));
        let acceptor = network.bind("0.0.0.0", 0).unwrap();
        let port = acceptor.local_port();

        let mut listener = Listener::spawn(
            acceptor,
            server_store,
            table.clone(),
            SessionDefaults {
                min_packet_size: 0,
                max_packet_size: 1024,
            },
        );

        let mut channel = network
            .connect(SocketAddr::from(([127, 0, 0, 1], port)))
            .unwrap();
        let machine = AkeMachine::new_initiator(client_store, DeviceType::Sink, None, false);
        assert!(driver::run_initiator(machine, channel.as_mut()).is_err());

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(table.count(DeviceType::Unknown), 0);

        listener.stop();
    }
}
