//! The `DtcpManager` facade.

use crate::driver;
use crate::listener::{Listener, SessionDefaults};
use crate::session::{AkeLink, Pipeline, SessionEntry, SessionInfo};
use crate::table::{SessionHandle, SessionTable};
use dtcp_core::ake::AkeMachine;
use dtcp_core::{
    DeviceType, Error, ErrorCode, Packet, Result, SinkPipeline, SourcePipeline,
};
use dtcp_crypto::DeviceKeyStore;
use dtcp_transport::TransportFactory;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Log verbosity: errors only.
pub const LOG_LEVEL_ERROR: u8 = 0;
/// Log verbosity: warnings.
pub const LOG_LEVEL_WARN: u8 = 1;
/// Log verbosity: informational.
pub const LOG_LEVEL_INFO: u8 = 2;
/// Log verbosity: debug.
pub const LOG_LEVEL_DEBUG: u8 = 3;
/// Log verbosity: everything.
pub const LOG_LEVEL_TRACE: u8 = 4;

/// Manager tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    /// Maximum number of concurrent sessions.
    pub capacity: usize,
    /// Port outbound source sessions connect to on the sink host.
    pub ake_port: u16,
    /// Minimum PCP payload size for sessions created by inbound handshakes.
    pub min_packet_size: usize,
    /// Maximum PCP payload size for sessions created by inbound handshakes.
    pub max_packet_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            capacity: 16,
            ake_port: 8000,
            min_packet_size: 0,
            max_packet_size: 1024 * 1024,
        }
    }
}

/// DTCP-IP session manager.
///
/// Owns the session table and listener threads; all methods are callable
/// from arbitrary threads. See the crate docs for a usage sketch.
pub struct DtcpManager {
    ready: Mutex<bool>,
    store: Arc<dyn DeviceKeyStore>,
    transport: Arc<dyn TransportFactory>,
    table: Arc<SessionTable>,
    listeners: Mutex<Vec<Listener>>,
    log_level: AtomicU8,
    config: ManagerConfig,
}

impl DtcpManager {
    /// Create a manager over the given trust module and transport.
    ///
    /// The manager starts uninitialized; every session operation fails
    /// `NotInitialized` until [`DtcpManager::initialize`] is called.
    pub fn new(
        store: Arc<dyn DeviceKeyStore>,
        transport: Arc<dyn TransportFactory>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            ready: Mutex::new(false),
            store,
            transport,
            table: Arc::new(SessionTable::new(config.capacity)),
            listeners: Mutex::new(Vec::new()),
            log_level: AtomicU8::new(LOG_LEVEL_INFO),
            config,
        }
    }

    /// Transition to the ready state. Idempotent; concurrent calls all
    /// succeed with exactly one transition.
    pub fn initialize(&self) -> Result<()> {
        let mut ready = lock(&self.ready)?;
        if !*ready {
            *ready = true;
            if self.log_at(LOG_LEVEL_INFO) {
                tracing::info!(capacity = self.config.capacity, "DTCP manager initialized");
            }
        }
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        if *lock(&self.ready)? {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    /// Start an AKE listener on `interface:port`. Additive: each call
    /// starts another listener.
    pub fn start_source(&self, interface: &str, port: u16) -> Result<()> {
        self.ensure_ready()?;
        if interface.is_empty() {
            return Err(Error::InvalidParam("Listener interface is empty".into()));
        }
        if port == 0 {
            return Err(Error::InvalidParam("Listener port is zero".into()));
        }

        let acceptor = self.transport.bind(interface, port)?;
        let listener = Listener::spawn(
            acceptor,
            self.store.clone(),
            self.table.clone(),
            SessionDefaults {
                min_packet_size: self.config.min_packet_size,
                max_packet_size: self.config.max_packet_size,
            },
        );
        lock(&self.listeners)?.push(listener);
        Ok(())
    }

    /// Stop and join all listener threads. Idempotent. Established
    /// sessions are unaffected.
    pub fn stop_source(&self) -> Result<()> {
        let mut listeners = lock(&self.listeners)?;
        for listener in listeners.iter_mut() {
            listener.stop();
        }
        listeners.clear();
        Ok(())
    }

    /// Open an outbound source session toward a sink's AKE endpoint.
    ///
    /// `key_label` selects the exchange key: 0 is the shared key, other
    /// labels must already be provisioned in the key store.
    pub fn create_source_session(
        &self,
        sink_addr: &str,
        key_label: i32,
        min_packet_size: usize,
        max_packet_size: usize,
    ) -> Result<SessionHandle> {
        self.ensure_ready()?;

        let label = u8::try_from(key_label).map_err(|_| Error::InvalidKeyLabel(key_label))?;
        if label != dtcp_crypto::SHARED_KEY_LABEL && self.store.exchange_key(label).is_err() {
            return Err(Error::InvalidKeyLabel(key_label));
        }
        if max_packet_size == 0 || max_packet_size > u32::MAX as usize {
            return Err(Error::InvalidParam("Maximum packet size out of range".into()));
        }
        if min_packet_size > max_packet_size {
            return Err(Error::InvalidParam(
                "Minimum packet size exceeds maximum".into(),
            ));
        }
        let ip = parse_ip(sink_addr)?;

        let remote = SocketAddr::new(ip, self.config.ake_port);
        let mut channel = self.transport.connect(remote)?;
        let machine = AkeMachine::new_initiator(
            self.store.clone(),
            DeviceType::Source,
            Some(label),
            false,
        );
        let outcome = match driver::run_initiator(machine, channel.as_mut()) {
            Ok(outcome) => outcome,
            Err(e) => {
                channel.close();
                return Err(e);
            }
        };

        let pipeline = SourcePipeline::new(
            outcome.exchange_key.clone(),
            outcome.key_label,
            min_packet_size,
            max_packet_size,
        )?;
        let entry = SessionEntry {
            device_type: DeviceType::Source,
            remote_addr: remote,
            key_label: outcome.key_label,
            unique_key: outcome.unique_key,
            min_packet_size,
            max_packet_size,
            degraded: false,
            pipeline: Pipeline::Source(pipeline),
            link: None,
        };
        let handle = match self.table.insert(entry) {
            Ok(handle) => handle,
            Err(e) => {
                channel.close();
                return Err(e);
            }
        };
        let serve_entry = match self.table.get(handle) {
            Ok(entry) => Arc::downgrade(&entry),
            Err(e) => {
                channel.close();
                return Err(e);
            }
        };

        // The sink end of this connection pulls key renewals from us; the
        // serve thread re-keys our pipeline through the weak entry and
        // stops serving once the session is deleted.
        let serve_store = self.store.clone();
        let served_label = outcome.key_label;
        std::thread::spawn(move || {
            driver::serve_renewals(
                channel,
                serve_store,
                serve_entry,
                outcome.auth_key,
                outcome.initiator_random,
                outcome.responder_random,
                served_label,
                1,
            );
        });

        if self.log_at(LOG_LEVEL_INFO) {
            tracing::info!(%remote, key_label = served_label, "source session created");
        }
        Ok(handle)
    }

    /// Open an outbound sink session toward a source's AKE endpoint.
    ///
    /// With `unique_key` the source is asked to mint a per-session
    /// exchange key instead of handing out the shared one.
    pub fn create_sink_session(
        &self,
        source_addr: &str,
        source_port: u16,
        unique_key: bool,
        max_packet_size: usize,
    ) -> Result<SessionHandle> {
        self.ensure_ready()?;
        if source_port == 0 {
            return Err(Error::InvalidParam("Source port is zero".into()));
        }
        if unique_key
            && !self
                .store
                .device_certificate()
                .supports_session_exchange_key()
        {
            return Err(Error::InvalidKeyLabel(-1));
        }
        let ip = parse_ip(source_addr)?;

        let remote = SocketAddr::new(ip, source_port);
        let mut channel = self.transport.connect(remote)?;
        let machine =
            AkeMachine::new_initiator(self.store.clone(), DeviceType::Sink, None, unique_key);
        let outcome = match driver::run_initiator(machine, channel.as_mut()) {
            Ok(outcome) => outcome,
            Err(e) => {
                channel.close();
                return Err(e);
            }
        };

        let pipeline = SinkPipeline::new(
            outcome.exchange_key.clone(),
            outcome.key_label,
            max_packet_size,
        );
        let key_label = outcome.key_label;
        let entry = SessionEntry {
            device_type: DeviceType::Sink,
            remote_addr: remote,
            key_label,
            unique_key: outcome.unique_key,
            min_packet_size: 0,
            max_packet_size,
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
        // On insert failure the entry (and its link) is dropped, which
        // closes the channel.
        let handle = self.table.insert(entry)?;

        if self.log_at(LOG_LEVEL_INFO) {
            tracing::info!(%remote, key_label, unique_key, "sink session created");
        }
        Ok(handle)
    }

    /// Run one buffer through the session's pipeline.
    ///
    /// Source sessions consume plaintext and may emit protected PCPs into
    /// the descriptor; sink sessions consume wire bytes and may emit
    /// plaintext. A sink session whose key material has gone stale pulls a
    /// renewal over its retained AKE link and retries once; a failed
    /// renewal marks the session degraded and returns the original error.
    pub fn process_packet(
        &self,
        handle: SessionHandle,
        packet: &mut Packet,
        data_in: &[u8],
    ) -> Result<()> {
        self.ensure_ready()?;
        let entry = self.table.get(handle)?;
        let mut guard = entry
            .lock()
            .map_err(|_| Error::General("Session lock poisoned".into()))?;
        let SessionEntry {
            pipeline,
            link,
            degraded,
            key_label,
            ..
        } = &mut *guard;

        match pipeline {
            Pipeline::Source(pipeline) => pipeline.process(packet, data_in),
            Pipeline::Sink(pipeline) => {
                let err = match pipeline.process(packet, data_in) {
                    Ok(()) => return Ok(()),
                    Err(e) if e.code() == ErrorCode::ContentKeyRequired => e,
                    Err(e) => return Err(e),
                };

                let Some(link) = link else {
                    return Err(err);
                };
                match link.request_key_renewal() {
                    Ok((label, exchange_key)) => {
                        pipeline.set_exchange_key(exchange_key, label);
                        *key_label = label;
                        if self.log_at(LOG_LEVEL_DEBUG) {
                            tracing::debug!(handle, label, "exchange key renewed");
                        }
                        pipeline.process(packet, data_in)
                    }
                    Err(renewal_err) => {
                        *degraded = true;
                        if self.log_at(LOG_LEVEL_WARN) {
                            tracing::warn!(
                                handle,
                                error = %renewal_err,
                                "key renewal failed, session degraded"
                            );
                        }
                        Err(err)
                    }
                }
            }
        }
    }

    /// Free the pipeline-owned buffers held by a descriptor. Idempotent.
    pub fn release_packet(&self, packet: &mut Packet) -> Result<()> {
        self.ensure_ready()?;
        packet.release();
        Ok(())
    }

    /// Tear down a session and invalidate its handle.
    ///
    /// Waits for in-flight `process_packet` calls on the same handle, then
    /// closes the retained AKE link.
    pub fn delete_session(&self, handle: SessionHandle) -> Result<()> {
        self.ensure_ready()?;
        let entry = self.table.remove(handle)?;

        // New lookups already fail; the lock waits out in-flight calls.
        let mut guard = match entry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(link) = guard.link.as_mut() {
            link.close();
        }

        if self.log_at(LOG_LEVEL_INFO) {
            tracing::info!(handle, "session deleted");
        }
        Ok(())
    }

    /// Number of live sessions with the given role; `Unknown` counts all.
    pub fn num_sessions(&self, device_type: DeviceType) -> usize {
        self.table.count(device_type)
    }

    /// Handles of every live session, including sessions created by
    /// inbound handshakes on a listener.
    pub fn session_handles(&self) -> Result<Vec<SessionHandle>> {
        self.ensure_ready()?;
        self.table.handles()
    }

    /// Read-only snapshot of a live session.
    pub fn session_info(&self, handle: SessionHandle) -> Result<SessionInfo> {
        self.ensure_ready()?;
        let entry = self.table.get(handle)?;
        let guard = entry
            .lock()
            .map_err(|_| Error::General("Session lock poisoned".into()))?;
        Ok(guard.info())
    }

    /// Set the manager's log verbosity, clamping out-of-range values.
    /// Returns the level actually in effect. Never fails.
    pub fn set_log_level(&self, level: i32) -> u8 {
        let clamped = level.clamp(i32::from(LOG_LEVEL_ERROR), i32::from(LOG_LEVEL_TRACE)) as u8;
        self.log_level.store(clamped, Ordering::SeqCst);
        clamped
    }

    /// Stop listeners, tear down every session and return to the
    /// uninitialized state.
    pub fn shutdown(&self) -> Result<()> {
        self.stop_source()?;

        for entry in self.table.drain() {
            let mut guard = match entry.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(link) = guard.link.as_mut() {
                link.close();
            }
        }

        *lock(&self.ready)? = false;
        if self.log_at(LOG_LEVEL_INFO) {
            tracing::info!("DTCP manager shut down");
        }
        Ok(())
    }

    fn log_at(&self, level: u8) -> bool {
        self.log_level.load(Ordering::Relaxed) >= level
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::General("Manager lock poisoned".into()))
}

fn parse_ip(addr: &str) -> Result<IpAddr> {
    addr.parse::<IpAddr>()
        .map_err(|_| Error::InvalidIpAddress(addr.to_string()))
}
