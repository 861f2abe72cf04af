//! End-to-end manager tests over the in-memory transport.
//!
//! Each test builds its own `MemoryNetwork`, so listeners in different
//! tests never collide even though they use the same port numbers.

use dtcp_core::{DeviceType, Emi, Error, Packet};
use dtcp_crypto::{DeviceKeyStore, SoftwareKeyStore, TrustAnchor, CAP_SESSION_EXCHANGE_KEY};
use dtcp_manager::{DtcpManager, ManagerConfig};
use dtcp_transport::MemoryNetwork;
use std::sync::Arc;
use std::time::{Duration, Instant};

const AKE_PORT: u16 = 8000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn provisioned_store(anchor: &TrustAnchor, id: u8, capabilities: u8) -> Arc<dyn DeviceKeyStore> {
    Arc::new(SoftwareKeyStore::provision(anchor, [id; 5], capabilities).unwrap())
}

fn manager_with_store(
    store: Arc<dyn DeviceKeyStore>,
    network: &MemoryNetwork,
    config: ManagerConfig,
) -> DtcpManager {
    let m = DtcpManager::new(store, Arc::new(network.clone()), config);
    m.initialize().unwrap();
    m
}

fn manager(
    anchor: &TrustAnchor,
    id: u8,
    capabilities: u8,
    network: &MemoryNetwork,
    config: ManagerConfig,
) -> DtcpManager {
    manager_with_store(provisioned_store(anchor, id, capabilities), network, config)
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// A source manager listening on `AKE_PORT` and a sink manager on the same
/// in-memory network, both under one trust anchor.
fn source_sink_pair(
    network: &MemoryNetwork,
    source_config: ManagerConfig,
) -> (DtcpManager, DtcpManager) {
    let anchor = TrustAnchor::generate().unwrap();
    let source = manager(&anchor, 1, 0, network, source_config);
    let sink = manager(&anchor, 2, 0, network, ManagerConfig::default());
    source.start_source("0.0.0.0", AKE_PORT).unwrap();
    (source, sink)
}

#[test]
fn test_sink_session_establishes_source_counterpart() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (source, sink) = source_sink_pair(&network, ManagerConfig::default());

    let handle = sink
        .create_sink_session("127.0.0.1", AKE_PORT, false, 1024 * 1024)
        .unwrap();

    assert_eq!(sink.num_sessions(DeviceType::Sink), 1);
    assert_eq!(sink.num_sessions(DeviceType::Source), 0);
    assert_eq!(sink.num_sessions(DeviceType::Unknown), 1);
    wait_until("source session registration", || {
        source.num_sessions(DeviceType::Source) == 1
    });

    let info = sink.session_info(handle).unwrap();
    assert_eq!(info.device_type, DeviceType::Sink);
    assert_eq!(info.key_label, 0);
    assert!(!info.unique_key);
    assert!(!info.degraded);
}

#[test]
fn test_handle_invalid_after_delete() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (_source, sink) = source_sink_pair(&network, ManagerConfig::default());

    let handle = sink
        .create_sink_session("127.0.0.1", AKE_PORT, false, 1024 * 1024)
        .unwrap();
    assert!(sink.session_info(handle).is_ok());

    sink.delete_session(handle).unwrap();
    assert!(matches!(sink.session_info(handle), Err(Error::NotInitialized)));
    assert!(matches!(
        sink.process_packet(handle, &mut Packet::for_sink(), &[]),
        Err(Error::NotInitialized)
    ));
    assert!(matches!(
        sink.delete_session(handle),
        Err(Error::NotInitialized)
    ));
    assert_eq!(sink.num_sessions(DeviceType::Unknown), 0);
}

#[test]
fn test_round_trip_buffer_size_grid() {
    init_tracing();
    const MIN: usize = 32;
    const MAX: usize = 256;

    let network = MemoryNetwork::new();
    // Inbound source sessions take their packet size bounds from the
    // source manager's config.
    let (source, sink) = source_sink_pair(
        &network,
        ManagerConfig {
            min_packet_size: MIN,
            max_packet_size: MAX,
            ..ManagerConfig::default()
        },
    );

    let sink_handle = sink
        .create_sink_session("127.0.0.1", AKE_PORT, false, MAX)
        .unwrap();
    wait_until("source session registration", || {
        source.num_sessions(DeviceType::Source) == 1
    });
    // The listener registered the inbound session; look up its handle.
    let source_handle = source.session_handles().unwrap()[0];
    assert_eq!(
        source.session_info(source_handle).unwrap().device_type,
        DeviceType::Source
    );

    for size in [0, 1, MIN - 1, MIN, MAX] {
        let data = vec![0xA5u8; size];

        // EOF on every call so each buffer flushes as one PCP.
        let mut out = Packet::for_source(Emi::CopyFree);
        out.set_eof();
        source.process_packet(source_handle, &mut out, &data).unwrap();
        let wire = out.data_out().expect("flush must emit a PCP").to_vec();
        source.release_packet(&mut out).unwrap();

        // Deliver in two chunks to exercise sink-side reassembly.
        let split = wire.len() / 2;
        let mut first = Packet::for_sink();
        sink.process_packet(sink_handle, &mut first, &wire[..split])
            .unwrap();
        let mut plaintext = first.data_out().unwrap_or(&[]).to_vec();
        sink.release_packet(&mut first).unwrap();

        let mut second = Packet::for_sink();
        sink.process_packet(sink_handle, &mut second, &wire[split..])
            .unwrap();
        plaintext.extend_from_slice(second.data_out().unwrap_or(&[]));
        assert_eq!(second.emi(), Some(Emi::CopyFree), "size {size}");
        sink.release_packet(&mut second).unwrap();

        assert_eq!(plaintext, data, "size {size}");
    }

    // Over-limit buffers are rejected outright, not split.
    let mut oversized = Packet::for_source(Emi::CopyFree);
    assert!(matches!(
        source.process_packet(source_handle, &mut oversized, &vec![0u8; MAX + 1]),
        Err(Error::InvalidParam(_))
    ));

    // Below-minimum buffers accumulate without emitting.
    let mut partial = Packet::for_source(Emi::CopyFree);
    source
        .process_packet(source_handle, &mut partial, &[7u8; 10])
        .unwrap();
    assert!(partial.data_out().is_none());

    let mut flush = Packet::for_source(Emi::CopyFree);
    flush.set_eof();
    source.process_packet(source_handle, &mut flush, &[]).unwrap();
    let wire = flush.data_out().expect("eof must flush").to_vec();

    let mut delivered = Packet::for_sink();
    sink.process_packet(sink_handle, &mut delivered, &wire).unwrap();
    assert_eq!(delivered.data_out(), Some(&[7u8; 10][..]));
}

#[test]
fn test_outbound_source_session_round_trip() {
    init_tracing();
    let network = MemoryNetwork::new();
    let anchor = TrustAnchor::generate().unwrap();

    // The sink host listens; the source manager dials its AKE port.
    let sink = manager(&anchor, 1, 0, &network, ManagerConfig::default());
    sink.start_source("0.0.0.0", 9000).unwrap();
    let source = manager(
        &anchor,
        2,
        0,
        &network,
        ManagerConfig {
            ake_port: 9000,
            ..ManagerConfig::default()
        },
    );

    let source_handle = source
        .create_source_session("127.0.0.1", 0, 0, 4096)
        .unwrap();
    assert_eq!(source.num_sessions(DeviceType::Source), 1);
    wait_until("sink session registration", || {
        sink.num_sessions(DeviceType::Sink) == 1
    });
    let sink_handle = sink.session_handles().unwrap()[0];

    let data = b"over the wire and back".to_vec();
    let mut out = Packet::for_source(Emi::NoMoreCopies);
    source.process_packet(source_handle, &mut out, &data).unwrap();
    let wire = out.data_out().expect("min 0 emits per call").to_vec();
    assert!(out.pcp_header().is_some());
    assert_eq!(out.pcp_header_offset(), Some(0));

    let mut delivered = Packet::for_sink();
    sink.process_packet(sink_handle, &mut delivered, &wire).unwrap();
    assert_eq!(delivered.data_out(), Some(&data[..]));
    assert_eq!(delivered.emi(), Some(Emi::NoMoreCopies));
}

#[test]
fn test_renewal_recovers_after_key_rotation() {
    init_tracing();
    let network = MemoryNetwork::new();
    let anchor = TrustAnchor::generate().unwrap();
    let source_store = Arc::new(SoftwareKeyStore::provision(&anchor, [1; 5], 0).unwrap());
    let source = manager_with_store(source_store.clone(), &network, ManagerConfig::default());
    let sink = manager(&anchor, 2, 0, &network, ManagerConfig::default());
    source.start_source("0.0.0.0", AKE_PORT).unwrap();

    let sink_handle = sink
        .create_sink_session("127.0.0.1", AKE_PORT, false, 1024 * 1024)
        .unwrap();
    wait_until("source session registration", || {
        source.num_sessions(DeviceType::Source) == 1
    });
    let source_handle = source.session_handles().unwrap()[0];

    let encrypt = |data: &[u8]| {
        let mut out = Packet::for_source(Emi::CopyFree);
        out.set_eof();
        source.process_packet(source_handle, &mut out, data).unwrap();
        out.data_out().unwrap().to_vec()
    };

    let wire = encrypt(b"before rotation");
    let mut delivered = Packet::for_sink();
    sink.process_packet(sink_handle, &mut delivered, &wire).unwrap();
    assert_eq!(delivered.data_out(), Some(&b"before rotation"[..]));

    // Rotate the exchange key behind the live session's back, then corrupt
    // one packet so the sink pulls a renewal over its retained link. The
    // corrupted buffer itself stays undecryptable.
    source_store.rotate_exchange_key(0).unwrap();
    let mut tampered = encrypt(b"casualty");
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    let mut failed = Packet::for_sink();
    assert!(sink
        .process_packet(sink_handle, &mut failed, &tampered)
        .is_err());

    // The renewal succeeded: the session is not degraded and both ends
    // moved to the rotated key, so the stream keeps flowing.
    assert!(!sink.session_info(sink_handle).unwrap().degraded);
    let wire = encrypt(b"after rotation");
    let mut recovered = Packet::for_sink();
    sink.process_packet(sink_handle, &mut recovered, &wire).unwrap();
    assert_eq!(recovered.data_out(), Some(&b"after rotation"[..]));
}

#[test]
fn test_failed_renewal_marks_session_degraded() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (source, sink) = source_sink_pair(&network, ManagerConfig::default());

    let sink_handle = sink
        .create_sink_session("127.0.0.1", AKE_PORT, false, 1024 * 1024)
        .unwrap();
    wait_until("source session registration", || {
        source.num_sessions(DeviceType::Source) == 1
    });
    let source_handle = source.session_handles().unwrap()[0];

    // Produce a corrupted packet while the source session is still alive.
    let mut tampered = {
        let mut out = Packet::for_source(Emi::CopyFree);
        out.set_eof();
        source
            .process_packet(source_handle, &mut out, b"payload")
            .unwrap();
        out.data_out().unwrap().to_vec()
    };
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;

    // Deleting the source session ends its renewal service, so the pull
    // triggered by the corrupted packet cannot be answered.
    source.delete_session(source_handle).unwrap();

    let mut failed = Packet::for_sink();
    assert!(sink
        .process_packet(sink_handle, &mut failed, &tampered)
        .is_err());

    // The failed renewal marks the session degraded but does not delete
    // it; that stays the caller's decision.
    let info = sink.session_info(sink_handle).unwrap();
    assert!(info.degraded);
    assert_eq!(sink.num_sessions(DeviceType::Sink), 1);
    sink.delete_session(sink_handle).unwrap();
}

#[test]
fn test_capacity_exhaustion_and_slot_reuse() {
    init_tracing();
    let network = MemoryNetwork::new();
    let anchor = TrustAnchor::generate().unwrap();
    let source = manager(&anchor, 1, 0, &network, ManagerConfig::default());
    source.start_source("0.0.0.0", AKE_PORT).unwrap();

    let sink = manager(
        &anchor,
        2,
        0,
        &network,
        ManagerConfig {
            capacity: 2,
            ..ManagerConfig::default()
        },
    );

    let first = sink
        .create_sink_session("127.0.0.1", AKE_PORT, false, 1024)
        .unwrap();
    sink.create_sink_session("127.0.0.1", AKE_PORT, false, 1024)
        .unwrap();
    assert!(matches!(
        sink.create_sink_session("127.0.0.1", AKE_PORT, false, 1024),
        Err(Error::OutOfSessions)
    ));

    sink.delete_session(first).unwrap();
    assert!(sink
        .create_sink_session("127.0.0.1", AKE_PORT, false, 1024)
        .is_ok());
    assert_eq!(sink.num_sessions(DeviceType::Sink), 2);
}

#[test]
fn test_failed_ake_leaves_no_session() {
    init_tracing();
    let network = MemoryNetwork::new();

    // Two devices provisioned under different trust anchors.
    let source = manager(
        &TrustAnchor::generate().unwrap(),
        1,
        0,
        &network,
        ManagerConfig::default(),
    );
    source.start_source("0.0.0.0", AKE_PORT).unwrap();
    let sink = manager(
        &TrustAnchor::generate().unwrap(),
        2,
        0,
        &network,
        ManagerConfig::default(),
    );

    assert!(sink
        .create_sink_session("127.0.0.1", AKE_PORT, false, 1024)
        .is_err());
    assert_eq!(sink.num_sessions(DeviceType::Unknown), 0);

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(source.num_sessions(DeviceType::Unknown), 0);
}

#[test]
fn test_unreachable_source_host() {
    init_tracing();
    let network = MemoryNetwork::new();
    let anchor = TrustAnchor::generate().unwrap();
    let sink = manager(&anchor, 2, 0, &network, ManagerConfig::default());

    // Nothing is listening anywhere on this network.
    assert!(matches!(
        sink.create_sink_session("127.0.0.1", AKE_PORT, false, 1024),
        Err(Error::ServerNotReachable)
    ));
}

#[test]
fn test_source_session_invalid_key_label() {
    init_tracing();
    let network = MemoryNetwork::new();
    let anchor = TrustAnchor::generate().unwrap();
    let source = manager(&anchor, 1, 0, &network, ManagerConfig::default());

    assert!(matches!(
        source.create_source_session("10.0.0.5", -1, 64 * 1024, 256 * 1024),
        Err(Error::InvalidKeyLabel(-1))
    ));
    assert_eq!(source.num_sessions(DeviceType::Unknown), 0);
}

#[test]
fn test_unique_key_session() {
    init_tracing();
    let network = MemoryNetwork::new();
    let anchor = TrustAnchor::generate().unwrap();

    let source = manager(
        &anchor,
        1,
        CAP_SESSION_EXCHANGE_KEY,
        &network,
        ManagerConfig::default(),
    );
    source.start_source("0.0.0.0", AKE_PORT).unwrap();
    let sink = manager(
        &anchor,
        2,
        CAP_SESSION_EXCHANGE_KEY,
        &network,
        ManagerConfig::default(),
    );

    let handle = sink
        .create_sink_session("127.0.0.1", AKE_PORT, true, 1024)
        .unwrap();
    let info = sink.session_info(handle).unwrap();
    assert!(info.unique_key);
    assert_ne!(info.key_label, 0);
}

#[test]
fn test_unique_key_denied_without_capability() {
    init_tracing();
    let network = MemoryNetwork::new();
    let anchor = TrustAnchor::generate().unwrap();
    let source = manager(&anchor, 1, 0, &network, ManagerConfig::default());
    source.start_source("0.0.0.0", AKE_PORT).unwrap();
    let sink = manager(&anchor, 2, 0, &network, ManagerConfig::default());

    assert!(matches!(
        sink.create_sink_session("127.0.0.1", AKE_PORT, true, 1024),
        Err(Error::InvalidKeyLabel(_))
    ));
    assert_eq!(sink.num_sessions(DeviceType::Unknown), 0);
}

#[test]
fn test_concurrent_initialize() {
    init_tracing();
    let network = MemoryNetwork::new();
    let anchor = TrustAnchor::generate().unwrap();
    let manager = Arc::new(DtcpManager::new(
        provisioned_store(&anchor, 1, 0),
        Arc::new(network),
        ManagerConfig::default(),
    ));

    let threads: Vec<_> = (0..3)
        .map(|_| {
            let manager = manager.clone();
            std::thread::spawn(move || manager.initialize())
        })
        .collect();
    for thread in threads {
        thread.join().unwrap().unwrap();
    }
    assert_eq!(manager.num_sessions(DeviceType::Unknown), 0);
}

#[test]
fn test_double_release_is_noop() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (source, sink) = source_sink_pair(&network, ManagerConfig::default());

    let sink_handle = sink
        .create_sink_session("127.0.0.1", AKE_PORT, false, 1024 * 1024)
        .unwrap();
    wait_until("source session registration", || {
        source.num_sessions(DeviceType::Source) == 1
    });

    let source_handle = source.session_handles().unwrap()[0];
    let mut out = Packet::for_source(Emi::CopyFree);
    out.set_eof();
    source.process_packet(source_handle, &mut out, b"payload").unwrap();
    assert!(out.data_out().is_some());

    source.release_packet(&mut out).unwrap();
    assert!(out.data_out().is_none());
    source.release_packet(&mut out).unwrap();
    assert!(out.data_out().is_none());

    // Releasing an unprocessed descriptor is also a no-op.
    let mut unused = Packet::for_sink();
    sink.release_packet(&mut unused).unwrap();
    let _ = sink_handle;
}

#[test]
fn test_shutdown_tears_everything_down() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (source, sink) = source_sink_pair(&network, ManagerConfig::default());

    let handle = sink
        .create_sink_session("127.0.0.1", AKE_PORT, false, 1024)
        .unwrap();
    wait_until("source session registration", || {
        source.num_sessions(DeviceType::Source) == 1
    });

    sink.shutdown().unwrap();
    assert_eq!(sink.num_sessions(DeviceType::Unknown), 0);
    assert!(matches!(sink.session_info(handle), Err(Error::NotInitialized)));

    // Back to the uninitialized state until the next initialize.
    assert!(matches!(
        sink.create_sink_session("127.0.0.1", AKE_PORT, false, 1024),
        Err(Error::NotInitialized)
    ));
    sink.initialize().unwrap();
    assert!(sink
        .create_sink_session("127.0.0.1", AKE_PORT, false, 1024)
        .is_ok());
}
