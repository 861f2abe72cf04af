//! Blocking drivers that pump the sans-IO AKE machine over a channel.

use crate::session::{Pipeline, SessionEntry};
use dtcp_core::ake::{
    wrap_exchange_key, AkeFrame, AkeMachine, AkeOutcome, STATUS_AUTH_FAILED, STATUS_CERT_INVALID,
    STATUS_KEY_REQUEST, STATUS_OK, STATUS_PROTOCOL_ERROR,
};
use dtcp_core::{DeviceType, Error, Result};
use dtcp_crypto::kdf::key_confirmation_digest;
use dtcp_crypto::DeviceKeyStore;
use dtcp_transport::AkeChannel;
use std::sync::{Arc, Mutex, Weak};
use zeroize::Zeroizing;

/// Drive an initiating handshake to completion.
pub fn run_initiator(
    mut machine: AkeMachine,
    channel: &mut dyn AkeChannel,
) -> Result<AkeOutcome> {
    let first = machine.start()?;
    channel
        .send(&first.serialize())
        .map_err(Error::from)?;
    pump(&mut machine, channel, None)
}

/// Drive a responding handshake to completion.
///
/// The responder takes the role opposite to the one the initiator
/// advertises in its opening CertExchange, so one listener serves both
/// inbound sink connections (we become the source) and inbound source
/// connections (we become the sink).
///
/// Returns the outcome and the local role that was assumed.
pub fn run_responder(
    store: Arc<dyn DeviceKeyStore>,
    channel: &mut dyn AkeChannel,
) -> Result<(AkeOutcome, DeviceType)> {
    let bytes = channel.recv().map_err(Error::from)?;
    let frame = AkeFrame::parse(&bytes)?;

    let peer_type = match &frame {
        AkeFrame::CertExchange { device_type, .. } => *device_type,
        _ => {
            let _ = channel.send(
                &AkeFrame::Status {
                    code: STATUS_PROTOCOL_ERROR,
                }
                .serialize(),
            );
            return Err(Error::Ake("Handshake must open with CertExchange".into()));
        }
    };

    let local_type = match peer_type {
        DeviceType::Source => DeviceType::Sink,
        DeviceType::Sink => DeviceType::Source,
        DeviceType::Unknown => {
            let _ = channel.send(
                &AkeFrame::Status {
                    code: STATUS_PROTOCOL_ERROR,
                }
                .serialize(),
            );
            return Err(Error::Ake("Peer did not declare a device role".into()));
        }
    };

    let mut machine = AkeMachine::new_responder(store, local_type, false);
    let outcome = pump(&mut machine, channel, Some(frame))?;
    Ok((outcome, local_type))
}

fn pump(
    machine: &mut AkeMachine,
    channel: &mut dyn AkeChannel,
    mut pending: Option<AkeFrame>,
) -> Result<AkeOutcome> {
    loop {
        let frame = match pending.take() {
            Some(frame) => frame,
            None => AkeFrame::parse(&channel.recv().map_err(Error::from)?)?,
        };

        let step = match machine.handle(frame) {
            Ok(step) => step,
            Err(e) => {
                // Best effort: tell the peer why before giving up.
                let _ = channel.send(
                    &AkeFrame::Status {
                        code: status_for(&e),
                    }
                    .serialize(),
                );
                return Err(e);
            }
        };

        for reply in &step.replies {
            channel.send(&reply.serialize()).map_err(Error::from)?;
        }
        if let Some(outcome) = step.outcome {
            return Ok(outcome);
        }
    }
}

fn status_for(e: &Error) -> u8 {
    match e {
        Error::InvalidCertificate(_) | Error::Crypto(dtcp_crypto::Error::Certificate(_)) => {
            STATUS_CERT_INVALID
        }
        Error::InvalidFrame(_) | Error::InsufficientData(_) | Error::InvalidState => {
            STATUS_PROTOCOL_ERROR
        }
        _ => STATUS_AUTH_FAILED,
    }
}

/// Serve key renewal requests on a source session's retained link.
///
/// Runs until the sink disconnects, violates the protocol, or the serving
/// session is deleted (`entry` is held weakly so deletion ends service).
/// Each `Status(KEY_REQUEST)` answers with the key currently stored under
/// the session's label, re-keys the serving session's source pipeline to
/// match, and wraps the key under the next epoch; the sink must prove
/// recovery before the delivery is acknowledged. Subsequent buffers on
/// both ends are then protected under the delivered key.
#[allow(clippy::too_many_arguments)]
pub fn serve_renewals(
    mut channel: Box<dyn AkeChannel>,
    store: Arc<dyn DeviceKeyStore>,
    entry: Weak<Mutex<SessionEntry>>,
    auth_key: Zeroizing<[u8; 32]>,
    initiator_random: [u8; 32],
    responder_random: [u8; 32],
    key_label: u8,
    mut epoch: u32,
) {
    loop {
        let bytes = match channel.recv() {
            Ok(bytes) => bytes,
            Err(_) => break,
        };

        match AkeFrame::parse(&bytes) {
            Ok(AkeFrame::Status {
                code: STATUS_KEY_REQUEST,
            }) => {
                if serve_one_renewal(
                    channel.as_mut(),
                    store.as_ref(),
                    &entry,
                    &auth_key,
                    &initiator_random,
                    &responder_random,
                    key_label,
                    &mut epoch,
                )
                .is_err()
                {
                    let _ = channel.send(
                        &AkeFrame::Status {
                            code: STATUS_AUTH_FAILED,
                        }
                        .serialize(),
                    );
                    break;
                }
            }
            _ => {
                let _ = channel.send(
                    &AkeFrame::Status {
                        code: STATUS_PROTOCOL_ERROR,
                    }
                    .serialize(),
                );
                break;
            }
        }
    }

    tracing::debug!(key_label, "renewal link closed");
}

#[allow(clippy::too_many_arguments)]
fn serve_one_renewal(
    channel: &mut dyn AkeChannel,
    store: &dyn DeviceKeyStore,
    entry: &Weak<Mutex<SessionEntry>>,
    auth_key: &Zeroizing<[u8; 32]>,
    initiator_random: &[u8; 32],
    responder_random: &[u8; 32],
    key_label: u8,
    epoch: &mut u32,
) -> Result<()> {
    // A deleted session stops handing out keys.
    let entry = entry.upgrade().ok_or(Error::NotInitialized)?;
    let exchange_key = store.exchange_key(key_label)?;

    // Re-key the live source pipeline before delivering, so the buffers
    // that follow this renewal are protected under the key the sink is
    // about to install.
    {
        let mut guard = match entry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Pipeline::Source(pipeline) = &mut guard.pipeline {
            pipeline.set_exchange_key(exchange_key.clone(), key_label);
        }
    }

    *epoch += 1;
    let wrapped_key = wrap_exchange_key(auth_key, key_label, *epoch, &exchange_key)?;
    channel
        .send(
            &AkeFrame::KeyExchange {
                key_label,
                epoch: *epoch,
                wrapped_key,
            }
            .serialize(),
        )
        .map_err(Error::from)?;

    let reply = AkeFrame::parse(&channel.recv().map_err(Error::from)?)?;
    let AkeFrame::KeyConfirm { digest } = reply else {
        return Err(Error::Ake("Expected KeyConfirm in renewal".into()));
    };

    let expected = key_confirmation_digest(&exchange_key, initiator_random, responder_random)?;
    if digest != expected {
        return Err(Error::Ake("Renewal confirmation digest mismatch".into()));
    }

    channel
        .send(&AkeFrame::Status { code: STATUS_OK }.serialize())
        .map_err(Error::from)?;
    tracing::debug!(key_label, epoch = *epoch, "served key renewal");
    Ok(())
}
