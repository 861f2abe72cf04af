//! Per-session state and the retained renewal link.

use dtcp_core::ake::{
    unwrap_exchange_key, AkeFrame, STATUS_KEY_REQUEST, STATUS_OK,
};
use dtcp_core::{DeviceType, Error, Result, SinkPipeline, SourcePipeline};
use dtcp_crypto::kdf::key_confirmation_digest;
use dtcp_crypto::ExchangeKey;
use dtcp_transport::AkeChannel;
use std::net::SocketAddr;
use zeroize::Zeroizing;

/// Role-specific packet pipeline of a session.
pub enum Pipeline {
    /// Outgoing content: packetize and encrypt.
    Source(SourcePipeline),
    /// Incoming content: reassemble and decrypt.
    Sink(SinkPipeline),
}

/// The authenticated control connection retained after the handshake.
///
/// Sink sessions keep their link here and pull key renewals over it; the
/// source side of the same connection lives in a serve thread (see
/// `driver::serve_renewals`).
pub struct AkeLink {
    /// The framed control connection.
    pub channel: Box<dyn AkeChannel>,
    /// Authentication key protecting renewal deliveries.
    pub auth_key: Zeroizing<[u8; 32]>,
    /// Initiator nonce of the original handshake.
    pub initiator_random: [u8; 32],
    /// Responder nonce of the original handshake.
    pub responder_random: [u8; 32],
    /// Wrap epoch of the last accepted key delivery.
    pub wrap_epoch: u32,
}

impl AkeLink {
    /// Request a fresh exchange key delivery from the source.
    ///
    /// Sends `Status(KEY_REQUEST)`, unwraps the returned key, proves
    /// recovery with a confirmation digest and waits for the source's
    /// acknowledgement. The epoch must move forward so a recorded earlier
    /// delivery cannot be replayed.
    pub fn request_key_renewal(&mut self) -> Result<(u8, ExchangeKey)> {
        self.channel.send(&AkeFrame::Status {
            code: STATUS_KEY_REQUEST,
        }
        .serialize())?;

        let frame = AkeFrame::parse(&self.channel.recv()?)?;
        let AkeFrame::KeyExchange {
            key_label,
            epoch,
            wrapped_key,
        } = frame
        else {
            return Err(Error::Ake("Expected KeyExchange in renewal".into()));
        };

        if epoch <= self.wrap_epoch {
            return Err(Error::Ake(format!(
                "Renewal epoch {} does not advance past {}",
                epoch, self.wrap_epoch
            )));
        }

        let exchange_key = unwrap_exchange_key(&self.auth_key, key_label, epoch, &wrapped_key)?;

        let digest = key_confirmation_digest(
            &exchange_key,
            &self.initiator_random,
            &self.responder_random,
        )?;
        self.channel
            .send(&AkeFrame::KeyConfirm { digest }.serialize())?;

        let reply = AkeFrame::parse(&self.channel.recv()?)?;
        if !matches!(reply, AkeFrame::Status { code: STATUS_OK }) {
            return Err(Error::Ake("Source rejected renewal confirmation".into()));
        }

        self.wrap_epoch = epoch;
        Ok((key_label, exchange_key))
    }

    /// Close the underlying connection.
    pub fn close(&mut self) {
        self.channel.close();
    }
}

/// One live session owned by the table.
pub struct SessionEntry {
    /// Local role of this session.
    pub device_type: DeviceType,
    /// Address of the peer's AKE endpoint.
    pub remote_addr: SocketAddr,
    /// Exchange key label in use.
    pub key_label: u8,
    /// Whether a per-session exchange key was negotiated.
    pub unique_key: bool,
    /// Minimum PCP payload size (source role).
    pub min_packet_size: usize,
    /// Maximum PCP payload size.
    pub max_packet_size: usize,
    /// Set when key renewal failed; the session stays visible until the
    /// caller deletes it.
    pub degraded: bool,
    /// Role-specific packet pipeline.
    pub pipeline: Pipeline,
    /// Retained control link (sink sessions only).
    pub link: Option<AkeLink>,
}

impl SessionEntry {
    /// Read-only snapshot for `session_info`.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            device_type: self.device_type,
            remote_addr: self.remote_addr,
            key_label: self.key_label,
            unique_key: self.unique_key,
            min_packet_size: self.min_packet_size,
            max_packet_size: self.max_packet_size,
            degraded: self.degraded,
        }
    }
}

/// Read-only session snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    /// Local role of the session.
    pub device_type: DeviceType,
    /// Address of the peer's AKE endpoint.
    pub remote_addr: SocketAddr,
    /// Exchange key label in use.
    pub key_label: u8,
    /// Whether a per-session exchange key was negotiated.
    pub unique_key: bool,
    /// Minimum PCP payload size (source role).
    pub min_packet_size: usize,
    /// Maximum PCP payload size.
    pub max_packet_size: usize,
    /// Whether key renewal has failed for this session.
    pub degraded: bool,
}
