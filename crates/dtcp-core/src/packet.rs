//! Packet descriptors handed across the manager API.

use crate::pcp::PCP_HEADER_LEN;
use crate::Emi;

/// A per-call packet descriptor.
///
/// The caller owns the input buffer and passes it as a plain slice; the
/// pipeline owns the output buffer and header copy stored here, which live
/// until [`Packet::release`]. One descriptor describes one `process_packet`
/// call; reusing a descriptor without releasing it first drops the previous
/// output.
#[derive(Debug, Default)]
pub struct Packet {
    /// Copy-control mode. Set by the caller for source sessions; reported
    /// by the pipeline for sink sessions.
    pub(crate) emi: Option<Emi>,
    /// Marks the final buffer of the stream (source role flushes).
    pub(crate) is_eof: bool,
    /// Pipeline-owned output: wire bytes (source) or plaintext (sink).
    pub(crate) data_out: Option<Vec<u8>>,
    /// Copy of the first PCP header emitted or consumed by the call.
    pub(crate) pcp_header: Option<[u8; PCP_HEADER_LEN]>,
    /// Byte offset of that header within `data_out` (source role only).
    pub(crate) pcp_header_offset: Option<usize>,
}

impl Packet {
    /// Create a descriptor for a source-session call.
    pub fn for_source(emi: Emi) -> Self {
        Self {
            emi: Some(emi),
            ..Self::default()
        }
    }

    /// Create a descriptor for a sink-session call.
    pub fn for_sink() -> Self {
        Self::default()
    }

    /// Mark this as the final buffer of the stream.
    pub fn set_eof(&mut self) {
        self.is_eof = true;
    }

    /// The copy-control mode, once known.
    pub fn emi(&self) -> Option<Emi> {
        self.emi
    }

    /// Whether this descriptor was flagged end-of-stream.
    pub fn is_eof(&self) -> bool {
        self.is_eof
    }

    /// The pipeline-owned output buffer, if the call produced one.
    pub fn data_out(&self) -> Option<&[u8]> {
        self.data_out.as_deref()
    }

    /// The first PCP header emitted or consumed by the call.
    pub fn pcp_header(&self) -> Option<&[u8; PCP_HEADER_LEN]> {
        self.pcp_header.as_ref()
    }

    /// Offset of that header within the output buffer (source role).
    pub fn pcp_header_offset(&self) -> Option<usize> {
        self.pcp_header_offset
    }

    /// Free the pipeline-owned buffers.
    ///
    /// Idempotent: releasing twice, or releasing a descriptor that was
    /// never processed, is a no-op.
    pub fn release(&mut self) {
        self.data_out = None;
        self.pcp_header = None;
        self.pcp_header_offset = None;
    }
}
