//! Source and sink content pipelines.
//!
//! The source pipeline packetizes a plaintext stream into PCPs; the sink
//! pipeline reassembles PCPs from an arbitrary byte stream and decrypts
//! them. Both are per-session state machines with no I/O; the manager calls
//! them under the session lock.
//!
//! Source policy:
//! - an input buffer larger than `max_packet_size` is rejected, not split;
//! - plaintext accumulates until `min_packet_size` bytes are buffered, so
//!   the post-emission remainder is always below the minimum;
//! - an EMI change flushes the accumulator under the old EMI before any new
//!   data is buffered, so one PCP never mixes copy-control modes;
//! - end-of-stream flushes a final, possibly empty, PCP.
//!
//! Sink policy:
//! - PCP boundaries need not align with input buffers; headers and payloads
//!   are reassembled across calls;
//! - a failed call restores the reassembly state it started with, so the
//!   caller can retry the same buffer after key renewal.

use crate::packet::Packet;
use crate::pcp::{PcpHeader, PCP_HEADER_LEN};
use crate::{Emi, Error, Result};
use dtcp_crypto::aead::{aes256gcm_decrypt, aes256gcm_encrypt, construct_nonce};
use dtcp_crypto::kdf::derive_content_key;
use dtcp_crypto::ExchangeKey;

/// Packetizes and encrypts an outgoing content stream.
pub struct SourcePipeline {
    exchange_key: ExchangeKey,
    key_label: u8,
    min_packet_size: usize,
    max_packet_size: usize,
    accumulator: Vec<u8>,
    current_emi: Option<Emi>,
    next_nonce: u64,
}

impl SourcePipeline {
    /// Create a source pipeline.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParam` if `min_packet_size > max_packet_size`, the
    /// maximum is zero, or the maximum does not fit the wire length field.
    pub fn new(
        exchange_key: ExchangeKey,
        key_label: u8,
        min_packet_size: usize,
        max_packet_size: usize,
    ) -> Result<Self> {
        if max_packet_size == 0 {
            return Err(Error::InvalidParam("max_packet_size must be nonzero".into()));
        }
        if min_packet_size > max_packet_size {
            return Err(Error::InvalidParam(format!(
                "min_packet_size {} exceeds max_packet_size {}",
                min_packet_size, max_packet_size
            )));
        }
        if max_packet_size > u32::MAX as usize {
            return Err(Error::InvalidParam(
                "max_packet_size exceeds the PCP length field".into(),
            ));
        }

        Ok(Self {
            exchange_key,
            key_label,
            min_packet_size,
            max_packet_size,
            accumulator: Vec::new(),
            current_emi: None,
            next_nonce: 0,
        })
    }

    /// Replace the exchange key after a renewal.
    pub fn set_exchange_key(&mut self, exchange_key: ExchangeKey, key_label: u8) {
        self.exchange_key = exchange_key;
        self.key_label = key_label;
    }

    /// Process one plaintext buffer.
    ///
    /// On success `packet.data_out` holds complete wire bytes (zero or more
    /// PCPs, headers inline), `packet.pcp_header` a copy of the first
    /// emitted header and `packet.pcp_header_offset` its byte offset within
    /// the output.
    pub fn process(&mut self, packet: &mut Packet, data_in: &[u8]) -> Result<()> {
        let emi = packet
            .emi()
            .ok_or_else(|| Error::InvalidParam("Source packet requires an EMI".into()))?;

        if data_in.len() > self.max_packet_size {
            return Err(Error::InvalidParam(format!(
                "Input buffer of {} bytes exceeds max_packet_size {}",
                data_in.len(),
                self.max_packet_size
            )));
        }

        let mut out = Vec::new();
        let mut first_header: Option<([u8; PCP_HEADER_LEN], usize)> = None;

        // A mode change flushes buffered plaintext under the old mode.
        if let Some(old_emi) = self.current_emi {
            if old_emi != emi && !self.accumulator.is_empty() {
                let chunk = std::mem::take(&mut self.accumulator);
                self.emit(&mut out, &mut first_header, old_emi, &chunk)?;
            }
        }
        self.current_emi = Some(emi);
        self.accumulator.extend_from_slice(data_in);

        if self.min_packet_size == 0 && self.accumulator.is_empty() && !packet.is_eof() {
            // With no minimum, even an empty buffer becomes a PCP.
            self.emit(&mut out, &mut first_header, emi, &[])?;
        }

        while !self.accumulator.is_empty() && self.accumulator.len() >= self.min_packet_size {
            let take = self.accumulator.len().min(self.max_packet_size);
            let chunk: Vec<u8> = self.accumulator.drain(..take).collect();
            self.emit(&mut out, &mut first_header, emi, &chunk)?;
        }

        if packet.is_eof() {
            let chunk = std::mem::take(&mut self.accumulator);
            self.emit(&mut out, &mut first_header, emi, &chunk)?;
        }

        packet.data_out = Some(out);
        if let Some((header, offset)) = first_header {
            packet.pcp_header = Some(header);
            packet.pcp_header_offset = Some(offset);
        }
        Ok(())
    }

    /// Bytes currently buffered below the emission threshold.
    pub fn pending(&self) -> usize {
        self.accumulator.len()
    }

    fn emit(
        &mut self,
        out: &mut Vec<u8>,
        first_header: &mut Option<([u8; PCP_HEADER_LEN], usize)>,
        emi: Emi,
        plaintext: &[u8],
    ) -> Result<()> {
        let header = PcpHeader {
            emi,
            key_label: self.key_label,
            nonce: self.next_nonce,
            content_length: plaintext.len() as u32,
        };
        let header_bytes = header.serialize();

        let content_key = derive_content_key(&self.exchange_key, emi.to_u8(), header.nonce)
            .map_err(|e| Error::ContentKey(e.to_string()))?;
        let ciphertext = aes256gcm_encrypt(
            &content_key,
            &construct_nonce(header.nonce),
            plaintext,
            &header_bytes,
        )
        .map_err(|e| Error::ContentKey(e.to_string()))?;

        if first_header.is_none() {
            *first_header = Some((header_bytes, out.len()));
        }
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&ciphertext);
        self.next_nonce += 1;
        Ok(())
    }
}

/// Reassembles and decrypts an incoming PCP stream.
pub struct SinkPipeline {
    exchange_key: ExchangeKey,
    key_label: u8,
    /// Maximum accepted content length; 0 disables the check.
    max_packet_size: usize,
    /// Header bytes collected so far, below [`PCP_HEADER_LEN`].
    pending_header: Vec<u8>,
    /// Parsed header and partial payload of the PCP in flight.
    current: Option<(PcpHeader, Vec<u8>)>,
}

impl SinkPipeline {
    /// Create a sink pipeline.
    pub fn new(exchange_key: ExchangeKey, key_label: u8, max_packet_size: usize) -> Self {
        Self {
            exchange_key,
            key_label,
            max_packet_size,
            pending_header: Vec::new(),
            current: None,
        }
    }

    /// Replace the exchange key after a renewal.
    pub fn set_exchange_key(&mut self, exchange_key: ExchangeKey, key_label: u8) {
        self.exchange_key = exchange_key;
        self.key_label = key_label;
    }

    /// Process one buffer of received wire bytes.
    ///
    /// On success `packet.data_out` holds the plaintext of every PCP
    /// completed by this buffer (possibly empty if a PCP is still partial),
    /// `packet.emi` the mode of the first completed PCP and
    /// `packet.pcp_header` a copy of its header.
    ///
    /// On error the reassembly state is rolled back to where this call
    /// started, so the same buffer can be retried after key renewal.
    pub fn process(&mut self, packet: &mut Packet, data_in: &[u8]) -> Result<()> {
        let snapshot = (self.pending_header.clone(), self.current.clone());

        match self.process_inner(packet, data_in) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.pending_header = snapshot.0;
                self.current = snapshot.1;
                Err(e)
            }
        }
    }

    fn process_inner(&mut self, packet: &mut Packet, data_in: &[u8]) -> Result<()> {
        let mut input = data_in;
        let mut out = Vec::new();
        let mut first: Option<(Emi, [u8; PCP_HEADER_LEN])> = None;

        while !input.is_empty() {
            match &mut self.current {
                None => {
                    let needed = PCP_HEADER_LEN - self.pending_header.len();
                    let take = needed.min(input.len());
                    self.pending_header.extend_from_slice(&input[..take]);
                    input = &input[take..];

                    if self.pending_header.len() < PCP_HEADER_LEN {
                        break;
                    }

                    let header = PcpHeader::parse(&self.pending_header)?;
                    if self.max_packet_size > 0
                        && header.content_length as usize > self.max_packet_size
                    {
                        return Err(Error::InvalidParam(format!(
                            "PCP content length {} exceeds max_packet_size {}",
                            header.content_length, self.max_packet_size
                        )));
                    }

                    self.pending_header.clear();
                    self.current = Some((header, Vec::with_capacity(header.payload_len())));
                }
                Some((header, payload)) => {
                    let needed = header.payload_len() - payload.len();
                    let take = needed.min(input.len());
                    payload.extend_from_slice(&input[..take]);
                    input = &input[take..];

                    if payload.len() < header.payload_len() {
                        break;
                    }

                    // Complete PCP: decrypt and append.
                    let (header, payload) = match self.current.take() {
                        Some(pcp) => pcp,
                        None => return Err(Error::InvalidState),
                    };
                    let plaintext = self.decrypt(&header, &payload)?;
                    if first.is_none() {
                        first = Some((header.emi, header.serialize()));
                    }
                    out.extend_from_slice(&plaintext);
                }
            }
        }

        packet.data_out = Some(out);
        if let Some((emi, header_bytes)) = first {
            packet.emi = Some(emi);
            packet.pcp_header = Some(header_bytes);
        }
        Ok(())
    }

    fn decrypt(&self, header: &PcpHeader, payload: &[u8]) -> Result<Vec<u8>> {
        if header.key_label != self.key_label {
            return Err(Error::ContentKey(format!(
                "PCP key label {} does not match session key label {}",
                header.key_label, self.key_label
            )));
        }

        let content_key = derive_content_key(&self.exchange_key, header.emi.to_u8(), header.nonce)
            .map_err(|e| Error::ContentKey(e.to_string()))?;

        let plaintext = aes256gcm_decrypt(
            &content_key,
            &construct_nonce(header.nonce),
            payload,
            &header.serialize(),
        )
        .map_err(|_| Error::ContentKey("PCP authentication failed".into()))?;

        Ok(plaintext.to_vec())
    }
}
