//! PCP (Protected Content Packet) header parsing and serialization.
//!
//! Each PCP carries one encrypted content chunk:
//!
//! ```text
//! offset  size  field
//! 0       1     version (currently 0x01)
//! 1       1     EMI copy-control byte
//! 2       1     exchange key label
//! 3       1     reserved (0x00)
//! 4       8     nonce (little-endian packet counter)
//! 12      4     content_length (little-endian, plaintext bytes)
//! 16      -     ciphertext (content_length + 16 bytes including GCM tag)
//! ```
//!
//! The header travels in the clear and is fed to the AEAD as associated
//! data, so any modification in transit fails authentication at the sink.

use crate::{Emi, Error, Result};

/// Serialized PCP header length in bytes.
pub const PCP_HEADER_LEN: usize = 16;

/// PCP protocol version.
pub const PCP_VERSION: u8 = 0x01;

/// Length of the GCM authentication tag appended to each PCP payload.
pub const PCP_TAG_LEN: usize = 16;

/// A parsed PCP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcpHeader {
    /// Copy-control mode of the protected content.
    pub emi: Emi,
    /// Exchange key label the content key was derived from.
    pub key_label: u8,
    /// Packet counter, unique per session and key label.
    pub nonce: u64,
    /// Plaintext content length in bytes.
    pub content_length: u32,
}

impl PcpHeader {
    /// Parse a header from the first [`PCP_HEADER_LEN`] bytes of `data`.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientData` if fewer than 16 bytes are available, and
    /// `InvalidFrame` for an unknown version, EMI, or nonzero reserved byte.
    pub fn parse(data: &[u8]) -> Result<Self> {
        check_len(data, PCP_HEADER_LEN)?;

        if data[0] != PCP_VERSION {
            return Err(Error::InvalidFrame(format!(
                "Unsupported PCP version {:#04x}",
                data[0]
            )));
        }

        let emi = Emi::from_u8(data[1])
            .map_err(|_| Error::InvalidFrame(format!("Unknown EMI value {:#04x}", data[1])))?;
        let key_label = data[2];

        if data[3] != 0 {
            return Err(Error::InvalidFrame("Reserved header byte not zero".into()));
        }

        let nonce = read_u64_le(&data[4..12]);
        let content_length = read_u32_le(&data[12..16]);

        Ok(Self {
            emi,
            key_label,
            nonce,
            content_length,
        })
    }

    /// Serialize to the 16-byte wire form.
    pub fn serialize(&self) -> [u8; PCP_HEADER_LEN] {
        let mut buf = [0u8; PCP_HEADER_LEN];
        buf[0] = PCP_VERSION;
        buf[1] = self.emi.to_u8();
        buf[2] = self.key_label;
        // buf[3] reserved, already zero
        buf[4..12].copy_from_slice(&self.nonce.to_le_bytes());
        buf[12..16].copy_from_slice(&self.content_length.to_le_bytes());
        buf
    }

    /// Number of ciphertext bytes that follow this header on the wire.
    pub fn payload_len(&self) -> usize {
        self.content_length as usize + PCP_TAG_LEN
    }
}

pub(crate) fn check_len(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        Err(Error::InsufficientData(needed))
    } else {
        Ok(())
    }
}

#[inline]
pub(crate) fn read_u32_le(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

#[inline]
pub(crate) fn read_u64_le(data: &[u8]) -> u64 {
    u64::from_le_bytes([
        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> PcpHeader {
        PcpHeader {
            emi: Emi::CopyOneGeneration,
            key_label: 3,
            nonce: 0x0102030405060708,
            content_length: 4096,
        }
    }

    #[test]
    fn test_serialize_layout() {
        let bytes = sample_header().serialize();

        assert_eq!(bytes[0], PCP_VERSION);
        assert_eq!(bytes[1], 0x0A);
        assert_eq!(bytes[2], 3);
        assert_eq!(bytes[3], 0);
        assert_eq!(&bytes[4..12], &0x0102030405060708u64.to_le_bytes());
        assert_eq!(&bytes[12..16], &4096u32.to_le_bytes());
    }

    #[test]
    fn test_fixed_wire_vector() {
        let bytes = hex::decode("010a0300080706050403020100100000").unwrap();
        let parsed = PcpHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, sample_header());
        assert_eq!(parsed.serialize().as_slice(), &bytes[..]);
    }

    #[test]
    fn test_parse_roundtrip() {
        let header = sample_header();
        let parsed = PcpHeader::parse(&header.serialize()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_reject_short_buffer() {
        let bytes = sample_header().serialize();
        assert!(matches!(
            PcpHeader::parse(&bytes[..15]),
            Err(Error::InsufficientData(_))
        ));
    }

    #[test]
    fn test_reject_unknown_version() {
        let mut bytes = sample_header().serialize();
        bytes[0] = 0x02;
        assert!(PcpHeader::parse(&bytes).is_err());
    }

    #[test]
    fn test_reject_bad_emi() {
        let mut bytes = sample_header().serialize();
        bytes[1] = 0x0B;
        assert!(PcpHeader::parse(&bytes).is_err());
    }

    #[test]
    fn test_reject_nonzero_reserved() {
        let mut bytes = sample_header().serialize();
        bytes[3] = 0x01;
        assert!(PcpHeader::parse(&bytes).is_err());
    }

    #[test]
    fn test_payload_len_includes_tag() {
        assert_eq!(sample_header().payload_len(), 4096 + PCP_TAG_LEN);

        let empty = PcpHeader {
            content_length: 0,
            ..sample_header()
        };
        assert_eq!(empty.payload_len(), PCP_TAG_LEN);
    }
}
