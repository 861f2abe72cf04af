//! Device certificates and signature verification.
//!
//! A device certificate binds a device identifier and capability set to a
//! P-256 public key, signed by the trust anchor. The layout is fixed-size so
//! certificates can travel inside AKE messages without a length prefix:
//!
//! ```text
//! offset  size  field
//! 0       1     format
//! 1       1     generation (SRM generation the device understands)
//! 2       1     capability flags
//! 3       5     device_id
//! 8       65    public key (uncompressed SEC 1)
//! 73      64    trust anchor signature over bytes 0..73
//! ```

use crate::{Error, Result};
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};

/// Total serialized certificate length in bytes.
pub const CERTIFICATE_LEN: usize = 137;

/// Length of the signed portion (everything before the signature).
pub const SIGNED_PORTION_LEN: usize = 73;

/// Baseline certificate format.
pub const FORMAT_BASELINE: u8 = 0x01;

/// Capability flag: device supports per-session exchange keys.
///
/// Devices advertising this flag negotiate a dedicated exchange key per
/// session instead of sharing the label-0 key across all peers.
pub const CAP_SESSION_EXCHANGE_KEY: u8 = 0x01;

/// A parsed device certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCertificate {
    /// Certificate format identifier.
    pub format: u8,
    /// Highest SRM generation the device understands.
    pub generation: u8,
    /// Capability flags.
    pub capabilities: u8,
    /// 40-bit device identifier assigned at issuance.
    pub device_id: [u8; 5],
    /// Device ECDSA public key, uncompressed SEC 1 form.
    pub public_key: [u8; 65],
    /// Trust anchor signature over the signed portion.
    pub signature: [u8; 64],
}

impl DeviceCertificate {
    /// Parse a certificate from its fixed-size wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is not exactly [`CERTIFICATE_LEN`]
    /// bytes or the embedded public key is not in uncompressed form.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != CERTIFICATE_LEN {
            return Err(Error::InvalidLength {
                expected: CERTIFICATE_LEN,
                actual: data.len(),
            });
        }

        let format = data[0];
        let generation = data[1];
        let capabilities = data[2];

        let mut device_id = [0u8; 5];
        device_id.copy_from_slice(&data[3..8]);

        let mut public_key = [0u8; 65];
        public_key.copy_from_slice(&data[8..73]);

        if public_key[0] != 0x04 {
            return Err(Error::Certificate(
                "Certificate public key must use uncompressed format".into(),
            ));
        }

        let mut signature = [0u8; 64];
        signature.copy_from_slice(&data[73..137]);

        Ok(Self {
            format,
            generation,
            capabilities,
            device_id,
            public_key,
            signature,
        })
    }

    /// Serialize to the fixed-size wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CERTIFICATE_LEN);
        out.push(self.format);
        out.push(self.generation);
        out.push(self.capabilities);
        out.extend_from_slice(&self.device_id);
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.signature);
        out
    }

    /// The bytes covered by the trust anchor signature.
    pub fn signed_portion(&self) -> [u8; SIGNED_PORTION_LEN] {
        let mut portion = [0u8; SIGNED_PORTION_LEN];
        portion[0] = self.format;
        portion[1] = self.generation;
        portion[2] = self.capabilities;
        portion[3..8].copy_from_slice(&self.device_id);
        portion[8..73].copy_from_slice(&self.public_key);
        portion
    }

    /// The device's ECDSA verifying key.
    ///
    /// # Errors
    ///
    /// Returns an error if the embedded public key is not a valid curve
    /// point.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_sec1_bytes(&self.public_key)
            .map_err(|_| Error::Certificate("Invalid certificate public key".into()))
    }

    /// Whether this device advertises the session exchange key capability.
    pub fn supports_session_exchange_key(&self) -> bool {
        self.capabilities & CAP_SESSION_EXCHANGE_KEY != 0
    }

    /// Verify this certificate's signature against a trust anchor key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Certificate` if the signature does not verify.
    pub fn verify(&self, anchor_key: &VerifyingKey) -> Result<()> {
        let signature = Signature::try_from(&self.signature[..])
            .map_err(|_| Error::Certificate("Malformed certificate signature".into()))?;

        anchor_key
            .verify(&self.signed_portion(), &signature)
            .map_err(|_| Error::Certificate("Certificate signature verification failed".into()))
    }

    /// Verify a signature made with this certificate's device key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Signature` if the signature does not verify.
    pub fn verify_device_signature(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let signature = Signature::try_from(signature)
            .map_err(|_| Error::Signature("Malformed device signature".into()))?;

        self.verifying_key()?
            .verify(message, &signature)
            .map_err(|_| Error::Signature("Device signature verification failed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::TrustAnchor;

    #[test]
    fn test_parse_serialize_roundtrip() {
        let anchor = TrustAnchor::generate().unwrap();
        let (cert, _) = anchor
            .issue([1, 2, 3, 4, 5], CAP_SESSION_EXCHANGE_KEY)
            .unwrap();

        let bytes = cert.serialize();
        assert_eq!(bytes.len(), CERTIFICATE_LEN);

        let parsed = DeviceCertificate::parse(&bytes).unwrap();
        assert_eq!(parsed, cert);
    }

    #[test]
    fn test_reject_wrong_length() {
        let result = DeviceCertificate::parse(&[0u8; CERTIFICATE_LEN - 1]);
        assert!(result.is_err());
    }

    #[test]
    fn test_reject_compressed_public_key() {
        let anchor = TrustAnchor::generate().unwrap();
        let (cert, _) = anchor.issue([0; 5], 0).unwrap();

        let mut bytes = cert.serialize();
        bytes[8] = 0x02;

        assert!(DeviceCertificate::parse(&bytes).is_err());
    }

    #[test]
    fn test_verify_against_issuing_anchor() {
        let anchor = TrustAnchor::generate().unwrap();
        let (cert, _) = anchor.issue([9, 8, 7, 6, 5], 0).unwrap();

        assert!(cert.verify(&anchor.verifying_key()).is_ok());
    }

    #[test]
    fn test_verify_rejects_foreign_anchor() {
        let anchor = TrustAnchor::generate().unwrap();
        let other = TrustAnchor::generate().unwrap();
        let (cert, _) = anchor.issue([9, 8, 7, 6, 5], 0).unwrap();

        assert!(cert.verify(&other.verifying_key()).is_err());
    }

    #[test]
    fn test_verify_rejects_tampered_capabilities() {
        let anchor = TrustAnchor::generate().unwrap();
        let (mut cert, _) = anchor.issue([1, 1, 1, 1, 1], 0).unwrap();

        cert.capabilities |= CAP_SESSION_EXCHANGE_KEY;

        assert!(cert.verify(&anchor.verifying_key()).is_err());
    }

    #[test]
    fn test_capability_flag() {
        let anchor = TrustAnchor::generate().unwrap();

        let (plain, _) = anchor.issue([0; 5], 0).unwrap();
        assert!(!plain.supports_session_exchange_key());

        let (session, _) = anchor.issue([0; 5], CAP_SESSION_EXCHANGE_KEY).unwrap();
        assert!(session.supports_session_exchange_key());
    }
}
