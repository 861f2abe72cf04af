//! Ephemeral ECDH-P256 key agreement for the AKE challenge phase.
//!
//! During full authentication each peer generates an ephemeral P-256 keypair,
//! signs it with its device certificate key, and both sides agree on a shared
//! secret from which the authentication key is derived (see
//! [`crate::kdf::derive_auth_key`]).
//!
//! Public keys travel in uncompressed SEC 1 form (0x04 || x || y, 65 bytes).
//! Private scalars and shared secrets are zeroed on drop.

use crate::{Error, Result};
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, PublicKey, SecretKey};
use zeroize::Zeroizing;

/// Length of an uncompressed P-256 public key in bytes.
pub const P256_PUBLIC_KEY_LEN: usize = 65;

/// Ephemeral P-256 keypair used once per handshake attempt.
pub struct EcdhP256KeyPair {
    /// Secret scalar, zeroed on drop.
    secret_key: SecretKey,
    /// Cached uncompressed public key (0x04 || x || y).
    public_key_bytes: Vec<u8>,
}

impl EcdhP256KeyPair {
    /// Generate a new random P-256 keypair using the OS RNG.
    pub fn generate() -> Result<Self> {
        let secret_key = SecretKey::random(&mut rand::rngs::OsRng);
        let public_key = secret_key.public_key();
        let public_key_bytes = public_key.to_encoded_point(false).as_bytes().to_vec();

        Ok(Self {
            secret_key,
            public_key_bytes,
        })
    }

    /// Build a keypair from an existing 32-byte private scalar.
    ///
    /// Used by tests that need deterministic handshake transcripts.
    ///
    /// # Errors
    ///
    /// Returns an error if the scalar is not a valid P-256 private key.
    pub fn from_private(private_key: &[u8]) -> Result<Self> {
        if private_key.len() != 32 {
            return Err(Error::InvalidLength {
                expected: 32,
                actual: private_key.len(),
            });
        }

        let secret_key = SecretKey::from_be_bytes(private_key)
            .map_err(|_| Error::InvalidPrivateKey("Invalid P-256 private key".into()))?;
        let public_key = secret_key.public_key();
        let public_key_bytes = public_key.to_encoded_point(false).as_bytes().to_vec();

        Ok(Self {
            secret_key,
            public_key_bytes,
        })
    }

    /// The public key in uncompressed form (65 bytes: 0x04 || x || y).
    pub fn public_key(&self) -> &[u8] {
        &self.public_key_bytes
    }

    /// Perform ECDH with a peer's uncompressed public key.
    ///
    /// Returns the 32-byte shared secret (x-coordinate of the result point).
    ///
    /// # Errors
    ///
    /// Returns an error if the peer key has the wrong length, is not in
    /// uncompressed form, or is not a point on the curve.
    pub fn exchange(&self, peer_public: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
        if peer_public.len() != P256_PUBLIC_KEY_LEN {
            return Err(Error::InvalidLength {
                expected: P256_PUBLIC_KEY_LEN,
                actual: peer_public.len(),
            });
        }

        if peer_public[0] != 0x04 {
            return Err(Error::InvalidPublicKey(
                "P-256 public key must use uncompressed format (0x04 prefix)".into(),
            ));
        }

        let peer_encoded_point = EncodedPoint::from_bytes(peer_public)
            .map_err(|_| Error::InvalidPublicKey("Failed to parse P-256 public key".into()))?;

        let peer_public_key = PublicKey::from_encoded_point(&peer_encoded_point)
            .into_option()
            .ok_or_else(|| Error::InvalidPublicKey("Invalid P-256 public key point".into()))?;

        let shared_secret = diffie_hellman(
            self.secret_key.to_nonzero_scalar(),
            peer_public_key.as_affine(),
        );

        let mut result = [0u8; 32];
        result.copy_from_slice(shared_secret.raw_secret_bytes().as_slice());

        Ok(Zeroizing::new(result))
    }
}
