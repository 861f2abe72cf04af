//! Key derivation functions (HKDF-SHA256).
//!
//! Three derivations feed the DTCP key hierarchy:
//! - the authentication key Kauth, from the ECDH shared secret and both
//!   handshake nonces, protects exchange key delivery;
//! - the content key Kc, from the exchange key Kx plus the packet nonce and
//!   copy-control mode, seals individual PCPs;
//! - the key confirmation digest proves to the source that the sink
//!   recovered the same Kx without ever putting Kx on the wire in clear.

use crate::{Error, ExchangeKey, Result, EXCHANGE_KEY_LEN};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Length of the key confirmation digest in bytes.
pub const CONFIRMATION_DIGEST_LEN: usize = 8;

/// Generic HKDF-SHA256 key derivation per RFC 5869.
///
/// # Arguments
/// * `ikm` - Input key material
/// * `salt` - Salt value (empty slice for no salt)
/// * `info` - Context and application-specific information
/// * `output_len` - Length of output key material
///
/// # Returns
/// Derived key material wrapped in `Zeroizing`.
pub fn hkdf_sha256(
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
    output_len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);

    let mut okm = vec![0u8; output_len];
    hk.expand(info, &mut okm)
        .map_err(|_| Error::KeyDerivation("HKDF expansion failed".into()))?;

    Ok(Zeroizing::new(okm))
}

/// Derive the authentication key Kauth from the ECDH shared secret.
///
/// Uses HKDF-SHA256 with:
/// - IKM: shared_secret (32-byte ECDH output)
/// - Salt: initiator_random || responder_random
/// - Info: "dtcp-auth-key"
/// - Length: 32 bytes
///
/// Both peers compute the same Kauth after the challenge phase; it protects
/// the wrapped exchange key in the KEY_EXCHANGE message.
pub fn derive_auth_key(
    shared_secret: &[u8],
    initiator_random: &[u8; 32],
    responder_random: &[u8; 32],
) -> Result<Zeroizing<[u8; 32]>> {
    // Salt: initiator_random || responder_random (64 bytes)
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(initiator_random);
    salt.extend_from_slice(responder_random);

    let info = b"dtcp-auth-key";

    let okm = hkdf_sha256(shared_secret, &salt, info, 32)?;

    let mut result = [0u8; 32];
    result.copy_from_slice(&okm);

    Ok(Zeroizing::new(result))
}

/// Derive a content key Kc from the exchange key Kx.
///
/// Uses HKDF-SHA256 with:
/// - IKM: exchange key (12 bytes)
/// - Salt: nonce (little-endian) || EMI byte
/// - Info: "dtcp-content-key"
/// - Length: 32 bytes
///
/// Binding the EMI into the salt means a packet whose copy-control byte is
/// tampered with in transit decrypts under a different key and fails
/// authentication at the sink.
pub fn derive_content_key(
    exchange_key: &ExchangeKey,
    emi: u8,
    nonce: u64,
) -> Result<Zeroizing<[u8; 32]>> {
    // Salt: nonce (8 bytes LE) || emi (1 byte)
    let mut salt = Vec::with_capacity(9);
    salt.extend_from_slice(&nonce.to_le_bytes());
    salt.push(emi);

    let info = b"dtcp-content-key";

    let okm = hkdf_sha256(&exchange_key[..], &salt, info, 32)?;

    let mut result = [0u8; 32];
    result.copy_from_slice(&okm);

    Ok(Zeroizing::new(result))
}

/// Compute the key confirmation digest sent in the KEY_CONFIRM message.
///
/// Uses HKDF-SHA256 with:
/// - IKM: exchange key (12 bytes)
/// - Salt: initiator_random || responder_random
/// - Info: "dtcp-kx-confirm"
/// - Length: 8 bytes
///
/// The digest is not secret once computed; it only demonstrates possession
/// of Kx bound to this handshake's nonces.
pub fn key_confirmation_digest(
    exchange_key: &ExchangeKey,
    initiator_random: &[u8; 32],
    responder_random: &[u8; 32],
) -> Result<[u8; CONFIRMATION_DIGEST_LEN]> {
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(initiator_random);
    salt.extend_from_slice(responder_random);

    let info = b"dtcp-kx-confirm";

    let okm = hkdf_sha256(&exchange_key[..], &salt, info, CONFIRMATION_DIGEST_LEN)?;

    let mut result = [0u8; CONFIRMATION_DIGEST_LEN];
    result.copy_from_slice(&okm);

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_exchange_key(byte: u8) -> ExchangeKey {
        Zeroizing::new([byte; EXCHANGE_KEY_LEN])
    }

    /// RFC 5869 Test Case 1
    #[test]
    fn test_hkdf_rfc5869() {
        let ikm = hex::decode("0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b").unwrap();
        let salt = hex::decode("000102030405060708090a0b0c").unwrap();
        let info = hex::decode("f0f1f2f3f4f5f6f7f8f9").unwrap();

        let okm = hkdf_sha256(&ikm, &salt, &info, 42).unwrap();

        let expected = hex::decode(
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865",
        )
        .unwrap();

        assert_eq!(&*okm, &expected);
    }

    #[test]
    fn test_auth_key_depends_on_randoms() {
        let shared_secret = [0x42u8; 32];
        let ir1 = [0x01u8; 32];
        let ir2 = [0x02u8; 32];
        let rr = [0x03u8; 32];

        let kauth1 = derive_auth_key(&shared_secret, &ir1, &rr).unwrap();
        let kauth2 = derive_auth_key(&shared_secret, &ir2, &rr).unwrap();

        assert_ne!(&*kauth1, &*kauth2);
    }

    #[test]
    fn test_auth_key_deterministic() {
        let shared_secret = [0x42u8; 32];
        let ir = [0x01u8; 32];
        let rr = [0x03u8; 32];

        let kauth1 = derive_auth_key(&shared_secret, &ir, &rr).unwrap();
        let kauth2 = derive_auth_key(&shared_secret, &ir, &rr).unwrap();

        assert_eq!(&*kauth1, &*kauth2);
    }

    #[test]
    fn test_content_key_varies_with_nonce() {
        let kx = test_exchange_key(0x42);

        let kc1 = derive_content_key(&kx, 0x0C, 0).unwrap();
        let kc2 = derive_content_key(&kx, 0x0C, 1).unwrap();

        assert_ne!(&*kc1, &*kc2);
    }

    #[test]
    fn test_content_key_varies_with_emi() {
        let kx = test_exchange_key(0x42);

        let copy_never = derive_content_key(&kx, 0x0C, 7).unwrap();
        let copy_free = derive_content_key(&kx, 0x00, 7).unwrap();

        assert_ne!(&*copy_never, &*copy_free);
    }

    #[test]
    fn test_content_key_varies_with_exchange_key() {
        let kc1 = derive_content_key(&test_exchange_key(0x42), 0x0C, 7).unwrap();
        let kc2 = derive_content_key(&test_exchange_key(0x43), 0x0C, 7).unwrap();

        assert_ne!(&*kc1, &*kc2);
    }

    #[test]
    fn test_confirmation_digest_matches_between_peers() {
        let kx = test_exchange_key(0x55);
        let ir = [0x11u8; 32];
        let rr = [0x22u8; 32];

        let source_digest = key_confirmation_digest(&kx, &ir, &rr).unwrap();
        let sink_digest = key_confirmation_digest(&kx, &ir, &rr).unwrap();

        assert_eq!(source_digest, sink_digest);
    }

    #[test]
    fn test_confirmation_digest_detects_wrong_key() {
        let ir = [0x11u8; 32];
        let rr = [0x22u8; 32];

        let digest1 = key_confirmation_digest(&test_exchange_key(0x55), &ir, &rr).unwrap();
        let digest2 = key_confirmation_digest(&test_exchange_key(0x56), &ir, &rr).unwrap();

        assert_ne!(digest1, digest2);
    }
}
