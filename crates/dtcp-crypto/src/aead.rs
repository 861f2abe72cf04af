//! AES-256-GCM authenticated encryption.
//!
//! Used in two places:
//! - PCP payload protection: each protected content packet is sealed under
//!   the content key with its header as associated data.
//! - Exchange key delivery: the source wraps the exchange key under the
//!   authentication key before sending it in the KEY_EXCHANGE message.

use crate::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use zeroize::Zeroizing;

/// Construct an AEAD nonce from a 64-bit counter.
///
/// GCM requires 12-byte nonces. The first 4 bytes are fixed zeros and the
/// remaining 8 carry the counter in little-endian order. PCP nonces come
/// from the per-session packet counter; key-wrap nonces come from the
/// exchange key epoch.
///
/// # Example
/// ```
/// use dtcp_crypto::aead::construct_nonce;
///
/// let nonce = construct_nonce(0x4746454443424140);
/// assert_eq!(&nonce[0..4], &[0, 0, 0, 0]);
/// assert_eq!(&nonce[4..12], &[0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47]);
/// ```
pub fn construct_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    // nonce[0:4] already zero
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypt with AES-256-GCM per NIST SP 800-38D.
///
/// # Arguments
/// * `key` - 32-byte encryption key
/// * `nonce` - 12-byte nonce (must be unique per key)
/// * `plaintext` - Data to encrypt
/// * `aad` - Additional authenticated data (not encrypted, but authenticated)
///
/// # Returns
/// Ciphertext with appended 16-byte authentication tag.
///
/// # Security
/// Callers MUST ensure `key` parameter is stored in `Zeroizing` wrapper
/// to prevent key material from remaining in memory after use.
pub fn aes256gcm_encrypt(
    key: &[u8; 32],
    nonce: &[u8; 12],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| Error::Encryption("Invalid AES-256-GCM key length".into()))?;

    let payload = Payload {
        msg: plaintext,
        aad,
    };

    cipher
        .encrypt(Nonce::from_slice(nonce), payload)
        .map_err(|_| Error::Encryption("AES-256-GCM encryption failed".into()))
}

/// Decrypt with AES-256-GCM per NIST SP 800-38D.
///
/// # Arguments
/// * `key` - 32-byte decryption key
/// * `nonce` - 12-byte nonce (same as used for encryption)
/// * `ciphertext_and_tag` - Ciphertext with appended 16-byte tag
/// * `aad` - Additional authenticated data (must match encryption)
///
/// # Returns
/// Plaintext if authentication succeeds, wrapped in `Zeroizing`.
///
/// # Errors
/// Returns `Error::Decryption` if tag verification fails.
pub fn aes256gcm_decrypt(
    key: &[u8; 32],
    nonce: &[u8; 12],
    ciphertext_and_tag: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| Error::Decryption("Invalid AES-256-GCM key length".into()))?;

    let payload = Payload {
        msg: ciphertext_and_tag,
        aad,
    };

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), payload)
        .map_err(|_| Error::Decryption("AES-256-GCM authentication failed".into()))?;

    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construct_nonce() {
        let counter = 0x4746454443424140u64;
        let nonce = construct_nonce(counter);

        // First 4 bytes must be zeros
        assert_eq!(&nonce[0..4], &[0, 0, 0, 0]);

        // Last 8 bytes are counter in little-endian
        assert_eq!(
            &nonce[4..12],
            &[0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47]
        );
    }

    #[test]
    fn test_construct_nonce_zero() {
        let nonce = construct_nonce(0);
        assert_eq!(nonce, [0u8; 12]);
    }

    #[test]
    fn test_construct_nonce_max() {
        let nonce = construct_nonce(u64::MAX);
        assert_eq!(&nonce[0..4], &[0, 0, 0, 0]);
        assert_eq!(&nonce[4..12], &[0xFF; 8]);
    }

    #[test]
    fn test_aes256gcm_roundtrip() {
        let key = [0x42u8; 32];
        let nonce = [0x01u8; 12];
        let plaintext = b"The quick brown fox jumps over the lazy dog";
        let aad = b"pcp_header";

        let ciphertext = aes256gcm_encrypt(&key, &nonce, plaintext, aad).unwrap();
        let decrypted = aes256gcm_decrypt(&key, &nonce, &ciphertext, aad).unwrap();

        assert_eq!(&*decrypted, plaintext);
    }

    #[test]
    fn test_aes256gcm_wrong_key() {
        let key1 = [0x42u8; 32];
        let key2 = [0x43u8; 32];
        let nonce = [0x01u8; 12];
        let plaintext = b"protected content";
        let aad = b"";

        let ciphertext = aes256gcm_encrypt(&key1, &nonce, plaintext, aad).unwrap();
        let result = aes256gcm_decrypt(&key2, &nonce, &ciphertext, aad);

        assert!(result.is_err());
    }

    #[test]
    fn test_aes256gcm_wrong_nonce() {
        let key = [0x42u8; 32];
        let nonce1 = [0x01u8; 12];
        let nonce2 = [0x02u8; 12];
        let plaintext = b"protected content";
        let aad = b"";

        let ciphertext = aes256gcm_encrypt(&key, &nonce1, plaintext, aad).unwrap();
        let result = aes256gcm_decrypt(&key, &nonce2, &ciphertext, aad);

        assert!(result.is_err());
    }

    #[test]
    fn test_aes256gcm_wrong_aad() {
        let key = [0x42u8; 32];
        let nonce = [0x01u8; 12];
        let plaintext = b"protected content";
        let aad1 = b"correct_header";
        let aad2 = b"wrong_header";

        let ciphertext = aes256gcm_encrypt(&key, &nonce, plaintext, aad1).unwrap();
        let result = aes256gcm_decrypt(&key, &nonce, &ciphertext, aad2);

        assert!(result.is_err());
    }

    #[test]
    fn test_aes256gcm_corrupted_ciphertext() {
        let key = [0x42u8; 32];
        let nonce = [0x01u8; 12];
        let plaintext = b"protected content";
        let aad = b"";

        let mut ciphertext = aes256gcm_encrypt(&key, &nonce, plaintext, aad).unwrap();

        // Corrupt one byte
        ciphertext[5] ^= 0xFF;

        let result = aes256gcm_decrypt(&key, &nonce, &ciphertext, aad);
        assert!(result.is_err());
    }

    #[test]
    fn test_aes256gcm_empty_plaintext() {
        let key = [0x42u8; 32];
        let nonce = [0x01u8; 12];
        let plaintext = b"";
        let aad = b"header";

        let ciphertext = aes256gcm_encrypt(&key, &nonce, plaintext, aad).unwrap();

        // Only the 16-byte tag remains
        assert_eq!(ciphertext.len(), 16);

        let decrypted = aes256gcm_decrypt(&key, &nonce, &ciphertext, aad).unwrap();
        assert_eq!(&*decrypted, plaintext);
    }
}
