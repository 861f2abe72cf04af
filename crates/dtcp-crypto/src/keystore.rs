//! Device key storage behind a trait boundary.
//!
//! Production devices keep their certificate private key and exchange keys
//! inside a SoC trust module; hosts and tests use [`SoftwareKeyStore`]. The
//! AKE engine and session manager only ever talk to [`DeviceKeyStore`], so
//! swapping the backing store never touches protocol code.
//!
//! Exchange keys are identified by an 8-bit label. Label 0 is the shared
//! key handed to every ordinary sink; labels 1 and up are allocated
//! per-session for peers that advertise
//! [`CAP_SESSION_EXCHANGE_KEY`](crate::cert::CAP_SESSION_EXCHANGE_KEY).

use crate::cert::{DeviceCertificate, FORMAT_BASELINE};
use crate::{Error, ExchangeKey, Result, EXCHANGE_KEY_LEN};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Mutex;
use zeroize::Zeroizing;

/// Label of the shared exchange key.
pub const SHARED_KEY_LABEL: u8 = 0;

/// Access to a device's long-term credentials and exchange keys.
///
/// Implementations must be safe to share across the listener and session
/// threads of a manager.
pub trait DeviceKeyStore: Send + Sync {
    /// This device's certificate.
    fn device_certificate(&self) -> &DeviceCertificate;

    /// Sign a message with the device's certificate key.
    ///
    /// Returns the 64-byte fixed ECDSA-P256 signature encoding.
    fn sign(&self, message: &[u8]) -> Result<[u8; 64]>;

    /// Validate a peer certificate against the trust anchor.
    fn validate_certificate(&self, certificate: &DeviceCertificate) -> Result<()>;

    /// Look up the exchange key stored under `label`.
    fn exchange_key(&self, label: u8) -> Result<ExchangeKey>;

    /// Get or create the shared exchange key (label 0).
    fn shared_exchange_key(&self) -> Result<(u8, ExchangeKey)>;

    /// Allocate a fresh exchange key under a new label.
    fn fresh_exchange_key(&self) -> Result<(u8, ExchangeKey)>;

    /// Replace the key stored under `label` with fresh material.
    fn rotate_exchange_key(&self, label: u8) -> Result<ExchangeKey>;
}

fn random_exchange_key() -> [u8; EXCHANGE_KEY_LEN] {
    let mut key = [0u8; EXCHANGE_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// A certificate authority for a closed device population.
///
/// Real deployments receive DTLA-issued certificates; [`TrustAnchor`] stands
/// in for that authority on development hosts and in tests. Every device
/// provisioned from the same anchor authenticates successfully against the
/// others.
pub struct TrustAnchor {
    signing_key: SigningKey,
}

impl TrustAnchor {
    /// Generate a new trust anchor with a random signing key.
    pub fn generate() -> Result<Self> {
        Ok(Self {
            signing_key: SigningKey::random(&mut OsRng),
        })
    }

    /// The anchor's public verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Issue a device certificate and its private signing key.
    pub fn issue(
        &self,
        device_id: [u8; 5],
        capabilities: u8,
    ) -> Result<(DeviceCertificate, SigningKey)> {
        let device_key = SigningKey::random(&mut OsRng);
        let public_point = device_key.verifying_key().to_encoded_point(false);

        let mut public_key = [0u8; 65];
        public_key.copy_from_slice(public_point.as_bytes());

        let mut certificate = DeviceCertificate {
            format: FORMAT_BASELINE,
            generation: 1,
            capabilities,
            device_id,
            public_key,
            signature: [0u8; 64],
        };

        let signature: Signature = self.signing_key.sign(&certificate.signed_portion());
        certificate.signature.copy_from_slice(signature.as_ref());

        Ok((certificate, device_key))
    }
}

/// In-memory key store for development hosts and tests.
pub struct SoftwareKeyStore {
    certificate: DeviceCertificate,
    signing_key: SigningKey,
    anchor_key: VerifyingKey,
    exchange_keys: Mutex<KeyTable>,
}

struct KeyTable {
    keys: HashMap<u8, Zeroizing<[u8; EXCHANGE_KEY_LEN]>>,
    next_label: u8,
}

impl SoftwareKeyStore {
    /// Provision a new device from a trust anchor.
    pub fn provision(anchor: &TrustAnchor, device_id: [u8; 5], capabilities: u8) -> Result<Self> {
        let (certificate, signing_key) = anchor.issue(device_id, capabilities)?;

        Ok(Self {
            certificate,
            signing_key,
            anchor_key: anchor.verifying_key(),
            exchange_keys: Mutex::new(KeyTable {
                keys: HashMap::new(),
                // Label 0 is reserved for the shared key.
                next_label: SHARED_KEY_LABEL + 1,
            }),
        })
    }

    fn lock_keys(&self) -> Result<std::sync::MutexGuard<'_, KeyTable>> {
        self.exchange_keys
            .lock()
            .map_err(|_| Error::KeyStore("Exchange key table lock poisoned".into()))
    }
}

impl DeviceKeyStore for SoftwareKeyStore {
    fn device_certificate(&self) -> &DeviceCertificate {
        &self.certificate
    }

    fn sign(&self, message: &[u8]) -> Result<[u8; 64]> {
        let signature: Signature = self.signing_key.sign(message);

        let mut out = [0u8; 64];
        out.copy_from_slice(signature.as_ref());
        Ok(out)
    }

    fn validate_certificate(&self, certificate: &DeviceCertificate) -> Result<()> {
        if certificate.format != FORMAT_BASELINE {
            return Err(Error::Certificate(format!(
                "Unsupported certificate format {:#04x}",
                certificate.format
            )));
        }

        certificate.verify(&self.anchor_key)
    }

    fn exchange_key(&self, label: u8) -> Result<ExchangeKey> {
        let table = self.lock_keys()?;
        table
            .keys
            .get(&label)
            .cloned()
            .ok_or(Error::UnknownKeyLabel(label))
    }

    fn shared_exchange_key(&self) -> Result<(u8, ExchangeKey)> {
        let mut table = self.lock_keys()?;
        let key = table
            .keys
            .entry(SHARED_KEY_LABEL)
            .or_insert_with(|| Zeroizing::new(random_exchange_key()))
            .clone();
        Ok((SHARED_KEY_LABEL, key))
    }

    fn fresh_exchange_key(&self) -> Result<(u8, ExchangeKey)> {
        let mut table = self.lock_keys()?;

        if table.keys.len() >= usize::from(u8::MAX) {
            return Err(Error::KeyStore("Exchange key labels exhausted".into()));
        }

        // Skip labels still in use by live sessions.
        let mut label = table.next_label;
        while label == SHARED_KEY_LABEL || table.keys.contains_key(&label) {
            label = label.wrapping_add(1);
        }
        table.next_label = label.wrapping_add(1);

        let key = Zeroizing::new(random_exchange_key());
        table.keys.insert(label, key.clone());
        Ok((label, key))
    }

    fn rotate_exchange_key(&self, label: u8) -> Result<ExchangeKey> {
        let mut table = self.lock_keys()?;

        if !table.keys.contains_key(&label) {
            return Err(Error::UnknownKeyLabel(label));
        }

        let key = Zeroizing::new(random_exchange_key());
        table.keys.insert(label, key.clone());
        Ok(key)
    }
}
