//! Cryptographic foundations for the DTCP-IP session manager.
//!
//! This crate is the trust-module boundary described in the manager design:
//! - Device certificates and trust-anchor validation
//! - The [`DeviceKeyStore`] trait (certificate, signing, exchange keys)
//! - Ephemeral ECDH-P256 agreement for the AKE authentication key
//! - HKDF-based derivation (auth key, content key, key confirmation)
//! - AES-256-GCM content encryption
//!
//! The DTLA-issued certificate formats and SoC-bound key storage of a real
//! deployment live behind [`DeviceKeyStore`]; the bundled [`SoftwareKeyStore`]
//! is a software implementation suitable for integration testing and
//! development hosts.
//!
//! All secrets are held in `Zeroizing` wrappers and no key material is ever
//! logged.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aead;
pub mod cert;
pub mod error;
pub mod kdf;
pub mod kex;
pub mod keystore;

pub use cert::{DeviceCertificate, CAP_SESSION_EXCHANGE_KEY};
pub use error::{Error, Result};
pub use keystore::{DeviceKeyStore, SoftwareKeyStore, TrustAnchor, SHARED_KEY_LABEL};

/// Length of a DTCP exchange key in bytes (96 bits).
pub const EXCHANGE_KEY_LEN: usize = 12;

/// An exchange key, zeroed on drop.
pub type ExchangeKey = zeroize::Zeroizing<[u8; EXCHANGE_KEY_LEN]>;
