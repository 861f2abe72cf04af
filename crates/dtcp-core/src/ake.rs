//! AKE (Authentication and Key Exchange) messages and state machine.
//!
//! The handshake runs over a dedicated control connection and establishes
//! an exchange key Kx between a source and a sink:
//!
//! ```text
//! Initiator                          Responder
//!   CERT_EXCHANGE   ------------------>
//!                   <------------------  CERT_EXCHANGE
//!   CHALLENGE       ------------------>
//!                   <------------------  CHALLENGE (+ KEY_EXCHANGE if
//!                                        the responder is the source)
//!   then, depending on which side is the source:
//!   KEY_EXCHANGE    ------------------>            (initiator source)
//!                   <------------------  KEY_CONFIRM
//!   STATUS(Ok)      ------------------>
//! or
//!   KEY_CONFIRM     ------------------>            (responder source)
//!                   <------------------  STATUS(Ok)
//! ```
//!
//! Certificates are exchanged and validated first, then each side signs the
//! handshake transcript with its certificate key and the ECDH shared secret
//! yields the authentication key Kauth. The source wraps Kx under Kauth;
//! the sink proves recovery with a confirmation digest. Either side may
//! abort with a STATUS frame carrying an error code.
//!
//! [`AkeMachine`] is sans-IO: callers feed it parsed frames and ship the
//! frames it returns. The same machine drives both device roles and both
//! connection directions.

use crate::pcp::{check_len, read_u32_le};
use crate::{Error, Result};
use dtcp_crypto::aead::{aes256gcm_encrypt, aes256gcm_decrypt, construct_nonce};
use dtcp_crypto::cert::{DeviceCertificate, CERTIFICATE_LEN};
use dtcp_crypto::kdf::{derive_auth_key, key_confirmation_digest, CONFIRMATION_DIGEST_LEN};
use dtcp_crypto::kex::{EcdhP256KeyPair, P256_PUBLIC_KEY_LEN};
use dtcp_crypto::keystore::SHARED_KEY_LABEL;
use dtcp_crypto::{DeviceKeyStore, ExchangeKey, EXCHANGE_KEY_LEN};
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use zeroize::Zeroizing;

// Frame magic numbers (4 bytes, ASCII mnemonic)
/// Magic number for CertExchange frame (0x44544345 = "DTCE").
pub const MAGIC_CERT_EXCHANGE: u32 = 0x4454_4345;
/// Magic number for Challenge frame (0x44544348 = "DTCH").
pub const MAGIC_CHALLENGE: u32 = 0x4454_4348;
/// Magic number for KeyExchange frame (0x44544B58 = "DTKX").
pub const MAGIC_KEY_EXCHANGE: u32 = 0x4454_4B58;
/// Magic number for KeyConfirm frame (0x44544B43 = "DTKC").
pub const MAGIC_KEY_CONFIRM: u32 = 0x4454_4B43;
/// Magic number for Status frame (0x44545354 = "DTST").
pub const MAGIC_STATUS: u32 = 0x4454_5354;

// Frame type identifiers (1 byte)
/// Type identifier for CertExchange frame (0x01).
pub const TYPE_CERT_EXCHANGE: u8 = 0x01;
/// Type identifier for Challenge frame (0x02).
pub const TYPE_CHALLENGE: u8 = 0x02;
/// Type identifier for KeyExchange frame (0x03).
pub const TYPE_KEY_EXCHANGE: u8 = 0x03;
/// Type identifier for KeyConfirm frame (0x04).
pub const TYPE_KEY_CONFIRM: u8 = 0x04;
/// Type identifier for Status frame (0x05).
pub const TYPE_STATUS: u8 = 0x05;

/// Status code: success.
pub const STATUS_OK: u8 = 0x00;
/// Status code: sink requests a fresh exchange key delivery.
pub const STATUS_KEY_REQUEST: u8 = 0x01;
/// Status code: authentication failed.
pub const STATUS_AUTH_FAILED: u8 = 0x02;
/// Status code: peer certificate rejected.
pub const STATUS_CERT_INVALID: u8 = 0x03;
/// Status code: unexpected or malformed message.
pub const STATUS_PROTOCOL_ERROR: u8 = 0x04;

/// CertExchange flag bit: requesting a per-session exchange key.
const FLAG_UNIQUE_KEY: u8 = 0x01;

/// Length of a wrapped exchange key (key plus GCM tag).
pub const WRAPPED_KEY_LEN: usize = EXCHANGE_KEY_LEN + 16;

/// Device role advertised during certificate exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceType {
    /// Role not yet known.
    Unknown = 0x00,
    /// Content source (serves exchange keys).
    Source = 0x01,
    /// Content sink (receives exchange keys).
    Sink = 0x02,
}

impl DeviceType {
    /// Convert to the wire byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Convert from the wire byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::Unknown),
            0x01 => Ok(Self::Source),
            0x02 => Ok(Self::Sink),
            _ => Err(Error::InvalidFrame(format!(
                "Unknown device type {:#04x}",
                value
            ))),
        }
    }
}

/// AKE control frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AkeFrame {
    /// Certificate and nonce exchange, first message in each direction.
    CertExchange {
        /// Sender's device role.
        device_type: DeviceType,
        /// Sender requests a per-session exchange key.
        unique_key: bool,
        /// Sender's device certificate.
        certificate: DeviceCertificate,
        /// Sender's handshake nonce.
        random: [u8; 32],
    },

    /// Signed ephemeral ECDH contribution.
    Challenge {
        /// Sender's ephemeral P-256 public key, uncompressed.
        ecdh_pubkey: [u8; 65],
        /// Signature over the handshake transcript with the sender's
        /// certificate key.
        signature: [u8; 64],
    },

    /// Exchange key delivery from the source.
    KeyExchange {
        /// Label identifying the delivered exchange key.
        key_label: u8,
        /// Wrap epoch, incremented on each renewal delivery.
        epoch: u32,
        /// Exchange key wrapped under the authentication key.
        wrapped_key: [u8; WRAPPED_KEY_LEN],
    },

    /// Sink's proof that it recovered the exchange key.
    KeyConfirm {
        /// Confirmation digest bound to both handshake nonces.
        digest: [u8; CONFIRMATION_DIGEST_LEN],
    },

    /// Completion, renewal request, or abort notification.
    Status {
        /// One of the `STATUS_*` codes.
        code: u8,
    },
}

impl AkeFrame {
    /// Parse a frame from bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        check_len(data, 5)?;

        let magic = read_u32_le(&data[0..4]);
        let frame_type = data[4];

        match (magic, frame_type) {
            (MAGIC_CERT_EXCHANGE, TYPE_CERT_EXCHANGE) => Self::parse_cert_exchange(&data[5..]),
            (MAGIC_CHALLENGE, TYPE_CHALLENGE) => Self::parse_challenge(&data[5..]),
            (MAGIC_KEY_EXCHANGE, TYPE_KEY_EXCHANGE) => Self::parse_key_exchange(&data[5..]),
            (MAGIC_KEY_CONFIRM, TYPE_KEY_CONFIRM) => Self::parse_key_confirm(&data[5..]),
            (MAGIC_STATUS, TYPE_STATUS) => Self::parse_status(&data[5..]),
            _ => Err(Error::InvalidFrame(format!(
                "Unknown frame: magic=0x{:08X}, type=0x{:02X}",
                magic, frame_type
            ))),
        }
    }

    /// Serialize frame to bytes.
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            AkeFrame::CertExchange {
                device_type,
                unique_key,
                certificate,
                random,
            } => {
                let mut buf = Vec::with_capacity(5 + 2 + CERTIFICATE_LEN + 32);
                buf.extend_from_slice(&MAGIC_CERT_EXCHANGE.to_le_bytes());
                buf.push(TYPE_CERT_EXCHANGE);
                buf.push(device_type.to_u8());
                buf.push(if *unique_key { FLAG_UNIQUE_KEY } else { 0 });
                buf.extend_from_slice(&certificate.serialize());
                buf.extend_from_slice(random);
                buf
            }
            AkeFrame::Challenge {
                ecdh_pubkey,
                signature,
            } => {
                let mut buf = Vec::with_capacity(5 + 65 + 64);
                buf.extend_from_slice(&MAGIC_CHALLENGE.to_le_bytes());
                buf.push(TYPE_CHALLENGE);
                buf.extend_from_slice(ecdh_pubkey);
                buf.extend_from_slice(signature);
                buf
            }
            AkeFrame::KeyExchange {
                key_label,
                epoch,
                wrapped_key,
            } => {
                let mut buf = Vec::with_capacity(5 + 1 + 4 + WRAPPED_KEY_LEN);
                buf.extend_from_slice(&MAGIC_KEY_EXCHANGE.to_le_bytes());
                buf.push(TYPE_KEY_EXCHANGE);
                buf.push(*key_label);
                buf.extend_from_slice(&epoch.to_le_bytes());
                buf.extend_from_slice(wrapped_key);
                buf
            }
            AkeFrame::KeyConfirm { digest } => {
                let mut buf = Vec::with_capacity(5 + CONFIRMATION_DIGEST_LEN);
                buf.extend_from_slice(&MAGIC_KEY_CONFIRM.to_le_bytes());
                buf.push(TYPE_KEY_CONFIRM);
                buf.extend_from_slice(digest);
                buf
            }
            AkeFrame::Status { code } => {
                let mut buf = Vec::with_capacity(6);
                buf.extend_from_slice(&MAGIC_STATUS.to_le_bytes());
                buf.push(TYPE_STATUS);
                buf.push(*code);
                buf
            }
        }
    }

    fn parse_cert_exchange(data: &[u8]) -> Result<Self> {
        let mut offset = 0;

        check_len(data, offset + 2)?;
        let device_type = DeviceType::from_u8(data[offset])?;
        let flags = data[offset + 1];
        offset += 2;

        if flags & !FLAG_UNIQUE_KEY != 0 {
            return Err(Error::InvalidFrame(format!(
                "Unknown CertExchange flags {:#04x}",
                flags
            )));
        }

        check_len(data, offset + CERTIFICATE_LEN)?;
        let certificate = DeviceCertificate::parse(&data[offset..offset + CERTIFICATE_LEN])?;
        offset += CERTIFICATE_LEN;

        check_len(data, offset + 32)?;
        let mut random = [0u8; 32];
        random.copy_from_slice(&data[offset..offset + 32]);

        Ok(AkeFrame::CertExchange {
            device_type,
            unique_key: flags & FLAG_UNIQUE_KEY != 0,
            certificate,
            random,
        })
    }

    fn parse_challenge(data: &[u8]) -> Result<Self> {
        check_len(data, P256_PUBLIC_KEY_LEN + 64)?;

        let mut ecdh_pubkey = [0u8; 65];
        ecdh_pubkey.copy_from_slice(&data[0..65]);

        let mut signature = [0u8; 64];
        signature.copy_from_slice(&data[65..129]);

        Ok(AkeFrame::Challenge {
            ecdh_pubkey,
            signature,
        })
    }

    fn parse_key_exchange(data: &[u8]) -> Result<Self> {
        check_len(data, 1 + 4 + WRAPPED_KEY_LEN)?;

        let key_label = data[0];
        let epoch = read_u32_le(&data[1..5]);

        let mut wrapped_key = [0u8; WRAPPED_KEY_LEN];
        wrapped_key.copy_from_slice(&data[5..5 + WRAPPED_KEY_LEN]);

        Ok(AkeFrame::KeyExchange {
            key_label,
            epoch,
            wrapped_key,
        })
    }

    fn parse_key_confirm(data: &[u8]) -> Result<Self> {
        check_len(data, CONFIRMATION_DIGEST_LEN)?;

        let mut digest = [0u8; CONFIRMATION_DIGEST_LEN];
        digest.copy_from_slice(&data[0..CONFIRMATION_DIGEST_LEN]);

        Ok(AkeFrame::KeyConfirm { digest })
    }

    fn parse_status(data: &[u8]) -> Result<Self> {
        check_len(data, 1)?;
        Ok(AkeFrame::Status { code: data[0] })
    }
}

/// Wrap an exchange key under the authentication key.
///
/// The wrap nonce is derived from the delivery epoch and the key label is
/// bound as associated data, so a renewal delivery can never be replayed
/// as the original and a wrapped key cannot be relabeled.
pub fn wrap_exchange_key(
    auth_key: &[u8; 32],
    key_label: u8,
    epoch: u32,
    exchange_key: &ExchangeKey,
) -> Result<[u8; WRAPPED_KEY_LEN]> {
    let nonce = construct_nonce(u64::from(epoch));
    let ciphertext = aes256gcm_encrypt(auth_key, &nonce, &exchange_key[..], &[key_label])?;

    if ciphertext.len() != WRAPPED_KEY_LEN {
        return Err(Error::Ake("Unexpected wrapped key length".into()));
    }

    let mut out = [0u8; WRAPPED_KEY_LEN];
    out.copy_from_slice(&ciphertext);
    Ok(out)
}

/// Unwrap an exchange key delivered by the source.
pub fn unwrap_exchange_key(
    auth_key: &[u8; 32],
    key_label: u8,
    epoch: u32,
    wrapped_key: &[u8; WRAPPED_KEY_LEN],
) -> Result<ExchangeKey> {
    let nonce = construct_nonce(u64::from(epoch));
    let plaintext = aes256gcm_decrypt(auth_key, &nonce, wrapped_key, &[key_label])
        .map_err(|_| Error::Ake("Exchange key unwrap failed".into()))?;

    if plaintext.len() != EXCHANGE_KEY_LEN {
        return Err(Error::Ake("Unexpected exchange key length".into()));
    }

    let mut key = Zeroizing::new([0u8; EXCHANGE_KEY_LEN]);
    key.copy_from_slice(&plaintext);
    Ok(key)
}

/// Result of a completed handshake.
pub struct AkeOutcome {
    /// The established exchange key.
    pub exchange_key: ExchangeKey,
    /// Label of the exchange key.
    pub key_label: u8,
    /// Authentication key protecting the retained control channel.
    pub auth_key: Zeroizing<[u8; 32]>,
    /// Initiator's handshake nonce.
    pub initiator_random: [u8; 32],
    /// Responder's handshake nonce.
    pub responder_random: [u8; 32],
    /// Peer's advertised device role.
    pub peer_device_type: DeviceType,
    /// Capability flags from the peer's certificate.
    pub peer_capabilities: u8,
    /// Whether a per-session exchange key was granted.
    pub unique_key: bool,
}

/// Frames to send and, on completion, the handshake outcome.
pub struct AkeStep {
    /// Frames to transmit to the peer, in order.
    pub replies: Vec<AkeFrame>,
    /// Present once the handshake has completed on this side.
    pub outcome: Option<AkeOutcome>,
}

impl AkeStep {
    fn send(replies: Vec<AkeFrame>) -> Self {
        Self {
            replies,
            outcome: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

enum State {
    Idle,
    /// Initiator sent its CertExchange, waiting for the peer's.
    AwaitPeerCert,
    /// Waiting for the peer's Challenge. The initiator already generated
    /// its ephemeral keypair; the responder generates one on reply.
    AwaitChallenge {
        keypair: Option<EcdhP256KeyPair>,
    },
    /// Sink waiting for the source's KeyExchange.
    AwaitKeyExchange,
    /// Source waiting for the sink's KeyConfirm.
    AwaitKeyConfirm {
        key_label: u8,
        exchange_key: ExchangeKey,
        unique_key: bool,
    },
    /// Sink waiting for the source's final Status(Ok).
    AwaitStatus {
        key_label: u8,
        exchange_key: ExchangeKey,
        unique_key: bool,
    },
    Authenticated,
    Failed,
}

/// Sans-IO AKE handshake state machine.
///
/// Construct with [`AkeMachine::new_initiator`] or
/// [`AkeMachine::new_responder`], then call [`AkeMachine::start`] (initiator
/// only) and feed every received frame to [`AkeMachine::handle`]. Any error
/// is terminal for the handshake; the driver reports a Status frame to the
/// peer and drops the connection or retains it for renewal as appropriate.
pub struct AkeMachine {
    role: Role,
    device_type: DeviceType,
    store: Arc<dyn DeviceKeyStore>,
    /// Source role only: key label requested by the caller.
    requested_key_label: Option<u8>,
    /// Sink role only: ask the source for a per-session key.
    request_unique_key: bool,
    state: State,
    local_random: [u8; 32],
    peer_random: Option<[u8; 32]>,
    peer_certificate: Option<DeviceCertificate>,
    peer_device_type: DeviceType,
    peer_unique_key_request: bool,
    auth_key: Option<Zeroizing<[u8; 32]>>,
}

impl AkeMachine {
    /// Create the initiating side of a handshake.
    ///
    /// `requested_key_label` is only meaningful when the local device is the
    /// source; `request_unique_key` only when it is the sink.
    pub fn new_initiator(
        store: Arc<dyn DeviceKeyStore>,
        device_type: DeviceType,
        requested_key_label: Option<u8>,
        request_unique_key: bool,
    ) -> Self {
        Self::new(
            Role::Initiator,
            store,
            device_type,
            requested_key_label,
            request_unique_key,
        )
    }

    /// Create the responding side of a handshake.
    pub fn new_responder(
        store: Arc<dyn DeviceKeyStore>,
        device_type: DeviceType,
        request_unique_key: bool,
    ) -> Self {
        Self::new(Role::Responder, store, device_type, None, request_unique_key)
    }

    fn new(
        role: Role,
        store: Arc<dyn DeviceKeyStore>,
        device_type: DeviceType,
        requested_key_label: Option<u8>,
        request_unique_key: bool,
    ) -> Self {
        let mut local_random = [0u8; 32];
        OsRng.fill_bytes(&mut local_random);

        Self {
            role,
            device_type,
            store,
            requested_key_label,
            request_unique_key,
            state: State::Idle,
            local_random,
            peer_random: None,
            peer_certificate: None,
            peer_device_type: DeviceType::Unknown,
            peer_unique_key_request: false,
            auth_key: None,
        }
    }

    /// Whether the handshake has completed successfully.
    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, State::Authenticated)
    }

    /// Begin the handshake. Initiator only.
    pub fn start(&mut self) -> Result<AkeFrame> {
        if self.role != Role::Initiator || !matches!(self.state, State::Idle) {
            return Err(Error::InvalidState);
        }

        self.state = State::AwaitPeerCert;
        Ok(self.local_cert_exchange())
    }

    /// Feed a received frame to the machine.
    ///
    /// On error the machine enters a terminal failed state and the
    /// handshake cannot be resumed.
    pub fn handle(&mut self, frame: AkeFrame) -> Result<AkeStep> {
        let result = self.dispatch(frame);
        match &result {
            Ok(step) if step.outcome.is_some() => {
                tracing::debug!(role = ?self.role, "handshake authenticated");
            }
            Err(e) => {
                tracing::debug!(role = ?self.role, error = %e, "handshake failed");
                self.state = State::Failed;
            }
            Ok(_) => {}
        }
        result
    }

    fn dispatch(&mut self, frame: AkeFrame) -> Result<AkeStep> {
        if let AkeFrame::Status { code } = frame {
            if code != STATUS_OK {
                return Err(Error::Ake(format!(
                    "Peer aborted handshake with status {:#04x}",
                    code
                )));
            }
        }

        match std::mem::replace(&mut self.state, State::Failed) {
            State::Idle => self.on_idle(frame),
            State::AwaitPeerCert => self.on_await_peer_cert(frame),
            State::AwaitChallenge { keypair } => self.on_await_challenge(keypair, frame),
            State::AwaitKeyExchange => self.on_await_key_exchange(frame),
            State::AwaitKeyConfirm {
                key_label,
                exchange_key,
                unique_key,
            } => self.on_await_key_confirm(key_label, exchange_key, unique_key, frame),
            State::AwaitStatus {
                key_label,
                exchange_key,
                unique_key,
            } => self.on_await_status(key_label, exchange_key, unique_key, frame),
            State::Authenticated | State::Failed => Err(Error::InvalidState),
        }
    }

    /// Responder: peer's opening CertExchange.
    fn on_idle(&mut self, frame: AkeFrame) -> Result<AkeStep> {
        if self.role != Role::Responder {
            return Err(Error::InvalidState);
        }

        self.accept_peer_cert(frame)?;

        let reply = self.local_cert_exchange();
        self.state = State::AwaitChallenge { keypair: None };
        Ok(AkeStep::send(vec![reply]))
    }

    /// Initiator: peer's answering CertExchange.
    fn on_await_peer_cert(&mut self, frame: AkeFrame) -> Result<AkeStep> {
        self.accept_peer_cert(frame)?;

        let keypair = EcdhP256KeyPair::generate()?;
        let challenge = self.local_challenge(&keypair)?;

        self.state = State::AwaitChallenge {
            keypair: Some(keypair),
        };
        Ok(AkeStep::send(vec![challenge]))
    }

    fn on_await_challenge(
        &mut self,
        keypair: Option<EcdhP256KeyPair>,
        frame: AkeFrame,
    ) -> Result<AkeStep> {
        let AkeFrame::Challenge {
            ecdh_pubkey,
            signature,
        } = frame
        else {
            return Err(Error::Ake("Expected Challenge".into()));
        };

        self.verify_peer_challenge(&ecdh_pubkey, &signature)?;

        let mut replies = Vec::new();

        // The responder answers with its own signed challenge before the
        // shared secret can be computed.
        let keypair = match keypair {
            Some(keypair) => keypair,
            None => {
                let keypair = EcdhP256KeyPair::generate()?;
                replies.push(self.local_challenge(&keypair)?);
                keypair
            }
        };

        let shared_secret = keypair.exchange(&ecdh_pubkey)?;
        let (ir, rr) = self.randoms()?;
        self.auth_key = Some(derive_auth_key(&shared_secret[..], &ir, &rr)?);

        if self.device_type == DeviceType::Source {
            let (key_label, exchange_key, unique_key) = self.select_exchange_key()?;

            let auth_key = self.auth_key()?;
            let wrapped_key = wrap_exchange_key(&auth_key, key_label, 1, &exchange_key)?;
            replies.push(AkeFrame::KeyExchange {
                key_label,
                epoch: 1,
                wrapped_key,
            });

            self.state = State::AwaitKeyConfirm {
                key_label,
                exchange_key,
                unique_key,
            };
        } else {
            self.state = State::AwaitKeyExchange;
        }

        Ok(AkeStep::send(replies))
    }

    /// Sink: the source delivered the wrapped exchange key.
    fn on_await_key_exchange(&mut self, frame: AkeFrame) -> Result<AkeStep> {
        let AkeFrame::KeyExchange {
            key_label,
            epoch,
            wrapped_key,
        } = frame
        else {
            return Err(Error::Ake("Expected KeyExchange".into()));
        };

        if epoch != 1 {
            return Err(Error::Ake(format!(
                "Unexpected initial wrap epoch {}",
                epoch
            )));
        }

        let auth_key = self.auth_key()?;
        let exchange_key = unwrap_exchange_key(&auth_key, key_label, epoch, &wrapped_key)?;

        let (ir, rr) = self.randoms()?;
        let digest = key_confirmation_digest(&exchange_key, &ir, &rr)?;

        let unique_key = self.request_unique_key && key_label != SHARED_KEY_LABEL;
        self.state = State::AwaitStatus {
            key_label,
            exchange_key,
            unique_key,
        };
        Ok(AkeStep::send(vec![AkeFrame::KeyConfirm { digest }]))
    }

    /// Source: the sink proved it recovered the exchange key.
    fn on_await_key_confirm(
        &mut self,
        key_label: u8,
        exchange_key: ExchangeKey,
        unique_key: bool,
        frame: AkeFrame,
    ) -> Result<AkeStep> {
        let AkeFrame::KeyConfirm { digest } = frame else {
            return Err(Error::Ake("Expected KeyConfirm".into()));
        };

        let (ir, rr) = self.randoms()?;
        let expected = key_confirmation_digest(&exchange_key, &ir, &rr)?;
        if digest != expected {
            return Err(Error::Ake("Key confirmation digest mismatch".into()));
        }

        let outcome = self.outcome(key_label, exchange_key, unique_key)?;
        self.state = State::Authenticated;
        Ok(AkeStep {
            replies: vec![AkeFrame::Status { code: STATUS_OK }],
            outcome: Some(outcome),
        })
    }

    /// Sink: the source accepted the confirmation.
    fn on_await_status(
        &mut self,
        key_label: u8,
        exchange_key: ExchangeKey,
        unique_key: bool,
        frame: AkeFrame,
    ) -> Result<AkeStep> {
        let AkeFrame::Status { code: STATUS_OK } = frame else {
            return Err(Error::Ake("Expected Status(Ok)".into()));
        };

        let outcome = self.outcome(key_label, exchange_key, unique_key)?;
        self.state = State::Authenticated;
        Ok(AkeStep {
            replies: Vec::new(),
            outcome: Some(outcome),
        })
    }

    fn local_cert_exchange(&self) -> AkeFrame {
        AkeFrame::CertExchange {
            device_type: self.device_type,
            unique_key: self.device_type == DeviceType::Sink && self.request_unique_key,
            certificate: self.store.device_certificate().clone(),
            random: self.local_random,
        }
    }

    fn accept_peer_cert(&mut self, frame: AkeFrame) -> Result<()> {
        let AkeFrame::CertExchange {
            device_type,
            unique_key,
            certificate,
            random,
        } = frame
        else {
            return Err(Error::Ake("Expected CertExchange".into()));
        };

        self.store
            .validate_certificate(&certificate)
            .map_err(|e| Error::InvalidCertificate(e.to_string()))?;

        if device_type == self.device_type && device_type != DeviceType::Unknown {
            return Err(Error::Ake(format!(
                "Both devices claim the {:?} role",
                device_type
            )));
        }

        self.peer_device_type = device_type;
        self.peer_unique_key_request = unique_key;
        self.peer_certificate = Some(certificate);
        self.peer_random = Some(random);
        Ok(())
    }

    /// Build this side's signed challenge.
    ///
    /// The transcript covers both nonces and the signer's ephemeral public
    /// key, with nonce order depending on the signer's connection role so a
    /// challenge can never be reflected back at its author.
    fn local_challenge(&self, keypair: &EcdhP256KeyPair) -> Result<AkeFrame> {
        let (ir, rr) = self.randoms()?;
        let transcript = challenge_transcript(self.role == Role::Initiator, &ir, &rr, keypair.public_key());
        let signature = self.store.sign(&transcript)?;

        let mut ecdh_pubkey = [0u8; 65];
        ecdh_pubkey.copy_from_slice(keypair.public_key());

        Ok(AkeFrame::Challenge {
            ecdh_pubkey,
            signature,
        })
    }

    fn verify_peer_challenge(&self, ecdh_pubkey: &[u8; 65], signature: &[u8; 64]) -> Result<()> {
        let peer_cert = self
            .peer_certificate
            .as_ref()
            .ok_or(Error::InvalidState)?;

        let (ir, rr) = self.randoms()?;
        let transcript = challenge_transcript(self.role == Role::Responder, &ir, &rr, ecdh_pubkey);

        peer_cert
            .verify_device_signature(&transcript, signature)
            .map_err(|_| Error::Ake("Challenge signature verification failed".into()))
    }

    /// Source role: decide which exchange key this session gets.
    fn select_exchange_key(&self) -> Result<(u8, ExchangeKey, bool)> {
        let peer_cert = self
            .peer_certificate
            .as_ref()
            .ok_or(Error::InvalidState)?;

        if self.peer_unique_key_request {
            if !peer_cert.supports_session_exchange_key() {
                return Err(Error::InvalidKeyLabel(-1));
            }
            let (label, key) = self.store.fresh_exchange_key()?;
            return Ok((label, key, true));
        }

        match self.requested_key_label {
            Some(SHARED_KEY_LABEL) | None => {
                let (label, key) = self.store.shared_exchange_key()?;
                Ok((label, key, false))
            }
            Some(label) => {
                let key = self.store.exchange_key(label)?;
                Ok((label, key, false))
            }
        }
    }

    fn outcome(
        &self,
        key_label: u8,
        exchange_key: ExchangeKey,
        unique_key: bool,
    ) -> Result<AkeOutcome> {
        let (initiator_random, responder_random) = self.randoms()?;
        let auth_key = self.auth_key.clone().ok_or(Error::InvalidState)?;
        let peer_capabilities = self
            .peer_certificate
            .as_ref()
            .map(|c| c.capabilities)
            .ok_or(Error::InvalidState)?;

        Ok(AkeOutcome {
            exchange_key,
            key_label,
            auth_key,
            initiator_random,
            responder_random,
            peer_device_type: self.peer_device_type,
            peer_capabilities,
            unique_key,
        })
    }

    /// (initiator_random, responder_random) regardless of local role.
    fn randoms(&self) -> Result<([u8; 32], [u8; 32])> {
        let peer = self.peer_random.ok_or(Error::InvalidState)?;
        Ok(match self.role {
            Role::Initiator => (self.local_random, peer),
            Role::Responder => (peer, self.local_random),
        })
    }

    fn auth_key(&self) -> Result<Zeroizing<[u8; 32]>> {
        self.auth_key.clone().ok_or(Error::InvalidState)
    }
}

fn challenge_transcript(
    signer_is_initiator: bool,
    initiator_random: &[u8; 32],
    responder_random: &[u8; 32],
    ecdh_pubkey: &[u8],
) -> Vec<u8> {
    let mut transcript = Vec::with_capacity(64 + ecdh_pubkey.len());
    if signer_is_initiator {
        transcript.extend_from_slice(initiator_random);
        transcript.extend_from_slice(responder_random);
    } else {
        transcript.extend_from_slice(responder_random);
        transcript.extend_from_slice(initiator_random);
    }
    transcript.extend_from_slice(ecdh_pubkey);
    transcript
}
