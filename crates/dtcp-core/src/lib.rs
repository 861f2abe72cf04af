//! Core protocol engine for the DTCP-IP session manager.
//!
//! This crate implements the protocol state machines and wire formats:
//! - AKE message framing and the handshake state machine
//! - PCP (Protected Content Packet) header parsing and serialization
//! - Source and sink content pipelines (packetization, key derivation,
//!   encryption and reassembly)
//! - Packet descriptors handed across the manager API
//!
//! Everything here is sans-IO. Sockets and threads live in dtcp-transport
//! and dtcp-manager; this crate only consumes and produces byte slices,
//! which keeps the protocol logic deterministic and directly testable.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ake;
pub mod emi;
pub mod error;
pub mod packet;
pub mod pcp;
pub mod pipeline;

pub use ake::{AkeFrame, AkeMachine, AkeOutcome, DeviceType};
pub use emi::Emi;
pub use error::{Error, ErrorCode, Result};
pub use packet::Packet;
pub use pcp::PcpHeader;
pub use pipeline::{SinkPipeline, SourcePipeline};
