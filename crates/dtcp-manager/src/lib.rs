//! DTCP-IP session manager.
//!
//! [`DtcpManager`] is the integration surface: it owns the bounded session
//! table, runs AKE listener threads, drives handshakes over a pluggable
//! transport and routes packet processing to per-session pipelines. The
//! protocol logic itself lives in `dtcp-core`; the trust module behind
//! `dtcp-crypto`'s `DeviceKeyStore`; sockets behind `dtcp-transport`.
//!
//! ```no_run
//! use std::sync::Arc;
//! use dtcp_crypto::{SoftwareKeyStore, TrustAnchor};
//! use dtcp_manager::{DtcpManager, ManagerConfig};
//! use dtcp_transport::TcpTransport;
//!
//! # fn main() -> dtcp_core::Result<()> {
//! let anchor = TrustAnchor::generate().map_err(dtcp_core::Error::from)?;
//! let store = SoftwareKeyStore::provision(&anchor, [0, 0, 0, 0, 1], 0)
//!     .map_err(dtcp_core::Error::from)?;
//!
//! let manager = DtcpManager::new(
//!     Arc::new(store),
//!     Arc::new(TcpTransport::new()),
//!     ManagerConfig::default(),
//! );
//! manager.initialize()?;
//! manager.start_source("0.0.0.0", 8000)?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod driver;
mod listener;
mod manager;
mod session;
mod table;

pub use manager::{
    DtcpManager, ManagerConfig, LOG_LEVEL_DEBUG, LOG_LEVEL_ERROR, LOG_LEVEL_INFO, LOG_LEVEL_TRACE,
    LOG_LEVEL_WARN,
};
pub use session::SessionInfo;
pub use table::SessionHandle;
