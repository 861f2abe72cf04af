//! Transport layer errors.

use thiserror::Error;

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection to the peer failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Could not bind a listener.
    #[error("Bind failed: {0}")]
    BindFailed(String),

    /// Peer closed the connection.
    #[error("Connection closed by peer")]
    Disconnected,

    /// Received frame length exceeds the cap.
    #[error("Frame of {0} bytes exceeds the maximum")]
    FrameTooLarge(usize),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Error> for dtcp_core::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::ConnectionFailed(_) => dtcp_core::Error::ServerNotReachable,
            Error::Disconnected => dtcp_core::Error::Disconnected,
            Error::BindFailed(msg) => dtcp_core::Error::InvalidParam(msg),
            Error::FrameTooLarge(n) => {
                dtcp_core::Error::InvalidFrame(format!("Frame of {} bytes exceeds the maximum", n))
            }
            Error::Io(e) => dtcp_core::Error::General(e.to_string()),
        }
    }
}
