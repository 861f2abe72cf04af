//! Error types for protocol and manager operations.

use thiserror::Error;

/// Result type alias for protocol operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Protocol and manager operation errors.
///
/// The first group of variants corresponds one-to-one with the numeric
/// result codes reported at the manager API boundary (see [`ErrorCode`]);
/// the remainder are internal conditions that fold into one of those codes
/// via [`Error::code`].
#[derive(Debug, Error)]
pub enum Error {
    /// Manager not initialized, or handle refers to a deleted session.
    #[error("DTCP manager not initialized")]
    NotInitialized,

    /// Invalid parameter supplied.
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    /// General unspecified error.
    #[error("General error: {0}")]
    General(String),

    /// Memory allocation failure.
    #[error("Memory allocation failure")]
    MemoryAlloc,

    /// Too many active sessions.
    #[error("Too many active sessions")]
    OutOfSessions,

    /// Invalid device certificate.
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Authentication and key exchange failed.
    #[error("AKE failed: {0}")]
    Ake(String),

    /// Content key derivation or packet protection failed.
    #[error("Content key error: {0}")]
    ContentKey(String),

    /// Invalid exchange key label supplied.
    #[error("Invalid exchange key label: {0}")]
    InvalidKeyLabel(i32),

    /// Invalid IP address supplied.
    #[error("Invalid IP address: {0}")]
    InvalidIpAddress(String),

    /// Peer device not reachable.
    #[error("DTCP server not reachable")]
    ServerNotReachable,

    /// Invalid wire frame.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Insufficient data to parse a frame.
    #[error("Insufficient data: need {0} bytes")]
    InsufficientData(usize),

    /// Invalid state transition.
    #[error("Invalid state transition")]
    InvalidState,

    /// Peer closed the connection.
    #[error("Connection closed by peer")]
    Disconnected,

    /// Cryptographic error.
    #[error("Crypto error: {0}")]
    Crypto(#[from] dtcp_crypto::Error),
}

impl Error {
    /// The numeric result code reported at the manager API boundary.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotInitialized => ErrorCode::NotInitialized,
            Error::InvalidParam(_) => ErrorCode::InvalidParam,
            Error::General(_) => ErrorCode::General,
            Error::MemoryAlloc => ErrorCode::MemoryAlloc,
            Error::OutOfSessions => ErrorCode::OutOfSessions,
            Error::InvalidCertificate(_) => ErrorCode::InvalidCertificate,
            Error::Ake(_) => ErrorCode::Ake,
            Error::ContentKey(_) => ErrorCode::ContentKeyRequired,
            Error::InvalidKeyLabel(_) => ErrorCode::InvalidKeyLabel,
            Error::InvalidIpAddress(_) => ErrorCode::InvalidIpAddress,
            Error::ServerNotReachable | Error::Disconnected => ErrorCode::ServerNotReachable,
            Error::InvalidFrame(_) | Error::InsufficientData(_) | Error::InvalidState => {
                ErrorCode::General
            }
            Error::Crypto(dtcp_crypto::Error::Certificate(_)) => ErrorCode::InvalidCertificate,
            Error::Crypto(dtcp_crypto::Error::Decryption(_)) => ErrorCode::ContentKeyRequired,
            Error::Crypto(_) => ErrorCode::Ake,
        }
    }
}

/// Numeric result codes reported at the manager API boundary.
///
/// Values match the C `dtcp_result_t` enumeration so callers porting from
/// the native library see the same codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// Operation successful (0).
    Success = 0,
    /// Manager not initialized (-1).
    NotInitialized = -1,
    /// Invalid parameter supplied (-2).
    InvalidParam = -2,
    /// General unspecified error (-3).
    General = -3,
    /// Memory allocation failure (-4).
    MemoryAlloc = -4,
    /// Too many active sessions (-5).
    OutOfSessions = -5,
    /// Invalid certificate (-6).
    InvalidCertificate = -6,
    /// Authentication/key exchange error (-7).
    Ake = -7,
    /// Content key error (-8).
    ContentKeyRequired = -8,
    /// Invalid exchange key label supplied (-9).
    InvalidKeyLabel = -9,
    /// Invalid IP address supplied (-10).
    InvalidIpAddress = -10,
    /// Peer not reachable (-11).
    ServerNotReachable = -11,
}

impl ErrorCode {
    /// The numeric value of this code.
    pub fn to_i32(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_values_match_native_enum() {
        assert_eq!(ErrorCode::Success.to_i32(), 0);
        assert_eq!(ErrorCode::NotInitialized.to_i32(), -1);
        assert_eq!(ErrorCode::InvalidParam.to_i32(), -2);
        assert_eq!(ErrorCode::General.to_i32(), -3);
        assert_eq!(ErrorCode::MemoryAlloc.to_i32(), -4);
        assert_eq!(ErrorCode::OutOfSessions.to_i32(), -5);
        assert_eq!(ErrorCode::InvalidCertificate.to_i32(), -6);
        assert_eq!(ErrorCode::Ake.to_i32(), -7);
        assert_eq!(ErrorCode::ContentKeyRequired.to_i32(), -8);
        assert_eq!(ErrorCode::InvalidKeyLabel.to_i32(), -9);
        assert_eq!(ErrorCode::InvalidIpAddress.to_i32(), -10);
        assert_eq!(ErrorCode::ServerNotReachable.to_i32(), -11);
    }

    #[test]
    fn test_internal_errors_fold_to_api_codes() {
        assert_eq!(
            Error::InvalidFrame("bad magic".into()).code(),
            ErrorCode::General
        );
        assert_eq!(Error::Disconnected.code(), ErrorCode::ServerNotReachable);
        assert_eq!(
            Error::Crypto(dtcp_crypto::Error::Decryption("tag".into())).code(),
            ErrorCode::ContentKeyRequired
        );
        assert_eq!(
            Error::Crypto(dtcp_crypto::Error::Signature("sig".into())).code(),
            ErrorCode::Ake
        );
    }
}
