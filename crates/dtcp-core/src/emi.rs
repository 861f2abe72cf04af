//! EMI (Encryption Mode Indicator) copy-control modes.

use crate::{Error, Result};

/// Copy-control mode carried in every PCP header.
///
/// The EMI byte travels in the clear but is bound into the content key
/// derivation, so downgrading it in transit makes the packet undecryptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Emi {
    /// Copy never (0x0C).
    CopyNever = 0x0C,
    /// Copy one generation (0x0A).
    CopyOneGeneration = 0x0A,
    /// Move only, original must be rendered unusable (0x08).
    MoveOnly = 0x08,
    /// No more copies (0x06).
    NoMoreCopies = 0x06,
    /// Copy free with EPN (redistribution control) asserted (0x02).
    EpnCopyFree = 0x02,
    /// Copy free (0x00).
    CopyFree = 0x00,
}

impl Emi {
    /// Convert to the wire byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Convert from the wire byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x0C => Ok(Self::CopyNever),
            0x0A => Ok(Self::CopyOneGeneration),
            0x08 => Ok(Self::MoveOnly),
            0x06 => Ok(Self::NoMoreCopies),
            0x02 => Ok(Self::EpnCopyFree),
            0x00 => Ok(Self::CopyFree),
            _ => Err(Error::InvalidParam(format!(
                "Unknown EMI value {:#04x}",
                value
            ))),
        }
    }
}
