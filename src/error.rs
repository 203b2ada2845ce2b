//! # Return Codes and Error Propagation
//!
//! This module defines the single return-code enumeration used by every
//! fallible operation in the runtime, together with the crate-wide `Result`
//! alias built on top of it.
//!
//! ## Design Principles
//!
//! - **One taxonomy**: the transport, the bulk layer, the proc engine and the
//!   RPC engine all report through the same set of codes, so a status can be
//!   carried across layer boundaries without translation.
//! - **Never abort**: errors are delivered through return values or through a
//!   failed completion observed at wait time; the runtime itself does not
//!   panic on transport failure.
//! - **Wire-stable**: codes cross the wire in response headers, so each code
//!   has a fixed numeric value and a stable printable name.

use thiserror::Error;

/// Result alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, ReturnCode>;

/// Status codes reported by all runtime operations.
///
/// The `Display` implementation (via `thiserror`) yields the stable uppercase
/// name of the code, which is also what [`error_to_string`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u32)]
pub enum ReturnCode {
    /// Operation completed successfully.
    #[error("SUCCESS")]
    Success = 0,

    /// Generic failure, including operations invoked before `init` and
    /// cancellations (callers distinguish the latter by having asked for it).
    #[error("FAIL")]
    Fail = 1,

    /// A bounded wait or progress call expired without an event.
    #[error("TIMEOUT")]
    Timeout = 2,

    /// An argument did not satisfy the operation's contract.
    #[error("INVALID_PARAM")]
    InvalidParam = 3,

    /// A buffer was too small for the data it had to carry.
    #[error("SIZE_ERROR")]
    SizeError = 4,

    /// Memory allocation failed; partial state has been unwound.
    #[error("NOMEM_ERROR")]
    NomemError = 5,

    /// The transport reported a protocol-level failure.
    #[error("PROTOCOL_ERROR")]
    ProtocolError = 6,

    /// No matching registration or peer object was found.
    #[error("NO_MATCH")]
    NoMatch = 7,

    /// Header magic or checksum verification failed.
    #[error("CHECKSUM_ERROR")]
    ChecksumError = 8,

    /// A one-sided operation targeted a region without the required access.
    #[error("PERMISSION_ERROR")]
    PermissionError = 9,
}

impl ReturnCode {
    /// Stable uppercase name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnCode::Success => "SUCCESS",
            ReturnCode::Fail => "FAIL",
            ReturnCode::Timeout => "TIMEOUT",
            ReturnCode::InvalidParam => "INVALID_PARAM",
            ReturnCode::SizeError => "SIZE_ERROR",
            ReturnCode::NomemError => "NOMEM_ERROR",
            ReturnCode::ProtocolError => "PROTOCOL_ERROR",
            ReturnCode::NoMatch => "NO_MATCH",
            ReturnCode::ChecksumError => "CHECKSUM_ERROR",
            ReturnCode::PermissionError => "PERMISSION_ERROR",
        }
    }

    /// Numeric value used when a code crosses the wire (response headers).
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// Decode a wire value back into a code.
    ///
    /// Unknown values map to [`ReturnCode::ProtocolError`]: a peer speaking a
    /// newer revision must not be interpreted as success.
    pub fn from_u32(value: u32) -> ReturnCode {
        match value {
            0 => ReturnCode::Success,
            1 => ReturnCode::Fail,
            2 => ReturnCode::Timeout,
            3 => ReturnCode::InvalidParam,
            4 => ReturnCode::SizeError,
            5 => ReturnCode::NomemError,
            6 => ReturnCode::ProtocolError,
            7 => ReturnCode::NoMatch,
            8 => ReturnCode::ChecksumError,
            9 => ReturnCode::PermissionError,
            _ => ReturnCode::ProtocolError,
        }
    }
}

/// Convert a return code to its stable printable name.
pub fn error_to_string(code: ReturnCode) -> &'static str {
    code.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_to_string_is_stable() {
        assert_eq!(error_to_string(ReturnCode::Success), "SUCCESS");
        assert_eq!(error_to_string(ReturnCode::NomemError), "NOMEM_ERROR");
        assert_eq!(error_to_string(ReturnCode::ChecksumError), "CHECKSUM_ERROR");
    }

    #[test]
    fn test_wire_round_trip() {
        for code in [
            ReturnCode::Success,
            ReturnCode::Fail,
            ReturnCode::Timeout,
            ReturnCode::InvalidParam,
            ReturnCode::SizeError,
            ReturnCode::NomemError,
            ReturnCode::ProtocolError,
            ReturnCode::NoMatch,
            ReturnCode::ChecksumError,
            ReturnCode::PermissionError,
        ] {
            assert_eq!(ReturnCode::from_u32(code.to_u32()), code);
        }
    }

    #[test]
    fn test_unknown_wire_value_is_protocol_error() {
        assert_eq!(ReturnCode::from_u32(4096), ReturnCode::ProtocolError);
    }
}
