//! # Message Header Codec
//!
//! Fixed-layout request and response headers, encoded little-endian at the
//! front of every short message payload.
//!
//! Request header layout:
//!
//! | offset | size | field |
//! |--------|------|-------|
//! | 0      | 4    | magic |
//! | 4      | 4    | protocol version |
//! | 8      | 4    | procedure id |
//! | 12     | 4    | flags (bit 0 = has_overflow) |
//! | 16     | K    | extra bulk handle (K = transport serialize size; zero-filled when absent) |
//! | 16 + K | 8    | CRC-64 over the preceding bytes |
//!
//! Response header layout: magic (4), return code (4), CRC-64 (8).

use tracing::warn;

use crate::error::{Result, ReturnCode};
use crate::na::{MemHandle, NaClass};
use crate::proc::CRC64;

/// Marker identifying runtime messages on the wire.
pub const HEADER_MAGIC: u32 = 0x4847_0201;

/// Flag bit: the request's payload overflowed into a bulk region whose
/// handle travels in the header.
pub const REQUEST_FLAG_OVERFLOW: u32 = 1;

const FIXED_REQUEST_PREFIX: usize = 16;
const CHECKSUM_SIZE: usize = 8;
const RESPONSE_PREFIX: usize = 8;

/// Request header contents.
#[derive(Debug)]
pub struct RequestHeader {
    pub protocol_version: u32,
    pub id: u32,
    pub flags: u32,
    pub extra_handle: Option<MemHandle>,
}

/// Response header contents.
#[derive(Debug)]
pub struct ResponseHeader {
    pub magic: u32,
    pub return_code: ReturnCode,
}

/// Total encoded size of a request header for the active transport.
pub fn request_get_size(na: &dyn NaClass) -> usize {
    FIXED_REQUEST_PREFIX + na.mem_handle_get_serialize_size() + CHECKSUM_SIZE
}

/// Total encoded size of a response header.
pub fn response_get_size() -> usize {
    RESPONSE_PREFIX + CHECKSUM_SIZE
}

/// Populate a request header for the given procedure, carrying the overflow
/// bulk handle when the payload escalated out of band.
pub fn request_init(id: u32, extra_handle: Option<&MemHandle>) -> RequestHeader {
    RequestHeader {
        protocol_version: crate::protocol_version_word(),
        id,
        flags: if extra_handle.is_some() {
            REQUEST_FLAG_OVERFLOW
        } else {
            0
        },
        extra_handle: extra_handle.cloned(),
    }
}

/// Serialize a request header into the front of `buf`.
pub fn request_encode(buf: &mut [u8], header: &RequestHeader, na: &dyn NaClass) -> Result<()> {
    let handle_size = na.mem_handle_get_serialize_size();
    let total = FIXED_REQUEST_PREFIX + handle_size + CHECKSUM_SIZE;
    if buf.len() < total {
        return Err(ReturnCode::SizeError);
    }
    buf[0..4].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
    buf[4..8].copy_from_slice(&header.protocol_version.to_le_bytes());
    buf[8..12].copy_from_slice(&header.id.to_le_bytes());
    buf[12..16].copy_from_slice(&header.flags.to_le_bytes());
    let handle_region = &mut buf[FIXED_REQUEST_PREFIX..FIXED_REQUEST_PREFIX + handle_size];
    handle_region.fill(0);
    if let Some(handle) = &header.extra_handle {
        na.mem_handle_serialize(handle_region, handle)?;
    }
    let checksum = CRC64.checksum(&buf[..FIXED_REQUEST_PREFIX + handle_size]);
    buf[FIXED_REQUEST_PREFIX + handle_size..total].copy_from_slice(&checksum.to_le_bytes());
    Ok(())
}

/// Decode and verify a request header from the front of `buf`.
///
/// Magic and checksum mismatches fail with `CHECKSUM_ERROR`; a protocol
/// version skew is tolerated but logged.
pub fn request_decode(buf: &[u8], na: &dyn NaClass) -> Result<RequestHeader> {
    let handle_size = na.mem_handle_get_serialize_size();
    let total = FIXED_REQUEST_PREFIX + handle_size + CHECKSUM_SIZE;
    if buf.len() < total {
        return Err(ReturnCode::SizeError);
    }
    let word = |i: usize| u32::from_le_bytes(buf[i..i + 4].try_into().expect("4 bytes"));
    if word(0) != HEADER_MAGIC {
        return Err(ReturnCode::ChecksumError);
    }
    let expected = CRC64.checksum(&buf[..FIXED_REQUEST_PREFIX + handle_size]);
    let carried = u64::from_le_bytes(
        buf[FIXED_REQUEST_PREFIX + handle_size..total]
            .try_into()
            .expect("8 bytes"),
    );
    if carried != expected {
        return Err(ReturnCode::ChecksumError);
    }
    let protocol_version = word(4);
    if protocol_version != crate::protocol_version_word() {
        warn!(
            remote = protocol_version,
            local = crate::protocol_version_word(),
            "protocol version skew"
        );
    }
    let flags = word(12);
    let extra_handle = if flags & REQUEST_FLAG_OVERFLOW != 0 {
        Some(na.mem_handle_deserialize(
            &buf[FIXED_REQUEST_PREFIX..FIXED_REQUEST_PREFIX + handle_size],
        )?)
    } else {
        None
    };
    Ok(RequestHeader {
        protocol_version,
        id: word(8),
        flags,
        extra_handle,
    })
}

/// Populate a response header.
pub fn response_init(return_code: ReturnCode) -> ResponseHeader {
    ResponseHeader {
        magic: HEADER_MAGIC,
        return_code,
    }
}

/// Serialize a response header into the front of `buf`.
pub fn response_encode(buf: &mut [u8], header: &ResponseHeader) -> Result<()> {
    if buf.len() < response_get_size() {
        return Err(ReturnCode::SizeError);
    }
    buf[0..4].copy_from_slice(&header.magic.to_le_bytes());
    buf[4..8].copy_from_slice(&header.return_code.to_u32().to_le_bytes());
    let checksum = CRC64.checksum(&buf[..RESPONSE_PREFIX]);
    buf[RESPONSE_PREFIX..response_get_size()].copy_from_slice(&checksum.to_le_bytes());
    Ok(())
}

/// Decode a response header, verifying its checksum.
pub fn response_decode(buf: &[u8]) -> Result<ResponseHeader> {
    if buf.len() < response_get_size() {
        return Err(ReturnCode::SizeError);
    }
    let expected = CRC64.checksum(&buf[..RESPONSE_PREFIX]);
    let carried = u64::from_le_bytes(
        buf[RESPONSE_PREFIX..response_get_size()]
            .try_into()
            .expect("8 bytes"),
    );
    if carried != expected {
        return Err(ReturnCode::ChecksumError);
    }
    Ok(ResponseHeader {
        magic: u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes")),
        return_code: ReturnCode::from_u32(u32::from_le_bytes(
            buf[4..8].try_into().expect("4 bytes"),
        )),
    })
}

/// Verify a decoded response header's identity marker.
pub fn response_verify(header: &ResponseHeader) -> Result<()> {
    if header.magic != HEADER_MAGIC {
        return Err(ReturnCode::ChecksumError);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::na::tcp::TcpClass;
    use crate::na::MemAttr;

    fn class() -> TcpClass {
        TcpClass::initialize(None, false).unwrap()
    }

    #[test]
    fn test_request_round_trip_without_overflow() {
        let na = class();
        let mut buf = vec![0u8; request_get_size(&na)];
        let header = request_init(0xfeed, None);
        request_encode(&mut buf, &header, &na).unwrap();

        let decoded = request_decode(&buf, &na).unwrap();
        assert_eq!(decoded.id, 0xfeed);
        assert_eq!(decoded.flags, 0);
        assert!(decoded.extra_handle.is_none());
    }

    #[test]
    fn test_request_round_trip_with_overflow_handle() {
        let na = class();
        let region = vec![0u8; 1024];
        let handle = na.mem_handle_create(&region, MemAttr::ReadOnly).unwrap();

        let mut buf = vec![0u8; request_get_size(&na)];
        let header = request_init(7, Some(&handle));
        request_encode(&mut buf, &header, &na).unwrap();

        let decoded = request_decode(&buf, &na).unwrap();
        assert_eq!(decoded.flags & REQUEST_FLAG_OVERFLOW, REQUEST_FLAG_OVERFLOW);
        let remote = decoded.extra_handle.unwrap();
        assert!(remote.is_remote());
        assert_eq!(remote.len(), 1024);
        assert_eq!(remote.attr(), MemAttr::ReadOnly);
    }

    #[test]
    fn test_request_corruption_is_checksum_error() {
        let na = class();
        let mut buf = vec![0u8; request_get_size(&na)];
        request_encode(&mut buf, &request_init(1, None), &na).unwrap();
        buf[9] ^= 0x40;
        assert_eq!(
            request_decode(&buf, &na).unwrap_err(),
            ReturnCode::ChecksumError
        );
    }

    #[test]
    fn test_response_round_trip_and_verify() {
        let mut buf = vec![0u8; response_get_size()];
        response_encode(&mut buf, &response_init(ReturnCode::NoMatch)).unwrap();

        let decoded = response_decode(&buf).unwrap();
        response_verify(&decoded).unwrap();
        assert_eq!(decoded.return_code, ReturnCode::NoMatch);
    }

    #[test]
    fn test_response_bad_magic_fails_verify() {
        let header = ResponseHeader {
            magic: 0x1111_2222,
            return_code: ReturnCode::Success,
        };
        assert_eq!(response_verify(&header), Err(ReturnCode::ChecksumError));
    }
}
