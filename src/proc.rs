//! # Encode/Decode Cursor
//!
//! This module provides the byte-oriented cursor the RPC engine uses to move
//! typed argument and result structures in and out of message buffers. A
//! [`Proc`] walks a logical byte stream made of a primary buffer followed by
//! an optional overflow buffer, in one of three modes:
//!
//! - **Encode**: write the structure into the stream; writing past the end of
//!   the primary buffer spills into a growable overflow buffer, which the
//!   caller can later claim and ship out of band.
//! - **Decode**: read the structure back; reading past the end of the primary
//!   buffer continues into a caller-supplied overflow buffer.
//! - **Free**: traverse the structure once more, releasing any heap memory
//!   that decoding allocated. Scalar codecs are no-ops in this mode.
//!
//! The same user function drives all three modes, so a structure's traversal
//! is written exactly once and stays symmetric by construction.
//!
//! ## Checksums
//!
//! When created with [`ProcHash::Crc64`], every processed byte feeds a
//! CRC-64/ECMA digest. [`Proc::flush`] appends the 8-byte digest in Encode
//! mode and reads and verifies it in Decode mode.

use crate::error::{Result, ReturnCode};
use crc::{Crc, CRC_64_ECMA_182};

/// CRC-64/ECMA engine shared by the proc cursor and the header codec.
pub(crate) static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Cursor mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcOp {
    /// Serialize a structure into the stream.
    Encode,
    /// Reconstruct a structure from the stream.
    Decode,
    /// Release heap memory allocated during a previous decode.
    Free,
}

/// Checksum policy for a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcHash {
    /// Maintain a CRC-64/ECMA digest over the processed bytes.
    Crc64,
    /// No integrity digest.
    NoHash,
}

/// Allocate a zeroed message buffer of the given size.
pub fn buf_alloc(size: usize) -> Vec<u8> {
    vec![0u8; size]
}

/// Byte cursor over a primary buffer with overflow escalation.
///
/// The cursor borrows the primary buffer for its lifetime; the overflow
/// buffer is owned and can be claimed with [`Proc::take_extra_buf`] once
/// encoding is finished (the claimant then keeps it alive for as long as
/// anything references it, e.g. a registered bulk region).
pub struct Proc<'a> {
    buf: &'a mut [u8],
    extra: Vec<u8>,
    off: usize,
    op: ProcOp,
    digest: Option<crc::Digest<'static, u64>>,
}

impl<'a> Proc<'a> {
    /// Create a cursor over a primary buffer.
    pub fn create(buf: &'a mut [u8], op: ProcOp, hash: ProcHash) -> Proc<'a> {
        Proc {
            buf,
            extra: Vec::new(),
            off: 0,
            op,
            digest: match hash {
                ProcHash::Crc64 => Some(CRC64.digest()),
                ProcHash::NoHash => None,
            },
        }
    }

    /// Create a decode cursor whose stream continues into `extra` past the
    /// end of the primary buffer. Used on the receive side of payloads that
    /// overflowed into a bulk-transferred buffer.
    pub fn create_with_extra(
        buf: &'a mut [u8],
        extra: Vec<u8>,
        op: ProcOp,
        hash: ProcHash,
    ) -> Proc<'a> {
        let mut proc = Proc::create(buf, op, hash);
        proc.extra = extra;
        proc
    }

    /// Cursor mode.
    pub fn op(&self) -> ProcOp {
        self.op
    }

    /// Bytes processed so far across primary and overflow.
    pub fn size(&self) -> usize {
        self.off
    }

    /// Bytes spilled into the overflow buffer.
    pub fn extra_size(&self) -> usize {
        self.extra.len()
    }

    /// Whether encoding escalated past the primary buffer.
    pub fn has_extra(&self) -> bool {
        !self.extra.is_empty()
    }

    /// Claim ownership of the overflow buffer.
    ///
    /// After this call the cursor no longer tracks the overflow bytes; the
    /// caller is responsible for keeping them alive while any bulk handle
    /// still refers to them.
    pub fn take_extra_buf(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.extra)
    }

    /// Raw write into the logical stream, spilling into the overflow buffer
    /// when the primary buffer is exhausted.
    fn write(&mut self, data: &[u8]) -> Result<()> {
        if let Some(d) = self.digest.as_mut() {
            d.update(data);
        }
        let mut copied = 0;
        while copied < data.len() {
            let pos = self.off + copied;
            if pos < self.buf.len() {
                let n = (self.buf.len() - pos).min(data.len() - copied);
                self.buf[pos..pos + n].copy_from_slice(&data[copied..copied + n]);
                copied += n;
            } else {
                debug_assert_eq!(pos - self.buf.len(), self.extra.len());
                self.extra.extend_from_slice(&data[copied..]);
                copied = data.len();
            }
        }
        self.off += data.len();
        Ok(())
    }

    /// Raw read from the logical stream.
    fn read(&mut self, out: &mut [u8]) -> Result<()> {
        let total = self.buf.len() + self.extra.len();
        if self.off + out.len() > total {
            return Err(ReturnCode::SizeError);
        }
        let mut copied = 0;
        while copied < out.len() {
            let pos = self.off + copied;
            if pos < self.buf.len() {
                let n = (self.buf.len() - pos).min(out.len() - copied);
                out[copied..copied + n].copy_from_slice(&self.buf[pos..pos + n]);
                copied += n;
            } else {
                let epos = pos - self.buf.len();
                let n = out.len() - copied;
                out[copied..copied + n].copy_from_slice(&self.extra[epos..epos + n]);
                copied += n;
            }
        }
        if let Some(d) = self.digest.as_mut() {
            d.update(out);
        }
        self.off += out.len();
        Ok(())
    }

    /// Process a fixed-size scalar as little-endian bytes.
    fn process_scalar(&mut self, bytes: &mut [u8]) -> Result<()> {
        match self.op {
            ProcOp::Encode => self.write(bytes),
            ProcOp::Decode => self.read(bytes),
            ProcOp::Free => Ok(()),
        }
    }

    /// Process a `u8`.
    pub fn process_u8(&mut self, v: &mut u8) -> Result<()> {
        let mut bytes = [*v];
        self.process_scalar(&mut bytes)?;
        *v = bytes[0];
        Ok(())
    }

    /// Process a `u32` (little-endian on the wire).
    pub fn process_u32(&mut self, v: &mut u32) -> Result<()> {
        let mut bytes = v.to_le_bytes();
        self.process_scalar(&mut bytes)?;
        *v = u32::from_le_bytes(bytes);
        Ok(())
    }

    /// Process an `i32` (little-endian on the wire).
    pub fn process_i32(&mut self, v: &mut i32) -> Result<()> {
        let mut bytes = v.to_le_bytes();
        self.process_scalar(&mut bytes)?;
        *v = i32::from_le_bytes(bytes);
        Ok(())
    }

    /// Process a `u64` (little-endian on the wire).
    pub fn process_u64(&mut self, v: &mut u64) -> Result<()> {
        let mut bytes = v.to_le_bytes();
        self.process_scalar(&mut bytes)?;
        *v = u64::from_le_bytes(bytes);
        Ok(())
    }

    /// Process a fixed-size byte region in place.
    pub fn process_raw(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.op {
            ProcOp::Encode => self.write(buf),
            ProcOp::Decode => self.read(buf),
            ProcOp::Free => Ok(()),
        }
    }

    /// Process a length-prefixed byte vector.
    ///
    /// Encode writes a `u64` length followed by the bytes; Decode sizes the
    /// vector from the prefix; Free releases the vector's heap allocation.
    pub fn process_bytes(&mut self, v: &mut Vec<u8>) -> Result<()> {
        match self.op {
            ProcOp::Encode => {
                let mut len = v.len() as u64;
                self.process_u64(&mut len)?;
                self.write(v)
            }
            ProcOp::Decode => {
                let mut len = 0u64;
                self.process_u64(&mut len)?;
                let total = self.buf.len() + self.extra.len();
                if self.off + len as usize > total {
                    return Err(ReturnCode::SizeError);
                }
                let mut data = vec![0u8; len as usize];
                self.read(&mut data)?;
                *v = data;
                Ok(())
            }
            ProcOp::Free => {
                *v = Vec::new();
                Ok(())
            }
        }
    }

    /// Finalize the checksum.
    ///
    /// In Encode mode the 8-byte CRC-64 digest of everything processed so far
    /// is appended to the stream; in Decode mode it is read back and compared,
    /// failing with `CHECKSUM_ERROR` on mismatch. Without a digest, or in
    /// Free mode, this is a no-op.
    pub fn flush(&mut self) -> Result<()> {
        let digest = match self.digest.take() {
            Some(d) => d,
            None => return Ok(()),
        };
        match self.op {
            ProcOp::Encode => {
                let sum = digest.finalize();
                self.write(&sum.to_le_bytes())
            }
            ProcOp::Decode => {
                let expected = digest.finalize();
                let mut bytes = [0u8; 8];
                self.read(&mut bytes)?;
                if u64::from_le_bytes(bytes) != expected {
                    return Err(ReturnCode::ChecksumError);
                }
                Ok(())
            }
            ProcOp::Free => Ok(()),
        }
    }
}
