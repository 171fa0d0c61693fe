//! Frame and scalar encoding.
//!
//! Every message travels as a 4-byte big-endian length covering the tag and
//! body, a 1-byte tag, then the tag-specific body. Strings are a 2-byte
//! big-endian length followed by UTF-8 bytes; fingerprints are two 64-bit
//! big-endian words; file sizes are 8 bytes unsigned big-endian; file times
//! are their low and high 32-bit halves, preserved verbatim.

use std::io::{Read, Write};

use fileio::FileStamp;
use hashdb::Fingerprint;

use crate::error::{ProtocolError, ProtocolResult};

/// Protocol version. Peers with differing versions fall back to
/// non-server copy behavior.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default TCP port for client and server.
pub const DEFAULT_PORT: u16 = 18099;

/// Upper bound on one frame: a bulk chunk plus headroom for its framing.
pub const MAX_FRAME: u32 = 4 * 1024 * 1024;

/// Writes one frame.
pub fn write_frame(w: &mut impl Write, tag: u8, body: &[u8]) -> ProtocolResult<()> {
    let len = u32::try_from(body.len() + 1).map_err(|_| ProtocolError::FrameLength(u32::MAX))?;
    if len > MAX_FRAME {
        return Err(ProtocolError::FrameLength(len));
    }
    w.write_all(&len.to_be_bytes())?;
    w.write_all(&[tag])?;
    w.write_all(body)?;
    Ok(())
}

/// Reads one frame, returning its tag and body.
pub fn read_frame(r: &mut impl Read) -> ProtocolResult<(u8, Vec<u8>)> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes);
    if len == 0 || len > MAX_FRAME {
        return Err(ProtocolError::FrameLength(len));
    }
    let mut tag = [0u8; 1];
    r.read_exact(&mut tag)?;
    let mut body = vec![0u8; (len - 1) as usize];
    r.read_exact(&mut body)?;
    Ok((tag[0], body))
}

/// Body writer with the protocol's scalar vocabulary.
#[derive(Default)]
pub struct BodyWriter {
    buf: Vec<u8>,
}

impl BodyWriter {
    /// Creates an empty body.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Finishes and returns the encoded body.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Appends one byte.
    pub fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Appends a 16-bit big-endian value.
    pub fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Appends a 32-bit big-endian value.
    pub fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Appends a 64-bit big-endian value.
    pub fn u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Appends a length-prefixed UTF-8 string. Strings longer than the
    /// 16-bit length prefix allows are rejected rather than truncated, so
    /// a path can never silently travel as a shorter one.
    pub fn string(&mut self, value: &str) -> ProtocolResult<()> {
        let bytes = value.as_bytes();
        let len = u16::try_from(bytes.len())
            .map_err(|_| ProtocolError::StringTooLong { len: bytes.len() })?;
        self.u16(len);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Appends a 16-byte fingerprint.
    pub fn fingerprint(&mut self, value: Fingerprint) {
        self.buf.extend_from_slice(&value.to_bytes());
    }

    /// Appends a file time as its low and high halves.
    pub fn stamp(&mut self, value: FileStamp) {
        self.u32(value.lo());
        self.u32(value.hi());
    }

    /// Appends raw bytes without framing; used for bulk payloads.
    pub fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

/// Body reader over one received frame.
pub struct BodyReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    /// Wraps a message body.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> ProtocolResult<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(ProtocolError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Reads one byte.
    pub fn u8(&mut self) -> ProtocolResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a 16-bit big-endian value.
    pub fn u16(&mut self) -> ProtocolResult<u16> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2)?);
        Ok(u16::from_be_bytes(buf))
    }

    /// Reads a 32-bit big-endian value.
    pub fn u32(&mut self) -> ProtocolResult<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    /// Reads a 64-bit big-endian value.
    pub fn u64(&mut self) -> ProtocolResult<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn string(&mut self) -> ProtocolResult<String> {
        let len = usize::from(self.u16()?);
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::BadString)
    }

    /// Reads a 16-byte fingerprint.
    pub fn fingerprint(&mut self) -> ProtocolResult<Fingerprint> {
        let mut buf = [0u8; 16];
        buf.copy_from_slice(self.take(16)?);
        Ok(Fingerprint::from_bytes(buf))
    }

    /// Reads a file time from its low and high halves.
    pub fn stamp(&mut self) -> ProtocolResult<FileStamp> {
        let lo = self.u32()?;
        let hi = self.u32()?;
        Ok(FileStamp::from_parts(lo, hi))
    }

    /// Consumes the remainder of the body as raw bytes.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    /// Verifies the whole body was consumed.
    pub fn finish(self) -> ProtocolResult<()> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(ProtocolError::TrailingBytes)
        }
    }
}
