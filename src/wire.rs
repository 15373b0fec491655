//! Little-endian primitives shared by the manifest and chunk codecs.
//!
//! Every read is bounds-checked; running off the end of the input is a
//! [`ChunkSyncError::Format`] error, never a panic.

use crate::error::{ChunkSyncError, Result};
use crate::types::Guid;

/// Cursor over an in-memory byte slice.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(ChunkSyncError::Format(format!(
                "seek to {} past end of {}-byte buffer",
                pos,
                self.data.len()
            )));
        }
        self.pos = pos;
        Ok(())
    }

    /// Moves to the end of a size-prefixed section that started at `start`.
    ///
    /// Sections may carry trailing fields this reader does not know about; those are
    /// skipped. A section that claims to be shorter than what was already parsed is
    /// corrupt.
    pub(crate) fn finish_section(&mut self, start: usize, size: u32, what: &str) -> Result<()> {
        let end = start
            .checked_add(size as usize)
            .ok_or_else(|| ChunkSyncError::Format(format!("{} size overflow", what)))?;
        if end < self.pos {
            return Err(ChunkSyncError::Format(format!(
                "{} declares {} bytes but {} were parsed",
                what,
                size,
                self.pos - start
            )));
        }
        self.seek(end)
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(ChunkSyncError::Format(format!(
                "truncated input: need {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn guid(&mut self) -> Result<Guid> {
        Ok(Guid::from_le_bytes(self.array()?))
    }

    /// Reads an element count and rejects counts that cannot fit in the remaining
    /// input, so callers never pre-allocate from an untrusted number.
    pub(crate) fn count(&mut self, min_element_size: usize, what: &str) -> Result<usize> {
        let count = self.u32()? as usize;
        if count.saturating_mul(min_element_size.max(1)) > self.remaining() {
            return Err(ChunkSyncError::Format(format!(
                "{} count {} exceeds remaining {} bytes",
                what,
                count,
                self.remaining()
            )));
        }
        Ok(count)
    }

    /// Length-prefixed string: positive length is single-byte text, negative length
    /// is UTF-16LE code units. Both include a NUL terminator.
    pub(crate) fn fstring(&mut self) -> Result<String> {
        let len = self.i32()? as i64;
        match len {
            0 => Ok(String::new()),
            n if n > 0 => {
                let bytes = self.take(n as usize)?;
                let text = bytes.strip_suffix(&[0]).unwrap_or(bytes);
                Ok(text.iter().map(|&b| b as char).collect())
            }
            n => {
                let units = (-n) as usize;
                let bytes = self.take(units.saturating_mul(2))?;
                let mut code_units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                if code_units.last() == Some(&0) {
                    code_units.pop();
                }
                String::from_utf16(&code_units)
                    .map_err(|e| ChunkSyncError::Format(format!("invalid UTF-16 string: {}", e)))
            }
        }
    }
}

pub(crate) fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_guid(buf: &mut Vec<u8>, guid: &Guid) {
    buf.extend_from_slice(&guid.to_le_bytes());
}

/// Overwrites a previously reserved u32 (section size placeholders).
pub(crate) fn patch_u32(buf: &mut [u8], pos: usize, v: u32) {
    buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
}

/// Writes `s` in the form [`ByteReader::fstring`] reads. Text whose terminated
/// length does not fit the signed 32-bit prefix is a format error.
pub(crate) fn put_fstring(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.is_empty() {
        put_i32(buf, 0);
        return Ok(());
    }
    if s.is_ascii() {
        put_i32(buf, fstring_len(s.len())?);
        buf.extend_from_slice(s.as_bytes());
        buf.push(0);
    } else {
        let units: Vec<u16> = s.encode_utf16().collect();
        put_i32(buf, -fstring_len(units.len())?);
        for unit in units {
            buf.extend_from_slice(&unit.to_le_bytes());
        }
        buf.extend_from_slice(&[0, 0]);
    }
    Ok(())
}

/// Length prefix of a string of `units` code units plus its terminator.
fn fstring_len(units: usize) -> Result<i32> {
    units
        .checked_add(1)
        .and_then(|n| i32::try_from(n).ok())
        .ok_or_else(|| ChunkSyncError::Format(format!("string of {} units is too long", units)))
}

/// Converts a length to the u32 used on the wire.
pub(crate) fn wire_len(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| ChunkSyncError::Format(format!("{} too large: {} bytes", what, len)))
}
