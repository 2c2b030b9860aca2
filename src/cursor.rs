//! Bounds-checked reads into a mapped export file.
//!
//! All offsets come from an untrusted producer. Every read validates
//! `offset + size <= len` with checked arithmetic before touching memory,
//! and no method hands out the base pointer.

use std::ops::Range;

use crate::error::BoundsError;

// ============================================================================
// SECTION 10: BOUNDS-CHECKED BYTE ACCESS
// ============================================================================

/// Read-only view of a client region. Cheap to copy.
#[derive(Debug, Clone, Copy)]
pub struct ByteCursor<'a> {
    bytes: &'a [u8],
}

impl<'a> ByteCursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Validate a `size`-byte read at `offset` and return its index range.
    pub fn span(&self, offset: u64, size: u64) -> Result<Range<usize>, BoundsError> {
        let end = offset.checked_add(size).ok_or(BoundsError::Overflow { offset })?;
        if end > self.len() {
            return Err(BoundsError::OutOfRange { offset, size, len: self.len() });
        }
        // Both fit in the slice length, which is a usize.
        Ok(offset as usize..end as usize)
    }

    /// End offset of `count` records of `elem_size` bytes starting at `offset`.
    pub fn array_end(&self, offset: u64, count: u64, elem_size: usize) -> Result<u64, BoundsError> {
        let total = count
            .checked_mul(elem_size as u64)
            .ok_or(BoundsError::Overflow { offset })?;
        let end = offset.checked_add(total).ok_or(BoundsError::Overflow { offset })?;
        if end > self.len() {
            return Err(BoundsError::OutOfRange { offset, size: total, len: self.len() });
        }
        Ok(end)
    }

    pub fn bytes_at(&self, offset: u64, size: u64) -> Result<&'a [u8], BoundsError> {
        let range = self.span(offset, size)?;
        Ok(&self.bytes[range])
    }

    pub fn array_at<const N: usize>(&self, offset: u64) -> Result<[u8; N], BoundsError> {
        let range = self.span(offset, N as u64)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[range]);
        Ok(out)
    }

    #[inline]
    pub fn u32_at(&self, offset: u64) -> Result<u32, BoundsError> {
        Ok(u32::from_ne_bytes(self.array_at::<4>(offset)?))
    }

    #[inline]
    pub fn i32_at(&self, offset: u64) -> Result<i32, BoundsError> {
        Ok(i32::from_ne_bytes(self.array_at::<4>(offset)?))
    }

    #[inline]
    pub fn u64_at(&self, offset: u64) -> Result<u64, BoundsError> {
        Ok(u64::from_ne_bytes(self.array_at::<8>(offset)?))
    }

    #[inline]
    pub fn i64_at(&self, offset: u64) -> Result<i64, BoundsError> {
        Ok(i64::from_ne_bytes(self.array_at::<8>(offset)?))
    }

    /// NUL-terminated UTF-8 string of at most `max` bytes (terminator included).
    ///
    /// A buffer that runs into the end of the region or exhausts `max`
    /// without a terminator is rejected rather than truncated.
    pub fn cstr_at(&self, offset: u64, max: usize) -> Result<&'a str, BoundsError> {
        if offset >= self.len() {
            return Err(BoundsError::OutOfRange { offset, size: 1, len: self.len() });
        }
        let available = (self.len() - offset).min(max as u64);
        let window = self.bytes_at(offset, available)?;
        let nul = window
            .iter()
            .position(|&b| b == 0)
            .ok_or(BoundsError::Unterminated { offset, max })?;
        std::str::from_utf8(&window[..nul]).map_err(|_| BoundsError::NotUtf8 { offset })
    }
}
