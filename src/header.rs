//! Header validation and the generation-pair read protocol.
//!
//! A producer bumps `g1`, writes, then sets `g2 = g1`. A reader may trust
//! what it read only if both counters were non-zero, equal, and unchanged
//! across the read.

use std::sync::atomic::{fence, Ordering};

use serde::Serialize;
use tracing::{debug, trace};

use crate::constants::*;
use crate::cursor::ByteCursor;
use crate::error::{BoundsError, HeaderError};
use crate::format::{FormatVersion, HeaderFlags};
use crate::process::ProcessProbe;

// ============================================================================
// SECTION 12: HEADER DECODING & GENERATION PROTOCOL
// ============================================================================

/// The two generation counters as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GenerationPair {
    pub g1: u64,
    pub g2: u64,
}

impl GenerationPair {
    pub fn read(cursor: &ByteCursor<'_>) -> Result<Self, BoundsError> {
        let g1 = cursor.u64_at(HDR_G1)?;
        fence(Ordering::Acquire);
        let g2 = cursor.u64_at(HDR_G2)?;
        Ok(Self { g1, g2 })
    }

    pub fn is_stable(&self) -> bool {
        self.g1 != 0 && self.g1 == self.g2
    }

    pub fn instability(&self) -> Option<Instability> {
        if self.g1 == 0 || self.g2 == 0 {
            Some(Instability::NotYetWritten)
        } else if self.g1 != self.g2 {
            Some(Instability::BeingWritten { g1: self.g1, g2: self.g2 })
        } else {
            None
        }
    }
}

/// Why a structurally fine client cannot be read right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Instability {
    NotYetWritten,
    BeingWritten { g1: u64, g2: u64 },
}

/// Decoded and validated header of a stable client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Header {
    pub version: FormatVersion,
    pub generation: u64,
    pub toc_count: usize,
    pub flags: HeaderFlags,
    /// Owning process, present only when liveness checking was requested.
    pub process: Option<i32>,
    /// Cluster asked for by the producer; 0 means "assign one".
    pub requested_cluster: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderStatus {
    Stable(Header),
    Unstable(Instability),
}

/// Validate the header at offset 0.
///
/// Checks run in a fixed order, so the first failing rule names the rejection.
/// Nothing is retained when a header is rejected.
pub fn decode(cursor: &ByteCursor<'_>, probe: &dyn ProcessProbe) -> Result<HeaderStatus, HeaderError> {
    let len = cursor.len();
    if len < HEADER_SIZE as u64 {
        return Err(HeaderError::TooSmall { len, min: HEADER_SIZE });
    }
    // Fixed fields all lie inside the length checked above.
    let field = |e: BoundsError| {
        debug!(target: "mmv::header", error = %e, "header field unreadable");
        HeaderError::TooSmall { len, min: HEADER_SIZE }
    };

    let magic = cursor.array_at::<4>(HDR_MAGIC).map_err(field)?;
    if magic != MMV_MAGIC {
        return Err(HeaderError::BadMagic { found: magic });
    }

    let raw_version = cursor.i32_at(HDR_VERSION).map_err(field)?;
    let version = FormatVersion::from_wire(raw_version)
        .ok_or(HeaderError::UnsupportedVersion { version: raw_version })?;

    let generation = GenerationPair::read(cursor).map_err(field)?;
    if let Some(instability) = generation.instability() {
        trace!(target: "mmv::header", ?instability, "client not stable");
        return Ok(HeaderStatus::Unstable(instability));
    }

    let tocs = cursor.i32_at(HDR_TOCS).map_err(field)?;
    if tocs < MIN_TOC_COUNT || toc_end(tocs).map_or(true, |end| end > len) {
        return Err(HeaderError::BadTocCount { count: tocs, len });
    }

    let flags = HeaderFlags::from_bits_retain(cursor.u32_at(HDR_FLAGS).map_err(field)?);

    let cluster = cursor.i32_at(HDR_CLUSTER).map_err(field)?;
    let requested_cluster = u32::try_from(cluster)
        .ok()
        .filter(|&c| c <= MAX_CLIENT_CLUSTER)
        .ok_or(HeaderError::BadCluster { cluster })?;

    let pid = cursor.i32_at(HDR_PROCESS).map_err(field)?;
    let process = (flags.contains(HeaderFlags::PROCESS) && pid != 0).then_some(pid);
    if let Some(pid) = process {
        if !probe.exists(pid) {
            return Err(HeaderError::OwnerGone { pid });
        }
    }

    Ok(HeaderStatus::Stable(Header {
        version,
        generation: generation.g1,
        toc_count: tocs as usize,
        flags,
        process,
        requested_cluster,
    }))
}

/// End of the table of contents for `tocs` entries, if representable.
pub fn toc_end(tocs: i32) -> Option<u64> {
    let tocs = u64::try_from(tocs).ok()?;
    tocs.checked_mul(TOC_ENTRY_SIZE as u64)?.checked_add(HEADER_SIZE as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::MmvFile;
    use crate::process::tests::FakeProbe;
    use crate::process::SystemProbe;

    fn status(bytes: &[u8]) -> Result<HeaderStatus, HeaderError> {
        decode(&ByteCursor::new(bytes), &SystemProbe)
    }

    fn stable(bytes: &[u8]) -> Header {
        match status(bytes) {
            Ok(HeaderStatus::Stable(h)) => h,
            other => panic!("expected stable header, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_header() {
        let bytes = MmvFile::new(1).cluster(9).build();
        let header = stable(&bytes);
        assert_eq!(header.version, FormatVersion::V1);
        assert_eq!(header.requested_cluster, 9);
        assert_eq!(header.process, None);
        assert!(header.toc_count >= 2);
    }

    #[test]
    fn test_too_small() {
        let bytes = MmvFile::new(2).build();
        assert_eq!(status(&bytes[..39]), Err(HeaderError::TooSmall { len: 39, min: HEADER_SIZE }));
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut bytes = MmvFile::new(2).build();
        bytes[3] = b'!';
        assert!(matches!(status(&bytes), Err(HeaderError::BadMagic { .. })));

        let bytes = MmvFile::new(2).raw_version(4).build();
        assert_eq!(status(&bytes), Err(HeaderError::UnsupportedVersion { version: 4 }));
    }

    #[test]
    fn test_generation_gating() {
        let bytes = MmvFile::new(2).generations(0, 0).build();
        assert_eq!(status(&bytes), Ok(HeaderStatus::Unstable(Instability::NotYetWritten)));

        let bytes = MmvFile::new(2).generations(6, 5).build();
        assert_eq!(
            status(&bytes),
            Ok(HeaderStatus::Unstable(Instability::BeingWritten { g1: 6, g2: 5 }))
        );

        let bytes = MmvFile::new(2).generations(5, 5).build();
        assert_eq!(stable(&bytes).generation, 5);
    }

    #[test]
    fn test_toc_count_limits() {
        for tocs in [-1, 0, 1, i32::MAX] {
            let bytes = MmvFile::new(2).raw_tocs(tocs).build();
            assert!(
                matches!(status(&bytes), Err(HeaderError::BadTocCount { .. })),
                "tocs={tocs}"
            );
        }
    }

    #[test]
    fn test_cluster_width() {
        let bytes = MmvFile::new(2).cluster(1 << 26).build();
        assert!(matches!(status(&bytes), Err(HeaderError::BadCluster { .. })));
        let bytes = MmvFile::new(2).cluster(-3).build();
        assert!(matches!(status(&bytes), Err(HeaderError::BadCluster { .. })));
    }

    #[test]
    fn test_owner_liveness() {
        let bytes = MmvFile::new(2).process(4242).build();
        let probe = FakeProbe::with(&[4242]);
        let cursor = ByteCursor::new(&bytes);
        match decode(&cursor, &probe) {
            Ok(HeaderStatus::Stable(h)) => assert_eq!(h.process, Some(4242)),
            other => panic!("unexpected {other:?}"),
        }
        probe.kill(4242);
        assert_eq!(decode(&cursor, &probe), Err(HeaderError::OwnerGone { pid: 4242 }));
    }

    #[test]
    fn test_pid_ignored_without_flag() {
        let mut bytes = MmvFile::new(2).build();
        bytes[HDR_PROCESS as usize..HDR_PROCESS as usize + 4].copy_from_slice(&4242i32.to_ne_bytes());
        let probe = FakeProbe::default();
        assert!(matches!(decode(&ByteCursor::new(&bytes), &probe), Ok(HeaderStatus::Stable(_))));
    }
}
