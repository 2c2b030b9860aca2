//! Table-of-contents walk.
//!
//! Each entry is checked on its own: a broken entry is reported and the
//! walk moves on, so a corrupt labels section never costs a client its
//! metrics. Instances and strings are never walked; records elsewhere
//! reach them by offset through the cursor.

use serde::Serialize;
use tracing::{trace, warn};

use crate::constants::{HEADER_SIZE, TOC_ENTRY_SIZE};
use crate::cursor::ByteCursor;
use crate::error::{BoundsError, SectionError};
use crate::format::{FormatVersion, SectionKind};
use crate::header::{toc_end, Header};

// ============================================================================
// SECTION 14: TABLE OF CONTENTS
// ============================================================================

/// One entry as stored in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TocEntry {
    pub kind: i32,
    pub count: i32,
    pub offset: u64,
}

/// A validated section: every record lies inside the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Section {
    pub kind: SectionKind,
    pub offset: u64,
    pub count: u64,
    pub elem_size: usize,
}

impl Section {
    /// Offset of record `index`. Only meaningful for `index < count`.
    #[inline]
    pub fn record_offset(&self, index: u64) -> u64 {
        self.offset + index * self.elem_size as u64
    }

    pub fn records(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.count).map(move |i| self.record_offset(i))
    }

    /// Index of the record starting exactly at `offset`, if any.
    pub fn index_of(&self, offset: u64) -> Option<u64> {
        let rel = offset.checked_sub(self.offset)?;
        let size = self.elem_size as u64;
        (rel % size == 0 && rel / size < self.count).then_some(rel / size)
    }
}

/// Receives the sections the walker accepts.
pub trait SectionSink {
    fn metrics(&mut self, section: &Section);
    fn indoms(&mut self, section: &Section);
    fn values(&mut self, section: &Section);
    fn labels(&mut self, section: &Section);
    fn rejected(&mut self, error: SectionError);
}

pub struct TocWalker<'a> {
    cursor: ByteCursor<'a>,
    version: FormatVersion,
    toc_count: usize,
}

impl<'a> TocWalker<'a> {
    pub fn new(cursor: ByteCursor<'a>, header: &Header) -> Self {
        Self { cursor, version: header.version, toc_count: header.toc_count }
    }

    pub fn entry(&self, index: usize) -> Result<TocEntry, BoundsError> {
        let at = (HEADER_SIZE + index * TOC_ENTRY_SIZE) as u64;
        Ok(TocEntry {
            kind: self.cursor.i32_at(at)?,
            count: self.cursor.i32_at(at + 4)?,
            offset: self.cursor.u64_at(at + 8)?,
        })
    }

    /// Validate entry `index` into a section.
    pub fn section(&self, index: usize) -> Result<Section, SectionError> {
        let entry = self
            .entry(index)
            .map_err(|source| SectionError::Bounds { index, source })?;

        let kind = SectionKind::from_wire(entry.kind)
            .ok_or(SectionError::UnknownType { index, kind: entry.kind })?;
        if kind == SectionKind::Labels && !self.version.supports_labels() {
            return Err(SectionError::NotInVersion {
                index,
                kind: entry.kind,
                version: self.version.as_i32(),
            });
        }
        let count = u64::try_from(entry.count)
            .map_err(|_| SectionError::NegativeCount { index, count: entry.count })?;

        let first_free = toc_end(self.toc_count as i32).unwrap_or(u64::MAX);
        if count > 0 && entry.offset < first_free {
            return Err(SectionError::OverlapsHeader { index, offset: entry.offset });
        }

        let elem_size = kind.element_size(self.version);
        self.cursor
            .array_end(entry.offset, count, elem_size)
            .map_err(|e| match e {
                BoundsError::OutOfRange { offset, size, len } => SectionError::OutOfBounds {
                    index,
                    end: offset.saturating_add(size),
                    len,
                },
                _ => SectionError::Overflow { index, offset: entry.offset, count: entry.count },
            })?;

        Ok(Section { kind, offset: entry.offset, count, elem_size })
    }

    /// Dispatch every valid section to `sink`, reporting the rest.
    pub fn walk(&self, sink: &mut dyn SectionSink) {
        for index in 0..self.toc_count {
            let section = match self.section(index) {
                Ok(section) => section,
                Err(error) => {
                    warn!(target: "mmv::toc", %error, "section rejected");
                    sink.rejected(error);
                    continue;
                }
            };
            trace!(
                target: "mmv::toc",
                kind = section.kind.name(),
                offset = section.offset,
                count = section.count,
                "section"
            );
            match section.kind {
                SectionKind::Metrics => sink.metrics(&section),
                SectionKind::Indoms => sink.indoms(&section),
                SectionKind::Values => sink.values(&section),
                SectionKind::Labels => sink.labels(&section),
                SectionKind::Instances | SectionKind::Strings => {}
            }
        }
    }
}
