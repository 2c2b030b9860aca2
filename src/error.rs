//! Error taxonomy for the import engine.
//!
//! Every decode failure is classified so the scanner can decide how much of
//! a client to throw away: the whole client, one section, or one record.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use crate::types::{InDomId, PmId};

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================

/// Result alias used across the library.
pub type MmvResult<T> = Result<T, MmvError>;

// ----------------------------------------------------------------------------
// 4.1 Root Error
// ----------------------------------------------------------------------------

/// The main error type for the agent. All subsystem errors convert into it.
#[derive(Error, Debug)]
pub enum MmvError {
    #[error("Header rejected: {0}")]
    Header(#[from] HeaderError),

    #[error("Section rejected: {0}")]
    Section(#[from] SectionError),

    #[error("Record rejected: {0}")]
    Record(#[from] RecordError),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Store failed: {0}")]
    Store(#[from] StoreError),

    #[error("Help text: {0}")]
    Text(#[from] TextError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error on {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    /// Allocation of catalog structures failed. The agent cannot continue.
    #[error("Resource exhaustion: {0}")]
    Fatal(String),
}

impl MmvError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub fn fatal(what: impl Into<String>) -> Self {
        Self::Fatal(what.into())
    }

    /// How much of the scan this error invalidates.
    pub fn class(&self) -> ErrorClass {
        match self {
            MmvError::Header(e) => e.class(),
            MmvError::Section(_) => ErrorClass::Section,
            MmvError::Record(e) => e.class(),
            MmvError::Fetch(FetchError::Unstable { .. }) => ErrorClass::Transient,
            MmvError::Fetch(_) | MmvError::Store(_) | MmvError::Text(_) => ErrorClass::Semantic,
            MmvError::Config(_) => ErrorClass::Fatal,
            MmvError::Io { .. } => ErrorClass::Transient,
            MmvError::Fatal(_) => ErrorClass::Fatal,
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        self.class() != ErrorClass::Fatal
    }

    /// Get the error category for stats/logging
    pub fn category(&self) -> &'static str {
        match self {
            MmvError::Header(e) => e.category(),
            MmvError::Section(_) => "section",
            MmvError::Record(e) => e.category(),
            MmvError::Fetch(_) => "fetch",
            MmvError::Store(_) => "store",
            MmvError::Text(_) => "text",
            MmvError::Config(_) => "config",
            MmvError::Io { .. } => "io",
            MmvError::Fatal(_) => "fatal",
        }
    }
}

/// Blast radius of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Whole client rejected until the file changes.
    Structural,
    /// Client skipped this round, retried on the next trigger.
    Transient,
    /// One section rejected, siblings still load.
    Section,
    /// One record skipped.
    Semantic,
    /// Agent must stop.
    Fatal,
}

// ----------------------------------------------------------------------------
// 4.2 Bounds Errors
// ----------------------------------------------------------------------------

/// Raised by the byte cursor; never panics, never reads past the region.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BoundsError {
    #[error("read of {size} bytes at offset {offset} exceeds region of {len} bytes")]
    OutOfRange { offset: u64, size: u64, len: u64 },

    #[error("offset arithmetic overflowed at {offset}")]
    Overflow { offset: u64 },

    #[error("string at offset {offset} is not terminated within {max} bytes")]
    Unterminated { offset: u64, max: usize },

    #[error("string at offset {offset} is not valid UTF-8")]
    NotUtf8 { offset: u64 },
}

// ----------------------------------------------------------------------------
// 4.3 Header Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("file of {len} bytes is smaller than the {min}-byte header")]
    TooSmall { len: u64, min: usize },

    #[error("bad magic {found:02x?}")]
    BadMagic { found: [u8; 4] },

    #[error("unsupported format version {version}")]
    UnsupportedVersion { version: i32 },

    #[error("table of contents count {count} invalid for {len}-byte file")]
    BadTocCount { count: i32, len: u64 },

    #[error("requested cluster {cluster} does not fit the cluster width")]
    BadCluster { cluster: i32 },

    #[error("owning process {pid} no longer exists")]
    OwnerGone { pid: i32 },
}

impl HeaderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            HeaderError::OwnerGone { .. } => ErrorClass::Transient,
            _ => ErrorClass::Structural,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            HeaderError::TooSmall { .. } => "header.too_small",
            HeaderError::BadMagic { .. } => "header.bad_magic",
            HeaderError::UnsupportedVersion { .. } => "header.bad_version",
            HeaderError::BadTocCount { .. } => "header.bad_toc_count",
            HeaderError::BadCluster { .. } => "header.bad_cluster",
            HeaderError::OwnerGone { .. } => "header.owner_gone",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Section Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SectionError {
    #[error("toc entry {index}: negative count {count}")]
    NegativeCount { index: usize, count: i32 },

    #[error("toc entry {index}: {count} records at offset {offset} overflow address arithmetic")]
    Overflow { index: usize, offset: u64, count: i32 },

    #[error("toc entry {index}: section ending at {end} exceeds region of {len} bytes")]
    OutOfBounds { index: usize, end: u64, len: u64 },

    #[error("toc entry {index}: section at {offset} overlaps the header or table of contents")]
    OverlapsHeader { index: usize, offset: u64 },

    #[error("toc entry {index}: unknown section type {kind}")]
    UnknownType { index: usize, kind: i32 },

    #[error("toc entry {index}: section type {kind} not supported by format version {version}")]
    NotInVersion { index: usize, kind: i32, version: i32 },

    #[error("toc entry {index}: {source}")]
    Bounds { index: usize, source: BoundsError },
}

// ----------------------------------------------------------------------------
// 4.5 Record Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("invalid metric name {name:?}")]
    InvalidName { name: String },

    #[error("metric name {name:?} already exported")]
    DuplicateName { name: String },

    #[error("item {item} does not fit the item width")]
    ItemTooLarge { item: u32 },

    #[error("item {item} declared twice by the same client")]
    DuplicateItem { item: u32 },

    #[error("unknown value type {code}")]
    UnknownType { code: i32 },

    #[error("unknown semantics {code}")]
    UnknownSemantics { code: i32 },

    #[error("instance domain serial {serial} does not fit the serial width")]
    SerialTooLarge { serial: u32 },

    #[error("instance record at offset {offset}: {reason}")]
    BadInstance { offset: u64, reason: String },

    #[error("label record at offset {offset}: {reason}")]
    BadLabel { offset: u64, reason: String },

    #[error(transparent)]
    Bounds(#[from] BoundsError),
}

impl RecordError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RecordError::Bounds(_) => ErrorClass::Section,
            _ => ErrorClass::Semantic,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            RecordError::InvalidName { .. } => "record.invalid_name",
            RecordError::DuplicateName { .. } => "record.duplicate_name",
            RecordError::ItemTooLarge { .. } => "record.item_too_large",
            RecordError::DuplicateItem { .. } => "record.duplicate_item",
            RecordError::UnknownType { .. } => "record.unknown_type",
            RecordError::UnknownSemantics { .. } => "record.unknown_semantics",
            RecordError::SerialTooLarge { .. } => "record.serial_too_large",
            RecordError::BadInstance { .. } => "record.bad_instance",
            RecordError::BadLabel { .. } => "record.bad_label",
            RecordError::Bounds(_) => "record.bounds",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.6 Request-Path Errors
// ----------------------------------------------------------------------------

/// Value lookup failures, mirroring the platform's result codes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("unknown metric {pmid}")]
    UnknownMetric { pmid: PmId },

    #[error("metric {pmid} has no instance {instance}")]
    UnknownInstance { pmid: PmId, instance: i32 },

    #[error("metric {pmid} has no supported value type")]
    Unsupported { pmid: PmId },

    #[error("client {client} is being rewritten")]
    Unstable { client: String },

    #[error("value for {pmid} is unreadable: {source}")]
    BadValue { pmid: PmId, source: BoundsError },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("metric {pmid} is not writable")]
    PermissionDenied { pmid: PmId },

    #[error("store to {pmid} carried {numval} values, expected exactly one")]
    BadStore { pmid: PmId, numval: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TextError {
    #[error("no help text for metric {0}")]
    NoMetricText(PmId),

    #[error("no help text for instance domain {0}")]
    NoIndomText(InDomId),
}

// ----------------------------------------------------------------------------
// 4.7 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self::ParseError { message: message.into() }
    }

    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue { field: field.into(), message: message.into() }
    }
}

// ----------------------------------------------------------------------------
// 4.8 Scan Statistics Tracking
// ----------------------------------------------------------------------------

/// Lock-free rejection counters, shared by every scan of one agent.
#[derive(Debug, Default)]
pub struct ScanStats {
    /// Rejections by category
    pub by_category: DashMap<&'static str, AtomicU64>,
    pub scans: AtomicU64,
    pub clients_loaded: AtomicU64,
    pub clients_rejected: AtomicU64,
    pub clients_unstable: AtomicU64,
    pub sections_rejected: AtomicU64,
    pub records_rejected: AtomicU64,
}

impl ScanStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a rejection and bump the counter matching its class.
    pub fn record(&self, error: &MmvError) {
        self.by_category
            .entry(error.category())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, AtomicOrdering::Relaxed);

        let counter = match error.class() {
            ErrorClass::Structural | ErrorClass::Fatal => &self.clients_rejected,
            ErrorClass::Transient => &self.clients_unstable,
            ErrorClass::Section => &self.sections_rejected,
            ErrorClass::Semantic => &self.records_rejected,
        };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn count_by_category(&self, category: &str) -> u64 {
        self.by_category
            .get(category)
            .map(|v| v.load(AtomicOrdering::Relaxed))
            .unwrap_or(0)
    }

    pub fn summary(&self) -> ScanStatsSummary {
        let mut by_category: Vec<(String, u64)> = self
            .by_category
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().load(AtomicOrdering::Relaxed)))
            .collect();
        by_category.sort();
        ScanStatsSummary {
            scans: self.scans.load(AtomicOrdering::Relaxed),
            clients_loaded: self.clients_loaded.load(AtomicOrdering::Relaxed),
            clients_rejected: self.clients_rejected.load(AtomicOrdering::Relaxed),
            clients_unstable: self.clients_unstable.load(AtomicOrdering::Relaxed),
            sections_rejected: self.sections_rejected.load(AtomicOrdering::Relaxed),
            records_rejected: self.records_rejected.load(AtomicOrdering::Relaxed),
            by_category,
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.by_category.clear();
        for counter in [
            &self.scans,
            &self.clients_loaded,
            &self.clients_rejected,
            &self.clients_unstable,
            &self.sections_rejected,
            &self.records_rejected,
        ] {
            counter.store(0, AtomicOrdering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStatsSummary {
    pub scans: u64,
    pub clients_loaded: u64,
    pub clients_rejected: u64,
    pub clients_unstable: u64,
    pub sections_rejected: u64,
    pub records_rejected: u64,
    pub by_category: Vec<(String, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let e: MmvError = HeaderError::BadMagic { found: *b"XYZ\0" }.into();
        assert_eq!(e.class(), ErrorClass::Structural);
        assert_eq!(e.category(), "header.bad_magic");

        let e: MmvError = HeaderError::OwnerGone { pid: 42 }.into();
        assert_eq!(e.class(), ErrorClass::Transient);

        let e: MmvError = RecordError::DuplicateItem { item: 3 }.into();
        assert_eq!(e.class(), ErrorClass::Semantic);
        assert!(e.is_recoverable());

        assert!(!MmvError::fatal("catalog").is_recoverable());
    }

    #[test]
    fn test_scan_stats_record() {
        let stats = ScanStats::new();
        stats.record(&HeaderError::TooSmall { len: 3, min: 40 }.into());
        stats.record(&SectionError::NegativeCount { index: 0, count: -1 }.into());
        stats.record(&RecordError::InvalidName { name: "9x".into() }.into());
        stats.record(&RecordError::InvalidName { name: "9y".into() }.into());

        let summary = stats.summary();
        assert_eq!(summary.clients_rejected, 1);
        assert_eq!(summary.sections_rejected, 1);
        assert_eq!(summary.records_rejected, 2);
        assert_eq!(stats.count_by_category("record.invalid_name"), 2);

        stats.reset();
        assert_eq!(stats.summary(), ScanStatsSummary::default());
    }

    #[test]
    fn test_error_display() {
        let e = SectionError::OutOfBounds { index: 2, end: 4096, len: 1024 };
        assert_eq!(
            e.to_string(),
            "toc entry 2: section ending at 4096 exceeds region of 1024 bytes"
        );
    }
}
