//! Wire layout of the export file, decoded into one version-neutral form.
//!
//! Versions differ only in how names are carried (inline buffers in v1,
//! string-table offsets in v2/v3) and in label support. The version is
//! matched exactly once per record here; nothing downstream branches on it.

use std::fmt::{self, Display, Formatter};

use bitflags::bitflags;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::cursor::ByteCursor;
use crate::error::BoundsError;

// ============================================================================
// SECTION 11: WIRE FORMAT CODES & RECORD LAYOUTS
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Format Version
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatVersion {
    V1,
    V2,
    V3,
}

impl FormatVersion {
    pub fn from_wire(version: i32) -> Option<Self> {
        match version {
            MMV_VERSION1 => Some(Self::V1),
            MMV_VERSION2 => Some(Self::V2),
            MMV_VERSION3 => Some(Self::V3),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Self::V1 => MMV_VERSION1,
            Self::V2 => MMV_VERSION2,
            Self::V3 => MMV_VERSION3,
        }
    }

    pub fn metric_record_size(self) -> usize {
        match self {
            Self::V1 => METRIC_V1_RECORD_SIZE,
            Self::V2 | Self::V3 => METRIC_V2_RECORD_SIZE,
        }
    }

    pub fn instance_record_size(self) -> usize {
        match self {
            Self::V1 => INSTANCE_V1_RECORD_SIZE,
            Self::V2 | Self::V3 => INSTANCE_V2_RECORD_SIZE,
        }
    }

    pub fn supports_labels(self) -> bool {
        !matches!(self, Self::V1)
    }
}

impl Display for FormatVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_i32())
    }
}

bitflags! {
    /// Header flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct HeaderFlags: u32 {
        /// Names are `<prefix>.<name>` instead of `<prefix>.<client>.<name>`.
        const NO_PREFIX = 0x1;
        /// The owning process id must be checked for liveness.
        const PROCESS = 0x2;
        /// All-ones slots mean "not sampled yet".
        const SENTINEL = 0x4;
    }
}

// ----------------------------------------------------------------------------
// 11.2 Section Kinds
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectionKind {
    Indoms,
    Instances,
    Metrics,
    Values,
    Strings,
    Labels,
}

impl SectionKind {
    pub fn from_wire(kind: i32) -> Option<Self> {
        match kind {
            1 => Some(Self::Indoms),
            2 => Some(Self::Instances),
            3 => Some(Self::Metrics),
            4 => Some(Self::Values),
            5 => Some(Self::Strings),
            6 => Some(Self::Labels),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Self::Indoms => 1,
            Self::Instances => 2,
            Self::Metrics => 3,
            Self::Values => 4,
            Self::Strings => 5,
            Self::Labels => 6,
        }
    }

    pub fn element_size(self, version: FormatVersion) -> usize {
        match self {
            Self::Indoms => INDOM_RECORD_SIZE,
            Self::Instances => version.instance_record_size(),
            Self::Metrics => version.metric_record_size(),
            Self::Values => VALUE_RECORD_SIZE,
            Self::Strings => STRING_RECORD_SIZE,
            Self::Labels => LABEL_RECORD_SIZE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Indoms => "indoms",
            Self::Instances => "instances",
            Self::Metrics => "metrics",
            Self::Values => "values",
            Self::Strings => "strings",
            Self::Labels => "labels",
        }
    }
}

// ----------------------------------------------------------------------------
// 11.3 Metric Descriptor Tags
// ----------------------------------------------------------------------------

/// Value type as declared by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    NoSupport,
    I32,
    U32,
    I64,
    U64,
    Float,
    Double,
    String,
    Elapsed,
}

impl MetricType {
    pub fn from_wire(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::NoSupport),
            0 => Some(Self::I32),
            1 => Some(Self::U32),
            2 => Some(Self::I64),
            3 => Some(Self::U64),
            4 => Some(Self::Float),
            5 => Some(Self::Double),
            6 => Some(Self::String),
            9 => Some(Self::Elapsed),
            _ => None,
        }
    }

    /// Type presented to consumers. Elapsed timers read as i64 microseconds.
    pub fn exposed(self) -> Self {
        match self {
            Self::Elapsed => Self::I64,
            other => other,
        }
    }

    /// Whether `raw` is the all-ones "not sampled yet" pattern for this type.
    pub fn is_sentinel(self, raw: [u8; 8]) -> bool {
        match self {
            Self::I32 | Self::U32 | Self::Float => {
                let narrow: [u8; 4] = [raw[0], raw[1], raw[2], raw[3]];
                u32::from_ne_bytes(narrow) == u32::MAX
            }
            Self::I64 | Self::U64 | Self::Double => u64::from_ne_bytes(raw) == u64::MAX,
            Self::NoSupport | Self::String | Self::Elapsed => false,
        }
    }
}

impl Display for MetricType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoSupport => "nosupport",
            Self::I32 => "32",
            Self::U32 => "u32",
            Self::I64 => "64",
            Self::U64 => "u64",
            Self::Float => "float",
            Self::Double => "double",
            Self::String => "string",
            Self::Elapsed => "elapsed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Semantics {
    Counter,
    Instant,
    Discrete,
}

impl Semantics {
    /// Zero is how older producers spell "counter".
    pub fn from_wire(code: i32) -> Option<Self> {
        match code {
            0 | 1 => Some(Self::Counter),
            3 => Some(Self::Instant),
            4 => Some(Self::Discrete),
            _ => None,
        }
    }
}

impl Display for Semantics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Counter => "counter",
            Self::Instant => "instant",
            Self::Discrete => "discrete",
        })
    }
}

/// Packed dimension and scale nibbles, carried through opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Units(pub u32);

impl Units {
    /// time^1, scaled in microseconds.
    pub const ELAPSED_USEC: Units = Units((1 << 24) | (1 << 12));

    pub fn new(dim_space: i8, dim_time: i8, dim_count: i8, scale_space: u8, scale_time: u8, scale_count: u8) -> Self {
        let nib = |v: u32| v & 0xf;
        Self(
            (nib(dim_space as u32) << 28)
                | (nib(dim_time as u32) << 24)
                | (nib(dim_count as u32) << 20)
                | (nib(u32::from(scale_space)) << 16)
                | (nib(u32::from(scale_time)) << 12)
                | (nib(u32::from(scale_count)) << 8),
        )
    }

    fn signed_nibble(&self, shift: u32) -> i8 {
        let raw = ((self.0 >> shift) & 0xf) as i8;
        if raw & 0x8 != 0 {
            raw - 16
        } else {
            raw
        }
    }

    pub fn dim_space(&self) -> i8 {
        self.signed_nibble(28)
    }

    pub fn dim_time(&self) -> i8 {
        self.signed_nibble(24)
    }

    pub fn dim_count(&self) -> i8 {
        self.signed_nibble(20)
    }

    pub fn scale_time(&self) -> u8 {
        ((self.0 >> 12) & 0xf) as u8
    }
}

// ----------------------------------------------------------------------------
// 11.4 Version-Neutral Records
// ----------------------------------------------------------------------------

/// One metric descriptor with its name already resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMetric {
    /// Offset of the record itself; value records point back at it.
    pub offset: u64,
    pub name: CompactString,
    pub item: u32,
    pub type_code: i32,
    pub semantics: i32,
    pub dimension: u32,
    pub indom: u32,
    pub shorttext: u64,
    pub helptext: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawIndom {
    pub offset: u64,
    pub serial: u32,
    pub count: u32,
    pub instances: u64,
    pub shorttext: u64,
    pub helptext: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawInstance {
    pub offset: u64,
    pub indom: u64,
    pub internal: i32,
    pub name: CompactString,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawValue {
    pub offset: u64,
    pub value: [u8; 8],
    pub extra: i64,
    pub metric: u64,
    pub instance: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawLabel {
    pub offset: u64,
    pub flags: u32,
    pub identity: u32,
    pub internal: i32,
    pub payload: CompactString,
}

/// String-table entry at `offset`.
pub fn read_string<'a>(cursor: &ByteCursor<'a>, offset: u64) -> Result<&'a str, BoundsError> {
    cursor.cstr_at(offset, MMV_STRINGMAX)
}

/// Optional help text reference; offset 0 means none.
pub fn read_text(cursor: &ByteCursor<'_>, offset: u64) -> Option<String> {
    if offset == 0 {
        return None;
    }
    read_string(cursor, offset).ok().map(str::to_owned)
}

pub fn decode_metric(cursor: &ByteCursor<'_>, version: FormatVersion, offset: u64) -> Result<RawMetric, BoundsError> {
    match version {
        FormatVersion::V1 => decode_metric_v1(cursor, offset),
        FormatVersion::V2 | FormatVersion::V3 => decode_metric_v2(cursor, offset),
    }
}

fn decode_metric_v1(cursor: &ByteCursor<'_>, offset: u64) -> Result<RawMetric, BoundsError> {
    cursor.span(offset, METRIC_V1_RECORD_SIZE as u64)?;
    let name = cursor.cstr_at(offset, MMV_NAMEMAX)?;
    decode_metric_tail(cursor, offset, MMV_NAMEMAX as u64, name)
}

fn decode_metric_v2(cursor: &ByteCursor<'_>, offset: u64) -> Result<RawMetric, BoundsError> {
    cursor.span(offset, METRIC_V2_RECORD_SIZE as u64)?;
    let name = read_string(cursor, cursor.u64_at(offset)?)?;
    decode_metric_tail(cursor, offset, 8, name)
}

/// Fields after the name are laid out identically in every version.
fn decode_metric_tail(cursor: &ByteCursor<'_>, offset: u64, name_width: u64, name: &str) -> Result<RawMetric, BoundsError> {
    let base = offset + name_width;
    Ok(RawMetric {
        offset,
        name: CompactString::from(name),
        item: cursor.u32_at(base)?,
        type_code: cursor.i32_at(base + 4)?,
        semantics: cursor.i32_at(base + 8)?,
        dimension: cursor.u32_at(base + 12)?,
        indom: cursor.u32_at(base + 16)?,
        shorttext: cursor.u64_at(base + 24)?,
        helptext: cursor.u64_at(base + 32)?,
    })
}

pub fn decode_indom(cursor: &ByteCursor<'_>, offset: u64) -> Result<RawIndom, BoundsError> {
    cursor.span(offset, INDOM_RECORD_SIZE as u64)?;
    Ok(RawIndom {
        offset,
        serial: cursor.u32_at(offset)?,
        count: cursor.u32_at(offset + 4)?,
        instances: cursor.u64_at(offset + 8)?,
        shorttext: cursor.u64_at(offset + 16)?,
        helptext: cursor.u64_at(offset + 24)?,
    })
}

pub fn decode_instance(cursor: &ByteCursor<'_>, version: FormatVersion, offset: u64) -> Result<RawInstance, BoundsError> {
    cursor.span(offset, version.instance_record_size() as u64)?;
    let name = match version {
        FormatVersion::V1 => cursor.cstr_at(offset + 16, MMV_NAMEMAX)?,
        FormatVersion::V2 | FormatVersion::V3 => read_string(cursor, cursor.u64_at(offset + 16)?)?,
    };
    Ok(RawInstance {
        offset,
        indom: cursor.u64_at(offset)?,
        internal: instance_internal(cursor, offset)?,
        name: CompactString::from(name),
    })
}

/// Internal id of the instance record at `offset`; shared by both layouts.
pub fn instance_internal(cursor: &ByteCursor<'_>, offset: u64) -> Result<i32, BoundsError> {
    cursor.i32_at(offset.checked_add(12).ok_or(BoundsError::Overflow { offset })?)
}

pub fn decode_value(cursor: &ByteCursor<'_>, offset: u64) -> Result<RawValue, BoundsError> {
    cursor.span(offset, VALUE_RECORD_SIZE as u64)?;
    Ok(RawValue {
        offset,
        value: cursor.array_at::<8>(offset)?,
        extra: cursor.i64_at(offset + 8)?,
        metric: cursor.u64_at(offset + 16)?,
        instance: cursor.u64_at(offset + 24)?,
    })
}

pub fn decode_label(cursor: &ByteCursor<'_>, offset: u64) -> Result<RawLabel, BoundsError> {
    cursor.span(offset, LABEL_RECORD_SIZE as u64)?;
    Ok(RawLabel {
        offset,
        flags: cursor.u32_at(offset)?,
        identity: cursor.u32_at(offset + 4)?,
        internal: cursor.i32_at(offset + 8)?,
        payload: CompactString::from(cursor.cstr_at(offset + 12, MMV_LABELMAX)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
        buf[at..at + bytes.len()].copy_from_slice(bytes);
    }

    #[test]
    fn test_metric_layouts_agree() {
        // v1: inline name
        let mut v1 = vec![0u8; METRIC_V1_RECORD_SIZE];
        put(&mut v1, 0, b"requests\0");
        put(&mut v1, 64, &7u32.to_ne_bytes());
        put(&mut v1, 68, &3i32.to_ne_bytes());
        put(&mut v1, 72, &1i32.to_ne_bytes());
        put(&mut v1, 80, &u32::MAX.to_ne_bytes());
        let m1 = decode_metric(&ByteCursor::new(&v1), FormatVersion::V1, 0).unwrap();

        // v2: name through the string table at offset 48
        let mut v2 = vec![0u8; METRIC_V2_RECORD_SIZE + STRING_RECORD_SIZE];
        put(&mut v2, 0, &48u64.to_ne_bytes());
        put(&mut v2, 8, &7u32.to_ne_bytes());
        put(&mut v2, 12, &3i32.to_ne_bytes());
        put(&mut v2, 16, &1i32.to_ne_bytes());
        put(&mut v2, 24, &u32::MAX.to_ne_bytes());
        put(&mut v2, 48, b"requests\0");
        let m2 = decode_metric(&ByteCursor::new(&v2), FormatVersion::V2, 0).unwrap();

        assert_eq!(m1.name, m2.name);
        assert_eq!((m1.item, m1.type_code, m1.semantics, m1.indom), (m2.item, m2.type_code, m2.semantics, m2.indom));
    }

    #[test]
    fn test_truncated_record_is_rejected() {
        let buf = vec![0u8; METRIC_V2_RECORD_SIZE - 1];
        assert!(decode_metric(&ByteCursor::new(&buf), FormatVersion::V2, 0).is_err());
    }

    #[test]
    fn test_sentinel_widths() {
        assert!(MetricType::U32.is_sentinel([0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0]));
        assert!(!MetricType::U64.is_sentinel([0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0]));
        assert!(MetricType::Double.is_sentinel([0xff; 8]));
        assert!(!MetricType::String.is_sentinel([0xff; 8]));
    }

    #[test]
    fn test_semantics_zero_is_counter() {
        assert_eq!(Semantics::from_wire(0), Some(Semantics::Counter));
        assert_eq!(Semantics::from_wire(2), None);
    }

    #[test]
    fn test_units_nibbles() {
        assert_eq!(Units::ELAPSED_USEC.dim_time(), 1);
        assert_eq!(Units::ELAPSED_USEC.scale_time(), 1);
        assert_eq!(Units::new(0, -1, 1, 0, 3, 0).dim_time(), -1);
    }

    #[test]
    fn test_label_section_requires_v2() {
        assert!(!FormatVersion::V1.supports_labels());
        assert!(FormatVersion::V3.supports_labels());
        assert_eq!(SectionKind::Metrics.element_size(FormatVersion::V1), METRIC_V1_RECORD_SIZE);
    }
}
