//! Fetch-time value resolution.
//!
//! Values are never cached: every fetch walks the client's value sections
//! under the generation check, so a producer update is visible on the very
//! next read without a rescan.

use std::fmt::{self, Display, Formatter};

use serde::Serialize;
use tracing::trace;

use crate::catalog::Catalog;
use crate::client::Client;
use crate::cursor::ByteCursor;
use crate::error::{BoundsError, FetchError};
use crate::format::{self, HeaderFlags, MetricType, RawValue};
use crate::metrics::MetricSource;
use crate::types::{PmId, Timestamp};

// ============================================================================
// SECTION 21: VALUE READER
// ============================================================================

/// Instance number meaning "any instance".
pub const IN_NULL: i32 = -1;

/// A decoded value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AtomValue {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Float(f32),
    Double(f64),
    String(String),
}

impl Display for AtomValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AtomValue::I32(v) => write!(f, "{v}"),
            AtomValue::U32(v) => write!(f, "{v}"),
            AtomValue::I64(v) => write!(f, "{v}"),
            AtomValue::U64(v) => write!(f, "{v}"),
            AtomValue::Float(v) => write!(f, "{v}"),
            AtomValue::Double(v) => write!(f, "{v}"),
            AtomValue::String(v) => write!(f, "{v:?}"),
        }
    }
}

/// Resolves `(metric, instance)` pairs against one catalog.
pub struct ValueReader<'c> {
    catalog: &'c Catalog,
}

impl<'c> ValueReader<'c> {
    pub fn new(catalog: &'c Catalog) -> Self {
        Self { catalog }
    }

    pub fn fetch(&self, pmid: PmId, instance: Option<i32>) -> Result<Option<AtomValue>, FetchError> {
        self.fetch_at(pmid, instance, Timestamp::now())
    }

    /// Fetch with an explicit clock, used to extend open timers.
    ///
    /// `Ok(None)` means the slot exists but holds no sample yet.
    pub fn fetch_at(
        &self,
        pmid: PmId,
        instance: Option<i32>,
        now: Timestamp,
    ) -> Result<Option<AtomValue>, FetchError> {
        let entry = self.catalog.metric(pmid).ok_or(FetchError::UnknownMetric { pmid })?;
        let MetricSource::Client { client, record, wire_type, .. } = entry.source else {
            return Err(FetchError::UnknownMetric { pmid });
        };
        if wire_type == MetricType::NoSupport {
            return Err(FetchError::Unsupported { pmid });
        }
        let client = self.catalog.client(client).ok_or(FetchError::UnknownMetric { pmid })?;
        let lookup = Lookup {
            pmid,
            record,
            wire_type,
            scalar: entry.is_scalar(),
            instance: instance.filter(|&i| i != IN_NULL),
            now,
        };
        client.read_stable(|cursor| lookup.run(client, cursor))?
    }
}

struct Lookup {
    pmid: PmId,
    record: u64,
    wire_type: MetricType,
    scalar: bool,
    instance: Option<i32>,
    now: Timestamp,
}

impl Lookup {
    fn run(&self, client: &Client, cursor: &ByteCursor<'_>) -> Result<Option<AtomValue>, FetchError> {
        for section in client.value_sections() {
            for offset in section.records() {
                let raw = format::decode_value(cursor, offset)
                    .map_err(|source| FetchError::BadValue { pmid: self.pmid, source })?;
                if raw.metric == self.record && self.instance_matches(cursor, &raw) {
                    trace!(target: "mmv::fetch", client = %client.name, pmid = %self.pmid, offset, "value found");
                    return self.decode(client.header.flags, cursor, &raw);
                }
            }
        }
        // With no instance asked for, any slot of the metric matches; finding
        // none means the metric has no values at all.
        Err(match self.instance {
            Some(instance) if !self.scalar => FetchError::UnknownInstance { pmid: self.pmid, instance },
            _ => FetchError::UnknownMetric { pmid: self.pmid },
        })
    }

    fn instance_matches(&self, cursor: &ByteCursor<'_>, raw: &RawValue) -> bool {
        match self.instance {
            _ if self.scalar => true,
            None => true,
            // A dangling instance reference only loses this value.
            Some(wanted) => format::instance_internal(cursor, raw.instance).is_ok_and(|id| id == wanted),
        }
    }

    fn decode(&self, flags: HeaderFlags, cursor: &ByteCursor<'_>, raw: &RawValue) -> Result<Option<AtomValue>, FetchError> {
        if flags.contains(HeaderFlags::SENTINEL) && self.wire_type.is_sentinel(raw.value) {
            return Ok(None);
        }
        let bytes = raw.value;
        let narrow = [bytes[0], bytes[1], bytes[2], bytes[3]];
        let value = match self.wire_type {
            MetricType::I32 => AtomValue::I32(i32::from_ne_bytes(narrow)),
            MetricType::U32 => AtomValue::U32(u32::from_ne_bytes(narrow)),
            MetricType::I64 => AtomValue::I64(i64::from_ne_bytes(bytes)),
            MetricType::U64 => AtomValue::U64(u64::from_ne_bytes(bytes)),
            MetricType::Float => AtomValue::Float(f32::from_ne_bytes(narrow)),
            MetricType::Double => AtomValue::Double(f64::from_ne_bytes(bytes)),
            MetricType::Elapsed => {
                let base = i64::from_ne_bytes(bytes);
                if raw.extra < 0 {
                    // Open timer: extra holds minus the start time in microseconds.
                    AtomValue::I64(base.saturating_add(self.now.as_micros().saturating_add(raw.extra)))
                } else {
                    AtomValue::I64(base)
                }
            }
            MetricType::String => {
                let bad = |source: BoundsError| FetchError::BadValue { pmid: self.pmid, source };
                let at = u64::try_from(raw.extra).map_err(|_| bad(BoundsError::Overflow { offset: raw.offset }))?;
                AtomValue::String(format::read_string(cursor, at).map_err(bad)?.to_owned())
            }
            MetricType::NoSupport => return Err(FetchError::Unsupported { pmid: self.pmid }),
        };
        Ok(Some(value))
    }
}
