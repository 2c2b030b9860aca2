//! Metric descriptors: decode, validate, assign identifiers.

use ahash::AHashSet;
use compact_str::{format_compact, CompactString};
use serde::Serialize;
use tracing::trace;

use crate::catalog::{ClientScope, Tables};
use crate::constants::{INDOM_NONE, MAX_CLIENT_INDOM_SERIAL};
use crate::control::ControlMetric;
use crate::cursor::ByteCursor;
use crate::error::{MmvError, MmvResult, RecordError};
use crate::format::{self, HeaderFlags, MetricType, Semantics, Units};
use crate::types::{InDomId, PmId};

// ============================================================================
// SECTION 15: METRIC TABLE
// ============================================================================

/// Descriptor as presented to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDesc {
    pub pmid: PmId,
    pub name: CompactString,
    pub value_type: MetricType,
    pub semantics: Semantics,
    pub units: Units,
    pub indom: Option<InDomId>,
}

/// Where a metric's values come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricSource {
    Control(ControlMetric),
    Client {
        /// Index into the catalog's client list.
        client: usize,
        /// Offset of the descriptor record; value records point back at it.
        record: u64,
        /// Type as written by the producer, before elapsed is remapped.
        wire_type: MetricType,
        shorttext: u64,
        helptext: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricEntry {
    pub desc: MetricDesc,
    pub source: MetricSource,
}

impl MetricEntry {
    pub fn control(domain: u32, prefix: &str, metric: ControlMetric) -> Self {
        Self {
            desc: MetricDesc {
                pmid: PmId::new(domain, crate::constants::CONTROL_CLUSTER, metric.item()),
                name: format_compact!("{}.{}", prefix, metric.suffix()),
                value_type: metric.value_type(),
                semantics: metric.semantics(),
                units: metric.units(),
                indom: None,
            },
            source: MetricSource::Control(metric),
        }
    }

    pub fn is_scalar(&self) -> bool {
        self.desc.indom.is_none()
    }
}

/// A name must start with a letter and continue with letters, digits,
/// `_` or `.`.
pub fn validate_name(name: &str) -> Result<(), RecordError> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(RecordError::InvalidName { name: name.to_string() })
    }
}

/// Catalog name for a client metric.
pub fn full_name(prefix: &str, client: &str, flags: HeaderFlags, name: &str) -> CompactString {
    if flags.contains(HeaderFlags::NO_PREFIX) {
        format_compact!("{prefix}.{name}")
    } else {
        format_compact!("{prefix}.{client}.{name}")
    }
}

/// Per-client metric table construction.
///
/// Item uniqueness is tracked per client across all of its metric sections;
/// name uniqueness is checked against the whole catalog.
#[derive(Debug, Default)]
pub struct MetricTableBuilder {
    seen_items: AHashSet<u32>,
}

impl MetricTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the record at `offset` and insert it.
    pub(crate) fn add(
        &mut self,
        tables: &mut Tables,
        scope: &ClientScope<'_>,
        cursor: &ByteCursor<'_>,
        offset: u64,
    ) -> MmvResult<PmId> {
        let raw = format::decode_metric(cursor, scope.version, offset).map_err(RecordError::from)?;

        let name = full_name(scope.prefix, scope.name, scope.flags, &raw.name);
        validate_name(&name)?;
        if tables.names.contains_key(&name) {
            return Err(RecordError::DuplicateName { name: name.to_string() }.into());
        }
        if !PmId::item_fits(raw.item) {
            return Err(RecordError::ItemTooLarge { item: raw.item }.into());
        }
        if self.seen_items.contains(&raw.item) {
            return Err(RecordError::DuplicateItem { item: raw.item }.into());
        }
        let wire_type =
            MetricType::from_wire(raw.type_code).ok_or(RecordError::UnknownType { code: raw.type_code })?;
        let semantics = Semantics::from_wire(raw.semantics)
            .ok_or(RecordError::UnknownSemantics { code: raw.semantics })?;
        let indom = match raw.indom {
            0 | INDOM_NONE => None,
            serial if serial > MAX_CLIENT_INDOM_SERIAL => {
                return Err(RecordError::SerialTooLarge { serial }.into())
            }
            serial => Some(InDomId::for_client(scope.domain, scope.cluster, serial)),
        };

        let (value_type, semantics, units) = match wire_type {
            MetricType::Elapsed => (MetricType::I64, Semantics::Counter, Units::ELAPSED_USEC),
            other => (other, semantics, Units(raw.dimension)),
        };
        let pmid = PmId::new(scope.domain, scope.cluster, raw.item);

        let entry = MetricEntry {
            desc: MetricDesc { pmid, name: name.clone(), value_type, semantics, units, indom },
            source: MetricSource::Client {
                client: scope.index,
                record: offset,
                wire_type,
                shorttext: raw.shorttext,
                helptext: raw.helptext,
            },
        };

        reserve(tables)?;
        self.seen_items.insert(raw.item);
        tables.names.insert(name, pmid);
        tables.metrics.insert(pmid, entry);
        trace!(target: "mmv::metrics", client = scope.name, %pmid, name = %raw.name, "metric added");
        Ok(pmid)
    }
}

fn reserve(tables: &mut Tables) -> MmvResult<()> {
    tables
        .names
        .try_reserve(1)
        .and_then(|_| tables.metrics.try_reserve(1))
        .map_err(|e| MmvError::fatal(format!("cannot grow metric table: {e}")))
}
