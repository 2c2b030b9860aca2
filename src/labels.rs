//! Label records (v2 and later): scoped JSON name/value metadata.

use ahash::AHashMap;
use bitflags::bitflags;
use compact_str::CompactString;
use serde::Serialize;
use smallvec::SmallVec;
use tracing::trace;

use crate::catalog::{ClientScope, Tables};
use crate::constants::MAX_CLIENT_INDOM_SERIAL;
use crate::cursor::ByteCursor;
use crate::error::{MmvError, MmvResult, RecordError};
use crate::format::{self, RawLabel};
use crate::types::{InDomId, PmId};

// ============================================================================
// SECTION 17: LABELS
// ============================================================================

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    pub struct LabelFlags: u32 {
        const INDOM = 0x04;
        const CLUSTER = 0x08;
        const ITEM = 0x10;
        const INSTANCES = 0x20;
        const OPTIONAL = 0x80;
    }
}

/// What a label set is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelTarget {
    Cluster(u32),
    Metric(PmId),
    Indom(InDomId),
    Instance(InDomId, i32),
}

impl LabelTarget {
    /// Cluster of the client that owns the target.
    pub fn cluster(&self) -> u32 {
        match self {
            LabelTarget::Cluster(cluster) => *cluster,
            LabelTarget::Metric(pmid) => pmid.cluster(),
            LabelTarget::Indom(id) | LabelTarget::Instance(id, _) => id.client_cluster(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Label {
    pub name: CompactString,
    pub value: serde_json::Value,
    pub optional: bool,
}

pub type LabelSet = SmallVec<[Label; 4]>;

#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    sets: AHashMap<LabelTarget, LabelSet>,
}

impl LabelTable {
    pub fn get(&self, target: &LabelTarget) -> Option<&LabelSet> {
        self.sets.get(target)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LabelTarget, &LabelSet)> {
        self.sets.iter()
    }

    /// Drop every set owned by `cluster`.
    pub fn remove_cluster(&mut self, cluster: u32) {
        self.sets.retain(|target, _| target.cluster() != cluster);
    }

    /// Add labels to `target`; a later label replaces an earlier one of the same name.
    pub fn insert(&mut self, target: LabelTarget, labels: impl IntoIterator<Item = Label>) -> MmvResult<()> {
        self.sets
            .try_reserve(1)
            .map_err(|e| MmvError::fatal(format!("cannot grow label table: {e}")))?;
        let set = self.sets.entry(target).or_default();
        for label in labels {
            match set.iter_mut().find(|l| l.name == label.name) {
                Some(existing) => *existing = label,
                None => set.push(label),
            }
        }
        Ok(())
    }
}

/// Parse a `"name":value[,"name":value...]` payload.
pub fn parse_payload(payload: &str, optional: bool) -> Result<LabelSet, String> {
    let object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&format!("{{{payload}}}")).map_err(|e| e.to_string())?;
    if object.is_empty() {
        return Err("empty label payload".to_string());
    }
    Ok(object
        .into_iter()
        .map(|(name, value)| Label { name: name.into(), value, optional })
        .collect())
}

/// Work out which catalog object a label record belongs to.
pub fn resolve_target(raw: &RawLabel, scope: &ClientScope<'_>) -> Result<LabelTarget, String> {
    let flags = LabelFlags::from_bits_retain(raw.flags);
    let kind = flags - LabelFlags::OPTIONAL;
    let indom = |serial: u32| {
        if serial > MAX_CLIENT_INDOM_SERIAL {
            Err(format!("indom serial {serial} too large"))
        } else {
            Ok(InDomId::for_client(scope.domain, scope.cluster, serial))
        }
    };
    if kind == LabelFlags::CLUSTER {
        Ok(LabelTarget::Cluster(scope.cluster))
    } else if kind == LabelFlags::ITEM {
        if !PmId::item_fits(raw.identity) {
            return Err(format!("item {} too large", raw.identity));
        }
        Ok(LabelTarget::Metric(PmId::new(scope.domain, scope.cluster, raw.identity)))
    } else if kind == LabelFlags::INDOM {
        indom(raw.identity).map(LabelTarget::Indom)
    } else if kind == LabelFlags::INSTANCES {
        indom(raw.identity).map(|id| LabelTarget::Instance(id, raw.internal))
    } else {
        Err(format!("unsupported label flags {:#x}", raw.flags))
    }
}

/// Decodes the label section of one client.
#[derive(Debug, Default)]
pub struct LabelDecoder;

impl LabelDecoder {
    pub(crate) fn add(
        &self,
        tables: &mut Tables,
        scope: &ClientScope<'_>,
        cursor: &ByteCursor<'_>,
        offset: u64,
    ) -> MmvResult<LabelTarget> {
        let raw = format::decode_label(cursor, offset).map_err(RecordError::from)?;
        let bad = |reason: String| RecordError::BadLabel { offset, reason };
        let target = resolve_target(&raw, scope).map_err(bad)?;
        let optional = LabelFlags::from_bits_retain(raw.flags).contains(LabelFlags::OPTIONAL);
        let labels = parse_payload(&raw.payload, optional).map_err(bad)?;
        tables.labels.insert(target, labels)?;
        trace!(target: "mmv::labels", client = scope.name, ?target, "labels added");
        Ok(target)
    }
}
