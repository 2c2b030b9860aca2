//! Instance domains: creation and in-place merging of newly seen instances.

use compact_str::CompactString;
use serde::Serialize;
use tracing::{debug, trace};

use crate::catalog::{ClientScope, Tables};
use crate::constants::MAX_CLIENT_INDOM_SERIAL;
use crate::cursor::ByteCursor;
use crate::error::{MmvError, MmvResult, RecordError};
use crate::format::{self, RawIndom};
use crate::types::InDomId;

// ============================================================================
// SECTION 16: INSTANCE DOMAINS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub id: i32,
    pub name: CompactString,
}

impl Instance {
    pub fn new(id: i32, name: impl Into<CompactString>) -> Self {
        Self { id, name: name.into() }
    }
}

/// Ordered instance set. Ids are unique; the set only ever grows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceDomain {
    pub id: InDomId,
    pub instances: Vec<Instance>,
    /// Declaring client and its help text offsets (0 = none).
    #[serde(skip)]
    pub client: usize,
    #[serde(skip)]
    pub shorttext: u64,
    #[serde(skip)]
    pub helptext: u64,
}

impl InstanceDomain {
    pub fn new(id: InDomId, client: usize) -> Self {
        Self { id, instances: Vec::new(), client, shorttext: 0, helptext: 0 }
    }

    /// Append every incoming instance whose id is not already present.
    ///
    /// Existing entries keep their position; the number appended is returned.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = Instance>) -> MmvResult<usize> {
        let mut added = 0;
        for instance in incoming {
            if self.find_by_id(instance.id).is_some() {
                continue;
            }
            self.instances
                .try_reserve(1)
                .map_err(|e| MmvError::fatal(format!("cannot grow instance list: {e}")))?;
            self.instances.push(instance);
            added += 1;
        }
        Ok(added)
    }

    pub fn find_by_id(&self, id: i32) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.name == name)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndomOutcome {
    Created { instances: usize },
    Merged { added: usize },
}

/// Decodes indom records of one client into the catalog tables.
#[derive(Debug, Default)]
pub struct IndomBuilder;

impl IndomBuilder {
    pub(crate) fn add(
        &self,
        tables: &mut Tables,
        scope: &ClientScope<'_>,
        cursor: &ByteCursor<'_>,
        offset: u64,
    ) -> MmvResult<IndomOutcome> {
        let raw = format::decode_indom(cursor, offset).map_err(RecordError::from)?;
        if raw.serial > MAX_CLIENT_INDOM_SERIAL {
            return Err(RecordError::SerialTooLarge { serial: raw.serial }.into());
        }
        let id = InDomId::for_client(scope.domain, scope.cluster, raw.serial);
        let incoming = decode_instances(cursor, scope, &raw)?;

        if let Some(existing) = tables.indoms.get_mut(&id) {
            let added = existing.merge(incoming)?;
            debug!(target: "mmv::indom", client = scope.name, indom = %id, added, "instance domain merged");
            return Ok(IndomOutcome::Merged { added });
        }

        let mut domain = InstanceDomain::new(id, scope.index);
        domain.shorttext = raw.shorttext;
        domain.helptext = raw.helptext;
        domain.merge(incoming)?;
        let instances = domain.len();

        tables
            .indoms
            .try_reserve(1)
            .map_err(|e| MmvError::fatal(format!("cannot grow indom table: {e}")))?;
        tables.indoms.insert(id, domain);
        trace!(target: "mmv::indom", client = scope.name, indom = %id, instances, "instance domain created");
        Ok(IndomOutcome::Created { instances })
    }
}

fn decode_instances(cursor: &ByteCursor<'_>, scope: &ClientScope<'_>, raw: &RawIndom) -> MmvResult<Vec<Instance>> {
    let size = scope.version.instance_record_size();
    cursor
        .array_end(raw.instances, u64::from(raw.count), size)
        .map_err(|e| RecordError::BadInstance { offset: raw.instances, reason: e.to_string() })?;

    let mut out = Vec::new();
    out.try_reserve(raw.count as usize)
        .map_err(|e| MmvError::fatal(format!("cannot size instance list: {e}")))?;
    for index in 0..u64::from(raw.count) {
        let at = raw.instances + index * size as u64;
        let instance = format::decode_instance(cursor, scope.version, at)
            .map_err(|e| RecordError::BadInstance { offset: at, reason: e.to_string() })?;
        out.push(Instance { id: instance.internal, name: instance.name });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{DEFAULT_DOMAIN, DEFAULT_PREFIX};
    use crate::fixture::{self, MmvFile};
    use crate::format::{FormatVersion, HeaderFlags};
    use pretty_assertions::assert_eq;

    fn scope(version: FormatVersion) -> ClientScope<'static> {
        ClientScope {
            index: 0,
            name: "app",
            cluster: 4,
            domain: DEFAULT_DOMAIN,
            prefix: DEFAULT_PREFIX,
            flags: HeaderFlags::empty(),
            version,
        }
    }

    fn names(domain: &InstanceDomain) -> Vec<(i32, &str)> {
        domain.instances.iter().map(|i| (i.id, i.name.as_str())).collect()
    }

    #[test]
    fn test_merge_appends_only_new_ids() {
        let mut domain = InstanceDomain::new(InDomId::for_client(DEFAULT_DOMAIN, 1, 1), 0);
        domain.merge([Instance::new(1, "a"), Instance::new(2, "b")]).unwrap();
        let added = domain
            .merge([Instance::new(1, "a"), Instance::new(2, "b"), Instance::new(3, "c")])
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(names(&domain), vec![(1, "a"), (2, "b"), (3, "c")]);
    }

    #[test]
    fn test_merge_never_shrinks() {
        let mut domain = InstanceDomain::new(InDomId::for_client(DEFAULT_DOMAIN, 1, 1), 0);
        domain.merge([Instance::new(5, "x"), Instance::new(6, "y")]).unwrap();
        domain.merge([Instance::new(6, "y")]).unwrap();
        assert_eq!(domain.len(), 2);
        assert_eq!(domain.find_by_name("x").map(|i| i.id), Some(5));
        assert!(domain.find_by_id(7).is_none());
    }

    #[test]
    fn test_create_then_merge_same_serial() {
        for raw_version in [1, 2] {
            let version = FormatVersion::from_wire(raw_version).unwrap();
            let (bytes, layout) = MmvFile::new(raw_version)
                .indom(2, &[(1, "a"), (2, "b")])
                .indom(2, &[(1, "a"), (2, "b"), (3, "c")])
                .build_with_layout();
            let cursor = ByteCursor::new(&bytes);
            let mut tables = Tables::default();
            let builder = IndomBuilder;

            let first = builder.add(&mut tables, &scope(version), &cursor, layout.indoms as u64).unwrap();
            assert_eq!(first, IndomOutcome::Created { instances: 2 });
            let second = builder
                .add(&mut tables, &scope(version), &cursor, (layout.indoms + 32) as u64)
                .unwrap();
            assert_eq!(second, IndomOutcome::Merged { added: 1 });

            let id = InDomId::for_client(DEFAULT_DOMAIN, 4, 2);
            assert_eq!(names(&tables.indoms[&id]), vec![(1, "a"), (2, "b"), (3, "c")]);
        }
    }

    #[test]
    fn test_out_of_range_instances() {
        let (mut bytes, layout) = MmvFile::new(2).indom(1, &[(0, "a")]).build_with_layout();
        fixture::put_u32(&mut bytes, layout.indoms + 4, 1_000_000);
        let cursor = ByteCursor::new(&bytes);
        let err = IndomBuilder
            .add(&mut Tables::default(), &scope(FormatVersion::V2), &cursor, layout.indoms as u64)
            .unwrap_err();
        assert_eq!(err.category(), "record.bad_instance");
    }

    #[test]
    fn test_serial_width() {
        let (bytes, layout) = MmvFile::new(2).indom(4096, &[(0, "a")]).build_with_layout();
        let cursor = ByteCursor::new(&bytes);
        let err = IndomBuilder
            .add(&mut Tables::default(), &scope(FormatVersion::V2), &cursor, layout.indoms as u64)
            .unwrap_err();
        assert_eq!(err.category(), "record.serial_too_large");
    }
}
