//! The immutable catalog and the per-scan builder that produces it.
//!
//! A catalog is built once per scan, then only read. Replacing it is a
//! single pointer swap in the scanner, so readers never see a half-built one.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use compact_str::CompactString;
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::client::{Client, Region};
use crate::constants::MAX_CLIENT_CLUSTER;
use crate::control::ControlMetric;
use crate::cursor::ByteCursor;
use crate::error::{ErrorClass, HeaderError, MmvError, MmvResult, ScanStats, SectionError};
use crate::format::{FormatVersion, HeaderFlags};
use crate::header::{GenerationPair, Header};
use crate::indom::{IndomBuilder, Instance, InstanceDomain};
use crate::labels::{LabelDecoder, LabelSet, LabelTable, LabelTarget};
use crate::metrics::{MetricEntry, MetricSource, MetricTableBuilder};
use crate::toc::{Section, SectionSink, TocWalker};
use crate::types::{InDomId, PmId, Timestamp};

// ============================================================================
// SECTION 20: CATALOG & CATALOG BUILDER
// ============================================================================

// ----------------------------------------------------------------------------
// 20.1 Build Scope
// ----------------------------------------------------------------------------

/// Everything a record builder needs to know about the client it reads.
#[derive(Debug, Clone)]
pub(crate) struct ClientScope<'a> {
    pub index: usize,
    pub name: &'a str,
    pub cluster: u32,
    pub domain: u32,
    pub prefix: &'a str,
    pub flags: HeaderFlags,
    pub version: FormatVersion,
}

/// Mutable tables filled while a scan is in progress.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub names: AHashMap<CompactString, PmId>,
    pub metrics: AHashMap<PmId, MetricEntry>,
    pub indoms: AHashMap<InDomId, InstanceDomain>,
    pub labels: LabelTable,
}

impl Tables {
    /// Remove everything a client with `cluster` added.
    ///
    /// Every name, metric, indom and label set a client contributes is keyed
    /// by its own cluster, so this undoes exactly one client's walk.
    fn remove_cluster(&mut self, cluster: u32) {
        self.names.retain(|_, pmid| pmid.cluster() != cluster);
        self.metrics.retain(|pmid, _| pmid.cluster() != cluster);
        self.indoms.retain(|id, _| id.client_cluster() != cluster);
        self.labels.remove_cluster(cluster);
    }
}

// ----------------------------------------------------------------------------
// 20.2 Catalog
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct Catalog {
    domain: u32,
    prefix: CompactString,
    /// Scan sequence number that produced this catalog.
    sequence: u64,
    built_at: Timestamp,
    clients: Vec<Arc<Client>>,
    tables: Tables,
}

/// Short summary for logs and the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogSummary {
    pub sequence: u64,
    pub clients: usize,
    pub metrics: usize,
    pub indoms: usize,
    pub label_sets: usize,
}

impl Catalog {
    /// Catalog holding only the control metrics.
    pub fn empty(domain: u32, prefix: &str) -> Self {
        CatalogBuilder::new(domain, prefix).finish(0)
    }

    pub fn domain(&self) -> u32 {
        self.domain
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn built_at(&self) -> Timestamp {
        self.built_at
    }

    pub fn clients(&self) -> &[Arc<Client>] {
        &self.clients
    }

    pub fn client(&self, index: usize) -> Option<&Arc<Client>> {
        self.clients.get(index)
    }

    pub fn lookup(&self, name: &str) -> Option<PmId> {
        self.tables.names.get(name).copied()
    }

    pub fn name_of(&self, pmid: PmId) -> Option<&str> {
        self.tables.metrics.get(&pmid).map(|m| m.desc.name.as_str())
    }

    pub fn metric(&self, pmid: PmId) -> Option<&MetricEntry> {
        self.tables.metrics.get(&pmid)
    }

    /// All metrics, ordered by identifier.
    pub fn metrics(&self) -> Vec<&MetricEntry> {
        let mut out: Vec<&MetricEntry> = self.tables.metrics.values().collect();
        out.sort_by_key(|m| m.desc.pmid);
        out
    }

    /// Names directly below `prefix` (`"mmv"` gives `"app"`, `"reload"`, ...).
    pub fn children(&self, prefix: &str) -> BTreeSet<&str> {
        self.tables
            .names
            .keys()
            .filter_map(|name| name.strip_prefix(prefix)?.strip_prefix('.'))
            .map(|rest| rest.split('.').next().unwrap_or(rest))
            .collect()
    }

    pub fn indom(&self, id: InDomId) -> Option<&InstanceDomain> {
        self.tables.indoms.get(&id)
    }

    pub fn indoms(&self) -> impl Iterator<Item = &InstanceDomain> {
        self.tables.indoms.values()
    }

    pub fn instances(&self, id: InDomId) -> Option<&[Instance]> {
        self.indom(id).map(|d| d.instances.as_slice())
    }

    pub fn instance_by_name(&self, id: InDomId, name: &str) -> Option<&Instance> {
        self.indom(id)?.find_by_name(name)
    }

    pub fn instance_by_id(&self, id: InDomId, instance: i32) -> Option<&Instance> {
        self.indom(id)?.find_by_id(instance)
    }

    pub fn labels(&self, target: &LabelTarget) -> Option<&LabelSet> {
        self.tables.labels.get(target)
    }

    pub fn label_table(&self) -> &LabelTable {
        &self.tables.labels
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Client metrics only; control metrics are not counted.
    pub fn metric_count(&self) -> usize {
        self.tables
            .metrics
            .values()
            .filter(|m| matches!(m.source, MetricSource::Client { .. }))
            .count()
    }

    pub fn indom_count(&self) -> usize {
        self.tables.indoms.len()
    }

    /// Same set of names bound to the same identifiers.
    pub fn same_names(&self, other: &Catalog) -> bool {
        let theirs = &other.tables.names;
        self.tables.names.len() == theirs.len()
            && self.tables.names.iter().all(|(name, pmid)| theirs.get(name) == Some(pmid))
    }

    pub fn same_labels(&self, other: &Catalog) -> bool {
        let table = &self.tables.labels;
        let theirs = &other.tables.labels;
        table.len() == theirs.len() && table.iter().all(|(target, set)| theirs.get(target) == Some(set))
    }

    pub fn summary(&self) -> CatalogSummary {
        CatalogSummary {
            sequence: self.sequence,
            clients: self.client_count(),
            metrics: self.metric_count(),
            indoms: self.indom_count(),
            label_sets: self.tables.labels.len(),
        }
    }
}

// ----------------------------------------------------------------------------
// 20.3 Cluster Allocation
// ----------------------------------------------------------------------------

/// Hands out per-client cluster ids for one scan.
#[derive(Debug, Default)]
pub struct ClusterAllocator {
    used: BTreeSet<u32>,
}

impl ClusterAllocator {
    /// Honour `requested` when free, otherwise take the lowest unused id.
    pub fn assign(&mut self, requested: u32, client: &str) -> Result<u32, HeaderError> {
        if requested > MAX_CLIENT_CLUSTER {
            return Err(HeaderError::BadCluster { cluster: requested as i32 });
        }
        if requested != 0 {
            if self.used.insert(requested) {
                return Ok(requested);
            }
            warn!(target: "mmv::scan", client, requested, "requested cluster already in use, assigning another");
        }
        let free = (1..=MAX_CLIENT_CLUSTER)
            .find(|c| !self.used.contains(c))
            .ok_or(HeaderError::BadCluster { cluster: requested as i32 })?;
        self.used.insert(free);
        Ok(free)
    }

    /// Give back the id of a client that was not loaded after all.
    pub fn release(&mut self, cluster: u32) {
        self.used.remove(&cluster);
    }
}

// ----------------------------------------------------------------------------
// 20.4 Builder
// ----------------------------------------------------------------------------

/// A file whose header validated and is ready for its sections to be walked.
#[derive(Debug)]
pub struct Candidate {
    pub name: CompactString,
    pub path: PathBuf,
    pub region: Region,
    pub header: Header,
}

/// What became of one candidate.
#[derive(Debug)]
pub enum Admission {
    Loaded(Arc<Client>),
    /// Left out for good, until the file changes.
    Rejected,
    /// Rewritten while it was being read; retry on the next scan.
    Unstable,
}

pub struct CatalogBuilder {
    domain: u32,
    prefix: CompactString,
    clients: Vec<Arc<Client>>,
    clusters: ClusterAllocator,
    tables: Tables,
}

impl CatalogBuilder {
    pub fn new(domain: u32, prefix: &str) -> Self {
        let mut tables = Tables::default();
        for metric in ControlMetric::ALL {
            let entry = MetricEntry::control(domain, prefix, metric);
            tables.names.insert(entry.desc.name.clone(), entry.desc.pmid);
            tables.metrics.insert(entry.desc.pmid, entry);
        }
        Self {
            domain,
            prefix: prefix.into(),
            clients: Vec::new(),
            clusters: ClusterAllocator::default(),
            tables,
        }
    }

    /// Walk a validated client into the tables.
    ///
    /// Broken sections and records are logged, counted and skipped. If the
    /// generation pair moved while the sections were read, everything the
    /// client added is taken out again. Only an allocation failure is
    /// returned as an error.
    pub fn add_client(&mut self, candidate: Candidate, stats: &ScanStats) -> MmvResult<Admission> {
        let Candidate { name, path, region, header } = candidate;
        let cluster = match self.clusters.assign(header.requested_cluster, &name) {
            Ok(cluster) => cluster,
            Err(e) => {
                let e = MmvError::from(e);
                warn!(target: "mmv::scan", client = %name, error = %e, "client rejected");
                stats.record(&e);
                return Ok(Admission::Rejected);
            }
        };

        let values = {
            let scope = ClientScope {
                index: self.clients.len(),
                name: &name,
                cluster,
                domain: self.domain,
                prefix: &self.prefix,
                flags: header.flags,
                version: header.version,
            };
            let cursor = ByteCursor::new(region.as_bytes());
            let mut sink = ClientSink {
                tables: &mut self.tables,
                scope: &scope,
                cursor,
                stats,
                metrics: MetricTableBuilder::new(),
                values: SmallVec::new(),
                fatal: None,
            };
            TocWalker::new(cursor, &header).walk(&mut sink);
            if let Some(fatal) = sink.fatal {
                return Err(fatal);
            }
            sink.values
        };

        fence(Ordering::Acquire);
        let after = GenerationPair::read(&ByteCursor::new(region.as_bytes())).ok();
        if !matches!(after, Some(g) if g.g1 == header.generation && g.g2 == header.generation) {
            debug!(target: "mmv::scan", client = %name, generation = header.generation, ?after, "client rewritten during load");
            self.tables.remove_cluster(cluster);
            self.clusters.release(cluster);
            return Ok(Admission::Unstable);
        }

        self.clients
            .try_reserve(1)
            .map_err(|e| MmvError::fatal(format!("cannot grow client list: {e}")))?;
        let client = Arc::new(Client::new(name, path, region, header, cluster, values));
        debug!(
            target: "mmv::scan",
            client = %client.name,
            cluster,
            version = %client.header.version,
            generation = client.header.generation,
            "client loaded"
        );
        self.clients.push(Arc::clone(&client));
        Ok(Admission::Loaded(client))
    }

    pub fn finish(self, sequence: u64) -> Catalog {
        Catalog {
            domain: self.domain,
            prefix: self.prefix,
            sequence,
            built_at: Timestamp::now(),
            clients: self.clients,
            tables: self.tables,
        }
    }
}

/// Routes the sections of one client to the record builders.
struct ClientSink<'s, 'c> {
    tables: &'s mut Tables,
    scope: &'s ClientScope<'c>,
    cursor: ByteCursor<'s>,
    stats: &'s ScanStats,
    metrics: MetricTableBuilder,
    values: SmallVec<[Section; 1]>,
    fatal: Option<MmvError>,
}

impl ClientSink<'_, '_> {
    /// Log and count a skipped record. Returns false once the scan must stop.
    fn skip(&mut self, error: MmvError, offset: u64) -> bool {
        if error.class() == ErrorClass::Fatal {
            self.fatal = Some(error);
            return false;
        }
        warn!(target: "mmv::scan", client = self.scope.name, offset, %error, "record skipped");
        self.stats.record(&error);
        true
    }

    fn each_record<T>(
        &mut self,
        section: &Section,
        mut add: impl FnMut(&mut Self, u64) -> MmvResult<T>,
    ) {
        if self.fatal.is_some() {
            return;
        }
        for offset in section.records() {
            if let Err(error) = add(self, offset) {
                if !self.skip(error, offset) {
                    return;
                }
            }
        }
    }
}

impl SectionSink for ClientSink<'_, '_> {
    fn metrics(&mut self, section: &Section) {
        self.each_record(section, |sink, offset| {
            sink.metrics.add(sink.tables, sink.scope, &sink.cursor, offset)
        });
    }

    fn indoms(&mut self, section: &Section) {
        self.each_record(section, |sink, offset| {
            IndomBuilder.add(sink.tables, sink.scope, &sink.cursor, offset)
        });
    }

    fn values(&mut self, section: &Section) {
        self.values.push(*section);
    }

    fn labels(&mut self, section: &Section) {
        self.each_record(section, |sink, offset| {
            LabelDecoder.add(sink.tables, sink.scope, &sink.cursor, offset)
        });
    }

    fn rejected(&mut self, error: SectionError) {
        debug!(target: "mmv::toc", client = self.scope.name, %error, "section skipped");
        self.stats.record(&error.into());
    }
}
