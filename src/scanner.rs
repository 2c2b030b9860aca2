//! Directory scanning, reload detection and the request-facing agent.
//!
//! The agent owns one published [`Catalog`]. Every request first asks the
//! reload detector whether the catalog is stale; if so the whole directory is
//! rescanned into a fresh catalog which then replaces the old one in a single
//! swap. Readers holding the old catalog keep it alive until they drop it.

use std::fmt::{self, Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::SystemTime;

use ahash::AHashMap;
use arc_swap::ArcSwap;
use compact_str::CompactString;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::catalog::{Admission, Candidate, Catalog, CatalogBuilder};
use crate::client::Region;
use crate::constants::{CONTROL_CLUSTER, HEADER_SIZE};
use crate::control::ControlMetric;
use crate::cursor::ByteCursor;
use crate::error::{ErrorClass, FetchError, HeaderError, MmvError, MmvResult, ScanStats, ScanStatsSummary, StoreError, TextError};
use crate::format;
use crate::header::{self, HeaderStatus};
use crate::metrics::MetricSource;
use crate::process::{ProcessProbe, SystemProbe};
use crate::types::{InDomId, PmId, Timestamp};
use crate::values::{AtomValue, ValueReader};

// ============================================================================
// SECTION 22: DIRECTORY SCANNER & RELOAD DETECTOR
// ============================================================================

// ----------------------------------------------------------------------------
// 22.1 Options & Reports
// ----------------------------------------------------------------------------

/// What the agent scans and how it names things.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOptions {
    pub stats_dir: PathBuf,
    pub prefix: CompactString,
    pub domain: u32,
}

/// Why a rescan was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum ReloadReason {
    FirstScan,
    Requested,
    DirectoryChanged,
    DirectoryUnreachable { errno: i32 },
    DirectoryReachable,
    GenerationChanged { client: CompactString },
    OwnerGone { client: CompactString, pid: i32 },
}

impl Display for ReloadReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ReloadReason::FirstScan => f.write_str("first scan"),
            ReloadReason::Requested => f.write_str("reload requested"),
            ReloadReason::DirectoryChanged => f.write_str("directory modified"),
            ReloadReason::DirectoryUnreachable { errno } => write!(f, "directory unreachable (errno {errno})"),
            ReloadReason::DirectoryReachable => f.write_str("directory reachable again"),
            ReloadReason::GenerationChanged { client } => write!(f, "client {client} rewritten"),
            ReloadReason::OwnerGone { client, pid } => write!(f, "owner {pid} of client {client} exited"),
        }
    }
}

/// Outcome of one rescan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub sequence: u64,
    pub reason: ReloadReason,
    pub clients: usize,
    pub metrics: usize,
    pub indoms: usize,
    pub rejected: usize,
    pub unstable: usize,
    pub names_changed: bool,
    pub labels_changed: bool,
    pub elapsed_us: u64,
}

/// Which help text to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    OneLine,
    Help,
}

// ----------------------------------------------------------------------------
// 22.2 Detector State
// ----------------------------------------------------------------------------

/// Directory state recorded at the start of the last scan.
#[derive(Debug, Default)]
struct DirState {
    scanned: bool,
    mtime: Option<SystemTime>,
    errno: Option<i32>,
}

/// Identity of a file version, used to log a structural rejection once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    mtime: Option<SystemTime>,
    len: u64,
}

enum DirProbe {
    Present(Option<SystemTime>),
    Missing(i32),
}

fn probe_dir(path: &Path) -> DirProbe {
    match fs::metadata(path) {
        Ok(meta) => DirProbe::Present(meta.modified().ok()),
        Err(e) => DirProbe::Missing(e.raw_os_error().unwrap_or(-1)),
    }
}

// ----------------------------------------------------------------------------
// 22.3 Agent
// ----------------------------------------------------------------------------

pub struct Agent {
    options: AgentOptions,
    catalog: ArcSwap<Catalog>,
    probe: Arc<dyn ProcessProbe>,
    dir: Mutex<DirState>,
    /// Serialises rescans; readers never take it.
    scan_lock: Mutex<()>,
    rejected: Mutex<AHashMap<PathBuf, FileStamp>>,
    reload_requested: AtomicBool,
    names_changed: AtomicBool,
    labels_changed: AtomicBool,
    debug: AtomicI32,
    sequence: AtomicU64,
    stats: ScanStats,
}

impl Agent {
    pub fn new(options: AgentOptions) -> Self {
        Self::with_probe(options, Arc::new(SystemProbe))
    }

    pub fn with_probe(options: AgentOptions, probe: Arc<dyn ProcessProbe>) -> Self {
        let catalog = Catalog::empty(options.domain, &options.prefix);
        Self {
            options,
            catalog: ArcSwap::from_pointee(catalog),
            probe,
            dir: Mutex::new(DirState::default()),
            scan_lock: Mutex::new(()),
            rejected: Mutex::new(AHashMap::new()),
            reload_requested: AtomicBool::new(false),
            names_changed: AtomicBool::new(false),
            labels_changed: AtomicBool::new(false),
            debug: AtomicI32::new(0),
            sequence: AtomicU64::new(0),
            stats: ScanStats::new(),
        }
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    /// The catalog as of the last completed scan.
    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog.load_full()
    }

    pub fn stats(&self) -> ScanStatsSummary {
        self.stats.summary()
    }

    pub fn debug_level(&self) -> i32 {
        self.debug.load(AtomicOrdering::Relaxed)
    }

    pub fn reload_pending(&self) -> bool {
        self.reload_requested.load(AtomicOrdering::Acquire)
    }

    pub fn request_reload(&self) {
        self.reload_requested.store(true, AtomicOrdering::Release);
    }

    /// Whether catalog membership changed since the last call.
    pub fn take_names_changed(&self) -> bool {
        self.names_changed.swap(false, AtomicOrdering::AcqRel)
    }

    /// Whether any label set changed since the last call.
    pub fn take_labels_changed(&self) -> bool {
        self.labels_changed.swap(false, AtomicOrdering::AcqRel)
    }

    // ------------------------------------------------------------------------
    // Reload detection
    // ------------------------------------------------------------------------

    /// First reason the published catalog is stale, if any.
    pub fn needs_rescan(&self) -> Option<ReloadReason> {
        {
            let dir = self.dir.lock();
            if !dir.scanned {
                return Some(ReloadReason::FirstScan);
            }
            if self.reload_pending() {
                return Some(ReloadReason::Requested);
            }
            match probe_dir(&self.options.stats_dir) {
                DirProbe::Present(_) if dir.errno.is_some() => return Some(ReloadReason::DirectoryReachable),
                DirProbe::Present(mtime) if mtime != dir.mtime => return Some(ReloadReason::DirectoryChanged),
                DirProbe::Missing(errno) if dir.errno != Some(errno) => {
                    return Some(ReloadReason::DirectoryUnreachable { errno })
                }
                _ => {}
            }
        }

        let catalog = self.catalog.load();
        for client in catalog.clients() {
            if client.generation_changed() {
                return Some(ReloadReason::GenerationChanged { client: client.name.clone() });
            }
            if !client.owner_alive(self.probe.as_ref()) {
                let pid = client.header.process.unwrap_or_default();
                return Some(ReloadReason::OwnerGone { client: client.name.clone(), pid });
            }
        }
        None
    }

    /// Rescan if anything changed since the last scan.
    pub fn reload_maybe(&self) -> MmvResult<Option<ScanReport>> {
        match self.needs_rescan() {
            Some(reason) => self.rescan(reason).map(Some),
            None => Ok(None),
        }
    }

    /// Rebuild the catalog from scratch and publish it.
    ///
    /// Only an allocation failure is returned as an error; every per-file
    /// problem just leaves that file out of the new catalog.
    pub fn rescan(&self, reason: ReloadReason) -> MmvResult<ScanReport> {
        let _scan = self.scan_lock.lock();
        let started = Timestamp::now();
        self.reload_requested.store(false, AtomicOrdering::Release);
        debug!(target: "mmv::scan", %reason, dir = %self.options.stats_dir.display(), "rescanning");

        {
            let mut dir = self.dir.lock();
            dir.scanned = true;
            match probe_dir(&self.options.stats_dir) {
                DirProbe::Present(mtime) => {
                    dir.mtime = mtime;
                    dir.errno = None;
                }
                DirProbe::Missing(errno) => {
                    dir.mtime = None;
                    dir.errno = Some(errno);
                }
            }
        }

        let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        let mut builder = CatalogBuilder::new(self.options.domain, &self.options.prefix);
        let mut rejected = 0;
        let mut unstable = 0;

        let candidates = self.candidates();
        for (name, path) in &candidates {
            match self.open(name, path) {
                Ok(Some(candidate)) => match builder.add_client(candidate, &self.stats)? {
                    Admission::Loaded(_) => {
                        self.stats.clients_loaded.fetch_add(1, AtomicOrdering::Relaxed);
                    }
                    Admission::Rejected => rejected += 1,
                    Admission::Unstable => {
                        unstable += 1;
                        self.stats.clients_unstable.fetch_add(1, AtomicOrdering::Relaxed);
                        self.request_reload();
                    }
                },
                Ok(None) => {
                    unstable += 1;
                    self.stats.clients_unstable.fetch_add(1, AtomicOrdering::Relaxed);
                    self.request_reload();
                }
                Err(error) => {
                    match error.class() {
                        ErrorClass::Transient => unstable += 1,
                        ErrorClass::Fatal => return Err(error),
                        _ => rejected += 1,
                    }
                    self.stats.record(&error);
                }
            }
        }

        self.rejected.lock().retain(|path, _| candidates.iter().any(|(_, seen)| seen == path));

        let catalog = builder.finish(sequence);
        let previous = self.catalog.load();
        let names_changed = !catalog.same_names(&previous);
        let labels_changed = !catalog.same_labels(&previous);
        drop(previous);
        if names_changed {
            self.names_changed.store(true, AtomicOrdering::Release);
        }
        if labels_changed {
            self.labels_changed.store(true, AtomicOrdering::Release);
        }

        let report = ScanReport {
            sequence,
            reason,
            clients: catalog.client_count(),
            metrics: catalog.metric_count(),
            indoms: catalog.indom_count(),
            rejected,
            unstable,
            names_changed,
            labels_changed,
            elapsed_us: Timestamp::now().duration_since(started).as_micros() as u64,
        };
        self.catalog.store(Arc::new(catalog));
        self.stats.scans.fetch_add(1, AtomicOrdering::Relaxed);

        info!(
            target: "mmv::scan",
            sequence,
            reason = %report.reason,
            clients = report.clients,
            metrics = report.metrics,
            indoms = report.indoms,
            rejected,
            unstable,
            names_changed,
            "scan complete"
        );
        Ok(report)
    }

    /// Regular files of the stats directory, by name, dot files excluded.
    fn candidates(&self) -> Vec<(CompactString, PathBuf)> {
        let entries = match fs::read_dir(&self.options.stats_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(target: "mmv::scan", dir = %self.options.stats_dir.display(), error = %e, "cannot read directory");
                return Vec::new();
            }
        };
        let mut out: Vec<(CompactString, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    debug!(target: "mmv::scan", name = ?entry.file_name(), "skipping non UTF-8 file name");
                    return None;
                };
                if name.starts_with('.') {
                    return None;
                }
                let path = entry.path();
                // Follows symlinks, like the producers' own tooling.
                let is_file = fs::metadata(&path).map(|m| m.is_file()).unwrap_or(false);
                is_file.then(|| (CompactString::from(name), path))
            })
            .collect();
        out.sort();
        out
    }

    /// Map and validate one file. `Ok(None)` means "mid-write, retry later".
    fn open(&self, name: &str, path: &Path) -> MmvResult<Option<Candidate>> {
        let meta = fs::metadata(path).map_err(|e| MmvError::io(path, e))?;
        let stamp = FileStamp { mtime: meta.modified().ok(), len: meta.len() };

        let error = if meta.len() < HEADER_SIZE as u64 {
            // Empty files cannot be mapped; reject before trying.
            HeaderError::TooSmall { len: meta.len(), min: HEADER_SIZE }
        } else {
            let region = Region::map(path).map_err(|e| MmvError::io(path, e))?;
            let status = header::decode(&ByteCursor::new(region.as_bytes()), self.probe.as_ref());
            match status {
                Ok(HeaderStatus::Stable(header)) => {
                    self.rejected.lock().remove(path);
                    trace!(target: "mmv::scan", client = name, version = %header.version, "header accepted");
                    return Ok(Some(Candidate { name: name.into(), path: path.to_path_buf(), region, header }));
                }
                Ok(HeaderStatus::Unstable(instability)) => {
                    debug!(target: "mmv::scan", client = name, ?instability, "client not stable, will retry");
                    return Ok(None);
                }
                Err(e) => e,
            }
        };

        if error.class() == ErrorClass::Transient {
            debug!(target: "mmv::scan", client = name, %error, "client skipped this round");
        } else if self.rejected.lock().insert(path.to_path_buf(), stamp) == Some(stamp) {
            debug!(target: "mmv::scan", client = name, %error, "client still rejected");
        } else {
            warn!(target: "mmv::scan", client = name, %error, "client rejected");
        }
        Err(error.into())
    }

    // ------------------------------------------------------------------------
    // Request path
    // ------------------------------------------------------------------------

    /// Resolve a name, refreshing the catalog first.
    pub fn lookup(&self, name: &str) -> MmvResult<Option<PmId>> {
        self.reload_maybe()?;
        Ok(self.catalog.load().lookup(name))
    }

    /// Fetch one value, refreshing the catalog first.
    pub fn fetch(&self, pmid: PmId, instance: Option<i32>) -> MmvResult<Option<AtomValue>> {
        self.reload_maybe()?;
        self.value(pmid, instance).map_err(MmvError::from)
    }

    /// Fetch against the current catalog without checking for reloads.
    pub fn value(&self, pmid: PmId, instance: Option<i32>) -> Result<Option<AtomValue>, FetchError> {
        self.value_at(pmid, instance, Timestamp::now())
    }

    pub fn value_at(&self, pmid: PmId, instance: Option<i32>, now: Timestamp) -> Result<Option<AtomValue>, FetchError> {
        let catalog = self.catalog.load();
        if let Some(metric) = self.control_metric(pmid) {
            return Ok(Some(self.control_value(metric, &catalog)));
        }
        let result = ValueReader::new(&catalog).fetch_at(pmid, instance, now);
        if let Err(FetchError::Unstable { client }) = &result {
            debug!(target: "mmv::fetch", client = client.as_str(), %pmid, "client changed under a read, scheduling reload");
            self.request_reload();
        }
        result
    }

    fn control_metric(&self, pmid: PmId) -> Option<ControlMetric> {
        if pmid.domain() != self.options.domain {
            return None;
        }
        ControlMetric::from_item(pmid.cluster(), pmid.item())
    }

    fn control_value(&self, metric: ControlMetric, catalog: &Catalog) -> AtomValue {
        let count = |n: usize| AtomValue::U32(u32::try_from(n).unwrap_or(u32::MAX));
        match metric {
            ControlMetric::Reload => AtomValue::I32(i32::from(self.reload_pending())),
            ControlMetric::Debug => AtomValue::I32(self.debug_level()),
            ControlMetric::Files => count(catalog.client_count()),
            ControlMetric::Metrics => count(catalog.metric_count()),
            ControlMetric::Indoms => count(catalog.indom_count()),
        }
    }

    /// Store into a control metric.
    pub fn store(&self, pmid: PmId, values: &[i64]) -> Result<(), StoreError> {
        if pmid.domain() != self.options.domain || pmid.cluster() != CONTROL_CLUSTER {
            return Err(StoreError::PermissionDenied { pmid });
        }
        let [value] = values else {
            return Err(StoreError::BadStore { pmid, numval: values.len() });
        };
        match ControlMetric::from_item(pmid.cluster(), pmid.item()) {
            Some(ControlMetric::Reload) => {
                if *value != 0 {
                    info!(target: "mmv::scan", "reload requested by store");
                    self.request_reload();
                }
                Ok(())
            }
            Some(ControlMetric::Debug) => {
                let level = i32::try_from(*value).unwrap_or(i32::MAX);
                self.debug.store(level, AtomicOrdering::Relaxed);
                info!(target: "mmv::scan", level, "debug level changed");
                Ok(())
            }
            // control.files, control.metrics, control.indoms and unknown items.
            _ => Err(StoreError::PermissionDenied { pmid }),
        }
    }

    // ------------------------------------------------------------------------
    // Help text
    // ------------------------------------------------------------------------

    pub fn text(&self, pmid: PmId, kind: TextKind) -> Result<String, TextError> {
        let catalog = self.catalog.load();
        let missing = TextError::NoMetricText(pmid);
        let entry = catalog.metric(pmid).ok_or(missing.clone())?;
        match entry.source {
            MetricSource::Control(metric) => Ok(match kind {
                TextKind::OneLine => metric.oneline(),
                TextKind::Help => metric.help(),
            }
            .to_string()),
            MetricSource::Client { client, shorttext, helptext, .. } => {
                let offset = match kind {
                    TextKind::OneLine => shorttext,
                    TextKind::Help => helptext,
                };
                read_client_text(&catalog, client, offset).ok_or(missing)
            }
        }
    }

    pub fn indom_text(&self, indom: InDomId, kind: TextKind) -> Result<String, TextError> {
        let catalog = self.catalog.load();
        let domain = catalog.indom(indom).ok_or(TextError::NoIndomText(indom))?;
        let offset = match kind {
            TextKind::OneLine => domain.shorttext,
            TextKind::Help => domain.helptext,
        };
        read_client_text(&catalog, domain.client, offset).ok_or(TextError::NoIndomText(indom))
    }
}

fn read_client_text(catalog: &Catalog, client: usize, offset: u64) -> Option<String> {
    let client = catalog.client(client)?;
    client.read_stable(|cursor| format::read_text(cursor, offset)).ok().flatten()
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("options", &self.options)
            .field("catalog", &self.catalog.load().summary())
            .field("reload_requested", &self.reload_pending())
            .finish()
    }
}
