//! Test-only builder for export files, well-formed or deliberately broken.
//!
//! Shared by unit tests (`crate::fixture`) and the integration suites
//! (included by path), so it only depends on std.

#![allow(dead_code)]

// ============================================================================
// SECTION 23: TEST FIXTURES
// ============================================================================

pub const TYPE_I32: i32 = 0;
pub const TYPE_U32: i32 = 1;
pub const TYPE_I64: i32 = 2;
pub const TYPE_U64: i32 = 3;
pub const TYPE_FLOAT: i32 = 4;
pub const TYPE_DOUBLE: i32 = 5;
pub const TYPE_STRING: i32 = 6;
pub const TYPE_ELAPSED: i32 = 9;

pub const SEM_COUNTER: i32 = 1;
pub const SEM_INSTANT: i32 = 3;
pub const SEM_DISCRETE: i32 = 4;

pub const FLAG_NOPREFIX: u32 = 0x1;
pub const FLAG_PROCESS: u32 = 0x2;
pub const FLAG_SENTINEL: u32 = 0x4;

pub const LABEL_CLUSTER: u32 = 0x08;
pub const LABEL_ITEM: u32 = 0x10;
pub const LABEL_INDOM: u32 = 0x04;
pub const LABEL_INSTANCES: u32 = 0x20;
pub const LABEL_OPTIONAL: u32 = 0x80;

pub const SCALAR: u32 = u32::MAX;

pub const TOC_INDOMS: i32 = 1;
pub const TOC_INSTANCES: i32 = 2;
pub const TOC_METRICS: i32 = 3;
pub const TOC_VALUES: i32 = 4;
pub const TOC_STRINGS: i32 = 5;
pub const TOC_LABELS: i32 = 6;

pub const HEADER: usize = 40;
pub const TOC: usize = 16;
const INDOM: usize = 32;
const VALUE: usize = 32;
const STRING: usize = 256;
const LABEL: usize = 256;
const NAMEMAX: usize = 64;

pub const G1_AT: usize = 8;
pub const G2_AT: usize = 16;

#[derive(Debug, Clone)]
pub struct MetricSpec {
    pub name: String,
    pub item: u32,
    pub type_code: i32,
    pub semantics: i32,
    pub dimension: u32,
    pub indom: u32,
    pub shorttext: Option<String>,
    pub helptext: Option<String>,
}

impl MetricSpec {
    pub fn new(name: &str, item: u32, type_code: i32) -> Self {
        Self {
            name: name.to_string(),
            item,
            type_code,
            semantics: SEM_COUNTER,
            dimension: 0,
            indom: SCALAR,
            shorttext: None,
            helptext: None,
        }
    }

    pub fn indom(mut self, serial: u32) -> Self {
        self.indom = serial;
        self
    }

    pub fn semantics(mut self, semantics: i32) -> Self {
        self.semantics = semantics;
        self
    }

    pub fn text(mut self, short: &str, long: &str) -> Self {
        self.shorttext = Some(short.to_string());
        self.helptext = Some(long.to_string());
        self
    }
}

#[derive(Debug, Clone)]
struct IndomSpec {
    serial: u32,
    instances: Vec<(i32, String)>,
    shorttext: Option<String>,
    helptext: Option<String>,
}

#[derive(Debug, Clone)]
enum Payload {
    Raw([u8; 8], i64),
    Str(String),
}

#[derive(Debug, Clone)]
struct ValueSpec {
    metric: usize,
    instance: Option<i32>,
    payload: Payload,
}

#[derive(Debug, Clone)]
struct LabelSpec {
    flags: u32,
    identity: u32,
    internal: i32,
    payload: String,
}

/// Byte offsets of everything the builder laid out.
#[derive(Debug, Clone, Default)]
pub struct Layout {
    pub len: usize,
    /// (section type, offset of the toc entry) in emission order.
    pub toc_entries: Vec<(i32, usize)>,
    pub indoms: usize,
    pub instances: usize,
    pub metrics: usize,
    pub values: usize,
    pub labels: usize,
    pub strings: usize,
    pub metric_size: usize,
    pub instance_size: usize,
}

impl Layout {
    pub fn toc_entry(&self, kind: i32) -> usize {
        self.toc_entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, at)| *at)
            .expect("section not emitted")
    }

    pub fn metric(&self, index: usize) -> usize {
        self.metrics + index * self.metric_size
    }

    pub fn value(&self, index: usize) -> usize {
        self.values + index * VALUE
    }
}

/// Export file builder.
#[derive(Debug, Clone)]
pub struct MmvFile {
    version: i32,
    g1: u64,
    g2: u64,
    flags: u32,
    process: i32,
    cluster: i32,
    tocs_override: Option<i32>,
    metrics: Vec<MetricSpec>,
    indoms: Vec<IndomSpec>,
    values: Vec<ValueSpec>,
    labels: Vec<LabelSpec>,
}

impl MmvFile {
    pub fn new(version: i32) -> Self {
        Self {
            version,
            g1: 1,
            g2: 1,
            flags: 0,
            process: 0,
            cluster: 0,
            tocs_override: None,
            metrics: Vec::new(),
            indoms: Vec::new(),
            values: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn raw_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    pub fn generations(mut self, g1: u64, g2: u64) -> Self {
        self.g1 = g1;
        self.g2 = g2;
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags |= flags;
        self
    }

    pub fn process(mut self, pid: i32) -> Self {
        self.flags |= FLAG_PROCESS;
        self.process = pid;
        self
    }

    pub fn cluster(mut self, cluster: i32) -> Self {
        self.cluster = cluster;
        self
    }

    /// Write this table-of-contents count instead of the real one.
    pub fn raw_tocs(mut self, tocs: i32) -> Self {
        self.tocs_override = Some(tocs);
        self
    }

    pub fn metric(self, name: &str, item: u32, type_code: i32) -> Self {
        self.add_metric(MetricSpec::new(name, item, type_code))
    }

    pub fn add_metric(mut self, spec: MetricSpec) -> Self {
        self.metrics.push(spec);
        self
    }

    pub fn indom(mut self, serial: u32, instances: &[(i32, &str)]) -> Self {
        self.indoms.push(IndomSpec {
            serial,
            instances: instances.iter().map(|(id, n)| (*id, n.to_string())).collect(),
            shorttext: None,
            helptext: None,
        });
        self
    }

    pub fn indom_text(mut self, serial: u32, short: &str, long: &str) -> Self {
        if let Some(indom) = self.indoms.iter_mut().find(|i| i.serial == serial) {
            indom.shorttext = Some(short.to_string());
            indom.helptext = Some(long.to_string());
        }
        self
    }

    /// Value for metric number `metric` (in insertion order).
    pub fn value(mut self, metric: usize, instance: Option<i32>, raw: [u8; 8], extra: i64) -> Self {
        self.values.push(ValueSpec { metric, instance, payload: Payload::Raw(raw, extra) });
        self
    }

    pub fn value_u64(self, metric: usize, instance: Option<i32>, v: u64) -> Self {
        self.value(metric, instance, v.to_ne_bytes(), 0)
    }

    pub fn value_i64(self, metric: usize, instance: Option<i32>, v: i64) -> Self {
        self.value(metric, instance, v.to_ne_bytes(), 0)
    }

    pub fn value_u32(self, metric: usize, instance: Option<i32>, v: u32) -> Self {
        let mut raw = [0u8; 8];
        raw[..4].copy_from_slice(&v.to_ne_bytes());
        self.value(metric, instance, raw, 0)
    }

    pub fn value_f64(self, metric: usize, instance: Option<i32>, v: f64) -> Self {
        self.value(metric, instance, v.to_ne_bytes(), 0)
    }

    pub fn value_str(mut self, metric: usize, instance: Option<i32>, s: &str) -> Self {
        self.values.push(ValueSpec { metric, instance, payload: Payload::Str(s.to_string()) });
        self
    }

    pub fn label(mut self, flags: u32, identity: u32, internal: i32, payload: &str) -> Self {
        self.labels.push(LabelSpec { flags, identity, internal, payload: payload.to_string() });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        self.build_with_layout().0
    }

    pub fn build_with_layout(&self) -> (Vec<u8>, Layout) {
        let v1 = self.version == 1;
        let metric_size = if v1 { 104 } else { 48 };
        let instance_size = if v1 { 80 } else { 24 };

        // String table contents, in allocation order.
        let mut strings: Vec<String> = Vec::new();
        let mut intern = |s: &str| {
            strings.push(s.to_string());
            strings.len() - 1
        };
        let metric_names: Vec<Option<usize>> =
            self.metrics.iter().map(|m| (!v1).then(|| intern(&m.name))).collect();
        let metric_text: Vec<(Option<usize>, Option<usize>)> = self
            .metrics
            .iter()
            .map(|m| (m.shorttext.as_deref().map(&mut intern), m.helptext.as_deref().map(&mut intern)))
            .collect();
        let indom_text: Vec<(Option<usize>, Option<usize>)> = self
            .indoms
            .iter()
            .map(|i| (i.shorttext.as_deref().map(&mut intern), i.helptext.as_deref().map(&mut intern)))
            .collect();
        let instance_names: Vec<Vec<Option<usize>>> = self
            .indoms
            .iter()
            .map(|i| i.instances.iter().map(|(_, n)| (!v1).then(|| intern(n))).collect())
            .collect();
        let value_strings: Vec<Option<usize>> = self
            .values
            .iter()
            .map(|v| match &v.payload {
                Payload::Str(s) => Some(intern(s)),
                Payload::Raw(..) => None,
            })
            .collect();

        let n_instances: usize = self.indoms.iter().map(|i| i.instances.len()).sum();

        let mut sections: Vec<(i32, usize)> = Vec::new();
        if !self.indoms.is_empty() {
            sections.push((TOC_INDOMS, self.indoms.len()));
            sections.push((TOC_INSTANCES, n_instances));
        }
        sections.push((TOC_METRICS, self.metrics.len()));
        sections.push((TOC_VALUES, self.values.len()));
        if !self.labels.is_empty() {
            sections.push((TOC_LABELS, self.labels.len()));
        }
        if !strings.is_empty() {
            sections.push((TOC_STRINGS, strings.len()));
        }

        let mut layout = Layout { metric_size, instance_size, ..Layout::default() };
        let mut at = HEADER + TOC * sections.len();
        layout.indoms = at;
        at += INDOM * self.indoms.len();
        layout.instances = at;
        at += instance_size * n_instances;
        layout.metrics = at;
        at += metric_size * self.metrics.len();
        layout.values = at;
        at += VALUE * self.values.len();
        layout.labels = at;
        at += LABEL * self.labels.len();
        layout.strings = at;
        at += STRING * strings.len();
        layout.len = at;

        let strings_base = layout.strings;
        let string_at = |index: usize| (strings_base + index * STRING) as u64;
        let opt_string_at = |index: Option<usize>| index.map_or(0, string_at);

        let mut buf = vec![0u8; at];
        buf[0..4].copy_from_slice(b"MMV\0");
        put_i32(&mut buf, 4, self.version);
        put_u64(&mut buf, G1_AT, self.g1);
        put_u64(&mut buf, G2_AT, self.g2);
        put_i32(&mut buf, 24, self.tocs_override.unwrap_or(sections.len() as i32));
        put_u32(&mut buf, 28, self.flags);
        put_i32(&mut buf, 32, self.process);
        put_i32(&mut buf, 36, self.cluster);

        for (i, (kind, count)) in sections.iter().enumerate() {
            let entry = HEADER + i * TOC;
            let offset = match *kind {
                TOC_INDOMS => layout.indoms,
                TOC_INSTANCES => layout.instances,
                TOC_METRICS => layout.metrics,
                TOC_VALUES => layout.values,
                TOC_LABELS => layout.labels,
                _ => layout.strings,
            };
            put_i32(&mut buf, entry, *kind);
            put_i32(&mut buf, entry + 4, *count as i32);
            put_u64(&mut buf, entry + 8, offset as u64);
            layout.toc_entries.push((*kind, entry));
        }

        let mut instance_index = 0usize;
        for (i, indom) in self.indoms.iter().enumerate() {
            let rec = layout.indoms + i * INDOM;
            put_u32(&mut buf, rec, indom.serial);
            put_u32(&mut buf, rec + 4, indom.instances.len() as u32);
            put_u64(&mut buf, rec + 8, (layout.instances + instance_index * instance_size) as u64);
            put_u64(&mut buf, rec + 16, opt_string_at(indom_text[i].0));
            put_u64(&mut buf, rec + 24, opt_string_at(indom_text[i].1));
            for (j, (internal, name)) in indom.instances.iter().enumerate() {
                let inst = layout.instances + instance_index * instance_size;
                put_u64(&mut buf, inst, rec as u64);
                put_i32(&mut buf, inst + 12, *internal);
                match instance_names[i][j] {
                    Some(s) => put_u64(&mut buf, inst + 16, string_at(s)),
                    None => put_cstr(&mut buf, inst + 16, name, NAMEMAX),
                }
                instance_index += 1;
            }
        }

        for (i, m) in self.metrics.iter().enumerate() {
            let rec = layout.metric(i);
            let tail = match metric_names[i] {
                Some(s) => {
                    put_u64(&mut buf, rec, string_at(s));
                    rec + 8
                }
                None => {
                    put_cstr(&mut buf, rec, &m.name, NAMEMAX);
                    rec + NAMEMAX
                }
            };
            put_u32(&mut buf, tail, m.item);
            put_i32(&mut buf, tail + 4, m.type_code);
            put_i32(&mut buf, tail + 8, m.semantics);
            put_u32(&mut buf, tail + 12, m.dimension);
            put_u32(&mut buf, tail + 16, m.indom);
            put_u64(&mut buf, tail + 24, opt_string_at(metric_text[i].0));
            put_u64(&mut buf, tail + 32, opt_string_at(metric_text[i].1));
        }

        for (i, v) in self.values.iter().enumerate() {
            let rec = layout.value(i);
            match (&v.payload, value_strings[i]) {
                (Payload::Raw(raw, extra), _) => {
                    buf[rec..rec + 8].copy_from_slice(raw);
                    put_i64(&mut buf, rec + 8, *extra);
                }
                (Payload::Str(_), Some(s)) => put_i64(&mut buf, rec + 8, string_at(s) as i64),
                (Payload::Str(_), None) => unreachable!(),
            }
            put_u64(&mut buf, rec + 16, layout.metric(v.metric) as u64);
            if let Some(internal) = v.instance {
                put_u64(&mut buf, rec + 24, self.instance_offset(&layout, v.metric, internal) as u64);
            }
        }

        for (i, l) in self.labels.iter().enumerate() {
            let rec = layout.labels + i * LABEL;
            put_u32(&mut buf, rec, l.flags);
            put_u32(&mut buf, rec + 4, l.identity);
            put_i32(&mut buf, rec + 8, l.internal);
            put_cstr(&mut buf, rec + 12, &l.payload, 244);
        }

        for (i, s) in strings.iter().enumerate() {
            put_cstr(&mut buf, layout.strings + i * STRING, s, STRING);
        }

        (buf, layout)
    }

    fn instance_offset(&self, layout: &Layout, metric: usize, internal: i32) -> usize {
        let serial = self.metrics[metric].indom;
        let mut index = 0usize;
        for indom in &self.indoms {
            for (id, _) in &indom.instances {
                if indom.serial == serial && *id == internal {
                    return layout.instances + index * layout.instance_size;
                }
                index += 1;
            }
        }
        panic!("metric {metric} has no instance {internal}");
    }
}

pub fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_ne_bytes());
}

pub fn put_i32(buf: &mut [u8], at: usize, v: i32) {
    buf[at..at + 4].copy_from_slice(&v.to_ne_bytes());
}

pub fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_ne_bytes());
}

pub fn put_i64(buf: &mut [u8], at: usize, v: i64) {
    buf[at..at + 8].copy_from_slice(&v.to_ne_bytes());
}

fn put_cstr(buf: &mut [u8], at: usize, s: &str, max: usize) {
    let bytes = s.as_bytes();
    assert!(bytes.len() < max, "{s:?} does not fit {max} bytes");
    buf[at..at + bytes.len()].copy_from_slice(bytes);
    buf[at + bytes.len()] = 0;
}

/// Overwrite the generation pair in place.
pub fn set_generations(buf: &mut [u8], g1: u64, g2: u64) {
    put_u64(buf, G1_AT, g1);
    put_u64(buf, G2_AT, g2);
}
