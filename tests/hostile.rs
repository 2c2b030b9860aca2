//! Corrupted and adversarial export files must be rejected, never read past.

#[path = "../src/fixture.rs"]
mod fixture;

use std::path::PathBuf;

use fixture::{Layout, MetricSpec, MmvFile, TOC_INDOMS, TOC_LABELS, TOC_METRICS, TOC_VALUES};
use mmv_agent::catalog::{Candidate, Catalog, CatalogBuilder};
use mmv_agent::client::Region;
use mmv_agent::constants::{DEFAULT_DOMAIN, DEFAULT_PREFIX};
use mmv_agent::cursor::ByteCursor;
use mmv_agent::header::{self, HeaderStatus};
use mmv_agent::values::ValueReader;
use mmv_agent::{ScanStats, SystemProbe};
use proptest::prelude::*;

fn sample() -> (Vec<u8>, Layout) {
    MmvFile::new(2)
        .add_metric(MetricSpec::new("cpu", 1, fixture::TYPE_U64).indom(1))
        .metric("name", 2, fixture::TYPE_STRING)
        .indom(1, &[(0, "cpu0"), (1, "cpu1")])
        .value_u64(0, Some(0), 5)
        .value_u64(0, Some(1), 6)
        .value_str(1, None, "hello")
        .label(fixture::LABEL_CLUSTER, 0, 0, "\"k\":1")
        .build_with_layout()
}

/// Run the whole import pipeline over `bytes`, then read every metric.
fn import(bytes: Vec<u8>) -> Option<Catalog> {
    let stats = ScanStats::new();
    let header = match header::decode(&ByteCursor::new(&bytes), &SystemProbe) {
        Ok(HeaderStatus::Stable(header)) => header,
        _ => return None,
    };
    let mut builder = CatalogBuilder::new(DEFAULT_DOMAIN, DEFAULT_PREFIX);
    let candidate = Candidate { name: "app".into(), path: PathBuf::from("app"), region: Region::Heap(bytes), header };
    builder.add_client(candidate, &stats).ok()?;
    let catalog = builder.finish(1);

    let reader = ValueReader::new(&catalog);
    for metric in catalog.metrics() {
        let pmid = metric.desc.pmid;
        let _ = reader.fetch(pmid, None);
        if let Some(indom) = metric.desc.indom {
            for instance in catalog.instances(indom).unwrap_or_default() {
                let _ = reader.fetch(pmid, Some(instance.id));
            }
        }
    }
    Some(catalog)
}

#[test]
fn intact_sample_loads() {
    let catalog = import(sample().0).unwrap();
    assert_eq!(catalog.metric_count(), 2);
    assert_eq!(catalog.indom_count(), 1);
}

#[test]
fn huge_toc_count_is_rejected() {
    let (mut bytes, _) = sample();
    fixture::put_i32(&mut bytes, 24, i32::MAX);
    assert!(import(bytes).is_none());
}

#[test]
fn truncated_files_never_panic() {
    let (bytes, _) = sample();
    for len in 0..bytes.len() {
        let _ = import(bytes[..len].to_vec());
    }
}

fn section_kind() -> impl Strategy<Value = i32> {
    prop_oneof![Just(TOC_INDOMS), Just(TOC_METRICS), Just(TOC_VALUES), Just(TOC_LABELS)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn toc_counts_and_offsets(kind in section_kind(), count in any::<i32>(), offset in any::<u64>()) {
        let (mut bytes, layout) = sample();
        let entry = layout.toc_entry(kind);
        fixture::put_i32(&mut bytes, entry + 4, count);
        fixture::put_u64(&mut bytes, entry + 8, offset);
        let catalog = import(bytes).expect("header is untouched");
        prop_assert_eq!(catalog.client_count(), 1);
    }

    #[test]
    fn record_fields(at in 0usize..4096, word in any::<u64>()) {
        let (mut bytes, layout) = sample();
        let at = layout.indoms + at % (layout.len - layout.indoms - 8);
        fixture::put_u64(&mut bytes, at, word);
        let _ = import(bytes);
    }

    #[test]
    fn arbitrary_bytes(tail in proptest::collection::vec(any::<u8>(), 0..2048), tocs in 0i32..64) {
        let mut bytes = MmvFile::new(2).build();
        bytes.truncate(fixture::HEADER);
        fixture::put_i32(&mut bytes, 24, tocs);
        bytes.extend_from_slice(&tail);
        let _ = import(bytes);
    }
}
