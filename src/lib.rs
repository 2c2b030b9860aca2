//! MMV import agent.
//!
//! Producer processes publish metrics into small memory-mapped files in a
//! stats directory. This crate validates and decodes those files into an
//! immutable [`Catalog`] of names, instance domains and labels, detects when
//! the catalog is stale, and reads values straight out of the mapped memory
//! under the producers' generation protocol.
//!
//! ```no_run
//! use mmv_agent::{Agent, AgentConfig};
//!
//! let agent = Agent::new(AgentConfig::default().options());
//! if let Some(pmid) = agent.lookup("mmv.myapp.requests")? {
//!     println!("{:?}", agent.fetch(pmid, None)?);
//! }
//! # Ok::<(), mmv_agent::MmvError>(())
//! ```

pub mod catalog;
pub mod client;
pub mod config;
pub mod constants;
pub mod control;
pub mod cursor;
pub mod error;
pub mod format;
pub mod header;
pub mod indom;
pub mod labels;
pub mod logging;
pub mod metrics;
pub mod process;
pub mod scanner;
pub mod toc;
pub mod types;
pub mod values;

#[cfg(test)]
mod fixture;

pub use catalog::{Catalog, CatalogSummary};
pub use config::{AgentConfig, LoggingConfig};
pub use error::{ErrorClass, MmvError, MmvResult, ScanStats, ScanStatsSummary};
pub use labels::{Label, LabelSet, LabelTarget};
pub use metrics::{MetricDesc, MetricEntry};
pub use process::{ProcessProbe, SystemProbe};
pub use scanner::{Agent, AgentOptions, ReloadReason, ScanReport, TextKind};
pub use types::{InDomId, PmId, Timestamp};
pub use values::{AtomValue, IN_NULL};
