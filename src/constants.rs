//! Wire constants, record sizes and identifier limits.
//!
//! Every number the decoders compare against lives here so that the
//! layouts of the three export versions can be read side by side.

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Agent version - follows semantic versioning
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AGENT_NAME: &str = "mmv-agent";
pub const AGENT_FULL_NAME: &str = "MMV Import Agent";

// ----------------------------------------------------------------------------
// 2.1 Header & Table of Contents
// ----------------------------------------------------------------------------

/// Magic tag at offset 0 of every export file.
pub const MMV_MAGIC: [u8; 4] = *b"MMV\0";

pub const MMV_VERSION1: i32 = 1;
pub const MMV_VERSION2: i32 = 2;
pub const MMV_VERSION3: i32 = 3;

/// Fixed size of the leading header record.
pub const HEADER_SIZE: usize = 40;

/// Size of one table-of-contents entry. Entries start right after the header.
pub const TOC_ENTRY_SIZE: usize = 16;

/// A usable export always carries at least a metrics and a values section.
pub const MIN_TOC_COUNT: i32 = 2;

// Header field offsets
pub const HDR_MAGIC: u64 = 0;
pub const HDR_VERSION: u64 = 4;
pub const HDR_G1: u64 = 8;
pub const HDR_G2: u64 = 16;
pub const HDR_TOCS: u64 = 24;
pub const HDR_FLAGS: u64 = 28;
pub const HDR_PROCESS: u64 = 32;
pub const HDR_CLUSTER: u64 = 36;

// ----------------------------------------------------------------------------
// 2.2 Record Sizes
// ----------------------------------------------------------------------------

pub const INDOM_RECORD_SIZE: usize = 32;
pub const INSTANCE_V1_RECORD_SIZE: usize = 80;
pub const INSTANCE_V2_RECORD_SIZE: usize = 24;
pub const METRIC_V1_RECORD_SIZE: usize = 104;
pub const METRIC_V2_RECORD_SIZE: usize = 48;
pub const VALUE_RECORD_SIZE: usize = 32;
pub const STRING_RECORD_SIZE: usize = 256;
pub const LABEL_RECORD_SIZE: usize = 256;

/// Inline name buffer width (v1 metric and instance names).
pub const MMV_NAMEMAX: usize = 64;
/// String table payload width.
pub const MMV_STRINGMAX: usize = 256;
/// Label payload width.
pub const MMV_LABELMAX: usize = 244;

// ----------------------------------------------------------------------------
// 2.3 Identifier Widths
// ----------------------------------------------------------------------------

pub const DOMAIN_BITS: u32 = 9;
pub const CLUSTER_BITS: u32 = 12;
pub const ITEM_BITS: u32 = 10;
pub const INDOM_SERIAL_BITS: u32 = 22;

/// Client clusters and indom serials share the 22-bit indom serial field.
pub const CLIENT_CLUSTER_BITS: u32 = 11;
pub const CLIENT_INDOM_SERIAL_BITS: u32 = 11;

pub const MAX_DOMAIN: u32 = (1 << DOMAIN_BITS) - 1;
pub const MAX_ITEM: u32 = (1 << ITEM_BITS) - 1;
pub const MAX_CLIENT_CLUSTER: u32 = (1 << CLIENT_CLUSTER_BITS) - 1;
pub const MAX_CLIENT_INDOM_SERIAL: u32 = (1 << CLIENT_INDOM_SERIAL_BITS) - 1;

/// Metric indom reference meaning "scalar metric" (0 is accepted too).
pub const INDOM_NONE: u32 = u32::MAX;

/// Cluster reserved for the agent's own control metrics.
pub const CONTROL_CLUSTER: u32 = 0;

// ----------------------------------------------------------------------------
// 2.4 Defaults
// ----------------------------------------------------------------------------

/// Performance domain number assigned to this agent.
pub const DEFAULT_DOMAIN: u32 = 70;

/// Leading component of every exported metric name.
pub const DEFAULT_PREFIX: &str = "mmv";

/// Directory scanned for client export files.
pub const DEFAULT_STATS_DIR: &str = "/var/tmp/mmv";

/// Default poll interval for the `watch` subcommand (milliseconds)
pub const DEFAULT_WATCH_INTERVAL_MS: u64 = 1000;
