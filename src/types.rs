//! Core identifier and time types shared by the catalog and the readers.

use std::fmt::{self, Display, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{
    CLIENT_INDOM_SERIAL_BITS, CLUSTER_BITS, INDOM_SERIAL_BITS, ITEM_BITS,
    MAX_CLIENT_CLUSTER, MAX_CLIENT_INDOM_SERIAL, MAX_DOMAIN, MAX_ITEM,
};

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp
// ----------------------------------------------------------------------------

/// Wall-clock timestamp in nanoseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros.saturating_mul(1_000))
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    /// Current wall-clock time.
    #[inline]
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_micros(&self) -> i64 {
        self.0 / 1_000
    }

    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        let nanos = i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(nanos))
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_nanos_opt().unwrap_or(0))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.6f UTC"))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX))
    }
}

// ----------------------------------------------------------------------------
// 3.2 Metric Identity
// ----------------------------------------------------------------------------

/// Process-wide metric identifier: `domain:cluster:item` packed into 31 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PmId(u32);

impl PmId {
    /// Pack a metric identifier. Out-of-width components are masked; callers
    /// validate items with [`PmId::item_fits`] before building.
    pub const fn new(domain: u32, cluster: u32, item: u32) -> Self {
        let domain = domain & MAX_DOMAIN;
        let cluster = cluster & ((1 << CLUSTER_BITS) - 1);
        let item = item & MAX_ITEM;
        Self((domain << (CLUSTER_BITS + ITEM_BITS)) | (cluster << ITEM_BITS) | item)
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn domain(&self) -> u32 {
        (self.0 >> (CLUSTER_BITS + ITEM_BITS)) & MAX_DOMAIN
    }

    pub const fn cluster(&self) -> u32 {
        (self.0 >> ITEM_BITS) & ((1 << CLUSTER_BITS) - 1)
    }

    pub const fn item(&self) -> u32 {
        self.0 & MAX_ITEM
    }

    /// Whether a client-declared item number survives packing unchanged.
    pub const fn item_fits(item: u32) -> bool {
        item <= MAX_ITEM
    }
}

impl Display for PmId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.domain(), self.cluster(), self.item())
    }
}

// ----------------------------------------------------------------------------
// 3.3 Instance Domain Identity
// ----------------------------------------------------------------------------

/// Instance domain identifier: `domain:serial`, where client serials are
/// namespaced as `cluster << 11 | serial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct InDomId(u32);

impl InDomId {
    pub const fn new(domain: u32, serial: u32) -> Self {
        let domain = domain & MAX_DOMAIN;
        let serial = serial & ((1 << INDOM_SERIAL_BITS) - 1);
        Self((domain << INDOM_SERIAL_BITS) | serial)
    }

    /// Build the identifier for indom `serial` declared by the client on `cluster`.
    pub const fn for_client(domain: u32, cluster: u32, serial: u32) -> Self {
        let cluster = cluster & MAX_CLIENT_CLUSTER;
        let serial = serial & MAX_CLIENT_INDOM_SERIAL;
        Self::new(domain, (cluster << CLIENT_INDOM_SERIAL_BITS) | serial)
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn domain(&self) -> u32 {
        (self.0 >> INDOM_SERIAL_BITS) & MAX_DOMAIN
    }

    pub const fn serial(&self) -> u32 {
        self.0 & ((1 << INDOM_SERIAL_BITS) - 1)
    }

    pub const fn client_cluster(&self) -> u32 {
        self.serial() >> CLIENT_INDOM_SERIAL_BITS
    }

    pub const fn client_serial(&self) -> u32 {
        self.serial() & MAX_CLIENT_INDOM_SERIAL
    }
}

impl Display for InDomId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.domain(), self.serial())
    }
}

/// Bit width check shared by the indom and metric builders.
pub(crate) const fn fits_bits(value: u32, bits: u32) -> bool {
    bits >= 32 || value < (1 << bits)
}
