//! Agent-owned metrics in cluster 0.

use serde::Serialize;

use crate::constants::CONTROL_CLUSTER;
use crate::format::{MetricType, Semantics, Units};

// ============================================================================
// SECTION 18: CONTROL METRICS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMetric {
    Reload,
    Debug,
    Files,
    Metrics,
    Indoms,
}

impl ControlMetric {
    pub const ALL: [ControlMetric; 5] = [Self::Reload, Self::Debug, Self::Files, Self::Metrics, Self::Indoms];

    pub fn item(self) -> u32 {
        match self {
            Self::Reload => 0,
            Self::Debug => 1,
            Self::Files => 2,
            Self::Metrics => 3,
            Self::Indoms => 4,
        }
    }

    pub fn from_item(cluster: u32, item: u32) -> Option<Self> {
        if cluster != CONTROL_CLUSTER {
            return None;
        }
        Self::ALL.into_iter().find(|m| m.item() == item)
    }

    /// Name below the agent prefix.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Reload => "reload",
            Self::Debug => "debug",
            Self::Files => "control.files",
            Self::Metrics => "control.metrics",
            Self::Indoms => "control.indoms",
        }
    }

    pub fn value_type(self) -> MetricType {
        match self {
            Self::Reload | Self::Debug => MetricType::I32,
            Self::Files | Self::Metrics | Self::Indoms => MetricType::U32,
        }
    }

    pub fn semantics(self) -> Semantics {
        match self {
            Self::Reload | Self::Debug => Semantics::Discrete,
            Self::Files | Self::Metrics | Self::Indoms => Semantics::Instant,
        }
    }

    pub fn units(self) -> Units {
        match self {
            Self::Reload | Self::Debug => Units::default(),
            // count^1
            Self::Files | Self::Metrics | Self::Indoms => Units::new(0, 0, 1, 0, 0, 0),
        }
    }

    pub fn oneline(self) -> &'static str {
        match self {
            Self::Reload => "Control maps on MMV files",
            Self::Debug => "Debug flag",
            Self::Files => "Number of loaded MMV files",
            Self::Metrics => "Number of metrics exported from MMV files",
            Self::Indoms => "Number of instance domains exported from MMV files",
        }
    }

    pub fn help(self) -> &'static str {
        match self {
            Self::Reload => {
                "Storing any non-zero value forces a rescan of the MMV directory and a fresh \
                 mapping of every client file on the next request. The flag is also raised \
                 while a client file is still being written."
            }
            Self::Debug => "Debug level of the agent. Storing a value changes it at runtime.",
            Self::Files => "Number of client files that passed validation in the most recent scan.",
            Self::Metrics => "Number of client metrics in the catalog after the most recent scan.",
            Self::Indoms => "Number of client instance domains in the catalog after the most recent scan.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_items_are_distinct() {
        for metric in ControlMetric::ALL {
            assert_eq!(ControlMetric::from_item(CONTROL_CLUSTER, metric.item()), Some(metric));
        }
        assert_eq!(ControlMetric::from_item(CONTROL_CLUSTER, 99), None);
        assert_eq!(ControlMetric::from_item(1, 0), None);
    }
}
