//! Classifies how much two consecutive successful runs differ.
//!
//! Every axis is judged independently and the overall verdict is the
//! maximum across axes. Output maps are `BTreeMap`s so the same pair of
//! runs always produces an equal summary.

use crate::model::ReportRun;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const EPSILON: f64 = 1e-9;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Significance {
    #[default]
    None,
    Minor,
    Significant,
}

impl Significance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Significance::None => "none",
            Significance::Minor => "minor",
            Significance::Significant => "significant",
        }
    }
}

impl fmt::Display for Significance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Significance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Significance::None),
            "minor" => Ok(Significance::Minor),
            "significant" => Ok(Significance::Significant),
            other => Err(format!("unknown significance `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeThresholds {
    pub device_count_percent: f64,
    pub device_count_absolute: u64,
    pub compliance_points: f64,
    pub activity_fraction: f64,
    pub connection_mix_points: f64,
}

impl Default for ChangeThresholds {
    fn default() -> Self {
        Self {
            device_count_percent: 5.0,
            device_count_absolute: 25,
            compliance_points: 5.0,
            activity_fraction: 0.10,
            connection_mix_points: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAxis {
    DeviceCount,
    Compliance,
    Activity,
    ConnectionMix,
}

impl ChangeAxis {
    pub fn label(&self) -> &'static str {
        match self {
            ChangeAxis::DeviceCount => "device count",
            ChangeAxis::Compliance => "compliance rate",
            ChangeAxis::Activity => "activity",
            ChangeAxis::ConnectionMix => "connection mix",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeSummary {
    pub prior_run_id: Option<Uuid>,
    pub current_run_id: Uuid,
    pub device_count_delta: i64,
    /// Percentage points.
    pub compliance_delta: f64,
    /// Net change in devices active within the last 24h.
    pub activity_delta: i64,
    pub connection_type_delta: BTreeMap<String, i64>,
    /// Largest per-type share movement, in percentage points.
    pub connection_mix_shift: f64,
    pub axes: BTreeMap<ChangeAxis, Significance>,
    pub significance: Significance,
}

impl ChangeSummary {
    pub fn meets(&self, minimum: Significance) -> bool {
        minimum != Significance::None && self.significance >= minimum
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    thresholds: ChangeThresholds,
}

impl ChangeDetector {
    pub fn new(thresholds: ChangeThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &ChangeThresholds {
        &self.thresholds
    }

    pub fn detect(&self, current: &ReportRun, previous: Option<&ReportRun>) -> ChangeSummary {
        let Some(previous) = previous else {
            return ChangeSummary {
                prior_run_id: None,
                current_run_id: current.run_id,
                device_count_delta: 0,
                compliance_delta: 0.0,
                activity_delta: 0,
                connection_type_delta: BTreeMap::new(),
                connection_mix_shift: 0.0,
                axes: BTreeMap::new(),
                significance: Significance::None,
            };
        };
        let cur = &current.stats;
        let prev = &previous.stats;
        let t = &self.thresholds;

        let device_count_delta = cur.total_devices as i64 - prev.total_devices as i64;
        let device_axis = if device_count_delta == 0 {
            Significance::None
        } else {
            let magnitude = device_count_delta.unsigned_abs();
            let percent = if prev.total_devices == 0 {
                f64::INFINITY
            } else {
                magnitude as f64 / prev.total_devices as f64 * 100.0
            };
            if magnitude > t.device_count_absolute || percent > t.device_count_percent {
                Significance::Significant
            } else {
                Significance::Minor
            }
        };

        let compliance_delta = cur.compliance_rate - prev.compliance_rate;
        let compliance_axis = graded(compliance_delta.abs(), t.compliance_points);

        let activity_delta = cur.active_24h as i64 - prev.active_24h as i64;
        let activity_axis = if activity_delta == 0 {
            Significance::None
        } else {
            let base = cur.total_devices.max(prev.total_devices);
            let fraction = if base == 0 {
                f64::INFINITY
            } else {
                activity_delta.unsigned_abs() as f64 / base as f64
            };
            if fraction > t.activity_fraction {
                Significance::Significant
            } else {
                Significance::Minor
            }
        };

        let kinds: BTreeSet<&String> = cur
            .connection_types
            .keys()
            .chain(prev.connection_types.keys())
            .collect();
        let cur_total: u64 = cur.connection_types.values().sum();
        let prev_total: u64 = prev.connection_types.values().sum();
        let mut connection_type_delta = BTreeMap::new();
        let mut connection_mix_shift: f64 = 0.0;
        for kind in kinds {
            let now = cur.connection_types.get(kind).copied().unwrap_or(0);
            let before = prev.connection_types.get(kind).copied().unwrap_or(0);
            connection_type_delta.insert(kind.clone(), now as i64 - before as i64);
            let shift = (share(now, cur_total) - share(before, prev_total)).abs();
            connection_mix_shift = connection_mix_shift.max(shift);
        }
        let mix_axis = if connection_type_delta.values().all(|d| *d == 0) {
            Significance::None
        } else if connection_mix_shift > t.connection_mix_points {
            Significance::Significant
        } else {
            Significance::Minor
        };

        let axes = BTreeMap::from([
            (ChangeAxis::DeviceCount, device_axis),
            (ChangeAxis::Compliance, compliance_axis),
            (ChangeAxis::Activity, activity_axis),
            (ChangeAxis::ConnectionMix, mix_axis),
        ]);
        let significance = axes.values().copied().max().unwrap_or_default();

        ChangeSummary {
            prior_run_id: Some(previous.run_id),
            current_run_id: current.run_id,
            device_count_delta,
            compliance_delta,
            activity_delta,
            connection_type_delta,
            connection_mix_shift,
            axes,
            significance,
        }
    }
}

fn graded(magnitude: f64, significant_above: f64) -> Significance {
    if magnitude <= EPSILON {
        Significance::None
    } else if magnitude > significant_above {
        Significance::Significant
    } else {
        Significance::Minor
    }
}

fn share(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64 * 100.0
    }
}
