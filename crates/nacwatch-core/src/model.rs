//! Records produced by one orchestrated run.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Summary statistics the report generator emits in its JSON artifact.
/// Field aliases accept the generator's own key names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportStats {
    #[serde(default)]
    pub total_devices: u64,
    #[serde(default, alias = "active_last_24h")]
    pub active_24h: u64,
    #[serde(default, alias = "active_last_7d")]
    pub active_7d: u64,
    #[serde(default)]
    pub never_seen: u64,
    #[serde(default)]
    pub compliance_rate: f64,
    #[serde(default, alias = "ip_assignment_rate")]
    pub ip_coverage_rate: f64,
    #[serde(default, alias = "by_connection_type")]
    pub connection_types: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRun {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
    pub success: bool,
    pub error_message: Option<String>,
    pub stats: ReportStats,
    pub output_paths: Vec<PathBuf>,
}

impl ReportRun {
    pub fn succeeded(
        run_id: Uuid,
        started: DateTime<Utc>,
        duration_seconds: f64,
        stats: ReportStats,
        output_paths: Vec<PathBuf>,
    ) -> Self {
        Self {
            run_id,
            timestamp: started.trunc_subsecs(3),
            duration_seconds,
            success: true,
            error_message: None,
            stats,
            output_paths,
        }
    }

    pub fn failed(
        run_id: Uuid,
        started: DateTime<Utc>,
        duration_seconds: f64,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            timestamp: started.trunc_subsecs(3),
            duration_seconds,
            success: false,
            error_message: Some(error_message.into()),
            stats: ReportStats::default(),
            output_paths: Vec::new(),
        }
    }

    pub fn health_sample(&self) -> HealthSample {
        HealthSample {
            run_id: Some(self.run_id),
            timestamp: self.timestamp,
            status: if self.success {
                SampleStatus::Success
            } else {
                SampleStatus::Failure
            },
            duration_seconds: self.duration_seconds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleStatus {
    Success,
    Failure,
}

impl SampleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleStatus::Success => "success",
            SampleStatus::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(SampleStatus::Success),
            "failure" => Some(SampleStatus::Failure),
            _ => None,
        }
    }
}

impl fmt::Display for SampleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    pub run_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub status: SampleStatus,
    pub duration_seconds: f64,
}

impl HealthSample {
    pub fn is_success(&self) -> bool {
        self.status == SampleStatus::Success
    }
}

/// Longest retention period accepted anywhere, about a century.
pub const MAX_KEEP_DAYS: u32 = 36_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub reports_keep_days: u32,
    pub database_keep_days: u32,
}
