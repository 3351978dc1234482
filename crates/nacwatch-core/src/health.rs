use crate::error::{Error, Result};
use crate::history::HistoryStore;
use crate::model::HealthSample;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest window a summary may cover, ten years.
pub const MAX_WINDOW_HOURS: u32 = 87_600;

const TREND_DEADBAND_POINTS: f64 = 10.0;
const TREND_MIN_SAMPLES: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub window_hours: u32,
    /// Average run duration above this downgrades an otherwise excellent window.
    pub max_avg_duration_secs: f64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            window_hours: 24,
            max_avg_duration_secs: 300.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Excellent,
    Good,
    NeedsAttention,
    Critical,
    NoData,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Excellent => "excellent",
            HealthStatus::Good => "good",
            HealthStatus::NeedsAttention => "needs attention",
            HealthStatus::Critical => "critical",
            HealthStatus::NoData => "no data",
        }
    }

    fn classify(success_rate: f64, avg_duration: f64, bound: f64) -> Self {
        if success_rate >= 95.0 && avg_duration <= bound {
            HealthStatus::Excellent
        } else if success_rate >= 80.0 {
            HealthStatus::Good
        } else if success_rate >= 50.0 {
            HealthStatus::NeedsAttention
        } else {
            HealthStatus::Critical
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Improving => "improving",
            Trend::Stable => "stable",
            Trend::Degrading => "degrading",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    pub window_hours: u32,
    pub sample_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    /// Percent; `None` when the window is empty.
    pub success_rate: Option<f64>,
    pub avg_duration_seconds: Option<f64>,
    pub status: HealthStatus,
    /// Failures since the most recent success.
    pub consecutive_failures: usize,
    pub last_success: Option<DateTime<Utc>>,
    /// Needs at least four samples.
    pub trend: Option<Trend>,
}

pub fn aggregate(
    samples: &[HealthSample],
    window_hours: u32,
    max_avg_duration: f64,
) -> HealthSummary {
    let mut ordered: Vec<&HealthSample> = samples.iter().collect();
    ordered.sort_by_key(|s| s.timestamp);

    let sample_count = ordered.len();
    let success_count = ordered.iter().filter(|s| s.is_success()).count();
    let failure_count = sample_count - success_count;
    let last_success = ordered
        .iter()
        .rev()
        .find(|s| s.is_success())
        .map(|s| s.timestamp);
    let consecutive_failures = ordered
        .iter()
        .rev()
        .take_while(|s| !s.is_success())
        .count();

    if sample_count == 0 {
        return HealthSummary {
            window_hours,
            sample_count,
            success_count,
            failure_count,
            success_rate: None,
            avg_duration_seconds: None,
            status: HealthStatus::NoData,
            consecutive_failures,
            last_success,
            trend: None,
        };
    }

    let success_rate = success_count as f64 * 100.0 / sample_count as f64;
    let avg_duration =
        ordered.iter().map(|s| s.duration_seconds).sum::<f64>() / sample_count as f64;
    let trend = (sample_count >= TREND_MIN_SAMPLES).then(|| {
        let (older, newer) = ordered.split_at(sample_count / 2);
        let delta = rate(newer) - rate(older);
        if delta > TREND_DEADBAND_POINTS {
            Trend::Improving
        } else if delta < -TREND_DEADBAND_POINTS {
            Trend::Degrading
        } else {
            Trend::Stable
        }
    });

    HealthSummary {
        window_hours,
        sample_count,
        success_count,
        failure_count,
        success_rate: Some(success_rate),
        avg_duration_seconds: Some(avg_duration),
        status: HealthStatus::classify(success_rate, avg_duration, max_avg_duration),
        consecutive_failures,
        last_success,
        trend,
    }
}

fn window_start(window_hours: u32) -> Result<DateTime<Utc>> {
    let out_of_range = || {
        Error::config(
            "<arguments>",
            "window_hours",
            format!("must be between 1 and {MAX_WINDOW_HOURS}, got {window_hours}"),
        )
    };
    if window_hours == 0 || window_hours > MAX_WINDOW_HOURS {
        return Err(out_of_range());
    }
    Utc::now()
        .checked_sub_signed(ChronoDuration::hours(i64::from(window_hours)))
        .ok_or_else(out_of_range)
}

fn rate(samples: &[&HealthSample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().filter(|s| s.is_success()).count() as f64 * 100.0 / samples.len() as f64
}

pub struct HealthMonitor {
    store: HistoryStore,
    settings: HealthSettings,
}

impl HealthMonitor {
    pub fn new(store: HistoryStore, settings: HealthSettings) -> Self {
        Self { store, settings }
    }

    pub async fn summarize(&self, window_hours: u32) -> Result<HealthSummary> {
        let since = window_start(window_hours)?;
        let samples = self.store.samples_since(since).await?;
        Ok(aggregate(
            &samples,
            window_hours,
            self.settings.max_avg_duration_secs,
        ))
    }

    pub async fn summarize_default(&self) -> Result<HealthSummary> {
        self.summarize(self.settings.window_hours).await
    }
}
