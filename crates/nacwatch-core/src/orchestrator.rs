//! One scheduled cycle: generate, record, detect changes, notify, prune.

use crate::change::{ChangeDetector, ChangeSummary};
use crate::config::{Config, NotificationSettings};
use crate::error::{ErrorCategory, Result};
use crate::generator::{GeneratedReport, GenerationRequest, GeneratorError, ReportGenerator};
use crate::history::HistoryStore;
use crate::model::ReportRun;
use crate::notify::{self, Notification, Notifier};
use crate::retention::{RetentionManager, RetentionReport};
use crate::retry::{with_retry, RetryError};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: ReportRun,
    pub changes: Option<ChangeSummary>,
    pub notifications_sent: u32,
    pub notification_failures: u32,
    pub pruned: Option<RetentionReport>,
    pub prune_error: Option<String>,
    /// Set when generation failed.
    pub failure_category: Option<ErrorCategory>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.run.success
    }
}

pub struct Orchestrator {
    config: Config,
    store: HistoryStore,
    generator: Arc<dyn ReportGenerator>,
    notifier: Option<Arc<dyn Notifier>>,
    detector: ChangeDetector,
    retention: RetentionManager,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        store: HistoryStore,
        generator: Arc<dyn ReportGenerator>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        let detector = ChangeDetector::new(config.automation.change_detection.clone());
        let retention = RetentionManager::new(
            config.automation.reports_dir.clone(),
            store.clone(),
            config.automation.retention,
        );
        Self {
            config,
            store,
            generator,
            notifier,
            detector,
            retention,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs the whole cycle. Only a history store failure is returned as an
    /// error; every other failure ends up in the recorded run or the outcome.
    pub async fn run_once(&self) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let started = Utc::now();
        let clock = Instant::now();
        info!(run_id = %run_id, "report run started");

        let (run, failure_category) = match self.generate(run_id).await {
            Ok(report) => (
                ReportRun::succeeded(
                    run_id,
                    started,
                    clock.elapsed().as_secs_f64(),
                    report.stats,
                    report.output_paths,
                ),
                None,
            ),
            Err(err) => {
                let category = match &err {
                    RetryError::Permanent(_) => ErrorCategory::Generation,
                    RetryError::TimedOut { .. } | RetryError::Exhausted { .. } => {
                        ErrorCategory::TransientNetwork
                    }
                };
                error!(
                    run_id = %run_id,
                    category = %category,
                    error = %err,
                    "report generation failed"
                );
                let elapsed = clock.elapsed().as_secs_f64();
                (
                    ReportRun::failed(run_id, started, elapsed, err.to_string()),
                    Some(category),
                )
            }
        };

        if let Err(err) = self.store.record_run(&run).await {
            error!(
                run_id = %run_id,
                category = %err.category(),
                error = %err,
                "failed to record run"
            );
            return Err(err);
        }

        let changes = if run.success {
            let previous = self
                .store
                .recent_successful_runs(2)
                .await?
                .into_iter()
                .find(|r| r.run_id != run.run_id);
            let summary = self.detector.detect(&run, previous.as_ref());
            if summary.prior_run_id.is_some() {
                info!(
                    run_id = %run_id,
                    significance = %summary.significance,
                    device_delta = summary.device_count_delta,
                    "change detection complete"
                );
            }
            Some(summary)
        } else {
            None
        };

        let mut outcome = RunOutcome {
            run,
            changes,
            notifications_sent: 0,
            notification_failures: 0,
            pruned: None,
            prune_error: None,
            failure_category,
        };
        self.notify(&mut outcome).await;

        match self.retention.apply().await {
            Ok(report) => outcome.pruned = Some(report),
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "retention failed");
                outcome.prune_error = Some(err.to_string());
            }
        }

        info!(
            run_id = %run_id,
            success = outcome.run.success,
            duration_secs = outcome.run.duration_seconds,
            notifications = outcome.notifications_sent,
            "report run finished"
        );
        Ok(outcome)
    }

    async fn generate(
        &self,
        run_id: Uuid,
    ) -> std::result::Result<GeneratedReport, RetryError<GeneratorError>> {
        let request = &GenerationRequest::from_config(&self.config, run_id);
        let credentials = &self.config.vendor.credentials;
        let generator = self.generator.as_ref();
        let policy = self.config.automation.generator.retry_policy();
        with_retry(&policy, "generate report", move || {
            generator.generate(request, credentials)
        })
        .await
    }

    fn messages(settings: &NotificationSettings, outcome: &RunOutcome) -> Vec<Notification> {
        let run = &outcome.run;
        let mut out = Vec::new();
        if !run.success {
            if settings.send_error_alerts {
                let category = outcome.failure_category.unwrap_or(ErrorCategory::Other);
                out.push(Notification::text(notify::format_failure(run, category)));
            }
            return out;
        }
        if settings.send_success_reports {
            let mut note = Notification::text(notify::format_success(run));
            if settings.attach_report {
                if let Some(path) = attachment_for(&run.output_paths) {
                    note = note.with_attachment(path);
                }
            }
            out.push(note);
        }
        if let Some(changes) = &outcome.changes {
            if settings.send_change_alerts && changes.meets(settings.min_change_significance) {
                out.push(Notification::text(notify::format_change_alert(changes, run)));
            }
        }
        out
    }

    async fn notify(&self, outcome: &mut RunOutcome) {
        let (Some(notifier), Some(settings)) =
            (self.notifier.as_deref(), self.config.automation.notifications.as_ref())
        else {
            return;
        };
        let policy = self.config.automation.generator.retry_policy();
        for note in Self::messages(settings, outcome) {
            match notify::deliver(notifier, &note, &policy).await {
                Ok(()) => outcome.notifications_sent += 1,
                Err(err) => {
                    warn!(run_id = %outcome.run.run_id, error = %err, "notification failed");
                    outcome.notification_failures += 1;
                }
            }
        }
    }
}

/// Prefers the HTML rendering; falls back to the first artifact.
fn attachment_for(paths: &[PathBuf]) -> Option<PathBuf> {
    paths
        .iter()
        .find(|p| p.extension().map_or(false, |e| e.eq_ignore_ascii_case("html")))
        .or_else(|| paths.first())
        .cloned()
}
