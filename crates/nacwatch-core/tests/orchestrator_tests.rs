//! End-to-end runs with scripted generator and notifier doubles.

use async_trait::async_trait;
use nacwatch_core::change::Significance;
use nacwatch_core::config::{Config, ConfigStore, Overrides, VendorCredentials};
use nacwatch_core::crypto::generate_key;
use nacwatch_core::generator::{
    GeneratedReport, GenerationRequest, GeneratorError, ReportGenerator,
};
use nacwatch_core::history::{HistoryStore, HistoryTable};
use nacwatch_core::model::ReportStats;
use nacwatch_core::notify::{Notifier, NotifyError};
use nacwatch_core::orchestrator::Orchestrator;
use nacwatch_core::vault::ConfigVault;
use nacwatch_core::{Error, ErrorCategory};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

const VENDOR: &str = r#"
[api]
token = "vendor-token"
org_id = "123e4567-e89b-12d3-a456-426614174000"
"#;

const AUTOMATION: &str = r#"
[generator]
command = ["true"]
timeout_secs = 5
max_attempts = 2
initial_backoff_ms = 0

[notifications]
bot_token = "123:abc"
chat_id = "42"
min_change_significance = "significant"
"#;

struct Scripted {
    results: Mutex<VecDeque<Result<GeneratedReport, GeneratorError>>>,
    calls: AtomicU32,
    output_dirs: Mutex<Vec<PathBuf>>,
}

impl Scripted {
    fn new(results: Vec<Result<GeneratedReport, GeneratorError>>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.into()),
            calls: AtomicU32::new(0),
            output_dirs: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ReportGenerator for Scripted {
    async fn generate(
        &self,
        request: &GenerationRequest,
        credentials: &VendorCredentials,
    ) -> Result<GeneratedReport, GeneratorError> {
        assert_eq!(credentials.token.expose(), "vendor-token");
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.output_dirs
            .lock()
            .unwrap()
            .push(request.output_dir.clone());
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(GeneratorError::Transient("script exhausted".into())))
    }
}

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<String>>,
    files: Mutex<Vec<PathBuf>>,
    reject: bool,
}

#[async_trait]
impl Notifier for Recorder {
    async fn send_text(&self, text: &str) -> Result<(), NotifyError> {
        if self.reject {
            return Err(NotifyError::Rejected("chat not found".into()));
        }
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn send_file(&self, path: &Path) -> Result<(), NotifyError> {
        self.files.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}

fn report(total: u64, compliance: f64) -> Result<GeneratedReport, GeneratorError> {
    Ok(GeneratedReport {
        stats: ReportStats {
            total_devices: total,
            active_24h: total / 2,
            compliance_rate: compliance,
            ..ReportStats::default()
        },
        output_paths: Vec::new(),
    })
}

fn load_config(dir: &Path) -> Config {
    std::fs::write(dir.join("vendor.toml"), VENDOR).unwrap();
    std::fs::write(dir.join("automation.toml"), AUTOMATION).unwrap();
    let store = ConfigStore::new(dir, Arc::new(ConfigVault::with_key(generate_key())));
    store.load(&Overrides::default()).unwrap()
}

async fn setup() -> (TempDir, Config, HistoryStore) {
    let dir = tempdir().unwrap();
    let config = load_config(dir.path());
    let store = HistoryStore::open(&config.automation.database_path)
        .await
        .unwrap();
    (dir, config, store)
}

#[tokio::test]
async fn retry_exhaustion_is_recorded_and_alerted() {
    let (_dir, config, store) = setup().await;
    let generator = Scripted::new(vec![
        Err(GeneratorError::Transient("vendor API timed out".into())),
        Err(GeneratorError::Transient("vendor API timed out".into())),
    ]);
    let notifier = Arc::new(Recorder::default());
    let orch = Orchestrator::new(
        config,
        store.clone(),
        generator.clone(),
        Some(notifier.clone() as Arc<dyn Notifier>),
    );

    let outcome = orch.run_once().await.unwrap();
    assert!(!outcome.succeeded());
    assert_eq!(outcome.failure_category, Some(ErrorCategory::TransientNetwork));
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);

    let runs = store.recent_runs(5).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert!(!runs[0].success);
    assert!(runs[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("vendor API timed out"));

    let sent = notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("failed"));
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let (_dir, config, store) = setup().await;
    let generator = Scripted::new(vec![Err(GeneratorError::Failed("bad token".into()))]);
    let orch = Orchestrator::new(config, store.clone(), generator.clone(), None);

    let outcome = orch.run_once().await.unwrap();
    assert_eq!(outcome.failure_category, Some(ErrorCategory::Generation));
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.count(HistoryTable::HealthSamples).await.unwrap(), 1);
}

#[tokio::test]
async fn significant_change_triggers_alert() {
    let (_dir, config, store) = setup().await;
    let generator = Scripted::new(vec![report(100, 90.0), report(106, 84.0)]);
    let notifier = Arc::new(Recorder::default());
    let reports_dir = config.automation.reports_dir.clone();
    let orch = Orchestrator::new(
        config,
        store.clone(),
        generator.clone(),
        Some(notifier.clone() as Arc<dyn Notifier>),
    );

    let first = orch.run_once().await.unwrap();
    assert!(first.succeeded());
    let first_changes = first.changes.unwrap();
    assert_eq!(first_changes.prior_run_id, None);
    assert_eq!(first_changes.significance, Significance::None);
    assert_eq!(first.notifications_sent, 1);

    let second = orch.run_once().await.unwrap();
    let changes = second.changes.unwrap();
    assert_eq!(changes.prior_run_id, Some(first.run.run_id));
    assert_eq!(changes.significance, Significance::Significant);
    assert_eq!(changes.device_count_delta, 6);
    assert_eq!(second.notifications_sent, 2);
    assert!(second.pruned.is_some());

    let dirs = generator.output_dirs.lock().unwrap();
    assert_eq!(
        *dirs,
        vec![
            reports_dir.join(first.run.run_id.to_string()),
            reports_dir.join(second.run.run_id.to_string()),
        ]
    );

    let sent = notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 3);
    assert!(sent[2].contains("Endpoint change"));
    assert!(notifier.files.lock().unwrap().is_empty());
}

#[tokio::test]
async fn notification_failure_does_not_fail_the_run() {
    let (_dir, config, store) = setup().await;
    let generator = Scripted::new(vec![report(50, 99.0)]);
    let notifier = Arc::new(Recorder {
        reject: true,
        ..Recorder::default()
    });
    let notifier: Arc<dyn Notifier> = notifier;
    let orch = Orchestrator::new(config, store.clone(), generator, Some(notifier));

    let outcome = orch.run_once().await.unwrap();
    assert!(outcome.succeeded());
    assert_eq!(outcome.notifications_sent, 0);
    assert_eq!(outcome.notification_failures, 1);
    assert_eq!(store.recent_successful_runs(1).await.unwrap().len(), 1);
}

#[test]
fn sealed_documents_load_and_missing_fields_are_config_errors() {
    let dir = tempdir().unwrap();
    let vault = Arc::new(ConfigVault::with_key(generate_key()));
    let store = ConfigStore::new(dir.path(), Arc::clone(&vault));

    std::fs::write(
        dir.path().join("vendor.toml.enc"),
        vault.seal_bytes(VENDOR.as_bytes()).unwrap(),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("automation.toml.enc"),
        vault.seal_bytes(AUTOMATION.as_bytes()).unwrap(),
    )
    .unwrap();
    let config = store.load(&Overrides::default()).unwrap();
    assert_eq!(config.vendor.credentials.token.expose(), "vendor-token");
    assert!(config.automation.notifications.is_some());

    let no_org = "[api]\ntoken = \"vendor-token\"\n";
    std::fs::write(
        dir.path().join("vendor.toml.enc"),
        vault.seal_bytes(no_org.as_bytes()).unwrap(),
    )
    .unwrap();
    match store.load(&Overrides::default()).unwrap_err() {
        Error::Config { field, .. } => assert_eq!(field, "api.org_id"),
        other => panic!("expected config error, got {other:?}"),
    }
}

#[test]
fn wrong_key_is_an_integrity_error() {
    let dir = tempdir().unwrap();
    let sealer = ConfigVault::with_key(generate_key());
    std::fs::write(
        dir.path().join("vendor.toml.enc"),
        sealer.seal_bytes(VENDOR.as_bytes()).unwrap(),
    )
    .unwrap();
    let other = ConfigStore::new(dir.path(), Arc::new(ConfigVault::with_key(generate_key())));
    let err = other
        .load_vendor(&dir.path().join("vendor.toml"), &Overrides::default())
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Integrity);
}
