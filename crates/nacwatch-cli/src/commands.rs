use crate::{Cli, Commands, RunOnceArgs};
use anyhow::{anyhow, bail, Context as _, Result};
use chrono::Timelike;
use nacwatch_core::config::{
    validate_document, AutomationConfig, Config, ConfigStore, DocumentKind, Overrides, Secret,
};
use nacwatch_core::generator::CommandGenerator;
use nacwatch_core::health::HealthMonitor;
use nacwatch_core::history::HistoryStore;
use nacwatch_core::keys::{self, KeyChain, KEY_FILE_NAME};
use nacwatch_core::model::RetentionPolicy;
use nacwatch_core::notify::{Notification, Notifier, NotifyError, TelegramNotifier};
use nacwatch_core::orchestrator::Orchestrator;
use nacwatch_core::paths::{self, AUTOMATION_CONFIG, VENDOR_CONFIG};
use nacwatch_core::retention::RetentionManager;
use nacwatch_core::retry::IsTransient;
use nacwatch_core::vault::{self, ConfigVault, EditOutcome, SEALED_EXTENSION};
use nacwatch_core::{Error, ErrorCategory};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

struct Context {
    config_dir: PathBuf,
    key_file: Option<PathBuf>,
}

impl Context {
    fn vault(&self) -> Arc<ConfigVault> {
        Arc::new(ConfigVault::new(KeyChain::standard(
            self.key_file.clone(),
            &self.config_dir,
        )))
    }

    fn config_store(&self) -> ConfigStore {
        ConfigStore::new(&self.config_dir, self.vault())
    }

    fn automation(&self) -> Result<AutomationConfig> {
        let overrides = Overrides::from_env()?;
        let path = self.config_dir.join(AUTOMATION_CONFIG);
        Ok(self.config_store().load_automation(&path, &overrides)?)
    }

    /// Resolves a user-supplied document path against the config dir.
    fn document(&self, file: &Path) -> PathBuf {
        if file.is_absolute() || file.exists() {
            file.to_path_buf()
        } else {
            self.config_dir.join(file)
        }
    }
}

pub async fn dispatch(cli: Cli) -> Result<()> {
    let ctx = Context {
        config_dir: paths::config_dir(cli.config_dir.as_deref())?,
        key_file: cli.key_file,
    };
    match cli.command {
        Commands::RunOnce(args) => run_once(&ctx, args).await,
        Commands::Health { hours, json } => health(&ctx, hours, json).await,
        Commands::Cleanup {
            reports_days,
            history_days,
        } => cleanup(&ctx, reports_days, history_days).await,
        Commands::EncryptConfig {
            files,
            delete_plaintext,
        } => encrypt_config(&ctx, files, delete_plaintext),
        Commands::DecryptConfig { files, output } => decrypt_config(&ctx, files, output),
        Commands::EditConfig { file } => edit_config(&ctx, &file).await,
        Commands::CreateKey { path } => create_key(&ctx, path),
        Commands::Init => init(&ctx),
        Commands::TestNotify => test_notify(&ctx).await,
        Commands::ScheduleHint => schedule_hint(&ctx),
        Commands::History { limit } => history(&ctx, limit).await,
    }
}

impl RunOnceArgs {
    fn into_overrides(self) -> Overrides {
        Overrides {
            api_token: self.api_token.map(Secret::new),
            org_id: self.org_id,
            base_url: self.base_url,
            reports_dir: self.reports_dir,
            database: self.database,
            lookback_days: self.lookback_days,
            site: self.site,
            connection_type: self.connection_type,
            output_formats: (!self.formats.is_empty()).then_some(self.formats),
            theme: self.theme,
        }
    }
}

async fn run_once(ctx: &Context, args: RunOnceArgs) -> Result<()> {
    let overrides = args.into_overrides().layered_over(Overrides::from_env()?);
    let config: Config = ctx.config_store().load(&overrides)?;

    let generator = CommandGenerator::from_config(&config).map_err(|e| {
        Error::config(
            config.automation.source.display().to_string(),
            "generator.command",
            e.to_string(),
        )
    })?;
    let notifier: Option<Arc<dyn Notifier>> = match &config.automation.notifications {
        Some(settings) => Some(Arc::new(
            TelegramNotifier::from_settings(settings).map_err(notify_error)?,
        )),
        None => None,
    };
    let store = HistoryStore::open(&config.automation.database_path).await?;
    let orchestrator = Orchestrator::new(config, store.clone(), Arc::new(generator), notifier);
    let outcome = orchestrator.run_once().await;
    store.close().await;
    let outcome = outcome?;

    let run = &outcome.run;
    if outcome.succeeded() {
        println!(
            "run {}: {} devices, compliance {:.1}%",
            run.run_id, run.stats.total_devices, run.stats.compliance_rate
        );
        if let Some(changes) = outcome.changes.as_ref().filter(|c| c.prior_run_id.is_some()) {
            println!("  change since previous run: {}", changes.significance);
        }
        for path in &run.output_paths {
            println!("  {}", path.display());
        }
    }
    if let Some(err) = &outcome.prune_error {
        warn!(error = %err, "retention did not complete");
    }
    if outcome.notification_failures > 0 {
        warn!(failed = outcome.notification_failures, "some notifications were not delivered");
    }
    if outcome.succeeded() {
        return Ok(());
    }
    let reason = run.error_message.clone().unwrap_or_default();
    Err(match outcome.failure_category {
        Some(ErrorCategory::TransientNetwork) => Error::TransientNetwork(reason),
        _ => Error::Generation(reason),
    }
    .into())
}

async fn health(ctx: &Context, hours: Option<u32>, json: bool) -> Result<()> {
    let automation = ctx.automation()?;
    let store = HistoryStore::open(&automation.database_path).await?;
    let monitor = HealthMonitor::new(store.clone(), automation.health.clone());
    let summary = match hours {
        Some(h) => monitor.summarize(h).await,
        None => monitor.summarize_default().await,
    };
    store.close().await;
    let summary = summary?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    println!("Health over the last {}h: {}", summary.window_hours, summary.status);
    println!(
        "  runs: {} ({} ok, {} failed)",
        summary.sample_count, summary.success_count, summary.failure_count
    );
    if let Some(rate) = summary.success_rate {
        println!("  success rate: {rate:.1}%");
    }
    if let Some(avg) = summary.avg_duration_seconds {
        println!("  average duration: {avg:.1}s");
    }
    if summary.consecutive_failures > 0 {
        println!("  consecutive failures: {}", summary.consecutive_failures);
    }
    if let Some(ts) = summary.last_success {
        println!("  last success: {}", ts.format("%Y-%m-%d %H:%M UTC"));
    }
    if let Some(trend) = summary.trend {
        println!("  trend: {}", trend.as_str());
    }
    Ok(())
}

async fn cleanup(
    ctx: &Context,
    reports_days: Option<u32>,
    history_days: Option<u32>,
) -> Result<()> {
    let automation = ctx.automation()?;
    let policy = RetentionPolicy {
        reports_keep_days: reports_days.unwrap_or(automation.retention.reports_keep_days),
        database_keep_days: history_days.unwrap_or(automation.retention.database_keep_days),
    };
    let store = HistoryStore::open(&automation.database_path).await?;
    let manager = RetentionManager::new(&automation.reports_dir, store.clone(), policy);
    let report = manager.apply().await;
    store.close().await;
    let report = report?;
    println!(
        "removed {} report file(s) older than {} days and {} history row(s) older than {} days",
        report.reports.removed,
        policy.reports_keep_days,
        report.history_removed(),
        policy.database_keep_days
    );
    Ok(())
}

/// Existing documents in the config dir with or without the sealed extension.
fn default_documents(ctx: &Context, sealed: bool) -> Vec<PathBuf> {
    [VENDOR_CONFIG, AUTOMATION_CONFIG]
        .iter()
        .map(|name| {
            let plain = ctx.config_dir.join(name);
            if sealed {
                vault::sealed_path(&plain)
            } else {
                plain
            }
        })
        .filter(|p| p.exists())
        .collect()
}

fn encrypt_config(ctx: &Context, files: Vec<PathBuf>, delete_plaintext: bool) -> Result<()> {
    let files: Vec<PathBuf> = if files.is_empty() {
        default_documents(ctx, false)
    } else {
        files.iter().map(|f| ctx.document(f)).collect()
    };
    if files.is_empty() {
        bail!("no plaintext configuration found in {}", ctx.config_dir.display());
    }
    let vault = ctx.vault();
    for file in files {
        if file.extension().map_or(false, |e| e == SEALED_EXTENSION) {
            warn!(path = %file.display(), "already sealed; skipping");
            continue;
        }
        let sealed = vault.seal_file(&file, None, delete_plaintext)?;
        println!("sealed {} -> {}", file.display(), sealed.display());
    }
    println!("key source: {}", vault.key_source()?);
    Ok(())
}

fn decrypt_config(ctx: &Context, files: Vec<PathBuf>, output: Option<PathBuf>) -> Result<()> {
    let files: Vec<PathBuf> = if files.is_empty() {
        default_documents(ctx, true)
    } else {
        files.iter().map(|f| ctx.document(f)).collect()
    };
    if files.is_empty() {
        bail!("no sealed configuration found in {}", ctx.config_dir.display());
    }
    if output.is_some() && files.len() > 1 {
        bail!("--output can only be used with a single file");
    }
    let vault = ctx.vault();
    for file in files {
        let target = vault.open_file(&file, output.as_deref())?;
        println!("opened {} -> {}", file.display(), target.display());
    }
    warn!("plaintext configuration is on disk; re-seal it when done");
    Ok(())
}

fn editor_command() -> Vec<String> {
    ["VISUAL", "EDITOR"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .map(|v| v.split_whitespace().map(str::to_string).collect::<Vec<_>>())
        .find(|parts| !parts.is_empty())
        .unwrap_or_else(|| vec!["vi".to_string()])
}

async fn edit_config(ctx: &Context, file: &Path) -> Result<()> {
    let file = ctx.document(file);
    let sealed = if file.extension().map_or(false, |e| e == SEALED_EXTENSION) {
        file
    } else {
        vault::sealed_path(&file)
    };
    if !sealed.exists() {
        bail!("{} does not exist; run encrypt-config first", sealed.display());
    }
    let kind = DocumentKind::from_path(&sealed).ok_or_else(|| {
        anyhow!("{} is neither a vendor nor an automation document", sealed.display())
    })?;
    let plain = vault::plain_path(&sealed).unwrap_or_else(|| sealed.clone());

    let interrupted = Arc::new(AtomicBool::new(false));
    let watcher = {
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupted.store(true, Ordering::SeqCst);
            }
        })
    };

    let vault = ctx.vault();
    let editor = editor_command();
    let target = sealed.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        vault.edit_sealed(
            &target,
            |scratch| {
                let (program, args) = editor
                    .split_first()
                    .ok_or_else(|| Error::config("<environment>", "EDITOR", "is empty"))?;
                let status = Command::new(program)
                    .args(args)
                    .arg(scratch)
                    .status()
                    .map_err(|e| Error::io(scratch, e))?;
                if interrupted.load(Ordering::SeqCst) {
                    return Ok(false);
                }
                if !status.success() {
                    warn!(%status, "editor exited unsuccessfully; discarding changes");
                    return Ok(false);
                }
                Ok(true)
            },
            |bytes| {
                let text = std::str::from_utf8(bytes).map_err(|_| {
                    Error::config(plain.display().to_string(), "<document>", "is not valid UTF-8")
                })?;
                validate_document(kind, &plain, text)
            },
        )
    })
    .await
    .context("editor task panicked")?;
    watcher.abort();

    match outcome? {
        EditOutcome::Saved => println!("saved {}", sealed.display()),
        EditOutcome::Unchanged => println!("no changes to {}", sealed.display()),
        EditOutcome::Aborted => println!("edit abandoned; {} unchanged", sealed.display()),
    }
    Ok(())
}

fn create_key(ctx: &Context, path: Option<PathBuf>) -> Result<()> {
    let path = path.unwrap_or_else(|| ctx.config_dir.join(KEY_FILE_NAME));
    let key = keys::create_key_file(&path)?;
    println!("wrote {} (fingerprint {})", path.display(), key.fingerprint());
    println!("back this file up; sealed configuration cannot be opened without it");
    Ok(())
}

fn init(ctx: &Context) -> Result<()> {
    let written = ctx.config_store().write_samples()?;
    if written.is_empty() {
        println!("configuration already present in {}", ctx.config_dir.display());
        return Ok(());
    }
    for path in &written {
        println!("wrote {}", path.display());
    }
    println!("next: fill in {VENDOR_CONFIG}, then run `nacwatch create-key`");
    println!("      and `nacwatch encrypt-config --delete-plaintext`");
    Ok(())
}

fn notify_error(err: NotifyError) -> Error {
    if err.is_transient() {
        Error::TransientNetwork(err.to_string())
    } else {
        Error::config("<notifications>", "bot_token", err.to_string())
    }
}

async fn test_notify(ctx: &Context) -> Result<()> {
    let automation = ctx.automation()?;
    let settings = automation.notifications.as_ref().ok_or_else(|| {
        Error::config(
            automation.source.display().to_string(),
            "notifications",
            "section is missing",
        )
    })?;
    let notifier = TelegramNotifier::from_settings(settings).map_err(notify_error)?;
    let username = notifier.check().await.map_err(notify_error)?;
    info!(bot = %username, "bot token accepted");
    notifier
        .send(&Notification::text("<b>nacwatch</b> test notification"))
        .await
        .map_err(notify_error)?;
    println!("test message sent via @{username} to chat {}", settings.chat_id);
    Ok(())
}

fn schedule_hint(ctx: &Context) -> Result<()> {
    let automation = ctx.automation()?;
    let exe = std::env::current_exe().context("cannot locate the nacwatch executable")?;
    let base = format!("{} --config-dir {}", exe.display(), ctx.config_dir.display());
    let daily = automation.schedule.daily_time;
    let cleanup = automation.schedule.cleanup_time;
    println!("# nacwatch schedule (crontab -e)");
    println!("{} {} * * * {base} run-once", daily.minute(), daily.hour());
    println!("{} {} * * * {base} cleanup", cleanup.minute(), cleanup.hour());
    Ok(())
}

async fn history(ctx: &Context, limit: u32) -> Result<()> {
    let automation = ctx.automation()?;
    let store = HistoryStore::open(&automation.database_path).await?;
    let runs = store.recent_runs(limit).await;
    store.close().await;
    let runs = runs?;
    if runs.is_empty() {
        println!("no runs recorded");
        return Ok(());
    }
    println!(
        "{:<17}  {:<7}  {:>7}  {:>10}  {:>8}  {}",
        "timestamp", "status", "devices", "compliance", "duration", "error"
    );
    for run in runs {
        println!(
            "{:<17}  {:<7}  {:>7}  {:>9.1}%  {:>7.1}s  {}",
            run.timestamp.format("%Y-%m-%d %H:%M"),
            if run.success { "ok" } else { "failed" },
            run.stats.total_devices,
            run.stats.compliance_rate,
            run.duration_seconds,
            run.error_message.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
