//! Vendor and automation configuration documents.
//!
//! Both documents are TOML. Each may be sealed as `<name>.enc`; a sealed
//! sidecar always wins over the plaintext file next to it. Values are
//! layered command line > environment > file > default, and validation runs
//! only after every layer has been applied.

use crate::change::{ChangeThresholds, Significance};
use crate::error::{Error, Result};
use crate::fsio;
use crate::health::{HealthSettings, MAX_WINDOW_HOURS};
use crate::model::{RetentionPolicy, MAX_KEEP_DAYS};
use crate::paths::{self, AUTOMATION_CONFIG, VENDOR_CONFIG};
use crate::retry::RetryPolicy;
use crate::vault::{self, ConfigVault, SEALED_EXTENSION};
use chrono::NaiveTime;
use reqwest::Url;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::Zeroizing;

pub const DEFAULT_BASE_URL: &str = "https://api.mist.com";
pub const THEMES: [&str; 6] = ["default", "sunset", "ocean", "forest", "dark", "corporate"];
const TIME_FORMAT: &str = "%H:%M";

// ── Secrets ──────────────────────────────────────────────────────────────────

/// A credential that zeroizes on drop and never prints.
#[derive(Clone)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

// ── Enumerations ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    Wired,
    Wireless,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Wired => "wired",
            ConnectionType::Wireless => "wireless",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "wired" => Some(ConnectionType::Wired),
            "wireless" => Some(ConnectionType::Wireless),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OutputFormat {
    Html,
    Csv,
    Json,
    Excel,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 4] = [
        OutputFormat::Html,
        OutputFormat::Csv,
        OutputFormat::Json,
        OutputFormat::Excel,
    ];

    /// Extension of the artifact the generator writes for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Excel => "xlsx",
            other => other.as_str(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Html => "html",
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
            OutputFormat::Excel => "excel",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "html" => Some(OutputFormat::Html),
            "csv" => Some(OutputFormat::Csv),
            "json" => Some(OutputFormat::Json),
            "excel" | "xlsx" => Some(OutputFormat::Excel),
            _ => None,
        }
    }
}

// ── Validated documents ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VendorCredentials {
    pub token: Secret,
    pub org_id: Uuid,
    /// Absolute http(s) URL without a trailing slash.
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct VendorConfig {
    pub credentials: VendorCredentials,
    pub theme: String,
    pub lookback_days: u32,
}

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    pub bot_token: Secret,
    pub chat_id: String,
    pub send_success_reports: bool,
    pub send_error_alerts: bool,
    pub send_change_alerts: bool,
    pub min_change_significance: Significance,
    pub attach_report: bool,
}

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    /// Program followed by its fixed arguments.
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    pub vendor_config: PathBuf,
    pub output_formats: Vec<OutputFormat>,
    pub theme: Option<String>,
    pub lookback_days: Option<u32>,
    pub site: Option<String>,
    pub connection_type: Option<ConnectionType>,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl GeneratorSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: self.initial_backoff,
            max_backoff: RetryPolicy::default().max_backoff,
            attempt_timeout: self.timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub daily_time: NaiveTime,
    pub cleanup_time: NaiveTime,
}

#[derive(Debug, Clone)]
pub struct AutomationConfig {
    pub source: PathBuf,
    pub notifications: Option<NotificationSettings>,
    pub generator: GeneratorSettings,
    pub reports_dir: PathBuf,
    pub database_path: PathBuf,
    pub retention: RetentionPolicy,
    pub schedule: ScheduleSettings,
    pub change_detection: ChangeThresholds,
    pub health: HealthSettings,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub vendor: VendorConfig,
    pub automation: AutomationConfig,
}

// ── On-disk shapes ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VendorFile {
    api: Option<ApiSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiSection {
    token: Option<String>,
    org_id: Option<String>,
    base_url: Option<String>,
    theme: Option<String>,
    lookback_days: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AutomationFile {
    notifications: Option<NotificationsSection>,
    generator: Option<GeneratorSection>,
    reports: ReportsSection,
    database: DatabaseSection,
    schedule: ScheduleSection,
    change_detection: ChangeThresholds,
    health: HealthSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NotificationsSection {
    bot_token: Option<String>,
    chat_id: Option<String>,
    send_success_reports: Option<bool>,
    send_error_alerts: Option<bool>,
    send_change_alerts: Option<bool>,
    min_change_significance: Option<String>,
    attach_report: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GeneratorSection {
    command: Option<Vec<String>>,
    vendor_config: Option<PathBuf>,
    output_formats: Option<Vec<String>>,
    theme: Option<String>,
    lookback_days: Option<i64>,
    site: Option<String>,
    connection_type: Option<String>,
    timeout_secs: Option<i64>,
    max_attempts: Option<i64>,
    initial_backoff_ms: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReportsSection {
    directory: Option<PathBuf>,
    keep_days: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DatabaseSection {
    path: Option<PathBuf>,
    keep_days: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScheduleSection {
    daily_time: Option<String>,
    cleanup_time: Option<String>,
}

// ── Overrides ────────────────────────────────────────────────────────────────

pub const ENV_API_TOKEN: &str = "NACWATCH_API_TOKEN";
pub const ENV_ORG_ID: &str = "NACWATCH_ORG_ID";
pub const ENV_BASE_URL: &str = "NACWATCH_BASE_URL";
pub const ENV_REPORTS_DIR: &str = "NACWATCH_REPORTS_DIR";
pub const ENV_DATABASE: &str = "NACWATCH_DATABASE";
pub const ENV_LOOKBACK_DAYS: &str = "NACWATCH_LOOKBACK_DAYS";

/// Values that take precedence over the files. Unset fields fall through.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub api_token: Option<Secret>,
    pub org_id: Option<String>,
    pub base_url: Option<String>,
    pub reports_dir: Option<PathBuf>,
    pub database: Option<PathBuf>,
    pub lookback_days: Option<u32>,
    pub site: Option<String>,
    pub connection_type: Option<String>,
    pub output_formats: Option<Vec<String>>,
    pub theme: Option<String>,
}

impl Overrides {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let lookback_days = match get(ENV_LOOKBACK_DAYS) {
            Some(raw) => Some(raw.trim().parse::<u32>().map_err(|_| {
                Error::config(
                    "<environment>",
                    ENV_LOOKBACK_DAYS,
                    format!("must be a positive integer, got `{raw}`"),
                )
            })?),
            None => None,
        };
        Ok(Self {
            api_token: get(ENV_API_TOKEN).map(Secret::new),
            org_id: get(ENV_ORG_ID),
            base_url: get(ENV_BASE_URL),
            reports_dir: get(ENV_REPORTS_DIR).map(PathBuf::from),
            database: get(ENV_DATABASE).map(PathBuf::from),
            lookback_days,
            ..Self::default()
        })
    }

    /// `self` wins wherever it is set.
    pub fn layered_over(self, lower: Overrides) -> Overrides {
        Overrides {
            api_token: self.api_token.or(lower.api_token),
            org_id: self.org_id.or(lower.org_id),
            base_url: self.base_url.or(lower.base_url),
            reports_dir: self.reports_dir.or(lower.reports_dir),
            database: self.database.or(lower.database),
            lookback_days: self.lookback_days.or(lower.lookback_days),
            site: self.site.or(lower.site),
            connection_type: self.connection_type.or(lower.connection_type),
            output_formats: self.output_formats.or(lower.output_formats),
            theme: self.theme.or(lower.theme),
        }
    }
}

// ── Document kinds ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Vendor,
    Automation,
}

impl DocumentKind {
    /// Guesses the kind from the file name, ignoring a `.enc` suffix.
    pub fn from_path(path: &Path) -> Option<Self> {
        let plain = vault::plain_path(path).unwrap_or_else(|| path.to_path_buf());
        let stem = plain.file_stem()?.to_string_lossy().to_ascii_lowercase();
        if stem.starts_with("vendor") {
            Some(DocumentKind::Vendor)
        } else if stem.starts_with("automation") {
            Some(DocumentKind::Automation)
        } else {
            None
        }
    }
}

/// Parses and validates document text without applying any overrides.
pub fn validate_document(kind: DocumentKind, file: &Path, text: &str) -> Result<()> {
    let base = match file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let name = file.display().to_string();
    let overrides = Overrides::default();
    match kind {
        DocumentKind::Vendor => parse_vendor(&name, text, &overrides).map(|_| ()),
        DocumentKind::Automation => {
            parse_automation(&name, file, base, text, &overrides).map(|_| ())
        }
    }
}

// ── Store ────────────────────────────────────────────────────────────────────

pub struct ConfigStore {
    dir: PathBuf,
    vault: Arc<ConfigVault>,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>, vault: Arc<ConfigVault>) -> Self {
        Self {
            dir: dir.into(),
            vault,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn vault(&self) -> &ConfigVault {
        &self.vault
    }

    /// Loads the automation document, then the vendor document it points at.
    pub fn load(&self, overrides: &Overrides) -> Result<Config> {
        let automation = self.load_automation(&self.dir.join(AUTOMATION_CONFIG), overrides)?;
        let vendor = self.load_vendor(&automation.generator.vendor_config, overrides)?;
        Ok(Config { vendor, automation })
    }

    pub fn load_vendor(&self, path: &Path, overrides: &Overrides) -> Result<VendorConfig> {
        let (file, text) = self.read_document(path)?;
        parse_vendor(&file.display().to_string(), &text, overrides)
    }

    pub fn load_automation(&self, path: &Path, overrides: &Overrides) -> Result<AutomationConfig> {
        let (file, text) = self.read_document(path)?;
        let base = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => self.dir.clone(),
        };
        parse_automation(&file.display().to_string(), &file, &base, &text, overrides)
    }

    /// Returns the file actually read and its text. `<path>.enc` is preferred
    /// over `<path>`; `path` may also name the sealed file directly.
    fn read_document(&self, path: &Path) -> Result<(PathBuf, Zeroizing<String>)> {
        let is_sealed = path.extension().map_or(false, |e| e == SEALED_EXTENSION);
        let sidecar = vault::sealed_path(path);
        let (file, bytes) = if is_sealed {
            (path.to_path_buf(), self.vault.open_path(path)?)
        } else if sidecar.exists() {
            debug!(path = %sidecar.display(), "using sealed configuration");
            let bytes = self.vault.open_path(&sidecar)?;
            (sidecar, bytes)
        } else if path.exists() {
            let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
            (path.to_path_buf(), Zeroizing::new(bytes))
        } else {
            return Err(Error::config(
                path.display().to_string(),
                "<file>",
                format!("not found (looked for {} as well)", sidecar.display()),
            ));
        };
        let text = String::from_utf8(bytes.to_vec()).map_err(|_| {
            Error::config(file.display().to_string(), "<document>", "is not valid UTF-8")
        })?;
        Ok((file, Zeroizing::new(text)))
    }

    /// Creates sample documents, never overwriting. Returns the files written.
    pub fn write_samples(&self) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for (name, body) in [
            (VENDOR_CONFIG, SAMPLE_VENDOR),
            (AUTOMATION_CONFIG, SAMPLE_AUTOMATION),
        ] {
            let path = self.dir.join(name);
            if path.exists() || vault::sealed_path(&path).exists() {
                info!(path = %path.display(), "configuration already present; leaving it alone");
                continue;
            }
            fsio::create_exclusive(&path, body.as_bytes())?;
            info!(path = %path.display(), "wrote sample configuration");
            written.push(path);
        }
        Ok(written)
    }
}

// ── Parsing and validation ───────────────────────────────────────────────────

fn parse_toml<T: for<'de> Deserialize<'de>>(file: &str, text: &str) -> Result<T> {
    toml::from_str(text).map_err(|e| {
        Error::config(file, "<document>", format!("is not valid TOML: {}", e.message()))
    })
}

fn parse_vendor(file: &str, text: &str, overrides: &Overrides) -> Result<VendorConfig> {
    let raw: VendorFile = parse_toml(file, text)?;
    let api = raw.api.unwrap_or_default();

    let token = match &overrides.api_token {
        Some(token) => token.clone(),
        None => Secret::new(api.token.unwrap_or_default()),
    };
    if token.expose().trim().is_empty() {
        return Err(Error::config(file, "api.token", "is missing or empty"));
    }

    let org_raw = overrides.org_id.clone().or(api.org_id).unwrap_or_default();
    let org_id = parse_org_id(file, &org_raw)?;

    let base_raw = overrides
        .base_url
        .clone()
        .or(api.base_url)
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let base_url = parse_base_url(file, "api.base_url", &base_raw)?;

    let theme = overrides
        .theme
        .clone()
        .or(api.theme)
        .unwrap_or_else(|| "default".to_string());
    check_theme(file, "api.theme", &theme)?;

    let lookback_days = match overrides.lookback_days {
        Some(days) => positive(file, "api.lookback_days", i64::from(days))?,
        None => positive(file, "api.lookback_days", api.lookback_days.unwrap_or(7))?,
    };

    Ok(VendorConfig {
        credentials: VendorCredentials {
            token,
            org_id,
            base_url,
        },
        theme,
        lookback_days,
    })
}

fn parse_automation(
    file: &str,
    source: &Path,
    base: &Path,
    text: &str,
    overrides: &Overrides,
) -> Result<AutomationConfig> {
    let raw: AutomationFile = parse_toml(file, text)?;

    let notifications = raw
        .notifications
        .map(|n| parse_notifications(file, n))
        .transpose()?;

    let gen = raw
        .generator
        .ok_or_else(|| Error::config(file, "generator", "section is missing"))?;
    let command = gen.command.unwrap_or_default();
    if command.is_empty() || command[0].trim().is_empty() {
        return Err(Error::config(file, "generator.command", "is missing or empty"));
    }
    let vendor_config = paths::resolve(
        base,
        &gen.vendor_config.unwrap_or_else(|| PathBuf::from(VENDOR_CONFIG)),
    );
    let format_names = overrides
        .output_formats
        .clone()
        .or(gen.output_formats)
        .unwrap_or_else(|| vec!["html".to_string(), "csv".to_string()]);
    let output_formats = parse_formats(file, &format_names)?;
    let theme = overrides.theme.clone().or(gen.theme);
    if let Some(theme) = &theme {
        check_theme(file, "generator.theme", theme)?;
    }
    let lookback_days = match overrides.lookback_days.map(i64::from).or(gen.lookback_days) {
        Some(days) => Some(positive(file, "generator.lookback_days", days)?),
        None => None,
    };
    let connection_type = match overrides.connection_type.clone().or(gen.connection_type) {
        Some(raw) => Some(ConnectionType::parse(&raw).ok_or_else(|| {
            Error::config(
                file,
                "generator.connection_type",
                format!("must be `wired` or `wireless`, got `{raw}`"),
            )
        })?),
        None => None,
    };
    let site = overrides
        .site
        .clone()
        .or(gen.site)
        .filter(|s| !s.trim().is_empty());
    let timeout_secs = positive(file, "generator.timeout_secs", gen.timeout_secs.unwrap_or(600))?;
    let max_attempts = positive(file, "generator.max_attempts", gen.max_attempts.unwrap_or(3))?;
    let initial_backoff_ms = non_negative(
        file,
        "generator.initial_backoff_ms",
        gen.initial_backoff_ms.unwrap_or(5_000),
    )?;

    let reports_dir = paths::resolve(
        base,
        &overrides
            .reports_dir
            .clone()
            .or(raw.reports.directory)
            .unwrap_or_else(|| PathBuf::from("reports")),
    );
    let reports_keep_days = bounded(
        file,
        "reports.keep_days",
        raw.reports.keep_days.unwrap_or(30),
        MAX_KEEP_DAYS,
    )?;
    let database_path = paths::resolve(
        base,
        &overrides
            .database
            .clone()
            .or(raw.database.path)
            .unwrap_or_else(|| PathBuf::from("nacwatch.db")),
    );
    let database_keep_days = bounded(
        file,
        "database.keep_days",
        raw.database.keep_days.unwrap_or(90),
        MAX_KEEP_DAYS,
    )?;

    let schedule = ScheduleSettings {
        daily_time: parse_time(
            file,
            "schedule.daily_time",
            raw.schedule.daily_time.as_deref(),
            "08:00",
        )?,
        cleanup_time: parse_time(
            file,
            "schedule.cleanup_time",
            raw.schedule.cleanup_time.as_deref(),
            "02:00",
        )?,
    };

    check_thresholds(file, &raw.change_detection)?;
    bounded(
        file,
        "health.window_hours",
        i64::from(raw.health.window_hours),
        MAX_WINDOW_HOURS,
    )?;
    if !(raw.health.max_avg_duration_secs.is_finite() && raw.health.max_avg_duration_secs > 0.0) {
        return Err(Error::config(file, "health.max_avg_duration_secs", "must be positive"));
    }

    Ok(AutomationConfig {
        source: source.to_path_buf(),
        notifications,
        generator: GeneratorSettings {
            command,
            working_dir: base.to_path_buf(),
            vendor_config,
            output_formats,
            theme,
            lookback_days,
            site,
            connection_type,
            timeout: Duration::from_secs(u64::from(timeout_secs)),
            max_attempts,
            initial_backoff: Duration::from_millis(initial_backoff_ms),
        },
        reports_dir,
        database_path,
        retention: RetentionPolicy {
            reports_keep_days,
            database_keep_days,
        },
        schedule,
        change_detection: raw.change_detection,
        health: raw.health,
    })
}

fn parse_notifications(file: &str, n: NotificationsSection) -> Result<NotificationSettings> {
    let bot_token = n.bot_token.unwrap_or_default();
    if bot_token.trim().is_empty() {
        return Err(Error::config(file, "notifications.bot_token", "is missing or empty"));
    }
    let chat_id = n.chat_id.unwrap_or_default();
    if chat_id.trim().is_empty() {
        return Err(Error::config(file, "notifications.chat_id", "is missing or empty"));
    }
    let min_change_significance = match n.min_change_significance {
        Some(raw) => match raw.parse::<Significance>() {
            Ok(Significance::None) | Err(_) => {
                return Err(Error::config(
                    file,
                    "notifications.min_change_significance",
                    format!("must be `minor` or `significant`, got `{raw}`"),
                ))
            }
            Ok(level) => level,
        },
        None => Significance::Significant,
    };
    Ok(NotificationSettings {
        bot_token: Secret::new(bot_token),
        chat_id,
        send_success_reports: n.send_success_reports.unwrap_or(true),
        send_error_alerts: n.send_error_alerts.unwrap_or(true),
        send_change_alerts: n.send_change_alerts.unwrap_or(true),
        min_change_significance,
        attach_report: n.attach_report.unwrap_or(false),
    })
}

fn parse_org_id(file: &str, raw: &str) -> Result<Uuid> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::config(file, "api.org_id", "is missing or empty"));
    }
    match Uuid::parse_str(raw) {
        Ok(id) if raw.len() == 36 => Ok(id),
        _ => Err(Error::config(
            file,
            "api.org_id",
            "must be a UUID like 123e4567-e89b-12d3-a456-426614174000",
        )),
    }
}

fn parse_base_url(file: &str, field: &str, raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let url = Url::parse(trimmed)
        .map_err(|e| Error::config(file, field, format!("is not a valid URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(Error::config(file, field, "must be an absolute http(s) URL"));
    }
    Ok(trimmed.to_string())
}

fn check_theme(file: &str, field: &str, theme: &str) -> Result<()> {
    if THEMES.contains(&theme) {
        Ok(())
    } else {
        Err(Error::config(
            file,
            field,
            format!("must be one of {}, got `{theme}`", THEMES.join(", ")),
        ))
    }
}

/// The generator's JSON artifact feeds change detection, so `json` is always
/// requested even when only other formats are configured.
fn parse_formats(file: &str, names: &[String]) -> Result<Vec<OutputFormat>> {
    let mut formats = Vec::with_capacity(names.len() + 1);
    for name in names.iter().flat_map(|n| n.split(',')) {
        if name.trim().is_empty() {
            continue;
        }
        let format = OutputFormat::parse(name).ok_or_else(|| {
            Error::config(
                file,
                "generator.output_formats",
                format!("unknown format `{}` (expected html, csv, json, excel)", name.trim()),
            )
        })?;
        formats.push(format);
    }
    formats.push(OutputFormat::Json);
    formats.sort();
    formats.dedup();
    Ok(formats)
}

fn parse_time(file: &str, field: &str, raw: Option<&str>, default: &str) -> Result<NaiveTime> {
    let raw = raw.unwrap_or(default).trim();
    NaiveTime::parse_from_str(raw, TIME_FORMAT).map_err(|_| {
        Error::config(file, field, format!("must be a 24h time like 08:30, got `{raw}`"))
    })
}

fn positive(file: &str, field: &str, value: i64) -> Result<u32> {
    match u32::try_from(value) {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(Error::config(
            file,
            field,
            format!("must be a positive integer, got {value}"),
        )),
    }
}

fn bounded(file: &str, field: &str, value: i64, max: u32) -> Result<u32> {
    match positive(file, field, value)? {
        v if v <= max => Ok(v),
        _ => Err(Error::config(
            file,
            field,
            format!("must be at most {max}, got {value}"),
        )),
    }
}

fn non_negative(file: &str, field: &str, value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| Error::config(file, field, format!("must not be negative, got {value}")))
}

fn check_thresholds(file: &str, t: &ChangeThresholds) -> Result<()> {
    for (field, value) in [
        ("change_detection.device_count_percent", t.device_count_percent),
        ("change_detection.compliance_points", t.compliance_points),
        ("change_detection.activity_fraction", t.activity_fraction),
        ("change_detection.connection_mix_points", t.connection_mix_points),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(Error::config(file, field, "must be a non-negative number"));
        }
    }
    Ok(())
}

// ── Samples ──────────────────────────────────────────────────────────────────

const SAMPLE_VENDOR: &str = r#"# Vendor API credentials. Seal this file with `nacwatch encrypt-config`.
[api]
token = ""
org_id = "00000000-0000-0000-0000-000000000000"
base_url = "https://api.mist.com"
theme = "default"
lookback_days = 7
"#;

const SAMPLE_AUTOMATION: &str = r#"# nacwatch automation settings. Relative paths resolve against this directory.

[generator]
command = ["python3", "mist_endpoint_report.py"]
vendor_config = "vendor.toml"
output_formats = ["html", "csv"]
timeout_secs = 600
max_attempts = 3
initial_backoff_ms = 5000
# site = "HQ"
# connection_type = "wireless"

[reports]
directory = "reports"
keep_days = 30

[database]
path = "nacwatch.db"
keep_days = 90

[schedule]
daily_time = "08:00"
cleanup_time = "02:00"

[change_detection]
device_count_percent = 5.0
device_count_absolute = 25
compliance_points = 5.0
activity_fraction = 0.10
connection_mix_points = 10.0

[health]
window_hours = 24
max_avg_duration_secs = 300

# [notifications]
# bot_token = ""
# chat_id = ""
# send_success_reports = true
# send_error_alerts = true
# send_change_alerts = true
# min_change_significance = "significant"
# attach_report = false
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_key;
    use std::collections::HashMap;
    use tempfile::tempdir;

    const ORG: &str = "123e4567-e89b-12d3-a456-426614174000";

    fn none() -> Overrides {
        Overrides::default()
    }

    fn vendor_text(token: &str) -> String {
        format!(
            "[api]\ntoken = \"{token}\"\norg_id = \"{ORG}\"\n\
             base_url = \"https://api.eu.mist.com/\"\n"
        )
    }

    #[test]
    fn vendor_defaults_and_url_normalization() {
        let cfg = parse_vendor("vendor.toml", &vendor_text("tok"), &Overrides::default()).unwrap();
        assert_eq!(cfg.credentials.base_url, "https://api.eu.mist.com");
        assert_eq!(cfg.theme, "default");
        assert_eq!(cfg.lookback_days, 7);
        assert_eq!(cfg.credentials.org_id.to_string(), ORG);
    }

    #[test]
    fn first_invalid_field_is_named() {
        let err = parse_vendor("vendor.toml", &vendor_text(""), &Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("api.token"));

        let bad_org = "[api]\ntoken = \"t\"\norg_id = \"not-a-uuid\"\n";
        let err = parse_vendor("vendor.toml", bad_org, &Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("api.org_id"));

        let bad_url = format!("[api]\ntoken = \"t\"\norg_id = \"{ORG}\"\nbase_url = \"ftp://x\"\n");
        let err = parse_vendor("vendor.toml", &bad_url, &Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("api.base_url"));
    }

    #[test]
    fn overrides_beat_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_API_TOKEN, "from-env"),
            (ENV_LOOKBACK_DAYS, "14"),
        ]);
        let from_env =
            Overrides::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        let cli = Overrides {
            lookback_days: Some(3),
            ..Overrides::default()
        };
        let merged = cli.layered_over(from_env);
        let cfg = parse_vendor("vendor.toml", &vendor_text(""), &merged).unwrap();
        assert_eq!(cfg.credentials.token.expose(), "from-env");
        assert_eq!(cfg.lookback_days, 3);
    }

    #[test]
    fn bad_env_lookback_is_config_error() {
        let err = Overrides::from_lookup(|k| (k == ENV_LOOKBACK_DAYS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_LOOKBACK_DAYS));
    }

    #[test]
    fn automation_validation() {
        let base = Path::new("/srv/nacwatch");
        let source = base.join("automation.toml");
        let ok = "[generator]\ncommand = [\"gen\"]\noutput_formats = [\"html\"]\n";
        let cfg = parse_automation("automation.toml", &source, base, ok, &Overrides::default())
            .unwrap();
        assert_eq!(cfg.generator.output_formats, vec![OutputFormat::Html, OutputFormat::Json]);
        assert_eq!(cfg.reports_dir, PathBuf::from("/srv/nacwatch/reports"));
        assert_eq!(cfg.retention.database_keep_days, 90);
        assert!(cfg.notifications.is_none());

        let bad_time = format!("{ok}[schedule]\ndaily_time = \"25:00\"\n");
        let err = parse_automation("automation.toml", &source, base, &bad_time, &none())
            .unwrap_err();
        assert!(err.to_string().contains("schedule.daily_time"));

        let bad_keep = format!("{ok}[reports]\nkeep_days = 0\n");
        let err = parse_automation("automation.toml", &source, base, &bad_keep, &none())
            .unwrap_err();
        assert!(err.to_string().contains("reports.keep_days"));

        let forever = format!("{ok}[database]\nkeep_days = 100000000\n");
        let err = parse_automation("automation.toml", &source, base, &forever, &none())
            .unwrap_err();
        assert!(err.to_string().contains("database.keep_days"));

        let century = format!("{ok}[reports]\nkeep_days = 36500\n");
        let cfg = parse_automation("automation.toml", &source, base, &century, &none()).unwrap();
        assert_eq!(cfg.retention.reports_keep_days, MAX_KEEP_DAYS);

        let wide = format!("{ok}[health]\nwindow_hours = 4294967295\n");
        let err = parse_automation("automation.toml", &source, base, &wide, &none())
            .unwrap_err();
        assert!(err.to_string().contains("health.window_hours"));

        let no_gen = "[reports]\nkeep_days = 5\n";
        let err = parse_automation("automation.toml", &source, base, no_gen, &Overrides::default())
            .unwrap_err();
        assert!(err.to_string().contains("generator"));
    }

    #[test]
    fn document_kind_from_name() {
        assert_eq!(
            DocumentKind::from_path(Path::new("/x/vendor.toml.enc")),
            Some(DocumentKind::Vendor)
        );
        assert_eq!(
            DocumentKind::from_path(Path::new("automation.toml")),
            Some(DocumentKind::Automation)
        );
        assert_eq!(DocumentKind::from_path(Path::new("other.toml")), None);
    }

    #[test]
    fn sealed_sidecar_wins_over_plaintext() {
        let dir = tempdir().unwrap();
        let vault = Arc::new(ConfigVault::with_key(generate_key()));
        let store = ConfigStore::new(dir.path(), Arc::clone(&vault));
        let path = dir.path().join(VENDOR_CONFIG);

        std::fs::write(&path, vendor_text("sealed")).unwrap();
        vault.seal_file(&path, None, false).unwrap();
        std::fs::write(&path, vendor_text("plain")).unwrap();

        let cfg = store.load_vendor(&path, &Overrides::default()).unwrap();
        assert_eq!(cfg.credentials.token.expose(), "sealed");
    }

    #[test]
    fn write_samples_never_overwrites() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path(), Arc::new(ConfigVault::with_key(generate_key())));
        std::fs::write(dir.path().join(VENDOR_CONFIG), "keep me").unwrap();
        let written = store.write_samples().unwrap();
        assert_eq!(written, vec![dir.path().join(AUTOMATION_CONFIG)]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join(VENDOR_CONFIG)).unwrap(),
            "keep me"
        );
        let text = std::fs::read_to_string(dir.path().join(AUTOMATION_CONFIG)).unwrap();
        validate_document(
            DocumentKind::Automation,
            &dir.path().join(AUTOMATION_CONFIG),
            &text,
        )
        .unwrap();
    }

    #[test]
    fn secrets_do_not_print() {
        let cfg = parse_vendor("vendor.toml", &vendor_text("hunter2"), &none()).unwrap();
        assert!(!format!("{cfg:?}").contains("hunter2"));
    }
}
