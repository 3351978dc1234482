//! Adapter for the external report generator.
//!
//! The generator is any program that accepts the normalized flags below,
//! reads vendor credentials from the environment, and writes its artifacts
//! into `--output-dir`, including a JSON file with a `statistics` object.
//! Every run gets its own output directory under the reports root, so
//! overlapping runs never see each other's artifacts.

use crate::config::{
    Config, ConnectionType, OutputFormat, VendorCredentials, ENV_API_TOKEN, ENV_BASE_URL,
    ENV_ORG_ID,
};
use crate::model::ReportStats;
use crate::retry::IsTransient;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

pub const ENV_OUTPUT_DIR: &str = "NACWATCH_OUTPUT_DIR";

/// `EX_TEMPFAIL`: the generator asks to be tried again later.
pub const EXIT_TEMPFAIL: i32 = 75;

/// Slack for filesystems with coarse mtimes.
const MTIME_SLACK: Duration = Duration::from_secs(2);
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub lookback_days: u32,
    pub site: Option<String>,
    pub connection_type: Option<ConnectionType>,
    pub formats: Vec<OutputFormat>,
    pub theme: String,
    pub output_dir: PathBuf,
}

impl GenerationRequest {
    /// Request for one run, writing into `<reports_dir>/<run_id>`.
    pub fn from_config(config: &Config, run_id: Uuid) -> Self {
        let gen = &config.automation.generator;
        Self {
            lookback_days: gen.lookback_days.unwrap_or(config.vendor.lookback_days),
            site: gen.site.clone(),
            connection_type: gen.connection_type,
            formats: gen.output_formats.clone(),
            theme: gen
                .theme
                .clone()
                .unwrap_or_else(|| config.vendor.theme.clone()),
            output_dir: config.automation.reports_dir.join(run_id.to_string()),
        }
    }

    pub fn format_list(&self) -> String {
        self.formats
            .iter()
            .map(|f| f.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Flags passed to the generator, in a stable order.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--days".to_string(),
            self.lookback_days.to_string(),
            "--format".to_string(),
            self.format_list(),
            "--theme".to_string(),
            self.theme.clone(),
            "--output-dir".to_string(),
            self.output_dir.display().to_string(),
        ];
        if let Some(site) = &self.site {
            args.push("--site".to_string());
            args.push(site.clone());
        }
        if let Some(kind) = self.connection_type {
            args.push("--connection-type".to_string());
            args.push(kind.as_str().to_string());
        }
        args
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedReport {
    pub stats: ReportStats,
    pub output_paths: Vec<PathBuf>,
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("generator temporarily unavailable: {0}")]
    Transient(String),

    #[error("generator failed: {0}")]
    Failed(String),
}

impl IsTransient for GeneratorError {
    fn is_transient(&self) -> bool {
        matches!(self, GeneratorError::Transient(_))
    }
}

#[async_trait]
pub trait ReportGenerator: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
        credentials: &VendorCredentials,
    ) -> Result<GeneratedReport, GeneratorError>;
}

pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl CommandGenerator {
    pub fn new(
        command: &[String],
        working_dir: impl Into<PathBuf>,
    ) -> Result<Self, GeneratorError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| GeneratorError::Failed("empty generator command".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            working_dir: working_dir.into(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, GeneratorError> {
        let gen = &config.automation.generator;
        Self::new(&gen.command, &gen.working_dir)
    }
}

#[async_trait]
impl ReportGenerator for CommandGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
        credentials: &VendorCredentials,
    ) -> Result<GeneratedReport, GeneratorError> {
        // The child runs in `working_dir`, so hand it an absolute output path.
        let request = &GenerationRequest {
            output_dir: absolute(&request.output_dir),
            ..request.clone()
        };
        tokio::fs::create_dir_all(&request.output_dir)
            .await
            .map_err(|e| {
                GeneratorError::Failed(format!(
                    "cannot create {}: {e}",
                    request.output_dir.display()
                ))
            })?;
        let started = SystemTime::now() - MTIME_SLACK;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(request.args())
            .current_dir(&self.working_dir)
            .env(ENV_API_TOKEN, credentials.token.expose())
            .env(ENV_ORG_ID, credentials.org_id.to_string())
            .env(ENV_BASE_URL, &credentials.base_url)
            .env(ENV_OUTPUT_DIR, &request.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            program = %self.program,
            days = request.lookback_days,
            formats = %request.format_list(),
            "starting report generator"
        );
        let output = cmd.output().await.map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                GeneratorError::Failed(format!("cannot run `{}`: {e}", self.program))
            }
            _ => GeneratorError::Transient(format!("spawn `{}`: {e}", self.program)),
        })?;

        if !output.status.success() {
            let tail = stderr_tail(&output.stderr);
            return Err(match output.status.code() {
                Some(EXIT_TEMPFAIL) => GeneratorError::Transient(format!(
                    "generator asked to retry (exit {EXIT_TEMPFAIL}): {tail}"
                )),
                Some(code) => GeneratorError::Failed(format!("exit status {code}: {tail}")),
                None => GeneratorError::Failed(format!("terminated by signal: {tail}")),
            });
        }
        debug!(
            stdout_bytes = output.stdout.len(),
            "generator exited successfully"
        );

        let output_paths = fresh_artifacts(&request.output_dir, started).await?;
        let stats = read_statistics(&output_paths).await?;
        Ok(GeneratedReport {
            stats,
            output_paths,
        })
    }
}

/// Files in `dir` modified at or after `since`, oldest first.
async fn fresh_artifacts(dir: &Path, since: SystemTime) -> Result<Vec<PathBuf>, GeneratorError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| GeneratorError::Failed(format!("read {}: {e}", dir.display())))?;
    let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| GeneratorError::Failed(format!("read {}: {e}", dir.display())))?
    {
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        if let Ok(modified) = meta.modified() {
            if modified >= since {
                found.push((modified, entry.path()));
            }
        }
    }
    found.sort();
    Ok(found.into_iter().map(|(_, p)| p).collect())
}

async fn read_statistics(artifacts: &[PathBuf]) -> Result<ReportStats, GeneratorError> {
    let newest_json = artifacts
        .iter()
        .rev()
        .find(|p| p.extension().map_or(false, |e| e.eq_ignore_ascii_case("json")))
        .ok_or_else(|| {
            GeneratorError::Failed("generator produced no JSON artifact with statistics".into())
        })?;
    let raw = tokio::fs::read(newest_json)
        .await
        .map_err(|e| GeneratorError::Failed(format!("read {}: {e}", newest_json.display())))?;
    let doc: serde_json::Value = serde_json::from_slice(&raw)
        .map_err(|e| GeneratorError::Failed(format!("parse {}: {e}", newest_json.display())))?;
    let stats = doc.get("statistics").cloned().ok_or_else(|| {
        GeneratorError::Failed(format!("{} has no `statistics` object", newest_json.display()))
    })?;
    serde_json::from_value(stats).map_err(|e| {
        GeneratorError::Failed(format!("bad statistics in {}: {e}", newest_json.display()))
    })
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    let tail = lines[start..].join("\n");
    if tail.is_empty() {
        "(no stderr output)".to_string()
    } else {
        tail
    }
}
