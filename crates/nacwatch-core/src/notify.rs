//! Outbound notifications over the Telegram Bot API.

use crate::change::{ChangeSummary, Significance};
use crate::config::{NotificationSettings, Secret};
use crate::error::ErrorCategory;
use crate::model::ReportRun;
use crate::retry::{with_retry, IsTransient, RetryError, RetryPolicy};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
/// Telegram rejects longer message bodies.
pub const MAX_MESSAGE_CHARS: usize = 4096;
const MAX_CAPTION_CHARS: usize = 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// HTML-formatted body.
    pub text: String,
    pub attachment: Option<PathBuf>,
}

impl Notification {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachment = Some(path.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport unavailable: {0}")]
    Transient(String),

    #[error("notification rejected: {0}")]
    Rejected(String),
}

impl IsTransient for NotifyError {
    fn is_transient(&self) -> bool {
        matches!(self, NotifyError::Transient(_))
    }
}

impl From<reqwest::Error> for NotifyError {
    fn from(err: reqwest::Error) -> Self {
        // The request URL embeds the bot token.
        let transient = err.is_timeout() || err.is_connect() || err.is_request();
        let text = err.without_url().to_string();
        if transient {
            NotifyError::Transient(text)
        } else {
            NotifyError::Rejected(text)
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<(), NotifyError>;

    async fn send_file(&self, path: &Path) -> Result<(), NotifyError>;

    /// Sends the body, then the attachment if any.
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.send_text(&notification.text).await?;
        if let Some(path) = &notification.attachment {
            self.send_file(path).await?;
        }
        Ok(())
    }
}

/// Delivers `notification` under `policy`. The body and the attachment are
/// retried as separate units, so a failed upload never repeats the message.
pub async fn deliver(
    notifier: &dyn Notifier,
    notification: &Notification,
    policy: &RetryPolicy,
) -> Result<(), RetryError<NotifyError>> {
    let text = notification.text.as_str();
    with_retry(policy, "send notification", move || notifier.send_text(text)).await?;
    if let Some(path) = notification.attachment.as_deref() {
        with_retry(policy, "send attachment", move || notifier.send_file(path)).await?;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    bot_token: Secret,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: Secret, chat_id: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("nacwatch/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| NotifyError::Rejected(format!("http client: {e}")))?;
        Ok(Self {
            client,
            api_base: TELEGRAM_API_BASE.to_string(),
            bot_token,
            chat_id: chat_id.into(),
        })
    }

    pub fn from_settings(settings: &NotificationSettings) -> Result<Self, NotifyError> {
        Self::new(settings.bot_token.clone(), settings.chat_id.clone())
    }

    /// Points the client at another Bot API server.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token.expose(), method)
    }

    /// Verifies the token with `getMe` and returns the bot's username.
    pub async fn check(&self) -> Result<String, NotifyError> {
        let res = self.client.get(self.method_url("getMe")).send().await?;
        let body = read_response(res).await?;
        let username = body
            .result
            .as_ref()
            .and_then(|r| r.get("username"))
            .and_then(|u| u.as_str())
            .unwrap_or("unknown")
            .to_string();
        Ok(username)
    }

    async fn send_message(&self, text: &str) -> Result<(), NotifyError> {
        let res = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": truncate_chars(text, MAX_MESSAGE_CHARS),
                "parse_mode": "HTML",
                "disable_web_page_preview": true,
            }))
            .send()
            .await?;
        read_response(res).await.map(|_| ())
    }

    async fn send_document(&self, path: &Path, caption: &str) -> Result<(), NotifyError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| NotifyError::Rejected(format!("read {}: {e}", path.display())))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "report".to_string());
        let form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", truncate_chars(caption, MAX_CAPTION_CHARS))
            .text("parse_mode", "HTML")
            .part("document", Part::bytes(bytes).file_name(file_name));
        let res = self
            .client
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await?;
        read_response(res).await.map(|_| ())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_text(&self, text: &str) -> Result<(), NotifyError> {
        self.send_message(text).await?;
        debug!(chat_id = %self.chat_id, "message delivered");
        Ok(())
    }

    async fn send_file(&self, path: &Path) -> Result<(), NotifyError> {
        let caption = match path.file_name() {
            Some(name) => format!("Report: <code>{}</code>", escape_html(&name.to_string_lossy())),
            None => "Report".to_string(),
        };
        self.send_document(path, &caption).await?;
        debug!(chat_id = %self.chat_id, path = %path.display(), "attachment delivered");
        Ok(())
    }
}

async fn read_response(res: reqwest::Response) -> Result<ApiResponse, NotifyError> {
    let status = res.status();
    let body: Option<ApiResponse> = res.json().await.ok();
    let description = body
        .as_ref()
        .and_then(|b| b.description.clone())
        .unwrap_or_else(|| status.to_string());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(NotifyError::Transient(format!("{status}: {description}")));
    }
    match body {
        Some(body) if status.is_success() && body.ok => Ok(body),
        _ => Err(NotifyError::Rejected(format!("{status}: {description}"))),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

// ── Message bodies ───────────────────────────────────────────────────────────

pub fn format_success(run: &ReportRun) -> String {
    let s = &run.stats;
    let mut text = String::new();
    let _ = writeln!(text, "<b>NAC endpoint report</b>");
    let _ = writeln!(text, "{}", run.timestamp.format("%Y-%m-%d %H:%M UTC"));
    let _ = writeln!(text);
    let _ = writeln!(text, "Devices: <b>{}</b>", s.total_devices);
    let _ = writeln!(text, "Active (24h): {}", s.active_24h);
    let _ = writeln!(text, "Active (7d): {}", s.active_7d);
    let _ = writeln!(text, "Never seen: {}", s.never_seen);
    let _ = writeln!(text, "Compliance: {:.1}%", s.compliance_rate);
    let _ = writeln!(text, "IP coverage: {:.1}%", s.ip_coverage_rate);
    for (kind, count) in &s.connection_types {
        let _ = writeln!(text, "  {}: {count}", escape_html(kind));
    }
    let _ = write!(text, "Generated in {:.1}s", run.duration_seconds);
    text
}

pub fn format_failure(run: &ReportRun, category: ErrorCategory) -> String {
    let reason = run.error_message.as_deref().unwrap_or("unknown error");
    format!(
        "<b>NAC report failed</b>\n{}\nCategory: {category}\n\
         Run: <code>{}</code>\n\n<pre>{}</pre>",
        run.timestamp.format("%Y-%m-%d %H:%M UTC"),
        run.run_id,
        escape_html(reason)
    )
}

pub fn format_change_alert(changes: &ChangeSummary, run: &ReportRun) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "<b>Endpoint change: {}</b>", changes.significance);
    let _ = writeln!(text, "{}", run.timestamp.format("%Y-%m-%d %H:%M UTC"));
    let _ = writeln!(text);
    let _ = writeln!(
        text,
        "Devices: {} ({:+})",
        run.stats.total_devices, changes.device_count_delta
    );
    let _ = writeln!(
        text,
        "Compliance: {:.1}% ({:+.1} pts)",
        run.stats.compliance_rate, changes.compliance_delta
    );
    let _ = writeln!(text, "Active (24h): {:+}", changes.activity_delta);
    for (kind, delta) in changes.connection_type_delta.iter().filter(|(_, d)| **d != 0) {
        let _ = writeln!(text, "  {}: {delta:+}", escape_html(kind));
    }
    let flagged: Vec<String> = changes
        .axes
        .iter()
        .filter(|(_, sig)| **sig > Significance::None)
        .map(|(axis, sig)| format!("{} ({sig})", axis.label()))
        .collect();
    if !flagged.is_empty() {
        let _ = write!(text, "Flagged: {}", flagged.join(", "));
    }
    text.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeDetector;
    use crate::model::ReportStats;
    use chrono::Utc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    /// Answers every request with the given status and body.
    async fn canned_server(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = vec![0u8; 64 * 1024];
                let _ = sock.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = sock.write_all(reply.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    fn notifier(base: &str) -> TelegramNotifier {
        TelegramNotifier::new(Secret::new("123:abc"), "42")
            .unwrap()
            .with_api_base(base)
    }

    fn run(total: u64, compliance: f64) -> ReportRun {
        ReportRun::succeeded(
            Uuid::new_v4(),
            Utc::now(),
            12.5,
            ReportStats {
                total_devices: total,
                compliance_rate: compliance,
                ..ReportStats::default()
            },
            Vec::new(),
        )
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(escape_html("<b>&</b>"), "&lt;b&gt;&amp;&lt;/b&gt;");
    }

    #[test]
    fn truncates_on_char_boundary() {
        let long = "é".repeat(MAX_MESSAGE_CHARS + 10);
        assert_eq!(
            truncate_chars(&long, MAX_MESSAGE_CHARS).chars().count(),
            MAX_MESSAGE_CHARS
        );
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn failure_body_escapes_error_text() {
        let failed = ReportRun::failed(Uuid::new_v4(), Utc::now(), 1.0, "bad <token>");
        let text = format_failure(&failed, ErrorCategory::Generation);
        assert!(text.contains("bad &lt;token&gt;"));
        assert!(text.contains("generation"));
    }

    #[test]
    fn change_alert_lists_flagged_axes() {
        let prior = run(100, 90.0);
        let current = run(106, 84.0);
        let changes = ChangeDetector::default().detect(&current, Some(&prior));
        let text = format_change_alert(&changes, &current);
        assert!(text.contains("significant"));
        assert!(text.contains("(+6)"));
        assert!(text.contains("compliance rate"));
    }

    #[test]
    fn success_body_has_totals() {
        let text = format_success(&run(250, 97.25));
        assert!(text.contains("<b>250</b>"));
        assert!(text.contains("97.2") || text.contains("97.3"));
    }

    /// Fails the first upload transiently and counts every call.
    #[derive(Default)]
    struct FlakyUpload {
        texts: std::sync::atomic::AtomicU32,
        uploads: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl Notifier for FlakyUpload {
        async fn send_text(&self, _text: &str) -> Result<(), NotifyError> {
            self.texts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn send_file(&self, _path: &Path) -> Result<(), NotifyError> {
            let n = self.uploads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                Err(NotifyError::Transient("upload reset".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn retried_upload_does_not_repeat_message() {
        use std::sync::atomic::Ordering;
        let flaky = FlakyUpload::default();
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::ZERO,
            ..RetryPolicy::default()
        };
        let note = Notification::text("report ready").with_attachment("r/report.html");
        deliver(&flaky, &note, &policy).await.unwrap();
        assert_eq!(flaky.texts.load(Ordering::SeqCst), 1);
        assert_eq!(flaky.uploads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ok_response_is_delivered() {
        let base = canned_server("200 OK", r#"{"ok":true,"result":{"username":"nac_bot"}}"#).await;
        let n = notifier(&base);
        n.send(&Notification::text("hello")).await.unwrap();
        assert_eq!(n.check().await.unwrap(), "nac_bot");
    }

    #[tokio::test]
    async fn rate_limit_is_transient() {
        let base = canned_server(
            "429 Too Many Requests",
            r#"{"ok":false,"description":"Too Many Requests: retry after 3"}"#,
        )
        .await;
        let err = notifier(&base).send(&Notification::text("x")).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn bad_request_is_permanent_and_hides_token() {
        let base = canned_server(
            "400 Bad Request",
            r#"{"ok":false,"description":"Bad Request: chat not found"}"#,
        )
        .await;
        let err = notifier(&base).send(&Notification::text("x")).await.unwrap_err();
        assert!(!err.is_transient());
        let text = err.to_string();
        assert!(text.contains("chat not found"));
        assert!(!text.contains("123:abc"));
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = notifier(&format!("http://{addr}"))
            .send(&Notification::text("x"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!err.to_string().contains("123:abc"));
    }
}
