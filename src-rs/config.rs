use crate::controller::{FocusMethod, KeyChord};
use crate::error::RunError;
use crate::metrics::ExpectedModality;
use crate::model::{ChannelKind, Recipient};
use crate::render::{EmailTemplate, MessageTemplate};
use crate::util::format_date;
use crate::visual_loop::{AcquireStrategy, LoopSettings};
use chrono::format::{Item, StrftimeItems};
use chrono::NaiveDate;
use lettre::message::Mailbox;
use lettre::Address;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_HELP: &str = r##"Config JSON (minimal):
{
  "cleanup_dirs": ["/home/bot/Downloads"],
  "generation": {
    "command": ["papermill", "report.ipynb", "report.ipynb"],
    "artifact_dir": "output",
    "artifact_pattern": "%Y%m%d_report.xlsx"
  },
  "metrics": {"path": "output/metrics.json"},
  "message": {"link": "https://share.example.org/reports"},
  "channels": [
    {"kind": "file_copy", "destinations": ["/mnt/public/reports"]},
    {"kind": "email", "from": "Report Bot <bot@example.org>",
     "smtp": {"host": "smtp.example.org", "username": "bot@example.org", "password_env": "SMTP_PASSWORD"},
     "recipients": [{"name": "Ops", "address": "ops@example.org"}]},
    {"kind": "cloud_upload", "folders": ["1AbCdEf"]},
    {"kind": "messaging", "template_image": "img/send_button.png",
     "contacts": [{"name": "Ana", "address": "+5561999990000"}]}
  ]
}

Secrets are read from the environment (a .env file is loaded first when present)."##;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Directories whose files are deleted before generation.
    #[serde(default)]
    pub cleanup_dirs: Vec<PathBuf>,
    pub generation: GenerationConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub message: MessageTemplate,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "GenerationConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    pub artifact_dir: PathBuf,
    /// chrono format evaluated against the local run date.
    #[serde(default = "GenerationConfig::default_artifact_pattern")]
    pub artifact_pattern: String,
}

impl GenerationConfig {
    fn default_timeout_secs() -> u64 {
        1800
    }

    fn default_artifact_pattern() -> String {
        "%Y%m%d_report.xlsx".to_string()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Defaults to `<artifact_dir>/metrics.json`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "MetricsConfig::default_date_format")]
    pub date_format: String,
    #[serde(default)]
    pub expected_modalities: Vec<ExpectedModality>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            path: None,
            date_format: Self::default_date_format(),
            expected_modalities: Vec::new(),
        }
    }
}

impl MetricsConfig {
    fn default_date_format() -> String {
        "%d/%m/%Y".to_string()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Upper bound on concurrent deliveries within a non-UI channel.
    #[serde(default = "RunConfig::default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default)]
    pub run_budget_secs: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_parallel: Self::default_max_parallel(),
            run_budget_secs: None,
        }
    }
}

impl RunConfig {
    fn default_max_parallel() -> usize {
        1
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContactConfig {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelConfig {
    FileCopy(FileCopyConfig),
    Email(EmailConfig),
    CloudUpload(CloudUploadConfig),
    Messaging(MessagingConfig),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileCopyConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub destinations: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub smtp: SmtpConfig,
    pub from: String,
    pub recipients: Vec<ContactConfig>,
    #[serde(default)]
    pub template: EmailTemplate,
    #[serde(default)]
    pub signature_image: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SmtpSecurity {
    /// Implicit TLS, port 465.
    #[default]
    Tls,
    /// STARTTLS upgrade, port 587.
    Starttls,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub security: SmtpSecurity,
    pub username: String,
    #[serde(default = "SmtpConfig::default_password_env")]
    pub password_env: String,
    #[serde(default = "SmtpConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl SmtpConfig {
    fn default_password_env() -> String {
        "SMTP_PASSWORD".to_string()
    }

    fn default_timeout_secs() -> u64 {
        60
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudUploadConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub folders: Vec<String>,
    #[serde(default = "CloudUploadConfig::default_client_id_env")]
    pub client_id_env: String,
    #[serde(default = "CloudUploadConfig::default_client_secret_env")]
    pub client_secret_env: String,
    #[serde(default = "CloudUploadConfig::default_refresh_token_env")]
    pub refresh_token_env: String,
    #[serde(default = "CloudUploadConfig::default_token_url")]
    pub token_url: String,
    #[serde(default = "CloudUploadConfig::default_upload_url")]
    pub upload_url: String,
    #[serde(default = "CloudUploadConfig::default_mime_type")]
    pub mime_type: String,
    #[serde(default = "CloudUploadConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl CloudUploadConfig {
    fn default_client_id_env() -> String {
        "GOOGLE_CLIENT_ID".to_string()
    }

    fn default_client_secret_env() -> String {
        "GOOGLE_CLIENT_SECRET".to_string()
    }

    fn default_refresh_token_env() -> String {
        "GOOGLE_REFRESH_TOKEN".to_string()
    }

    fn default_token_url() -> String {
        "https://oauth2.googleapis.com/token".to_string()
    }

    fn default_upload_url() -> String {
        "https://www.googleapis.com/upload/drive/v3/files".to_string()
    }

    fn default_mime_type() -> String {
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".to_string()
    }

    fn default_timeout_secs() -> u64 {
        300
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessagingConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub contacts: Vec<ContactConfig>,
    /// `{phone}` and `{text}` are substituted per recipient.
    #[serde(default = "MessagingConfig::default_deep_link")]
    pub deep_link: String,
    pub template_image: PathBuf,
    #[serde(default = "MessagingConfig::default_confidence")]
    pub confidence: f64,
    #[serde(default = "MessagingConfig::default_search_deadline_secs")]
    pub search_deadline_secs: f64,
    #[serde(default = "MessagingConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "MessagingConfig::default_settle_secs")]
    pub settle_secs: f64,
    #[serde(default)]
    pub strategy: AcquireStrategy,
    #[serde(default)]
    pub focus: FocusMethod,
    #[serde(default = "MessagingConfig::default_fallback_key")]
    pub fallback_key: String,
    #[serde(default = "MessagingConfig::default_post_action_wait_secs")]
    pub post_action_wait_secs: f64,
    #[serde(default = "MessagingConfig::default_post_close_wait_secs")]
    pub post_close_wait_secs: f64,
    #[serde(default = "MessagingConfig::default_nudge_pointer")]
    pub nudge_pointer: bool,
    #[serde(default = "MessagingConfig::default_max_capture_errors")]
    pub max_capture_errors: u32,
    #[serde(default)]
    pub controller: ControllerConfig,
}

impl MessagingConfig {
    fn default_deep_link() -> String {
        "https://web.whatsapp.com/send?phone={phone}&text={text}".to_string()
    }

    fn default_confidence() -> f64 {
        crate::matcher::DEFAULT_CONFIDENCE
    }

    fn default_search_deadline_secs() -> f64 {
        30.0
    }

    fn default_poll_interval_ms() -> u64 {
        1000
    }

    fn default_settle_secs() -> f64 {
        12.0
    }

    fn default_fallback_key() -> String {
        "enter".to_string()
    }

    fn default_post_action_wait_secs() -> f64 {
        4.0
    }

    fn default_post_close_wait_secs() -> f64 {
        3.0
    }

    fn default_nudge_pointer() -> bool {
        true
    }

    fn default_max_capture_errors() -> u32 {
        3
    }

    pub fn search_deadline(&self) -> Result<Duration, String> {
        seconds(self.search_deadline_secs, "search_deadline_secs")
    }

    pub fn loop_settings(&self) -> Result<LoopSettings, String> {
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than zero".to_string());
        }
        let fallback_key: KeyChord = self
            .fallback_key
            .parse()
            .map_err(|err| format!("fallback_key: {err}"))?;
        Ok(LoopSettings {
            strategy: self.strategy,
            focus: self.focus,
            settle: seconds(self.settle_secs, "settle_secs")?,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            fallback_key,
            post_action_wait: seconds(self.post_action_wait_secs, "post_action_wait_secs")?,
            post_close_wait: seconds(self.post_close_wait_secs, "post_close_wait_secs")?,
            nudge_pointer: self.nudge_pointer,
            max_capture_errors: self.max_capture_errors,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Browser argv; `{url}` is replaced by the deep link.
    #[serde(default = "ControllerConfig::default_browser_command")]
    pub browser_command: Vec<String>,
    #[serde(default)]
    pub window_class: Option<String>,
    #[serde(default = "ControllerConfig::default_close_key")]
    pub close_key: String,
    /// Capture pixels per pointer point (2.0 on most HiDPI displays).
    #[serde(default = "ControllerConfig::default_capture_scale")]
    pub capture_scale: f64,
    #[serde(default = "ControllerConfig::default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            browser_command: Self::default_browser_command(),
            window_class: None,
            close_key: Self::default_close_key(),
            capture_scale: Self::default_capture_scale(),
            command_timeout_ms: Self::default_command_timeout_ms(),
        }
    }
}

impl ControllerConfig {
    fn default_browser_command() -> Vec<String> {
        let argv: &[&str] = if cfg!(target_os = "macos") {
            &["open", "{url}"]
        } else {
            &["xdg-open", "{url}"]
        };
        argv.iter().map(|s| s.to_string()).collect()
    }

    fn default_close_key() -> String {
        if cfg!(target_os = "macos") {
            "cmd+w".to_string()
        } else {
            "ctrl+w".to_string()
        }
    }

    fn default_capture_scale() -> f64 {
        1.0
    }

    fn default_command_timeout_ms() -> u64 {
        3000
    }
}

impl ChannelConfig {
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelConfig::FileCopy(_) => ChannelKind::FileCopy,
            ChannelConfig::Email(_) => ChannelKind::Email,
            ChannelConfig::CloudUpload(_) => ChannelKind::CloudUpload,
            ChannelConfig::Messaging(_) => ChannelKind::Messaging,
        }
    }

    pub fn display_name(&self) -> String {
        let name = match self {
            ChannelConfig::FileCopy(c) => c.name.as_deref(),
            ChannelConfig::Email(c) => c.name.as_deref(),
            ChannelConfig::CloudUpload(c) => c.name.as_deref(),
            ChannelConfig::Messaging(c) => c.name.as_deref(),
        };
        name.map(str::to_string)
            .unwrap_or_else(|| self.kind().to_string())
    }

    pub fn recipients(&self) -> Vec<Recipient> {
        match self {
            ChannelConfig::FileCopy(c) => c.destinations.iter().map(Recipient::destination).collect(),
            ChannelConfig::CloudUpload(c) => c.folders.iter().map(Recipient::destination).collect(),
            ChannelConfig::Email(c) => contacts(&c.recipients),
            ChannelConfig::Messaging(c) => contacts(&c.contacts),
        }
    }
}

fn contacts(items: &[ContactConfig]) -> Vec<Recipient> {
    items
        .iter()
        .map(|c| Recipient::contact(c.name.clone(), c.address.clone()))
        .collect()
}

impl DispatchConfig {
    pub fn load(path: &Path) -> Result<Self, RunError> {
        let raw = fs::read_to_string(path).map_err(|err| {
            RunError::Configuration(format!("failed to read config {}: {err}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            RunError::Configuration(format!("invalid config JSON {}: {err}", path.display()))
        })
    }

    pub fn artifact_path(&self, date: NaiveDate) -> PathBuf {
        self.generation
            .artifact_dir
            .join(format_date(date, &self.generation.artifact_pattern))
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.metrics
            .path
            .clone()
            .unwrap_or_else(|| self.generation.artifact_dir.join("metrics.json"))
    }

    pub fn run_budget(&self) -> Option<Duration> {
        self.run.run_budget_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), RunError> {
        self.validate_with(|key| env::var(key).ok())
    }

    /// Collects every problem before failing so one run surfaces them all.
    pub fn validate_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), RunError> {
        let mut problems: Vec<String> = Vec::new();
        let has_secret = |key: &str| lookup(key).is_some_and(|v| !v.trim().is_empty());

        if self.generation.command.is_empty() {
            problems.push("generation.command must not be empty".to_string());
        }
        if !valid_strftime(&self.generation.artifact_pattern) {
            problems.push(format!(
                "generation.artifact_pattern is not a valid date pattern: {}",
                self.generation.artifact_pattern
            ));
        }
        if !valid_strftime(&self.metrics.date_format) {
            problems.push(format!(
                "metrics.date_format is not a valid date pattern: {}",
                self.metrics.date_format
            ));
        }
        if self.run.max_parallel == 0 {
            problems.push("run.max_parallel must be at least 1".to_string());
        }

        for (index, channel) in self.channels.iter().enumerate() {
            let label = format!("channels[{index}] ({})", channel.display_name());
            let mut fail = |msg: String| problems.push(format!("{label}: {msg}"));
            match channel {
                ChannelConfig::FileCopy(c) => {
                    if c.destinations.iter().any(|d| d.trim().is_empty()) {
                        fail("destinations must not contain empty paths".to_string());
                    }
                }
                ChannelConfig::Email(c) => {
                    if c.smtp.host.trim().is_empty() {
                        fail("smtp.host is required".to_string());
                    }
                    if c.smtp.username.trim().is_empty() {
                        fail("smtp.username is required".to_string());
                    }
                    if !has_secret(&c.smtp.password_env) {
                        fail(format!("environment variable {} is not set", c.smtp.password_env));
                    }
                    if let Err(err) = c.from.parse::<Mailbox>() {
                        fail(format!("invalid from address '{}': {err}", c.from));
                    }
                    for contact in &c.recipients {
                        if let Err(err) = contact.address.parse::<Address>() {
                            fail(format!("invalid recipient address '{}': {err}", contact.address));
                        }
                    }
                }
                ChannelConfig::CloudUpload(c) => {
                    if c.folders.iter().any(|f| f.trim().is_empty()) {
                        fail("folders must not contain empty ids".to_string());
                    }
                    for key in [&c.client_id_env, &c.client_secret_env, &c.refresh_token_env] {
                        if !has_secret(key) {
                            fail(format!("environment variable {key} is not set"));
                        }
                    }
                }
                ChannelConfig::Messaging(c) => {
                    if !c.deep_link.contains("{phone}") {
                        fail("deep_link must contain {phone}".to_string());
                    }
                    if !c.template_image.is_file() {
                        fail(format!(
                            "template_image not found: {}",
                            c.template_image.display()
                        ));
                    }
                    if !(c.confidence > 0.0 && c.confidence <= 1.0) {
                        fail(format!("confidence must be in (0, 1], got {}", c.confidence));
                    }
                    if let Err(err) = c.search_deadline() {
                        fail(err);
                    }
                    if let Err(err) = c.loop_settings() {
                        fail(err);
                    }
                    if let Err(err) = c.controller.close_key.parse::<KeyChord>() {
                        fail(format!("controller.close_key: {err}"));
                    }
                    if !c.controller.browser_command.iter().any(|p| p.contains("{url}")) {
                        fail("controller.browser_command must contain {url}".to_string());
                    }
                    if c.contacts.iter().any(|contact| contact.address.trim().is_empty()) {
                        fail("contacts must have an address".to_string());
                    }
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(RunError::Configuration(problems.join("; ")))
        }
    }
}

/// Reads a required secret from the environment.
pub fn secret(key: &str) -> anyhow::Result<String> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("environment variable {key} is not set"))
}

pub(crate) fn seconds(value: f64, field: &str) -> Result<Duration, String> {
    Duration::try_from_secs_f64(value).map_err(|_| format!("{field} must be a non-negative number of seconds, got {value}"))
}

fn valid_strftime(pattern: &str) -> bool {
    !pattern.is_empty() && StrftimeItems::new(pattern).all(|item| !matches!(item, Item::Error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample(template_image: &Path) -> DispatchConfig {
        serde_json::from_value(json!({
            "cleanup_dirs": ["/tmp/downloads"],
            "generation": {
                "command": ["papermill", "report.ipynb", "report.ipynb"],
                "artifact_dir": "output"
            },
            "channels": [
                {"kind": "file_copy", "destinations": ["/mnt/public"]},
                {"kind": "email", "from": "Bot <bot@example.org>",
                 "smtp": {"host": "smtp.example.org", "username": "bot@example.org"},
                 "recipients": [{"name": "Ops", "address": "ops@example.org"}]},
                {"kind": "cloud_upload", "folders": ["folder-1"]},
                {"kind": "messaging", "name": "chat", "template_image": template_image,
                 "contacts": [{"name": "Ana", "address": "+55 61 99999-0000"}]}
            ]
        }))
        .unwrap()
    }

    fn all_secrets(key: &str) -> Option<String> {
        Some(format!("value-of-{key}"))
    }

    #[test]
    fn parses_channels_in_order_with_defaults() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("button.png");
        fs::write(&image, b"png").unwrap();
        let config = sample(&image);

        let kinds: Vec<ChannelKind> = config.channels.iter().map(ChannelConfig::kind).collect();
        assert_eq!(
            kinds,
            vec![
                ChannelKind::FileCopy,
                ChannelKind::Email,
                ChannelKind::CloudUpload,
                ChannelKind::Messaging
            ]
        );
        assert_eq!(config.channels[3].display_name(), "chat");
        assert_eq!(config.channels[0].display_name(), "file_copy");
        assert_eq!(config.generation.timeout_secs, 1800);
        assert_eq!(config.run.max_parallel, 1);

        let ChannelConfig::Messaging(messaging) = &config.channels[3] else {
            panic!("expected messaging channel");
        };
        assert_eq!(messaging.confidence, 0.9);
        let settings = messaging.loop_settings().unwrap();
        assert_eq!(settings.settle, Duration::from_secs(12));
        assert_eq!(settings.poll_interval, Duration::from_secs(1));
        assert_eq!(messaging.search_deadline().unwrap(), Duration::from_secs(30));
        assert_eq!(settings.fallback_key.to_string(), "enter");

        config.validate_with(all_secrets).unwrap();
    }

    #[test]
    fn artifact_path_is_date_stamped() {
        let dir = tempdir().unwrap();
        let config = sample(&dir.path().join("button.png"));
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        assert_eq!(
            config.artifact_path(date),
            PathBuf::from("output").join("20261019_report.xlsx")
        );
        assert_eq!(config.metrics_path(), PathBuf::from("output").join("metrics.json"));
    }

    #[test]
    fn validation_reports_every_missing_setting() {
        let dir = tempdir().unwrap();
        let mut config = sample(&dir.path().join("missing.png"));
        config.generation.artifact_pattern = "%Q".to_string();

        let err = config.validate_with(|_| None).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("configuration error:"));
        assert!(message.contains("SMTP_PASSWORD"));
        assert!(message.contains("GOOGLE_REFRESH_TOKEN"));
        assert!(message.contains("template_image not found"));
        assert!(message.contains("artifact_pattern"));
    }

    #[test]
    fn rejects_invalid_loop_timings() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("button.png");
        fs::write(&image, b"png").unwrap();
        let mut config = sample(&image);
        if let ChannelConfig::Messaging(messaging) = &mut config.channels[3] {
            messaging.poll_interval_ms = 0;
            messaging.settle_secs = -1.0;
            messaging.confidence = 1.5;
        }
        let message = config.validate_with(all_secrets).unwrap_err().to_string();
        assert!(message.contains("confidence must be in (0, 1]"));
        assert!(message.contains("poll_interval_ms"));
    }

    #[test]
    fn recipients_follow_channel_kind() {
        let dir = tempdir().unwrap();
        let config = sample(&dir.path().join("button.png"));
        assert_eq!(
            config.channels[0].recipients(),
            vec![Recipient::destination("/mnt/public")]
        );
        assert_eq!(
            config.channels[1].recipients(),
            vec![Recipient::contact("Ops", "ops@example.org")]
        );
    }
}
