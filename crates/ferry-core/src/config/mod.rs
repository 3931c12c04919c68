//! Configuration system for ferry.
//!
//! Configuration is loaded from a YAML, TOML or JSON file and then patched
//! from `FERRY_*` environment variables. Secrets are never stored inline: every
//! credential field names the environment variable that holds it.

mod validate;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{FerryError, FerryResult};
use crate::retry::BackoffPolicy;
use crate::types::SourceKind;

pub use validate::ValidationError;

/// Default Graph API root for the WhatsApp Business API.
pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.facebook.com/v18.0";

/// Default OAuth2 token endpoint (Google).
pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Which WhatsApp transport an account should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WhatsAppProvider {
    /// Business API only.
    Business,
    /// Twilio Messages API only.
    Twilio,
    /// Business API when configured, Twilio as fallback.
    #[default]
    Auto,
}

/// WhatsApp Business (Graph) API settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessApiConfig {
    pub phone_number_id: String,
    /// Env var holding the bearer token.
    pub api_token_env: String,
    #[serde(default = "default_graph_base_url")]
    pub base_url: String,
}

/// Twilio WhatsApp settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwilioConfig {
    /// Env var holding the account SID.
    pub account_sid_env: String,
    /// Env var holding the auth token.
    pub auth_token_env: String,
    /// Number the account receives on, e.g. `+14155238886`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whatsapp_number: Option<String>,
}

/// Per-account request and paging limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceLimits {
    /// Requests per minute.
    pub rate_limit: u32,
    /// Records requested per page.
    pub batch_size: u32,
    /// Stop after this many records in one run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_records: Option<usize>,
    /// Look-back window in days; 0 means unbounded.
    pub date_range_days: u32,
}

impl Default for SourceLimits {
    fn default() -> Self {
        Self {
            rate_limit: 60,
            batch_size: 100,
            max_records: None,
            date_range_days: 7,
        }
    }
}

/// One WhatsApp source-account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhatsAppAccountConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub provider: WhatsAppProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business: Option<BusinessApiConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twilio: Option<TwilioConfig>,
    #[serde(flatten)]
    pub limits: SourceLimits,
}

/// How an IMAP account authenticates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum EmailAuth {
    /// Plain LOGIN with an app-specific password.
    AppPassword { password_env: String },
    /// XOAUTH2 with a refreshed access token.
    Oauth2 {
        client_id_env: String,
        client_secret_env: String,
        refresh_token_env: String,
        #[serde(default = "default_token_url")]
        token_url: String,
    },
}

/// One IMAP source-account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailAccountConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub address: String,
    pub imap_server: String,
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
    pub auth: EmailAuth,
    #[serde(default = "default_folders")]
    pub folders: Vec<String>,
    #[serde(default)]
    pub unread_only: bool,
    #[serde(flatten)]
    pub limits: SourceLimits,
}

/// `whatsapp:` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatsAppSection {
    pub enabled: bool,
    pub accounts: Vec<WhatsAppAccountConfig>,
}

/// `email:` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailSection {
    pub enabled: bool,
    pub accounts: Vec<EmailAccountConfig>,
}

/// `storage:` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub base_path: PathBuf,
    /// Second base path tried once when a write against `base_path` fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_path: Option<PathBuf>,
    /// SQLite file backing the dedup index.
    pub dedup_db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./data"),
            fallback_path: None,
            dedup_db_path: PathBuf::from("./data/dedup.db"),
        }
    }
}

/// When the pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ScheduleMode {
    #[default]
    Once,
    Interval,
    Cron,
    Daily,
}

/// What to do when a trigger fires while a run is still going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OverlapPolicy {
    #[default]
    Skip,
    Queue,
}

/// `scheduler:` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub mode: ScheduleMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_minutes: Option<u64>,
    /// Six-field cron expression (seconds first).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// `HH:MM` (UTC) for daily mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_time: Option<String>,
    pub overlap: OverlapPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: ScheduleMode::Once,
            interval_minutes: None,
            cron: None,
            daily_time: Some("02:00".to_string()),
            overlap: OverlapPolicy::Skip,
        }
    }
}

/// Generic JSON webhook sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// Env var holding the HMAC signing secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_env: Option<String>,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

/// Slack incoming-webhook sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlackConfig {
    /// Env var holding the incoming-webhook URL.
    pub webhook_url_env: String,
}

/// SMTP email sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailNotificationConfig {
    pub smtp_server: String,
    /// 465 uses implicit TLS, anything else STARTTLS.
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub username_env: String,
    pub password_env: String,
    pub from: String,
    pub to: Vec<String>,
    /// Mail the run summary when every source succeeded.
    #[serde(default = "default_true")]
    pub on_success: bool,
    /// Mail an alert for each source that recorded errors.
    #[serde(default = "default_true")]
    pub on_error: bool,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

/// `notifications:` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slack: Option<SlackConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailNotificationConfig>,
    /// Suppress notifications for runs where every source succeeded cleanly.
    pub only_on_failure: bool,
}

/// `pipeline:` section: concurrency, deadlines and retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_concurrent_accounts: usize,
    pub max_concurrent_downloads: usize,
    /// Deadline for one source-account's whole extraction.
    pub source_timeout_secs: u64,
    /// Per-HTTP-request timeout.
    pub request_timeout_secs: u64,
    /// Longest a request may wait for a rate-limit slot.
    pub acquire_timeout_secs: u64,
    pub retry: BackoffPolicy,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_accounts: 4,
            max_concurrent_downloads: 4,
            source_timeout_secs: 1800,
            request_timeout_secs: 30,
            acquire_timeout_secs: 120,
            retry: BackoffPolicy::default(),
        }
    }
}

/// `logging:` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub whatsapp: WhatsAppSection,
    pub email: EmailSection,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub notifications: NotificationConfig,
    pub pipeline: ExecutionConfig,
    pub logging: LoggingConfig,
}

/// An enabled account, regardless of provider family.
#[derive(Debug, Clone, Copy)]
pub enum AccountConfig<'a> {
    WhatsApp(&'a WhatsAppAccountConfig),
    Email(&'a EmailAccountConfig),
}

impl AccountConfig<'_> {
    pub fn name(&self) -> &str {
        match self {
            Self::WhatsApp(a) => &a.name,
            Self::Email(a) => &a.name,
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::WhatsApp(_) => SourceKind::WhatsApp,
            Self::Email(_) => SourceKind::Email,
        }
    }

    pub fn limits(&self) -> &SourceLimits {
        match self {
            Self::WhatsApp(a) => &a.limits,
            Self::Email(a) => &a.limits,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a file (YAML, TOML or JSON) and apply
    /// environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> FerryResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FerryError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let ext = path.extension().and_then(|e| e.to_str());

        let mut config: Self = match ext {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| FerryError::Configuration(e.to_string()))?
            }
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| FerryError::Configuration(e.to_string()))?,
            Some("yaml" | "yml") => serde_yaml::from_str(&content)
                .map_err(|e| FerryError::Configuration(e.to_string()))?,
            _ => {
                return Err(FerryError::Configuration(
                    "Unsupported config file format. Use .toml, .json, or .yaml".to_string(),
                ))
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Patch settings from `FERRY_*` environment variables.
    ///
    /// Unparseable numeric values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("FERRY_STORAGE_BASE_PATH") {
            self.storage.base_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("FERRY_DEDUP_DB_PATH") {
            self.storage.dedup_db_path = PathBuf::from(path);
        }
        if let Some(n) = env_number("FERRY_MAX_CONCURRENT_ACCOUNTS") {
            self.pipeline.max_concurrent_accounts = n;
        }
        if let Some(n) = env_number("FERRY_SOURCE_TIMEOUT_SECS") {
            self.pipeline.source_timeout_secs = n;
        }
        if let Ok(level) = std::env::var("FERRY_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Enabled accounts in config order, WhatsApp first.
    pub fn enabled_accounts(&self) -> Vec<AccountConfig<'_>> {
        let mut accounts = Vec::new();
        if self.whatsapp.enabled {
            accounts.extend(
                self.whatsapp
                    .accounts
                    .iter()
                    .filter(|a| a.enabled)
                    .map(AccountConfig::WhatsApp),
            );
        }
        if self.email.enabled {
            accounts.extend(
                self.email
                    .accounts
                    .iter()
                    .filter(|a| a.enabled)
                    .map(AccountConfig::Email),
            );
        }
        accounts
    }

    /// Build configuration using builder pattern.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(var = key, "ignoring non-numeric environment override");
            None
        }
    }
}

/// Builder for PipelineConfig.
#[derive(Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Add a WhatsApp account and enable the section.
    pub fn whatsapp_account(mut self, account: WhatsAppAccountConfig) -> Self {
        self.config.whatsapp.enabled = true;
        self.config.whatsapp.accounts.push(account);
        self
    }

    /// Add an email account and enable the section.
    pub fn email_account(mut self, account: EmailAccountConfig) -> Self {
        self.config.email.enabled = true;
        self.config.email.accounts.push(account);
        self
    }

    /// Set the output base path.
    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage.base_path = path.into();
        self
    }

    /// Set the dedup index database path.
    pub fn dedup_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage.dedup_db_path = path.into();
        self
    }

    /// Set execution limits.
    pub fn execution(mut self, execution: ExecutionConfig) -> Self {
        self.config.pipeline = execution;
        self
    }

    /// Set notification configuration.
    pub fn notifications(mut self, notifications: NotificationConfig) -> Self {
        self.config.notifications = notifications;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> PipelineConfig {
        self.config
    }
}

fn default_true() -> bool {
    true
}

fn default_graph_base_url() -> String {
    DEFAULT_GRAPH_BASE_URL.to_string()
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}

fn default_imap_port() -> u16 {
    993
}

fn default_folders() -> Vec<String> {
    vec!["INBOX".to_string()]
}

fn default_smtp_port() -> u16 {
    587
}

fn default_webhook_timeout() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
whatsapp:
  enabled: true
  accounts:
    - name: support
      provider: auto
      business:
        phone_number_id: "1234567890"
        api_token_env: WA_TOKEN
      twilio:
        account_sid_env: TW_SID
        auth_token_env: TW_TOKEN
      rate_limit: 30
email:
  enabled: true
  accounts:
    - name: inbox
      address: ops@example.com
      imap_server: imap.example.com
      auth:
        method: oauth2
        client_id_env: G_ID
        client_secret_env: G_SECRET
        refresh_token_env: G_REFRESH
      unread_only: true
scheduler:
  enabled: true
  mode: interval
  interval_minutes: 15
"#;

    #[test]
    fn test_yaml_parsing_with_defaults() {
        let config: PipelineConfig = serde_yaml::from_str(YAML).unwrap();

        let wa = &config.whatsapp.accounts[0];
        assert!(wa.enabled);
        assert_eq!(wa.provider, WhatsAppProvider::Auto);
        assert_eq!(wa.limits.rate_limit, 30);
        assert_eq!(wa.limits.batch_size, 100);
        assert_eq!(
            wa.business.as_ref().unwrap().base_url,
            DEFAULT_GRAPH_BASE_URL
        );

        let email = &config.email.accounts[0];
        assert_eq!(email.imap_port, 993);
        assert_eq!(email.folders, vec!["INBOX".to_string()]);
        match &email.auth {
            EmailAuth::Oauth2 { token_url, .. } => assert_eq!(token_url, DEFAULT_TOKEN_URL),
            other => panic!("unexpected auth {:?}", other),
        }

        assert_eq!(config.scheduler.mode, ScheduleMode::Interval);
        assert_eq!(config.scheduler.overlap, OverlapPolicy::Skip);
        assert_eq!(config.pipeline.retry.max_attempts, 3);
        assert_eq!(config.enabled_accounts().len(), 2);
    }

    #[test]
    fn test_unknown_variants_rejected() {
        let bad = "email:\n  accounts:\n    - name: a\n      address: a@b.co\n      imap_server: x\n      auth:\n        method: kerberos\n";
        assert!(serde_yaml::from_str::<PipelineConfig>(bad).is_err());

        let bad = "scheduler:\n  mode: hourly\n";
        assert!(serde_yaml::from_str::<PipelineConfig>(bad).is_err());
    }

    #[test]
    fn test_disabled_section_hides_accounts() {
        let mut config: PipelineConfig = serde_yaml::from_str(YAML).unwrap();
        config.whatsapp.enabled = false;
        let names: Vec<_> = config
            .enabled_accounts()
            .iter()
            .map(|a| a.name().to_string())
            .collect();
        assert_eq!(names, vec!["inbox".to_string()]);
    }

    #[test]
    fn test_from_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferry.toml");
        std::fs::write(
            &path,
            "[storage]\nbase_path = \"/tmp/out\"\n\n[pipeline]\nmax_concurrent_downloads = 8\n",
        )
        .unwrap();
        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.pipeline.max_concurrent_downloads, 8);

        let path = dir.path().join("ferry.ini");
        std::fs::write(&path, "x").unwrap();
        assert!(matches!(
            PipelineConfig::from_file(&path),
            Err(FerryError::Configuration(_))
        ));
    }
}
