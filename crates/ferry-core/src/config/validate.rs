//! Semantic validation of a loaded [`PipelineConfig`].

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use super::{
    EmailAccountConfig, EmailAuth, EmailNotificationConfig, ExecutionConfig, PipelineConfig, ScheduleMode,
    SourceLimits, WhatsAppAccountConfig, WhatsAppProvider,
};
use crate::credentials::CredentialStore;
use crate::storage::sanitize;

static TWILIO_SID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^AC[0-9a-fA-F]{32}$").unwrap());
static PHONE_NUMBER_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+$").unwrap());
static PHONE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+?[0-9]{6,15}$").unwrap());
static EMAIL_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());
static DAILY_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([01][0-9]|2[0-3]):[0-5][0-9]$").unwrap());

/// A single problem found in the configuration.
///
/// Names the offending field and, for credentials, the environment variable.
/// Never carries a credential value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether the problem is an unresolvable credential reference.
    pub fn is_credential(&self) -> bool {
        self.field.ends_with("_env")
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl PipelineConfig {
    /// Check the configuration, resolving credential references through
    /// `credentials`. An empty list means the config is runnable.
    pub fn validate(&self, credentials: &CredentialStore) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.enabled_accounts().is_empty() {
            errors.push(ValidationError::new(
                "sources",
                "no enabled source-account (enable whatsapp or email with at least one account)",
            ));
        }

        // Names map to output directories, so two names that sanitize to the
        // same directory collide as surely as identical names.
        let mut names: HashMap<String, &str> = HashMap::new();
        let all_names = self
            .whatsapp
            .accounts
            .iter()
            .map(|a| ("whatsapp", a.name.as_str()))
            .chain(self.email.accounts.iter().map(|a| ("email", a.name.as_str())));
        for (section, name) in all_names {
            if name.trim().is_empty() {
                errors.push(ValidationError::new(
                    format!("{}.accounts.name", section),
                    "account name must not be empty",
                ));
            } else if let Some(previous) = names.insert(sanitize(name, "account"), name) {
                let message = if previous == name {
                    format!("duplicate account name '{}'", name)
                } else {
                    format!(
                        "account name '{}' shares an output directory with '{}'",
                        name, previous
                    )
                };
                errors.push(ValidationError::new(
                    format!("{}.accounts.name", section),
                    message,
                ));
            }
        }

        if self.whatsapp.enabled {
            for account in self.whatsapp.accounts.iter().filter(|a| a.enabled) {
                validate_whatsapp(account, credentials, &mut errors);
            }
        }
        if self.email.enabled {
            for account in self.email.accounts.iter().filter(|a| a.enabled) {
                validate_email(account, credentials, &mut errors);
            }
        }

        if self.storage.base_path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.base_path",
                "must not be empty",
            ));
        }
        if self.storage.dedup_db_path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.dedup_db_path",
                "must not be empty",
            ));
        }

        validate_execution(&self.pipeline, &mut errors);
        self.validate_scheduler(&mut errors);
        self.validate_notifications(credentials, &mut errors);

        errors
    }

    fn validate_scheduler(&self, errors: &mut Vec<ValidationError>) {
        let scheduler = &self.scheduler;
        if !scheduler.enabled {
            return;
        }
        match scheduler.mode {
            ScheduleMode::Once => {}
            ScheduleMode::Interval => match scheduler.interval_minutes {
                Some(n) if n > 0 => {}
                Some(_) => errors.push(ValidationError::new(
                    "scheduler.interval_minutes",
                    "must be positive",
                )),
                None => errors.push(ValidationError::new(
                    "scheduler.interval_minutes",
                    "required for interval mode",
                )),
            },
            ScheduleMode::Cron => match scheduler.cron.as_deref().map(str::trim) {
                Some(expr) if expr.split_whitespace().count() >= 6 => {}
                Some(_) => errors.push(ValidationError::new(
                    "scheduler.cron",
                    "expected a six-field expression (sec min hour day month weekday)",
                )),
                None => errors.push(ValidationError::new(
                    "scheduler.cron",
                    "required for cron mode",
                )),
            },
            ScheduleMode::Daily => match scheduler.daily_time.as_deref() {
                Some(t) if DAILY_TIME.is_match(t) => {}
                Some(_) => errors.push(ValidationError::new(
                    "scheduler.daily_time",
                    "expected HH:MM (24-hour)",
                )),
                None => errors.push(ValidationError::new(
                    "scheduler.daily_time",
                    "required for daily mode",
                )),
            },
        }
    }

    fn validate_notifications(
        &self,
        credentials: &CredentialStore,
        errors: &mut Vec<ValidationError>,
    ) {
        let notifications = &self.notifications;
        if !notifications.enabled {
            return;
        }
        if notifications.webhook.is_none()
            && notifications.slack.is_none()
            && notifications.email.is_none()
        {
            errors.push(ValidationError::new(
                "notifications",
                "enabled but no webhook, slack or email sink configured",
            ));
        }
        if let Some(webhook) = &notifications.webhook {
            if !is_http_url(&webhook.url) {
                errors.push(ValidationError::new(
                    "notifications.webhook.url",
                    "must be an http(s) URL",
                ));
            }
            if webhook.timeout_secs == 0 {
                errors.push(ValidationError::new(
                    "notifications.webhook.timeout_secs",
                    "must be positive",
                ));
            }
            if let Some(var) = &webhook.secret_env {
                check_credential(
                    credentials,
                    "notifications.webhook.secret_env",
                    var,
                    errors,
                );
            }
        }
        if let Some(slack) = &notifications.slack {
            check_credential(
                credentials,
                "notifications.slack.webhook_url_env",
                &slack.webhook_url_env,
                errors,
            );
        }
        if let Some(email) = &notifications.email {
            validate_email_sink(email, credentials, errors);
        }
    }
}

fn validate_whatsapp(
    account: &WhatsAppAccountConfig,
    credentials: &CredentialStore,
    errors: &mut Vec<ValidationError>,
) {
    let prefix = format!("whatsapp.accounts[{}]", account.name);

    let needs_business = account.provider == WhatsAppProvider::Business;
    let needs_twilio = account.provider == WhatsAppProvider::Twilio;
    if needs_business && account.business.is_none() {
        errors.push(ValidationError::new(
            format!("{}.business", prefix),
            "required when provider is business",
        ));
    }
    if needs_twilio && account.twilio.is_none() {
        errors.push(ValidationError::new(
            format!("{}.twilio", prefix),
            "required when provider is twilio",
        ));
    }
    if account.provider == WhatsAppProvider::Auto
        && account.business.is_none()
        && account.twilio.is_none()
    {
        errors.push(ValidationError::new(
            prefix.clone(),
            "configure a business or twilio transport",
        ));
    }

    if let Some(business) = &account.business {
        if account.provider != WhatsAppProvider::Twilio {
            if !PHONE_NUMBER_ID.is_match(&business.phone_number_id) {
                errors.push(ValidationError::new(
                    format!("{}.business.phone_number_id", prefix),
                    "must be a numeric phone number id",
                ));
            }
            check_credential(
                credentials,
                &format!("{}.business.api_token_env", prefix),
                &business.api_token_env,
                errors,
            );
            if !is_http_url(&business.base_url) {
                errors.push(ValidationError::new(
                    format!("{}.business.base_url", prefix),
                    "must be an http(s) URL",
                ));
            }
        }
    }

    if let Some(twilio) = &account.twilio {
        if account.provider != WhatsAppProvider::Business {
            if let Err(e) = credentials.resolve_matching(
                &twilio.account_sid_env,
                "Twilio account SID",
                |v| TWILIO_SID.is_match(v),
            ) {
                errors.push(ValidationError::new(
                    format!("{}.twilio.account_sid_env", prefix),
                    e.to_string(),
                ));
            }
            check_credential(
                credentials,
                &format!("{}.twilio.auth_token_env", prefix),
                &twilio.auth_token_env,
                errors,
            );
            if let Some(number) = &twilio.whatsapp_number {
                let digits = number.trim_start_matches("whatsapp:");
                if !PHONE_NUMBER.is_match(digits) {
                    errors.push(ValidationError::new(
                        format!("{}.twilio.whatsapp_number", prefix),
                        "must be an E.164 phone number",
                    ));
                }
            }
        }
    }

    validate_limits(&prefix, &account.limits, errors);
}

fn validate_email(
    account: &EmailAccountConfig,
    credentials: &CredentialStore,
    errors: &mut Vec<ValidationError>,
) {
    let prefix = format!("email.accounts[{}]", account.name);

    if !EMAIL_ADDRESS.is_match(&account.address) {
        errors.push(ValidationError::new(
            format!("{}.address", prefix),
            "must be an email address",
        ));
    }
    if account.imap_server.trim().is_empty() {
        errors.push(ValidationError::new(
            format!("{}.imap_server", prefix),
            "must not be empty",
        ));
    }
    if account.imap_port == 0 {
        errors.push(ValidationError::new(
            format!("{}.imap_port", prefix),
            "must be positive",
        ));
    }
    if account.folders.is_empty() {
        errors.push(ValidationError::new(
            format!("{}.folders", prefix),
            "at least one folder is required",
        ));
    }
    for (i, folder) in account.folders.iter().enumerate() {
        if folder.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("{}.folders[{}]", prefix, i),
                "folder name must not be empty",
            ));
        }
    }

    match &account.auth {
        EmailAuth::AppPassword { password_env } => check_credential(
            credentials,
            &format!("{}.auth.password_env", prefix),
            password_env,
            errors,
        ),
        EmailAuth::Oauth2 {
            client_id_env,
            client_secret_env,
            refresh_token_env,
            token_url,
        } => {
            for (field, var) in [
                ("client_id_env", client_id_env),
                ("client_secret_env", client_secret_env),
                ("refresh_token_env", refresh_token_env),
            ] {
                check_credential(
                    credentials,
                    &format!("{}.auth.{}", prefix, field),
                    var,
                    errors,
                );
            }
            if !is_http_url(token_url) {
                errors.push(ValidationError::new(
                    format!("{}.auth.token_url", prefix),
                    "must be an http(s) URL",
                ));
            }
        }
    }

    validate_limits(&prefix, &account.limits, errors);
}

fn validate_email_sink(
    email: &EmailNotificationConfig,
    credentials: &CredentialStore,
    errors: &mut Vec<ValidationError>,
) {
    if email.smtp_server.trim().is_empty() {
        errors.push(ValidationError::new(
            "notifications.email.smtp_server",
            "must not be empty",
        ));
    }
    if email.smtp_port == 0 {
        errors.push(ValidationError::new(
            "notifications.email.smtp_port",
            "must be positive",
        ));
    }
    if email.timeout_secs == 0 {
        errors.push(ValidationError::new(
            "notifications.email.timeout_secs",
            "must be positive",
        ));
    }
    if !EMAIL_ADDRESS.is_match(&email.from) {
        errors.push(ValidationError::new(
            "notifications.email.from",
            "must be an email address",
        ));
    }
    if email.to.is_empty() {
        errors.push(ValidationError::new(
            "notifications.email.to",
            "at least one recipient is required",
        ));
    }
    for (i, to) in email.to.iter().enumerate() {
        if !EMAIL_ADDRESS.is_match(to) {
            errors.push(ValidationError::new(
                format!("notifications.email.to[{}]", i),
                "must be an email address",
            ));
        }
    }
    check_credential(
        credentials,
        "notifications.email.username_env",
        &email.username_env,
        errors,
    );
    check_credential(
        credentials,
        "notifications.email.password_env",
        &email.password_env,
        errors,
    );
}

fn validate_limits(prefix: &str, limits: &SourceLimits, errors: &mut Vec<ValidationError>) {
    if limits.rate_limit == 0 {
        errors.push(ValidationError::new(
            format!("{}.rate_limit", prefix),
            "must be positive",
        ));
    }
    if limits.batch_size == 0 {
        errors.push(ValidationError::new(
            format!("{}.batch_size", prefix),
            "must be positive",
        ));
    }
    if limits.max_records == Some(0) {
        errors.push(ValidationError::new(
            format!("{}.max_records", prefix),
            "must be positive when set",
        ));
    }
}

fn validate_execution(execution: &ExecutionConfig, errors: &mut Vec<ValidationError>) {
    let positive = [
        (
            "pipeline.max_concurrent_accounts",
            execution.max_concurrent_accounts as u64,
        ),
        (
            "pipeline.max_concurrent_downloads",
            execution.max_concurrent_downloads as u64,
        ),
        ("pipeline.source_timeout_secs", execution.source_timeout_secs),
        ("pipeline.request_timeout_secs", execution.request_timeout_secs),
        ("pipeline.acquire_timeout_secs", execution.acquire_timeout_secs),
        (
            "pipeline.retry.max_attempts",
            u64::from(execution.retry.max_attempts),
        ),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be positive"));
        }
    }

    let retry = &execution.retry;
    if !(retry.backoff_factor.is_finite() && retry.backoff_factor >= 1.0) {
        errors.push(ValidationError::new(
            "pipeline.retry.backoff_factor",
            "must be at least 1.0",
        ));
    }
    if retry.max_delay_ms < retry.base_delay_ms {
        errors.push(ValidationError::new(
            "pipeline.retry.max_delay_ms",
            "must not be smaller than base_delay_ms",
        ));
    }
}

fn check_credential(
    credentials: &CredentialStore,
    field: &str,
    var: &str,
    errors: &mut Vec<ValidationError>,
) {
    if let Err(e) = credentials.resolve(var) {
        errors.push(ValidationError::new(field, e.to_string()));
    }
}

fn is_http_url(s: &str) -> bool {
    s.starts_with("https://") || s.starts_with("http://")
}

#[cfg(test)]
mod tests {
    use super::super::*;
    use super::*;
    use std::collections::HashMap;

    const SID: &str = "AC0123456789abcdef0123456789abcdef";

    fn creds(pairs: &[(&str, &str)]) -> CredentialStore {
        CredentialStore::from_map(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        )
    }

    fn whatsapp(name: &str) -> WhatsAppAccountConfig {
        WhatsAppAccountConfig {
            name: name.to_string(),
            enabled: true,
            provider: WhatsAppProvider::Auto,
            business: Some(BusinessApiConfig {
                phone_number_id: "1098765432".to_string(),
                api_token_env: "WA_TOKEN".to_string(),
                base_url: DEFAULT_GRAPH_BASE_URL.to_string(),
            }),
            twilio: Some(TwilioConfig {
                account_sid_env: "TW_SID".to_string(),
                auth_token_env: "TW_TOKEN".to_string(),
                whatsapp_number: Some("+14155238886".to_string()),
            }),
            limits: SourceLimits::default(),
        }
    }

    fn email(name: &str) -> EmailAccountConfig {
        EmailAccountConfig {
            name: name.to_string(),
            enabled: true,
            address: "ops@example.com".to_string(),
            imap_server: "imap.example.com".to_string(),
            imap_port: 993,
            auth: EmailAuth::AppPassword {
                password_env: "MAIL_PW".to_string(),
            },
            folders: vec!["INBOX".to_string()],
            unread_only: false,
            limits: SourceLimits::default(),
        }
    }

    fn good_creds() -> CredentialStore {
        creds(&[
            ("WA_TOKEN", "token-value"),
            ("TW_SID", SID),
            ("TW_TOKEN", "tw-secret-value"),
            ("MAIL_PW", "hunter2-secret"),
        ])
    }

    #[test]
    fn test_valid_config_has_no_errors() {
        let config = PipelineConfig::builder()
            .whatsapp_account(whatsapp("support"))
            .email_account(email("inbox"))
            .build();
        assert_eq!(config.validate(&good_creds()), Vec::new());
    }

    #[test]
    fn test_no_enabled_source() {
        let config = PipelineConfig::default();
        let errors = config.validate(&good_creds());
        assert!(errors.iter().any(|e| e.field == "sources"));
    }

    #[test]
    fn test_duplicate_and_empty_names() {
        let config = PipelineConfig::builder()
            .whatsapp_account(whatsapp("shared"))
            .email_account(email("shared"))
            .email_account(email(""))
            .build();
        let errors = config.validate(&good_creds());
        assert!(errors.iter().any(|e| e.message.contains("duplicate")));
        assert!(errors.iter().any(|e| e.message.contains("must not be empty")));
    }

    #[test]
    fn test_names_sharing_a_directory_are_rejected() {
        let config = PipelineConfig::builder()
            .whatsapp_account(whatsapp("support line"))
            .email_account(email("support_line"))
            .build();
        let errors = config.validate(&good_creds());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "email.accounts.name");
        assert!(errors[0].message.contains("'support line'"));
    }

    #[test]
    fn test_blank_folder_rejected_among_valid_ones() {
        let mut mail = email("inbox");
        mail.folders = vec!["INBOX".to_string(), "  ".to_string()];
        let config = PipelineConfig::builder().email_account(mail).build();
        let errors = config.validate(&good_creds());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "email.accounts[inbox].folders[1]");

        let mut mail = email("inbox");
        mail.folders.clear();
        let config = PipelineConfig::builder().email_account(mail).build();
        assert!(config
            .validate(&good_creds())
            .iter()
            .any(|e| e.field == "email.accounts[inbox].folders"));
    }

    #[test]
    fn test_bad_credential_shapes_never_leak_values() {
        let creds = creds(&[
            ("WA_TOKEN", "token-value"),
            ("TW_SID", "not-a-sid-value"),
            ("TW_TOKEN", ""),
            ("MAIL_PW", "hunter2-secret"),
        ]);
        let mut account = whatsapp("support");
        account.business.as_mut().unwrap().phone_number_id = "12ab".to_string();
        let mut mail = email("inbox");
        mail.address = "not-an-address".to_string();
        let config = PipelineConfig::builder()
            .whatsapp_account(account)
            .email_account(mail)
            .build();

        let errors = config.validate(&creds);
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"whatsapp.accounts[support].business.phone_number_id"));
        assert!(fields.contains(&"whatsapp.accounts[support].twilio.account_sid_env"));
        assert!(fields.contains(&"whatsapp.accounts[support].twilio.auth_token_env"));
        assert!(fields.contains(&"email.accounts[inbox].address"));

        let credential_errors = errors.iter().filter(|e| e.is_credential()).count();
        assert_eq!(credential_errors, 2);

        let rendered: String = errors.iter().map(|e| e.to_string()).collect();
        assert!(!rendered.contains("not-a-sid-value"));
        assert!(!rendered.contains("token-value"));
        assert!(rendered.contains("TW_SID"));
    }

    #[test]
    fn test_oauth_credentials_required() {
        let mut mail = email("inbox");
        mail.auth = EmailAuth::Oauth2 {
            client_id_env: "G_ID".to_string(),
            client_secret_env: "G_SECRET".to_string(),
            refresh_token_env: "G_REFRESH".to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
        };
        let config = PipelineConfig::builder().email_account(mail).build();
        let errors = config.validate(&creds(&[("G_ID", "id")]));
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.field.starts_with("email.accounts[inbox].auth")));
    }

    #[test]
    fn test_numeric_fields_positive() {
        let mut account = whatsapp("support");
        account.limits.rate_limit = 0;
        account.limits.batch_size = 0;
        let mut config = PipelineConfig::builder().whatsapp_account(account).build();
        config.pipeline.max_concurrent_accounts = 0;
        config.pipeline.retry.max_attempts = 0;

        let errors = config.validate(&good_creds());
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"whatsapp.accounts[support].rate_limit"));
        assert!(fields.contains(&"whatsapp.accounts[support].batch_size"));
        assert!(fields.contains(&"pipeline.max_concurrent_accounts"));
        assert!(fields.contains(&"pipeline.retry.max_attempts"));
    }

    #[test]
    fn test_scheduler_fields_for_mode() {
        let mut config = PipelineConfig::builder()
            .email_account(email("inbox"))
            .build();
        config.scheduler.enabled = true;

        config.scheduler.mode = ScheduleMode::Interval;
        config.scheduler.interval_minutes = None;
        assert!(config
            .validate(&good_creds())
            .iter()
            .any(|e| e.field == "scheduler.interval_minutes"));

        config.scheduler.mode = ScheduleMode::Cron;
        config.scheduler.cron = Some("0 2 * * *".to_string());
        assert!(config
            .validate(&good_creds())
            .iter()
            .any(|e| e.field == "scheduler.cron"));

        config.scheduler.mode = ScheduleMode::Daily;
        config.scheduler.daily_time = Some("25:00".to_string());
        assert!(config
            .validate(&good_creds())
            .iter()
            .any(|e| e.field == "scheduler.daily_time"));

        config.scheduler.daily_time = Some("02:30".to_string());
        assert!(config.validate(&good_creds()).is_empty());
    }

    #[test]
    fn test_email_notification_sink_checked() {
        let mut config = PipelineConfig::builder()
            .email_account(email("inbox"))
            .build();
        config.notifications.enabled = true;
        config.notifications.email = Some(EmailNotificationConfig {
            smtp_server: "smtp.example.com".to_string(),
            smtp_port: 587,
            username_env: "SMTP_USER".to_string(),
            password_env: "SMTP_PW".to_string(),
            from: "ferry@example.com".to_string(),
            to: vec!["ops@example.com".to_string(), "nobody".to_string()],
            on_success: true,
            on_error: true,
            timeout_secs: 10,
        });

        let errors = config.validate(&good_creds());
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "notifications.email.to[1]",
                "notifications.email.username_env",
                "notifications.email.password_env",
            ]
        );
        assert!(errors[1].is_credential());
    }

    #[test]
    fn test_disabled_accounts_skip_credential_checks() {
        let mut mail = email("inbox");
        mail.enabled = false;
        let config = PipelineConfig::builder()
            .whatsapp_account(whatsapp("support"))
            .email_account(mail)
            .build();
        let creds = creds(&[("WA_TOKEN", "t"), ("TW_SID", SID), ("TW_TOKEN", "x")]);
        assert!(config.validate(&creds).is_empty());
    }
}
