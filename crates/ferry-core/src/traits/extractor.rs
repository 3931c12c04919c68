//! Source extractor trait and related types.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

use crate::config::{AccountConfig, SourceLimits};
use crate::credentials::CredentialStore;
use crate::error::{FerryError, FerryResult};
use crate::retry::RequestPolicy;
use crate::types::{AttachmentLocation, AttachmentRef, RawRecord, SourceKind};

/// What to extract in one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionFilter {
    /// Only records at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only unread records, where the provider knows the notion.
    pub unread_only: bool,
    pub batch_size: u32,
    /// Stop after this many records have been fetched.
    pub max_records: Option<usize>,
}

impl ExtractionFilter {
    /// Filter for an account's limits as of `now`.
    pub fn for_account(account: &AccountConfig<'_>, now: DateTime<Utc>) -> Self {
        let unread_only = match account {
            AccountConfig::Email(email) => email.unread_only,
            AccountConfig::WhatsApp(_) => false,
        };
        Self::from_limits(account.limits(), unread_only, now)
    }

    pub fn from_limits(limits: &SourceLimits, unread_only: bool, now: DateTime<Utc>) -> Self {
        let since = (limits.date_range_days > 0)
            .then(|| now - ChronoDuration::days(i64::from(limits.date_range_days)));
        Self {
            since,
            unread_only,
            batch_size: limits.batch_size.max(1),
            max_records: limits.max_records,
        }
    }
}

impl Default for ExtractionFilter {
    fn default() -> Self {
        Self {
            since: None,
            unread_only: false,
            batch_size: 100,
            max_records: None,
        }
    }
}

/// One page of provider records.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// Opaque position of the next page; `None` when exhausted.
    pub next_cursor: Option<String>,
}

impl Page {
    pub fn last(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            next_cursor: None,
        }
    }
}

/// Core extractor trait - every provider family implements this.
///
/// Implementations only talk to the provider. Pagination, deduplication
/// and persistence are driven by [`crate::SourceRunner`].
#[async_trait]
pub trait SourceExtractor: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Configured account name.
    fn account(&self) -> &str;

    /// Establish and verify credentials. Authentication errors are final.
    async fn authenticate(&self) -> FerryResult<()>;

    /// Fetch the page at `cursor` (`None` for the first page).
    async fn fetch_page(&self, filter: &ExtractionFilter, cursor: Option<&str>)
        -> FerryResult<Page>;

    /// Fetch the bytes of an attachment announced in a page.
    async fn download_attachment(&self, attachment: &AttachmentRef) -> FerryResult<Vec<u8>> {
        match &attachment.location {
            AttachmentLocation::Inline(bytes) => Ok(bytes.clone()),
            other => Err(FerryError::media(
                &attachment.filename,
                format!("{:?} is not supported by this source", other),
            )),
        }
    }

    /// Release provider sessions. Called once after extraction.
    async fn close(&self) {}
}

/// Per-account services handed to a factory.
#[derive(Debug, Clone)]
pub struct ExtractorContext {
    pub credentials: CredentialStore,
    pub policy: RequestPolicy,
    pub request_timeout: Duration,
}

/// Builds extractors from account configuration.
pub trait ExtractorFactory: Send + Sync {
    fn create(
        &self,
        account: &AccountConfig<'_>,
        ctx: ExtractorContext,
    ) -> FerryResult<Box<dyn SourceExtractor>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_from_limits() {
        let now = Utc::now();
        let limits = SourceLimits {
            rate_limit: 10,
            batch_size: 0,
            max_records: Some(50),
            date_range_days: 3,
        };
        let filter = ExtractionFilter::from_limits(&limits, true, now);
        assert_eq!(filter.since, Some(now - ChronoDuration::days(3)));
        assert_eq!(filter.batch_size, 1);
        assert!(filter.unread_only);

        let unbounded = SourceLimits {
            date_range_days: 0,
            ..limits
        };
        assert_eq!(ExtractionFilter::from_limits(&unbounded, false, now).since, None);
    }
}
