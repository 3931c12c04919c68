//! Synthetic in-memory sources for `--mock-mode` smoke runs.
//!
//! Every account gets a fixed data set with ids derived from the account
//! name, so repeated runs hit the dedup index instead of storing copies.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use ferry_core::error::{FerryError, FerryResult};
use ferry_core::{
    AttachmentRef, ExtractionFilter, MessageType, Page, RawRecord, SourceExtractor, SourceKind,
};

/// PNG signature followed by a marker, enough for a distinct file per image.
fn fake_png(marker: &str) -> Vec<u8> {
    let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
    bytes.extend_from_slice(marker.as_bytes());
    bytes
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Slice `records` into pages of `batch_size`, keyed by offset.
fn page_of(records: &[RawRecord], filter: &ExtractionFilter, cursor: Option<&str>) -> FerryResult<Page> {
    let offset = match cursor {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| FerryError::parse(format!("invalid mock cursor '{}'", raw)))?,
        None => 0,
    };
    let end = (offset + filter.batch_size.max(1) as usize).min(records.len());
    let page = records.get(offset..end).unwrap_or_default().to_vec();
    Ok(Page {
        records: page,
        next_cursor: (end < records.len()).then(|| end.to_string()),
    })
}

/// Five chats: three text messages and two photos.
pub struct MockWhatsAppSource {
    account: String,
    records: Vec<RawRecord>,
}

impl MockWhatsAppSource {
    pub fn new(account: impl Into<String>) -> Self {
        let account = account.into();
        let start = base_time();
        let contact = "+15550100";
        let own = "+15550199";

        let mut records = Vec::new();
        for (n, text) in ["Morning! Are we still on for today?", "Yes, 10am works", "See you there"]
            .iter()
            .enumerate()
        {
            let sender = if n % 2 == 0 { contact } else { own };
            let receiver = if n % 2 == 0 { own } else { contact };
            let mut record = RawRecord::new(
                format!("mock-wa-{}-{}", account, n + 1),
                start + Duration::minutes(n as i64),
                sender,
                MessageType::Text,
            )
            .with_text(*text);
            record.recipients = vec![receiver.to_string()];
            records.push(record);
        }
        for n in 4..=5 {
            let filename = format!("photo_{}.png", n - 3);
            let mut record = RawRecord::new(
                format!("mock-wa-{}-{}", account, n),
                start + Duration::minutes(n as i64),
                contact,
                MessageType::Image,
            )
            .with_attachment(AttachmentRef::inline(
                filename.clone(),
                "image/png",
                fake_png(&format!("{}:{}", account, filename)),
            ));
            record.recipients = vec![own.to_string()];
            records.push(record);
        }

        Self { account, records }
    }
}

#[async_trait]
impl SourceExtractor for MockWhatsAppSource {
    fn kind(&self) -> SourceKind {
        SourceKind::WhatsApp
    }

    fn account(&self) -> &str {
        &self.account
    }

    async fn authenticate(&self) -> FerryResult<()> {
        tracing::debug!(account = %self.account, "mock whatsapp source ready");
        Ok(())
    }

    async fn fetch_page(
        &self,
        filter: &ExtractionFilter,
        cursor: Option<&str>,
    ) -> FerryResult<Page> {
        page_of(&self.records, filter, cursor)
    }
}

/// Three mails in INBOX, two of them with one attachment each.
pub struct MockEmailSource {
    account: String,
    records: Vec<RawRecord>,
}

impl MockEmailSource {
    pub fn new(account: impl Into<String>) -> Self {
        let account = account.into();
        let start = base_time();
        let mailbox = format!("{}@example.com", account);

        let mail = |n: usize, subject: &str, body: &str| {
            let mut record = RawRecord::new(
                format!("mock-mail-{}-{}@example.com", account, n),
                start + Duration::hours(n as i64),
                "reports@example.com",
                MessageType::Email,
            )
            .with_text(body);
            record.subject = Some(subject.to_string());
            record.recipients = vec![mailbox.clone()];
            record.folder = Some("INBOX".to_string());
            record.is_read = Some(false);
            record
        };

        let records = vec![
            mail(1, "Weekly summary", "Nothing unusual this week."),
            mail(2, "Invoice January", "Invoice attached.").with_attachment(
                AttachmentRef::inline(
                    "invoice.pdf",
                    "application/pdf",
                    format!("%PDF-1.4\n% invoice for {}\n", account).into_bytes(),
                ),
            ),
            mail(3, "Site photo", "Photo from the visit.")
                .with_attachment(AttachmentRef::inline(
                    "site.png",
                    "image/png",
                    fake_png(&format!("{}:site.png", account)),
                )),
        ];

        Self { account, records }
    }
}

#[async_trait]
impl SourceExtractor for MockEmailSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Email
    }

    fn account(&self) -> &str {
        &self.account
    }

    async fn authenticate(&self) -> FerryResult<()> {
        tracing::debug!(account = %self.account, "mock email source ready");
        Ok(())
    }

    async fn fetch_page(
        &self,
        filter: &ExtractionFilter,
        cursor: Option<&str>,
    ) -> FerryResult<Page> {
        page_of(&self.records, filter, cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_whatsapp_pages() {
        let source = MockWhatsAppSource::new("family");
        let filter = ExtractionFilter {
            batch_size: 2,
            ..ExtractionFilter::default()
        };

        let mut cursor: Option<String> = None;
        let mut ids = Vec::new();
        loop {
            let page = source.fetch_page(&filter, cursor.as_deref()).await.unwrap();
            ids.extend(page.records.iter().map(|r| r.id.clone()));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(ids.len(), 5);
        assert_eq!(ids[0], "mock-wa-family-1");
        assert_eq!(ids[4], "mock-wa-family-5");
    }

    #[tokio::test]
    async fn test_mock_email_attachments() {
        let source = MockEmailSource::new("work");
        let page = source
            .fetch_page(&ExtractionFilter::default(), None)
            .await
            .unwrap();

        assert_eq!(page.records.len(), 3);
        assert!(page.next_cursor.is_none());
        let attachments: usize = page.records.iter().map(|r| r.attachments.len()).sum();
        assert_eq!(attachments, 2);
    }

    #[tokio::test]
    async fn test_bad_cursor_is_parse_error() {
        let source = MockEmailSource::new("work");
        let err = source
            .fetch_page(&ExtractionFilter::default(), Some("INBOX"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ferry_core::ErrorKind::Parse);
    }
}
