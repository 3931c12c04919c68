//! WhatsApp Business (Graph) API transport.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use ferry_core::config::BusinessApiConfig;
use ferry_core::error::{FerryError, FerryResult};
use ferry_core::{
    AttachmentLocation, AttachmentRef, ExtractionFilter, ExtractorContext, MessageType, Page,
    RawRecord,
};

use super::{extension_for, Transport};
use crate::http::{HttpAuth, ProviderClient};

/// Bearer-token client for one phone number.
pub struct BusinessTransport {
    http: ProviderClient,
    base_url: String,
    phone_number_id: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    data: Vec<GraphMessage>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    #[serde(default)]
    cursors: Option<Cursors>,
    /// Present only when another page exists.
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Cursors {
    #[serde(default)]
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphMessage {
    id: String,
    from: String,
    #[serde(default)]
    to: Option<String>,
    /// Unix seconds, as a string.
    timestamp: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<TextBody>,
    #[serde(default)]
    image: Option<MediaBody>,
    #[serde(default)]
    audio: Option<MediaBody>,
    #[serde(default)]
    video: Option<MediaBody>,
    #[serde(default)]
    document: Option<MediaBody>,
    #[serde(default)]
    sticker: Option<MediaBody>,
}

#[derive(Debug, Deserialize)]
struct TextBody {
    body: String,
}

#[derive(Debug, Deserialize)]
struct MediaBody {
    id: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaInfo {
    url: String,
}

impl BusinessTransport {
    pub fn from_config(config: &BusinessApiConfig, ctx: &ExtractorContext) -> FerryResult<Self> {
        let token = ctx.credentials.resolve(&config.api_token_env)?;
        let http = ProviderClient::new(
            "whatsapp business api",
            HttpAuth::Bearer(token),
            ctx.policy.clone(),
            ctx.request_timeout,
        )?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            phone_number_id: config.phone_number_id.clone(),
        })
    }
}

#[async_trait]
impl Transport for BusinessTransport {
    fn name(&self) -> &'static str {
        "business"
    }

    async fn authenticate(&self) -> FerryResult<()> {
        let url = format!("{}/{}", self.base_url, self.phone_number_id);
        self.http
            .get_json::<serde_json::Value>(&url, &[])
            .await
            .map(|_| ())
    }

    async fn fetch_page(
        &self,
        filter: &ExtractionFilter,
        cursor: Option<&str>,
    ) -> FerryResult<Page> {
        let url = format!("{}/{}/messages", self.base_url, self.phone_number_id);
        let mut query = vec![("limit", filter.batch_size.to_string())];
        if let Some(since) = filter.since {
            query.push(("since", since.timestamp().to_string()));
        }
        if let Some(after) = cursor {
            query.push(("after", after.to_string()));
        }

        let list: MessageList = self.http.get_json(&url, &query).await?;
        Ok(into_page(list))
    }

    async fn download(&self, attachment: &AttachmentRef) -> FerryResult<Vec<u8>> {
        let media_id = match &attachment.location {
            AttachmentLocation::ProviderMedia { media_id } => media_id,
            AttachmentLocation::Inline(bytes) => return Ok(bytes.clone()),
            AttachmentLocation::Remote { url } => return self.http.get_bytes(url).await,
        };
        // Media URLs are short-lived, so resolve right before downloading.
        let info: MediaInfo = self
            .http
            .get_json(&format!("{}/{}", self.base_url, media_id), &[])
            .await?;
        self.http.get_bytes(&info.url).await
    }
}

fn into_page(list: MessageList) -> Page {
    let next_cursor = list.paging.and_then(|paging| match paging.next {
        Some(_) => paging.cursors.and_then(|c| c.after),
        None => None,
    });
    let records = list
        .data
        .into_iter()
        .filter_map(|message| match to_record(message) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("skipping unreadable business api message: {}", e);
                None
            }
        })
        .collect();
    Page {
        records,
        next_cursor,
    }
}

fn to_record(message: GraphMessage) -> FerryResult<RawRecord> {
    let timestamp = parse_unix(&message.timestamp)?;
    let (message_type, media) = match message.kind.as_str() {
        "text" => (MessageType::Text, None),
        "image" | "sticker" => (MessageType::Image, message.image.or(message.sticker)),
        "audio" => (MessageType::Audio, message.audio),
        "video" => (MessageType::Video, message.video),
        "document" => (MessageType::Document, message.document),
        other => {
            tracing::debug!(id = %message.id, kind = other, "unsupported message type stored as text");
            (MessageType::Text, None)
        }
    };

    let mut record = RawRecord::new(message.id, timestamp, message.from, message_type);
    record.recipients = message.to.into_iter().collect();
    record.body_text = message.text.map(|t| t.body);

    if let Some(media) = media {
        if record.body_text.is_none() {
            record.body_text = media.caption.clone();
        }
        let content_type = media
            .mime_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let filename = media.filename.clone().unwrap_or_else(|| {
            format!(
                "{}_{}.{}",
                message_type,
                media.id,
                extension_for(&content_type)
            )
        });
        record = record.with_attachment(AttachmentRef {
            filename,
            content_type,
            size_bytes: None,
            location: AttachmentLocation::ProviderMedia { media_id: media.id },
        });
    }
    Ok(record)
}

fn parse_unix(raw: &str) -> FerryResult<DateTime<Utc>> {
    let seconds: i64 = raw
        .trim()
        .parse()
        .map_err(|_| FerryError::parse(format!("invalid unix timestamp '{}'", raw)))?;
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| FerryError::parse(format!("timestamp {} out of range", seconds)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"{
        "data": [
            {"id": "wamid.A", "from": "15551230000", "to": "15559990000",
             "timestamp": "1700000000", "type": "text", "text": {"body": "hello"}},
            {"id": "wamid.B", "from": "15551230000", "timestamp": "1700000060",
             "type": "image", "image": {"id": "m-1", "mime_type": "image/jpeg", "caption": "receipt"}},
            {"id": "wamid.C", "from": "15551230000", "timestamp": "1700000120",
             "type": "document", "document": {"id": "m-2", "mime_type": "application/pdf", "filename": "invoice.pdf"}},
            {"id": "wamid.D", "from": "15551230000", "timestamp": "yesterday", "type": "text", "text": {"body": "x"}}
        ],
        "paging": {"cursors": {"before": "QVFA", "after": "QVFI"}, "next": "https://graph.example/next"}
    }"#;

    #[test]
    fn test_page_parsing() {
        let list: MessageList = serde_json::from_str(PAGE).unwrap();
        let page = into_page(list);

        assert_eq!(page.next_cursor.as_deref(), Some("QVFI"));
        assert_eq!(page.records.len(), 3);

        let text = &page.records[0];
        assert_eq!(text.message_type, MessageType::Text);
        assert_eq!(text.body_text.as_deref(), Some("hello"));
        assert_eq!(text.recipients, vec!["15559990000".to_string()]);
        assert_eq!(text.timestamp.timestamp(), 1_700_000_000);

        let image = &page.records[1];
        assert_eq!(image.message_type, MessageType::Image);
        assert_eq!(image.body_text.as_deref(), Some("receipt"));
        assert_eq!(image.attachments[0].filename, "image_m-1.jpg");
        assert_eq!(
            image.attachments[0].location,
            AttachmentLocation::ProviderMedia {
                media_id: "m-1".to_string()
            }
        );

        assert_eq!(page.records[2].attachments[0].filename, "invoice.pdf");
    }

    #[test]
    fn test_last_page_has_no_cursor() {
        let list: MessageList = serde_json::from_str(
            r#"{"data": [], "paging": {"cursors": {"after": "QVFI"}}}"#,
        )
        .unwrap();
        assert_eq!(into_page(list).next_cursor, None);

        let list: MessageList = serde_json::from_str(r#"{"data": []}"#).unwrap();
        assert_eq!(into_page(list).next_cursor, None);
    }
}
