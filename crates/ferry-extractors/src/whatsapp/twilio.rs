//! Twilio Messages API transport.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use ferry_core::config::TwilioConfig;
use ferry_core::error::{FerryError, FerryResult};
use ferry_core::{
    AttachmentLocation, AttachmentRef, ExtractionFilter, ExtractorContext, MessageType, Page,
    RawRecord,
};
use secrecy::ExposeSecret;

use super::{extension_for, Transport};
use crate::http::{HttpAuth, ProviderClient};

const API_ROOT: &str = "https://api.twilio.com";
const CHANNEL_PREFIX: &str = "whatsapp:";

/// Basic-auth client for one Twilio account.
pub struct TwilioTransport {
    http: ProviderClient,
    api_root: String,
    account_url: String,
    whatsapp_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<TwilioMessage>,
    #[serde(default)]
    next_page_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TwilioMessage {
    sid: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    body: Option<String>,
    /// RFC 2822.
    #[serde(default)]
    date_sent: Option<String>,
    #[serde(default)]
    date_created: Option<String>,
    #[serde(default)]
    num_media: Option<String>,
    #[serde(default)]
    subresource_uris: Option<Subresources>,
}

#[derive(Debug, Deserialize)]
struct Subresources {
    #[serde(default)]
    media: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaList {
    #[serde(default)]
    media_list: Vec<TwilioMedia>,
}

#[derive(Debug, Deserialize)]
struct TwilioMedia {
    sid: String,
    content_type: String,
    /// JSON resource URI; the content lives at the same path without `.json`.
    uri: String,
}

impl TwilioTransport {
    pub fn from_config(config: &TwilioConfig, ctx: &ExtractorContext) -> FerryResult<Self> {
        let account_sid = ctx.credentials.resolve(&config.account_sid_env)?;
        let auth_token = ctx.credentials.resolve(&config.auth_token_env)?;
        let account_url = format!(
            "{}/2010-04-01/Accounts/{}",
            API_ROOT,
            account_sid.expose_secret()
        );
        let http = ProviderClient::new(
            "twilio",
            HttpAuth::Basic {
                username: account_sid,
                password: auth_token,
            },
            ctx.policy.clone(),
            ctx.request_timeout,
        )?;
        Ok(Self {
            http,
            api_root: API_ROOT.to_string(),
            account_url,
            whatsapp_number: config.whatsapp_number.clone(),
        })
    }

    async fn list_media(&self, media_uri: &str) -> FerryResult<Vec<AttachmentRef>> {
        let url = format!("{}{}", self.api_root, media_uri);
        let list: MediaList = self.http.get_json(&url, &[]).await?;
        Ok(list
            .media_list
            .into_iter()
            .map(|media| media_ref(&self.api_root, media))
            .collect())
    }
}

#[async_trait]
impl Transport for TwilioTransport {
    fn name(&self) -> &'static str {
        "twilio"
    }

    async fn authenticate(&self) -> FerryResult<()> {
        self.http
            .get_json::<serde_json::Value>(&format!("{}.json", self.account_url), &[])
            .await
            .map(|_| ())
    }

    async fn fetch_page(
        &self,
        filter: &ExtractionFilter,
        cursor: Option<&str>,
    ) -> FerryResult<Page> {
        let list: MessageList = match cursor {
            Some(next_page_uri) => {
                self.http
                    .get_json(&format!("{}{}", self.api_root, next_page_uri), &[])
                    .await?
            }
            None => {
                let mut query = vec![("PageSize", filter.batch_size.min(1000).to_string())];
                if let Some(since) = filter.since {
                    query.push(("DateSent>", since.format("%Y-%m-%d").to_string()));
                }
                if let Some(number) = &self.whatsapp_number {
                    query.push(("To", format!("{}{}", CHANNEL_PREFIX, number)));
                }
                self.http
                    .get_json(&format!("{}/Messages.json", self.account_url), &query)
                    .await?
            }
        };

        let mut records = Vec::with_capacity(list.messages.len());
        for message in list.messages {
            if !is_whatsapp(&message) {
                continue;
            }
            let media_uri = match (&message.num_media, &message.subresource_uris) {
                (Some(n), Some(sub)) if n.trim() != "0" => sub.media.clone(),
                _ => None,
            };
            let attachments = match media_uri {
                Some(uri) => self.list_media(&uri).await?,
                None => Vec::new(),
            };
            match to_record(message, attachments) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("skipping unreadable twilio message: {}", e),
            }
        }

        Ok(Page {
            records,
            next_cursor: list.next_page_uri.filter(|uri| !uri.is_empty()),
        })
    }

    async fn download(&self, attachment: &AttachmentRef) -> FerryResult<Vec<u8>> {
        match &attachment.location {
            AttachmentLocation::Remote { url } => self.http.get_bytes(url).await,
            AttachmentLocation::Inline(bytes) => Ok(bytes.clone()),
            AttachmentLocation::ProviderMedia { .. } => Err(FerryError::media(
                &attachment.filename,
                "twilio cannot resolve business api media ids",
            )),
        }
    }
}

fn is_whatsapp(message: &TwilioMessage) -> bool {
    message.from.starts_with(CHANNEL_PREFIX) || message.to.starts_with(CHANNEL_PREFIX)
}

fn strip_channel(address: &str) -> String {
    address
        .strip_prefix(CHANNEL_PREFIX)
        .unwrap_or(address)
        .to_string()
}

fn media_ref(api_root: &str, media: TwilioMedia) -> AttachmentRef {
    let path = media.uri.strip_suffix(".json").unwrap_or(&media.uri);
    AttachmentRef {
        filename: format!("{}.{}", media.sid, extension_for(&media.content_type)),
        content_type: media.content_type,
        size_bytes: None,
        location: AttachmentLocation::Remote {
            url: format!("{}{}", api_root, path),
        },
    }
}

fn to_record(message: TwilioMessage, attachments: Vec<AttachmentRef>) -> FerryResult<RawRecord> {
    let raw_date = message
        .date_sent
        .as_deref()
        .or(message.date_created.as_deref())
        .ok_or_else(|| FerryError::parse(format!("message {} has no date", message.sid)))?;
    let timestamp = DateTime::parse_from_rfc2822(raw_date)
        .map_err(|e| FerryError::parse(format!("invalid date '{}': {}", raw_date, e)))?
        .with_timezone(&Utc);

    let message_type = attachments
        .first()
        .map(|a| MessageType::from_content_type(&a.content_type))
        .unwrap_or(MessageType::Text);

    let mut record = RawRecord::new(
        message.sid,
        timestamp,
        strip_channel(&message.from),
        message_type,
    );
    record.recipients = vec![strip_channel(&message.to)];
    record.body_text = message.body.filter(|b| !b.is_empty());
    record.attachments = attachments;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"{
        "messages": [
            {"sid": "SM1", "from": "whatsapp:+15551230000", "to": "whatsapp:+14155238886",
             "body": "hi", "date_sent": "Tue, 14 Nov 2023 22:13:20 +0000", "num_media": "0",
             "subresource_uris": {"media": "/2010-04-01/Accounts/AC1/Messages/SM1/Media.json"}},
            {"sid": "SM2", "from": "+15551230000", "to": "+14155238886",
             "body": "sms", "date_sent": "Tue, 14 Nov 2023 22:14:20 +0000", "num_media": "0"}
        ],
        "next_page_uri": "/2010-04-01/Accounts/AC1/Messages.json?Page=1&PageToken=PASM1"
    }"#;

    #[test]
    fn test_message_parsing() {
        let list: MessageList = serde_json::from_str(PAGE).unwrap();
        assert_eq!(
            list.next_page_uri.as_deref(),
            Some("/2010-04-01/Accounts/AC1/Messages.json?Page=1&PageToken=PASM1")
        );

        let whatsapp: Vec<_> = list.messages.into_iter().filter(is_whatsapp).collect();
        assert_eq!(whatsapp.len(), 1);

        let record = to_record(whatsapp.into_iter().next().unwrap(), Vec::new()).unwrap();
        assert_eq!(record.id, "SM1");
        assert_eq!(record.sender, "+15551230000");
        assert_eq!(record.recipients, vec!["+14155238886".to_string()]);
        assert_eq!(record.message_type, MessageType::Text);
        assert_eq!(record.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_media_type_from_first_attachment() {
        let media: MediaList = serde_json::from_str(
            r#"{"media_list": [{"sid": "ME1", "content_type": "audio/ogg",
                "uri": "/2010-04-01/Accounts/AC1/Messages/SM3/Media/ME1.json"}]}"#,
        )
        .unwrap();
        let attachments: Vec<_> = media
            .media_list
            .into_iter()
            .map(|m| media_ref(API_ROOT, m))
            .collect();
        assert_eq!(attachments[0].filename, "ME1.ogg");
        assert_eq!(
            attachments[0].location,
            AttachmentLocation::Remote {
                url: "https://api.twilio.com/2010-04-01/Accounts/AC1/Messages/SM3/Media/ME1"
                    .to_string()
            }
        );

        let message: TwilioMessage = serde_json::from_str(
            r#"{"sid": "SM3", "from": "whatsapp:+1555", "to": "whatsapp:+1444",
                "date_created": "Tue, 14 Nov 2023 22:13:20 +0000", "num_media": "1", "body": ""}"#,
        )
        .unwrap();
        let record = to_record(message, attachments).unwrap();
        assert_eq!(record.message_type, MessageType::Audio);
        assert_eq!(record.body_text, None);
    }
}
