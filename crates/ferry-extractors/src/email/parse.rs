//! RFC 5322 message to [`RawRecord`].

use chrono::{DateTime, TimeZone, Utc};
use mail_parser::{Address, MessageParser, MimeHeaders, PartType};

use ferry_core::error::{ErrorCode, FerryError, FerryResult};
use ferry_core::{AttachmentRef, MessageType, RawRecord};

/// Where a fetched message came from.
#[derive(Debug, Clone, Copy)]
pub struct MailboxPosition<'a> {
    pub folder: &'a str,
    pub uid: u32,
    pub seen: bool,
    /// Server receive time, used when the `Date` header is missing or broken.
    pub internal_date: Option<DateTime<Utc>>,
}

/// Parse a raw message. Attachments carry their bytes inline.
pub fn parse_message(raw: &[u8], position: MailboxPosition<'_>) -> FerryResult<RawRecord> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| FerryError::Parse {
            message: format!("uid {} in {} is not a MIME message", position.uid, position.folder),
            code: ErrorCode::ParseInvalidMime,
        })?;

    let id = message
        .message_id()
        .map(|id| id.trim().trim_start_matches('<').trim_end_matches('>').to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("{}:{}", position.folder, position.uid));

    let timestamp = match message
        .date()
        .and_then(|d| Utc.timestamp_opt(d.to_timestamp(), 0).single())
        .or(position.internal_date)
    {
        Some(timestamp) => timestamp,
        None => {
            tracing::warn!(
                folder = position.folder,
                uid = position.uid,
                "message has no usable date, stamping with the current time"
            );
            Utc::now()
        }
    };

    let sender = message
        .from()
        .and_then(|from| from.first())
        .and_then(|addr| addr.address())
        .unwrap_or_default()
        .to_string();

    let mut recipients = addresses(message.to());
    recipients.extend(addresses(message.cc()));

    let attachments = message
        .attachments()
        .enumerate()
        .map(|(i, part)| {
            let content_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let filename = part
                .attachment_name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("attachment_{}", i + 1));
            AttachmentRef::inline(filename, content_type, part.contents().to_vec())
        })
        .collect();

    let mut record = RawRecord::new(id, timestamp, sender, MessageType::Email);
    record.recipients = recipients;
    record.subject = message.subject().map(str::to_string);
    record.body_text = message.body_text(0).map(|b| b.into_owned());
    // body_html() renders plain text as HTML when there is no HTML part.
    let has_html = message
        .html_part(0)
        .is_some_and(|part| matches!(part.body, PartType::Html(_)));
    if has_html {
        record.body_html = message.body_html(0).map(|b| b.into_owned());
    }
    record.folder = Some(position.folder.to_string());
    record.is_read = Some(position.seen);
    record.attachments = attachments;
    Ok(record)
}

fn addresses(field: Option<&Address<'_>>) -> Vec<String> {
    field
        .map(|list| {
            list.iter()
                .filter_map(|addr| addr.address())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
