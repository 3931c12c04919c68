//! Normalized message records and the raw shapes extractors produce.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which provider family a source-account belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SourceKind {
    WhatsApp,
    Email,
}

/// Content type of a message.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Audio,
    Video,
    Document,
    Email,
}

impl MessageType {
    /// Classify WhatsApp media by its MIME type.
    pub fn from_content_type(content_type: &str) -> Self {
        let major = content_type
            .split('/')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match major.as_str() {
            "image" => Self::Image,
            "audio" => Self::Audio,
            "video" => Self::Video,
            _ => Self::Document,
        }
    }

    /// Whether this WhatsApp type carries a media payload.
    pub fn is_media(&self) -> bool {
        matches!(self, Self::Image | Self::Audio | Self::Video | Self::Document)
    }
}

/// A stored attachment of a persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Original filename as the provider reported it.
    pub filename: String,
    pub size_bytes: u64,
    pub content_type: String,
    /// Collision-free path the bytes were written to.
    pub local_path: PathBuf,
}

/// Normalized, source-agnostic message record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Provider-native identifier, unique within the source-account.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Phone number or email address.
    pub sender: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_html: Option<String>,
    pub message_type: MessageType,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_read: Option<bool>,
    pub source_kind: SourceKind,
    /// Configured account name that produced the record.
    pub source_account: String,
    pub extracted_at: DateTime<Utc>,
}

/// Where the bytes of an attachment can be obtained.
#[derive(Clone, PartialEq)]
pub enum AttachmentLocation {
    /// Plain URL, fetched with the extractor's credentials.
    Remote { url: String },
    /// Provider media handle whose download URL must be resolved first.
    ProviderMedia { media_id: String },
    /// Bytes already in hand (e.g. a MIME part).
    Inline(Vec<u8>),
}

impl std::fmt::Debug for AttachmentLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote { url } => f.debug_struct("Remote").field("url", url).finish(),
            Self::ProviderMedia { media_id } => f
                .debug_struct("ProviderMedia")
                .field("media_id", media_id)
                .finish(),
            Self::Inline(bytes) => write!(f, "Inline({} bytes)", bytes.len()),
        }
    }
}

/// Attachment as announced by a provider, before download.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentRef {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: Option<u64>,
    pub location: AttachmentLocation,
}

impl AttachmentRef {
    /// Attachment whose bytes are already available.
    pub fn inline(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            size_bytes: Some(bytes.len() as u64),
            location: AttachmentLocation::Inline(bytes),
        }
    }
}

/// A provider record before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub message_type: MessageType,
    pub folder: Option<String>,
    pub is_read: Option<bool>,
    pub attachments: Vec<AttachmentRef>,
}

impl RawRecord {
    /// Start a record with the required fields; optional ones default empty.
    pub fn new(
        id: impl Into<String>,
        timestamp: DateTime<Utc>,
        sender: impl Into<String>,
        message_type: MessageType,
    ) -> Self {
        Self {
            id: id.into(),
            timestamp,
            sender: sender.into(),
            recipients: Vec::new(),
            subject: None,
            body_text: None,
            body_html: None,
            message_type,
            folder: None,
            is_read: None,
            attachments: Vec::new(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.body_text = Some(text.into());
        self
    }

    pub fn with_attachment(mut self, attachment: AttachmentRef) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Normalize into a [`Message`], attaching the files that were stored.
    pub fn into_message(
        self,
        source_kind: SourceKind,
        source_account: &str,
        extracted_at: DateTime<Utc>,
        attachments: Vec<Attachment>,
    ) -> Message {
        Message {
            id: self.id,
            timestamp: self.timestamp,
            sender: self.sender,
            recipients: self.recipients,
            subject: self.subject,
            body_text: self.body_text,
            body_html: self.body_html,
            message_type: self.message_type,
            attachments,
            folder: self.folder,
            is_read: self.is_read,
            source_kind,
            source_account: source_account.to_string(),
            extracted_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_from_content_type() {
        assert_eq!(MessageType::from_content_type("image/jpeg"), MessageType::Image);
        assert_eq!(MessageType::from_content_type("audio/ogg; codecs=opus"), MessageType::Audio);
        assert_eq!(MessageType::from_content_type("video/mp4"), MessageType::Video);
        assert_eq!(MessageType::from_content_type("application/pdf"), MessageType::Document);
        assert!(!MessageType::Text.is_media());
    }

    #[test]
    fn test_message_serializes_lowercase_enums() {
        let msg = RawRecord::new("wamid.1", Utc::now(), "+15550001", MessageType::Text)
            .with_text("hi")
            .into_message(SourceKind::WhatsApp, "support", Utc::now(), Vec::new());
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["message_type"], "text");
        assert_eq!(json["source_kind"], "whatsapp");
        assert!(json.get("subject").is_none());
    }

    #[test]
    fn test_inline_debug_hides_bytes() {
        let att = AttachmentRef::inline("a.pdf", "application/pdf", vec![1, 2, 3]);
        assert_eq!(att.size_bytes, Some(3));
        assert!(format!("{:?}", att.location).contains("3 bytes"));
    }
}
