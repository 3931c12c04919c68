//! WhatsApp extraction over the Business API with Twilio as fallback.
//!
//! The transport is picked when the extractor is built. When the primary
//! transport is unreachable during authentication and a fallback exists, the
//! extractor switches to the fallback for the rest of the run.

mod business;
mod twilio;

pub use business::BusinessTransport;
pub use twilio::TwilioTransport;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

use ferry_core::config::{WhatsAppAccountConfig, WhatsAppProvider};
use ferry_core::error::{ErrorKind, FerryError, FerryResult};
use ferry_core::{
    AttachmentRef, ExtractionFilter, ExtractorContext, Page, SourceExtractor, SourceKind,
};

/// One way of talking to WhatsApp.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn authenticate(&self) -> FerryResult<()>;

    async fn fetch_page(&self, filter: &ExtractionFilter, cursor: Option<&str>)
        -> FerryResult<Page>;

    async fn download(&self, attachment: &AttachmentRef) -> FerryResult<Vec<u8>>;
}

/// [`SourceExtractor`] for one WhatsApp account.
pub struct WhatsAppExtractor {
    account: String,
    primary: Box<dyn Transport>,
    fallback: Option<Box<dyn Transport>>,
    on_fallback: AtomicBool,
}

impl WhatsAppExtractor {
    pub fn new(
        account: impl Into<String>,
        primary: Box<dyn Transport>,
        fallback: Option<Box<dyn Transport>>,
    ) -> Self {
        Self {
            account: account.into(),
            primary,
            fallback,
            on_fallback: AtomicBool::new(false),
        }
    }

    /// Build the transports `config` asks for.
    pub fn from_config(config: &WhatsAppAccountConfig, ctx: ExtractorContext) -> FerryResult<Self> {
        let business = || {
            config
                .business
                .as_ref()
                .map(|b| BusinessTransport::from_config(b, &ctx))
                .transpose()
        };
        let twilio = || {
            config
                .twilio
                .as_ref()
                .map(|t| TwilioTransport::from_config(t, &ctx))
                .transpose()
        };
        let missing = |what: &str| {
            FerryError::Configuration(format!(
                "whatsapp account '{}' uses provider {} but has no {} section",
                config.name, config.provider, what
            ))
        };

        let boxed = |t: Box<dyn Transport>| t;
        let (primary, fallback) = match config.provider {
            WhatsAppProvider::Business => {
                let b = business()?.ok_or_else(|| missing("business"))?;
                (boxed(Box::new(b)), None)
            }
            WhatsAppProvider::Twilio => {
                let t = twilio()?.ok_or_else(|| missing("twilio"))?;
                (boxed(Box::new(t)), None)
            }
            WhatsAppProvider::Auto => match (business()?, twilio()?) {
                (Some(b), t) => (boxed(Box::new(b)), t.map(|t| boxed(Box::new(t)))),
                (None, Some(t)) => (boxed(Box::new(t)), None),
                (None, None) => return Err(missing("business or twilio")),
            },
        };
        Ok(Self::new(&config.name, primary, fallback))
    }

    fn active(&self) -> &dyn Transport {
        match &self.fallback {
            Some(fallback) if self.on_fallback.load(Ordering::SeqCst) => fallback.as_ref(),
            _ => self.primary.as_ref(),
        }
    }

    /// Name of the transport currently in use.
    pub fn transport(&self) -> &'static str {
        self.active().name()
    }
}

/// Whether an error means the provider could not be reached, as opposed to
/// it refusing us.
fn is_unavailable(err: &FerryError) -> bool {
    matches!(err.kind(), ErrorKind::Network | ErrorKind::Timeout)
}

#[async_trait]
impl SourceExtractor for WhatsAppExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::WhatsApp
    }

    fn account(&self) -> &str {
        &self.account
    }

    async fn authenticate(&self) -> FerryResult<()> {
        let err = match self.primary.authenticate().await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        match &self.fallback {
            Some(fallback) if is_unavailable(&err) => {
                tracing::warn!(
                    account = %self.account,
                    primary = self.primary.name(),
                    fallback = fallback.name(),
                    "primary transport unavailable, switching to fallback: {}",
                    err
                );
                fallback.authenticate().await?;
                self.on_fallback.store(true, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(err),
        }
    }

    async fn fetch_page(
        &self,
        filter: &ExtractionFilter,
        cursor: Option<&str>,
    ) -> FerryResult<Page> {
        self.active().fetch_page(filter, cursor).await
    }

    async fn download_attachment(&self, attachment: &AttachmentRef) -> FerryResult<Vec<u8>> {
        self.active().download(attachment).await
    }
}

/// File extension for a media MIME type.
pub(crate) fn extension_for(content_type: &str) -> &'static str {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "audio/ogg" => "ogg",
        "audio/mpeg" => "mp3",
        "audio/mp4" | "audio/aac" => "m4a",
        "audio/amr" => "amr",
        "video/mp4" => "mp4",
        "video/3gpp" => "3gp",
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::MessageType;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct FakeTransport {
        name: &'static str,
        auth: fn() -> FerryResult<()>,
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn authenticate(&self) -> FerryResult<()> {
            (self.auth)()
        }

        async fn fetch_page(
            &self,
            _filter: &ExtractionFilter,
            _cursor: Option<&str>,
        ) -> FerryResult<Page> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(Page::last(vec![ferry_core::RawRecord::new(
                format!("{}-1", self.name),
                chrono::Utc::now(),
                "+15550100",
                MessageType::Text,
            )]))
        }

        async fn download(&self, _attachment: &AttachmentRef) -> FerryResult<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn fake(name: &'static str, auth: fn() -> FerryResult<()>) -> (Box<dyn Transport>, Arc<AtomicUsize>) {
        let fetches = Arc::new(AtomicUsize::new(0));
        (
            Box::new(FakeTransport {
                name,
                auth,
                fetches: Arc::clone(&fetches),
            }),
            fetches,
        )
    }

    #[tokio::test]
    async fn test_unreachable_primary_switches_to_fallback() {
        let (primary, primary_fetches) = fake("business", || Err(FerryError::network("dns")));
        let (fallback, fallback_fetches) = fake("twilio", || Ok(()));
        let extractor = WhatsAppExtractor::new("support", primary, Some(fallback));

        extractor.authenticate().await.unwrap();
        assert_eq!(extractor.transport(), "twilio");

        let page = extractor
            .fetch_page(&ExtractionFilter::default(), None)
            .await
            .unwrap();
        assert_eq!(page.records[0].id, "twilio-1");
        assert_eq!(primary_fetches.load(Ordering::SeqCst), 0);
        assert_eq!(fallback_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_credentials_do_not_fall_back() {
        let (primary, _) = fake("business", || Err(FerryError::authentication("bad token")));
        let (fallback, _) = fake("twilio", || Ok(()));
        let extractor = WhatsAppExtractor::new("support", primary, Some(fallback));

        let err = extractor.authenticate().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(extractor.transport(), "business");
    }

    #[tokio::test]
    async fn test_provider_refusal_does_not_fall_back() {
        let (primary, _) = fake("business", || {
            Err(FerryError::from_http_status(404, "phone number not found", None))
        });
        let (fallback, fallback_fetches) = fake("twilio", || Ok(()));
        let extractor = WhatsAppExtractor::new("support", primary, Some(fallback));

        let err = extractor.authenticate().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Provider);
        assert_eq!(extractor.transport(), "business");
        assert_eq!(fallback_fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unreachable_primary_without_fallback_fails() {
        let (primary, _) = fake("business", || Err(FerryError::Timeout("slow".to_string())));
        let extractor = WhatsAppExtractor::new("support", primary, None);
        assert!(extractor.authenticate().await.is_err());
    }

    #[test]
    fn test_extension_for() {
        assert_eq!(extension_for("image/jpeg"), "jpg");
        assert_eq!(extension_for("audio/ogg; codecs=opus"), "ogg");
        assert_eq!(extension_for("application/x-unknown"), "bin");
    }
}
