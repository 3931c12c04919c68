//! Extractor factories handed to the orchestrator.

use std::sync::Arc;

use ferry_core::config::AccountConfig;
use ferry_core::error::FerryResult;
use ferry_core::{ExtractorContext, ExtractorFactory, SourceExtractor};

use crate::email::EmailExtractor;
use crate::mock::{MockEmailSource, MockWhatsAppSource};
use crate::whatsapp::WhatsAppExtractor;

/// Builds extractors that talk to the real providers.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveExtractorFactory;

impl ExtractorFactory for LiveExtractorFactory {
    fn create(
        &self,
        account: &AccountConfig<'_>,
        ctx: ExtractorContext,
    ) -> FerryResult<Box<dyn SourceExtractor>> {
        Ok(match account {
            AccountConfig::WhatsApp(config) => Box::new(WhatsAppExtractor::from_config(config, ctx)?),
            AccountConfig::Email(config) => Box::new(EmailExtractor::from_config(config, ctx)?),
        })
    }
}

/// Builds synthetic sources. No credentials are resolved.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockExtractorFactory;

impl ExtractorFactory for MockExtractorFactory {
    fn create(
        &self,
        account: &AccountConfig<'_>,
        _ctx: ExtractorContext,
    ) -> FerryResult<Box<dyn SourceExtractor>> {
        tracing::info!(account = account.name(), kind = %account.kind(), "using mock source");
        Ok(match account {
            AccountConfig::WhatsApp(config) => Box::new(MockWhatsAppSource::new(&config.name)),
            AccountConfig::Email(config) => Box::new(MockEmailSource::new(&config.name)),
        })
    }
}

/// Factory for `mock_mode`.
pub fn factory_for(mock_mode: bool) -> Arc<dyn ExtractorFactory> {
    if mock_mode {
        Arc::new(MockExtractorFactory)
    } else {
        Arc::new(LiveExtractorFactory)
    }
}
