//! ferry-extractors - Provider extractors for the ferry pipeline.
//!
//! Each extractor implements [`ferry_core::SourceExtractor`] for one
//! configured account:
//!
//! - [`WhatsAppExtractor`] - WhatsApp Business API, falling back to Twilio
//! - [`EmailExtractor`] - IMAP over TLS with app password or OAuth2
//! - [`MockWhatsAppSource`] / [`MockEmailSource`] - synthetic data for smoke runs
//!
//! # Example
//!
//! ```ignore
//! use ferry_core::{CredentialStore, Orchestrator, PipelineConfig};
//! use ferry_extractors::factory_for;
//!
//! let config = PipelineConfig::from_file("ferry.yaml")?;
//! let orchestrator = Orchestrator::new(factory_for(false), CredentialStore::from_env());
//! let report = orchestrator.run(&config).await?;
//! ```

mod factory;
mod http;
mod mock;

pub mod email;
pub mod whatsapp;

pub use email::EmailExtractor;
pub use factory::{factory_for, LiveExtractorFactory, MockExtractorFactory};
pub use mock::{MockEmailSource, MockWhatsAppSource};
pub use whatsapp::{BusinessTransport, Transport, TwilioTransport, WhatsAppExtractor};
