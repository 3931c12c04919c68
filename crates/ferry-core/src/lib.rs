//! ferry-core - Core library for ferry.
//!
//! This crate provides the record types, configuration, deduplication,
//! storage and orchestration for the ferry extraction pipeline. Provider
//! implementations live in `ferry-extractors` and plug in through
//! [`ExtractorFactory`].
//!
//! # Example
//!
//! ```ignore
//! use ferry_core::{CredentialStore, Orchestrator, PipelineConfig};
//!
//! let config = PipelineConfig::from_file("ferry.yaml")?;
//! let orchestrator = Orchestrator::new(factory, CredentialStore::from_env());
//!
//! let report = orchestrator.run(&config).await?;
//! println!("{} messages", report.total_messages());
//! ```

pub mod config;
pub mod credentials;
pub mod dedup;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod storage;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use config::{AccountConfig, PipelineConfig, ValidationError};
pub use credentials::CredentialStore;
pub use dedup::DedupIndex;
pub use error::{ErrorCode, ErrorKind, FerryError, FerryResult};
pub use notify::{NotificationDispatcher, NotificationSink, RunSummary, SourceAlert};
pub use orchestrator::Orchestrator;
pub use retry::{BackoffPolicy, RateLimiter, RequestPolicy};
pub use runner::{SourceProgress, SourceRunner};
pub use scheduler::{OverlapGuard, PipelineRun, PipelineScheduler, ScheduledRun, Trigger};
pub use storage::StorageManager;
pub use traits::{ExtractionFilter, ExtractorContext, ExtractorFactory, Page, SourceExtractor};
pub use types::{
    Attachment, AttachmentLocation, AttachmentRef, ErrorDescriptor, ExtractionResult, Message,
    MessageType, OutputPaths, RawRecord, RunReport, SourceKind,
};
