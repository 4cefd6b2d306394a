//! Adapter interfaces for external systems.
//!
//! Adapters provide a unified interface for the collaborators the pipeline
//! talks to: the language-model provider, the content source, the result
//! store and the event bus.

pub mod event_bus;
pub mod extractor;
pub mod mock;
pub mod persistence;
pub mod provider;

use async_trait::async_trait;

pub use event_bus::{BroadcastEventBus, EventBus, EventBusError};
pub use extractor::{
    ContentExtractor, DirectoryContentSource, ExtractedContent, ExtractionError,
    MemoryContentSource,
};
pub use mock::ScriptedProvider;
pub use persistence::{
    DigestRecord, FilePersistence, MemoryPersistence, PersistenceError, PersistenceGateway,
};
pub use provider::{CompletionRequest, OpenAiConfig, OpenAiProvider, ProviderError};

/// Trait for language-model providers
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Human-readable provider name
    fn name(&self) -> &str;

    /// Run one completion and return the raw text reply
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError>;

    /// Health check
    async fn health_check(&self) -> Result<(), ProviderError>;
}
