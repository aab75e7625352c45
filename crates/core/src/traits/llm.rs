//! Streaming language-model capability

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::conversation::ChatMessage;
use crate::error::Result;

/// Lazy token stream. Dropping the stream cancels the generation; tokens
/// already yielded remain part of the record.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Language-model vendor capability
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Stream tokens for a reply. `system` travels out-of-band from the
    /// history; `history` is the sliding window including the current user
    /// message as its last element.
    fn generate_stream(&self, system: &str, history: &[ChatMessage]) -> TokenStream;

    /// Non-streaming fallback
    async fn generate(&self, system: &str, history: &[ChatMessage]) -> Result<String>;
}
