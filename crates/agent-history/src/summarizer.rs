//! Capability boundary towards the component that writes summaries.

use async_trait::async_trait;

use crate::memory::ConversationMessage;

/// Produces digest text and splits oversized text for storage.
///
/// Passed into [`crate::memory::ChatStorage::summarize_and_truncate`] per call;
/// stores never keep a reference to it.
#[async_trait]
pub trait SummaryCoordinator: Send + Sync {
    async fn generate_summary(&self, messages: &[ConversationMessage]) -> anyhow::Result<String>;

    /// Ordered chunks whose concatenation is `text`, each small enough for
    /// a single backend field.
    fn split_content(&self, text: &str) -> Vec<String>;
}
