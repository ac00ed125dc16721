//! Process-local chat storage.
//!
//! Conversations are grouped per session so the aggregate view and its
//! revalidation count only touch that session's agents.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::aggregate_cache::AggregateCache;
use crate::memory::{
    append_deduplicated, combine_summaries, merge_agent_conversations, remove_timestamps,
    trim_conversation, AgentMessage, ChatStorage, ConversationKey, ConversationMessage,
    MonotonicClock, OverflowSplit, SessionScope, TimestampedMessage,
};
use crate::summarizer::SummaryCoordinator;

#[derive(Debug, Clone)]
pub struct InMemoryStoreOptions {
    pub aggregate_cache_ttl: Duration,
    pub summary_threshold: usize,
}

impl Default for InMemoryStoreOptions {
    fn default() -> Self {
        Self {
            aggregate_cache_ttl: Duration::from_secs(5),
            summary_threshold: 20,
        }
    }
}

type AgentConversations = HashMap<String, Vec<TimestampedMessage>>;

pub struct InMemoryChatStorage {
    sessions: DashMap<SessionScope, AgentConversations>,
    summaries: DashMap<SessionScope, String>,
    aggregate_cache: AggregateCache,
    clock: MonotonicClock,
    options: InMemoryStoreOptions,
}

impl InMemoryChatStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: InMemoryStoreOptions) -> Self {
        Self {
            sessions: DashMap::new(),
            summaries: DashMap::new(),
            aggregate_cache: AggregateCache::new(options.aggregate_cache_ttl),
            clock: MonotonicClock::new(),
            options,
        }
    }

    fn append(
        &self,
        key: &ConversationKey,
        messages: Vec<ConversationMessage>,
        max_history_size: Option<usize>,
    ) -> Vec<ConversationMessage> {
        let scope = key.scope();
        let result = {
            let mut session = self.sessions.entry(scope.clone()).or_default();
            let conversation = session.entry(key.agent_id.clone()).or_default();
            if append_deduplicated(conversation, messages, &self.clock) == 0 {
                return remove_timestamps(conversation);
            }
            let trimmed = trim_conversation(std::mem::take(conversation), max_history_size);
            *conversation = trimmed;
            remove_timestamps(conversation)
        };
        self.aggregate_cache.invalidate(&scope);
        result
    }

    fn stored(&self, key: &ConversationKey) -> Vec<TimestampedMessage> {
        self.sessions
            .get(&key.scope())
            .and_then(|session| session.get(&key.agent_id).cloned())
            .unwrap_or_default()
    }

    fn total_count(&self, scope: &SessionScope) -> usize {
        self.sessions
            .get(scope)
            .map(|session| session.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    fn merged(&self, scope: &SessionScope) -> Vec<AgentMessage> {
        let snapshot: Vec<(Option<String>, Vec<TimestampedMessage>)> = self
            .sessions
            .get(scope)
            .map(|session| {
                session
                    .iter()
                    .map(|(agent_id, messages)| (Some(agent_id.clone()), messages.clone()))
                    .collect()
            })
            .unwrap_or_default();
        merge_agent_conversations(snapshot)
    }

    /// Drop each agent's overflowed messages from the front of its list.
    fn truncate_overflow(&self, scope: &SessionScope, split: &OverflowSplit) {
        let Some(mut session) = self.sessions.get_mut(scope) else {
            return;
        };
        for (agent_id, dropped) in split.dropped_per_agent() {
            let Some(agent_id) = agent_id else { continue };
            if let Some(conversation) = session.get_mut(&agent_id) {
                let dropped = dropped.min(conversation.len());
                conversation.drain(..dropped);
            }
        }
        session.retain(|_, conversation| !conversation.is_empty());
    }
}

impl Default for InMemoryChatStorage {
    fn default() -> Self {
        Self::with_options(InMemoryStoreOptions::default())
    }
}

#[async_trait]
impl ChatStorage for InMemoryChatStorage {
    async fn save_chat_message(
        &self,
        key: &ConversationKey,
        message: ConversationMessage,
        max_history_size: Option<usize>,
    ) -> anyhow::Result<Vec<ConversationMessage>> {
        key.validate()?;
        Ok(self.append(key, vec![message], max_history_size))
    }

    async fn save_chat_messages(
        &self,
        key: &ConversationKey,
        messages: Vec<ConversationMessage>,
        max_history_size: Option<usize>,
    ) -> anyhow::Result<Vec<ConversationMessage>> {
        key.validate()?;
        Ok(self.append(key, messages, max_history_size))
    }

    async fn fetch_chat(
        &self,
        key: &ConversationKey,
        max_history_size: Option<usize>,
    ) -> anyhow::Result<Vec<ConversationMessage>> {
        key.validate()?;
        let conversation = trim_conversation(self.stored(key), max_history_size);
        Ok(remove_timestamps(&conversation))
    }

    async fn fetch_chat_with_timestamps(
        &self,
        key: &ConversationKey,
    ) -> anyhow::Result<Vec<TimestampedMessage>> {
        key.validate()?;
        Ok(self.stored(key))
    }

    async fn fetch_all_chats(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> anyhow::Result<Vec<ConversationMessage>> {
        let scope = SessionScope::new(user_id, session_id);
        scope.validate()?;
        let total = self.total_count(&scope);
        if let Some(cached) = self.aggregate_cache.get(&scope, Some(total)) {
            return Ok(cached);
        }

        let loaded_at = self.aggregate_cache.generation();
        let merged = self.merged(&scope);
        let result: Vec<ConversationMessage> = merged.iter().map(AgentMessage::decorated).collect();
        debug!("Rebuilt aggregate for {} ({} messages)", scope, result.len());
        self.aggregate_cache.insert(scope, result.clone(), merged.len(), loaded_at);
        Ok(result)
    }

    async fn fetch_summary(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> anyhow::Result<Option<String>> {
        let scope = SessionScope::new(user_id, session_id);
        scope.validate()?;
        Ok(self.summaries.get(&scope).map(|summary| summary.clone()))
    }

    async fn summarize_and_truncate(
        &self,
        user_id: &str,
        session_id: &str,
        coordinator: &dyn SummaryCoordinator,
    ) -> anyhow::Result<()> {
        let scope = SessionScope::new(user_id, session_id);
        scope.validate()?;
        let merged = self.merged(&scope);
        let count = merged.len();
        let Some(split) = OverflowSplit::at_threshold(merged, self.options.summary_threshold) else {
            debug!("{} holds {} messages, nothing to summarize", scope, count);
            return Ok(());
        };

        info!("Summarizing {} of {} messages for {}", split.overflow.len(), count, scope);
        let new_summary = coordinator.generate_summary(&split.overflow_messages()).await?;
        let existing = self.fetch_summary(user_id, session_id).await?;
        self.summaries
            .insert(scope.clone(), combine_summaries(existing.as_deref(), &new_summary));

        self.truncate_overflow(&scope, &split);
        self.aggregate_cache.invalidate(&scope);
        Ok(())
    }
}
