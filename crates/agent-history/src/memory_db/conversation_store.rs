use crate::aggregate_cache::AggregateCache;
use crate::config::DurableStoreOptions;
use crate::memory::{
    append_deduplicated, combine_summaries, merge_agent_conversations, remove_timestamps,
    trim_conversation, AgentMessage, ChatStorage, ConversationKey, ConversationMessage,
    MonotonicClock, OverflowSplit, SessionScope, TimestampedMessage,
};
use crate::memory_db::schema::*;
use crate::memory_db::summary_store::SummaryStore;
use crate::memory_db::ItemTable;
use crate::summarizer::SummaryCoordinator;
use async_trait::async_trait;
use futures::future::try_join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Chat storage over a key-value [`ItemTable`]: one record per agent
/// conversation, plus summary records under the session key.
pub struct DurableChatStorage {
    table: Arc<dyn ItemTable>,
    summaries: SummaryStore,
    aggregate_cache: AggregateCache,
    clock: MonotonicClock,
    options: DurableStoreOptions,
}

impl DurableChatStorage {
    pub fn new(table: Arc<dyn ItemTable>, options: DurableStoreOptions) -> Self {
        let summaries = SummaryStore::new(
            Arc::clone(&table),
            options.layout,
            options.ttl.clone(),
            options.max_field_bytes,
        );
        Self {
            table,
            summaries,
            aggregate_cache: AggregateCache::new(options.aggregate_cache_ttl),
            clock: MonotonicClock::new(),
            options,
        }
    }

    pub fn options(&self) -> &DurableStoreOptions {
        &self.options
    }

    async fn put_conversation(&self, key: ItemKey, messages: &[TimestampedMessage]) -> anyhow::Result<()> {
        let item = encode_conversation(key, messages, &self.options.ttl)?;
        self.table.put_item(item).await.map_err(|e| {
            error!("Error saving conversation: {}", e);
            e.context("Failed to save conversation")
        })
    }

    /// Every conversation under the session, tagged with its agent and
    /// ordered by timestamp. Items that fail validation are skipped.
    async fn load_merged(&self, scope: &SessionScope) -> anyhow::Result<Vec<AgentMessage>> {
        let layout = self.options.layout;

        if !layout.per_agent_history {
            let key = layout.session_key(scope);
            let item = self.table.get_item(&key).await.map_err(|e| {
                error!("Error getting conversation for {}: {}", scope, e);
                e.context(format!("Failed to fetch conversation for {}", scope))
            })?;
            let messages = match item.as_ref().map(Record::decode) {
                None => Vec::new(),
                Some(Ok(Record::Conversation(messages))) => messages,
                Some(Ok(other)) => {
                    error!("Unexpected record at {}: {:?}", key.sort_key, other);
                    Vec::new()
                }
                Some(Err(e)) => {
                    error!("Unexpected item structure at {}: {}", key.sort_key, e);
                    Vec::new()
                }
            };
            return Ok(merge_agent_conversations(vec![(None, messages)]));
        }

        let prefix = layout.session_prefix(&scope.session_id);
        let items = self
            .table
            .query_prefix(&scope.user_id, &prefix)
            .await
            .map_err(|e| {
                error!("Error querying conversations for {}: {}", scope, e);
                e.context(format!("Failed to query conversations for {}", scope))
            })?;

        let mut conversations = Vec::with_capacity(items.len());
        for item in &items {
            let Some(agent_id) = layout.agent_id(&scope.session_id, &item.key.sort_key) else {
                continue;
            };
            match Record::decode(item) {
                Ok(Record::Conversation(messages)) => {
                    conversations.push((Some(agent_id.to_string()), messages));
                }
                Ok(_) => debug!("Skipping summary record {} in aggregate read", item.key.sort_key),
                Err(e) => error!("Unexpected item structure at {}: {}", item.key.sort_key, e),
            }
        }

        Ok(merge_agent_conversations(conversations))
    }

    /// Rewrite live history so only `split.keep` remains.
    async fn write_keep_window(&self, scope: &SessionScope, split: &OverflowSplit) -> anyhow::Result<()> {
        let layout = self.options.layout;

        let mut kept: HashMap<Option<String>, Vec<TimestampedMessage>> = HashMap::new();
        for entry in &split.keep {
            kept.entry(entry.agent_id.clone())
                .or_default()
                .push(entry.message.clone());
        }

        if !layout.per_agent_history {
            let messages = kept.remove(&None).unwrap_or_default();
            return self.put_conversation(layout.session_key(scope), &messages).await;
        }

        // Only agents that lost messages need a rewrite.
        let writes = split
            .dropped_per_agent()
            .into_keys()
            .flatten()
            .map(|agent_id| {
                let messages = kept.remove(&Some(agent_id.clone())).unwrap_or_default();
                let key = ConversationKey::new(&scope.user_id, &scope.session_id, agent_id);
                async move {
                    let item_key = layout.conversation_key(&key);
                    if messages.is_empty() {
                        self.table.delete_item(&item_key).await.map(|_| ())
                    } else {
                        self.put_conversation(item_key, &messages).await
                    }
                }
            })
            .collect::<Vec<_>>();

        try_join_all(writes).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatStorage for DurableChatStorage {
    async fn save_chat_message(
        &self,
        key: &ConversationKey,
        message: ConversationMessage,
        max_history_size: Option<usize>,
    ) -> anyhow::Result<Vec<ConversationMessage>> {
        self.save_chat_messages(key, vec![message], max_history_size).await
    }

    async fn save_chat_messages(
        &self,
        key: &ConversationKey,
        messages: Vec<ConversationMessage>,
        max_history_size: Option<usize>,
    ) -> anyhow::Result<Vec<ConversationMessage>> {
        key.validate()?;
        let mut conversation = self.fetch_chat_with_timestamps(key).await?;

        if append_deduplicated(&mut conversation, messages, &self.clock) == 0 {
            debug!("Nothing new to save for {}", key);
            return Ok(remove_timestamps(&conversation));
        }

        let trimmed = trim_conversation(conversation, max_history_size);
        let written = self
            .put_conversation(self.options.layout.conversation_key(key), &trimmed)
            .await;
        // A fill that overlapped the put may already hold the old state.
        self.aggregate_cache.invalidate(&key.scope());
        written?;

        debug!("Saved conversation {} ({} messages)", key, trimmed.len());
        Ok(remove_timestamps(&trimmed))
    }

    async fn fetch_chat(
        &self,
        key: &ConversationKey,
        max_history_size: Option<usize>,
    ) -> anyhow::Result<Vec<ConversationMessage>> {
        let conversation = self.fetch_chat_with_timestamps(key).await?;
        Ok(remove_timestamps(&trim_conversation(conversation, max_history_size)))
    }

    async fn fetch_chat_with_timestamps(
        &self,
        key: &ConversationKey,
    ) -> anyhow::Result<Vec<TimestampedMessage>> {
        key.validate()?;
        let item_key = self.options.layout.conversation_key(key);
        let item = self.table.get_item(&item_key).await.map_err(|e| {
            error!("Error getting conversation {}: {}", key, e);
            e.context(format!("Failed to fetch conversation {}", key))
        })?;

        match item.as_ref().map(Record::decode) {
            None => Ok(Vec::new()),
            Some(Ok(Record::Conversation(messages))) => Ok(messages),
            Some(Ok(other)) => Err(anyhow::anyhow!(
                "Expected conversation record at {}, found {:?}",
                item_key.sort_key,
                other
            )),
            Some(Err(e)) => {
                error!("Error decoding conversation {}: {}", key, e);
                Err(e)
            }
        }
    }

    async fn fetch_all_chats(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> anyhow::Result<Vec<ConversationMessage>> {
        let scope = SessionScope::new(user_id, session_id);
        scope.validate()?;
        if let Some(cached) = self.aggregate_cache.get(&scope, None) {
            return Ok(cached);
        }

        let loaded_at = self.aggregate_cache.generation();
        let merged = self.load_merged(&scope).await?;
        let result: Vec<ConversationMessage> = merged.iter().map(AgentMessage::decorated).collect();
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
        self.summaries.fetch_summary(&scope).await
    }

    async fn summarize_and_truncate(
        &self,
        user_id: &str,
        session_id: &str,
        coordinator: &dyn SummaryCoordinator,
    ) -> anyhow::Result<()> {
        let scope = SessionScope::new(user_id, session_id);
        scope.validate()?;
        let merged = self.load_merged(&scope).await?;
        let count = merged.len();
        let Some(split) = OverflowSplit::at_threshold(merged, self.options.summary_threshold) else {
            debug!("{} holds {} messages, nothing to summarize", scope, count);
            return Ok(());
        };

        info!("Summarizing {} of {} messages for {}", split.overflow.len(), count, scope);
        let new_summary = coordinator.generate_summary(&split.overflow_messages()).await?;
        let existing = self.summaries.fetch_summary(&scope).await?;
        let combined = combine_summaries(existing.as_deref(), &new_summary);

        // Each step is its own write; a failure part-way leaves earlier
        // steps in place.
        self.summaries.store_summary(&scope, &combined, coordinator).await?;
        let written = self.write_keep_window(&scope, &split).await;
        self.aggregate_cache.invalidate(&scope);
        written?;

        info!("{} now holds {} live messages", scope, split.keep.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::SqliteItemTable;
    use crate::utils::TextUtils;
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingCoordinator {
        summary: String,
        chunk_bytes: usize,
        seen: Mutex<Vec<Vec<ConversationMessage>>>,
    }

    impl RecordingCoordinator {
        fn new(summary: &str, chunk_bytes: usize) -> Self {
            Self { summary: summary.to_string(), chunk_bytes, seen: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl SummaryCoordinator for RecordingCoordinator {
        async fn generate_summary(&self, messages: &[ConversationMessage]) -> anyhow::Result<String> {
            self.seen.lock().unwrap().push(messages.to_vec());
            Ok(self.summary.clone())
        }

        fn split_content(&self, text: &str) -> Vec<String> {
            TextUtils::split_by_bytes(text, self.chunk_bytes)
        }
    }

    fn store_with(threshold: usize, max_field_bytes: usize) -> (Arc<SqliteItemTable>, DurableChatStorage) {
        let table = Arc::new(SqliteItemTable::new_in_memory().unwrap());
        let options = DurableStoreOptions {
            summary_threshold: threshold,
            max_field_bytes,
            ..Default::default()
        };
        (Arc::clone(&table), DurableChatStorage::new(table, options))
    }

    async fn exchange(store: &DurableChatStorage, agent: &str, turns: usize) {
        let key = ConversationKey::new("user", "session", agent);
        for i in 0..turns {
            store.save_chat_message(&key, ConversationMessage::user(format!("{agent} q{i}")), None).await.unwrap();
            store.save_chat_message(&key, ConversationMessage::assistant(format!("{agent} a{i}")), None).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_save_and_fetch_with_window() {
        let (_, store) = store_with(20, 1000);
        let key = ConversationKey::new("user", "session", "tech");
        for i in 0..4 {
            store.save_chat_message(&key, ConversationMessage::user(format!("q{i}")), Some(5)).await.unwrap();
            store.save_chat_message(&key, ConversationMessage::assistant(format!("a{i}")), Some(5)).await.unwrap();
        }

        let texts: Vec<String> = store.fetch_chat(&key, None).await.unwrap().iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["q2", "a2", "q3", "a3"]);
    }

    #[tokio::test]
    async fn test_duplicate_role_is_not_written() {
        let (_, store) = store_with(20, 1000);
        let key = ConversationKey::new("user", "session", "tech");
        store.save_chat_message(&key, ConversationMessage::user("one"), None).await.unwrap();
        let returned = store.save_chat_message(&key, ConversationMessage::user("two"), None).await.unwrap();
        assert_eq!(returned, vec![ConversationMessage::user("one")]);
        assert_eq!(store.fetch_chat(&key, None).await.unwrap(), returned);
    }

    #[tokio::test]
    async fn test_ttl_attribute_refreshed_on_write() {
        let table = Arc::new(SqliteItemTable::new_in_memory().unwrap().with_ttl_attribute("ttl"));
        let options = DurableStoreOptions {
            ttl: TtlPolicy { attribute: Some("ttl".into()), duration_seconds: 120 },
            ..Default::default()
        };
        let store = DurableChatStorage::new(table.clone(), options);
        let key = ConversationKey::new("user", "session", "tech");
        store.save_chat_message(&key, ConversationMessage::user("hi"), None).await.unwrap();

        let item = table.get_item(&ItemKey::new("user", "session#tech")).await.unwrap().unwrap();
        assert!(item.expires_at("ttl").unwrap() > chrono::Utc::now().timestamp());
    }

    #[tokio::test]
    async fn test_aggregate_skips_malformed_and_summary_items() {
        let (table, store) = store_with(20, 1000);
        exchange(&store, "tech", 1).await;
        table
            .put_item(StoredItem::new(ItemKey::new("user", "session#broken")).with_attribute(CONVERSATION_ATTR, json!(7)))
            .await
            .unwrap();
        table
            .put_item(encode_summary_chunk(ItemKey::new("user", "session#chunk_0"), 0, 1, "x".into(), &TtlPolicy::disabled()))
            .await
            .unwrap();

        let all = store.fetch_all_chats("user", "session").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].text(), "[tech] tech a0");
    }

    #[tokio::test]
    async fn test_summarize_is_noop_at_threshold() {
        let (table, store) = store_with(4, 10);
        exchange(&store, "tech", 3).await;
        store
            .summarize_and_truncate("user", "session", &RecordingCoordinator::new("first digest", 5))
            .await
            .unwrap();

        let key = ConversationKey::new("user", "session", "tech");
        let summary = store.fetch_summary("user", "session").await.unwrap();
        let stamped = store.fetch_chat_with_timestamps(&key).await.unwrap();
        let chunks = table.query_prefix("user", "session#chunk_").await.unwrap();
        assert_eq!(summary.as_deref(), Some(".first digest"));
        assert_eq!(chunks.len(), 3);

        let coordinator = RecordingCoordinator::new("digest", 5);
        store.summarize_and_truncate("user", "session", &coordinator).await.unwrap();

        assert!(coordinator.seen.lock().unwrap().is_empty());
        assert_eq!(store.fetch_summary("user", "session").await.unwrap(), summary);
        assert_eq!(store.fetch_chat_with_timestamps(&key).await.unwrap(), stamped);
        assert_eq!(table.query_prefix("user", "session#chunk_").await.unwrap(), chunks);
    }

    #[tokio::test]
    async fn test_summarize_keeps_threshold_and_appends() {
        let (_, store) = store_with(4, 1000);
        exchange(&store, "tech", 2).await;
        exchange(&store, "billing", 2).await;
        let coordinator = RecordingCoordinator::new("second", 100);

        store.summarize_and_truncate("user", "session", &RecordingCoordinator::new("first", 100)).await.unwrap();
        let live = store.fetch_all_chats("user", "session").await.unwrap();
        let texts: Vec<String> = live.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["billing q0", "[billing] billing a0", "billing q1", "[billing] billing a1"]);
        assert_eq!(store.fetch_summary("user", "session").await.unwrap().as_deref(), Some(".first"));
        assert!(store.fetch_chat(&ConversationKey::new("user", "session", "tech"), None).await.unwrap().is_empty());

        exchange(&store, "tech", 1).await;
        store.summarize_and_truncate("user", "session", &coordinator).await.unwrap();
        assert_eq!(store.fetch_summary("user", "session").await.unwrap().as_deref(), Some(".first.second"));
        assert_eq!(store.fetch_all_chats("user", "session").await.unwrap().len(), 4);

        let seen = coordinator.seen.lock().unwrap();
        assert_eq!(seen[0].len(), 2);
        assert_eq!(seen[0][0].text(), "billing q0");
    }

    #[tokio::test]
    async fn test_large_summary_is_chunked_and_reassembled() {
        let (table, store) = store_with(2, 64);
        exchange(&store, "tech", 3).await;
        let long = "lorem ipsum dolor sit amet ".repeat(20);
        let coordinator = RecordingCoordinator::new(&long, 50);

        store.summarize_and_truncate("user", "session", &coordinator).await.unwrap();

        let expected = format!(".{}", long);
        assert_eq!(store.fetch_summary("user", "session").await.unwrap(), Some(expected.clone()));

        let metadata = table.get_item(&ItemKey::new("user", "session")).await.unwrap().unwrap();
        let chunk_count = expected.len().div_ceil(50);
        assert_eq!(metadata.attributes[IS_CHUNKED_ATTR], json!(true));
        assert_eq!(metadata.attributes[CHUNK_COUNT_ATTR], json!(chunk_count));
        assert_eq!(table.query_prefix("user", "session#chunk_").await.unwrap().len(), chunk_count);
    }

    #[tokio::test]
    async fn test_rechunking_removes_stale_chunks() {
        let (table, store) = store_with(2, 64);
        table
            .put_item(encode_summary_chunk(ItemKey::new("user", "session#chunk_99"), 99, 100, "stale".into(), &TtlPolicy::disabled()))
            .await
            .unwrap();
        exchange(&store, "tech", 2).await;
        let coordinator = RecordingCoordinator::new(&"z".repeat(100), 60);

        store.summarize_and_truncate("user", "session", &coordinator).await.unwrap();
        assert!(table.get_item(&ItemKey::new("user", "session#chunk_99")).await.unwrap().is_none());
        assert_eq!(store.fetch_summary("user", "session").await.unwrap().unwrap().len(), 101);
    }

    #[tokio::test]
    async fn test_missing_chunk_is_tolerated() {
        let (table, store) = store_with(2, 10);
        exchange(&store, "tech", 2).await;
        let coordinator = RecordingCoordinator::new("abcdefghijklmnopqrstuvwxyz", 10);
        store.summarize_and_truncate("user", "session", &coordinator).await.unwrap();

        table.delete_item(&ItemKey::new("user", "session#chunk_1")).await.unwrap();
        let summary = store.fetch_summary("user", "session").await.unwrap().unwrap();
        assert_eq!(summary, ".abcdefghituvwxyz");
    }

    #[tokio::test]
    async fn test_shared_history_layout() {
        let table = Arc::new(SqliteItemTable::new_in_memory().unwrap());
        let options = DurableStoreOptions {
            summary_threshold: 2,
            layout: KeyLayout { per_agent_history: false },
            ..Default::default()
        };
        let store = DurableChatStorage::new(table.clone(), options);
        exchange(&store, "tech", 2).await;

        let all = store.fetch_all_chats("user", "session").await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[1].text(), "tech a0");

        store
            .summarize_and_truncate("user", "session", &RecordingCoordinator::new("digest", 100))
            .await
            .unwrap();
        assert_eq!(store.fetch_all_chats("user", "session").await.unwrap().len(), 2);
        assert_eq!(store.fetch_summary("user", "session").await.unwrap().as_deref(), Some(".digest"));
        assert!(table.get_item(&ItemKey::new("user", "session#summary")).await.unwrap().is_some());
    }
}
