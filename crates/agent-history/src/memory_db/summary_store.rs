//! Summary storage and retrieval, chunking summaries that outgrow one field
use crate::memory::SessionScope;
use crate::memory_db::schema::*;
use crate::memory_db::ItemTable;
use crate::summarizer::SummaryCoordinator;
use anyhow::Context;
use futures::future::{join_all, try_join_all};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct SummaryStore {
    table: Arc<dyn ItemTable>,
    layout: KeyLayout,
    ttl: TtlPolicy,
    max_field_bytes: usize,
}

impl SummaryStore {
    pub fn new(table: Arc<dyn ItemTable>, layout: KeyLayout, ttl: TtlPolicy, max_field_bytes: usize) -> Self {
        Self { table, layout, ttl, max_field_bytes }
    }

    /// The stored summary, reassembled from chunks when needed.
    pub async fn fetch_summary(&self, scope: &SessionScope) -> anyhow::Result<Option<String>> {
        let key = self.layout.summary_key(scope);
        let item = self.table.get_item(&key).await.map_err(|e| {
            error!("Error getting summary for {}: {}", scope, e);
            e.context(format!("Failed to fetch summary for {}", scope))
        })?;
        let Some(item) = item else {
            return Ok(None);
        };

        match Record::decode(&item)? {
            Record::Summary(summary) if !summary.is_chunked => Ok(Some(summary.text)),
            Record::Summary(summary) => Ok(Some(self.fetch_chunks(scope, summary.chunk_count).await)),
            other => Err(anyhow::anyhow!(
                "Expected summary record at {}, found {:?}",
                key.sort_key,
                other
            )),
        }
    }

    /// Fetch every chunk up to `chunk_count` concurrently. Missing or
    /// unreadable chunks are logged and left out.
    async fn fetch_chunks(&self, scope: &SessionScope, chunk_count: usize) -> String {
        let keys: Vec<ItemKey> = (0..chunk_count).map(|i| self.layout.chunk_key(scope, i)).collect();
        let results = join_all(keys.iter().map(|key| self.table.get_item(key))).await;

        let mut chunks: Vec<SummaryChunkRecord> = Vec::with_capacity(chunk_count);
        for (key, result) in keys.iter().zip(results) {
            match result.and_then(|item| item.map(|item| Record::decode(&item)).transpose()) {
                Ok(Some(Record::SummaryChunk(chunk))) => chunks.push(chunk),
                Ok(Some(other)) => warn!("Ignoring non-chunk record at {}: {:?}", key.sort_key, other),
                Ok(None) => warn!("Summary chunk {} is missing", key.sort_key),
                Err(e) => warn!("Failed to read summary chunk {}: {}", key.sort_key, e),
            }
        }

        if chunks.len() < chunk_count {
            warn!(
                "Recovered {} of {} summary chunks for {}",
                chunks.len(),
                chunk_count,
                scope
            );
        }
        chunks.sort_by_key(|chunk| chunk.chunk_index);
        chunks.into_iter().map(|chunk| chunk.text).collect()
    }

    /// Replace the session summary with `text`, chunking through the
    /// coordinator when it exceeds the field ceiling.
    pub async fn store_summary(
        &self,
        scope: &SessionScope,
        text: &str,
        coordinator: &dyn SummaryCoordinator,
    ) -> anyhow::Result<()> {
        let key = self.layout.summary_key(scope);

        if text.len() <= self.max_field_bytes {
            debug!("Storing {} byte summary for {} in one record", text.len(), scope);
            return self
                .table
                .put_item(encode_summary(key, text, &self.ttl))
                .await
                .map_err(|e| {
                    error!("Error saving summary for {}: {}", scope, e);
                    e.context(format!("Failed to save summary for {}", scope))
                });
        }

        self.delete_chunks(scope).await;

        let chunks = coordinator.split_content(text);
        let chunk_count = chunks.len();
        info!(
            "Summary for {} is {} bytes, storing as {} chunks",
            scope,
            text.len(),
            chunk_count
        );

        let writes = chunks.into_iter().enumerate().map(|(index, chunk)| {
            if chunk.len() > self.max_field_bytes {
                warn!(
                    "Chunk {} for {} is {} bytes, above the {} byte ceiling",
                    index,
                    scope,
                    chunk.len(),
                    self.max_field_bytes
                );
            }
            let item = encode_summary_chunk(
                self.layout.chunk_key(scope, index),
                index,
                chunk_count,
                chunk,
                &self.ttl,
            );
            self.table.put_item(item)
        });
        try_join_all(writes).await.map_err(|e| {
            error!("Error saving summary chunks for {}: {}", scope, e);
            e.context(format!("Failed to save summary chunks for {}", scope))
        })?;

        self.table
            .put_item(encode_summary_metadata(key, chunk_count, &self.ttl))
            .await
            .with_context(|| format!("Failed to save summary metadata for {}", scope))
    }

    /// Best-effort removal of every chunk record under the session. Items
    /// under the chunk prefix that are not chunks stay.
    async fn delete_chunks(&self, scope: &SessionScope) {
        let prefix = self.layout.chunk_prefix(scope);
        let listed = match self.table.query_prefix(&scope.user_id, &prefix).await {
            Ok(items) => items,
            Err(e) => {
                error!("Failed to list old summary chunks for {}: {}", scope, e);
                return;
            }
        };
        let existing: Vec<StoredItem> = listed
            .into_iter()
            .filter(|item| match Record::decode(item) {
                Ok(Record::SummaryChunk(_)) => true,
                _ => {
                    warn!("Leaving non-chunk item {} in place", item.key.sort_key);
                    false
                }
            })
            .collect();
        if existing.is_empty() {
            return;
        }

        debug!("Deleting {} old summary chunks for {}", existing.len(), scope);
        let results = join_all(existing.iter().map(|item| self.table.delete_item(&item.key))).await;
        for (item, result) in existing.iter().zip(results) {
            if let Err(e) = result {
                error!("Failed to delete summary chunk {}: {}", item.key.sort_key, e);
            }
        }
    }
}
