//! Short-lived read cache for merged session views.

use moka::sync::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::memory::{ConversationMessage, SessionScope};

#[derive(Debug, Clone)]
struct CachedAggregate {
    messages: Vec<ConversationMessage>,
    total_count: usize,
}

/// Fills race with writes: a reader snapshots [`AggregateCache::generation`]
/// before loading and hands it to [`AggregateCache::insert`], which drops
/// the entry again if any invalidation happened in between.
pub struct AggregateCache {
    entries: Cache<SessionScope, CachedAggregate>,
    generation: AtomicU64,
}

impl AggregateCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Cached aggregate for `scope`. When `current_total` is given, an entry
    /// built from a different number of stored messages counts as a miss.
    pub fn get(
        &self,
        scope: &SessionScope,
        current_total: Option<usize>,
    ) -> Option<Vec<ConversationMessage>> {
        let cached = self.entries.get(scope)?;
        match current_total {
            Some(total) if total != cached.total_count => {
                debug!(
                    "Aggregate cache for {} is stale ({} cached, {} stored)",
                    scope, cached.total_count, total
                );
                self.entries.invalidate(scope);
                None
            }
            _ => {
                debug!("Aggregate cache hit for {}", scope);
                Some(cached.messages)
            }
        }
    }

    /// Cache an aggregate loaded after `loaded_at` was read from
    /// [`AggregateCache::generation`].
    pub fn insert(
        &self,
        scope: SessionScope,
        messages: Vec<ConversationMessage>,
        total_count: usize,
        loaded_at: u64,
    ) {
        self.entries.insert(
            scope.clone(),
            CachedAggregate {
                messages,
                total_count,
            },
        );
        if self.generation() != loaded_at {
            debug!("Write landed while loading {}, not caching", scope);
            self.entries.invalidate(&scope);
        }
    }

    pub fn invalidate(&self, scope: &SessionScope) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.invalidate(scope);
    }
}
