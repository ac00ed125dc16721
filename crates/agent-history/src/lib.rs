// agent-history/crates/agent-history/src/lib.rs

pub mod aggregate_cache;
pub mod config;
pub mod in_memory;
pub mod memory;
pub mod memory_db;
pub mod summarizer;
pub mod telemetry;
pub mod utils;

// Public API exports
pub use config::{Config, DurableStoreOptions};
pub use in_memory::{InMemoryChatStorage, InMemoryStoreOptions};
pub use memory::{
    ChatStorage, ContentBlock, ConversationKey, ConversationMessage, ParticipantRole,
    SessionScope, TimestampedMessage, TokenUsage,
};
pub use memory_db::{DurableChatStorage, ItemKey, ItemTable, SqliteItemTable, StoredItem};
pub use summarizer::SummaryCoordinator;
