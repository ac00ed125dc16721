//! Item shapes for the durable table and their typed record views
use anyhow::{anyhow, Context};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::memory::{
    ContentBlock, ConversationKey, ConversationMessage, ParticipantRole, SessionScope,
    TimestampedMessage, TokenUsage, KEY_SEPARATOR, RESERVED_AGENT_PREFIX,
};

pub const CONVERSATION_ATTR: &str = "conversation";
pub const IS_CHUNKED_ATTR: &str = "isChunked";
pub const CHUNK_COUNT_ATTR: &str = "chunkCount";
pub const CHUNK_INDEX_ATTR: &str = "chunkIndex";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub partition_key: String,
    pub sort_key: String,
}

impl ItemKey {
    pub fn new(partition_key: impl Into<String>, sort_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            sort_key: sort_key.into(),
        }
    }
}

/// A schemaless row: a key plus whatever attributes the writer chose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredItem {
    pub key: ItemKey,
    pub attributes: Map<String, Value>,
}

impl StoredItem {
    pub fn new(key: ItemKey) -> Self {
        Self {
            key,
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    /// Epoch-second expiry held under `ttl_attribute`, if any.
    pub fn expires_at(&self, ttl_attribute: &str) -> Option<i64> {
        self.attributes.get(ttl_attribute).and_then(Value::as_i64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Conversation(Vec<TimestampedMessage>),
    Summary(SummaryRecord),
    SummaryChunk(SummaryChunkRecord),
}

/// Summary metadata, or the whole summary when `is_chunked` is false.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRecord {
    pub text: String,
    pub is_chunked: bool,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryChunkRecord {
    pub chunk_index: usize,
    pub chunk_count: usize,
    pub text: String,
}

impl Record {
    /// Validate an item against the known record shapes.
    pub fn decode(item: &StoredItem) -> anyhow::Result<Self> {
        match item.attributes.get(CONVERSATION_ATTR) {
            Some(Value::Array(entries)) => {
                let messages = entries
                    .iter()
                    .map(decode_message)
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Ok(Record::Conversation(messages))
            }
            Some(Value::String(text)) => {
                let chunk_count = usize_attr(item, CHUNK_COUNT_ATTR)?.unwrap_or(0);
                match usize_attr(item, CHUNK_INDEX_ATTR)? {
                    Some(chunk_index) => Ok(Record::SummaryChunk(SummaryChunkRecord {
                        chunk_index,
                        chunk_count,
                        text: text.clone(),
                    })),
                    None => Ok(Record::Summary(SummaryRecord {
                        text: text.clone(),
                        is_chunked: item
                            .attributes
                            .get(IS_CHUNKED_ATTR)
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                        chunk_count,
                    })),
                }
            }
            Some(other) => Err(anyhow!(
                "Unexpected {} value in {}: {}",
                CONVERSATION_ATTR,
                item.key.sort_key,
                other
            )),
            None => Err(anyhow!("Item {} has no {} attribute", item.key.sort_key, CONVERSATION_ATTR)),
        }
    }
}

fn usize_attr(item: &StoredItem, name: &str) -> anyhow::Result<Option<usize>> {
    match item.attributes.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| anyhow!("Attribute {} of {} is not a count: {}", name, item.key.sort_key, value)),
    }
}

/// Messages written by older writers may carry plain-string content.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawContent {
    Blocks(Vec<ContentBlock>),
    Text(String),
}

#[derive(Deserialize)]
struct RawMessage {
    role: ParticipantRole,
    content: RawContent,
    #[serde(default)]
    usage: Option<TokenUsage>,
    timestamp: i64,
}

fn decode_message(value: &Value) -> anyhow::Result<TimestampedMessage> {
    let raw: RawMessage =
        serde_json::from_value(value.clone()).context("Malformed stored message")?;
    let content = match raw.content {
        RawContent::Blocks(blocks) => blocks,
        RawContent::Text(text) => vec![ContentBlock::new(text)],
    };
    Ok(TimestampedMessage {
        message: ConversationMessage {
            role: raw.role,
            content,
            usage: raw.usage,
        },
        timestamp: raw.timestamp,
    })
}

/// Expiry stamping for written items.
#[derive(Debug, Clone, Default)]
pub struct TtlPolicy {
    pub attribute: Option<String>,
    pub duration_seconds: i64,
}

impl TtlPolicy {
    pub fn disabled() -> Self {
        Self::default()
    }

    fn apply(&self, item: StoredItem) -> StoredItem {
        match &self.attribute {
            Some(attribute) => {
                let expires_at = Utc::now().timestamp() + self.duration_seconds;
                item.with_attribute(attribute, expires_at)
            }
            None => item,
        }
    }
}

pub fn encode_conversation(
    key: ItemKey,
    messages: &[TimestampedMessage],
    ttl: &TtlPolicy,
) -> anyhow::Result<StoredItem> {
    let conversation = serde_json::to_value(messages).context("Failed to encode conversation")?;
    Ok(ttl.apply(StoredItem::new(key).with_attribute(CONVERSATION_ATTR, conversation)))
}

pub fn encode_summary(key: ItemKey, text: &str, ttl: &TtlPolicy) -> StoredItem {
    ttl.apply(
        StoredItem::new(key)
            .with_attribute(CONVERSATION_ATTR, text)
            .with_attribute(IS_CHUNKED_ATTR, false)
            .with_attribute(CHUNK_COUNT_ATTR, 0),
    )
}

pub fn encode_summary_metadata(key: ItemKey, chunk_count: usize, ttl: &TtlPolicy) -> StoredItem {
    ttl.apply(
        StoredItem::new(key)
            .with_attribute(CONVERSATION_ATTR, "")
            .with_attribute(IS_CHUNKED_ATTR, true)
            .with_attribute(CHUNK_COUNT_ATTR, chunk_count),
    )
}

pub fn encode_summary_chunk(
    key: ItemKey,
    chunk_index: usize,
    chunk_count: usize,
    text: String,
    ttl: &TtlPolicy,
) -> StoredItem {
    ttl.apply(
        StoredItem::new(key)
            .with_attribute(CONVERSATION_ATTR, text)
            .with_attribute(IS_CHUNKED_ATTR, true)
            .with_attribute(CHUNK_COUNT_ATTR, chunk_count)
            .with_attribute(CHUNK_INDEX_ATTR, chunk_index),
    )
}

/// Sort-key layout under the user partition.
///
/// With per-agent history each agent owns `session#agent` and the summary
/// sits at `session`. Without it the shared conversation takes `session`,
/// so the summary moves to `session#summary`. Chunks hang off the summary
/// key as `<summary>#chunk_<i>`. The layout is only unambiguous for keys
/// that pass [`ConversationKey::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyLayout {
    pub per_agent_history: bool,
}

impl KeyLayout {
    pub fn conversation_key(&self, key: &ConversationKey) -> ItemKey {
        let sort_key = if self.per_agent_history {
            format!("{}{}{}", key.session_id, KEY_SEPARATOR, key.agent_id)
        } else {
            key.session_id.clone()
        };
        ItemKey::new(&key.user_id, sort_key)
    }

    pub fn session_prefix(&self, session_id: &str) -> String {
        format!("{}{}", session_id, KEY_SEPARATOR)
    }

    pub fn session_key(&self, scope: &SessionScope) -> ItemKey {
        ItemKey::new(&scope.user_id, &scope.session_id)
    }

    pub fn summary_key(&self, scope: &SessionScope) -> ItemKey {
        if self.per_agent_history {
            self.session_key(scope)
        } else {
            ItemKey::new(&scope.user_id, format!("{}#summary", scope.session_id))
        }
    }

    pub fn chunk_prefix(&self, scope: &SessionScope) -> String {
        format!("{}{}{}", self.summary_key(scope).sort_key, KEY_SEPARATOR, RESERVED_AGENT_PREFIX)
    }

    pub fn chunk_key(&self, scope: &SessionScope, chunk_index: usize) -> ItemKey {
        ItemKey::new(&scope.user_id, format!("{}{}", self.chunk_prefix(scope), chunk_index))
    }

    pub fn agent_id<'a>(&self, session_id: &str, sort_key: &'a str) -> Option<&'a str> {
        sort_key
            .strip_prefix(session_id)
            .and_then(|rest| rest.strip_prefix(KEY_SEPARATOR))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TableStats {
    pub total_items: i64,
    pub expiring_items: i64,
    pub database_size_bytes: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(sort_key: &str, attributes: Value) -> StoredItem {
        StoredItem {
            key: ItemKey::new("user", sort_key),
            attributes: attributes.as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn test_decode_conversation_with_legacy_string_content() {
        let record = Record::decode(&item(
            "s#agent",
            json!({ "conversation": [
                { "role": "user", "content": [{ "text": "hi" }], "timestamp": 1 },
                { "role": "assistant", "content": "hello", "timestamp": 2 }
            ]}),
        ))
        .unwrap();

        match record {
            Record::Conversation(messages) => {
                assert_eq!(messages.len(), 2);
                assert_eq!(messages[1].message.text(), "hello");
                assert_eq!(messages[1].timestamp, 2);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_decode_summary_shapes() {
        let plain = Record::decode(&item(
            "s",
            json!({ "conversation": "digest", "isChunked": false, "chunkCount": 0 }),
        ))
        .unwrap();
        assert_eq!(
            plain,
            Record::Summary(SummaryRecord { text: "digest".into(), is_chunked: false, chunk_count: 0 })
        );

        let chunk = Record::decode(&item(
            "s#chunk_1",
            json!({ "conversation": "part", "isChunked": true, "chunkCount": 3, "chunkIndex": 1 }),
        ))
        .unwrap();
        assert_eq!(
            chunk,
            Record::SummaryChunk(SummaryChunkRecord { chunk_index: 1, chunk_count: 3, text: "part".into() })
        );
    }

    #[test]
    fn test_decode_rejects_malformed_items() {
        assert!(Record::decode(&item("s#a", json!({ "conversation": 42 }))).is_err());
        assert!(Record::decode(&item("s#a", json!({ "other": [] }))).is_err());
        assert!(Record::decode(&item("s#a", json!({ "conversation": [{ "role": "robot" }] }))).is_err());
        assert!(Record::decode(&item("s", json!({ "conversation": "x", "chunkCount": -1 }))).is_err());
    }

    #[test]
    fn test_encode_roundtrip_keeps_usage() {
        let messages = vec![TimestampedMessage {
            message: ConversationMessage::assistant("ok").with_usage(TokenUsage { input_tokens: 3, output_tokens: 5 }),
            timestamp: 10,
        }];
        let encoded = encode_conversation(ItemKey::new("u", "s#a"), &messages, &TtlPolicy::disabled()).unwrap();
        assert_eq!(Record::decode(&encoded).unwrap(), Record::Conversation(messages));
    }

    #[test]
    fn test_ttl_policy_stamps_expiry() {
        let ttl = TtlPolicy { attribute: Some("ttl".into()), duration_seconds: 60 };
        let encoded = encode_summary(ItemKey::new("u", "s"), "text", &ttl);
        let expires_at = encoded.expires_at("ttl").unwrap();
        assert!(expires_at >= Utc::now().timestamp() + 59);
        assert!(encode_summary(ItemKey::new("u", "s"), "text", &TtlPolicy::disabled())
            .expires_at("ttl")
            .is_none());
    }

    #[test]
    fn test_key_layout() {
        let per_agent = KeyLayout { per_agent_history: true };
        let shared = KeyLayout { per_agent_history: false };
        let key = ConversationKey::new("u", "s", "tech");
        let scope = key.scope();

        assert_eq!(per_agent.conversation_key(&key).sort_key, "s#tech");
        assert_eq!(per_agent.summary_key(&scope).sort_key, "s");
        assert_eq!(per_agent.chunk_key(&scope, 2).sort_key, "s#chunk_2");
        assert_eq!(shared.conversation_key(&key).sort_key, "s");
        assert_eq!(shared.summary_key(&scope).sort_key, "s#summary");
        assert_eq!(shared.chunk_key(&scope, 0).sort_key, "s#summary#chunk_0");
        assert_eq!(per_agent.agent_id("s", "s#tech#2"), Some("tech#2"));
        assert_eq!(per_agent.agent_id("s", "other#tech"), None);
    }
}
