//! Conversation types and the storage contract shared by every backend.
//!
//! Backends implement [`ChatStorage`]; the dedup and window policies live
//! here as free functions so each backend applies them identically.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::summarizer::SummaryCoordinator;
use crate::utils::TextUtils;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    User,
    Assistant,
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantRole::User => write!(f, "user"),
            ParticipantRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// One text segment of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub text: String,
}

impl ContentBlock {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Token accounting reported by the model that produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: ParticipantRole,
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl ConversationMessage {
    pub fn new(role: ParticipantRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::new(text)],
            usage: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(ParticipantRole::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(ParticipantRole::Assistant, text)
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// All text segments joined with a newline.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A message as held by a backend. The timestamp is epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampedMessage {
    #[serde(flatten)]
    pub message: ConversationMessage,
    pub timestamp: i64,
}

impl TimestampedMessage {
    pub fn role(&self) -> ParticipantRole {
        self.message.role
    }
}

/// Joins session and agent ids in durable sort keys; never valid inside either.
pub const KEY_SEPARATOR: char = '#';

/// Agent ids may not start with this. Durable summary chunks are stored
/// under `session#chunk_<i>`.
pub const RESERVED_AGENT_PREFIX: &str = "chunk_";

/// Address of one agent's conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub user_id: String,
    pub session_id: String,
    pub agent_id: String,
}

impl ConversationKey {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            agent_id: agent_id.into(),
        }
    }

    pub fn scope(&self) -> SessionScope {
        SessionScope::new(&self.user_id, &self.session_id)
    }

    /// Reject ids that would make one key's records overlap another's.
    pub fn validate(&self) -> anyhow::Result<()> {
        check_session_id(&self.session_id)?;
        if self.agent_id.contains(KEY_SEPARATOR) {
            anyhow::bail!("Agent id {:?} must not contain '{}'", self.agent_id, KEY_SEPARATOR);
        }
        if self.agent_id.starts_with(RESERVED_AGENT_PREFIX) {
            anyhow::bail!(
                "Agent id {:?} must not start with reserved prefix {:?}",
                self.agent_id,
                RESERVED_AGENT_PREFIX
            );
        }
        Ok(())
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.user_id, self.session_id, self.agent_id)
    }
}

/// Aggregate address spanning every agent in a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionScope {
    pub user_id: String,
    pub session_id: String,
}

impl SessionScope {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        check_session_id(&self.session_id)
    }
}

fn check_session_id(session_id: &str) -> anyhow::Result<()> {
    if session_id.contains(KEY_SEPARATOR) {
        anyhow::bail!("Session id {:?} must not contain '{}'", session_id, KEY_SEPARATOR);
    }
    Ok(())
}

impl fmt::Display for SessionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.session_id)
    }
}

/// Persistent storage for multi-agent conversation history.
#[async_trait]
pub trait ChatStorage: Send + Sync {
    /// Append one message, applying the dedup and window policies.
    /// Returns the post-trim conversation.
    async fn save_chat_message(
        &self,
        key: &ConversationKey,
        message: ConversationMessage,
        max_history_size: Option<usize>,
    ) -> anyhow::Result<Vec<ConversationMessage>>;

    /// Append several messages with a single write. Each message is checked
    /// against the running tail, so a same-role run keeps only its first entry.
    async fn save_chat_messages(
        &self,
        key: &ConversationKey,
        messages: Vec<ConversationMessage>,
        max_history_size: Option<usize>,
    ) -> anyhow::Result<Vec<ConversationMessage>>;

    async fn fetch_chat(
        &self,
        key: &ConversationKey,
        max_history_size: Option<usize>,
    ) -> anyhow::Result<Vec<ConversationMessage>>;

    async fn fetch_chat_with_timestamps(
        &self,
        key: &ConversationKey,
    ) -> anyhow::Result<Vec<TimestampedMessage>>;

    /// Every agent's conversation in the session, merged in write order.
    /// Assistant messages carry an `[agent_id]` prefix.
    async fn fetch_all_chats(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> anyhow::Result<Vec<ConversationMessage>>;

    async fn fetch_summary(&self, user_id: &str, session_id: &str)
        -> anyhow::Result<Option<String>>;

    /// Fold history beyond the retention threshold into the session summary.
    ///
    /// Not atomic: callers that may trigger this concurrently for the same
    /// session must serialize the calls themselves.
    async fn summarize_and_truncate(
        &self,
        user_id: &str,
        session_id: &str,
        coordinator: &dyn SummaryCoordinator,
    ) -> anyhow::Result<()>;
}

pub fn is_same_role_as_last_message(
    conversation: &[TimestampedMessage],
    new_message: &ConversationMessage,
) -> bool {
    conversation
        .last()
        .map(|last| last.role() == new_message.role)
        .unwrap_or(false)
}

/// Keep the most recent `max_history_size` entries, rounded down to an even
/// count so user/assistant pairs stay whole.
pub fn trim_conversation<T>(mut conversation: Vec<T>, max_history_size: Option<usize>) -> Vec<T> {
    if let Some(max) = max_history_size {
        let window = max - max % 2;
        if conversation.len() > window {
            conversation.drain(..conversation.len() - window);
        }
    }
    conversation
}

pub fn remove_timestamps(messages: &[TimestampedMessage]) -> Vec<ConversationMessage> {
    messages.iter().map(|m| m.message.clone()).collect()
}

/// Append `new_messages` to `conversation` under the dedup policy, stamping
/// each accepted message. Returns how many were accepted.
pub(crate) fn append_deduplicated(
    conversation: &mut Vec<TimestampedMessage>,
    new_messages: Vec<ConversationMessage>,
    clock: &MonotonicClock,
) -> usize {
    let mut accepted = 0;
    for message in new_messages {
        if is_same_role_as_last_message(conversation, &message) {
            tracing::debug!(
                "> Consecutive {} message detected ({}). Not saving.",
                message.role,
                TextUtils::truncate_with_ellipsis(&message.text(), 60)
            );
            continue;
        }
        conversation.push(TimestampedMessage {
            message,
            timestamp: clock.next(),
        });
        accepted += 1;
    }
    accepted
}

/// Epoch-millisecond clock that never hands out the same value twice.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }
}

/// A message from the aggregate view, tagged with the agent it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMessage {
    pub agent_id: Option<String>,
    pub message: TimestampedMessage,
}

impl AgentMessage {
    /// Strip the timestamp and prefix Assistant text with the agent id.
    pub fn decorated(&self) -> ConversationMessage {
        let mut message = self.message.message.clone();
        if let (ParticipantRole::Assistant, Some(agent_id)) = (message.role, &self.agent_id) {
            match message.content.first_mut() {
                Some(first) => first.text = format!("[{}] {}", agent_id, first.text),
                None => message.content.push(ContentBlock::new(format!("[{}] ", agent_id))),
            }
        }
        message
    }
}

/// Merge per-agent conversations into one list ordered by timestamp.
/// The sort is stable, so equal timestamps keep their per-agent order.
pub fn merge_agent_conversations<I>(conversations: I) -> Vec<AgentMessage>
where
    I: IntoIterator<Item = (Option<String>, Vec<TimestampedMessage>)>,
{
    let mut merged: Vec<AgentMessage> = conversations
        .into_iter()
        .flat_map(|(agent_id, messages)| {
            messages.into_iter().map(move |message| AgentMessage {
                agent_id: agent_id.clone(),
                message,
            })
        })
        .collect();
    merged.sort_by_key(|m| m.message.timestamp);
    merged
}

/// The aggregate split at a retention threshold.
#[derive(Debug, Clone)]
pub struct OverflowSplit {
    pub overflow: Vec<AgentMessage>,
    pub keep: Vec<AgentMessage>,
}

impl OverflowSplit {
    /// `None` when the aggregate fits within `threshold`.
    pub fn at_threshold(mut merged: Vec<AgentMessage>, threshold: usize) -> Option<Self> {
        if merged.len() <= threshold {
            return None;
        }
        let keep = merged.split_off(merged.len() - threshold);
        Some(Self {
            overflow: merged,
            keep,
        })
    }

    /// How many leading messages each agent loses to the overflow. Each
    /// agent's record is time-ordered, so its overflowed messages are a prefix.
    pub fn dropped_per_agent(&self) -> HashMap<Option<String>, usize> {
        let mut counts = HashMap::new();
        for entry in &self.overflow {
            *counts.entry(entry.agent_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn overflow_messages(&self) -> Vec<ConversationMessage> {
        self.overflow.iter().map(AgentMessage::decorated).collect()
    }
}

/// Append-only summary growth: absent history counts as empty text.
pub fn combine_summaries(existing: Option<&str>, new_summary: &str) -> String {
    format!("{}.{}", existing.unwrap_or_default(), new_summary)
}
