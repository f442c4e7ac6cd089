use crate::error::Result;
use crate::llm::LanguageModel;
use crate::message::{to_buffer_string, Message, Role};
use crate::storage::ConversationStore;

/// In-memory, append-only transcript.
#[derive(Default, Clone, Debug, PartialEq)]
pub struct ConversationMemory {
    messages: Vec<Message>,
}

impl ConversationMemory {
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Message> + '_ {
        self.messages.iter()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

/// Memory whose every append is written through to a store.
pub struct PersistentConversationMemory<S: ConversationStore> {
    store: S,
    inner: ConversationMemory,
}

impl<S: ConversationStore> PersistentConversationMemory<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            inner: ConversationMemory::default(),
        }
    }

    pub async fn load(mut self) -> Result<Self> {
        let stored = self.store.load().await?;
        self.inner = ConversationMemory::with_messages(stored);
        Ok(self)
    }

    pub fn as_memory(&self) -> &ConversationMemory {
        &self.inner
    }

    pub async fn push(&mut self, message: Message) -> Result<()> {
        self.store.append(&message).await?;
        self.inner.push(message);
        Ok(())
    }

    pub async fn clear(&mut self) -> Result<()> {
        self.store.clear().await?;
        self.inner = ConversationMemory::default();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory Strategies
// ─────────────────────────────────────────────────────────────────────────────

/// Memory strategy trait for shaping the context sent to a model
pub trait MemoryStrategy: Send + Sync {
    fn get_context_messages(&self, messages: &[Message]) -> Vec<Message>;

    fn name(&self) -> &str;
}

/// Keep all messages
#[derive(Clone, Default)]
pub struct FullMemoryStrategy;

impl MemoryStrategy for FullMemoryStrategy {
    fn get_context_messages(&self, messages: &[Message]) -> Vec<Message> {
        messages.to_vec()
    }

    fn name(&self) -> &str {
        "full"
    }
}

/// Keep only the last N non-system messages (sliding window)
#[derive(Clone)]
pub struct WindowedMemoryStrategy {
    window_size: usize,
    keep_system: bool,
}

impl WindowedMemoryStrategy {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            keep_system: true,
        }
    }

    pub fn without_system(mut self) -> Self {
        self.keep_system = false;
        self
    }
}

impl MemoryStrategy for WindowedMemoryStrategy {
    fn get_context_messages(&self, messages: &[Message]) -> Vec<Message> {
        let mut result: Vec<Message> = if self.keep_system {
            messages
                .iter()
                .filter(|m| m.role == Role::System)
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let non_system: Vec<&Message> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .collect();
        let mut start = non_system.len().saturating_sub(self.window_size);
        while start < non_system.len() && non_system[start].role == Role::Tool {
            start += 1;
        }
        result.extend(non_system[start..].iter().map(|m| (*m).clone()));

        result
    }

    fn name(&self) -> &str {
        "windowed"
    }
}

/// Counts tokens of a piece of text.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Character-based estimate: one token per `chars_per_token` characters, rounded up.
#[derive(Clone)]
pub struct ApproxTokenCounter {
    chars_per_token: usize,
}

impl Default for ApproxTokenCounter {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl ApproxTokenCounter {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl TokenCounter for ApproxTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }
}

/// Keep the newest messages that fit within a token budget. System messages always stay.
pub struct TokenLimitedMemoryStrategy {
    max_tokens: usize,
    counter: Box<dyn TokenCounter>,
}

impl TokenLimitedMemoryStrategy {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            counter: Box::new(ApproxTokenCounter::default()),
        }
    }

    pub fn with_counter(mut self, counter: impl TokenCounter + 'static) -> Self {
        self.counter = Box::new(counter);
        self
    }

    pub fn count_tokens(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.counter.count(&m.content)).sum()
    }
}

impl MemoryStrategy for TokenLimitedMemoryStrategy {
    fn get_context_messages(&self, messages: &[Message]) -> Vec<Message> {
        let mut result: Vec<Message> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .cloned()
            .collect();
        let mut total_tokens = self.count_tokens(&result);

        let mut recent = Vec::new();
        for msg in messages.iter().rev().filter(|m| m.role != Role::System) {
            let tokens = self.counter.count(&msg.content);
            if total_tokens + tokens > self.max_tokens {
                break;
            }
            total_tokens += tokens;
            recent.push(msg.clone());
        }

        recent.reverse();
        drop_orphaned_results(&mut recent);
        result.extend(recent);
        result
    }

    fn name(&self) -> &str {
        "token_limited"
    }
}

/// Keep first and last N messages, summarize the middle
#[derive(Clone)]
pub struct SummarizedMemoryStrategy {
    keep_first: usize,
    keep_last: usize,
    summary: Option<String>,
}

impl SummarizedMemoryStrategy {
    pub fn new(keep_first: usize, keep_last: usize) -> Self {
        Self {
            keep_first,
            keep_last,
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn needs_summary(&self, messages: &[Message]) -> bool {
        messages.len() > self.keep_first + self.keep_last
    }

    pub fn messages_to_summarize<'a>(&self, messages: &'a [Message]) -> &'a [Message] {
        if !self.needs_summary(messages) {
            return &[];
        }
        &messages[self.keep_first..messages.len() - self.keep_last]
    }
}

impl MemoryStrategy for SummarizedMemoryStrategy {
    fn get_context_messages(&self, messages: &[Message]) -> Vec<Message> {
        if !self.needs_summary(messages) {
            return messages.to_vec();
        }

        let mut result: Vec<Message> = messages.iter().take(self.keep_first).cloned().collect();
        drop_unanswered_request(&mut result);

        if let Some(ref summary) = self.summary {
            result.push(Message::system(format!(
                "[Summary of {} messages]: {}",
                messages.len() - self.keep_first - self.keep_last,
                summary
            )));
        }

        let mut recent = messages[messages.len() - self.keep_last..].to_vec();
        drop_orphaned_results(&mut recent);
        result.extend(recent);
        result
    }

    fn name(&self) -> &str {
        "summarized"
    }
}

/// Removes tool results at the head of a window whose requesting turn fell outside it.
fn drop_orphaned_results(window: &mut Vec<Message>) {
    let orphans = window.iter().take_while(|m| m.role == Role::Tool).count();
    window.drain(..orphans);
}

/// Cuts a prefix before its last tool-requesting turn when that turn's results were cut off.
fn drop_unanswered_request(prefix: &mut Vec<Message>) {
    let Some(turn) = prefix.iter().rposition(Message::requests_tools) else {
        return;
    };
    let answered = prefix[turn + 1..]
        .iter()
        .filter(|m| m.role == Role::Tool)
        .count();
    if answered < prefix[turn].tool_calls.len() {
        prefix.truncate(turn);
    }
}

/// Outcome of [`summarize_history`].
#[derive(Debug, Clone, PartialEq)]
pub struct HistorySummary {
    pub summary: Option<String>,
    pub summarized: usize,
    pub recent: Vec<Message>,
}

/// Asks `model` to condense everything but the `keep_recent` newest messages.
///
/// Histories no longer than `threshold` are returned untouched.
pub async fn summarize_history<M: LanguageModel + ?Sized>(
    model: &M,
    messages: &[Message],
    threshold: usize,
    keep_recent: usize,
) -> Result<HistorySummary> {
    if messages.len() < threshold || messages.len() <= keep_recent {
        return Ok(HistorySummary {
            summary: None,
            summarized: 0,
            recent: messages.to_vec(),
        });
    }

    let mut split = messages.len() - keep_recent;
    while split < messages.len() && messages[split].role == Role::Tool {
        split += 1;
    }
    let (older, recent) = messages.split_at(split);
    let transcript = to_buffer_string(older, "User", "Assistant");
    let prompt = format!(
        "Summarize the core content of the following conversation, keeping important facts:\n\n{transcript}\n\nSummary:"
    );

    let reply = model.complete_chat(&[Message::system(prompt)], &[]).await?;
    tracing::debug!(summarized = older.len(), kept = recent.len(), "summarized history");

    Ok(HistorySummary {
        summary: reply.content,
        summarized: older.len(),
        recent: recent.to_vec(),
    })
}
