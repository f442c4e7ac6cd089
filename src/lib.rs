//! Building blocks for running tool-calling agents.
//!
//! The crate provides:
//! - A language model abstraction (`LanguageModel`) with an OpenAI-compatible client.
//! - A tool interface (`Tool` and `ToolRegistry`) with argument validation.
//! - An `Agent` that loops between the model and tools until a final answer or budget exhaustion.
//! - Conversation history, memory strategies and pluggable stores.
//! - Retrieval helpers, text splitting, prompt templates and output parsers.

mod agent;
mod config;
mod error;
mod hooks;
mod knowledge;
mod llm;
mod memory;
mod message;
mod output;
mod prompt;
mod selector;
mod splitter;
mod storage;
mod telemetry;
mod tool;
mod toolkit;

pub use agent::{Agent, AgentState, RunOutcome, StopReason, DEFAULT_MAX_ITERATIONS};
pub use config::{
    AgentConfig, AppConfig, LoggingConfig, ModelConfig, StorageBackend, StorageConfig,
};
pub use error::{Result, TetherError};
pub use hooks::AgentHook;
pub use knowledge::{
    cosine_similarity, retrieval_tool, ConversationRecall, Document, Embedder,
    InMemoryVectorStore, KnowledgeBase, KnowledgeSearchTool, OpenAIEmbedder, Retriever,
    ScoredDocument, VectorStore, WhitespaceEmbedder,
};
pub use llm::{
    LanguageModel, ModelReply, OpenAIClient, ReplyAccumulator, ReplyChunk, StubModel,
    ToolCallChunk,
};
pub use memory::{
    summarize_history, ApproxTokenCounter, ConversationMemory, FullMemoryStrategy,
    HistorySummary, MemoryStrategy, PersistentConversationMemory, SummarizedMemoryStrategy,
    TokenCounter, TokenLimitedMemoryStrategy, WindowedMemoryStrategy,
};
pub use message::{
    to_buffer_string, validate_tool_pairing, Message, Role, ToolCall, ToolStatus,
};
pub use output::{parse_partial_json, JsonOutputParser, StructuredOutputParser, XmlOutputParser};
pub use prompt::{
    ChatPromptTemplate, FewShotChatPromptTemplate, FewShotPromptTemplate, MessagesPlaceholder,
    PipelinePromptTemplate, PromptTemplate,
};
pub use selector::{
    Example, ExampleSelector, LengthBasedExampleSelector, SemanticSimilarityExampleSelector,
};
pub use splitter::{RecursiveCharacterTextSplitter, TextSplitter, TokenTextSplitter};
#[cfg(feature = "persistence")]
pub use storage::SqlConversationStore;
pub use storage::{ConversationStore, FileConversationStore, InMemoryConversationStore};
pub use telemetry::{init_tracing, TelemetryCollector, TelemetryEvent};
pub use tool::{output_to_text, validate_arguments, Tool, ToolDescription, ToolRegistry};
pub use toolkit::{coding_toolkit, ToolkitConfig};
