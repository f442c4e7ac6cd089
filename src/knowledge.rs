use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::error::{Result, TetherError};
use crate::tool::Tool;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Value,
}

impl Document {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            metadata: json!({}),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Clone, Debug)]
pub struct ScoredDocument {
    pub document: Document,
    pub score: f32,
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn add(&self, document: Document, embedding: Vec<f32>) -> Result<()>;
    async fn search(&self, embedding: Vec<f32>, top_k: usize) -> Result<Vec<ScoredDocument>>;
}

/// Basic whitespace tokenizer with hashed buckets for deterministic embeddings.
pub struct WhitespaceEmbedder {
    buckets: usize,
}

impl Default for WhitespaceEmbedder {
    fn default() -> Self {
        Self { buckets: 64 }
    }
}

impl WhitespaceEmbedder {
    pub fn new(buckets: usize) -> Self {
        Self {
            buckets: buckets.max(1),
        }
    }
}

#[async_trait]
impl Embedder for WhitespaceEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0; self.buckets];

        for token in text.split_whitespace() {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            token.to_lowercase().hash(&mut hasher);
            let idx = (hasher.finish() as usize) % self.buckets;
            vector[idx] += 1.0;
        }

        Ok(vector)
    }
}

/// Embeddings from an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAIEmbedder {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dimensions: Option<usize>,
}

impl OpenAIEmbedder {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .map_err(|err| TetherError::LanguageModel(format!("http client error: {err}")))?,
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".into(),
            model: model.into(),
            dimensions: None,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut payload = json!({ "model": self.model, "input": text });
        if let Some(dimensions) = self.dimensions {
            payload["dimensions"] = json!(dimensions);
        }

        let resp = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| TetherError::LanguageModel(format!("embedding request error: {err}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TetherError::LanguageModel(format!(
                "embedding request failed with {status}: {body}"
            )));
        }

        let parsed: EmbeddingResponse = resp.json().await.map_err(|err| {
            TetherError::LanguageModel(format!("embedding response parse error: {err}"))
        })?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| TetherError::LanguageModel("embedding response had no data".into()))
    }
}

#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: RwLock<Vec<(Document, Vec<f32>)>>,
}

impl InMemoryVectorStore {
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn add(&self, document: Document, embedding: Vec<f32>) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.retain(|(existing, _)| existing.id != document.id);
        entries.push((document, embedding));
        Ok(())
    }

    async fn search(&self, embedding: Vec<f32>, top_k: usize) -> Result<Vec<ScoredDocument>> {
        let entries = self.entries.read().await;
        let mut scored: Vec<ScoredDocument> = entries
            .iter()
            .map(|(doc, stored)| ScoredDocument {
                document: doc.clone(),
                score: cosine_similarity(stored, &embedding),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);
        Ok(scored)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }
}

pub struct KnowledgeBase<E: Embedder, S: VectorStore> {
    embedder: Arc<E>,
    store: Arc<S>,
    min_score: Option<f32>,
}

impl<E: Embedder, S: VectorStore> KnowledgeBase<E, S> {
    pub fn new(embedder: Arc<E>, store: Arc<S>) -> Self {
        Self {
            embedder,
            store,
            min_score: None,
        }
    }

    /// Drops hits scoring below `min_score`.
    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }

    pub async fn add_document(&self, document: Document) -> Result<()> {
        let embedding = self.embedder.embed(&document.text).await?;
        self.store.add(document, embedding).await
    }

    pub async fn add_documents(&self, documents: Vec<Document>) -> Result<usize> {
        let count = documents.len();
        for document in documents {
            self.add_document(document).await?;
        }
        Ok(count)
    }

    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<ScoredDocument>> {
        let embedding = self.embedder.embed(query).await?;
        let mut scored = self.store.search(embedding, top_k).await?;
        if let Some(min) = self.min_score {
            scored.retain(|doc| doc.score >= min);
        }
        Ok(scored)
    }
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<String>>;
}

#[async_trait]
impl<E, S> Retriever for KnowledgeBase<E, S>
where
    E: Embedder,
    S: VectorStore,
{
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<String>> {
        let docs = KnowledgeBase::retrieve(self, query, top_k).await?;
        Ok(docs.into_iter().map(|d| d.document.text).collect())
    }
}

/// Exposes a [`Retriever`] to the model as the `search_knowledge` tool.
pub struct KnowledgeSearchTool {
    retriever: Arc<dyn Retriever>,
    top_k: usize,
}

pub fn retrieval_tool(retriever: Arc<dyn Retriever>, top_k: usize) -> KnowledgeSearchTool {
    KnowledgeSearchTool {
        retriever,
        top_k: top_k.max(1),
    }
}

#[async_trait]
impl Tool for KnowledgeSearchTool {
    fn name(&self) -> &str {
        "search_knowledge"
    }

    fn description(&self) -> &str {
        "Search the knowledge base for passages relevant to `query`."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        }))
    }

    async fn call(&self, input: Value) -> Result<Value> {
        let query = input
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let passages = self.retriever.retrieve(query, self.top_k).await?;
        Ok(json!({ "query": query, "passages": passages }))
    }
}

/// Long-term conversation memory: past rounds are embedded and recalled by similarity.
pub struct ConversationRecall<E: Embedder, S: VectorStore> {
    knowledge: KnowledgeBase<E, S>,
    rounds: AtomicUsize,
}

impl<E: Embedder, S: VectorStore> ConversationRecall<E, S> {
    pub fn new(embedder: Arc<E>, store: Arc<S>) -> Self {
        Self {
            knowledge: KnowledgeBase::new(embedder, store),
            rounds: AtomicUsize::new(0),
        }
    }

    /// Stores one user/assistant exchange; returns its round number.
    pub async fn remember(&self, user: &str, assistant: &str) -> Result<usize> {
        let round = self.rounds.fetch_add(1, Ordering::SeqCst) + 1;
        let document = Document::new(format!("User: {user}\nAssistant: {assistant}"))
            .with_id(format!("conv_{round}"))
            .with_metadata(json!({ "round": round }));
        self.knowledge.add_document(document).await?;
        Ok(round)
    }

    pub async fn recall(&self, query: &str, top_k: usize) -> Result<Vec<ScoredDocument>> {
        self.knowledge.retrieve(query, top_k).await
    }

    /// Recalled rounds rendered as a prompt preamble, or `None` when nothing matched.
    pub async fn context_block(&self, query: &str, top_k: usize) -> Result<Option<String>> {
        let recalled = self.recall(query, top_k).await?;
        if recalled.is_empty() {
            return Ok(None);
        }
        let blocks: Vec<String> = recalled
            .iter()
            .enumerate()
            .map(|(idx, hit)| {
                let round = hit.document.metadata["round"].as_u64().unwrap_or_default();
                format!(
                    "[Past conversation {}]\nRound: {round}\n{}",
                    idx + 1,
                    hit.document.text
                )
            })
            .collect();
        Ok(Some(format!(
            "Relevant past conversations:\n{}\n\nUser question: {query}",
            blocks.join("\n\n-----\n\n")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kb() -> KnowledgeBase<WhitespaceEmbedder, InMemoryVectorStore> {
        KnowledgeBase::new(
            Arc::new(WhitespaceEmbedder::new(1024)),
            Arc::new(InMemoryVectorStore::default()),
        )
    }

    #[test]
    fn cosine_handles_zero_vectors() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 1.0], &[1.0, 1.0]) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn retrieves_most_similar_document_first() {
        let kb = kb();
        kb.add_documents(vec![
            Document::new("rust ownership and borrowing rules"),
            Document::new("braised pork needs rock sugar and soy sauce"),
        ])
        .await
        .unwrap();

        let hits = kb.retrieve("braised pork with soy sauce", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].document.text.contains("pork"));
    }

    #[tokio::test]
    async fn re_adding_an_id_replaces_it() {
        let store = Arc::new(InMemoryVectorStore::default());
        let kb = KnowledgeBase::new(Arc::new(WhitespaceEmbedder::default()), store.clone());
        kb.add_document(Document::new("old").with_id("doc")).await.unwrap();
        kb.add_document(Document::new("new").with_id("doc")).await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn min_score_filters_unrelated_hits() {
        let kb = kb().with_min_score(0.9);
        kb.add_document(Document::new("alpha beta gamma")).await.unwrap();
        assert!(kb.retrieve("zeta", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_tool_returns_passages() {
        let kb = kb();
        kb.add_document(Document::new("the capital of france is paris"))
            .await
            .unwrap();
        let tool = retrieval_tool(Arc::new(kb), 2);
        let out = tool.call(json!({"query": "capital of france"})).await.unwrap();
        assert_eq!(out["passages"][0], "the capital of france is paris");
    }

    #[tokio::test]
    async fn recall_surfaces_relevant_rounds() {
        let recall = ConversationRecall::new(
            Arc::new(WhitespaceEmbedder::new(1024)),
            Arc::new(InMemoryVectorStore::default()),
        );
        recall
            .remember("my machine learning project uses pytorch", "Sounds fun!")
            .await
            .unwrap();
        let second = recall
            .remember("on weekends I go hiking", "Great exercise.")
            .await
            .unwrap();
        assert_eq!(second, 2);

        let hits = recall.recall("how is my machine learning project", 1).await.unwrap();
        assert_eq!(hits[0].document.metadata["round"], 1);

        let block = recall
            .context_block("weekends hiking", 1)
            .await
            .unwrap()
            .unwrap();
        assert!(block.contains("Round: 2"));
        assert!(block.ends_with("User question: weekends hiking"));
    }
}
