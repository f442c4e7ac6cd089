//! Strategies that pick which few-shot examples go into a prompt.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::error::{Result, TetherError};
use crate::knowledge::{Document, Embedder, KnowledgeBase, VectorStore};
use crate::prompt::PromptTemplate;

/// One few-shot example: template variable name to value.
pub type Example = HashMap<String, String>;

#[async_trait]
pub trait ExampleSelector: Send + Sync {
    async fn add_example(&self, example: Example) -> Result<()>;

    /// Examples to show for `input`, in prompt order.
    async fn select_examples(&self, input: &Example) -> Result<Vec<Example>>;
}

type TextLength = Arc<dyn Fn(&str) -> usize + Send + Sync>;

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Takes examples in order while their formatted length still fits the budget
/// left over after the input itself.
pub struct LengthBasedExampleSelector {
    example_prompt: PromptTemplate,
    max_length: usize,
    text_length: TextLength,
    examples: RwLock<Vec<Example>>,
}

impl LengthBasedExampleSelector {
    /// Lengths are measured in whitespace-separated words until
    /// [`with_text_length`](Self::with_text_length) says otherwise.
    pub fn new(example_prompt: PromptTemplate, max_length: usize) -> Self {
        Self {
            example_prompt,
            max_length,
            text_length: Arc::new(word_count),
            examples: RwLock::new(Vec::new()),
        }
    }

    pub fn with_text_length(
        mut self,
        text_length: impl Fn(&str) -> usize + Send + Sync + 'static,
    ) -> Self {
        self.text_length = Arc::new(text_length);
        self
    }

    pub async fn from_examples(
        examples: Vec<Example>,
        example_prompt: PromptTemplate,
        max_length: usize,
    ) -> Result<Self> {
        let selector = Self::new(example_prompt, max_length);
        for example in examples {
            selector.add_example(example).await?;
        }
        Ok(selector)
    }
}

#[async_trait]
impl ExampleSelector for LengthBasedExampleSelector {
    async fn add_example(&self, example: Example) -> Result<()> {
        self.example_prompt.format(&example)?;
        self.examples.write().await.push(example);
        Ok(())
    }

    async fn select_examples(&self, input: &Example) -> Result<Vec<Example>> {
        let mut values: Vec<&str> = input.values().map(String::as_str).collect();
        values.sort_unstable();
        let Some(mut remaining) = self
            .max_length
            .checked_sub((self.text_length)(&values.join(" ")))
        else {
            return Ok(Vec::new());
        };

        let mut selected = Vec::new();
        for example in self.examples.read().await.iter() {
            let length = (self.text_length)(&self.example_prompt.format(example)?);
            if length > remaining {
                break;
            }
            remaining -= length;
            selected.push(example.clone());
        }
        Ok(selected)
    }
}

/// Picks the `k` stored examples closest to the input in embedding space.
pub struct SemanticSimilarityExampleSelector<E: Embedder, S: VectorStore> {
    knowledge: KnowledgeBase<E, S>,
    k: usize,
    input_keys: Option<Vec<String>>,
}

impl<E: Embedder, S: VectorStore> SemanticSimilarityExampleSelector<E, S> {
    pub fn new(knowledge: KnowledgeBase<E, S>, k: usize) -> Self {
        Self {
            knowledge,
            k: k.max(1),
            input_keys: None,
        }
    }

    /// Restricts which variables are embedded, both when adding and when selecting.
    pub fn with_input_keys<I, T>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.input_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    fn embedding_text(&self, values: &Example) -> String {
        let mut keys: Vec<&String> = match &self.input_keys {
            Some(keys) => keys.iter().filter(|k| values.contains_key(*k)).collect(),
            None => values.keys().collect(),
        };
        keys.sort();
        keys.iter()
            .filter_map(|key| values.get(*key).map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl<E: Embedder, S: VectorStore> ExampleSelector for SemanticSimilarityExampleSelector<E, S> {
    async fn add_example(&self, example: Example) -> Result<()> {
        let metadata: Map<String, Value> = example
            .iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect();
        let document =
            Document::new(self.embedding_text(&example)).with_metadata(Value::Object(metadata));
        self.knowledge.add_document(document).await
    }

    async fn select_examples(&self, input: &Example) -> Result<Vec<Example>> {
        let hits = self
            .knowledge
            .retrieve(&self.embedding_text(input), self.k)
            .await?;
        hits.into_iter()
            .map(|hit| match hit.document.metadata {
                Value::Object(map) => Ok(map
                    .into_iter()
                    .filter_map(|(key, value)| match value {
                        Value::String(text) => Some((key, text)),
                        _ => None,
                    })
                    .collect()),
                other => Err(TetherError::Template(format!(
                    "stored example `{}` has metadata {other}",
                    hit.document.id
                ))),
            })
            .collect()
    }
}
