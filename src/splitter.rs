use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::{Result, TetherError};
use crate::knowledge::Document;
use crate::memory::{ApproxTokenCounter, TokenCounter};

pub trait TextSplitter {
    fn split_text(&self, text: &str) -> Vec<String>;

    /// Splits each document; chunks inherit metadata plus a `chunk` index.
    fn split_documents(&self, documents: &[Document]) -> Vec<Document> {
        let mut out = Vec::new();
        for document in documents {
            for (idx, chunk) in self.split_text(&document.text).into_iter().enumerate() {
                let mut metadata = match &document.metadata {
                    Value::Object(map) => Value::Object(map.clone()),
                    _ => json!({}),
                };
                metadata["chunk"] = json!(idx);
                out.push(
                    Document::new(chunk)
                        .with_id(format!("{}#{idx}", document.id))
                        .with_metadata(metadata),
                );
            }
        }
        out
    }
}

fn check_sizes(chunk_size: usize, chunk_overlap: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(TetherError::Config("chunk_size must be positive".into()));
    }
    if chunk_overlap >= chunk_size {
        return Err(TetherError::Config(format!(
            "chunk_overlap ({chunk_overlap}) must be smaller than chunk_size ({chunk_size})"
        )));
    }
    Ok(())
}

/// Splits text on a ranked list of separators, falling back to finer ones for oversized pieces.
///
/// Sizes are measured in `char`s. Adjacent chunks share up to `chunk_overlap` trailing chars.
/// Separators stay attached to the start of the piece that follows them unless
/// [`with_keep_separator(false)`](Self::with_keep_separator) drops them.
#[derive(Debug, Clone)]
pub struct RecursiveCharacterTextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
    keep_separator: bool,
}

impl RecursiveCharacterTextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        check_sizes(chunk_size, chunk_overlap)?;
        Ok(Self {
            chunk_size,
            chunk_overlap,
            separators: ["\n\n", "\n", " ", ""].iter().map(|s| s.to_string()).collect(),
            keep_separator: true,
        })
    }

    pub fn with_separators(mut self, separators: Vec<String>) -> Self {
        self.separators = separators;
        self
    }

    pub fn with_keep_separator(mut self, keep_separator: bool) -> Self {
        self.keep_separator = keep_separator;
        self
    }

    fn split_recursive(&self, text: &str, separators: &[String]) -> Vec<String> {
        let position = separators
            .iter()
            .position(|sep| sep.is_empty() || text.contains(sep.as_str()));
        let (separator, rest) = match position {
            Some(idx) => (separators[idx].as_str(), &separators[idx + 1..]),
            None => ("", &separators[separators.len()..]),
        };

        let (splits, joiner): (Vec<&str>, &str) = if separator.is_empty() {
            let chars = text
                .char_indices()
                .map(|(i, c)| &text[i..i + c.len_utf8()])
                .collect();
            (chars, "")
        } else if self.keep_separator {
            (split_keeping(text, separator), "")
        } else {
            (
                text.split(separator).filter(|s| !s.is_empty()).collect(),
                separator,
            )
        };

        let mut chunks = Vec::new();
        let mut fitting = Vec::new();
        for piece in splits {
            if piece.chars().count() < self.chunk_size {
                fitting.push(piece);
                continue;
            }
            if !fitting.is_empty() {
                chunks.extend(self.merge(&fitting, joiner));
                fitting.clear();
            }
            if rest.is_empty() {
                chunks.push(piece.to_string());
            } else {
                chunks.extend(self.split_recursive(piece, rest));
            }
        }
        if !fitting.is_empty() {
            chunks.extend(self.merge(&fitting, joiner));
        }
        chunks
    }

    fn merge(&self, splits: &[&str], separator: &str) -> Vec<String> {
        let sep_len = separator.chars().count();
        let mut chunks = Vec::new();
        let mut current: VecDeque<&str> = VecDeque::new();
        let mut total = 0;

        for split in splits {
            let len = split.chars().count();
            let joiner = if current.is_empty() { 0 } else { sep_len };
            if total + len + joiner > self.chunk_size && !current.is_empty() {
                if let Some(chunk) = join(&current, separator) {
                    chunks.push(chunk);
                }
                while total > self.chunk_overlap
                    || (total > 0
                        && total + len + if current.is_empty() { 0 } else { sep_len }
                            > self.chunk_size)
                {
                    let Some(first) = current.pop_front() else {
                        break;
                    };
                    total -= first.chars().count();
                    if !current.is_empty() {
                        total -= sep_len;
                    }
                }
            }
            if !current.is_empty() {
                total += sep_len;
            }
            current.push_back(split);
            total += len;
        }

        if let Some(chunk) = join(&current, separator) {
            chunks.push(chunk);
        }
        chunks
    }
}

impl TextSplitter for RecursiveCharacterTextSplitter {
    fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &self.separators)
    }
}

/// Splits before every occurrence of `separator`, so each piece after the first starts with it.
fn split_keeping<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for (idx, _) in text.match_indices(separator) {
        if idx > start {
            pieces.push(&text[start..idx]);
        }
        start = idx;
    }
    pieces.push(&text[start..]);
    pieces.retain(|piece| !piece.is_empty());
    pieces
}

fn join(parts: &VecDeque<&str>, separator: &str) -> Option<String> {
    let joined = parts.iter().copied().collect::<Vec<_>>().join(separator);
    let trimmed = joined.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Packs whole words into chunks of at most `chunk_size` tokens as measured by a
/// [`TokenCounter`]. Consecutive chunks repeat up to `chunk_overlap` tokens.
///
/// A single word larger than `chunk_size` becomes its own chunk.
#[derive(Clone)]
pub struct TokenTextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    counter: Arc<dyn TokenCounter>,
}

impl TokenTextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        check_sizes(chunk_size, chunk_overlap)?;
        Ok(Self {
            chunk_size,
            chunk_overlap,
            counter: Arc::new(ApproxTokenCounter::default()),
        })
    }

    pub fn with_counter(mut self, counter: impl TokenCounter + 'static) -> Self {
        self.counter = Arc::new(counter);
        self
    }
}

/// Each word together with the whitespace that follows it.
fn words_with_trailing_space(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut in_space = false;
    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            in_space = true;
        } else if in_space {
            pieces.push(&text[start..idx]);
            start = idx;
            in_space = false;
        }
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

impl TextSplitter for TokenTextSplitter {
    fn split_text(&self, text: &str) -> Vec<String> {
        let pieces = words_with_trailing_space(text);
        let tokens: Vec<usize> = pieces.iter().map(|p| self.counter.count(p)).collect();

        let mut chunks = Vec::new();
        let mut start = 0;
        while start < pieces.len() {
            let mut end = start;
            let mut total = 0;
            while end < pieces.len() && (end == start || total + tokens[end] <= self.chunk_size) {
                total += tokens[end];
                end += 1;
            }

            let chunk = pieces[start..end].concat();
            let trimmed = chunk.trim();
            if !trimmed.is_empty() {
                chunks.push(trimmed.to_string());
            }
            if end == pieces.len() {
                break;
            }

            let mut next = end;
            let mut carried = 0;
            while next > start + 1 && carried + tokens[next - 1] <= self.chunk_overlap {
                carried += tokens[next - 1];
                next -= 1;
            }
            start = next;
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlap_not_smaller_than_size() {
        assert!(matches!(
            RecursiveCharacterTextSplitter::new(10, 10),
            Err(TetherError::Config(_))
        ));
        assert!(matches!(
            TokenTextSplitter::new(5, 5),
            Err(TetherError::Config(_))
        ));
    }

    #[test]
    fn merges_words_up_to_chunk_size() {
        let splitter = RecursiveCharacterTextSplitter::new(10, 0).unwrap();
        assert_eq!(
            splitter.split_text("aaaa bbbb cccc dddd"),
            vec!["aaaa bbbb", "cccc dddd"]
        );
    }

    #[test]
    fn carries_overlap_between_chunks() {
        let splitter = RecursiveCharacterTextSplitter::new(10, 4)
            .unwrap()
            .with_keep_separator(false);
        assert_eq!(
            splitter.split_text("aaaa bbbb cccc dddd"),
            vec!["aaaa bbbb", "bbbb cccc", "cccc dddd"]
        );
    }

    #[test]
    fn kept_separators_count_toward_chunk_size() {
        let splitter = RecursiveCharacterTextSplitter::new(10, 4).unwrap();
        assert_eq!(
            splitter.split_text("aaaa bbbb cccc dddd"),
            vec!["aaaa bbbb", "cccc dddd"]
        );

        let lines = RecursiveCharacterTextSplitter::new(12, 0).unwrap();
        assert_eq!(
            lines.split_text("fn a() {}\n// note\nfn b() {}"),
            vec!["fn a() {}", "// note", "fn b() {}"]
        );
        assert_eq!(split_keeping("x-y-z", "-"), vec!["x", "-y", "-z"]);
    }

    #[test]
    fn prefers_paragraph_breaks() {
        let splitter = RecursiveCharacterTextSplitter::new(20, 0).unwrap();
        let chunks = splitter.split_text("first paragraph\n\nsecond paragraph");
        assert_eq!(chunks, vec!["first paragraph", "second paragraph"]);
    }

    #[test]
    fn falls_back_to_characters_for_long_words() {
        let splitter = RecursiveCharacterTextSplitter::new(3, 0).unwrap();
        assert_eq!(splitter.split_text("abcdefg"), vec!["abc", "def", "g"]);
    }

    #[test]
    fn documents_keep_metadata_and_gain_chunk_index() {
        let splitter = RecursiveCharacterTextSplitter::new(10, 0).unwrap();
        let doc = Document::new("aaaa bbbb cccc dddd")
            .with_id("notes")
            .with_metadata(json!({"source": "notes.md"}));

        let chunks = splitter.split_documents(&[doc]);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].id, "notes#1");
        assert_eq!(chunks[1].metadata["source"], "notes.md");
        assert_eq!(chunks[1].metadata["chunk"], 1);
    }

    struct WordCounter;

    impl TokenCounter for WordCounter {
        fn count(&self, text: &str) -> usize {
            text.split_whitespace().count()
        }
    }

    #[test]
    fn token_splitter_windows_with_overlap() {
        let splitter = TokenTextSplitter::new(3, 1).unwrap().with_counter(WordCounter);
        assert_eq!(
            splitter.split_text("a b c d e f g"),
            vec!["a b c", "c d e", "e f g"]
        );

        let no_overlap = TokenTextSplitter::new(3, 0).unwrap().with_counter(WordCounter);
        assert_eq!(
            no_overlap.split_text("a b c d e f g"),
            vec!["a b c", "d e f", "g"]
        );
    }

    #[test]
    fn token_splitter_uses_the_counter_budget() {
        let log = "[10:00:00] INFO: started\n[10:00:05] DEBUG: config loaded\n[10:00:10] ERROR: failed";
        let splitter = TokenTextSplitter::new(8, 2).unwrap();
        let counter = ApproxTokenCounter::default();
        let chunks = splitter.split_text(log);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            let words = words_with_trailing_space(chunk);
            let tokens: usize = words.iter().map(|w| counter.count(w)).sum();
            assert!(tokens <= 8 || words.len() == 1, "{chunk:?} is {tokens} tokens");
        }
        assert!(chunks[0].starts_with("[10:00:00]"));
        assert!(chunks.last().unwrap().ends_with("failed"));
    }

    #[test]
    fn oversized_word_is_its_own_chunk() {
        let splitter = TokenTextSplitter::new(2, 0).unwrap();
        assert_eq!(
            splitter.split_text("tiny supercalifragilistic ok"),
            vec!["tiny", "supercalifragilistic", "ok"]
        );
    }
}
