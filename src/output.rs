//! Parsers that turn model text into structured values.

use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Result, TetherError};
use crate::tool::validate_arguments;

/// Extracts the JSON payload of a reply, tolerating markdown fences and chatter.
#[derive(Debug, Clone, Default)]
pub struct JsonOutputParser;

impl JsonOutputParser {
    pub fn new() -> Self {
        Self
    }

    pub fn format_instructions(&self) -> String {
        "Return your answer as a single JSON value. Do not wrap it in prose; \
         a ```json code block is acceptable."
            .to_string()
    }

    /// Returns the first JSON value in `text`. A fenced block wins over bare text.
    pub fn parse(&self, text: &str) -> Result<Value> {
        let fenced = fence_pattern()
            .and_then(|pattern| pattern.captures(text))
            .and_then(|caps| caps.get(2))
            .and_then(|inner| first_json_value(inner.as_str()));
        fenced
            .or_else(|| first_json_value(text))
            .ok_or_else(|| TetherError::OutputParse(format!("no JSON found in `{text}`")))
    }

    pub fn parse_into<T: DeserializeOwned>(&self, text: &str) -> Result<T> {
        let value = self.parse(text)?;
        serde_json::from_value(value).map_err(|err| TetherError::OutputParse(err.to_string()))
    }
}

fn fence_pattern() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)```([A-Za-z]*)[ \t]*\n?(.*?)```").ok())
        .as_ref()
}

/// First complete value starting at `opener`, with its byte span in `text`.
fn first_value_from(text: &str, opener: char) -> Option<(usize, usize, Value)> {
    text.match_indices(opener).find_map(|(start, _)| {
        let mut values = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) => Some((start, start + values.byte_offset(), value)),
            _ => None,
        }
    })
}

/// Objects are preferred; an array wins only when it encloses the first object.
fn first_json_value(text: &str) -> Option<Value> {
    let object = first_value_from(text, '{');
    let array = first_value_from(text, '[');
    match (object, array) {
        (Some((obj_start, _, _)), Some((arr_start, arr_end, array)))
            if arr_start < obj_start && arr_end > obj_start =>
        {
            Some(array)
        }
        (Some((_, _, object)), _) => Some(object),
        (None, Some((_, _, array))) => Some(array),
        (None, None) => None,
    }
}

/// Parser bound to a JSON schema; the parsed object must satisfy it.
#[derive(Debug, Clone)]
pub struct StructuredOutputParser {
    schema: Value,
    inner: JsonOutputParser,
}

impl StructuredOutputParser {
    pub fn from_schema(schema: Value) -> Self {
        Self {
            schema,
            inner: JsonOutputParser,
        }
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    pub fn format_instructions(&self) -> String {
        format!(
            "Respond only with a JSON object that conforms to this JSON schema:\n```json\n{}\n```",
            serde_json::to_string_pretty(&self.schema).unwrap_or_else(|_| self.schema.to_string())
        )
    }

    pub fn parse(&self, text: &str) -> Result<Value> {
        let value = self.inner.parse(text)?;
        validate_arguments("output", &self.schema, &value)
            .map_err(|err| TetherError::OutputParse(err.to_string()))?;
        Ok(value)
    }
}

/// Parses the first XML element of a reply into JSON.
///
/// An element with text becomes `{"tag": "text"}`; one with child elements
/// becomes `{"tag": [child, ...]}`. Attributes are ignored.
#[derive(Debug, Clone, Default)]
pub struct XmlOutputParser {
    tags: Vec<String>,
}

struct OpenElement {
    tag: String,
    text: String,
    children: Vec<Value>,
}

impl OpenElement {
    fn close(self) -> Value {
        let body = if self.children.is_empty() {
            Value::String(unescape_xml(self.text.trim()))
        } else {
            Value::Array(self.children)
        };
        let mut object = serde_json::Map::new();
        object.insert(self.tag, body);
        Value::Object(object)
    }
}

impl XmlOutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags listed in the format instructions.
    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn format_instructions(&self) -> String {
        let mut out = String::from(
            "The output should be an XML document. Open and close every tag, and nest \
             elements to show structure. For the tags [\"foo\", \"bar\"] this is well formed:\n\
             <foo>\n  <bar>text</bar>\n</foo>\n\
             and this is not:\n\
             <foo>\n  <bar>\n</foo>",
        );
        if self.tags.is_empty() {
            out.push_str("\n\nChoose suitable tag names yourself.");
        } else {
            out.push_str(&format!(
                "\n\nUse these tags:\n```\n{}\n```",
                self.tags.join("\n")
            ));
        }
        out
    }

    pub fn parse(&self, text: &str) -> Result<Value> {
        let body = fence_pattern()
            .and_then(|pattern| pattern.captures(text))
            .filter(|caps| {
                caps.get(1).map_or(true, |lang| {
                    lang.as_str().is_empty() || lang.as_str().eq_ignore_ascii_case("xml")
                })
            })
            .and_then(|caps| caps.get(2))
            .map_or(text, |inner| inner.as_str());

        let mut stack: Vec<OpenElement> = Vec::new();
        let mut cursor = 0;
        for caps in tag_pattern()?.captures_iter(body) {
            let Some(whole) = caps.get(0) else { continue };
            if let Some(open) = stack.last_mut() {
                open.text.push_str(&body[cursor..whole.start()]);
            }
            cursor = whole.end();

            let tag = caps.get(2).map_or("", |m| m.as_str()).to_string();
            let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
            let self_closing = caps.get(3).is_some_and(|m| !m.as_str().is_empty());

            let finished = if closing {
                let open = stack.pop().ok_or_else(|| {
                    TetherError::OutputParse(format!("unexpected closing tag </{tag}>"))
                })?;
                if open.tag != tag {
                    return Err(TetherError::OutputParse(format!(
                        "expected </{}> but found </{tag}>",
                        open.tag
                    )));
                }
                open.close()
            } else if self_closing {
                OpenElement {
                    tag,
                    text: String::new(),
                    children: Vec::new(),
                }
                .close()
            } else {
                stack.push(OpenElement {
                    tag,
                    text: String::new(),
                    children: Vec::new(),
                });
                continue;
            };

            match stack.last_mut() {
                Some(parent) => parent.children.push(finished),
                None => return Ok(finished),
            }
        }

        match stack.first() {
            Some(open) => Err(TetherError::OutputParse(format!("unclosed tag <{}>", open.tag))),
            None => Err(TetherError::OutputParse(format!("no XML element found in `{text}`"))),
        }
    }
}

fn tag_pattern() -> Result<&'static Regex> {
    static TAG: OnceLock<Option<Regex>> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"<(/?)([A-Za-z_][\w.:-]*)[^<>]*?(/?)>").ok())
        .as_ref()
        .ok_or_else(|| TetherError::OutputParse("invalid tag pattern".into()))
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Best-effort parse of a truncated JSON document, as produced mid-stream.
///
/// Open strings, arrays and objects are closed; when that still does not
/// parse, trailing characters are dropped until it does.
pub fn parse_partial_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    let mut end = trimmed.len();
    while end > 0 {
        if let Some(value) = close_partial(&trimmed[..end])
            .and_then(|completed| serde_json::from_str(&completed).ok())
        {
            return Some(value);
        }
        end = trimmed[..end]
            .char_indices()
            .next_back()
            .map(|(idx, _)| idx)
            .unwrap_or(0);
    }
    None
}

fn close_partial(text: &str) -> Option<String> {
    let mut closers = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                if closers.pop() != Some(ch) {
                    return None;
                }
            }
            _ => {}
        }
    }

    let mut completed = text.to_string();
    if in_string {
        if escaped {
            completed.pop();
        }
        completed.push('"');
    }
    while let Some(closer) = closers.pop() {
        completed.push(closer);
    }
    Some(completed)
}
