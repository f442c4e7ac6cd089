//! `{variable}` prompt templates, pipelines, few-shot prompts and chat prompts with history slots.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::error::{Result, TetherError};
use crate::message::{Message, Role};
use crate::selector::{Example, ExampleSelector};

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Var(String),
}

/// A string template with `{name}` placeholders. `{{` and `}}` render literal braces.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    template: String,
    segments: Vec<Segment>,
    partials: HashMap<String, String>,
}

impl PromptTemplate {
    pub fn from_template(template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        let pattern = placeholder_pattern()?;

        let mut segments = Vec::new();
        let mut text = String::new();
        let mut cursor = 0;
        for caps in pattern.captures_iter(&template) {
            let Some(whole) = caps.get(0) else { continue };
            text.push_str(literal(&template, &template[cursor..whole.start()])?);
            cursor = whole.end();
            match (whole.as_str(), caps.get(1)) {
                ("{{", _) => text.push('{'),
                ("}}", _) => text.push('}'),
                (_, Some(name)) => {
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(Segment::Var(name.as_str().to_string()));
                }
                _ => {}
            }
        }
        text.push_str(literal(&template, &template[cursor..])?);
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        Ok(Self {
            template,
            segments,
            partials: HashMap::new(),
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Variables still required by [`format`](Self::format), in first-use order.
    pub fn input_variables(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for segment in &self.segments {
            if let Segment::Var(name) = segment {
                if !self.partials.contains_key(name) && !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    /// Pre-fills a variable; call-time values still take precedence.
    pub fn partial(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.partials.insert(name.into(), value.into());
        self
    }

    pub fn format(&self, vars: &HashMap<String, String>) -> Result<String> {
        let mut out = String::with_capacity(self.template.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Var(name) => {
                    let value = vars
                        .get(name)
                        .or_else(|| self.partials.get(name))
                        .ok_or_else(|| {
                            TetherError::Template(format!("missing variable `{name}`"))
                        })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

fn placeholder_pattern() -> Result<&'static Regex> {
    static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{\{|\}\}|\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}").ok())
        .as_ref()
        .ok_or_else(|| TetherError::Template("invalid placeholder pattern".into()))
}

fn literal<'a>(template: &str, raw: &'a str) -> Result<&'a str> {
    if raw.contains('{') || raw.contains('}') {
        return Err(TetherError::Template(format!(
            "unbalanced brace in template `{template}`"
        )));
    }
    Ok(raw)
}

/// Renders named sub-prompts first, then feeds their output into `final_prompt`.
///
/// Each stage sees the caller's variables plus the output of earlier stages.
#[derive(Debug, Clone)]
pub struct PipelinePromptTemplate {
    final_prompt: PromptTemplate,
    stages: Vec<(String, PromptTemplate)>,
}

impl PipelinePromptTemplate {
    pub fn new(final_prompt: PromptTemplate) -> Self {
        Self {
            final_prompt,
            stages: Vec::new(),
        }
    }

    pub fn with_stage(mut self, name: impl Into<String>, prompt: PromptTemplate) -> Self {
        self.stages.push((name.into(), prompt));
        self
    }

    /// Variables the caller must supply; stage outputs are excluded.
    pub fn input_variables(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let prompts = self
            .stages
            .iter()
            .map(|(_, prompt)| prompt)
            .chain(std::iter::once(&self.final_prompt));
        for prompt in prompts {
            for name in prompt.input_variables() {
                let produced = self.stages.iter().any(|(stage, _)| *stage == name);
                if !produced && !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    pub fn format(&self, vars: &HashMap<String, String>) -> Result<String> {
        let mut values = vars.clone();
        for (name, prompt) in &self.stages {
            let rendered = prompt.format(&values)?;
            values.insert(name.clone(), rendered);
        }
        self.final_prompt.format(&values)
    }
}

/// Prefix, formatted examples and suffix joined by `separator`.
///
/// Examples come from the fixed `examples` list unless a selector is attached,
/// in which case the selector picks them per call.
#[derive(Clone)]
pub struct FewShotPromptTemplate {
    pub prefix: Option<PromptTemplate>,
    pub examples: Vec<Example>,
    pub example_prompt: PromptTemplate,
    pub suffix: PromptTemplate,
    pub separator: String,
    selector: Option<Arc<dyn ExampleSelector>>,
}

impl FewShotPromptTemplate {
    pub fn new(
        example_prompt: PromptTemplate,
        examples: Vec<Example>,
        suffix: PromptTemplate,
    ) -> Self {
        Self {
            prefix: None,
            examples,
            example_prompt,
            suffix,
            separator: "\n\n".into(),
            selector: None,
        }
    }

    pub fn from_selector(
        example_prompt: PromptTemplate,
        selector: Arc<dyn ExampleSelector>,
        suffix: PromptTemplate,
    ) -> Self {
        Self {
            selector: Some(selector),
            ..Self::new(example_prompt, Vec::new(), suffix)
        }
    }

    pub fn with_prefix(mut self, prefix: PromptTemplate) -> Self {
        self.prefix = Some(prefix);
        self
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    pub async fn format(&self, vars: &HashMap<String, String>) -> Result<String> {
        let selected;
        let examples = match &self.selector {
            Some(selector) => {
                selected = selector.select_examples(vars).await?;
                &selected
            }
            None => &self.examples,
        };

        let mut pieces = Vec::with_capacity(examples.len() + 2);
        if let Some(prefix) = &self.prefix {
            pieces.push(prefix.format(vars)?);
        }
        for example in examples {
            pieces.push(self.example_prompt.format(example)?);
        }
        pieces.push(self.suffix.format(vars)?);
        pieces.retain(|p| !p.is_empty());
        Ok(pieces.join(&self.separator))
    }
}

/// Renders each example through a chat prompt, yielding alternating example turns.
#[derive(Debug, Clone)]
pub struct FewShotChatPromptTemplate {
    example_prompt: ChatPromptTemplate,
    examples: Vec<Example>,
}

impl FewShotChatPromptTemplate {
    pub fn new(example_prompt: ChatPromptTemplate, examples: Vec<Example>) -> Self {
        Self {
            example_prompt,
            examples,
        }
    }

    pub fn format_messages(&self) -> Result<Vec<Message>> {
        let no_histories = HashMap::new();
        let mut messages = Vec::new();
        for example in &self.examples {
            messages.extend(self.example_prompt.format_messages(example, &no_histories)?);
        }
        Ok(messages)
    }
}

#[derive(Debug, Clone)]
enum ChatPart {
    Message(Role, PromptTemplate),
    Placeholder(String),
    FewShot(FewShotChatPromptTemplate),
}

/// Named slot in a [`ChatPromptTemplate`] filled with a list of prior messages.
#[derive(Debug, Clone)]
pub struct MessagesPlaceholder(pub String);

#[derive(Debug, Clone, Default)]
pub struct ChatPromptTemplate {
    parts: Vec<ChatPart>,
}

impl ChatPromptTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: &[(Role, &str)]) -> Result<Self> {
        messages
            .iter()
            .try_fold(Self::new(), |chat, (role, template)| {
                chat.with_message(*role, template)
            })
    }

    pub fn with_message(mut self, role: Role, template: &str) -> Result<Self> {
        if role == Role::Tool {
            return Err(TetherError::Template(
                "tool messages cannot be templated".into(),
            ));
        }
        self.parts
            .push(ChatPart::Message(role, PromptTemplate::from_template(template)?));
        Ok(self)
    }

    pub fn with_placeholder(mut self, placeholder: MessagesPlaceholder) -> Self {
        self.parts.push(ChatPart::Placeholder(placeholder.0));
        self
    }

    /// Splices rendered few-shot example turns in at this position.
    pub fn with_few_shot(mut self, few_shot: FewShotChatPromptTemplate) -> Self {
        self.parts.push(ChatPart::FewShot(few_shot));
        self
    }

    pub fn format_messages(
        &self,
        vars: &HashMap<String, String>,
        histories: &HashMap<String, Vec<Message>>,
    ) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        for part in &self.parts {
            match part {
                ChatPart::Message(role, template) => {
                    let content = template.format(vars)?;
                    messages.push(match role {
                        Role::System => Message::system(content),
                        Role::User => Message::user(content),
                        _ => Message::assistant(content),
                    });
                }
                ChatPart::Placeholder(name) => {
                    let history = histories.get(name).ok_or_else(|| {
                        TetherError::Template(format!("missing messages for `{name}`"))
                    })?;
                    messages.extend(history.iter().cloned());
                }
                ChatPart::FewShot(few_shot) => messages.extend(few_shot.format_messages()?),
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn formats_variables_and_escapes() {
        let template =
            PromptTemplate::from_template("Tell me a {adjective} joke about {{ {topic} }}").unwrap();
        assert_eq!(template.input_variables(), vec!["adjective", "topic"]);
        let text = template
            .format(&vars(&[("adjective", "funny"), ("topic", "chickens")]))
            .unwrap();
        assert_eq!(text, "Tell me a funny joke about { chickens }");
    }

    #[test]
    fn missing_variable_is_a_template_error() {
        let template = PromptTemplate::from_template("Hello {name}").unwrap();
        assert!(matches!(
            template.format(&HashMap::new()),
            Err(TetherError::Template(_))
        ));
    }

    #[test]
    fn unbalanced_brace_is_rejected() {
        assert!(PromptTemplate::from_template("oops {").is_err());
    }

    #[test]
    fn partials_fill_and_hide_variables() {
        let template = PromptTemplate::from_template("{greeting}, {name}")
            .unwrap()
            .partial("greeting", "Hi");
        assert_eq!(template.input_variables(), vec!["name"]);
        assert_eq!(template.format(&vars(&[("name", "Ada")])).unwrap(), "Hi, Ada");
    }

    #[tokio::test]
    async fn few_shot_joins_examples() {
        let example = PromptTemplate::from_template("Q: {q}\nA: {a}").unwrap();
        let few_shot = FewShotPromptTemplate::new(
            example,
            vec![vars(&[("q", "2+2"), ("a", "4")]), vars(&[("q", "3+3"), ("a", "6")])],
            PromptTemplate::from_template("Q: {input}\nA:").unwrap(),
        )
        .with_prefix(PromptTemplate::from_template("Answer arithmetic questions.").unwrap());

        let text = few_shot.format(&vars(&[("input", "5+5")])).await.unwrap();
        assert_eq!(
            text,
            "Answer arithmetic questions.\n\nQ: 2+2\nA: 4\n\nQ: 3+3\nA: 6\n\nQ: 5+5\nA:"
        );
    }

    #[test]
    fn chat_prompt_splices_history() {
        let chat = ChatPromptTemplate::from_messages(&[(Role::System, "You are {persona}.")])
            .unwrap()
            .with_placeholder(MessagesPlaceholder("history".into()))
            .with_message(Role::User, "{question}")
            .unwrap();

        let mut histories = HashMap::new();
        histories.insert(
            "history".to_string(),
            vec![Message::user("hi"), Message::assistant("hello")],
        );
        let messages = chat
            .format_messages(
                &vars(&[("persona", "terse"), ("question", "and now?")]),
                &histories,
            )
            .unwrap();

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].content, "You are terse.");
        assert_eq!(messages[2].role, Role::Assistant);
        assert_eq!(messages[3].content, "and now?");

        assert!(chat.format_messages(&vars(&[]), &HashMap::new()).is_err());
    }

    #[tokio::test]
    async fn few_shot_asks_the_selector_per_call() {
        use crate::selector::LengthBasedExampleSelector;

        let example = PromptTemplate::from_template("Q: {q}\nA: {a}").unwrap();
        let selector = LengthBasedExampleSelector::from_examples(
            vec![vars(&[("q", "2+2"), ("a", "4")]), vars(&[("q", "3+3"), ("a", "6")])],
            example.clone(),
            6,
        )
        .await
        .unwrap();
        let few_shot = FewShotPromptTemplate::from_selector(
            example,
            Arc::new(selector),
            PromptTemplate::from_template("Q: {input}\nA:").unwrap(),
        );

        let short = few_shot.format(&vars(&[("input", "5+5")])).await.unwrap();
        assert_eq!(short, "Q: 2+2\nA: 4\n\nQ: 5+5\nA:");
        let long = few_shot
            .format(&vars(&[("input", "what is five plus five")]))
            .await
            .unwrap();
        assert_eq!(long, "Q: what is five plus five\nA:");
    }

    #[test]
    fn pipeline_feeds_stage_output_into_final_prompt() {
        let pipeline = PipelinePromptTemplate::new(
            PromptTemplate::from_template("{persona_block}\n{context_block}\nWrite the report.")
                .unwrap(),
        )
        .with_stage(
            "persona_block",
            PromptTemplate::from_template("You lead a team; tone: {tone}.").unwrap(),
        )
        .with_stage(
            "context_block",
            PromptTemplate::from_template("Company: {company}. {persona_block}").unwrap(),
        );

        assert_eq!(pipeline.input_variables(), vec!["tone", "company"]);
        let text = pipeline
            .format(&vars(&[("tone", "dry"), ("company", "Acme")]))
            .unwrap();
        assert_eq!(
            text,
            "You lead a team; tone: dry.\nCompany: Acme. You lead a team; tone: dry.\nWrite the report."
        );
        assert!(pipeline.format(&vars(&[("tone", "dry")])).is_err());
    }

    #[test]
    fn few_shot_chat_examples_become_turns() {
        let example_prompt = ChatPromptTemplate::from_messages(&[
            (Role::User, "Summarize: {input}"),
            (Role::Assistant, "{output}"),
        ])
        .unwrap();
        let few_shot = FewShotChatPromptTemplate::new(
            example_prompt,
            vec![
                vars(&[("input", "fixed two incidents"), ("output", "- 2 incidents closed")]),
                vars(&[("input", "shipped dashboard"), ("output", "- dashboard live")]),
            ],
        );
        let chat = ChatPromptTemplate::from_messages(&[(Role::System, "Write bullet points.")])
            .unwrap()
            .with_few_shot(few_shot)
            .with_message(Role::User, "Summarize: {current}")
            .unwrap();

        let messages = chat
            .format_messages(&vars(&[("current", "refactored orders")]), &HashMap::new())
            .unwrap();
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                Role::System,
                Role::User,
                Role::Assistant,
                Role::User,
                Role::Assistant,
                Role::User
            ]
        );
        assert_eq!(messages[2].content, "- 2 incidents closed");
        assert_eq!(messages[5].content, "Summarize: refactored orders");
    }
}
