use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::hooks::AgentHook;
use crate::llm::LanguageModel;
use crate::memory::ConversationMemory;
use crate::message::{Message, ToolCall};
use crate::storage::ConversationStore;
use crate::telemetry::TelemetryCollector;
use crate::tool::{output_to_text, ToolRegistry};

pub const DEFAULT_MAX_ITERATIONS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    AwaitingModel,
    ExecutingTools,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model replied without requesting tools.
    Completed,
    /// `max_iterations` model invocations happened without a final reply.
    BudgetExhausted,
    /// The cancellation token fired between steps.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub answer: String,
    pub stop: StopReason,
    pub model_calls: usize,
}

/// Drives a model and a fixed set of tools until the model stops asking for tools.
pub struct Agent<M: LanguageModel + ?Sized> {
    system_prompt: Option<String>,
    model: Arc<M>,
    tools: ToolRegistry,
    memory: ConversationMemory,
    store: Option<Arc<dyn ConversationStore>>,
    max_iterations: usize,
    hooks: Vec<Arc<dyn AgentHook>>,
    cancel: CancellationToken,
    telemetry: Option<TelemetryCollector>,
    concurrent_tools: bool,
    state: AgentState,
}

impl<M: LanguageModel + ?Sized> Agent<M> {
    pub fn new(model: Arc<M>) -> Self {
        Self {
            system_prompt: None,
            model,
            tools: ToolRegistry::new(),
            memory: ConversationMemory::default(),
            store: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            hooks: Vec::new(),
            cancel: CancellationToken::new(),
            telemetry: None,
            concurrent_tools: true,
            state: AgentState::AwaitingModel,
        }
    }

    /// Inserted at the head of the conversation when the history is empty.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Seeds the conversation with prior history.
    pub fn with_memory(mut self, memory: ConversationMemory) -> Self {
        self.memory = memory;
        self
    }

    /// Mirrors every appended message into `store`.
    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn AgentHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryCollector) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Runs the tool calls of one turn one after another instead of concurrently.
    pub fn with_sequential_tools(mut self) -> Self {
        self.concurrent_tools = false;
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Replaces the in-memory history with whatever the attached store holds.
    pub async fn load_history(&mut self) -> Result<usize> {
        if let Some(store) = &self.store {
            self.memory = ConversationMemory::with_messages(store.load().await?);
        }
        Ok(self.memory.len())
    }

    /// Runs one exchange and returns only the answer text.
    pub async fn respond(&mut self, query: impl Into<String>) -> Result<String> {
        self.run(query).await.map(|outcome| outcome.answer)
    }

    /// Runs one exchange. On error the agent is left `Done` with every requested call answered.
    pub async fn run(&mut self, query: impl Into<String>) -> Result<RunOutcome> {
        match self.drive(query.into()).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.state = AgentState::Done;
                self.close_pending_calls("Error: run aborted").await;
                self.record("run_failed", json!({ "error": err.to_string() }));
                Err(err)
            }
        }
    }

    async fn drive(&mut self, query: String) -> Result<RunOutcome> {
        self.state = AgentState::AwaitingModel;

        if self.memory.is_empty() {
            if let Some(prompt) = self.system_prompt.clone() {
                self.append(Message::system(prompt)).await?;
            }
        }
        self.record("run_started", json!({ "query": query }));
        self.append(Message::user(query)).await?;

        let descriptions = self.tools.describe();
        let mut model_calls = 0;

        for iteration in 0..self.max_iterations {
            if self.cancel.is_cancelled() {
                return Ok(self.finish(StopReason::Cancelled, model_calls));
            }

            debug!(iteration, messages = self.memory.len(), "invoking model");
            for hook in &self.hooks {
                hook.before_model(self.memory.messages()).await?;
            }
            let reply = self
                .model
                .complete_chat(self.memory.messages(), &descriptions)
                .await?;
            model_calls += 1;
            for hook in &self.hooks {
                hook.after_model(&reply).await?;
            }

            let calls = reply.tool_calls.clone();
            self.append(reply.into_message()).await?;

            if calls.is_empty() {
                return Ok(self.finish(StopReason::Completed, model_calls));
            }

            self.state = AgentState::ExecutingTools;
            if self.cancel.is_cancelled() {
                self.close_pending_calls("Error: run cancelled").await;
                return Ok(self.finish(StopReason::Cancelled, model_calls));
            }

            for call in &calls {
                for hook in &self.hooks {
                    hook.before_tool_call(call).await?;
                }
            }
            let results = self.execute_calls(&calls).await;
            for result in results {
                for hook in &self.hooks {
                    hook.after_tool_result(&result).await?;
                }
                self.append(result).await?;
            }
            self.state = AgentState::AwaitingModel;
        }

        warn!(
            max_iterations = self.max_iterations,
            "agent reached the iteration budget without a final answer"
        );
        Ok(self.finish(StopReason::BudgetExhausted, model_calls))
    }

    /// Answers every call of the latest tool-requesting turn that has no result yet.
    async fn close_pending_calls(&mut self, reason: &str) {
        let pending: Vec<String> = {
            let messages = self.memory.messages();
            let Some(turn) = messages.iter().rposition(Message::requests_tools) else {
                return;
            };
            let answered: HashSet<&str> = messages[turn + 1..]
                .iter()
                .filter_map(|m| m.tool_call_id.as_deref())
                .collect();
            messages[turn]
                .tool_calls
                .iter()
                .filter(|call| !answered.contains(call.id.as_str()))
                .map(|call| call.id.clone())
                .collect()
        };

        for id in pending {
            let message = Message::tool_error(id, reason);
            if let Some(store) = &self.store {
                if let Err(err) = store.append(&message).await {
                    warn!(error = %err, "could not persist closing tool result");
                }
            }
            self.memory.push(message);
        }
    }

    /// Results come back in call order whatever order the tools finish in.
    async fn execute_calls(&self, calls: &[ToolCall]) -> Vec<Message> {
        if self.concurrent_tools {
            join_all(calls.iter().map(|call| self.execute_call(call))).await
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results.push(self.execute_call(call).await);
            }
            results
        }
    }

    async fn execute_call(&self, call: &ToolCall) -> Message {
        info!(tool = %call.name, call_id = %call.id, "executing tool");
        match self.tools.call(&call.name, call.arguments.clone()).await {
            Ok(output) => Message::tool_result(&call.id, output_to_text(&output)),
            Err(err) => {
                warn!(tool = %call.name, call_id = %call.id, error = %err, "tool failed");
                self.record(
                    "tool_failed",
                    json!({ "tool": call.name, "call_id": call.id, "error": err.to_string() }),
                );
                Message::tool_error(&call.id, format!("Error: {err}"))
            }
        }
    }

    async fn append(&mut self, message: Message) -> Result<()> {
        if let Some(store) = &self.store {
            store.append(&message).await?;
        }
        self.memory.push(message);
        Ok(())
    }

    fn finish(&mut self, stop: StopReason, model_calls: usize) -> RunOutcome {
        self.state = AgentState::Done;
        let answer = self
            .memory
            .last()
            .map(|message| message.content.clone())
            .unwrap_or_default();
        self.record(
            "run_finished",
            json!({ "stop": stop, "model_calls": model_calls }),
        );
        debug!(?stop, model_calls, "agent run finished");
        RunOutcome {
            answer,
            stop,
            model_calls,
        }
    }

    fn record(&self, kind: &str, detail: serde_json::Value) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record(kind, detail);
        }
    }
}
