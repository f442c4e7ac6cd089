use async_trait::async_trait;

use crate::error::Result;
use crate::llm::ModelReply;
use crate::message::{Message, ToolCall};

/// Observation points around each step of an agent run. Errors abort the run.
#[async_trait]
pub trait AgentHook: Send + Sync {
    async fn before_model(&self, _messages: &[Message]) -> Result<()> {
        Ok(())
    }

    async fn after_model(&self, _reply: &ModelReply) -> Result<()> {
        Ok(())
    }

    async fn before_tool_call(&self, _call: &ToolCall) -> Result<()> {
        Ok(())
    }

    async fn after_tool_result(&self, _result: &Message) -> Result<()> {
        Ok(())
    }
}
