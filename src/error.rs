use thiserror::Error;

pub type Result<T> = std::result::Result<T, TetherError>;

#[derive(Debug, Error)]
pub enum TetherError {
    #[error("tool `{0}` not found")]
    ToolNotFound(String),

    #[error("tool `{name}` failed: {message}")]
    ToolExecution { name: String, message: String },

    #[error("invalid arguments for tool `{name}`: {message}")]
    InvalidArguments { name: String, message: String },

    #[error("language model error: {0}")]
    LanguageModel(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("output parse error: {0}")]
    OutputParse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl TetherError {
    pub fn tool(name: impl Into<String>, message: impl std::fmt::Display) -> Self {
        TetherError::ToolExecution {
            name: name.into(),
            message: message.to_string(),
        }
    }

    /// Whether the runner should surface this error to the model instead of aborting.
    pub fn is_tool_level(&self) -> bool {
        matches!(
            self,
            TetherError::ToolNotFound(_)
                | TetherError::ToolExecution { .. }
                | TetherError::InvalidArguments { .. }
        )
    }
}
