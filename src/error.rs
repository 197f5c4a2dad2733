use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),
}

/// Dispatch-level failures. These never end a run: the runtime turns them into
/// a rejected observation so the model can correct itself.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolError {
    #[error("unknown metric '{metric}' (known: {})", .known.join(", "))]
    UnknownMetric { metric: String, known: Vec<String> },

    #[error("invalid scale request: {requested} replicas (allowed 1..={max})")]
    InvalidScaleRequest { requested: i64, max: u32 },

    #[error("invalid ticket status '{status}'")]
    InvalidStatus { status: String },

    #[error("unknown tool '{name}'")]
    UnknownTool {
        name: String,
        suggestion: Option<String>,
    },

    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("step budget of {budget} tool calls exceeded")]
    StepBudgetExceeded { budget: usize },
}

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("scenario '{id}' is invalid: {reason}")]
    Invalid { id: String, reason: String },

    #[error("failed to compile argument schema for {tool}: {message}")]
    ToolSchema { tool: String, message: String },
}

impl ScenarioError {
    pub(crate) fn invalid(id: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}
