pub mod error;
pub mod providers;
pub mod types;
pub mod functions;
pub mod sim;
pub mod scoring;
pub mod prompts;
pub mod driver;
pub mod eval;

pub use error::{LLMError, RuntimeError, ScenarioError, ToolError};
pub use providers::LLMProvider;
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
pub use functions::{AssistantToolCall, FunctionCall, FunctionDefinition, Tool, ToolChoice};
pub use sim::{
    ActionHistory,
    ActionRecord,
    ScenarioRuntime,
    ScenarioState,
    Status,
    TicketStatus,
    ToolCall,
    ToolKind,
    ToolResult,
};
pub use scoring::{score, AcceptanceCriteria, ScoreResult, ScoreWeights, Termination};
pub use prompts::{PromptSet, Variant};
pub use driver::{DriverError, DriverOptions, DriverRun, ModelDriver};
pub use eval::{load_scenarios, EvalConfig, EvalReport, EvalRunner, ScenarioSpec};
