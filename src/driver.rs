use std::{sync::Arc, time::Duration};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time;
use tracing::{debug, info, warn};

use crate::{
    error::{RuntimeError, ScenarioError},
    eval::scenario::ScenarioSpec,
    functions::{Tool, ToolChoice},
    prompts::{tool_preamble, PromptError, PromptSet, Variant},
    providers::LLMProvider,
    scoring::Termination,
    sim::{ActionHistory, ScenarioRuntime, ScenarioState, ToolCall, ToolKind, ToolResult},
    types::{ChatMessage, CompletionRequest, CompletionResponse, TokenUsage},
};

const REFORMAT_NUDGE: &str = "Your last response was not valid JSON. Reply with JSON only, either \
{\"tool_call\": {\"name\": ..., \"arguments\": {...}}} or {\"final_answer\": \"...\"}.";

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Reformat requests allowed per turn before raw text is taken as the
    /// final answer.
    pub max_format_retries: usize,
    /// Declare tools natively on each request.
    pub native_tools: bool,
    #[serde(default, with = "optional_secs")]
    pub turn_timeout: Option<Duration>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            model: "openrouter/auto".to_string(),
            temperature: 0.2,
            max_tokens: 512,
            max_format_retries: 2,
            native_tools: true,
            turn_timeout: None,
        }
    }
}

impl DriverOptions {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

mod optional_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.map(Duration::from_secs_f64))
    }
}

/// Everything a finished run leaves behind for scoring and reporting.
#[derive(Debug, Clone, Serialize)]
pub struct DriverRun {
    pub scenario_id: String,
    pub variant: Variant,
    pub model: String,
    pub state: ScenarioState,
    pub history: ActionHistory,
    pub transcript: Vec<ChatMessage>,
    pub termination: Termination,
    pub usage: TokenUsage,
    pub model_turns: usize,
}

/// What the model asked for on one turn.
#[derive(Debug, Clone, PartialEq)]
enum ModelAction {
    Call { call: ToolCall, id: Option<String> },
    Final(String),
    Unparseable(String),
}

#[derive(Debug, Clone, PartialEq)]
enum DriverState {
    Init,
    AwaitingModel,
    ExecutingTool { call: ToolCall, id: Option<String> },
    Done(Termination),
}

pub struct ModelDriver {
    provider: Arc<dyn LLMProvider>,
    prompts: Arc<PromptSet>,
    options: DriverOptions,
}

impl ModelDriver {
    pub fn new(provider: Arc<dyn LLMProvider>, prompts: Arc<PromptSet>, options: DriverOptions) -> Self {
        Self {
            provider,
            prompts,
            options,
        }
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    pub async fn run(&self, spec: Arc<ScenarioSpec>, variant: Variant) -> Result<DriverRun, DriverError> {
        let mut runtime = ScenarioRuntime::new(spec.clone())?;
        let tools: Vec<Tool> = ToolKind::definitions().into_iter().map(Tool::from).collect();
        let mut transcript = Vec::new();
        let mut usage = TokenUsage::default();
        let mut model_turns = 0;
        let mut format_failures = 0;

        info!(scenario = %spec.id, %variant, model = %self.options.model, "run started");

        let mut state = DriverState::Init;
        let termination = loop {
            state = match state {
                DriverState::Init => {
                    transcript.push(ChatMessage::system(tool_preamble(&ToolKind::definitions())));
                    transcript.push(ChatMessage::system(self.prompts.render(variant, &spec)?));
                    transcript.push(ChatMessage::user(spec.user_prompt.clone()));
                    DriverState::AwaitingModel
                }
                DriverState::AwaitingModel => {
                    model_turns += 1;
                    let request = self.request(&transcript, &tools);
                    match self.complete(request).await {
                        Err(message) => {
                            warn!(scenario = %spec.id, %message, "model call failed");
                            DriverState::Done(Termination::ModelError { message })
                        }
                        Ok(response) => {
                            if let Some(turn) = &response.usage {
                                usage.accumulate(turn);
                            }
                            match parse_action(&response.message) {
                                ModelAction::Call { call, id } => {
                                    format_failures = 0;
                                    transcript.push(echo_call(response.message, id.as_deref()));
                                    DriverState::ExecutingTool { call, id }
                                }
                                ModelAction::Final(answer) => {
                                    transcript.push(response.message);
                                    DriverState::Done(Termination::Completed { final_answer: answer })
                                }
                                ModelAction::Unparseable(text) if format_failures < self.options.max_format_retries => {
                                    format_failures += 1;
                                    warn!(scenario = %spec.id, attempt = format_failures, "response was not valid JSON; requesting reformat");
                                    transcript.push(ChatMessage::assistant(text));
                                    transcript.push(ChatMessage::user(REFORMAT_NUDGE));
                                    DriverState::AwaitingModel
                                }
                                ModelAction::Unparseable(text) => {
                                    transcript.push(ChatMessage::assistant(text.clone()));
                                    DriverState::Done(Termination::Completed {
                                        final_answer: text.trim().to_string(),
                                    })
                                }
                            }
                        }
                    }
                }
                DriverState::ExecutingTool { call, id } => match runtime.apply(call) {
                    Ok(result) => {
                        transcript.push(observation(&result, id, runtime.state().steps())?);
                        DriverState::AwaitingModel
                    }
                    Err(RuntimeError::StepBudgetExceeded { budget }) => {
                        debug!(scenario = %spec.id, budget, "step budget exhausted");
                        DriverState::Done(Termination::BudgetExceeded { budget })
                    }
                },
                DriverState::Done(termination) => break termination,
            };
        };

        info!(
            scenario = %spec.id,
            %variant,
            outcome = termination.label(),
            steps = runtime.state().steps(),
            "run finished"
        );

        let (state, history) = runtime.into_parts();
        Ok(DriverRun {
            scenario_id: spec.id.clone(),
            variant,
            model: self.options.model.clone(),
            state,
            history,
            transcript,
            termination,
            usage,
            model_turns,
        })
    }

    fn request(&self, transcript: &[ChatMessage], tools: &[Tool]) -> CompletionRequest {
        let mut request = CompletionRequest::new(self.options.model.clone(), transcript.to_vec())
            .with_temperature(self.options.temperature)
            .with_max_tokens(self.options.max_tokens);
        if self.options.native_tools {
            request = request
                .with_tools(tools.iter().cloned())
                .with_tool_choice(ToolChoice::Auto);
        }
        if self.options.model.starts_with("openai/") {
            request = request.with_response_format(serde_json::json!({ "type": "json_object" }));
        }
        request
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, String> {
        let call = self.provider.complete(request);
        let outcome = match self.options.turn_timeout {
            Some(limit) => time::timeout(limit, call)
                .await
                .map_err(|_| format!("model call timed out after {}s", limit.as_secs_f64()))?,
            None => call.await,
        };
        outcome.map_err(|err| err.to_string())
    }
}

/// The assistant message kept in the transcript: native turns keep only the
/// call that was executed.
fn echo_call(mut message: ChatMessage, id: Option<&str>) -> ChatMessage {
    if message.tool_calls.is_empty() {
        return message;
    }
    message.tool_calls.truncate(1);
    if let (Some(first), Some(id)) = (message.tool_calls.first_mut(), id) {
        first.id = Some(id.to_string());
    }
    message
}

fn observation(result: &ToolResult, id: Option<String>, step: usize) -> Result<ChatMessage, serde_json::Error> {
    match id {
        Some(id) => Ok(ChatMessage::tool(id, serde_json::to_string(result)?)),
        None => {
            let body = serde_json::json!({ "tool_result": serde_json::to_value(result)?, "step": step });
            Ok(ChatMessage::user(body.to_string()))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope {
    Call { tool_call: RawCall },
    Final { final_answer: Value },
}

#[derive(Debug, Deserialize)]
struct RawCall {
    // Nameless calls still reach the runtime and are recorded as unknown tools.
    #[serde(default, alias = "tool", alias = "function")]
    name: String,
    #[serde(default, alias = "args", alias = "parameters")]
    arguments: Value,
}

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap());

fn parse_action(message: &ChatMessage) -> ModelAction {
    if let Some(first) = message.tool_calls.first() {
        let id = first
            .id
            .clone()
            .unwrap_or_else(|| format!("call-{}", first.function.name));
        return ModelAction::Call {
            call: ToolCall::new(first.function.name.clone(), first.function.arguments.clone()),
            id: Some(id),
        };
    }

    let text = message.text().unwrap_or_default();
    match parse_envelope(text) {
        Some(Envelope::Call { tool_call }) => ModelAction::Call {
            call: ToolCall::new(tool_call.name, normalize_arguments(tool_call.arguments)),
            id: None,
        },
        Some(Envelope::Final { final_answer }) => ModelAction::Final(match final_answer {
            Value::String(answer) => answer,
            other => other.to_string(),
        }),
        None => ModelAction::Unparseable(text.to_string()),
    }
}

fn parse_envelope(content: &str) -> Option<Envelope> {
    let trimmed = content.trim();
    if let Some(envelope) = decode_envelope(trimmed) {
        return Some(envelope);
    }

    if let Some(body) = FENCED_JSON.captures(trimmed).and_then(|caps| caps.get(1)) {
        if let Some(envelope) = decode_envelope(body.as_str()) {
            return Some(envelope);
        }
    }

    extract_json_objects(trimmed).into_iter().find_map(decode_envelope)
}

// `{"final_answer": null}` is not an answer.
fn decode_envelope(candidate: &str) -> Option<Envelope> {
    match serde_json::from_str::<Envelope>(candidate).ok()? {
        Envelope::Final {
            final_answer: Value::Null,
        } => None,
        envelope => Some(envelope),
    }
}

/// Top-level `{...}` spans in mixed text, honouring quoted strings.
fn extract_json_objects(content: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut start = None;
    let mut depth: usize = 0;
    let mut in_str = false;
    let mut escaped = false;

    for (i, b) in content.bytes().enumerate() {
        if in_str {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_str = false;
            }
            continue;
        }
        match b {
            b'"' if depth > 0 => in_str = true,
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        spans.push(&content[s..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    spans
}

// Some models double-encode the arguments object as a string.
fn normalize_arguments(arguments: Value) -> Value {
    match arguments {
        Value::Null => Value::Object(Default::default()),
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(parsed @ Value::Object(_)) => parsed,
            _ => Value::String(raw),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ToolError,
        functions::{AssistantToolCall, FunctionCall},
        providers::scripted::ScriptedProvider,
        sim::TicketStatus,
    };
    use serde_json::json;

    fn spec(max_steps: usize) -> Arc<ScenarioSpec> {
        let yaml = format!(
            r#"
id: error-spike
user_prompt: Checkout is throwing errors, please fix.
service: checkout
primary_metric: error_rate
initial_replicas: 2
max_replicas: 10
max_steps: {max_steps}
metrics:
  error_rate:
    initial: 0.12
    thresholds: {{ good: 0.02, concerning: 0.05 }}
    curve: {{ kind: inverse_power, floor: 0.006, exponent: 2.0 }}
"#
        );
        Arc::new(serde_yaml::from_str(&yaml).unwrap())
    }

    fn driver(provider: Arc<ScriptedProvider>) -> ModelDriver {
        ModelDriver::new(provider, Arc::new(PromptSet::default()), DriverOptions::default())
    }

    #[test]
    fn parses_raw_fenced_and_mixed_json() {
        let raw = ChatMessage::assistant(r#"{"tool_call": {"name": "k8s_scale", "arguments": {"target_replicas": 6}}}"#);
        assert_eq!(
            parse_action(&raw),
            ModelAction::Call {
                call: ToolCall::new("k8s_scale", json!({"target_replicas": 6})),
                id: None
            }
        );

        let fenced = ChatMessage::assistant("Sure.\n```json\n{\"final_answer\": \"scaled\"}\n```");
        assert_eq!(parse_action(&fenced), ModelAction::Final("scaled".into()));

        let mixed = ChatMessage::assistant(
            r#"I'll check first {"tool_call": {"name": "metrics_query", "arguments": "{\"metric_name\": \"error_rate\"}"}} then decide"#,
        );
        assert_eq!(
            parse_action(&mixed),
            ModelAction::Call {
                call: ToolCall::new("metrics_query", json!({"metric_name": "error_rate"})),
                id: None
            }
        );

        let prose = ChatMessage::assistant("I think we should scale up.");
        assert_eq!(parse_action(&prose), ModelAction::Unparseable("I think we should scale up.".into()));
    }

    #[test]
    fn null_or_missing_final_answer_is_unparseable() {
        let null = ChatMessage::assistant(r#"{"final_answer": null}"#);
        assert_eq!(parse_action(&null), ModelAction::Unparseable(r#"{"final_answer": null}"#.into()));

        let other = ChatMessage::assistant(r#"{"answer": "done"}"#);
        assert_eq!(parse_action(&other), ModelAction::Unparseable(r#"{"answer": "done"}"#.into()));
    }

    #[tokio::test]
    async fn nameless_tool_call_is_recorded_as_unknown_tool() {
        let provider = Arc::new(ScriptedProvider::from_texts([
            r#"{"tool_call": {"arguments": {"target_replicas": 6}}}"#,
            r#"{"final_answer": "gave up"}"#,
        ]));
        let run = driver(provider).run(spec(6), Variant::Baseline).await.unwrap();

        assert_eq!(
            run.termination,
            Termination::Completed {
                final_answer: "gave up".into()
            }
        );
        assert_eq!(run.history.len(), 1);
        let record = &run.history.records()[0];
        assert!(!record.succeeded());
        assert!(matches!(record.error, Some(ToolError::UnknownTool { .. })));
        assert_eq!(run.state.replicas(), 2);
    }

    #[tokio::test]
    async fn text_protocol_run_resolves_incident() {
        let provider = Arc::new(ScriptedProvider::from_texts([
            r#"{"tool_call": {"name": "metrics_query", "arguments": {"metric_name": "error_rate"}}}"#,
            r#"{"tool_call": {"name": "k8s_scale", "arguments": {"target_replicas": 6}}}"#,
            r#"{"tool_call": {"name": "ticket_update", "arguments": {"status": "resolved"}}}"#,
            r#"{"tool_call": {"name": "incident_log", "arguments": {"message": "scaled to 6, closed"}}}"#,
            r#"{"final_answer": "error rate back to normal"}"#,
        ]));
        let run = driver(provider.clone()).run(spec(6), Variant::Baseline).await.unwrap();

        assert_eq!(
            run.termination,
            Termination::Completed {
                final_answer: "error rate back to normal".into()
            }
        );
        assert_eq!(run.history.len(), 4);
        assert_eq!(run.state.replicas(), 6);
        assert_eq!(run.state.ticket().status, TicketStatus::Resolved);
        assert_eq!(run.model_turns, 5);

        let requests = provider.requests();
        assert_eq!(requests[0].messages.len(), 3);
        assert_eq!(requests[0].temperature, Some(0.2));
        assert_eq!(requests[0].max_tokens, Some(512));
        assert_eq!(requests[0].tools.len(), 4);
        assert!(requests[0].response_format.is_none());
        let observation = requests[1].messages.last().unwrap().text().unwrap();
        assert!(observation.contains("\"tool_result\""));
        assert!(observation.contains("critical"));
    }

    #[tokio::test]
    async fn native_turn_executes_only_first_call() {
        let calls = vec![
            AssistantToolCall::new(FunctionCall::new("k8s_scale", json!({"target_replicas": 6}))).with_id("a"),
            AssistantToolCall::new(FunctionCall::new("ticket_update", json!({"status": "resolved"}))).with_id("b"),
        ];
        let provider = Arc::new(ScriptedProvider::new([
            ChatMessage::assistant("").with_tool_calls(calls),
            ChatMessage::assistant(r#"{"final_answer": "done"}"#),
        ]));
        let run = driver(provider.clone()).run(spec(6), Variant::Improved).await.unwrap();

        assert_eq!(run.history.len(), 1);
        assert_eq!(run.state.ticket().status, TicketStatus::Open);
        let second = &provider.requests()[1].messages;
        let echoed = &second[second.len() - 2];
        assert_eq!(echoed.tool_calls.len(), 1);
        let reply = &second[second.len() - 1];
        assert_eq!(reply.tool_call_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn nudges_then_accepts_text_as_final() {
        let provider = Arc::new(ScriptedProvider::from_texts(["hmm", "let me think", "All fixed."]));
        let run = driver(provider.clone()).run(spec(6), Variant::Baseline).await.unwrap();

        assert_eq!(
            run.termination,
            Termination::Completed {
                final_answer: "All fixed.".into()
            }
        );
        assert_eq!(provider.requests().len(), 3);
        let last_request = &provider.requests()[2].messages;
        assert_eq!(last_request.last().unwrap().text(), Some(REFORMAT_NUDGE));
    }

    #[tokio::test]
    async fn provider_failure_is_model_error() {
        let provider = Arc::new(ScriptedProvider::from_texts(Vec::<String>::new()));
        let run = driver(provider).run(spec(6), Variant::Baseline).await.unwrap();
        assert!(run.termination.is_model_error());
        assert!(run.history.is_empty());
    }

    #[tokio::test]
    async fn budget_exhaustion_ends_run() {
        let call = r#"{"tool_call": {"name": "metrics_query", "arguments": {"metric_name": "error_rate"}}}"#;
        let provider = Arc::new(ScriptedProvider::from_texts([call, call, call]));
        let run = driver(provider).run(spec(2), Variant::Baseline).await.unwrap();
        assert_eq!(run.termination, Termination::BudgetExceeded { budget: 2 });
        assert_eq!(run.history.len(), 2);
    }

    #[tokio::test]
    async fn openai_models_request_json_output() {
        let provider = Arc::new(ScriptedProvider::from_texts([r#"{"final_answer": "nothing to do"}"#]));
        let options = DriverOptions::default().with_model("openai/gpt-4o-mini");
        ModelDriver::new(provider.clone(), Arc::new(PromptSet::default()), options)
            .run(spec(6), Variant::Baseline)
            .await
            .unwrap();
        assert_eq!(
            provider.requests()[0].response_format,
            Some(json!({"type": "json_object"}))
        );
    }
}
