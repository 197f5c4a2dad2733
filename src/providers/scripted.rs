use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;

use crate::{
    error::LLMError,
    functions::{AssistantToolCall, FunctionCall},
    providers::LLMProvider,
    sim::ToolCall,
    types::{ChatMessage, CompletionRequest, CompletionResponse},
};

/// Replays a fixed list of assistant messages, one per request. Used for the
/// ground-truth variant and in tests.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<ChatMessage>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: impl IntoIterator<Item = ChatMessage>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Plain-text replies, parsed by the driver like any model output.
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(ChatMessage::assistant))
    }

    /// One native tool call per turn, followed by a final answer.
    pub fn from_ground_truth(calls: &[ToolCall]) -> Self {
        let mut responses: Vec<ChatMessage> = calls
            .iter()
            .enumerate()
            .map(|(index, call)| {
                let tool_call = AssistantToolCall::new(FunctionCall::new(call.name.clone(), call.arguments.clone()))
                    .with_id(format!("ground-truth-{}", index + 1));
                ChatMessage {
                    content: None,
                    ..ChatMessage::assistant("")
                }
                .with_tool_calls(vec![tool_call])
            })
            .collect();
        responses.push(ChatMessage::assistant(
            r#"{"final_answer": "ground truth sequence replayed"}"#,
        ));
        Self::new(responses)
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|r| r.len()).unwrap_or_default()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let next = self
            .responses
            .lock()
            .map_err(|_| LLMError::Provider("scripted provider lock poisoned".to_string()))?
            .pop_front();
        match next {
            Some(message) => Ok(CompletionResponse { message, usage: None }),
            None => Err(LLMError::Provider("no more scripted responses".to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
