use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::capability::CapabilityDefinition;
use crate::errors::GatewayError;
use crate::messages::{AssistantMessage, Message, ToolCallBlock};
use crate::usage::TokenUsage;

/// Generation parameters forwarded to the provider unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub temperature: Option<f64>,
    pub max_output_tokens: Option<u32>,
    pub stop_sequences: Vec<String>,
}

/// A labelled fragment of system context (persona, role, synthesis instructions).
/// The runtime never parses the content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemBlock {
    pub label: String,
    pub content: String,
}

impl SystemBlock {
    pub fn new(label: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            content: content.into(),
        }
    }
}

/// Everything sent to the gateway for one model call.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub system: Vec<SystemBlock>,
    pub messages: Vec<Message>,
    pub capabilities: Vec<CapabilityDefinition>,
    pub params: GenerationParams,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: Vec::new(),
            messages: Vec::new(),
            capabilities: Vec::new(),
            params: GenerationParams::default(),
        }
    }

    /// Text of the most recent user message, if any.
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|m| match m {
            Message::User(u) => Some(u.text.as_str()),
            _ => None,
        })
    }

    /// Concatenated system context, one block per paragraph.
    pub fn system_text(&self) -> String {
        self.system
            .iter()
            .map(|b| b.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    /// The model asked for information only a human can supply.
    InputRequired,
}

/// One gateway response: content, tool call requests, or both.
#[derive(Clone, Debug, PartialEq)]
pub struct Completion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallBlock>,
    pub stop_reason: StopReason,
    /// `None` when the provider reported no usage for this call.
    pub usage: Option<TokenUsage>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            tool_calls: Vec::new(),
            stop_reason: StopReason::EndTurn,
            usage: None,
        }
    }

    pub fn tool_calls(calls: Vec<ToolCallBlock>) -> Self {
        Self {
            content: None,
            tool_calls: calls,
            stop_reason: StopReason::ToolUse,
            usage: None,
        }
    }

    pub fn input_required(question: impl Into<String>) -> Self {
        Self {
            content: Some(question.into()),
            tool_calls: Vec::new(),
            stop_reason: StopReason::InputRequired,
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// The assistant turn to append to the conversation.
    pub fn to_assistant_message(&self) -> AssistantMessage {
        AssistantMessage {
            text: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
        }
    }
}

/// Abstract request/response boundary to a language model provider.
///
/// Every call is a suspension point and receives the caller's cancellation
/// token. Implementations should return [`GatewayError::Cancelled`] promptly
/// once the token fires.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, GatewayError>;

    async fn embed(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, GatewayError>;
}

#[async_trait]
impl<T: ModelGateway + ?Sized> ModelGateway for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, GatewayError> {
        (**self).complete(request, cancel).await
    }

    async fn embed(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, GatewayError> {
        (**self).embed(text, cancel).await
    }
}
