use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::ids::{AgentId, RunId, ToolCallId};
use crate::shape::{InputShape, ValidatedInput, ValidationErrors};

/// What the model sees for each capability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDefinition {
    pub name: String,
    pub description: String,
    pub input_shape: InputShape,
}

/// Context handed to a capability for one invocation.
#[derive(Clone, Debug)]
pub struct CapabilityContext {
    pub run_id: RunId,
    pub agent_id: AgentId,
    pub call_id: ToolCallId,
    pub cancel: CancellationToken,
}

impl CapabilityContext {
    /// A detached context, for direct calls outside a Specialist run.
    pub fn detached() -> Self {
        Self {
            run_id: RunId::new(),
            agent_id: AgentId::new(),
            call_id: ToolCallId::new(),
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum CapabilityError {
    /// Input failed its shape check; the implementation was never reached.
    #[error("invalid input: {0}")]
    Validation(ValidationErrors),
    /// The implementation itself failed.
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("unknown capability: {0}")]
    Unknown(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl CapabilityError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Execution(_) => "execution",
            Self::Unknown(_) => "unknown_capability",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Structured error body surfaced to the model as tool-turn content.
    pub fn to_payload(&self) -> Value {
        let mut body = serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        if let Self::Validation(errors) = self {
            body["details"] = serde_json::to_value(&errors.errors).unwrap_or(Value::Null);
        }
        serde_json::json!({ "error": body })
    }
}

/// A named, shape-checked function offered to the model.
///
/// `invoke` only accepts [`ValidatedInput`], so every call is preceded by a
/// successful [`Capability::validate`].
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_shape(&self) -> &InputShape;

    async fn invoke(
        &self,
        input: ValidatedInput,
        ctx: &CapabilityContext,
    ) -> Result<Value, CapabilityError>;

    fn validate(&self, input: &Value) -> Result<ValidatedInput, CapabilityError> {
        self.input_shape()
            .validate(input)
            .map_err(CapabilityError::Validation)
    }

    fn describe(&self) -> CapabilityDefinition {
        CapabilityDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_shape: self.input_shape().clone(),
        }
    }
}

type BoxedHandler = Arc<
    dyn Fn(Value, CapabilityContext) -> Pin<Box<dyn Future<Output = Result<Value, CapabilityError>> + Send>>
        + Send
        + Sync,
>;

/// Immutable capability built from a name, a shape and an async function.
#[derive(Clone)]
pub struct CapabilityDescriptor {
    name: String,
    description: String,
    input_shape: InputShape,
    handler: BoxedHandler,
}

impl CapabilityDescriptor {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_shape: InputShape,
        handler: F,
    ) -> Self
    where
        F: Fn(Value, CapabilityContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CapabilityError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_shape,
            handler: Arc::new(move |input, ctx| Box::pin(handler(input, ctx))),
        }
    }
}

impl std::fmt::Debug for CapabilityDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Capability for CapabilityDescriptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_shape(&self) -> &InputShape {
        &self.input_shape
    }

    async fn invoke(
        &self,
        input: ValidatedInput,
        ctx: &CapabilityContext,
    ) -> Result<Value, CapabilityError> {
        (self.handler)(input.into_inner(), ctx.clone()).await
    }
}
