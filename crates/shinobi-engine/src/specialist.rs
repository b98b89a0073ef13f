//! The per-specialist tool-calling loop.
//!
//! ```text
//! Start -> AwaitingModel -> (ToolRequested -> ToolExecuting -> AwaitingModel)*
//!       -> Complete | Failed | HumanInputRequired
//! ```
//!
//! Turns are strictly sequential. Capability failures are reported back to
//! the model as error results; only a run of consecutive failures, or the
//! turn cap, ends the loop in `Failed`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use shinobi_core::capability::{CapabilityContext, CapabilityError};
use shinobi_core::errors::GatewayError;
use shinobi_core::events::RuntimeEvent;
use shinobi_core::gateway::{CompletionRequest, GenerationParams, StopReason, SystemBlock};
use shinobi_core::ids::{AgentId, RunId};
use shinobi_core::messages::{Message, ToolCallBlock};
use shinobi_core::result::{ExecutionResult, ToolInvocation};
use shinobi_core::usage::{Usage, UsageSource};

use crate::error::EngineError;
use crate::graph::module::value_text;
use crate::graph::ThoughtGraph;
use crate::registry::CapabilityRegistry;
use crate::runtime::Runtime;
use crate::truncate::truncate_output;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpecialistConfig {
    pub model: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Names resolved against the runtime's capability registry.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Name of a reasoning graph registered on the runtime. Its output is
    /// added to the system context before the first turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_module: Option<String>,
    #[serde(default)]
    pub requires_human_input: bool,
    #[serde(default)]
    pub params: GenerationParams,
    /// Overrides `specialist.maxTurns` from settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
}

impl SpecialistConfig {
    pub fn new(title: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            title: title.into(),
            description: String::new(),
            capabilities: Vec::new(),
            reasoning_module: None,
            requires_human_input: false,
            params: GenerationParams::default(),
            max_turns: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_capabilities<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(names.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_reasoning_module(mut self, name: impl Into<String>) -> Self {
        self.reasoning_module = Some(name.into());
        self
    }

    #[must_use]
    pub fn requiring_human_input(mut self) -> Self {
        self.requires_human_input = true;
        self
    }

    #[must_use]
    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = Some(max_turns);
        self
    }
}

/// A run paused at `HumanInputRequired`. Hand it back to
/// [`Specialist::resume`] together with the human's answer.
#[derive(Clone, Debug)]
pub struct SuspendedRun {
    pub run_id: RunId,
    pub question: String,
    conversation: Vec<Message>,
    system: Vec<SystemBlock>,
    usage: Usage,
    invocations: Vec<ToolInvocation>,
    turns: u32,
    consecutive_failures: u32,
    elapsed: Duration,
}

impl SuspendedRun {
    pub fn turns(&self) -> u32 {
        self.turns
    }

    pub fn conversation(&self) -> &[Message] {
        &self.conversation
    }
}

impl UsageSource for SuspendedRun {
    fn usage(&self) -> Usage {
        self.usage
    }
}

#[derive(Clone, Debug)]
pub enum SpecialistOutcome {
    Complete(ExecutionResult),
    Failed { reason: String, result: ExecutionResult },
    /// A pause, not an error.
    HumanInputRequired { question: String, suspended: SuspendedRun },
}

impl SpecialistOutcome {
    pub fn status_name(&self) -> &'static str {
        match self {
            Self::Complete(_) => "complete",
            Self::Failed { .. } => "failed",
            Self::HumanInputRequired { .. } => "human_input_required",
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    /// Collapse to a result, treating anything but `Complete` as an error
    /// attributed to `specialist`.
    pub fn into_result(self, specialist: &str) -> Result<ExecutionResult, EngineError> {
        match self {
            Self::Complete(result) => Ok(result),
            Self::Failed { reason, .. } => Err(EngineError::SpecialistFailed {
                specialist: specialist.to_string(),
                reason,
            }),
            Self::HumanInputRequired { question, .. } => Err(EngineError::HumanInputRequired {
                specialist: specialist.to_string(),
                question,
            }),
        }
    }
}

impl UsageSource for SpecialistOutcome {
    fn usage(&self) -> Usage {
        match self {
            Self::Complete(result) | Self::Failed { result, .. } => result.usage,
            Self::HumanInputRequired { suspended, .. } => suspended.usage,
        }
    }
}

/// Mutable state of one run. Owned by the loop, never shared.
struct RunState {
    run_id: RunId,
    system: Vec<SystemBlock>,
    conversation: Vec<Message>,
    usage: Usage,
    invocations: Vec<ToolInvocation>,
    turns: u32,
    consecutive_failures: u32,
    started: Instant,
    carried: Duration,
}

impl RunState {
    fn elapsed(&self) -> Duration {
        self.carried + self.started.elapsed()
    }

    fn into_result(self, output: String) -> ExecutionResult {
        ExecutionResult {
            output,
            usage: self.usage,
            duration: self.elapsed(),
            invocations: self.invocations,
            turns: self.turns,
        }
    }

    fn suspend(self, question: String) -> SuspendedRun {
        let elapsed = self.elapsed();
        SuspendedRun {
            run_id: self.run_id,
            question,
            conversation: self.conversation,
            system: self.system,
            usage: self.usage,
            invocations: self.invocations,
            turns: self.turns,
            consecutive_failures: self.consecutive_failures,
            elapsed,
        }
    }
}

/// A specialist bound to its resolved capability subset.
pub struct Specialist {
    config: SpecialistConfig,
    runtime: Runtime,
    toolset: CapabilityRegistry,
    reasoner: Option<Arc<ThoughtGraph>>,
    persona: Vec<SystemBlock>,
    agent_id: AgentId,
}

impl Specialist {
    /// Resolve capability and reasoner references. Unknown or repeated
    /// capability names are rejected here, before any run.
    pub fn new(config: SpecialistConfig, runtime: &Runtime) -> Result<Self, EngineError> {
        let toolset = runtime.capabilities().subset(&config.capabilities)?;
        let reasoner = match &config.reasoning_module {
            Some(name) => Some(runtime.reasoner(name).ok_or_else(|| {
                EngineError::invalid(format!(
                    "specialist '{}' references unknown reasoning module '{name}'",
                    config.title
                ))
            })?),
            None => None,
        };
        Ok(Self {
            config,
            runtime: runtime.clone(),
            toolset,
            reasoner,
            persona: Vec::new(),
            agent_id: AgentId::new(),
        })
    }

    /// Shared system context placed ahead of the specialist's own.
    #[must_use]
    pub fn with_persona(mut self, persona: Vec<SystemBlock>) -> Self {
        self.persona = persona;
        self
    }

    pub fn config(&self) -> &SpecialistConfig {
        &self.config
    }

    pub fn title(&self) -> &str {
        &self.config.title
    }

    fn max_turns(&self) -> u32 {
        self.config
            .max_turns
            .unwrap_or(self.runtime.settings().specialist.max_turns)
            .max(1)
    }

    /// Run the loop for `query` until it completes, fails or pauses.
    #[instrument(skip_all, fields(specialist = %self.config.title, model = %self.config.model))]
    pub async fn run(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<SpecialistOutcome, EngineError> {
        let mut state = RunState {
            run_id: RunId::new(),
            system: self.persona.clone(),
            conversation: vec![Message::user_text(query)],
            usage: Usage::default(),
            invocations: Vec::new(),
            turns: 0,
            consecutive_failures: 0,
            started: Instant::now(),
            carried: Duration::ZERO,
        };
        state.system.push(SystemBlock::new("specialist", self.role_text()));

        if let Some(graph) = &self.reasoner {
            let reasoning = graph.run(state.run_id.as_str(), query, cancel).await?;
            state.usage += reasoning.usage;
            state.system.push(SystemBlock::new("reasoning", reasoning.output_text()));
        }

        let _ = self.runtime.events().emit(RuntimeEvent::SpecialistStarted {
            run_id: state.run_id.clone(),
            agent_id: self.agent_id.clone(),
            specialist: self.config.title.clone(),
        });
        info!(run_id = %state.run_id, "specialist started");
        self.drive(state, cancel).await
    }

    /// Continue a paused run with the human's `input`. Turn count, failure
    /// streak and usage carry over.
    #[instrument(skip_all, fields(specialist = %self.config.title, run_id = %suspended.run_id))]
    pub async fn resume(
        &self,
        suspended: SuspendedRun,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<SpecialistOutcome, EngineError> {
        let mut conversation = suspended.conversation;
        conversation.push(Message::user_text(input));
        let state = RunState {
            run_id: suspended.run_id,
            system: suspended.system,
            conversation,
            usage: suspended.usage,
            invocations: suspended.invocations,
            turns: suspended.turns,
            consecutive_failures: suspended.consecutive_failures,
            started: Instant::now(),
            carried: suspended.elapsed,
        };
        self.drive(state, cancel).await
    }

    /// Convenience: run and require `Complete`.
    pub async fn execute(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, EngineError> {
        self.run(query, cancel).await?.into_result(&self.config.title)
    }

    fn role_text(&self) -> String {
        if self.config.description.is_empty() {
            format!("You are {}.", self.config.title)
        } else {
            format!("You are {}. {}", self.config.title, self.config.description)
        }
    }

    fn request(&self, state: &RunState) -> CompletionRequest {
        CompletionRequest {
            model: self.config.model.clone(),
            system: state.system.clone(),
            messages: state.conversation.clone(),
            capabilities: self.toolset.definitions(),
            params: self.config.params.clone(),
        }
    }

    async fn drive(
        &self,
        mut state: RunState,
        cancel: &CancellationToken,
    ) -> Result<SpecialistOutcome, EngineError> {
        let run_id = state.run_id.clone();
        let max_turns = self.max_turns();
        let max_failures = self.runtime.settings().specialist.max_consecutive_failures.max(1);

        let outcome = loop {
            if cancel.is_cancelled() {
                self.finished(&state, "cancelled");
                return Err(EngineError::Cancelled.with_usage(state.usage));
            }
            if state.turns >= max_turns {
                warn!(max_turns, "specialist reached turn limit");
                let reason = format!("turn limit of {max_turns} reached");
                break SpecialistOutcome::Failed {
                    reason,
                    result: state.into_result(String::new()),
                };
            }

            state.turns += 1;
            counter!("specialist_turns_total").increment(1);
            let _ = self.runtime.events().emit(RuntimeEvent::TurnStarted {
                run_id: state.run_id.clone(),
                turn: state.turns,
            });

            let request = self.request(&state);
            let completion = match self.runtime.gateway().complete(&request, cancel).await {
                Ok(completion) => completion,
                Err(e) => {
                    // The failed call's own cost is unknown.
                    let spent = state.usage + Usage::from_call(None, None);
                    if matches!(e, GatewayError::Cancelled) {
                        self.finished(&state, "cancelled");
                        return Err(EngineError::Cancelled.with_usage(spent));
                    }
                    warn!(turn = state.turns, error = %e, kind = e.error_kind(), "gateway call failed");
                    self.finished(&state, "error");
                    return Err(EngineError::Gateway(e).with_usage(spent));
                }
            };
            state.usage += self.runtime.prices().usage_for(&self.config.model, completion.usage);
            state
                .conversation
                .push(Message::Assistant(completion.to_assistant_message()));

            if completion.has_tool_calls() {
                debug!(turn = state.turns, calls = completion.tool_calls.len(), "tools requested");
                for call in &completion.tool_calls {
                    self.execute_call(&mut state, call, cancel).await?;
                    if state.consecutive_failures >= max_failures {
                        break;
                    }
                }
                if state.consecutive_failures >= max_failures {
                    warn!(failures = state.consecutive_failures, "too many consecutive capability failures");
                    let reason = format!("{} consecutive capability failures", state.consecutive_failures);
                    break SpecialistOutcome::Failed {
                        reason,
                        result: state.into_result(String::new()),
                    };
                }
                continue;
            }

            let content = completion.content.unwrap_or_default();
            if completion.stop_reason == StopReason::InputRequired && self.config.requires_human_input {
                info!(turn = state.turns, "specialist paused for human input");
                let suspended = state.suspend(content.clone());
                break SpecialistOutcome::HumanInputRequired {
                    question: content,
                    suspended,
                };
            }
            break SpecialistOutcome::Complete(state.into_result(content));
        };

        let turns = match &outcome {
            SpecialistOutcome::Complete(r) | SpecialistOutcome::Failed { result: r, .. } => r.turns,
            SpecialistOutcome::HumanInputRequired { suspended, .. } => suspended.turns,
        };
        let _ = self.runtime.events().emit(RuntimeEvent::SpecialistFinished {
            run_id,
            specialist: self.config.title.clone(),
            status: outcome.status_name().to_string(),
            turns,
        });
        info!(status = outcome.status_name(), turns, "specialist finished");
        Ok(outcome)
    }

    fn finished(&self, state: &RunState, status: &str) {
        let _ = self.runtime.events().emit(RuntimeEvent::SpecialistFinished {
            run_id: state.run_id.clone(),
            specialist: self.config.title.clone(),
            status: status.to_string(),
            turns: state.turns,
        });
    }

    /// Validate and invoke one requested capability, appending its result
    /// (or structured error) to the conversation.
    async fn execute_call(
        &self,
        state: &mut RunState,
        call: &ToolCallBlock,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let ctx = CapabilityContext {
            run_id: state.run_id.clone(),
            agent_id: self.agent_id.clone(),
            call_id: call.id.clone(),
            cancel: cancel.child_token(),
        };
        let _ = self.runtime.events().emit(RuntimeEvent::CapabilityStarted {
            run_id: state.run_id.clone(),
            call_id: call.id.clone(),
            capability: call.name.clone(),
        });

        let timeout = self.runtime.settings().specialist.capability_timeout();
        let dispatch = self.toolset.dispatch(call, &ctx, timeout).await;
        let max_bytes = self.runtime.settings().specialist.max_tool_output_bytes;

        let (output, content, error_kind) = match dispatch.outcome {
            Ok(value) => {
                state.consecutive_failures = 0;
                let content = truncate_output(&value_text(&value), max_bytes);
                (value, content, None)
            }
            Err(CapabilityError::Cancelled) if cancel.is_cancelled() => {
                self.finished(state, "cancelled");
                return Err(EngineError::Cancelled.with_usage(state.usage));
            }
            Err(e) => {
                state.consecutive_failures += 1;
                debug!(capability = %call.name, kind = e.kind(), error = %e, "capability error returned to model");
                let payload = e.to_payload();
                let content = payload.to_string();
                (payload, content, Some(e.kind().to_string()))
            }
        };
        let is_error = error_kind.is_some();

        let _ = self.runtime.events().emit(RuntimeEvent::CapabilityFinished {
            run_id: state.run_id.clone(),
            call_id: call.id.clone(),
            capability: call.name.clone(),
            is_error,
            duration: dispatch.duration,
        });
        state.conversation.push(Message::tool_result(call, content, is_error));
        state.invocations.push(ToolInvocation {
            call_id: call.id.clone(),
            capability: call.name.clone(),
            input: call.arguments.clone(),
            output,
            is_error,
            error_kind,
            duration: dispatch.duration,
            turn: state.turns,
        });
        Ok(())
    }
}
