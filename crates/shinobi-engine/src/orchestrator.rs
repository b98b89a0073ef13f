use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use shinobi_core::gateway::SystemBlock;
use shinobi_core::result::ExecutionResult;
use shinobi_core::usage::{Usage, UsageSource};

use crate::error::EngineError;
use crate::runtime::Runtime;
use crate::specialist::{Specialist, SpecialistConfig};
use crate::synthesis::{compose, synthesize, Section};

/// What happens when one specialist does not complete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop and surface the failure.
    #[default]
    Abort,
    /// Record the failure and go on with the remaining specialists.
    Continue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub role: String,
    #[serde(default)]
    pub description: String,
    /// Opaque persona text, passed through to the system context.
    #[serde(default)]
    pub backstory: String,
    pub specialists: Vec<SpecialistConfig>,
    /// Capabilities every specialist gets in addition to its own.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Model for the synthesis pass. Defaults to the first specialist's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis_model: Option<String>,
}

impl OrchestratorConfig {
    pub fn new(role: impl Into<String>, specialists: Vec<SpecialistConfig>) -> Self {
        Self {
            role: role.into(),
            description: String::new(),
            backstory: String::new(),
            specialists,
            capabilities: Vec::new(),
            failure_policy: FailurePolicy::default(),
            synthesis_model: None,
        }
    }

    #[must_use]
    pub fn with_backstory(mut self, backstory: impl Into<String>) -> Self {
        self.backstory = backstory.into();
        self
    }

    #[must_use]
    pub fn with_shared_capabilities<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(names.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    fn persona(&self) -> Vec<SystemBlock> {
        [
            ("role", format!("Role: {}", self.role)),
            ("description", self.description.clone()),
            ("backstory", self.backstory.clone()),
        ]
        .into_iter()
        .filter(|(_, text)| !text.is_empty())
        .map(|(label, text)| SystemBlock::new(label, text))
        .collect()
    }

    /// The specialist's own capabilities plus the shared ones, first
    /// occurrence wins.
    fn merged_capabilities(&self, specialist: &SpecialistConfig) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in specialist.capabilities.iter().chain(&self.capabilities) {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

#[derive(Clone, Debug)]
pub struct SpecialistReport {
    pub title: String,
    pub result: ExecutionResult,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecialistFailure {
    pub title: String,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct OrchestratorResult {
    pub role: String,
    pub final_answer: String,
    pub specialist_results: Vec<SpecialistReport>,
    /// Only populated under [`FailurePolicy::Continue`].
    pub failures: Vec<SpecialistFailure>,
    pub usage: Usage,
    pub duration: Duration,
}

impl UsageSource for OrchestratorResult {
    fn usage(&self) -> Usage {
        self.usage
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    runtime: Runtime,
    specialists: Vec<Specialist>,
}

impl Orchestrator {
    /// Resolves every specialist up front, so a bad capability reference
    /// fails here and not halfway through a run.
    pub fn new(config: OrchestratorConfig, runtime: &Runtime) -> Result<Self, EngineError> {
        if config.specialists.is_empty() {
            return Err(EngineError::invalid(format!(
                "orchestrator '{}' has no specialists",
                config.role
            )));
        }
        let persona = config.persona();
        let specialists = config
            .specialists
            .iter()
            .map(|s| {
                let mut resolved = s.clone();
                resolved.capabilities = config.merged_capabilities(s);
                Specialist::new(resolved, runtime).map(|sp| sp.with_persona(persona.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            config,
            runtime: runtime.clone(),
            specialists,
        })
    }

    pub fn role(&self) -> &str {
        &self.config.role
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run the specialists in order, each seeing the query plus the
    /// findings so far, then synthesise a final answer.
    #[instrument(skip_all, fields(role = %self.config.role, specialists = self.specialists.len()))]
    pub async fn execute(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<OrchestratorResult, EngineError> {
        let start = Instant::now();
        let mut reports: Vec<SpecialistReport> = Vec::new();
        let mut failures = Vec::new();
        let mut first_error = None;
        let mut usage = Usage::default();

        for specialist in &self.specialists {
            let sections: Vec<Section<'_>> = reports
                .iter()
                .map(|r| Section { label: &r.title, content: &r.result.output })
                .collect();
            let input = compose(query, &sections, "Findings so far");

            let outcome = match specialist.run(&input, cancel).await {
                Ok(outcome) => {
                    usage += outcome.usage();
                    outcome.into_result(specialist.title())
                }
                Err(e) => {
                    let (spent, e) = e.take_usage();
                    usage += spent;
                    Err(e)
                }
            };
            match outcome {
                Ok(result) => {
                    reports.push(SpecialistReport {
                        title: specialist.title().to_string(),
                        result,
                    });
                }
                Err(e) if e.is_cancelled() => return Err(EngineError::Cancelled.with_usage(usage)),
                Err(e) => {
                    warn!(specialist = specialist.title(), error = %e, "specialist did not complete");
                    if self.config.failure_policy == FailurePolicy::Abort {
                        return Err(e.with_usage(usage));
                    }
                    failures.push(SpecialistFailure {
                        title: specialist.title().to_string(),
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if reports.is_empty() {
            let err = first_error.unwrap_or_else(|| EngineError::Internal("no specialist ran".into()));
            return Err(err.with_usage(usage));
        }

        let sections: Vec<Section<'_>> = reports
            .iter()
            .map(|r| Section { label: &r.title, content: &r.result.output })
            .collect();
        let model = self
            .config
            .synthesis_model
            .as_deref()
            .unwrap_or(&self.config.specialists[0].model);
        let (final_answer, synthesis_usage) =
            synthesize(&self.runtime, model, self.config.persona(), query, &sections, cancel)
                .await
                .map_err(|e| e.with_usage(usage))?;
        usage += synthesis_usage;

        info!(
            completed = reports.len(),
            failed = failures.len(),
            total_tokens = usage.total_tokens,
            "orchestrator finished"
        );
        Ok(OrchestratorResult {
            role: self.config.role.clone(),
            final_answer,
            specialist_results: reports,
            failures,
            usage,
            duration: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::{json, Value};
    use shinobi_core::capability::{CapabilityContext, CapabilityDescriptor};
    use shinobi_core::errors::GatewayError;
    use shinobi_core::gateway::CompletionRequest;
    use shinobi_core::shape::InputShape;
    use shinobi_core::usage::TokenUsage;
    use shinobi_llm::mock::{MockGateway, MockResponse};

    use crate::registry::CapabilityRegistry;

    fn is_synthesis(request: &CompletionRequest) -> bool {
        request.system.iter().any(|b| b.label == "synthesis")
    }

    fn specialist_title(request: &CompletionRequest) -> String {
        request
            .system
            .iter()
            .find(|b| b.label == "specialist")
            .map(|b| b.content.clone())
            .unwrap_or_default()
    }

    fn registry() -> CapabilityRegistry {
        let noop = |name: &str| {
            Arc::new(CapabilityDescriptor::new(
                name,
                "does nothing",
                InputShape::empty_object(),
                |_input: Value, _ctx: CapabilityContext| async { Ok(json!(null)) },
            ))
        };
        CapabilityRegistry::new()
            .with(noop("search"))
            .unwrap()
            .with(noop("notes"))
            .unwrap()
    }

    /// Researcher loops on tool calls when `stuck`, everyone else answers.
    fn gateway(stuck: bool) -> Arc<MockGateway> {
        Arc::new(
            MockGateway::with_handler(move |request| {
                if is_synthesis(request) {
                    return MockResponse::text("final answer");
                }
                let title = specialist_title(request);
                if stuck && title.contains("researcher") {
                    return MockResponse::tool_call("search", json!({}));
                }
                MockResponse::text(&format!("output of {title}"))
            })
            .with_default_usage(TokenUsage::new(10, 5)),
        )
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig::new(
            "analysis team",
            vec![
                SpecialistConfig::new("researcher", "claude-haiku").with_max_turns(2),
                SpecialistConfig::new("writer", "claude-haiku"),
            ],
        )
    }

    #[tokio::test]
    async fn runs_in_order_then_synthesises() {
        let mock = gateway(false);
        let runtime = Runtime::new(mock.clone(), registry());
        let orchestrator = Orchestrator::new(config().with_backstory("Veterans."), &runtime).unwrap();
        let result = orchestrator.execute("assess risk", &CancellationToken::new()).await.unwrap();

        assert_eq!(result.final_answer, "final answer");
        let titles: Vec<&str> = result.specialist_results.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["researcher", "writer"]);
        assert!(result.failures.is_empty());
        assert_eq!(result.usage.model_calls, 3);
        assert_eq!(result.usage.total_tokens, 45);

        let requests = mock.requests();
        let writer_input = requests[1].last_user_text().unwrap();
        assert!(writer_input.starts_with("assess risk"));
        assert!(writer_input.contains("output of You are researcher."));
        assert!(requests[1].system_text().contains("Veterans."));
        assert!(is_synthesis(&requests[2]));
    }

    #[tokio::test]
    async fn abort_policy_surfaces_the_failure() {
        let runtime = Runtime::new(gateway(true), registry());
        let cfg = config().with_shared_capabilities(["search"]);
        let orchestrator = Orchestrator::new(cfg, &runtime).unwrap();
        let err = orchestrator.execute("q", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err.root(), EngineError::SpecialistFailed { specialist, .. } if specialist == "researcher"));
    }

    #[tokio::test]
    async fn continue_policy_records_and_moves_on() {
        let mock = gateway(true);
        let runtime = Runtime::new(mock.clone(), registry());
        let cfg = config()
            .with_shared_capabilities(["search"])
            .with_failure_policy(FailurePolicy::Continue);
        let orchestrator = Orchestrator::new(cfg, &runtime).unwrap();
        let result = orchestrator.execute("q", &CancellationToken::new()).await.unwrap();

        assert_eq!(result.specialist_results.len(), 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].title, "researcher");
        assert_eq!(result.failures[0].kind, "specialist_failed");
        // two researcher turns, one writer turn, one synthesis
        assert_eq!(result.usage.model_calls, 4);
    }

    #[tokio::test]
    async fn continue_policy_bills_the_failed_specialist() {
        let mock = Arc::new(
            MockGateway::new(vec![
                MockResponse::tool_call("search", json!({})),
                MockResponse::Error(GatewayError::ProviderOverloaded),
                MockResponse::text("written"),
                MockResponse::text("final answer"),
            ])
            .with_default_usage(TokenUsage::new(10, 5)),
        );
        let runtime = Runtime::new(mock.clone(), registry());
        let cfg = config()
            .with_shared_capabilities(["search"])
            .with_failure_policy(FailurePolicy::Continue);
        let result = Orchestrator::new(cfg, &runtime)
            .unwrap()
            .execute("q", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.failures[0].kind, "gateway");
        assert_eq!(mock.call_count(), 4);
        assert_eq!(result.usage.model_calls, 4);
        assert_eq!(result.usage.total_tokens, 45);
        assert!(result.usage.approximate);
    }

    #[tokio::test]
    async fn abort_policy_returns_usage_with_the_error() {
        let runtime = Runtime::new(gateway(true), registry());
        let orchestrator = Orchestrator::new(config().with_shared_capabilities(["search"]), &runtime).unwrap();
        let err = orchestrator.execute("q", &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.usage().model_calls, 2);
        assert_eq!(err.usage().total_tokens, 30);
    }

    #[tokio::test]
    async fn total_failure_is_an_error_even_when_continuing() {
        let runtime = Runtime::new(gateway(true), registry());
        let cfg = OrchestratorConfig::new(
            "solo",
            vec![SpecialistConfig::new("researcher", "m")
                .with_capabilities(["search"])
                .with_max_turns(1)],
        )
        .with_failure_policy(FailurePolicy::Continue);
        let orchestrator = Orchestrator::new(cfg, &runtime).unwrap();
        assert!(orchestrator.execute("q", &CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn shared_capabilities_are_merged_without_duplicates() {
        let mock = gateway(false);
        let runtime = Runtime::new(mock.clone(), registry());
        let cfg = OrchestratorConfig::new(
            "team",
            vec![SpecialistConfig::new("writer", "m").with_capabilities(["notes", "search"])],
        )
        .with_shared_capabilities(["search"]);
        let orchestrator = Orchestrator::new(cfg, &runtime).unwrap();
        let _ = orchestrator.execute("q", &CancellationToken::new()).await.unwrap();

        let names: Vec<String> = mock.requests()[0].capabilities.iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec!["notes", "search"]);
    }

    #[test]
    fn rejects_empty_and_unresolvable_configs() {
        let runtime = Runtime::new(gateway(false), registry());
        let empty = OrchestratorConfig::new("nobody", vec![]);
        assert!(matches!(
            Orchestrator::new(empty, &runtime).err(),
            Some(EngineError::InvalidConfig(_))
        ));
        let unknown = config().with_shared_capabilities(["teleport"]);
        assert!(Orchestrator::new(unknown, &runtime).is_err());
    }

    #[test]
    fn failure_policy_serde() {
        let cfg: OrchestratorConfig = serde_json::from_value(json!({
            "role": "r",
            "specialists": [{"model": "m", "title": "t"}],
            "failure_policy": "continue"
        }))
        .unwrap();
        assert_eq!(cfg.failure_policy, FailurePolicy::Continue);
        assert!(cfg.capabilities.is_empty());
    }
}
