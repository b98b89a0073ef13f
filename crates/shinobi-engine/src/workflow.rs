//! Dojo: an ordered pipeline of steps. Each step receives the previous
//! step's output; the first receives the query.

use std::time::{Duration, Instant};

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use shinobi_core::usage::{Usage, UsageSource};

use crate::error::{EngineError, WorkflowStepError};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::runtime::Runtime;
use crate::specialist::{Specialist, SpecialistConfig};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// First failure stops the workflow.
    #[default]
    Halt,
    /// Record the failure; the next step gets the last successful output.
    Continue,
    /// Re-run the step up to `max_retries` times, then apply `retry_fallback`.
    /// Fatal gateway failures skip straight to the fallback.
    Retry,
}

/// Behaviour once retries are exhausted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryFallback {
    #[default]
    Halt,
    Continue,
}

/// One step. Exactly one of `orchestrator` or `specialist` is set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator: Option<OrchestratorConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialist: Option<SpecialistConfig>,
}

impl StepConfig {
    pub fn orchestrator(id: impl Into<String>, config: OrchestratorConfig) -> Self {
        Self {
            id: id.into(),
            orchestrator: Some(config),
            specialist: None,
        }
    }

    pub fn specialist(id: impl Into<String>, config: SpecialistConfig) -> Self {
        Self {
            id: id.into(),
            orchestrator: None,
            specialist: Some(config),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DojoConfig {
    pub name: String,
    pub steps: Vec<StepConfig>,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
    /// Defaults to `dojo.maxRetries` from settings. Only used by `retry`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_fallback: RetryFallback,
}

impl DojoConfig {
    pub fn new(name: impl Into<String>, steps: Vec<StepConfig>) -> Self {
        Self {
            name: name.into(),
            steps,
            error_policy: ErrorPolicy::default(),
            max_retries: None,
            retry_fallback: RetryFallback::default(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, fallback: RetryFallback) -> Self {
        self.error_policy = ErrorPolicy::Retry;
        self.max_retries = Some(max_retries);
        self.retry_fallback = fallback;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StepReport {
    pub id: String,
    pub index: usize,
    pub status: StepStatus,
    pub input: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
    pub usage: Usage,
}

#[derive(Clone, Debug)]
pub struct DojoResult {
    pub name: String,
    /// Output of the last step that succeeded.
    pub output: Option<String>,
    pub steps: Vec<StepReport>,
    pub usage: Usage,
    pub duration: Duration,
}

impl DojoResult {
    pub fn failed_steps(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|s| s.status == StepStatus::Failed)
    }
}

impl UsageSource for DojoResult {
    fn usage(&self) -> Usage {
        self.usage
    }
}

enum StepRunner {
    Orchestrator(Box<Orchestrator>),
    Specialist(Box<Specialist>),
}

impl StepRunner {
    /// Usage is returned even when the attempt fails; the error comes back
    /// without it.
    async fn run(&self, input: &str, cancel: &CancellationToken) -> (Usage, Result<String, EngineError>) {
        let attempt = match self {
            Self::Orchestrator(o) => o.execute(input, cancel).await.map(|r| (r.usage, r.final_answer)),
            Self::Specialist(s) => s.run(input, cancel).await.and_then(|outcome| {
                let usage = outcome.usage();
                outcome
                    .into_result(s.title())
                    .map(|r| (usage, r.output))
                    .map_err(|e| e.with_usage(usage))
            }),
        };
        match attempt {
            Ok((usage, output)) => (usage, Ok(output)),
            Err(e) => {
                let (usage, e) = e.take_usage();
                (usage, Err(e))
            }
        }
    }
}

struct Step {
    id: String,
    runner: StepRunner,
}

pub struct Dojo {
    config: DojoConfig,
    steps: Vec<Step>,
    max_retries: u32,
}

impl Dojo {
    /// Check and resolve every step before anything runs.
    pub fn new(config: DojoConfig, runtime: &Runtime) -> Result<Self, EngineError> {
        validate_steps(&config.name, &config.steps)?;
        let steps = config
            .steps
            .iter()
            .map(|step| {
                let runner = match (&step.orchestrator, &step.specialist) {
                    (Some(o), None) => StepRunner::Orchestrator(Box::new(Orchestrator::new(o.clone(), runtime)?)),
                    (None, Some(s)) => StepRunner::Specialist(Box::new(Specialist::new(s.clone(), runtime)?)),
                    _ => return Err(EngineError::Internal(format!("step '{}' has no single target", step.id))),
                };
                Ok(Step {
                    id: step.id.clone(),
                    runner,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;
        let max_retries = config
            .max_retries
            .unwrap_or(runtime.settings().dojo.max_retries);
        Ok(Self {
            config,
            steps,
            max_retries,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[instrument(skip_all, fields(dojo = %self.config.name, policy = ?self.config.error_policy))]
    pub async fn run(&self, query: &str, cancel: &CancellationToken) -> Result<DojoResult, EngineError> {
        let start = Instant::now();
        let policy = self.config.error_policy;
        let max_attempts = match policy {
            ErrorPolicy::Retry => self.max_retries.saturating_add(1),
            ErrorPolicy::Halt | ErrorPolicy::Continue => 1,
        };

        let mut input = query.to_string();
        let mut last_good: Option<String> = None;
        let mut reports = Vec::with_capacity(self.steps.len());
        let mut total = Usage::default();

        for (index, step) in self.steps.iter().enumerate() {
            let mut attempts = 0;
            let mut step_usage = Usage::default();
            let result = loop {
                attempts += 1;
                let (usage, result) = step.runner.run(&input, cancel).await;
                step_usage += usage;
                match result {
                    Err(e) if e.is_cancelled() => return Err(EngineError::Cancelled.with_usage(total + step_usage)),
                    Err(e) if attempts < max_attempts && !e.is_fatal() => {
                        warn!(step_id = %step.id, attempt = attempts, error = %e, "step failed, retrying");
                    }
                    other => break other,
                }
            };
            total += step_usage;

            match result {
                Ok(output) => {
                    info!(step_id = %step.id, attempts, "step completed");
                    reports.push(StepReport {
                        id: step.id.clone(),
                        index,
                        status: StepStatus::Completed,
                        input: std::mem::replace(&mut input, output.clone()),
                        output: Some(output.clone()),
                        error: None,
                        attempts,
                        usage: step_usage,
                    });
                    last_good = Some(output);
                }
                Err(e) => {
                    counter!("workflow_step_failures_total").increment(1);
                    let halt = match policy {
                        ErrorPolicy::Halt => true,
                        ErrorPolicy::Continue => false,
                        ErrorPolicy::Retry => self.config.retry_fallback == RetryFallback::Halt,
                    };
                    if halt {
                        warn!(step_id = %step.id, attempts, error = %e, "step failed, halting");
                        return Err(EngineError::from(WorkflowStepError {
                            step_id: step.id.clone(),
                            step_index: index,
                            policy,
                            attempts,
                            source: e,
                        })
                        .with_usage(total));
                    }
                    warn!(step_id = %step.id, attempts, error = %e, "step failed, continuing");
                    reports.push(StepReport {
                        id: step.id.clone(),
                        index,
                        status: StepStatus::Failed,
                        input: input.clone(),
                        output: None,
                        error: Some(e.to_string()),
                        attempts,
                        usage: step_usage,
                    });
                }
            }
        }

        Ok(DojoResult {
            name: self.config.name.clone(),
            output: last_good,
            steps: reports,
            usage: total,
            duration: start.elapsed(),
        })
    }
}

/// Structural checks shared with descriptor validation.
pub fn validate_steps(name: &str, steps: &[StepConfig]) -> Result<(), EngineError> {
    if steps.is_empty() {
        return Err(EngineError::invalid(format!("dojo '{name}' has no steps")));
    }
    let mut seen: Vec<&str> = Vec::with_capacity(steps.len());
    for (index, step) in steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            return Err(EngineError::invalid(format!("dojo '{name}' step #{index} has an empty id")));
        }
        if seen.contains(&step.id.as_str()) {
            return Err(EngineError::invalid(format!("dojo '{name}' has duplicate step id '{}'", step.id)));
        }
        seen.push(&step.id);
        match (&step.orchestrator, &step.specialist) {
            (Some(_), None) | (None, Some(_)) => {}
            (None, None) => {
                return Err(EngineError::invalid(format!(
                    "dojo '{name}' step '{}' has neither an orchestrator nor a specialist",
                    step.id
                )))
            }
            (Some(_), Some(_)) => {
                return Err(EngineError::invalid(format!(
                    "dojo '{name}' step '{}' has both an orchestrator and a specialist",
                    step.id
                )))
            }
        }
    }
    Ok(())
}
