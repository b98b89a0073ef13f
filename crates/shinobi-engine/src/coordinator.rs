//! Clan: several orchestrators run under one strategy, a concurrency
//! bound and an overall deadline.
//!
//! Branch failures are isolated. When the deadline passes, outstanding
//! branches are signalled through their cancellation tokens and given a
//! short grace period to unwind; whatever completed is returned, the rest
//! is marked timed out. The collaborative synthesis pass runs under the
//! same deadline.
//!
//! Usage covers every branch, failed or not. Branches that never reported
//! back make the total approximate.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use metrics::gauge;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use shinobi_core::usage::{Usage, UsageSource};

use crate::error::EngineError;
use crate::orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorResult};
use crate::registry::panic_message;
use crate::runtime::Runtime;
use crate::synthesis::{synthesize, Section};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClanStrategy {
    /// One orchestrator at a time, each on the original query.
    Sequential,
    /// All orchestrators under the concurrency bound, results kept apart.
    #[default]
    Parallel,
    /// Parallel, then one synthesis pass over the successful branches.
    Collaborative,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClanConfig {
    pub name: String,
    pub orchestrators: Vec<OrchestratorConfig>,
    #[serde(default)]
    pub strategy: ClanStrategy,
    /// Defaults to `clan.maxConcurrency` from settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Defaults to `clan.timeoutMs` from settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis_model: Option<String>,
}

impl ClanConfig {
    pub fn new(name: impl Into<String>, orchestrators: Vec<OrchestratorConfig>) -> Self {
        Self {
            name: name.into(),
            orchestrators,
            strategy: ClanStrategy::default(),
            max_concurrency: None,
            timeout_ms: None,
            synthesis_model: None,
        }
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: ClanStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

#[derive(Debug)]
pub enum BranchOutcome {
    Completed(OrchestratorResult),
    Failed(EngineError),
    /// Did not finish before the deadline. Holds [`EngineError::Timeout`]
    /// carrying whatever the branch spent before it was stopped.
    TimedOut(EngineError),
}

impl BranchOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn status_name(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Failed(_) => "failed",
            Self::TimedOut(_) => "timed_out",
        }
    }

    pub fn error(&self) -> Option<&EngineError> {
        match self {
            Self::Completed(_) => None,
            Self::Failed(e) | Self::TimedOut(e) => Some(e),
        }
    }

    /// What this branch is known to have spent.
    pub fn usage(&self) -> Usage {
        match self {
            Self::Completed(result) => result.usage,
            Self::Failed(e) | Self::TimedOut(e) => e.usage(),
        }
    }
}

/// Usage of work that was stopped without reporting.
fn unknown_usage() -> Usage {
    Usage {
        approximate: true,
        ..Usage::default()
    }
}

#[derive(Debug)]
pub struct BranchReport {
    pub index: usize,
    pub role: String,
    pub outcome: BranchOutcome,
}

#[derive(Debug)]
pub struct ClanResult {
    pub name: String,
    /// One entry per orchestrator, in declaration order.
    pub branches: Vec<BranchReport>,
    /// Only set by the collaborative strategy.
    pub synthesis: Option<String>,
    pub synthesis_error: Option<String>,
    pub usage: Usage,
    pub duration: Duration,
    pub timed_out: bool,
}

impl ClanResult {
    pub fn completed(&self) -> impl Iterator<Item = (&str, &OrchestratorResult)> {
        self.branches.iter().filter_map(|b| match &b.outcome {
            BranchOutcome::Completed(r) => Some((b.role.as_str(), r)),
            _ => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = &BranchReport> {
        self.branches.iter().filter(|b| !b.outcome.is_completed())
    }
}

impl UsageSource for ClanResult {
    fn usage(&self) -> Usage {
        self.usage
    }
}

pub struct Clan {
    config: ClanConfig,
    runtime: Runtime,
    orchestrators: Vec<Arc<Orchestrator>>,
}

impl Clan {
    pub fn new(config: ClanConfig, runtime: &Runtime) -> Result<Self, EngineError> {
        if config.orchestrators.is_empty() {
            return Err(EngineError::invalid(format!("clan '{}' has no orchestrators", config.name)));
        }
        if config.max_concurrency == Some(0) {
            return Err(EngineError::invalid(format!(
                "clan '{}' max_concurrency must be at least 1",
                config.name
            )));
        }
        let orchestrators = config
            .orchestrators
            .iter()
            .map(|o| Orchestrator::new(o.clone(), runtime).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            config,
            runtime: runtime.clone(),
            orchestrators,
        })
    }

    pub fn max_concurrency(&self) -> usize {
        self.config
            .max_concurrency
            .unwrap_or(self.runtime.settings().clan.max_concurrency)
            .max(1)
    }

    pub fn timeout(&self) -> Duration {
        self.config
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.runtime.settings().clan.timeout())
    }

    #[instrument(skip_all, fields(clan = %self.config.name, strategy = ?self.config.strategy))]
    pub async fn run(&self, query: &str, cancel: &CancellationToken) -> Result<ClanResult, EngineError> {
        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + self.timeout();
        let (slots, mut timed_out) = match self.config.strategy {
            ClanStrategy::Sequential => self.run_sequential(query, deadline, cancel).await,
            ClanStrategy::Parallel | ClanStrategy::Collaborative => {
                self.run_parallel(query, deadline, cancel).await
            }
        };
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let branches: Vec<BranchReport> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| BranchReport {
                index,
                role: self.orchestrators[index].role().to_string(),
                outcome: slot.unwrap_or_else(|| {
                    if timed_out {
                        self.timeout_outcome(unknown_usage())
                    } else {
                        BranchOutcome::Failed(
                            EngineError::Internal("branch task did not report".into()).with_usage(unknown_usage()),
                        )
                    }
                }),
            })
            .collect();

        let mut usage = Usage::aggregate(branches.iter().map(|b| b.outcome.usage()));

        let (mut synthesis, mut synthesis_error) = (None, None);
        if self.config.strategy == ClanStrategy::Collaborative {
            match self.synthesize_within(query, &branches, deadline, cancel).await {
                Ok((text, synthesis_usage)) => {
                    usage += synthesis_usage;
                    synthesis = Some(text);
                }
                Err(e) if e.is_cancelled() => return Err(EngineError::Cancelled.with_usage(usage)),
                Err(e) => {
                    warn!(error = %e, "clan synthesis failed");
                    usage += e.usage();
                    timed_out |= matches!(e.root(), EngineError::Timeout(_));
                    synthesis_error = Some(e.to_string());
                }
            }
        }

        let completed = branches.iter().filter(|b| b.outcome.is_completed()).count();
        info!(completed, total = branches.len(), timed_out, "clan finished");
        Ok(ClanResult {
            name: self.config.name.clone(),
            branches,
            synthesis,
            synthesis_error,
            usage,
            duration: start.elapsed(),
            timed_out,
        })
    }

    fn timeout_outcome(&self, spent: Usage) -> BranchOutcome {
        BranchOutcome::TimedOut(EngineError::Timeout(self.timeout()).with_usage(spent))
    }

    async fn run_sequential(
        &self,
        query: &str,
        deadline: tokio::time::Instant,
        cancel: &CancellationToken,
    ) -> (Vec<Option<BranchOutcome>>, bool) {
        let root = cancel.child_token();
        let grace = self.runtime.settings().clan.cancel_grace();
        let mut slots: Vec<Option<BranchOutcome>> = Vec::with_capacity(self.orchestrators.len());
        let mut timed_out = false;

        for orchestrator in &self.orchestrators {
            if timed_out || cancel.is_cancelled() {
                // Never started.
                slots.push(Some(self.timeout_outcome(Usage::default())));
                continue;
            }
            let branch = run_branch(Arc::clone(orchestrator), query.to_string(), root.clone());
            tokio::pin!(branch);
            tokio::select! {
                result = &mut branch => slots.push(Some(branch_outcome(result))),
                () = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    root.cancel();
                    let outcome = match tokio::time::timeout(grace, &mut branch).await {
                        Ok(Ok(result)) => BranchOutcome::Completed(result),
                        Ok(Err(e)) => self.timeout_outcome(e.usage()),
                        Err(_) => self.timeout_outcome(unknown_usage()),
                    };
                    slots.push(Some(outcome));
                }
            }
        }
        (slots, timed_out)
    }

    async fn run_parallel(
        &self,
        query: &str,
        deadline: tokio::time::Instant,
        cancel: &CancellationToken,
    ) -> (Vec<Option<BranchOutcome>>, bool) {
        let root = cancel.child_token();
        let permits = Arc::new(Semaphore::new(self.max_concurrency()));
        let mut set = JoinSet::new();

        for (index, orchestrator) in self.orchestrators.iter().enumerate() {
            let permits = Arc::clone(&permits);
            let orchestrator = Arc::clone(orchestrator);
            let query = query.to_string();
            let token = root.child_token();
            let _ = set.spawn(async move {
                let _permit = tokio::select! {
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return (index, Err(EngineError::Internal("clan semaphore closed".into()))),
                    },
                    () = token.cancelled() => return (index, Err(EngineError::Cancelled)),
                };
                (index, run_branch(orchestrator, query, token).await)
            });
        }

        let mut slots: Vec<Option<BranchOutcome>> = (0..self.orchestrators.len()).map(|_| None).collect();
        let deadline = tokio::time::sleep_until(deadline);
        tokio::pin!(deadline);
        let mut timed_out = false;

        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(Ok((index, result))) => slots[index] = Some(branch_outcome(result)),
                    Some(Err(e)) => warn!(error = %e, "clan branch task failed"),
                    None => break,
                },
                () = &mut deadline => {
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out {
            warn!(
                outstanding = set.len(),
                timeout_ms = self.timeout().as_millis() as u64,
                "clan deadline reached, cancelling outstanding branches"
            );
            root.cancel();
            let grace = tokio::time::sleep(self.runtime.settings().clan.cancel_grace());
            tokio::pin!(grace);
            loop {
                tokio::select! {
                    joined = set.join_next() => match joined {
                        Some(Ok((index, Ok(result)))) => slots[index] = Some(BranchOutcome::Completed(result)),
                        Some(Ok((index, Err(e)))) => slots[index] = Some(self.timeout_outcome(e.usage())),
                        Some(Err(_)) => {}
                        None => break,
                    },
                    () = &mut grace => break,
                }
            }
            set.abort_all();
        }
        (slots, timed_out)
    }

    /// Synthesis bounded by the clan deadline. Past it, the pass is
    /// cancelled and gets the same grace period as a branch.
    async fn synthesize_within(
        &self,
        query: &str,
        branches: &[BranchReport],
        deadline: tokio::time::Instant,
        cancel: &CancellationToken,
    ) -> Result<(String, Usage), EngineError> {
        let token = cancel.child_token();
        let pass = self.synthesize(query, branches, &token);
        tokio::pin!(pass);
        tokio::select! {
            biased;
            result = &mut pass => result,
            () = tokio::time::sleep_until(deadline) => {
                token.cancel();
                let grace = self.runtime.settings().clan.cancel_grace();
                let spent = match tokio::time::timeout(grace, &mut pass).await {
                    Ok(Ok(result)) => return Ok(result),
                    Ok(Err(e)) => e.usage(),
                    Err(_) => unknown_usage(),
                };
                Err(EngineError::Timeout(self.timeout()).with_usage(spent))
            }
        }
    }

    async fn synthesize(
        &self,
        query: &str,
        branches: &[BranchReport],
        cancel: &CancellationToken,
    ) -> Result<(String, Usage), EngineError> {
        let sections: Vec<Section<'_>> = branches
            .iter()
            .filter_map(|b| match &b.outcome {
                BranchOutcome::Completed(r) => Some(Section {
                    label: &b.role,
                    content: &r.final_answer,
                }),
                _ => None,
            })
            .collect();
        if sections.is_empty() {
            return Err(EngineError::Internal("no branch completed".into()));
        }
        let model = match &self.config.synthesis_model {
            Some(model) => model.as_str(),
            None => self.orchestrators[0]
                .config()
                .specialists
                .first()
                .map(|s| s.model.as_str())
                .unwrap_or_default(),
        };
        synthesize(&self.runtime, model, Vec::new(), query, &sections, cancel).await
    }
}

/// One orchestrator run with panic isolation and the active-branch gauge.
async fn run_branch(
    orchestrator: Arc<Orchestrator>,
    query: String,
    token: CancellationToken,
) -> Result<OrchestratorResult, EngineError> {
    gauge!("clan_branches_active").increment(1.0);
    let result = AssertUnwindSafe(orchestrator.execute(&query, &token))
        .catch_unwind()
        .await;
    gauge!("clan_branches_active").decrement(1.0);
    match result {
        Ok(result) => result,
        Err(panic) => Err(EngineError::Internal(format!(
            "orchestrator '{}' panicked: {}",
            orchestrator.role(),
            panic_message(&panic)
        ))),
    }
}

fn branch_outcome(result: Result<OrchestratorResult, EngineError>) -> BranchOutcome {
    match result {
        Ok(result) => BranchOutcome::Completed(result),
        Err(e) => BranchOutcome::Failed(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shinobi_core::errors::GatewayError;
    use shinobi_core::gateway::CompletionRequest;
    use shinobi_llm::mock::{MockGateway, MockResponse};

    use crate::registry::CapabilityRegistry;
    use crate::specialist::SpecialistConfig;

    fn role_of(request: &CompletionRequest) -> String {
        request
            .system
            .iter()
            .find(|b| b.label == "role")
            .map(|b| b.content.trim_start_matches("Role: ").to_string())
            .unwrap_or_default()
    }

    /// `slow` sleeps for a minute, `broken` errors, anything else answers.
    fn gateway() -> Arc<MockGateway> {
        Arc::new(MockGateway::with_handler(|request| {
            let synthesis = request.system.iter().any(|b| b.label == "synthesis");
            match role_of(request).as_str() {
                "" if synthesis => MockResponse::text("clan synthesis"),
                "slow" if !synthesis => {
                    MockResponse::delayed(Duration::from_secs(60), MockResponse::text("late"))
                }
                "broken" => MockResponse::Error(GatewayError::AuthenticationFailed("bad key".into())),
                role if synthesis => MockResponse::text(&format!("{role} answer")),
                role => MockResponse::text(&format!("{role} draft")),
            }
        }))
    }

    fn orchestrator(role: &str) -> OrchestratorConfig {
        OrchestratorConfig::new(role, vec![SpecialistConfig::new(format!("{role}-analyst"), "m")])
    }

    fn runtime() -> Runtime {
        Runtime::new(gateway(), CapabilityRegistry::new())
    }

    #[tokio::test]
    async fn parallel_failures_stay_isolated() {
        let config = ClanConfig::new(
            "council",
            vec![orchestrator("north"), orchestrator("broken"), orchestrator("south")],
        );
        let clan = Clan::new(config, &runtime()).unwrap();
        let result = clan.run("plan", &CancellationToken::new()).await.unwrap();

        let statuses: Vec<&str> = result.branches.iter().map(|b| b.outcome.status_name()).collect();
        assert_eq!(statuses, vec!["completed", "failed", "completed"]);
        let answers: Vec<&str> = result.completed().map(|(_, r)| r.final_answer.as_str()).collect();
        assert_eq!(answers, vec!["north answer", "south answer"]);
        assert!(result.synthesis.is_none());
        assert!(!result.timed_out);
        // two calls per healthy branch plus the failed call of `broken`
        assert_eq!(result.usage.model_calls, 5);
        assert!(result.usage.approximate);
        assert_eq!(result.branches[1].outcome.usage().model_calls, 1);
    }

    #[tokio::test]
    async fn collaborative_synthesises_successful_branches() {
        let config = ClanConfig::new("council", vec![orchestrator("north"), orchestrator("broken")])
            .with_strategy(ClanStrategy::Collaborative);
        let mock = gateway();
        let clan = Clan::new(config, &Runtime::new(mock.clone(), CapabilityRegistry::new())).unwrap();
        let result = clan.run("plan", &CancellationToken::new()).await.unwrap();

        assert_eq!(result.synthesis.as_deref(), Some("clan synthesis"));
        let last = mock.last_request().unwrap();
        let prompt = last.last_user_text().unwrap();
        assert!(prompt.contains("[north]\nnorth answer"));
        assert!(!prompt.contains("broken"));
    }

    #[tokio::test]
    async fn collaborative_without_successes_records_synthesis_error() {
        let config = ClanConfig::new("council", vec![orchestrator("broken")])
            .with_strategy(ClanStrategy::Collaborative);
        let clan = Clan::new(config, &runtime()).unwrap();
        let result = clan.run("plan", &CancellationToken::new()).await.unwrap();
        assert!(result.synthesis.is_none());
        assert!(result.synthesis_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_returns_partial_results() {
        let config = ClanConfig::new("council", vec![orchestrator("fast"), orchestrator("slow")])
            .with_timeout(Duration::from_secs(5));
        let clan = Clan::new(config, &runtime()).unwrap();

        let start = tokio::time::Instant::now();
        let result = clan.run("plan", &CancellationToken::new()).await.unwrap();

        assert!(result.timed_out);
        assert!(start.elapsed() < Duration::from_secs(60));
        assert!(result.branches[0].outcome.is_completed());
        let slow = &result.branches[1].outcome;
        assert!(matches!(slow, BranchOutcome::TimedOut(_)));
        assert!(matches!(slow.error().map(EngineError::root), Some(EngineError::Timeout(_))));
        assert_eq!(slow.usage().model_calls, 1);
        assert!(result.usage.approximate);
    }

    #[tokio::test(start_paused = true)]
    async fn synthesis_is_bounded_by_the_deadline() {
        let mock = Arc::new(MockGateway::with_handler(|request| {
            let synthesis = request.system.iter().any(|b| b.label == "synthesis");
            if synthesis && role_of(request).is_empty() {
                return MockResponse::delayed(Duration::from_secs(600), MockResponse::text("too late"));
            }
            MockResponse::text("draft")
        }));
        let config = ClanConfig::new("council", vec![orchestrator("north")])
            .with_strategy(ClanStrategy::Collaborative)
            .with_timeout(Duration::from_secs(5));
        let clan = Clan::new(config, &Runtime::new(mock, CapabilityRegistry::new())).unwrap();

        let start = tokio::time::Instant::now();
        let result = clan.run("plan", &CancellationToken::new()).await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(result.timed_out);
        assert!(result.synthesis.is_none());
        assert_eq!(result.synthesis_error.as_deref(), Some("timed out after 5s"));
        assert_eq!(result.completed().count(), 1);
        assert_eq!(result.usage.model_calls, 3);
        assert!(result.usage.approximate);
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_deadline_marks_the_rest() {
        let config = ClanConfig::new(
            "council",
            vec![orchestrator("fast"), orchestrator("slow"), orchestrator("never")],
        )
        .with_strategy(ClanStrategy::Sequential)
        .with_timeout(Duration::from_secs(5));
        let clan = Clan::new(config, &runtime()).unwrap();
        let result = clan.run("plan", &CancellationToken::new()).await.unwrap();

        let statuses: Vec<&str> = result.branches.iter().map(|b| b.outcome.status_name()).collect();
        assert_eq!(statuses, vec!["completed", "timed_out", "timed_out"]);
    }

    #[test]
    fn rejects_empty_clan_and_zero_concurrency() {
        let rt = runtime();
        assert!(Clan::new(ClanConfig::new("none", vec![]), &rt).is_err());
        let zero = ClanConfig::new("zero", vec![orchestrator("a")]).with_max_concurrency(0);
        assert!(Clan::new(zero, &rt).is_err());
    }

    #[test]
    fn limits_fall_back_to_settings() {
        let clan = Clan::new(ClanConfig::new("c", vec![orchestrator("a")]), &runtime()).unwrap();
        assert_eq!(clan.max_concurrency(), 4);
        assert_eq!(clan.timeout(), Duration::from_secs(300));
    }
}
