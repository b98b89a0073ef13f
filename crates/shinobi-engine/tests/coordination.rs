use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use shinobi_core::errors::GatewayError;
use shinobi_core::gateway::{Completion, CompletionRequest, ModelGateway};
use shinobi_engine::graph::{FnModule, Thought, ThoughtContext};
use shinobi_engine::workflow::StepStatus;
use shinobi_engine::{
    CapabilityRegistry, Clan, ClanConfig, ClanStrategy, Dojo, DojoConfig, EngineError, ErrorPolicy,
    GraphValidationError, OrchestratorConfig, Runtime, SpecialistConfig, StepConfig, ThoughtGraph,
};
use shinobi_llm::mock::{MockGateway, MockResponse};

const BRANCH_TIME: Duration = Duration::from_secs(1);

/// Specialist calls take `BRANCH_TIME`; synthesis calls answer at once.
/// Tracks how many specialist calls are in flight.
#[derive(Default)]
struct TimedGateway {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl ModelGateway for TimedGateway {
    fn name(&self) -> &str {
        "timed"
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, GatewayError> {
        if request.system.iter().any(|b| b.label == "synthesis") {
            return Ok(Completion::text("synthesised"));
        }
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.peak.fetch_max(now, Ordering::SeqCst);
        let result = tokio::select! {
            () = tokio::time::sleep(BRANCH_TIME) => Ok(Completion::text("branch done")),
            () = cancel.cancelled() => Err(GatewayError::Cancelled),
        };
        let _ = self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn embed(&self, _text: &str, _cancel: &CancellationToken) -> Result<Vec<f32>, GatewayError> {
        Ok(vec![0.0])
    }
}

fn orchestrator(role: &str) -> OrchestratorConfig {
    OrchestratorConfig::new(role, vec![SpecialistConfig::new(format!("{role} specialist"), "m")])
}

#[tokio::test(start_paused = true)]
async fn clan_respects_max_concurrency() {
    let gateway = Arc::new(TimedGateway::default());
    let runtime = Runtime::new(gateway.clone(), CapabilityRegistry::new());
    let branches = (1..=5).map(|i| orchestrator(&format!("branch-{i}"))).collect();
    let config = ClanConfig::new("five", branches)
        .with_strategy(ClanStrategy::Parallel)
        .with_max_concurrency(2);
    let clan = Clan::new(config, &runtime).unwrap();

    let start = tokio::time::Instant::now();
    let result = clan.run("go", &CancellationToken::new()).await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(result.completed().count(), 5);
    assert_eq!(gateway.peak.load(Ordering::SeqCst), 2);
    assert!(elapsed >= BRANCH_TIME * 3, "finished too early: {elapsed:?}");
    assert!(elapsed < BRANCH_TIME * 4, "finished too late: {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn clan_timeout_cancels_in_flight_calls() {
    let gateway = Arc::new(TimedGateway::default());
    let runtime = Runtime::new(gateway.clone(), CapabilityRegistry::new());
    let config = ClanConfig::new("slow", vec![orchestrator("a"), orchestrator("b"), orchestrator("c")])
        .with_max_concurrency(2)
        .with_timeout(BRANCH_TIME + BRANCH_TIME / 2);
    let clan = Clan::new(config, &runtime).unwrap();

    let result = clan.run("go", &CancellationToken::new()).await.unwrap();

    assert!(result.timed_out);
    let statuses: Vec<&str> = result.branches.iter().map(|b| b.outcome.status_name()).collect();
    assert_eq!(statuses, vec!["completed", "completed", "timed_out"]);
    assert_eq!(gateway.active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn dojo_continue_passes_the_last_good_output() {
    let mock = Arc::new(MockGateway::new(vec![
        MockResponse::text("alpha"),
        MockResponse::Error(GatewayError::ServerError { status: 503, body: "down".into() }),
        MockResponse::text("gamma"),
        MockResponse::Error(GatewayError::NetworkError("reset".into())),
    ]));
    let runtime = Runtime::new(mock.clone(), CapabilityRegistry::new());
    let steps = ["a", "b", "c", "d"]
        .into_iter()
        .map(|id| StepConfig::specialist(id, SpecialistConfig::new(id, "m")))
        .collect();
    let dojo = Dojo::new(DojoConfig::new("pipeline", steps).with_policy(ErrorPolicy::Continue), &runtime).unwrap();

    let result = dojo.run("start", &CancellationToken::new()).await.unwrap();

    let statuses: Vec<StepStatus> = result.steps.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![StepStatus::Completed, StepStatus::Failed, StepStatus::Completed, StepStatus::Failed]
    );
    assert_eq!(result.steps[1].input, "alpha");
    assert_eq!(result.steps[2].input, "alpha");
    assert_eq!(result.steps[3].input, "gamma");
    assert_eq!(result.output.as_deref(), Some("gamma"));
    assert!(result.steps[1].error.as_deref().unwrap_or_default().contains("503"));
    assert_eq!(mock.requests()[2].last_user_text(), Some("alpha"));
}

#[tokio::test]
async fn dojo_continue_with_a_failing_last_step_keeps_earlier_output() {
    let mock = Arc::new(MockGateway::new(vec![
        MockResponse::text("alpha"),
        MockResponse::Error(GatewayError::ProviderOverloaded),
    ]));
    let runtime = Runtime::new(mock, CapabilityRegistry::new());
    let steps = vec![
        StepConfig::specialist("a", SpecialistConfig::new("a", "m")),
        StepConfig::orchestrator("b", orchestrator("b")),
    ];
    let dojo = Dojo::new(DojoConfig::new("pipeline", steps).with_policy(ErrorPolicy::Continue), &runtime).unwrap();
    let result = dojo.run("start", &CancellationToken::new()).await.unwrap();
    assert_eq!(result.output.as_deref(), Some("alpha"));
    assert_eq!(result.failed_steps().count(), 1);
}

#[tokio::test]
async fn graph_cycle_fails_before_any_module_runs() {
    let ran = Arc::new(AtomicUsize::new(0));
    let module = |id: &str, dep: &str| {
        let ran = Arc::clone(&ran);
        FnModule::new(id, move |_ctx: ThoughtContext| {
            let ran = Arc::clone(&ran);
            async move {
                let _ = ran.fetch_add(1, Ordering::SeqCst);
                Ok(Thought::new("thought"))
            }
        })
        .depends_on([dep])
    };
    let graph = ThoughtGraph::new().with(module("a", "b")).with(module("b", "a"));

    assert!(matches!(graph.validate(), Err(GraphValidationError::Cycle { .. })));
    let err = graph.run("scope", "input", &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::GraphValidation(GraphValidationError::Cycle { .. })));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}
