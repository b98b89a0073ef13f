//! Reasoning graph: a DAG of [`ThoughtModule`]s over scoped [`Memory`].
//!
//! Modules live in an arena; dependency edges are indices into it. The
//! graph is validated (no duplicates, no dangling edges, no cycles) before
//! any module runs, then executed in topological order. After each module
//! its output is written to memory under the run's scope, keyed by module
//! id, so later modules see it.

pub mod memory;
pub mod module;
pub mod trace;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use shinobi_core::usage::{Usage, UsageSource};
use shinobi_settings::{GraphExecutionMode, GraphSettings};

pub use memory::Memory;
pub use module::{FnModule, PromptModule, Thought, ThoughtContext, ThoughtModule};
pub use trace::{Trace, TraceEvent, TraceKind};

use crate::error::{EngineError, GraphValidationError};

/// How modules without a mutual dependency are scheduled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GraphExecution {
    /// One module at a time, in topological order.
    #[default]
    Sequential,
    /// Each wave of ready modules runs concurrently, at most
    /// `max_concurrency` at once. Waves are separated by a barrier.
    Concurrent { max_concurrency: usize },
}

impl GraphExecution {
    pub fn from_settings(settings: &GraphSettings) -> Self {
        match settings.execution {
            GraphExecutionMode::Sequential => Self::Sequential,
            GraphExecutionMode::Concurrent => Self::Concurrent {
                max_concurrency: settings.max_concurrency.max(1),
            },
        }
    }
}

/// Validated execution plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GraphPlan {
    /// Topological order, ties broken by insertion order.
    pub order: Vec<String>,
    /// Groups of modules whose dependencies are all in earlier groups.
    pub waves: Vec<Vec<String>>,
}

struct Plan {
    order: Vec<usize>,
    waves: Vec<Vec<usize>>,
    edges: Vec<Vec<usize>>,
}

#[derive(Clone, Debug)]
pub struct GraphResult {
    /// Module ids in the order they finished.
    pub order: Vec<String>,
    pub outputs: BTreeMap<String, Value>,
    /// Output of the last module in topological order.
    pub output: Value,
    pub memory: BTreeMap<String, Value>,
    pub trace: Vec<TraceEvent>,
    pub usage: Usage,
    pub duration: Duration,
}

impl GraphResult {
    pub fn output_text(&self) -> String {
        module::value_text(&self.output)
    }
}

impl UsageSource for GraphResult {
    fn usage(&self) -> Usage {
        self.usage
    }
}

#[derive(Clone, Default)]
pub struct ThoughtGraph {
    nodes: Vec<Arc<dyn ThoughtModule>>,
    /// `None` until chosen, either explicitly or from settings on
    /// registration; runs sequentially if still unset.
    execution: Option<GraphExecution>,
}

impl ThoughtGraph {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_execution(mut self, execution: GraphExecution) -> Self {
        self.execution = Some(execution);
        self
    }

    /// Use `execution` unless a policy was already chosen.
    #[must_use]
    pub fn or_execution(mut self, execution: GraphExecution) -> Self {
        if self.execution.is_none() {
            self.execution = Some(execution);
        }
        self
    }

    pub fn add(&mut self, module: Arc<dyn ThoughtModule>) -> &mut Self {
        self.nodes.push(module);
        self
    }

    #[must_use]
    pub fn with(mut self, module: impl ThoughtModule + 'static) -> Self {
        self.nodes.push(Arc::new(module));
        self
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn execution(&self) -> GraphExecution {
        self.execution.unwrap_or_default()
    }

    pub fn module_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.id().to_string()).collect()
    }

    pub fn validate(&self) -> Result<GraphPlan, GraphValidationError> {
        let plan = self.plan()?;
        let names = |ids: &[usize]| -> Vec<String> {
            ids.iter().map(|&i| self.nodes[i].id().to_string()).collect()
        };
        Ok(GraphPlan {
            order: names(plan.order.as_slice()),
            waves: plan.waves.iter().map(|w| names(w.as_slice())).collect(),
        })
    }

    fn plan(&self) -> Result<Plan, GraphValidationError> {
        if self.nodes.is_empty() {
            return Err(GraphValidationError::Empty);
        }

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            if index.insert(node.id(), i).is_some() {
                return Err(GraphValidationError::DuplicateModule(node.id().to_string()));
            }
        }

        let mut edges = Vec::with_capacity(self.nodes.len());
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            let mut deps = Vec::with_capacity(node.dependencies().len());
            for dep in node.dependencies() {
                let Some(&d) = index.get(dep.as_str()) else {
                    return Err(GraphValidationError::MissingDependency {
                        module: node.id().to_string(),
                        dependency: dep.clone(),
                    });
                };
                if !deps.contains(&d) {
                    deps.push(d);
                    dependents[d].push(i);
                }
            }
            edges.push(deps);
        }

        // Kahn, level by level.
        let mut indegree: Vec<usize> = edges.iter().map(Vec::len).collect();
        let mut ready: Vec<usize> = (0..self.nodes.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut waves = Vec::new();
        while !ready.is_empty() {
            let mut next = Vec::new();
            for &i in &ready {
                for &j in &dependents[i] {
                    indegree[j] -= 1;
                    if indegree[j] == 0 {
                        next.push(j);
                    }
                }
            }
            next.sort_unstable();
            order.extend_from_slice(&ready);
            waves.push(std::mem::replace(&mut ready, next));
        }

        if order.len() < self.nodes.len() {
            let mut modules: Vec<String> = (0..self.nodes.len())
                .filter(|&i| indegree[i] > 0)
                .map(|i| self.nodes[i].id().to_string())
                .collect();
            modules.sort();
            return Err(GraphValidationError::Cycle { modules });
        }

        Ok(Plan { order, waves, edges })
    }

    /// Run with a fresh memory and trace owned by this run.
    pub async fn run(
        &self,
        scope: &str,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<GraphResult, EngineError> {
        let memory = Memory::new();
        let trace = Trace::new();
        self.run_in(&memory, &trace, scope, input, cancel).await
    }

    /// Run against caller-owned memory and trace.
    #[instrument(skip_all, fields(scope = %scope, modules = self.nodes.len()))]
    pub async fn run_in(
        &self,
        memory: &Memory,
        trace: &Trace,
        scope: &str,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<GraphResult, EngineError> {
        let plan = self.plan().inspect_err(|e| warn!(error = %e, "graph rejected"))?;
        let start = Instant::now();
        let mut outputs: Vec<Option<Value>> = vec![None; self.nodes.len()];
        let mut finished = Vec::with_capacity(self.nodes.len());
        let mut usage = Usage::default();

        let step = |i: usize, outputs: &[Option<Value>]| {
            let deps = plan.edges[i]
                .iter()
                .filter_map(|&d| Some((self.nodes[d].id().to_string(), outputs[d].clone()?)))
                .collect();
            self.run_module(i, deps, memory, trace, scope, input, cancel)
        };

        match self.execution() {
            GraphExecution::Sequential => {
                for &i in &plan.order {
                    let thought = step(i, &outputs).await.map_err(|e| e.with_usage(usage))?;
                    usage += thought.usage;
                    outputs[i] = Some(thought.output);
                    finished.push(i);
                }
            }
            GraphExecution::Concurrent { max_concurrency } => {
                for wave in &plan.waves {
                    let snapshot = &outputs;
                    let done: Vec<(usize, Thought)> = stream::iter(wave.iter().copied())
                        .map(|i| {
                            let fut = step(i, snapshot);
                            async move { fut.await.map(|t| (i, t)) }
                        })
                        .buffer_unordered(max_concurrency.max(1))
                        .try_collect()
                        .await
                        // Siblings still in flight are dropped unbilled.
                        .map_err(|e| e.with_usage(Usage { approximate: true, ..usage }))?;
                    for (i, thought) in done {
                        usage += thought.usage;
                        outputs[i] = Some(thought.output);
                        finished.push(i);
                    }
                }
            }
        }

        let output = plan
            .order
            .last()
            .and_then(|&i| outputs[i].clone())
            .unwrap_or(Value::Null);
        let named: BTreeMap<String, Value> = outputs
            .into_iter()
            .enumerate()
            .filter_map(|(i, v)| Some((self.nodes[i].id().to_string(), v?)))
            .collect();

        debug!(elapsed_ms = start.elapsed().as_millis() as u64, "graph finished");
        Ok(GraphResult {
            order: finished.iter().map(|&i| self.nodes[i].id().to_string()).collect(),
            outputs: named,
            output,
            memory: memory.snapshot(scope),
            trace: trace.snapshot(),
            usage,
            duration: start.elapsed(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_module(
        &self,
        index: usize,
        dependencies: BTreeMap<String, Value>,
        memory: &Memory,
        trace: &Trace,
        scope: &str,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<Thought, EngineError> {
        let module = &self.nodes[index];
        let id = module.id();
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let _ = trace.append(id, TraceKind::Started, "");
        let ctx = ThoughtContext {
            scope: scope.to_string(),
            input: input.to_string(),
            memory: memory.snapshot(scope),
            trace: trace.snapshot(),
            dependencies,
            cancel: cancel.clone(),
        };

        let start = Instant::now();
        match module.think(&ctx).await {
            Ok(thought) => {
                let _ = memory.set(scope, id, thought.output.clone());
                for note in &thought.notes {
                    let _ = trace.append(id, TraceKind::Note, note.clone());
                }
                let _ = trace.append_timed(id, TraceKind::Completed, "", start.elapsed());
                debug!(module = id, "module completed");
                Ok(thought)
            }
            Err(e) => {
                let _ = trace.append_timed(id, TraceKind::Failed, e.to_string(), start.elapsed());
                warn!(module = id, error = %e, "module failed");
                let (spent, e) = e.take_usage();
                if e.is_cancelled() {
                    return Err(EngineError::Cancelled.with_usage(spent));
                }
                Err(EngineError::ModuleFailed {
                    module: id.to_string(),
                    reason: e.to_string(),
                }
                .with_usage(spent))
            }
        }
    }
}

impl std::fmt::Debug for ThoughtGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThoughtGraph")
            .field("modules", &self.module_ids())
            .field("execution", &self.execution())
            .finish()
    }
}
