//! # shinobi-engine
//!
//! The orchestration runtime.
//!
//! - [`specialist::Specialist`]: multi-turn tool-calling loop for one model
//! - [`orchestrator::Orchestrator`]: ordered specialists plus a synthesis pass
//! - [`coordinator::Clan`]: orchestrators under a strategy, a concurrency bound and a deadline
//! - [`workflow::Dojo`]: sequential pipeline with halt/continue/retry policies
//! - [`graph::ThoughtGraph`]: DAG of reasoning modules over scoped memory and a trace
//! - [`registry::CapabilityRegistry`]: closed name-to-capability table with validated dispatch
//! - [`descriptor::Descriptor`]: JSON descriptors and referential checks
//!
//! All components receive a [`runtime::Runtime`] explicitly; there is no
//! global state.
//!
//! ## Crate Position
//!
//! Depends on shinobi-core, shinobi-llm and shinobi-settings.

#![deny(unsafe_code)]

pub mod coordinator;
pub mod descriptor;
pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod registry;
pub mod runtime;
pub mod specialist;
mod synthesis;
pub mod truncate;
pub mod workflow;

pub use coordinator::{BranchOutcome, Clan, ClanConfig, ClanResult, ClanStrategy};
pub use descriptor::{Catalog, Descriptor};
pub use error::{EngineError, GraphValidationError, WorkflowStepError};
pub use graph::{GraphExecution, GraphResult, Memory, ThoughtGraph, ThoughtModule, Trace};
pub use orchestrator::{FailurePolicy, Orchestrator, OrchestratorConfig, OrchestratorResult};
pub use registry::CapabilityRegistry;
pub use runtime::Runtime;
pub use specialist::{Specialist, SpecialistConfig, SpecialistOutcome, SuspendedRun};
pub use workflow::{Dojo, DojoConfig, DojoResult, ErrorPolicy, RetryFallback, StepConfig};
