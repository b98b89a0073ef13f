//! # shinobi-core
//!
//! Shared vocabulary for the shinobi orchestration runtime.
//!
//! - **Branded IDs**: [`ids::RunId`], [`ids::ToolCallId`], [`ids::AgentId`] as newtypes
//! - **Messages**: [`messages::Message`] with `User`, `Assistant`, `ToolResult` variants
//! - **Gateway**: [`gateway::ModelGateway`], the abstract boundary to a language model
//! - **Capabilities**: [`capability::Capability`] and the [`shape::InputShape`] validator
//! - **Usage**: [`usage::Usage`], an associative token/cost aggregate
//! - **Results**: [`result::ExecutionResult`] with the ordered tool invocation trace
//! - **Events**: [`events::RuntimeEvent`] and the broadcast [`events::EventEmitter`]
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by every other shinobi crate.

#![deny(unsafe_code)]

pub mod capability;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod ids;
pub mod messages;
pub mod result;
pub mod shape;
pub mod usage;
