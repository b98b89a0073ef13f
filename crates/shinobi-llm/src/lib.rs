//! # shinobi-llm
//!
//! Gateway-side helpers. The runtime talks to models only through
//! [`shinobi_core::gateway::ModelGateway`]; this crate supplies the pieces
//! that sit on that boundary without committing to a vendor:
//!
//! - [`mock::MockGateway`]: deterministic scripted gateway for tests and dry runs
//! - [`reliable::ReliableGateway`]: retry with backoff and a circuit breaker
//! - [`pricing::PriceTable`]: per-model prices, integer micro-dollar costs

#![deny(unsafe_code)]

pub mod mock;
pub mod pricing;
pub mod reliable;

pub use mock::{MockGateway, MockResponse};
pub use pricing::{PriceTable, PricingTier};
pub use reliable::{ReliableConfig, ReliableGateway};
