use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use shinobi_core::events::EventEmitter;
use shinobi_core::gateway::ModelGateway;
use shinobi_llm::pricing::PriceTable;
use shinobi_llm::reliable::{ReliableConfig, ReliableGateway};
use shinobi_settings::{GatewaySettings, ShinobiSettings};

use crate::descriptor::Catalog;
use crate::graph::{GraphExecution, ThoughtGraph};
use crate::registry::CapabilityRegistry;

/// Everything a run needs, passed explicitly into every component.
///
/// Cheap to clone. Nothing here is mutated by a run; per-run state
/// (conversation, memory, trace) is created by the run itself.
#[derive(Clone)]
pub struct Runtime {
    gateway: Arc<dyn ModelGateway>,
    capabilities: Arc<CapabilityRegistry>,
    settings: Arc<ShinobiSettings>,
    prices: Arc<PriceTable>,
    events: Arc<EventEmitter>,
    reasoners: Arc<HashMap<String, Arc<ThoughtGraph>>>,
}

impl Runtime {
    pub fn new(gateway: Arc<dyn ModelGateway>, capabilities: CapabilityRegistry) -> Self {
        Self {
            gateway,
            capabilities: Arc::new(capabilities),
            settings: Arc::new(ShinobiSettings::default()),
            prices: Arc::new(PriceTable::with_defaults()),
            events: Arc::new(EventEmitter::new()),
            reasoners: Arc::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: ShinobiSettings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    #[must_use]
    pub fn with_prices(mut self, prices: PriceTable) -> Self {
        self.prices = Arc::new(prices);
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: Arc<EventEmitter>) -> Self {
        self.events = events;
        self
    }

    /// Register a reasoning graph that specialists can reference by name.
    /// A graph without an explicit execution policy takes `settings.graph`
    /// as it stands at registration.
    #[must_use]
    pub fn with_reasoner(mut self, name: impl Into<String>, graph: ThoughtGraph) -> Self {
        let graph = graph.or_execution(GraphExecution::from_settings(&self.settings.graph));
        let _ = Arc::make_mut(&mut self.reasoners).insert(name.into(), Arc::new(graph));
        self
    }

    /// Wrap the gateway with retry and circuit breaking from the current
    /// gateway settings.
    #[must_use]
    pub fn with_reliable_gateway(mut self) -> Self {
        let config = reliable_config(&self.settings.gateway);
        self.gateway = Arc::new(ReliableGateway::new(Arc::clone(&self.gateway), config));
        self
    }

    pub fn gateway(&self) -> &Arc<dyn ModelGateway> {
        &self.gateway
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn settings(&self) -> &ShinobiSettings {
        &self.settings
    }

    pub fn prices(&self) -> &Arc<PriceTable> {
        &self.prices
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn reasoner(&self, name: &str) -> Option<Arc<ThoughtGraph>> {
        self.reasoners.get(name).map(Arc::clone)
    }

    /// Names descriptors may reference.
    pub fn catalog(&self) -> Catalog {
        Catalog {
            capabilities: self.capabilities.names().into_iter().collect(),
            modules: Some(self.reasoners.keys().cloned().collect::<BTreeSet<_>>()),
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("gateway", &self.gateway.name())
            .field("capabilities", &self.capabilities)
            .field("reasoners", &self.reasoners.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

pub fn reliable_config(settings: &GatewaySettings) -> ReliableConfig {
    ReliableConfig {
        max_retries: settings.max_retries,
        base_delay: std::time::Duration::from_millis(settings.base_delay_ms),
        max_delay: std::time::Duration::from_millis(settings.max_delay_ms),
        jitter_factor: settings.jitter_factor,
        circuit_breaker_threshold: settings.circuit_breaker_threshold,
        circuit_breaker_cooldown: std::time::Duration::from_millis(settings.circuit_breaker_cooldown_ms),
    }
}
