use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use metrics::counter;
use serde_json::Value;
use tracing::{debug, error, warn};

use shinobi_core::capability::{Capability, CapabilityContext, CapabilityDefinition, CapabilityError};
use shinobi_core::messages::ToolCallBlock;

use crate::error::EngineError;

/// Closed name-to-capability table. Dispatch is an explicit lookup.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

/// Result of one dispatched call.
#[derive(Debug)]
pub struct Dispatch {
    pub outcome: Result<Value, CapabilityError>,
    pub duration: Duration,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names are unique; registering a second capability under a taken
    /// name is an error.
    pub fn register(&mut self, capability: Arc<dyn Capability>) -> Result<(), EngineError> {
        let name = capability.name().to_string();
        if self.capabilities.contains_key(&name) {
            return Err(EngineError::DuplicateCapability(name));
        }
        let _ = self.capabilities.insert(name, capability);
        Ok(())
    }

    pub fn with(mut self, capability: Arc<dyn Capability>) -> Result<Self, EngineError> {
        self.register(capability)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions for the model, sorted by name.
    pub fn definitions(&self) -> Vec<CapabilityDefinition> {
        let mut defs: Vec<CapabilityDefinition> =
            self.capabilities.values().map(|c| c.describe()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Registry restricted to `names`. Unknown or repeated names are errors.
    pub fn subset<S: AsRef<str>>(&self, names: &[S]) -> Result<Self, EngineError> {
        let mut subset = Self::new();
        for name in names {
            let name = name.as_ref();
            let capability = self
                .get(name)
                .ok_or_else(|| EngineError::invalid(format!("unknown capability '{name}'")))?;
            subset.register(capability)?;
        }
        Ok(subset)
    }

    /// Look up, validate, then invoke under `timeout`.
    ///
    /// Invocation happens only after validation succeeded. A panicking or
    /// timed-out capability becomes an error outcome.
    pub async fn dispatch(
        &self,
        call: &ToolCallBlock,
        ctx: &CapabilityContext,
        timeout: Duration,
    ) -> Dispatch {
        let start = Instant::now();
        let outcome = self.dispatch_inner(call, ctx, timeout).await;
        let label = match &outcome {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        counter!("capability_invocations_total", "outcome" => label).increment(1);
        Dispatch {
            outcome,
            duration: start.elapsed(),
        }
    }

    async fn dispatch_inner(
        &self,
        call: &ToolCallBlock,
        ctx: &CapabilityContext,
        timeout: Duration,
    ) -> Result<Value, CapabilityError> {
        let Some(capability) = self.get(&call.name) else {
            warn!(capability = %call.name, "unknown capability requested");
            return Err(CapabilityError::Unknown(call.name.clone()));
        };

        let input = capability.validate(&call.arguments).inspect_err(|e| {
            debug!(capability = %call.name, error = %e, "capability input rejected");
        })?;

        if ctx.cancel.is_cancelled() {
            return Err(CapabilityError::Cancelled);
        }

        let invocation = std::panic::AssertUnwindSafe(capability.invoke(input, ctx)).catch_unwind();
        tokio::select! {
            result = tokio::time::timeout(timeout, invocation) => match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(panic)) => {
                    let msg = panic_message(&panic);
                    error!(capability = %call.name, panic = %msg, "capability panicked");
                    Err(CapabilityError::execution("capability crashed"))
                }
                Err(_) => {
                    warn!(
                        capability = %call.name,
                        timeout_ms = timeout.as_millis() as u64,
                        "capability timed out"
                    );
                    Err(CapabilityError::Timeout(timeout))
                }
            },
            () = ctx.cancel.cancelled() => Err(CapabilityError::Cancelled),
        }
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.names())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shinobi_core::capability::CapabilityDescriptor;
    use shinobi_core::shape::InputShape;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo(name: &str) -> Arc<dyn Capability> {
        Arc::new(CapabilityDescriptor::new(
            name,
            "echo the input",
            InputShape::object().required("text", json!({"type": "string"})).build(),
            |input, _ctx| async move { Ok(input["text"].clone()) },
        ))
    }

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::new()
            .with(echo("echo"))
            .and_then(|r| r.with(echo("shout")))
            .unwrap()
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut reg = registry();
        let err = reg.register(echo("echo")).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateCapability(name) if name == "echo"));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn names_and_definitions_sorted() {
        let reg = registry();
        assert_eq!(reg.names(), vec!["echo", "shout"]);
        let defs = reg.definitions();
        assert_eq!(defs[0].name, "echo");
        assert_eq!(defs[1].input_shape.schema()["required"][0], "text");
    }

    #[test]
    fn subset_resolves_names() {
        let reg = registry();
        let sub = reg.subset(&["shout"]).unwrap();
        assert!(sub.contains("shout"));
        assert!(!sub.contains("echo"));

        assert!(matches!(reg.subset(&["missing"]), Err(EngineError::InvalidConfig(_))));
        assert!(matches!(
            reg.subset(&["echo", "echo"]),
            Err(EngineError::DuplicateCapability(_))
        ));
    }

    #[tokio::test]
    async fn dispatch_success() {
        let call = ToolCallBlock::new("echo", json!({"text": "hi"}));
        let out = registry()
            .dispatch(&call, &CapabilityContext::detached(), Duration::from_secs(1))
            .await;
        assert_eq!(out.outcome.unwrap(), json!("hi"));
    }

    #[tokio::test]
    async fn invalid_input_never_invokes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let cap: Arc<dyn Capability> = Arc::new(CapabilityDescriptor::new(
            "count",
            "counts invocations",
            InputShape::object().required("n", json!({"type": "integer"})).build(),
            move |_input, _ctx| {
                let seen = seen.clone();
                async move {
                    let _ = seen.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            },
        ));
        let reg = CapabilityRegistry::new().with(cap).unwrap();
        let call = ToolCallBlock::new("count", json!({"n": "three"}));
        let out = reg
            .dispatch(&call, &CapabilityContext::detached(), Duration::from_secs(1))
            .await;
        assert!(matches!(out.outcome, Err(CapabilityError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_capability() {
        let call = ToolCallBlock::new("nope", json!({}));
        let out = registry()
            .dispatch(&call, &CapabilityContext::detached(), Duration::from_secs(1))
            .await;
        assert!(matches!(out.outcome, Err(CapabilityError::Unknown(name)) if name == "nope"));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let cap: Arc<dyn Capability> = Arc::new(CapabilityDescriptor::new(
            "boom",
            "panics",
            InputShape::empty_object(),
            |_input, _ctx| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(Value::Null)
            },
        ));
        let reg = CapabilityRegistry::new().with(cap).unwrap();
        let call = ToolCallBlock::new("boom", json!({}));
        let out = reg
            .dispatch(&call, &CapabilityContext::detached(), Duration::from_secs(1))
            .await;
        assert!(matches!(out.outcome, Err(CapabilityError::Execution(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_capability_times_out() {
        let cap: Arc<dyn Capability> = Arc::new(CapabilityDescriptor::new(
            "slow",
            "sleeps",
            InputShape::empty_object(),
            |_input, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            },
        ));
        let reg = CapabilityRegistry::new().with(cap).unwrap();
        let call = ToolCallBlock::new("slow", json!({}));
        let out = reg
            .dispatch(&call, &CapabilityContext::detached(), Duration::from_millis(50))
            .await;
        assert!(matches!(out.outcome, Err(CapabilityError::Timeout(_))));
    }
}
