use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use shinobi_core::errors::{FailureClass, GatewayError};
use shinobi_core::gateway::{Completion, CompletionRequest, ModelGateway};

#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

/// Wraps a gateway with retry and a circuit breaker.
///
/// - Only `is_retryable()` errors are retried; fatal errors return at once
/// - `retry_after` hints override the computed backoff
/// - Backoff sleeps end early with `Cancelled` when the token fires
/// - N consecutive failures open the circuit until the cooldown elapses
pub struct ReliableGateway<G: ModelGateway> {
    inner: G,
    config: ReliableConfig,
    circuit_state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    total_retries: AtomicU64,
}

impl<G: ModelGateway> ReliableGateway<G> {
    pub fn new(inner: G, config: ReliableConfig) -> Self {
        Self {
            inner,
            config,
            circuit_state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: G) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    fn check_circuit(&self) -> Result<(), GatewayError> {
        let state = *self.circuit_state.read();
        match state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open { since } => {
                if since.elapsed() >= self.config.circuit_breaker_cooldown {
                    *self.circuit_state.write() = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(GatewayError::ProviderOverloaded)
                }
            }
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut state = self.circuit_state.write();
        if *state != CircuitState::Closed {
            info!(gateway = self.inner.name(), "circuit breaker closed");
            *state = CircuitState::Closed;
        }
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.circuit_state.write();
        // a failed half-open trial call reopens immediately
        let trip = *state == CircuitState::HalfOpen
            || (*state == CircuitState::Closed && failures >= self.config.circuit_breaker_threshold);
        if trip {
            warn!(
                gateway = self.inner.name(),
                failures,
                cooldown_ms = self.config.circuit_breaker_cooldown.as_millis() as u64,
                "circuit breaker opened"
            );
            *state = CircuitState::Open {
                since: Instant::now(),
            };
        }
    }

    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }
        let exp = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp.min(self.config.max_delay.as_millis() as f64);
        let range = capped * self.config.jitter_factor;
        let jitter = if range > 0.0 {
            rand::thread_rng().gen_range(-range..=range)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn circuit_state_name(&self) -> &'static str {
        match *self.circuit_state.read() {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    async fn with_retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, GatewayError>
    where
        T: Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, GatewayError>> + Send,
    {
        self.check_circuit()?;
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(GatewayError::Cancelled) => return Err(GatewayError::Cancelled),
                Err(e) if e.class() == FailureClass::Fatal => {
                    // Says nothing about provider health; leaves the circuit alone.
                    warn!(gateway = self.inner.name(), error = %e, "fatal gateway error, not retrying");
                    return Err(e);
                }
                Err(e) => {
                    if !e.is_retryable() || attempt >= self.config.max_retries {
                        self.record_failure();
                        return Err(e);
                    }
                    let delay = self.retry_delay(attempt, e.suggested_delay());
                    let _ = self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        gateway = self.inner.name(),
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after error"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    }
                    attempt += 1;
                    self.check_circuit()?;
                }
            }
        }
    }
}

#[async_trait]
impl<G: ModelGateway> ModelGateway for ReliableGateway<G> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, GatewayError> {
        let inner = &self.inner;
        self.with_retry(cancel, move || inner.complete(request, cancel))
            .await
    }

    async fn embed(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, GatewayError> {
        let inner = &self.inner;
        self.with_retry(cancel, move || inner.embed(text, cancel)).await
    }
}
