use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tokio::time::Instant;
use tracing::{info, warn};

use storm_core::errors::ProviderError;
use storm_core::provider::{ChatProvider, ChatRequest};

/// Retry and circuit breaker settings for [`ReliableProvider`].
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

/// Wraps a [`ChatProvider`] with retries and a circuit breaker.
///
/// - Retryable errors (rate limits, 5xx, overload, network) are retried with
///   exponential backoff and jitter.
/// - A `retry_after` hint on a rate limit replaces the computed delay.
/// - Fatal errors are returned at once.
/// - After `circuit_breaker_threshold` consecutive failed calls the circuit
///   opens and calls fail with `ProviderOverloaded` until the cooldown passes.
pub struct ReliableProvider<P: ChatProvider> {
    inner: P,
    config: ReliableConfig,
    circuit_state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    total_retries: AtomicU64,
}

impl<P: ChatProvider> ReliableProvider<P> {
    pub fn new(inner: P, config: ReliableConfig) -> Self {
        Self {
            inner,
            config,
            circuit_state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: P) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Retries performed across every call so far.
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

    fn check_circuit(&self) -> Result<(), ProviderError> {
        let state = *self.circuit_state.read();
        match state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open { since } if since.elapsed() >= self.config.circuit_breaker_cooldown => {
                *self.circuit_state.write() = CircuitState::HalfOpen;
                Ok(())
            }
            CircuitState::Open { .. } => Err(ProviderError::ProviderOverloaded),
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut state = self.circuit_state.write();
        if *state != CircuitState::Closed {
            info!(provider = self.inner.name(), "circuit breaker closed after successful request");
            *state = CircuitState::Closed;
        }
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures < self.config.circuit_breaker_threshold {
            return;
        }
        let mut state = self.circuit_state.write();
        if !matches!(*state, CircuitState::Open { .. }) {
            warn!(
                provider = self.inner.name(),
                failures,
                cooldown_secs = self.config.circuit_breaker_cooldown.as_secs(),
                "circuit breaker opened"
            );
            *state = CircuitState::Open { since: Instant::now() };
        }
    }

    /// Exponential backoff with jitter, unless the server suggested a delay.
    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }
        let exp = self.config.base_delay.as_millis() as f64 * 2f64.powi(attempt as i32);
        let capped = exp.min(self.config.max_delay.as_millis() as f64);
        let spread = capped * self.config.jitter_factor;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(1.0) as u64)
    }
}

#[async_trait]
impl<P: ChatProvider> ChatProvider for ReliableProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        self.check_circuit()?;

        let mut attempt = 0;
        loop {
            match self.inner.complete(request).await {
                Ok(text) => {
                    self.record_success();
                    return Ok(text);
                }
                Err(e) if e.is_fatal() || !e.is_retryable() || attempt >= self.config.max_retries => {
                    self.record_failure();
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.retry_delay(attempt, e.suggested_delay());
                    let _ = self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        provider = self.inner.name(),
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
