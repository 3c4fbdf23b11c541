//! Resilience Kit: retry with exponential backoff, a per-dependency
//! circuit breaker, and a bounded-concurrency semaphore with cooperative
//! cancellation.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, ErrorClass, Result};

/// Retry configuration. `jitter` is clamped to `[0, 0.5)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs_f64().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

/// `delay(n) = min(base_delay * 2^n * (1 + U(0, jitter)), max_delay)`, attempt `n`
/// is 0-indexed.
pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let jitter = config.jitter.clamp(0.0, 0.499_999);
    let pow = attempt.min(32);
    let base = config.base_delay.saturating_mul(2_u32.saturating_pow(pow));
    let capped = base.min(config.max_delay);
    if jitter <= 0.0 {
        return capped;
    }
    let factor = 1.0 + rand::random::<f64>() * jitter;
    let millis = (capped.as_millis() as f64 * factor).round() as u64;
    Duration::from_millis(millis).min(config.max_delay)
}

/// Runs `op` with retry, classifying each error via [`Error::class`]. Only
/// [`ErrorClass::Transient`] errors are retried; anything else returns immediately.
pub async fn retry<T, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retryable = err.class() == ErrorClass::Transient;
                if !retryable || attempt + 1 >= config.max_attempts {
                    return Err(err);
                }
                let delay = calculate_delay(config, attempt);
                warn!(attempt, ?delay, error = %err, "retrying after transient error");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "duration_secs")]
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(60),
        }
    }
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// A circuit breaker for one external dependency. Process-local, no cross-process
/// coordination.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicU32::new(0),
            opened_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Called before issuing the guarded call. Returns `Err(CircuitOpen)` if the
    /// breaker should fail fast, transitioning `open -> half_open` once the
    /// cool-down has elapsed.
    async fn before_call(&self) -> Result<()> {
        if self.state.load(Ordering::SeqCst) == STATE_OPEN {
            let mut opened_at = self.opened_at.lock().await;
            let elapsed = opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
            if elapsed >= self.config.cool_down {
                self.state.store(STATE_HALF_OPEN, Ordering::SeqCst);
                *opened_at = None;
                debug!(breaker = %self.name, "circuit half-open after cool-down");
            } else {
                return Err(Error::CircuitOpen(self.name.clone()));
            }
        }
        Ok(())
    }

    async fn on_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
        if self.state.swap(STATE_CLOSED, Ordering::SeqCst) == STATE_HALF_OPEN {
            debug!(breaker = %self.name, "circuit closed after half-open success");
        }
    }

    async fn on_failure(&self) {
        let state = self.state.load(Ordering::SeqCst);
        if state == STATE_HALF_OPEN {
            self.trip().await;
            return;
        }
        let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.config.failure_threshold {
            self.trip().await;
        }
    }

    async fn trip(&self) {
        self.state.store(STATE_OPEN, Ordering::SeqCst);
        *self.opened_at.lock().await = Some(Instant::now());
        self.failure_count.store(0, Ordering::SeqCst);
        warn!(breaker = %self.name, "circuit opened");
    }

    /// Runs `op` guarded by this breaker: fails fast with `CircuitOpen` while open,
    /// otherwise forwards the call and updates state from its outcome.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.before_call().await?;
        match op().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(err) => {
                self.on_failure().await;
                Err(err)
            }
        }
    }
}

/// A named, shared pair of breakers for the platform and analyzer dependencies
/// ("One breaker per external dependency").
pub struct CircuitBreakers {
    pub platform: Arc<CircuitBreaker>,
    pub analyzer: Arc<CircuitBreaker>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            platform: Arc::new(CircuitBreaker::new("platform", config.clone())),
            analyzer: Arc::new(CircuitBreaker::new("analyzer", config)),
        }
    }
}

/// A cooperative cancellation token observed at every I/O point.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Bounded concurrency around analyzer calls (default 8).
pub struct BoundedConcurrency {
    semaphore: Arc<Semaphore>,
}

impl BoundedConcurrency {
    pub fn new(permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Runs `op`, aborting early with `Error::Other("cancelled")` if `token` is
    /// already cancelled before a permit is acquired.
    pub async fn run<T, F, Fut>(&self, token: &CancelToken, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if token.is_cancelled() {
            return Err(Error::Other("cancelled".into()));
        }
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| Error::Other(e.to_string()))?;
        if token.is_cancelled() {
            return Err(Error::Other("cancelled".into()));
        }
        op().await
    }
}
