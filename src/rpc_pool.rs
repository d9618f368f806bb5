// src/rpc_pool.rs

use crate::metrics;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::settings::{self, Settings};
use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::prelude::{Http, Provider};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, info, warn};
use serde::Serialize;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type DefaultDirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Transport seam between the pool and a concrete RPC client.
///
/// The pool only needs two things from an endpoint: a way to build a connection handle
/// from its URL, and a cheap liveness probe. Everything else is a caller-supplied operation.
#[async_trait]
pub trait RpcConnector: Send + Sync + 'static {
    type Connection: Clone + Send + Sync + 'static;

    fn connect(&self, url: &str) -> Result<Self::Connection>;

    async fn probe(&self, connection: &Self::Connection) -> Result<()>;
}

/// JSON-RPC over HTTP through an `ethers` provider. The probe is any zero-argument
/// method (`getSlot`, `getHealth`, `eth_blockNumber`, ...).
#[derive(Debug, Clone)]
pub struct HttpConnector {
    probe_method: String,
}

impl HttpConnector {
    pub fn new(probe_method: impl Into<String>) -> Self {
        Self {
            probe_method: probe_method.into(),
        }
    }
}

#[async_trait]
impl RpcConnector for HttpConnector {
    type Connection = Arc<Provider<Http>>;

    fn connect(&self, url: &str) -> Result<Self::Connection> {
        let provider = Provider::<Http>::try_from(url)
            .with_context(|| format!("invalid RPC url {}", url))?;
        Ok(Arc::new(provider))
    }

    async fn probe(&self, connection: &Self::Connection) -> Result<()> {
        let params: Vec<serde_json::Value> = Vec::new();
        connection
            .request::<_, serde_json::Value>(&self.probe_method, params)
            .await
            .with_context(|| format!("{} probe failed", self.probe_method))?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcPoolError {
    #[error("no RPC endpoints configured")]
    NoEndpoints,
    #[error("no healthy RPC endpoint available ({checked} checked)")]
    NoHealthyEndpoint { checked: usize },
    #[error("invalid RPC endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },
    #[error("RPC endpoint {0} is already registered")]
    DuplicateEndpoint(String),
    #[error("'{label}' failed after {attempts} attempts: {last_error}")]
    Exhausted {
        label: String,
        attempts: u32,
        last_error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitBreakerStateName {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreakerStateName {
    fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

/// Mutable health state of one endpoint. Held under a short, never-awaited lock.
#[derive(Debug, Clone)]
struct EndpointHealth {
    state: CircuitBreakerStateName,
    is_healthy: bool,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_response_time: Option<Duration>,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        Self {
            state: CircuitBreakerStateName::Closed,
            is_healthy: true,
            consecutive_failures: 0,
            last_failure: None,
            last_response_time: None,
        }
    }
}

/// One RPC provider with tracked health.
pub struct Endpoint<T> {
    url: String,
    connection: T,
    health: Mutex<EndpointHealth>,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
}

impl<T> Endpoint<T> {
    fn new(url: String, connection: T, quota: Option<Quota>) -> Self {
        Self {
            url,
            connection,
            health: Mutex::new(EndpointHealth::default()),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            limiter: quota.map(|q| Arc::new(RateLimiter::direct(q))),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn health(&self) -> EndpointHealth {
        match self.health.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn with_health<R>(&self, f: impl FnOnce(&mut EndpointHealth) -> R) -> R {
        match self.health.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Whether the selection loop may try this endpoint now. An open circuit whose
    /// recovery window has elapsed is optimistically moved to half-open and marked healthy.
    fn is_selectable(&self, now: Instant, recovery_window: Duration) -> bool {
        self.with_health(|h| match h.state {
            CircuitBreakerStateName::Closed | CircuitBreakerStateName::HalfOpen => true,
            CircuitBreakerStateName::Open => {
                let window_elapsed = h
                    .last_failure
                    .map(|t| now.saturating_duration_since(t) >= recovery_window)
                    .unwrap_or(true);
                if window_elapsed {
                    h.state = CircuitBreakerStateName::HalfOpen;
                    h.is_healthy = true;
                    info!("Endpoint {} recovery window elapsed, circuit is now HalfOpen.", self.url);
                    metrics::set_circuit_breaker_state(&self.url, h.state.gauge_value());
                }
                window_elapsed
            }
        })
    }

    fn record_success(&self, response_time: Duration) {
        self.with_health(|h| {
            if h.state != CircuitBreakerStateName::Closed {
                info!("Endpoint {} recovered, circuit is now Closed.", self.url);
                metrics::set_circuit_breaker_state(&self.url, 0.0);
            }
            h.state = CircuitBreakerStateName::Closed;
            h.is_healthy = true;
            h.consecutive_failures = 0;
            h.last_response_time = Some(response_time);
        });
    }

    fn record_failure(&self, failure_threshold: u32) {
        self.with_health(|h| {
            h.consecutive_failures = h.consecutive_failures.saturating_add(1);
            h.last_failure = Some(Instant::now());

            let should_open = match h.state {
                CircuitBreakerStateName::HalfOpen => true,
                CircuitBreakerStateName::Closed => h.consecutive_failures >= failure_threshold,
                CircuitBreakerStateName::Open => false,
            };
            if should_open {
                h.state = CircuitBreakerStateName::Open;
                h.is_healthy = false;
                warn!(
                    "Endpoint {} circuit breaker is now Open after {} consecutive failures.",
                    self.url, h.consecutive_failures
                );
                metrics::set_circuit_breaker_state(&self.url, 1.0);
                metrics::increment_circuit_breaker_opened(&self.url);
            }
        });
    }

    async fn throttle(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    fn stats(&self) -> EndpointStats {
        let h = self.health();
        EndpointStats {
            url: self.url.clone(),
            healthy: h.is_healthy,
            circuit_state: h.state,
            consecutive_failures: h.consecutive_failures,
            last_response_ms: h.last_response_time.map(|d| d.as_millis() as u64),
            seconds_since_last_failure: h.last_failure.map(|t| t.elapsed().as_secs()),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of one endpoint, for admin output.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub url: String,
    pub healthy: bool,
    pub circuit_state: CircuitBreakerStateName,
    pub consecutive_failures: u32,
    pub last_response_ms: Option<u64>,
    pub seconds_since_last_failure: Option<u64>,
    pub total_requests: u64,
    pub successful_requests: u64,
}

/// An endpoint the pool currently believes healthy, plus its connection handle.
pub struct HealthyConnection<T> {
    pub url: String,
    pub connection: T,
    index: usize,
    endpoint: Arc<Endpoint<T>>,
}

/// Ordered list of RPC endpoints with health tracking, circuit breaking and fallback.
///
/// ## Features
///
/// - **Priority Order**: endpoints are probed in list order starting from a rotating cursor
/// - **Circuit Breakers**: an endpoint is skipped after `failure_threshold` consecutive
///   failures until `recovery_window` has elapsed since its last failure
/// - **Bounded Retry**: `execute_with_fallback` retries across endpoints with capped
///   exponential backoff and fails with an error naming the operation
/// - **Rate Limiting**: optional per-endpoint QPS cap
///
/// ## Usage
///
/// ```rust,ignore
/// let rpc_pool = Arc::new(RpcPool::new(&settings)?);
/// let slot = rpc_pool
///     .execute_with_fallback("get_slot", |provider| async move {
///         Ok(provider.request::<_, u64>("getSlot", Vec::<u8>::new()).await?)
///     })
///     .await?;
/// ```
pub struct RpcPool<C: RpcConnector = HttpConnector> {
    connector: Arc<C>,
    endpoints: RwLock<Vec<Arc<Endpoint<C::Connection>>>>,
    cursor: AtomicUsize,
    failure_threshold: u32,
    recovery_window: Duration,
    probe_timeout: Duration,
    retry_policy: RetryPolicy,
    quota: Option<Quota>,
}

impl RpcPool<HttpConnector> {
    /// Builds the pool from settings using the HTTP JSON-RPC connector.
    pub fn new(settings: &Settings) -> Result<Self> {
        let connector = HttpConnector::new(settings.rpc.probe_method.clone());
        Self::with_connector(connector, &settings.rpc.http_urls, &settings.rpc)
    }
}

impl<C: RpcConnector> RpcPool<C> {
    pub fn with_connector(connector: C, urls: &[String], cfg: &settings::Rpc) -> Result<Self> {
        let quota = NonZeroU32::new(cfg.max_qps_per_endpoint).map(Quota::per_second);

        let mut endpoints: Vec<Arc<Endpoint<C::Connection>>> = Vec::new();
        for url in urls {
            if endpoints.iter().any(|e| &e.url == url) {
                debug!("Skipping duplicate RPC endpoint {}", url);
                continue;
            }
            match connector.connect(url) {
                Ok(connection) => endpoints.push(Arc::new(Endpoint::new(url.clone(), connection, quota))),
                Err(e) => warn!("Skipping RPC endpoint {}: {:#}", url, e),
            }
        }

        if endpoints.is_empty() {
            return Err(RpcPoolError::NoEndpoints.into());
        }
        info!("RPC pool initialised with {} endpoints", endpoints.len());

        Ok(Self {
            connector: Arc::new(connector),
            endpoints: RwLock::new(endpoints),
            cursor: AtomicUsize::new(0),
            failure_threshold: cfg.circuit_breaker.failure_threshold.max(1),
            recovery_window: cfg.recovery_window(),
            probe_timeout: cfg.probe_timeout(),
            retry_policy: RetryPolicy::from(&cfg.retry),
            quota,
        })
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    fn snapshot(&self) -> Vec<Arc<Endpoint<C::Connection>>> {
        match self.endpoints.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Returns the total number of endpoints in the pool, regardless of health.
    pub fn endpoint_count(&self) -> usize {
        self.snapshot().len()
    }

    pub fn current_cursor(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Probes endpoints in priority order from the cursor and returns the first one that
    /// answers. Endpoints inside their recovery window are skipped without a probe.
    pub async fn get_healthy_connection(&self) -> Result<HealthyConnection<C::Connection>, RpcPoolError> {
        let endpoints = self.snapshot();
        let n = endpoints.len();
        if n == 0 {
            return Err(RpcPoolError::NoEndpoints);
        }

        let start = self.cursor.load(Ordering::SeqCst) % n;
        let mut checked = 0;
        for step in 0..n {
            let index = (start + step) % n;
            let endpoint = &endpoints[index];

            if !endpoint.is_selectable(Instant::now(), self.recovery_window) {
                debug!("Skipping {} (circuit open, inside recovery window)", endpoint.url);
                continue;
            }

            checked += 1;
            endpoint.throttle().await;
            let started = Instant::now();
            let probe = tokio::time::timeout(self.probe_timeout, self.connector.probe(&endpoint.connection)).await;

            match probe {
                Ok(Ok(())) => {
                    endpoint.record_success(started.elapsed());
                    self.cursor.store(index, Ordering::SeqCst);
                    return Ok(HealthyConnection {
                        url: endpoint.url.clone(),
                        connection: endpoint.connection.clone(),
                        index,
                        endpoint: Arc::clone(endpoint),
                    });
                }
                Ok(Err(e)) => {
                    debug!("Probe failed for {}: {:#}", endpoint.url, e);
                    endpoint.record_failure(self.failure_threshold);
                    self.cursor.store((index + 1) % n, Ordering::SeqCst);
                }
                Err(_) => {
                    debug!("Probe timed out for {} after {:?}", endpoint.url, self.probe_timeout);
                    endpoint.record_failure(self.failure_threshold);
                    self.cursor.store((index + 1) % n, Ordering::SeqCst);
                }
            }
        }

        Err(RpcPoolError::NoHealthyEndpoint { checked })
    }

    /// Runs `operation` against a healthy endpoint, rotating to the next endpoint and
    /// backing off on each failure. Fails with [`RpcPoolError::Exhausted`] naming `label`
    /// once the retry policy's attempts are used up.
    pub async fn execute_with_fallback<T, F, Fut>(&self, label: &str, operation: F) -> Result<T, RpcPoolError>
    where
        F: Fn(C::Connection) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = AtomicU32::new(0);
        let operation = &operation;
        let attempts_ref = &attempts;

        let result = retry_with_backoff(&self.retry_policy, || async move {
            let attempt = attempts_ref.fetch_add(1, Ordering::SeqCst) + 1;
            let handle = match self.get_healthy_connection().await {
                Ok(handle) => handle,
                Err(e) => return Err(anyhow::Error::from(e)),
            };
            let endpoint = Arc::clone(&handle.endpoint);
            endpoint.total_requests.fetch_add(1, Ordering::Relaxed);

            endpoint.throttle().await;
            let started = Instant::now();
            match operation(handle.connection).await {
                Ok(value) => {
                    endpoint.record_success(started.elapsed());
                    endpoint.successful_requests.fetch_add(1, Ordering::Relaxed);
                    metrics::increment_rpc_attempt("success");
                    Ok(value)
                }
                Err(e) => {
                    warn!("'{}' attempt {} failed on {}: {:#}", label, attempt, endpoint.url, e);
                    endpoint.record_failure(self.failure_threshold);
                    self.advance_cursor_from(handle.index);
                    metrics::increment_rpc_attempt("failure");
                    Err(e.context(format!("{} via {}", label, endpoint.url)))
                }
            }
        })
        .await;

        result.map_err(|e| {
            let attempts = attempts.load(Ordering::SeqCst);
            warn!("'{}' exhausted all RPC fallbacks after {} attempts: {:#}", label, attempts, e);
            RpcPoolError::Exhausted {
                label: label.to_string(),
                attempts,
                last_error: format!("{:#}", e),
            }
        })
    }

    fn advance_cursor_from(&self, index: usize) {
        let n = self.endpoint_count();
        if n > 0 {
            self.cursor.store((index + 1) % n, Ordering::SeqCst);
        }
    }

    /// Appends an endpoint at the lowest priority.
    pub fn add_endpoint(&self, url: &str) -> Result<(), RpcPoolError> {
        let connection = self
            .connector
            .connect(url)
            .map_err(|e| RpcPoolError::InvalidEndpoint {
                url: url.to_string(),
                reason: format!("{:#}", e),
            })?;

        let mut guard = match self.endpoints.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.iter().any(|e| e.url == url) {
            return Err(RpcPoolError::DuplicateEndpoint(url.to_string()));
        }
        guard.push(Arc::new(Endpoint::new(url.to_string(), connection, self.quota)));
        info!("Added RPC endpoint {} ({} total)", url, guard.len());
        Ok(())
    }

    /// Removes an endpoint. Returns false when the URL is unknown.
    pub fn remove_endpoint(&self, url: &str) -> bool {
        let mut guard = match self.endpoints.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(removed) = guard.iter().position(|e| e.url == url) else {
            return false;
        };
        guard.remove(removed);

        let cursor = self.cursor.load(Ordering::SeqCst);
        let new_cursor = if removed == cursor || cursor >= guard.len() {
            0
        } else if removed < cursor {
            cursor - 1
        } else {
            cursor
        };
        self.cursor.store(new_cursor, Ordering::SeqCst);
        info!("Removed RPC endpoint {} ({} remaining)", url, guard.len());
        true
    }

    pub fn endpoint_stats(&self) -> Vec<EndpointStats> {
        self.snapshot().iter().map(|e| e.stats()).collect()
    }

    /// Aggregate (success rate over all operations, number of open circuits).
    pub fn resilience_stats(&self) -> (f64, u32) {
        let mut total = 0u64;
        let mut success = 0u64;
        let mut open = 0u32;
        for endpoint in self.snapshot() {
            total += endpoint.total_requests.load(Ordering::Relaxed);
            success += endpoint.successful_requests.load(Ordering::Relaxed);
            if endpoint.health().state == CircuitBreakerStateName::Open {
                open += 1;
            }
        }
        let rate = if total > 0 { success as f64 / total as f64 } else { 1.0 };
        (rate, open)
    }

    /// Spawns a background task that re-probes endpoints whose circuit is not closed once
    /// their recovery window has elapsed, so they rejoin the rotation without waiting for
    /// a caller to stumble onto them.
    pub fn spawn_health_checker(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for endpoint in pool.snapshot() {
                    if endpoint.health().state == CircuitBreakerStateName::Closed {
                        continue;
                    }
                    if !endpoint.is_selectable(Instant::now(), pool.recovery_window) {
                        continue;
                    }
                    let started = Instant::now();
                    let probe =
                        tokio::time::timeout(pool.probe_timeout, pool.connector.probe(&endpoint.connection)).await;
                    match probe {
                        Ok(Ok(())) => endpoint.record_success(started.elapsed()),
                        _ => endpoint.record_failure(pool.failure_threshold),
                    }
                }
            }
        })
    }
}
