//! Bounded, health-checked connection pools for upstream services.
//!
//! Each upstream (embedder, vector store, LLM) gets its own
//! [`ConnectionPool`]. A semaphore with `max_connections` permits bounds the
//! number of active connections, and the slot table tracking per-connection
//! state never holds more than `max_connections` entries, unhealthy ones
//! included. The table sits behind a `std::sync::Mutex` that is never held
//! across an `.await`. Connections move through
//! `Idle -> Active -> Idle`, become `Unhealthy` after repeated operation
//! failures, and are `Closed` when reaped, replaced or shut down.

pub mod breaker;
pub mod retry;

pub use breaker::{CircuitBreaker, CircuitState};
pub use retry::{compute_backoff, with_retry};

use crate::config::{PoolConfig, RetryConfig};
use crate::error::{RagError, Result};
use crate::lock;
use crate::monitor::PerformanceMonitor;
use crate::services::Upstream;
use serde::Serialize;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Creates a new upstream client. Called whenever the pool opens a connection.
pub type ConnectionFactory<T> = Arc<dyn Fn() -> Result<Arc<T>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Active,
    Unhealthy,
    Closed,
}

/// Runtime pool settings, derived from [`PoolConfig`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub min_connections: usize,
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub health_check_interval: Duration,
    pub acquire_timeout: Duration,
    pub failure_threshold: u32,
    pub max_failed_probes: u32,
    pub breaker_failure_threshold: u32,
    pub breaker_recovery: Duration,
    pub breaker_max_recovery: Duration,
}

impl From<&PoolConfig> for PoolSettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            min_connections: config.min_connections,
            max_connections: config.max_connections,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            health_check_interval: Duration::from_secs(config.health_check_interval_secs),
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            failure_threshold: config.failure_threshold,
            max_failed_probes: config.max_failed_probes,
            breaker_failure_threshold: config.breaker_failure_threshold,
            breaker_recovery: Duration::from_secs(config.breaker_recovery_secs),
            breaker_max_recovery: Duration::from_secs(config.breaker_max_recovery_secs),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

struct PooledConnection<T: ?Sized> {
    id: u64,
    handle: Arc<T>,
    state: ConnectionState,
    last_used_at: Instant,
    consecutive_failures: u32,
    failed_probes: u32,
}

impl<T: ?Sized> PooledConnection<T> {
    fn is_live(&self) -> bool {
        matches!(self.state, ConnectionState::Idle | ConnectionState::Active)
    }
}

fn live_count<T: ?Sized>(slots: &[PooledConnection<T>]) -> usize {
    slots.iter().filter(|c| c.is_live()).count()
}

/// Overall health as surfaced to callers and status reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealth {
    Healthy,
    /// Some connections are unhealthy or the breaker is on a recovery trial.
    Degraded,
    /// Probing suspended; new connections are refused.
    CircuitOpen,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub service: String,
    pub active: usize,
    pub idle: usize,
    pub unhealthy: usize,
    pub min_connections: usize,
    pub max_connections: usize,
    pub health: PoolHealth,
}

struct PoolInner<T: ?Sized> {
    service: String,
    settings: RwLock<PoolSettings>,
    retry: RetryConfig,
    factory: ConnectionFactory<T>,
    slots: Mutex<Vec<PooledConnection<T>>>,
    permits: Arc<Semaphore>,
    breaker: Mutex<CircuitBreaker>,
    monitor: OnceLock<Arc<PerformanceMonitor>>,
    next_id: AtomicU64,
    /// Permits still to be retired after `max_connections` shrank below the
    /// number currently checked out.
    shrink_debt: AtomicUsize,
    closed: AtomicBool,
}

impl<T: ?Sized + Upstream + 'static> PoolInner<T> {
    fn settings(&self) -> PoolSettings {
        self.settings
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn metric(&self, suffix: &str) -> String {
        format!("pool.{}.{suffix}", self.service)
    }

    fn open_connection(&self, state: ConnectionState) -> Result<PooledConnection<T>> {
        let handle = (self.factory)()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(service = %self.service, id, "Opened connection");
        Ok(PooledConnection {
            id,
            handle,
            state,
            last_used_at: Instant::now(),
            consecutive_failures: 0,
            failed_probes: 0,
        })
    }

    /// Most recently used idle connection, marked active.
    fn checkout_idle(&self) -> Option<(u64, Arc<T>)> {
        let mut slots = lock(&self.slots);
        let conn = slots
            .iter_mut()
            .filter(|c| c.state == ConnectionState::Idle)
            .max_by_key(|c| c.last_used_at)?;
        conn.state = ConnectionState::Active;
        conn.last_used_at = Instant::now();
        Some((conn.id, conn.handle.clone()))
    }

    fn release(&self, id: u64, failed: bool) {
        let settings = self.settings();
        let mut slots = lock(&self.slots);
        let surplus = slots.len() > settings.max_connections;
        let Some(conn) = slots.iter_mut().find(|c| c.id == id) else {
            return;
        };
        conn.last_used_at = Instant::now();

        if self.closed.load(Ordering::SeqCst) {
            conn.state = ConnectionState::Closed;
        } else if failed {
            conn.consecutive_failures += 1;
            if conn.consecutive_failures >= settings.failure_threshold {
                warn!(
                    service = %self.service,
                    id,
                    failures = conn.consecutive_failures,
                    "Connection marked unhealthy"
                );
                conn.state = ConnectionState::Unhealthy;
            } else {
                conn.state = ConnectionState::Idle;
            }
        } else {
            conn.consecutive_failures = 0;
            conn.state = ConnectionState::Idle;
        }

        if surplus && conn.state == ConnectionState::Idle {
            debug!(service = %self.service, id, "Closing surplus connection");
            conn.state = ConnectionState::Closed;
        }
        slots.retain(|c| c.state != ConnectionState::Closed);
    }

    fn take_shrink_debt(&self) -> bool {
        self.shrink_debt
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1))
            .is_ok()
    }
}

/// Scoped access to one pooled connection. Released on drop.
pub struct PooledHandle<T: ?Sized + Upstream + 'static> {
    id: u64,
    handle: Arc<T>,
    pool: Arc<PoolInner<T>>,
    permit: Option<OwnedSemaphorePermit>,
    failed: bool,
}

impl<T: ?Sized + Upstream + 'static> PooledHandle<T> {
    /// Shared handle to the upstream client.
    pub fn handle(&self) -> Arc<T> {
        self.handle.clone()
    }

    /// Count this checkout as a failed operation on the connection.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T: ?Sized + Upstream + 'static> Deref for PooledHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.handle
    }
}

impl<T: ?Sized + Upstream + 'static> std::fmt::Debug for PooledHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHandle")
            .field("id", &self.id)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl<T: ?Sized + Upstream + 'static> Drop for PooledHandle<T> {
    fn drop(&mut self) {
        self.pool.release(self.id, self.failed);
        if let Some(permit) = self.permit.take()
            && self.pool.take_shrink_debt()
        {
            permit.forget();
        }
    }
}

/// A pool of connections to one upstream service.
pub struct ConnectionPool<T: ?Sized + Upstream + 'static> {
    inner: Arc<PoolInner<T>>,
}

impl<T: ?Sized + Upstream + 'static> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized + Upstream + 'static> ConnectionPool<T> {
    pub fn new(
        service: impl Into<String>,
        settings: PoolSettings,
        retry: RetryConfig,
        factory: ConnectionFactory<T>,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            settings.breaker_failure_threshold,
            settings.breaker_recovery,
            settings.breaker_max_recovery,
        );
        let max = settings.max_connections.max(1);
        Self {
            inner: Arc::new(PoolInner {
                service: service.into(),
                settings: RwLock::new(settings),
                retry,
                factory,
                slots: Mutex::new(Vec::new()),
                permits: Arc::new(Semaphore::new(max)),
                breaker: Mutex::new(breaker),
                monitor: OnceLock::new(),
                next_id: AtomicU64::new(0),
                shrink_debt: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Publish pool metrics to `monitor`.
    pub fn with_monitor(self, monitor: Arc<PerformanceMonitor>) -> Self {
        let _ = self.inner.monitor.set(monitor);
        self
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn settings(&self) -> PoolSettings {
        self.inner.settings()
    }

    /// Check out a healthy connection, waiting up to `acquire_timeout` for one
    /// to free up.
    pub async fn acquire(&self) -> Result<PooledHandle<T>> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(RagError::upstream(&inner.service, "connection pool is closed"));
        }

        let timeout = inner.settings().acquire_timeout;
        let started = Instant::now();
        let permit =
            match tokio::time::timeout(timeout, inner.permits.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    return Err(RagError::upstream(
                        &inner.service,
                        "connection pool is closed",
                    ));
                }
                Err(_) => {
                    let waited_ms = started.elapsed().as_millis() as u64;
                    warn!(service = %inner.service, waited_ms, "Connection pool exhausted");
                    if let Some(monitor) = inner.monitor.get() {
                        monitor.increment(&inner.metric("exhausted"));
                    }
                    return Err(RagError::PoolExhausted {
                        service: inner.service.clone(),
                        waited_ms,
                    });
                }
            };
        if let Some(monitor) = inner.monitor.get() {
            monitor.observe(
                &inner.metric("acquire_wait_ms"),
                started.elapsed().as_secs_f64() * 1000.0,
            );
        }

        let (id, handle) = match inner.checkout_idle() {
            Some(found) => found,
            None => {
                if lock(&inner.breaker).is_open() {
                    return Err(RagError::upstream(
                        &inner.service,
                        "circuit open and no idle connection available",
                    ));
                }
                let max = inner.settings().max_connections;
                let mut slots = lock(&inner.slots);
                if slots.len() >= max {
                    // Every slot not checked out is waiting on the health checker.
                    return Err(RagError::upstream(
                        &inner.service,
                        "no healthy connection available",
                    ));
                }
                let conn = inner.open_connection(ConnectionState::Active)?;
                let found = (conn.id, conn.handle.clone());
                slots.push(conn);
                found
            }
        };

        Ok(PooledHandle {
            id,
            handle,
            pool: inner.clone(),
            permit: Some(permit),
            failed: false,
        })
    }

    /// Run `op` on a pooled connection, retrying transient failures with
    /// exponential backoff on a fresh checkout each time.
    pub async fn execute<R, F, Fut>(&self, op: F) -> Result<R>
    where
        F: Fn(Arc<T>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let this = self;
        let op = &op;
        with_retry(&self.inner.retry, &self.inner.service, move || async move {
            this.call_once(op).await
        })
        .await
    }

    async fn call_once<R, F, Fut>(&self, op: &F) -> Result<R>
    where
        F: Fn(Arc<T>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let mut conn = self.acquire().await?;
        let started = Instant::now();
        let result = op(conn.handle()).await;
        if let Some(monitor) = self.inner.monitor.get() {
            monitor.observe(
                &self.inner.metric("call_ms"),
                started.elapsed().as_secs_f64() * 1000.0,
            );
        }
        if let Err(e) = &result
            && e.is_retryable()
        {
            conn.mark_failed();
        }
        result
    }

    /// Resize the pool and adjust its timing.
    pub fn configure(
        &self,
        min_connections: usize,
        max_connections: usize,
        idle_timeout: Duration,
        health_check_interval: Duration,
    ) -> Result<()> {
        if max_connections == 0 || min_connections > max_connections {
            return Err(RagError::malformed(format!(
                "invalid pool bounds min={min_connections} max={max_connections}"
            )));
        }
        let inner = &self.inner;
        let old_max = {
            let mut settings = inner
                .settings
                .write()
                .unwrap_or_else(|e| e.into_inner());
            let old_max = settings.max_connections;
            settings.min_connections = min_connections;
            settings.max_connections = max_connections;
            settings.idle_timeout = idle_timeout;
            settings.health_check_interval = health_check_interval;
            old_max
        };

        if max_connections > old_max {
            let mut grow = max_connections - old_max;
            while grow > 0 && inner.take_shrink_debt() {
                grow -= 1;
            }
            inner.permits.add_permits(grow);
        } else if max_connections < old_max {
            let shrink = old_max - max_connections;
            let forgotten = inner.permits.forget_permits(shrink);
            inner
                .shrink_debt
                .fetch_add(shrink - forgotten, Ordering::SeqCst);
        }

        {
            let mut slots = lock(&inner.slots);
            let mut tracked = slots.len();
            for state in [ConnectionState::Unhealthy, ConnectionState::Idle] {
                for conn in slots.iter_mut().filter(|c| c.state == state) {
                    if tracked <= max_connections {
                        break;
                    }
                    conn.state = ConnectionState::Closed;
                    tracked -= 1;
                }
            }
            slots.retain(|c| c.state != ConnectionState::Closed);
        }

        info!(
            service = %inner.service,
            min_connections,
            max_connections,
            idle_timeout_secs = idle_timeout.as_secs(),
            "Connection pool reconfigured"
        );
        Ok(())
    }

    /// One pass of the health-check loop: reap idle connections, probe
    /// unhealthy ones, replace the hopeless, top up to `min_connections`.
    pub async fn run_health_check(&self) {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let settings = inner.settings();
        let to_probe = self.reap_idle(&settings);

        let permitted = lock(&inner.breaker).is_call_permitted();
        if !permitted {
            debug!(service = %inner.service, "Circuit open; skipping health probes");
            self.publish_gauges();
            return;
        }

        let half_open = lock(&inner.breaker).state() == CircuitState::HalfOpen;
        if half_open && to_probe.is_empty() {
            self.trial_connection(&settings).await;
        }
        for (id, handle) in to_probe {
            if lock(&inner.breaker).is_open() {
                break;
            }
            self.probe_connection(id, handle, &settings).await;
        }

        if !lock(&inner.breaker).is_open() {
            self.top_up(&settings);
        }
        self.publish_gauges();
    }

    /// Close idle connections past `idle_timeout` while above the minimum.
    /// Returns the unhealthy connections to probe.
    fn reap_idle(&self, settings: &PoolSettings) -> Vec<(u64, Arc<T>)> {
        let now = Instant::now();
        let mut slots = lock(&self.inner.slots);
        let mut live = live_count(&slots);

        let mut expired: Vec<(u64, Instant)> = slots
            .iter()
            .filter(|c| {
                c.state == ConnectionState::Idle
                    && now.saturating_duration_since(c.last_used_at) > settings.idle_timeout
            })
            .map(|c| (c.id, c.last_used_at))
            .collect();
        expired.sort_by_key(|(_, last_used)| *last_used);

        let mut reaped = 0;
        for (id, _) in expired {
            if live <= settings.min_connections {
                break;
            }
            if let Some(conn) = slots.iter_mut().find(|c| c.id == id) {
                conn.state = ConnectionState::Closed;
                live -= 1;
                reaped += 1;
            }
        }
        slots.retain(|c| c.state != ConnectionState::Closed);
        if reaped > 0 {
            debug!(service = %self.inner.service, reaped, "Closed idle connections");
        }

        slots
            .iter()
            .filter(|c| c.state == ConnectionState::Unhealthy)
            .map(|c| (c.id, c.handle.clone()))
            .collect()
    }

    async fn probe_connection(&self, id: u64, handle: Arc<T>, settings: &PoolSettings) {
        let inner = &self.inner;
        let healthy = handle.health_check().await;
        {
            let mut breaker = lock(&inner.breaker);
            if healthy {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }

        let replace = {
            let mut slots = lock(&inner.slots);
            let live = live_count(&slots);
            let Some(conn) = slots.iter_mut().find(|c| c.id == id) else {
                return;
            };
            if healthy {
                if live >= settings.max_connections {
                    conn.state = ConnectionState::Closed;
                } else {
                    info!(service = %inner.service, id, "Connection recovered");
                    conn.state = ConnectionState::Idle;
                    conn.consecutive_failures = 0;
                    conn.failed_probes = 0;
                    conn.last_used_at = Instant::now();
                }
                false
            } else {
                conn.failed_probes += 1;
                if conn.failed_probes >= settings.max_failed_probes {
                    conn.state = ConnectionState::Closed;
                    true
                } else {
                    false
                }
            }
        };
        lock(&inner.slots).retain(|c| c.state != ConnectionState::Closed);

        if replace {
            warn!(service = %inner.service, id, "Replacing connection after repeated failed probes");
            if let Some(monitor) = inner.monitor.get() {
                monitor.increment(&inner.metric("replaced"));
            }
            self.trial_connection(settings).await;
        }
    }

    /// Open a fresh connection and probe it before admitting it.
    async fn trial_connection(&self, settings: &PoolSettings) {
        let inner = &self.inner;
        let mut conn = match inner.open_connection(ConnectionState::Unhealthy) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(service = %inner.service, error = %e, "Failed to open connection");
                lock(&inner.breaker).record_failure();
                return;
            }
        };
        let healthy = conn.handle.health_check().await;
        {
            let mut breaker = lock(&inner.breaker);
            if healthy {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
        let mut slots = lock(&inner.slots);
        if slots.len() >= settings.max_connections {
            debug!(service = %inner.service, id = conn.id, "Pool full; dropping trial connection");
            return;
        }
        if healthy {
            conn.state = ConnectionState::Idle;
        }
        slots.push(conn);
    }

    fn top_up(&self, settings: &PoolSettings) {
        let inner = &self.inner;
        let missing = {
            let slots = lock(&inner.slots);
            let below_min = settings.min_connections.saturating_sub(live_count(&slots));
            below_min.min(settings.max_connections.saturating_sub(slots.len()))
        };
        for _ in 0..missing {
            match inner.open_connection(ConnectionState::Idle) {
                Ok(conn) => lock(&inner.slots).push(conn),
                Err(e) => {
                    warn!(service = %inner.service, error = %e, "Failed to open connection");
                    break;
                }
            }
        }
    }

    fn publish_gauges(&self) {
        let Some(monitor) = self.inner.monitor.get() else {
            return;
        };
        let status = self.status();
        let inner = &self.inner;
        monitor.gauge(&inner.metric("active"), status.active as f64);
        monitor.gauge(&inner.metric("idle"), status.idle as f64);
        monitor.gauge(&inner.metric("unhealthy"), status.unhealthy as f64);
        let open = if status.health == PoolHealth::CircuitOpen {
            1.0
        } else {
            0.0
        };
        monitor.gauge(&inner.metric("circuit_open"), open);
    }

    pub fn status(&self) -> PoolStatus {
        let inner = &self.inner;
        let settings = inner.settings();
        let (active, idle, unhealthy) = {
            let slots = lock(&inner.slots);
            let count = |state| slots.iter().filter(|c| c.state == state).count();
            (
                count(ConnectionState::Active),
                count(ConnectionState::Idle),
                count(ConnectionState::Unhealthy),
            )
        };
        let circuit = lock(&inner.breaker).state();
        let health = match circuit {
            CircuitState::Open { .. } => PoolHealth::CircuitOpen,
            CircuitState::HalfOpen => PoolHealth::Degraded,
            CircuitState::Closed if unhealthy > 0 => PoolHealth::Degraded,
            CircuitState::Closed => PoolHealth::Healthy,
        };
        PoolStatus {
            service: inner.service.clone(),
            active,
            idle,
            unhealthy,
            min_connections: settings.min_connections,
            max_connections: settings.max_connections,
            health,
        }
    }

    /// States of all tracked connections, in table order.
    pub fn connection_states(&self) -> Vec<ConnectionState> {
        lock(&self.inner.slots).iter().map(|c| c.state).collect()
    }

    /// Run [`run_health_check`](Self::run_health_check) every
    /// `health_check_interval` until `token` is cancelled.
    pub fn spawn_health_checker(&self, token: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                let interval = pool.settings().health_check_interval;
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => pool.run_health_check().await,
                }
            }
            debug!(service = %pool.service(), "Health checker stopped");
        })
    }

    /// Refuse new acquisitions and close idle connections. Active connections
    /// close when their handles drop.
    pub fn close(&self) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::SeqCst);
        inner.permits.close();
        let mut slots = lock(&inner.slots);
        for conn in slots.iter_mut() {
            if conn.state != ConnectionState::Active {
                conn.state = ConnectionState::Closed;
            }
        }
        slots.retain(|c| c.state != ConnectionState::Closed);
        info!(service = %inner.service, "Connection pool closed");
    }
}
