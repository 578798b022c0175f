//! TTL query cache with request coalescing and memory-bounded eviction.
//!
//! [`QueryCache::get_or_compute`] returns a live entry when one exists. On a
//! miss with coalescing enabled, the first caller for a key becomes the
//! leader and runs the computation while later callers subscribe to a
//! `tokio::sync::watch` channel and receive the leader's result. At most one
//! computation runs per key at any instant. Failures are handed to every
//! waiter as [`RagError::CacheComputeFailed`] and never stored. If the leader
//! is dropped mid-computation (deadline, client disconnect), its sender goes
//! with it and the waiters receive a `Cancelled` failure.
//!
//! Entries live in an unbounded [`LruCache`] whose order is the recency
//! order; the memory ceiling, not an entry count, drives eviction.
//! [`QueryCache::clear`] starts a new generation: computations begun before
//! it still answer their callers but never write into the cleared cache.

pub mod eviction;
pub mod key;

pub use eviction::{CacheWeight, ENTRY_OVERHEAD_BYTES, EvictionPolicy};
pub use key::{cache_key, normalize_query};

use crate::error::{RagError, Result};
use crate::lock;
use crate::monitor::PerformanceMonitor;
use lru::LruCache;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a `get_or_compute` call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Hit,
    Computed,
    /// Joined another caller's in-flight computation.
    Coalesced,
}

impl CacheOutcome {
    /// Whether the caller was spared its own computation.
    pub fn is_hit(&self) -> bool {
        !matches!(self, CacheOutcome::Computed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub failures: u64,
    pub entries: usize,
    pub memory_bytes: usize,
    pub memory_ceiling_bytes: usize,
    pub hit_rate: f64,
}

struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    ttl: Duration,
    access_count: u64,
    weight: usize,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

type Shared<V> = Option<Result<V>>;

/// A running computation that later callers may join.
struct InFlight<V> {
    result: watch::Receiver<Shared<V>>,
    generation: u64,
}

struct CacheState<V> {
    entries: LruCache<String, CacheEntry<V>>,
    in_flight: HashMap<String, InFlight<V>>,
    memory: usize,
    generation: u64,
    hits: u64,
    misses: u64,
    coalesced: u64,
    evictions: u64,
    expirations: u64,
    failures: u64,
}

impl<V> Default for CacheState<V> {
    fn default() -> Self {
        Self {
            entries: LruCache::unbounded(),
            in_flight: HashMap::new(),
            memory: 0,
            generation: 0,
            hits: 0,
            misses: 0,
            coalesced: 0,
            evictions: 0,
            expirations: 0,
            failures: 0,
        }
    }
}

impl<V: Clone> CacheState<V> {
    fn remove(&mut self, key: &str) -> bool {
        match self.entries.pop(key) {
            Some(entry) => {
                self.memory -= entry.weight;
                true
            }
            None => false,
        }
    }

    fn lookup(&mut self, key: &str, now: Instant) -> Option<V> {
        let expired = self.entries.peek(key)?.is_expired(now);
        if expired {
            self.remove(key);
            self.expirations += 1;
            return None;
        }
        // `get_mut` promotes the entry to most recently used.
        let entry = self.entries.get_mut(key)?;
        entry.access_count += 1;
        Some(entry.value.clone())
    }

    /// Drop one entry other than `keep` according to `policy`.
    fn evict_one(&mut self, policy: EvictionPolicy, keep: &str) -> bool {
        let victim = match policy {
            EvictionPolicy::Lru => {
                if self.entries.peek_lru().is_none_or(|(k, _)| k.as_str() == keep) {
                    return false;
                }
                self.entries.pop_lru().map(|(_, entry)| entry)
            }
            EvictionPolicy::Lfu => {
                let oldest_first = self
                    .entries
                    .iter()
                    .rev()
                    .filter(|(k, _)| k.as_str() != keep)
                    .map(|(k, e)| (k.as_str(), e.access_count));
                let Some(key) = eviction::least_frequent(oldest_first).map(str::to_string) else {
                    return false;
                };
                self.entries.pop(&key)
            }
        };
        match victim {
            Some(entry) => {
                self.memory -= entry.weight;
                self.evictions += 1;
                true
            }
            None => false,
        }
    }

    /// Remove the in-flight record for `key` if it belongs to `generation`.
    fn remove_flight(&mut self, key: &str, generation: u64) -> bool {
        let ours = self
            .in_flight
            .get(key)
            .is_some_and(|flight| flight.generation == generation);
        if ours {
            self.in_flight.remove(key);
        }
        ours
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        self.expirations += expired.len() as u64;
        expired.len()
    }
}

/// A typed, memory-bounded cache for one payload class.
pub struct QueryCache<V> {
    name: String,
    state: Mutex<CacheState<V>>,
    ceiling: usize,
    policy: EvictionPolicy,
    monitor: Option<Arc<PerformanceMonitor>>,
}

impl<V> QueryCache<V>
where
    V: Clone + Send + Sync + CacheWeight + 'static,
{
    pub fn new(name: impl Into<String>, memory_ceiling_bytes: usize, policy: EvictionPolicy) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(CacheState::default()),
            ceiling: memory_ceiling_bytes,
            policy,
            monitor: None,
        }
    }

    /// Count hits, misses and evictions in `monitor` under `cache.<name>.*`.
    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn count(&self, what: &str) {
        if let Some(monitor) = &self.monitor {
            monitor.increment(&format!("cache.{}.{what}", self.name));
        }
    }

    /// Live value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<V> {
        let found = {
            let mut state = lock(&self.state);
            let found = state.lookup(key, Instant::now());
            if found.is_some() {
                state.hits += 1;
            } else {
                state.misses += 1;
            }
            found
        };
        self.count(if found.is_some() { "hit" } else { "miss" });
        found
    }

    /// Store `value` under `key`, evicting as needed.
    pub fn insert(&self, key: &str, value: V, ttl: Duration) {
        let evicted = {
            let mut state = lock(&self.state);
            self.store(&mut state, key, value, ttl)
        };
        for _ in 0..evicted {
            self.count("evicted");
        }
    }

    /// Insert under the held lock. Returns the number of evicted entries.
    fn store(&self, state: &mut CacheState<V>, key: &str, value: V, ttl: Duration) -> usize {
        let weight = value.weight() + key.len() + ENTRY_OVERHEAD_BYTES;
        if weight > self.ceiling {
            debug!(
                cache = %self.name,
                weight,
                ceiling = self.ceiling,
                "Value exceeds cache ceiling; not cached"
            );
            state.remove(key);
            return 0;
        }

        let now = Instant::now();
        state.remove(key);
        state.entries.put(
            key.to_string(),
            CacheEntry {
                value,
                created_at: now,
                ttl,
                access_count: 1,
                weight,
            },
        );
        state.memory += weight;

        if state.memory <= self.ceiling {
            return 0;
        }
        state.purge_expired(now);

        let mut evicted = 0;
        while state.memory > self.ceiling && state.evict_one(self.policy, key) {
            evicted += 1;
        }
        if evicted > 0 {
            debug!(cache = %self.name, evicted, memory = state.memory, "Evicted entries");
        }
        evicted
    }

    /// Return the live value for `key`, or compute, store and return it.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        use_coalescing: bool,
        compute: F,
    ) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        self.get_or_compute_traced(key, ttl, use_coalescing, compute)
            .await
            .map(|(value, _)| value)
    }

    /// Like [`get_or_compute`](Self::get_or_compute), also reporting how the
    /// value was obtained.
    pub async fn get_or_compute_traced<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        use_coalescing: bool,
        compute: F,
    ) -> Result<(V, CacheOutcome)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        match self.begin(key, use_coalescing) {
            Begin::Hit(value) => {
                self.count("hit");
                Ok((value, CacheOutcome::Hit))
            }
            Begin::Wait(rx) => {
                self.count("coalesced");
                self.wait(key, rx).await.map(|v| (v, CacheOutcome::Coalesced))
            }
            Begin::Lead { generation, publish } => {
                self.count("miss");
                let mut guard = InFlightGuard {
                    cache: self,
                    key,
                    generation,
                    armed: publish.is_some(),
                };
                let result = compute().await.map_err(|e| RagError::CacheComputeFailed {
                    key: key.to_string(),
                    source: Box::new(e),
                });
                guard.armed = false;
                self.finish(key, ttl, generation, publish, &result);
                result.map(|v| (v, CacheOutcome::Computed))
            }
        }
    }

    fn begin(&self, key: &str, use_coalescing: bool) -> Begin<V> {
        let mut state = lock(&self.state);
        if let Some(value) = state.lookup(key, Instant::now()) {
            state.hits += 1;
            return Begin::Hit(value);
        }
        let generation = state.generation;
        let mut publish = None;
        if use_coalescing {
            if let Some(flight) = state.in_flight.get(key)
                && flight.generation == generation
            {
                let rx = flight.result.clone();
                state.coalesced += 1;
                return Begin::Wait(rx);
            }
            let (tx, rx) = watch::channel(None);
            state.in_flight.insert(
                key.to_string(),
                InFlight {
                    result: rx,
                    generation,
                },
            );
            publish = Some(tx);
        }
        state.misses += 1;
        Begin::Lead {
            generation,
            publish,
        }
    }

    async fn wait(&self, key: &str, mut rx: watch::Receiver<Shared<V>>) -> Result<V> {
        let shared = rx
            .wait_for(Option::is_some)
            .await
            .map(|current| (*current).clone());
        match shared {
            Ok(Some(result)) => result,
            _ => Err(RagError::CacheComputeFailed {
                key: key.to_string(),
                source: Box::new(RagError::Cancelled),
            }),
        }
    }

    fn finish(
        &self,
        key: &str,
        ttl: Duration,
        generation: u64,
        publish: Option<watch::Sender<Shared<V>>>,
        result: &Result<V>,
    ) {
        let evicted = {
            let mut state = lock(&self.state);
            let evicted = match result {
                Ok(_) if generation != state.generation => {
                    debug!(cache = %self.name, key, "Cache cleared during computation; result not stored");
                    0
                }
                Ok(value) => self.store(&mut state, key, value.clone(), ttl),
                Err(e) => {
                    state.failures += 1;
                    debug!(cache = %self.name, key, error = %e, "Computation failed; not cached");
                    0
                }
            };
            if publish.is_some() {
                state.remove_flight(key, generation);
            }
            evicted
        };
        if let Some(tx) = publish {
            tx.send_replace(Some(result.clone()));
        }
        for _ in 0..evicted {
            self.count("evicted");
        }
    }

    /// Forget an abandoned computation. Its waiters are released when the
    /// leader's sender drops.
    fn abandon(&self, key: &str, generation: u64) {
        let mut state = lock(&self.state);
        state.failures += 1;
        if state.remove_flight(key, generation) {
            debug!(cache = %self.name, key, "Leader dropped; releasing coalesced waiters");
        }
    }

    pub fn invalidate(&self, key: &str) -> bool {
        lock(&self.state).remove(key)
    }

    /// Drop every entry. Computations already running still answer their
    /// callers, but their results are not stored and new callers do not
    /// join them.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.entries.clear();
        state.memory = 0;
        state.generation += 1;
    }

    /// Remove expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        lock(&self.state).purge_expired(Instant::now())
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_usage(&self) -> usize {
        lock(&self.state).memory
    }

    pub fn stats(&self) -> CacheStats {
        let state = lock(&self.state);
        let served = state.hits + state.coalesced;
        let total = served + state.misses;
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            coalesced: state.coalesced,
            evictions: state.evictions,
            expirations: state.expirations,
            failures: state.failures,
            entries: state.entries.len(),
            memory_bytes: state.memory,
            memory_ceiling_bytes: self.ceiling,
            hit_rate: if total == 0 {
                0.0
            } else {
                served as f64 / total as f64
            },
        }
    }

    /// Purge expired entries and publish gauges every `interval` until
    /// `token` is cancelled.
    pub fn spawn_janitor(self: Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let purged = self.purge_expired();
                        if purged > 0 {
                            debug!(cache = %self.name, purged, "Purged expired entries");
                        }
                        if let Some(monitor) = &self.monitor {
                            let stats = self.stats();
                            monitor.gauge(&format!("cache.{}.entries", self.name), stats.entries as f64);
                            monitor.gauge(&format!("cache.{}.memory_bytes", self.name), stats.memory_bytes as f64);
                            monitor.gauge(&format!("cache.{}.hit_rate", self.name), stats.hit_rate);
                        }
                    }
                }
            }
        })
    }
}

enum Begin<V> {
    Hit(V),
    Wait(watch::Receiver<Shared<V>>),
    Lead {
        generation: u64,
        /// Present when callers may coalesce onto this computation.
        publish: Option<watch::Sender<Shared<V>>>,
    },
}

/// Clears the in-flight record if the leading future is dropped before it
/// publishes a result.
struct InFlightGuard<'a, V>
where
    V: Clone + Send + Sync + CacheWeight + 'static,
{
    cache: &'a QueryCache<V>,
    key: &'a str,
    generation: u64,
    armed: bool,
}

impl<V> Drop for InFlightGuard<'_, V>
where
    V: Clone + Send + Sync + CacheWeight + 'static,
{
    fn drop(&mut self) {
        if self.armed {
            self.cache.abandon(self.key, self.generation);
        }
    }
}
