//! In-process performance monitoring.
//!
//! [`PerformanceMonitor`] collects counters, gauges and windowed
//! histograms/timers from the cache, the connection pools and the service,
//! and evaluates threshold [`AlertRule`]s against them. A rule reads the
//! gauge or counter of its metric name, or the P95 when the metric is a
//! histogram.

pub mod alerts;
pub mod histogram;

pub use alerts::{Alert, AlertLevel, AlertRule, Comparison};
pub use histogram::{Histogram, HistogramSummary, percentile};

use crate::config::MonitorConfig;
use crate::lock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Monotonic sum.
    Counter,
    /// Last value wins.
    Gauge,
    Histogram,
    /// A histogram of durations in milliseconds.
    Timer,
}

/// Invoked for each fired alert, outside the monitor's lock.
pub type AlertCallback = Arc<dyn Fn(&Alert) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub counters: BTreeMap<String, f64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, HistogramSummary>,
    pub alert_rules: usize,
    pub recent_alerts: Vec<Alert>,
}

#[derive(Default)]
struct MonitorState {
    counters: HashMap<String, f64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, Histogram>,
    rules: Vec<AlertRule>,
    history: VecDeque<Alert>,
}

impl MonitorState {
    fn metric_value(&mut self, name: &str, now: Instant) -> Option<f64> {
        if let Some(v) = self.gauges.get(name) {
            return Some(*v);
        }
        if let Some(v) = self.counters.get(name) {
            return Some(*v);
        }
        let histogram = self.histograms.get_mut(name)?;
        histogram.prune(now);
        if histogram.is_empty() {
            return None;
        }
        Some(histogram.summary().p95)
    }
}

pub struct PerformanceMonitor {
    state: Mutex<MonitorState>,
    callbacks: Mutex<Vec<AlertCallback>>,
    retention: Duration,
    max_samples: usize,
    history_limit: usize,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default())
    }
}

impl PerformanceMonitor {
    pub fn new(retention: Duration, max_samples: usize, history_limit: usize) -> Self {
        Self {
            state: Mutex::new(MonitorState::default()),
            callbacks: Mutex::new(Vec::new()),
            retention,
            max_samples,
            history_limit: history_limit.max(1),
        }
    }

    /// Build a monitor with the configured windows and alert rules.
    pub fn from_config(config: &MonitorConfig) -> Self {
        let monitor = Self::new(
            Duration::from_secs(config.retention_secs),
            config.max_samples,
            config.alert_history_limit,
        );
        for rule in &config.alerts {
            monitor.add_rule(rule.to_rule());
        }
        monitor
    }

    pub fn record(&self, name: &str, value: f64, kind: MetricKind) {
        let mut state = lock(&self.state);
        match kind {
            MetricKind::Counter => *state.counters.entry(name.to_string()).or_default() += value,
            MetricKind::Gauge => {
                state.gauges.insert(name.to_string(), value);
            }
            MetricKind::Histogram | MetricKind::Timer => {
                let (retention, max_samples) = (self.retention, self.max_samples);
                state
                    .histograms
                    .entry(name.to_string())
                    .or_insert_with(|| Histogram::new(retention, max_samples))
                    .record_at(Instant::now(), value);
            }
        }
    }

    pub fn increment(&self, name: &str) {
        self.record(name, 1.0, MetricKind::Counter);
    }

    pub fn gauge(&self, name: &str, value: f64) {
        self.record(name, value, MetricKind::Gauge);
    }

    pub fn observe(&self, name: &str, value: f64) {
        self.record(name, value, MetricKind::Histogram);
    }

    pub fn record_duration(&self, name: &str, elapsed: Duration) {
        self.record(name, elapsed.as_secs_f64() * 1000.0, MetricKind::Timer);
    }

    /// Start a timer that records its elapsed milliseconds under `name` when
    /// dropped.
    pub fn start_timer(&self, name: &str) -> TimerGuard<'_> {
        TimerGuard {
            monitor: self,
            name: name.to_string(),
            started: Instant::now(),
        }
    }

    pub fn counter_value(&self, name: &str) -> Option<f64> {
        lock(&self.state).counters.get(name).copied()
    }

    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        lock(&self.state).gauges.get(name).copied()
    }

    pub fn histogram(&self, name: &str) -> Option<HistogramSummary> {
        let mut state = lock(&self.state);
        let histogram = state.histograms.get_mut(name)?;
        histogram.prune(Instant::now());
        Some(histogram.summary())
    }

    /// The value alert rules see for `name`.
    pub fn metric_value(&self, name: &str) -> Option<f64> {
        lock(&self.state).metric_value(name, Instant::now())
    }

    pub fn add_rule(&self, rule: AlertRule) {
        debug!(rule = %rule.name, metric = %rule.metric_name, "Registered alert rule");
        lock(&self.state).rules.push(rule);
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        lock(&self.state).rules.clone()
    }

    pub fn on_alert<F>(&self, callback: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        lock(&self.callbacks).push(Arc::new(callback));
    }

    /// Evaluate every rule now. Returns the alerts that fired.
    pub fn evaluate_alerts(&self) -> Vec<Alert> {
        self.evaluate_alerts_at(Instant::now())
    }

    pub fn evaluate_alerts_at(&self, now: Instant) -> Vec<Alert> {
        let fired = {
            let mut state = lock(&self.state);
            let mut fired = Vec::new();
            for i in 0..state.rules.len() {
                let metric = state.rules[i].metric_name.clone();
                let value = state.metric_value(&metric, now);
                let rule = &mut state.rules[i];
                if rule.evaluate(value, now) {
                    fired.push(Alert {
                        rule: rule.name.clone(),
                        metric_name: metric,
                        level: rule.level,
                        value: value.unwrap_or_default(),
                        threshold: rule.threshold,
                        comparison: rule.comparison,
                        fired_at: chrono::Utc::now(),
                    });
                }
            }
            for alert in &fired {
                state.history.push_back(alert.clone());
                while state.history.len() > self.history_limit {
                    state.history.pop_front();
                }
            }
            fired
        };

        if fired.is_empty() {
            return fired;
        }
        let callbacks = lock(&self.callbacks).clone();
        for alert in &fired {
            match alert.level {
                AlertLevel::Info => info!(rule = %alert.rule, "Alert: {}", alert.message()),
                AlertLevel::Warning => warn!(rule = %alert.rule, "Alert: {}", alert.message()),
                AlertLevel::Error | AlertLevel::Critical => {
                    error!(rule = %alert.rule, level = %alert.level, "Alert: {}", alert.message())
                }
            }
            for callback in &callbacks {
                callback(alert);
            }
        }
        fired
    }

    /// Fired alerts, oldest first.
    pub fn alert_history(&self) -> Vec<Alert> {
        lock(&self.state).history.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let now = Instant::now();
        let mut state = lock(&self.state);
        let histograms = state
            .histograms
            .iter_mut()
            .map(|(name, h)| {
                h.prune(now);
                (name.clone(), h.summary())
            })
            .collect();
        MonitorSnapshot {
            counters: state.counters.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            gauges: state.gauges.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            histograms,
            alert_rules: state.rules.len(),
            recent_alerts: state.history.iter().rev().take(20).cloned().collect(),
        }
    }

    /// Evaluate alerts every `interval` until `token` is cancelled.
    pub fn spawn_alert_loop(self: Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        self.evaluate_alerts();
                    }
                }
            }
            debug!("Alert loop stopped");
        })
    }
}

/// Records elapsed milliseconds as a timer sample when dropped.
pub struct TimerGuard<'a> {
    monitor: &'a PerformanceMonitor,
    name: String,
    started: Instant,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.monitor
            .record_duration(&self.name, self.started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn monitor() -> PerformanceMonitor {
        PerformanceMonitor::new(Duration::from_secs(60), 1000, 3)
    }

    #[test]
    fn test_counters_and_gauges() {
        let m = monitor();
        m.increment("requests");
        m.increment("requests");
        m.record("requests", 3.0, MetricKind::Counter);
        m.gauge("pool.llm.idle", 4.0);
        m.gauge("pool.llm.idle", 2.0);
        assert_eq!(m.counter_value("requests"), Some(5.0));
        assert_eq!(m.gauge_value("pool.llm.idle"), Some(2.0));
        assert_eq!(m.counter_value("missing"), None);
    }

    #[test]
    fn test_histogram_and_timer() {
        let m = monitor();
        for v in 1..=20 {
            m.observe("latency", f64::from(v));
        }
        let s = m.histogram("latency").unwrap();
        assert_eq!(s.count, 20);
        assert_eq!(s.p95, 19.0);
        assert_eq!(m.metric_value("latency"), Some(19.0));

        {
            let _t = m.start_timer("op_ms");
        }
        assert_eq!(m.histogram("op_ms").unwrap().count, 1);
    }

    #[test]
    fn test_alert_fires_with_callback_and_history() {
        let m = monitor();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        m.on_alert(move |alert| {
            assert_eq!(alert.level, AlertLevel::Critical);
            s.fetch_add(1, Ordering::SeqCst);
        });
        m.add_rule(AlertRule::new("circuit", "pool.llm.circuit_open", 0.5).with_level(AlertLevel::Critical));

        assert!(m.evaluate_alerts().is_empty());
        m.gauge("pool.llm.circuit_open", 1.0);
        let fired = m.evaluate_alerts();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].value, 1.0);
        // Cooldown holds the second evaluation back.
        assert!(m.evaluate_alerts().is_empty());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(m.alert_history().len(), 1);
    }

    #[test]
    fn test_alert_duration_uses_evaluation_time() {
        let m = PerformanceMonitor::new(Duration::from_secs(3600), 1000, 10);
        m.add_rule(AlertRule::new("slow", "latency", 100.0).with_duration(Duration::from_secs(60)));
        m.observe("latency", 500.0);
        let t0 = Instant::now();
        assert!(m.evaluate_alerts_at(t0).is_empty());
        assert_eq!(m.evaluate_alerts_at(t0 + Duration::from_secs(61)).len(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let m = monitor();
        for i in 0..5 {
            m.add_rule(AlertRule::new(&format!("r{i}"), "x", 0.0));
        }
        m.gauge("x", 1.0);
        assert_eq!(m.evaluate_alerts().len(), 5);
        let history = m.alert_history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].rule, "r2");
    }

    #[test]
    fn test_from_config_registers_default_rules() {
        let m = PerformanceMonitor::default();
        assert_eq!(m.rules().len(), 7);
    }

    #[test]
    fn test_snapshot_serializes() {
        let m = monitor();
        m.increment("cache.answer.hit");
        m.observe("answer.latency_ms", 12.5);
        let snap = m.snapshot();
        assert_eq!(snap.counters["cache.answer.hit"], 1.0);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["histograms"]["answer.latency_ms"]["count"], 1);
    }

    #[tokio::test]
    async fn test_alert_loop_stops_on_cancel() {
        let m = Arc::new(monitor());
        m.add_rule(AlertRule::new("r", "x", 0.0));
        m.gauge("x", 1.0);
        let token = CancellationToken::new();
        let handle = m.clone().spawn_alert_loop(Duration::from_millis(5), token.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        handle.await.unwrap();
        assert_eq!(m.alert_history().len(), 1);
    }
}
