//! Threshold alert rules and fired-alert records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Direction in which a metric violates its threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    #[default]
    Above,
    Below,
}

impl Comparison {
    pub fn violates(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Above => value > threshold,
            Comparison::Below => value < threshold,
        }
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    #[default]
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "info"),
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Error => write!(f, "error"),
            AlertLevel::Critical => write!(f, "critical"),
        }
    }
}

/// A threshold rule over one metric.
///
/// The rule fires once the metric has violated the threshold continuously
/// for at least `duration`, and then not again until `cooldown` has passed.
#[derive(Debug, Clone)]
pub struct AlertRule {
    pub name: String,
    pub metric_name: String,
    pub threshold: f64,
    pub comparison: Comparison,
    pub level: AlertLevel,
    pub duration: Duration,
    pub cooldown: Duration,
    pub last_fired_at: Option<Instant>,
    violation_since: Option<Instant>,
}

impl AlertRule {
    pub fn new(name: &str, metric_name: &str, threshold: f64) -> Self {
        Self {
            name: name.to_string(),
            metric_name: metric_name.to_string(),
            threshold,
            comparison: Comparison::default(),
            level: AlertLevel::default(),
            duration: Duration::ZERO,
            cooldown: Duration::from_secs(300),
            last_fired_at: None,
            violation_since: None,
        }
    }

    pub fn with_comparison(mut self, comparison: Comparison) -> Self {
        self.comparison = comparison;
        self
    }

    pub fn with_level(mut self, level: AlertLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Feed the current metric value observed at `now`. Returns true when the
    /// rule fires. A missing value ends any ongoing violation.
    pub fn evaluate(&mut self, value: Option<f64>, now: Instant) -> bool {
        let Some(value) = value.filter(|v| self.comparison.violates(*v, self.threshold)) else {
            self.violation_since = None;
            return false;
        };
        let since = *self.violation_since.get_or_insert(now);
        if now.saturating_duration_since(since) < self.duration {
            return false;
        }
        if let Some(fired) = self.last_fired_at
            && now.saturating_duration_since(fired) < self.cooldown
        {
            return false;
        }
        tracing::trace!(rule = %self.name, value, "Alert condition met");
        self.last_fired_at = Some(now);
        true
    }
}

/// A fired alert, as kept in the monitor's history and passed to callbacks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub rule: String,
    pub metric_name: String,
    pub level: AlertLevel,
    pub value: f64,
    pub threshold: f64,
    pub comparison: Comparison,
    pub fired_at: DateTime<Utc>,
}

impl Alert {
    pub fn message(&self) -> String {
        let op = match self.comparison {
            Comparison::Above => ">",
            Comparison::Below => "<",
        };
        format!(
            "{} = {:.2} {op} {:.2} ({})",
            self.metric_name, self.value, self.threshold, self.rule
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_immediately_without_duration() {
        let mut rule = AlertRule::new("hot", "m", 10.0);
        let now = Instant::now();
        assert!(!rule.evaluate(Some(5.0), now));
        assert!(rule.evaluate(Some(11.0), now));
    }

    #[test]
    fn test_requires_sustained_violation() {
        let mut rule = AlertRule::new("slow", "m", 100.0).with_duration(Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(!rule.evaluate(Some(150.0), t0));
        assert!(!rule.evaluate(Some(150.0), t0 + Duration::from_secs(30)));
        // A recovery resets the violation window.
        assert!(!rule.evaluate(Some(50.0), t0 + Duration::from_secs(40)));
        assert!(!rule.evaluate(Some(150.0), t0 + Duration::from_secs(50)));
        assert!(!rule.evaluate(Some(150.0), t0 + Duration::from_secs(100)));
        assert!(rule.evaluate(Some(150.0), t0 + Duration::from_secs(110)));
    }

    #[test]
    fn test_cooldown_suppresses_refire() {
        let mut rule = AlertRule::new("r", "m", 1.0).with_cooldown(Duration::from_secs(300));
        let t0 = Instant::now();
        assert!(rule.evaluate(Some(2.0), t0));
        assert!(!rule.evaluate(Some(2.0), t0 + Duration::from_secs(60)));
        assert!(rule.evaluate(Some(2.0), t0 + Duration::from_secs(301)));
    }

    #[test]
    fn test_below_comparison_and_missing_metric() {
        let mut rule = AlertRule::new("low", "hit_rate", 0.2).with_comparison(Comparison::Below);
        let now = Instant::now();
        assert!(!rule.evaluate(None, now));
        assert!(!rule.evaluate(Some(0.5), now));
        assert!(rule.evaluate(Some(0.1), now));
    }

    #[test]
    fn test_alert_message() {
        let alert = Alert {
            rule: "answer_latency_p95".into(),
            metric_name: "answer.latency_ms".into(),
            level: AlertLevel::Warning,
            value: 6200.0,
            threshold: 5000.0,
            comparison: Comparison::Above,
            fired_at: Utc::now(),
        };
        assert_eq!(
            alert.message(),
            "answer.latency_ms = 6200.00 > 5000.00 (answer_latency_p95)"
        );
    }
}
