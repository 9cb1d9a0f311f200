//! Vector store performance monitoring
//!
//! Tracks per-operation timings and error rates, samples resident memory on
//! an interval, and publishes threshold alerts on a broadcast bus. The alert
//! ring keeps only recent history.

use crate::config::StoreTuning;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::broadcast;
use tracing::warn;

const MAX_ALERTS: usize = 50;
const MAX_MEMORY_SAMPLES: usize = 100;

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// A performance alert published on the store's alert bus
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceAlert {
    pub alert_type: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub timestamp: DateTime<Utc>,
    pub metrics: serde_json::Value,
}

/// Timing percentiles for one operation
#[derive(Debug, Clone, Serialize)]
pub struct OpPercentiles {
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

/// One resident-memory sample
#[derive(Debug, Clone, Serialize)]
pub struct MemorySample {
    pub timestamp: DateTime<Utc>,
    pub rss_mb: f64,
}

/// Store monitoring state
pub struct StoreMonitor {
    tuning: StoreTuning,
    op_times: Mutex<HashMap<String, Vec<f64>>>,
    op_counts: Mutex<HashMap<String, u64>>,
    error_counts: Mutex<HashMap<String, u64>>,
    memory_history: Mutex<VecDeque<MemorySample>>,
    alerts: Mutex<VecDeque<PerformanceAlert>>,
    alert_tx: broadcast::Sender<PerformanceAlert>,
    started: Instant,
}

impl StoreMonitor {
    pub fn new(tuning: StoreTuning) -> Self {
        let (alert_tx, _) = broadcast::channel(64);
        Self {
            tuning,
            op_times: Mutex::new(HashMap::new()),
            op_counts: Mutex::new(HashMap::new()),
            error_counts: Mutex::new(HashMap::new()),
            memory_history: Mutex::new(VecDeque::new()),
            alerts: Mutex::new(VecDeque::new()),
            alert_tx,
            started: Instant::now(),
        }
    }

    /// Subscribe to the alert bus
    pub fn subscribe(&self) -> broadcast::Receiver<PerformanceAlert> {
        self.alert_tx.subscribe()
    }

    /// Record a completed operation and alert if it was slow
    pub fn track_op(&self, operation: &str, start: Instant) {
        let duration = start.elapsed().as_secs_f64();

        self.op_times
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_default()
            .push(duration);
        *self
            .op_counts
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_default() += 1;

        let duration_ms = duration * 1000.0;
        if duration_ms > self.tuning.slow_op_ms as f64 {
            self.emit(
                "slow_operation",
                format!("Slow operation: {operation} took {duration_ms:.1}ms"),
                AlertSeverity::Medium,
                serde_json::json!({ "operation": operation, "duration_ms": duration_ms }),
            );
        }
    }

    /// Record a failed operation and alert on a high error rate
    pub fn record_error(&self, operation: &str) {
        let errors = {
            let mut counts = self.error_counts.lock().unwrap();
            let entry = counts.entry(operation.to_string()).or_default();
            *entry += 1;
            *entry
        };

        let total = self
            .op_counts
            .lock()
            .unwrap()
            .get(operation)
            .copied()
            .unwrap_or(0)
            + errors;

        if total > 0 {
            let rate = errors as f64 / total as f64;
            if rate > self.tuning.err_rate_high {
                self.emit(
                    "high_error_rate",
                    format!("High error rate for {operation}: {:.1}%", rate * 100.0),
                    AlertSeverity::High,
                    serde_json::json!({ "operation": operation, "error_rate": rate }),
                );
            }
        }
    }

    /// Record current queue depth, alerting past the threshold
    pub fn track_queue_depth(&self, depth: usize) {
        if depth > self.tuning.queue_high {
            self.emit(
                "queue_depth",
                format!("Operation queue depth high: {depth}"),
                AlertSeverity::High,
                serde_json::json!({ "queue_depth": depth }),
            );
        }
    }

    /// Publish an alert
    pub fn emit(
        &self,
        alert_type: &str,
        message: String,
        severity: AlertSeverity,
        metrics: serde_json::Value,
    ) {
        let alert = PerformanceAlert {
            alert_type: alert_type.to_string(),
            message: message.clone(),
            severity,
            timestamp: Utc::now(),
            metrics,
        };

        {
            let mut alerts = self.alerts.lock().unwrap();
            alerts.push_back(alert.clone());
            while alerts.len() > MAX_ALERTS {
                alerts.pop_front();
            }
        }

        let _ = self.alert_tx.send(alert);
        warn!("Performance alert [{severity:?}]: {message}");
    }

    /// Take a memory sample; returns the RSS in MB and whether it crossed
    /// the configured threshold
    pub fn sample_memory(&self) -> (f64, bool) {
        let rss_mb = current_rss_mb();

        {
            let mut history = self.memory_history.lock().unwrap();
            history.push_back(MemorySample {
                timestamp: Utc::now(),
                rss_mb,
            });
            while history.len() > MAX_MEMORY_SAMPLES {
                history.pop_front();
            }
        }

        let over = rss_mb > self.tuning.mem_high_mb as f64;
        if over {
            self.emit(
                "memory_usage",
                format!("Memory usage high: {rss_mb:.1}MB"),
                AlertSeverity::High,
                serde_json::json!({ "rss_mb": rss_mb }),
            );
        }
        (rss_mb, over)
    }

    /// Most recent memory sample, if any
    pub fn last_memory_mb(&self) -> f64 {
        self.memory_history
            .lock()
            .unwrap()
            .back()
            .map(|s| s.rss_mb)
            .unwrap_or(0.0)
    }

    /// Recent alerts, newest last
    pub fn recent_alerts(&self, limit: usize) -> Vec<PerformanceAlert> {
        let alerts = self.alerts.lock().unwrap();
        alerts
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    /// Clear retained alerts
    pub fn clear_alerts(&self) {
        self.alerts.lock().unwrap().clear();
    }

    /// Per-operation average timings in seconds
    pub fn average_times(&self) -> HashMap<String, f64> {
        self.op_times
            .lock()
            .unwrap()
            .iter()
            .map(|(op, times)| {
                let avg = times.iter().sum::<f64>() / times.len().max(1) as f64;
                (op.clone(), avg)
            })
            .collect()
    }

    /// Per-operation timing percentiles
    pub fn percentiles(&self) -> HashMap<String, OpPercentiles> {
        let times = self.op_times.lock().unwrap();
        times
            .iter()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(op, samples)| {
                let mut sorted = samples.clone();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let at = |q: f64| sorted[((sorted.len() as f64 * q) as usize).min(sorted.len() - 1)];
                (
                    op.clone(),
                    OpPercentiles {
                        p50: at(0.5),
                        p90: at(0.9),
                        p95: at(0.95),
                        p99: at(0.99),
                        min: sorted[0],
                        max: sorted[sorted.len() - 1],
                        count: sorted.len(),
                    },
                )
            })
            .collect()
    }

    /// Per-operation error rates
    pub fn error_rates(&self) -> HashMap<String, f64> {
        let errors = self.error_counts.lock().unwrap();
        let counts = self.op_counts.lock().unwrap();
        errors
            .iter()
            .map(|(op, &failed)| {
                let total = counts.get(op).copied().unwrap_or(0) + failed;
                (op.clone(), failed as f64 / total.max(1) as f64)
            })
            .collect()
    }

    /// Totals across all operations: (successful, failed)
    pub fn totals(&self) -> (u64, u64) {
        let ok: u64 = self.op_counts.lock().unwrap().values().sum();
        let failed: u64 = self.error_counts.lock().unwrap().values().sum();
        (ok, failed)
    }

    /// Seconds since the monitor was created
    pub fn uptime_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Recent memory trend, newest last
    pub fn memory_trend(&self, limit: usize) -> Vec<MemorySample> {
        let history = self.memory_history.lock().unwrap();
        history
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }
}

/// Resident set size of this process in megabytes
fn current_rss_mb() -> f64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0.0;
    };
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn monitor() -> StoreMonitor {
        StoreMonitor::new(StoreTuning::default())
    }

    #[test]
    fn test_track_op_records_timing() {
        let m = monitor();
        m.track_op("search", Instant::now());
        m.track_op("search", Instant::now());

        let percentiles = m.percentiles();
        assert_eq!(percentiles["search"].count, 2);
        let (ok, failed) = m.totals();
        assert_eq!(ok, 2);
        assert_eq!(failed, 0);
    }

    #[test]
    fn test_slow_op_alert() {
        let m = StoreMonitor::new(StoreTuning {
            slow_op_ms: 0,
            ..StoreTuning::default()
        });
        let mut rx = m.subscribe();

        let earlier = Instant::now() - Duration::from_millis(5);
        m.track_op("upsert_batch", earlier);

        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.alert_type, "slow_operation");
        assert_eq!(alert.severity, AlertSeverity::Medium);
    }

    #[test]
    fn test_error_rate_alert() {
        let m = monitor();
        let mut rx = m.subscribe();

        // 1 failure out of 1 call is a 100% error rate
        m.record_error("delete");

        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.alert_type, "high_error_rate");
    }

    #[test]
    fn test_alert_ring_bounded() {
        let m = monitor();
        for i in 0..60 {
            m.emit(
                "test",
                format!("alert {i}"),
                AlertSeverity::Low,
                serde_json::Value::Null,
            );
        }
        assert_eq!(m.recent_alerts(100).len(), MAX_ALERTS);
    }

    #[test]
    fn test_memory_sampling() {
        let m = monitor();
        let (rss, _) = m.sample_memory();
        assert!(rss >= 0.0);
        assert_eq!(m.memory_trend(10).len(), 1);
    }

    #[test]
    fn test_queue_depth_alert() {
        let m = StoreMonitor::new(StoreTuning {
            queue_high: 5,
            ..StoreTuning::default()
        });
        let mut rx = m.subscribe();

        m.track_queue_depth(3);
        assert!(rx.try_recv().is_err());

        m.track_queue_depth(10);
        assert_eq!(rx.try_recv().unwrap().alert_type, "queue_depth");
    }
}
