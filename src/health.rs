//! Continuous health monitoring
//!
//! Periodically probes every service owned by the factory, tracks
//! consecutive failures per service, and publishes alerts on a broadcast
//! bus. When a service keeps failing and auto-recovery is enabled, the
//! monitor asks the factory to restart it.

use crate::config::MonitorConfig;
use crate::factory::{ServiceFactory, ServiceStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const MAX_ALERTS: usize = 100;
const MAX_HISTORY: usize = 1000;
const ALERT_RETENTION_HOURS: i64 = 24;

/// Alert severity for service health events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

/// A service health alert
#[derive(Debug, Clone, Serialize)]
pub struct HealthAlert {
    pub level: AlertLevel,
    pub service: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}

/// Periodic health monitor with auto-recovery
pub struct HealthMonitor {
    factory: Arc<ServiceFactory>,
    config: MonitorConfig,
    failure_counts: Mutex<HashMap<String, u32>>,
    alerts: Mutex<VecDeque<HealthAlert>>,
    alert_tx: broadcast::Sender<HealthAlert>,
    history: Mutex<VecDeque<serde_json::Value>>,
    total_checks: Mutex<(u64, u64)>,
    shutdown: CancellationToken,
    started: Instant,
}

impl HealthMonitor {
    pub fn new(factory: Arc<ServiceFactory>, config: MonitorConfig) -> Arc<Self> {
        let (alert_tx, _) = broadcast::channel(64);
        info!(
            "Health monitor initialized with {}s interval",
            config.health_interval_secs
        );
        Arc::new(Self {
            factory,
            config,
            failure_counts: Mutex::new(HashMap::new()),
            alerts: Mutex::new(VecDeque::new()),
            alert_tx,
            history: Mutex::new(VecDeque::new()),
            total_checks: Mutex::new((0, 0)),
            shutdown: CancellationToken::new(),
            started: Instant::now(),
        })
    }

    /// Start the periodic check loop
    pub fn start(self: &Arc<Self>) {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(monitor.config.health_interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = monitor.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                monitor.check_once().await;
                monitor.prune_alerts();
            }
            info!("Health monitor loop ended");
        });
    }

    /// Run one full health check, updating failure counts and possibly
    /// triggering recovery
    pub async fn check_once(&self) {
        {
            let mut counts = self.total_checks.lock().unwrap();
            counts.0 += 1;
        }

        let report = self.factory.check_health().await;

        {
            let mut history = self.history.lock().unwrap();
            history.push_back(serde_json::json!({
                "timestamp": Utc::now(),
                "overall_status": report["overall_status"],
            }));
            while history.len() > MAX_HISTORY {
                history.pop_front();
            }
        }

        let mut to_recover = Vec::new();
        for (name, info) in self.factory.service_info() {
            match info.status {
                ServiceStatus::Healthy | ServiceStatus::Disabled => {
                    self.failure_counts.lock().unwrap().insert(name, 0);
                }
                ServiceStatus::Initializing => {}
                ServiceStatus::Unhealthy | ServiceStatus::Error => {
                    let count = {
                        let mut counts = self.failure_counts.lock().unwrap();
                        let entry = counts.entry(name.clone()).or_insert(0);
                        *entry += 1;
                        *entry
                    };

                    if count == 1 {
                        self.emit(
                            AlertLevel::Warning,
                            &name,
                            format!("Service {name} is {:?}", info.status),
                            info.health_data.clone(),
                        );
                    } else if count >= self.config.alert_threshold {
                        self.emit(
                            AlertLevel::Error,
                            &name,
                            format!("Service {name} has failed {count} consecutive checks"),
                            info.health_data.clone(),
                        );
                        if self.config.auto_recovery {
                            to_recover.push(name);
                        }
                    }
                }
            }
        }

        for name in to_recover {
            self.attempt_recovery(&name).await;
        }
    }

    async fn attempt_recovery(&self, name: &str) {
        info!("Attempting to recover service: {}", name);

        if self.factory.restart_service(name).await {
            self.emit(
                AlertLevel::Info,
                name,
                format!("Service {name} recovered"),
                serde_json::json!({ "recovery": true }),
            );
            self.failure_counts
                .lock()
                .unwrap()
                .insert(name.to_string(), 0);
        } else {
            error!("Recovery of '{}' failed", name);
            self.emit(
                AlertLevel::Critical,
                name,
                format!("Service {name} recovery failed"),
                serde_json::json!({ "recovery": false }),
            );
            let mut counts = self.total_checks.lock().unwrap();
            counts.1 += 1;
        }
    }

    fn emit(&self, level: AlertLevel, service: &str, message: String, details: serde_json::Value) {
        let alert = HealthAlert {
            level,
            service: service.to_string(),
            message: message.clone(),
            timestamp: Utc::now(),
            details,
        };

        {
            let mut alerts = self.alerts.lock().unwrap();
            alerts.push_back(alert.clone());
            while alerts.len() > MAX_ALERTS {
                alerts.pop_front();
            }
        }

        // Subscribers receive alerts over the channel; a misbehaving
        // subscriber cannot disturb the monitor
        let _ = self.alert_tx.send(alert);

        match level {
            AlertLevel::Info => info!("Health alert [{}]: {}", service, message),
            AlertLevel::Warning => warn!("Health alert [{}]: {}", service, message),
            AlertLevel::Error | AlertLevel::Critical => {
                error!("Health alert [{}]: {}", service, message)
            }
        }
    }

    fn prune_alerts(&self) {
        let cutoff = Utc::now() - chrono::Duration::hours(ALERT_RETENTION_HOURS);
        let mut alerts = self.alerts.lock().unwrap();
        alerts.retain(|alert| alert.timestamp > cutoff);
    }

    /// Subscribe to health alerts
    pub fn subscribe(&self) -> broadcast::Receiver<HealthAlert> {
        self.alert_tx.subscribe()
    }

    /// Recent alerts, optionally filtered by level and service
    pub fn alerts(&self, level: Option<AlertLevel>, service: Option<&str>) -> Vec<HealthAlert> {
        self.alerts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| level.map(|l| a.level == l).unwrap_or(true))
            .filter(|a| service.map(|s| a.service == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Monitor status summary
    pub fn summary(&self) -> serde_json::Value {
        let (total, failed) = *self.total_checks.lock().unwrap();
        let recent: Vec<HealthAlert> = self
            .alerts
            .lock()
            .unwrap()
            .iter()
            .rev()
            .take(10)
            .rev()
            .cloned()
            .collect();

        serde_json::json!({
            "uptime_secs": self.started.elapsed().as_secs_f64(),
            "total_checks": total,
            "failed_recoveries": failed,
            "check_interval_secs": self.config.health_interval_secs,
            "auto_recovery": self.config.auto_recovery,
            "service_failures": *self.failure_counts.lock().unwrap(),
            "recent_alerts": recent,
        })
    }

    /// Stop the monitor loop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RagConfig;

    fn offline_config() -> RagConfig {
        let mut config = RagConfig::default();
        config.database.qdrant_url = "http://127.0.0.1:1".to_string();
        config.model.ollama_url = "http://127.0.0.1:1".to_string();
        config.database.cache.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_check_tracks_consecutive_failures() {
        let factory = ServiceFactory::initialize(offline_config()).await;
        let monitor = HealthMonitor::new(
            factory,
            MonitorConfig {
                auto_recovery: false,
                ..MonitorConfig::default()
            },
        );

        monitor.check_once().await;
        let counts = monitor.failure_counts.lock().unwrap().clone();
        // The LLM cannot be probed with Ollama down
        assert!(counts.get("llm").copied().unwrap_or(0) >= 1);
    }

    #[tokio::test]
    async fn test_first_failure_emits_warning() {
        let factory = ServiceFactory::initialize(offline_config()).await;
        let monitor = HealthMonitor::new(
            factory,
            MonitorConfig {
                auto_recovery: false,
                ..MonitorConfig::default()
            },
        );
        let mut rx = monitor.subscribe();

        monitor.check_once().await;

        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.level, AlertLevel::Warning);
    }

    #[tokio::test]
    async fn test_alert_filtering() {
        let factory = ServiceFactory::initialize(offline_config()).await;
        let monitor = HealthMonitor::new(
            factory,
            MonitorConfig {
                auto_recovery: false,
                ..MonitorConfig::default()
            },
        );

        monitor.emit(
            AlertLevel::Info,
            "llm",
            "note".to_string(),
            serde_json::Value::Null,
        );
        monitor.emit(
            AlertLevel::Critical,
            "vector_store",
            "down".to_string(),
            serde_json::Value::Null,
        );

        let critical = monitor.alerts(Some(AlertLevel::Critical), None);
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].service, "vector_store");

        let llm_alerts = monitor.alerts(None, Some("llm"));
        assert_eq!(llm_alerts.len(), 1);
    }

    #[tokio::test]
    async fn test_summary_shape() {
        let factory = ServiceFactory::initialize(offline_config()).await;
        let monitor = HealthMonitor::new(factory, MonitorConfig::default());
        monitor.check_once().await;

        let summary = monitor.summary();
        assert_eq!(summary["total_checks"], 1);
        assert!(summary["recent_alerts"].is_array());
    }
}
