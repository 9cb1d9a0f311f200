//! Streaming connection registry
//!
//! Tracks live token streams so they can be cancelled and reaped. Every
//! connection carries a cancellation token; a background sweeper removes
//! closed connections and cancels ones idle past the timeout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Active,
    Closed,
}

/// One tracked streaming connection
#[derive(Debug, Clone, Serialize)]
pub struct StreamConnection {
    pub connection_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: ConnectionStatus,
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(skip)]
    pub cancel: CancellationToken,
}

/// Wire events emitted on a token stream
///
/// Serializes to exactly `{"type":"content","content":…}`, `{"type":"end"}`
/// and `{"type":"error","message":…}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Content { content: String },
    End,
    Error { message: String },
}

/// Registry of live streaming connections
pub struct StreamRegistry {
    connections: Mutex<HashMap<Uuid, StreamConnection>>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
}

impl StreamRegistry {
    pub fn new(idle_timeout_mins: u64) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            idle_timeout: Duration::from_secs(idle_timeout_mins * 60),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the periodic sweeper
    pub fn start_sweeper(self: &Arc<Self>) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = registry.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let removed = registry.sweep();
                if removed > 0 {
                    info!("Stream sweeper removed {} connections", removed);
                }
            }
        });
    }

    /// Register a new connection, returning its id and cancellation token
    pub fn open(&self, metadata: HashMap<String, serde_json::Value>) -> (Uuid, CancellationToken) {
        let connection_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let now = Utc::now();

        let connection = StreamConnection {
            connection_id,
            created_at: now,
            last_activity: now,
            status: ConnectionStatus::Active,
            metadata,
            cancel: cancel.clone(),
        };

        self.connections
            .lock()
            .unwrap()
            .insert(connection_id, connection);
        debug!("Opened stream connection {}", connection_id);
        (connection_id, cancel)
    }

    /// Refresh a connection's activity timestamp
    pub fn touch(&self, connection_id: Uuid) -> bool {
        let mut connections = self.connections.lock().unwrap();
        match connections.get_mut(&connection_id) {
            Some(connection) => {
                connection.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Cancel in-flight generation and mark the connection closed
    pub fn close(&self, connection_id: Uuid) -> bool {
        let mut connections = self.connections.lock().unwrap();
        match connections.get_mut(&connection_id) {
            Some(connection) => {
                connection.cancel.cancel();
                connection.status = ConnectionStatus::Closed;
                debug!("Closed stream connection {}", connection_id);
                true
            }
            None => false,
        }
    }

    /// Fetch a connection snapshot
    pub fn get(&self, connection_id: Uuid) -> Option<StreamConnection> {
        self.connections
            .lock()
            .unwrap()
            .get(&connection_id)
            .cloned()
    }

    /// Snapshot of all tracked connections
    pub fn list(&self) -> Vec<StreamConnection> {
        self.connections.lock().unwrap().values().cloned().collect()
    }

    /// Number of tracked connections
    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove closed connections and cancel+remove idle ones. Returns the
    /// number removed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let idle_cutoff =
            chrono::Duration::from_std(self.idle_timeout).unwrap_or(chrono::Duration::zero());

        let mut connections = self.connections.lock().unwrap();
        let before = connections.len();

        connections.retain(|_, connection| {
            let idle = now.signed_duration_since(connection.last_activity) > idle_cutoff;
            let keep = connection.status == ConnectionStatus::Active && !idle;
            if !keep {
                connection.cancel.cancel();
            }
            keep
        });

        before - connections.len()
    }

    /// Stop the sweeper
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
