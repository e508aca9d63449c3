//! Typed event bus connecting the subsystems
//!
//! Each subsystem publishes enumerated events; subscribers receive a
//! broadcast stream and filter on the variants they care about. This keeps
//! the scheduler decoupled from the monitors' internals.

use crate::models::Task;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Resource status levels published with `ResourceStatusChanged`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Healthy,
    Warning,
    Critical,
    Emergency,
}

/// Execution window states published with `TimeWindowChanged`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionWindow {
    Active,
    Inactive,
    Paused,
    Maintenance,
}

/// Events flowing between subsystems
#[derive(Debug, Clone)]
pub enum SystemEvent {
    ResourceStatusChanged {
        old: ResourceStatus,
        new: ResourceStatus,
        timestamp: DateTime<Utc>,
    },
    TimeWindowChanged {
        old: ExecutionWindow,
        new: ExecutionWindow,
        timestamp: DateTime<Utc>,
    },
    BudgetAlert {
        threshold: f64,
        utilization: f64,
        emergency: bool,
    },
    DangerDetected {
        task_id: String,
        danger_level: String,
        blocked: bool,
    },
    EmergencyRecovery {
        reason: String,
        successful: bool,
        method: Option<String>,
    },
    TaskCompleted {
        task: Task,
        success: bool,
    },
}

/// Broadcast-backed bus; cloning is cheap and every clone publishes to the
/// same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; delivery is best-effort when no subscriber exists.
    pub fn publish(&self, event: SystemEvent) {
        debug!("Publishing event: {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
