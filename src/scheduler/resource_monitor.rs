//! System resource monitoring for safe night execution
//!
//! Samples CPU, memory, and disk on a fixed cadence into a ring buffer,
//! classifies each snapshot against configured thresholds, and publishes
//! status changes on the event bus. Emergency snapshots additionally
//! publish an emergency transition so the scheduler can shut down.

use crate::config::ResourceConfig;
use crate::events::{EventBus, ResourceStatus, SystemEvent};
use crate::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Snapshot of system resources at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_gb: f64,
    pub memory_available_gb: f64,
    pub disk_percent: f64,
    pub disk_free_gb: f64,
    pub open_files: usize,
    pub process_count: usize,
    pub load_average: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub cpu_warning_percent: f64,
    pub cpu_critical_percent: f64,
    pub memory_warning_percent: f64,
    pub memory_critical_percent: f64,
    pub memory_absolute_gb: f64,
    pub disk_warning_percent: f64,
    pub disk_critical_percent: f64,
    pub min_free_disk_gb: f64,
}

impl From<&ResourceConfig> for ResourceLimits {
    fn from(config: &ResourceConfig) -> Self {
        Self {
            cpu_warning_percent: config.cpu_warning_percent,
            cpu_critical_percent: config.cpu_critical_percent,
            memory_warning_percent: config.memory_warning_percent,
            memory_critical_percent: config.memory_critical_percent,
            memory_absolute_gb: config.memory_absolute_gb,
            disk_warning_percent: config.disk_warning_percent,
            disk_critical_percent: config.disk_critical_percent,
            min_free_disk_gb: config.min_free_disk_gb,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorStats {
    pub status_changes: u64,
    pub emergency_stops: u64,
    pub max_cpu_seen: f64,
    pub max_memory_seen: f64,
    pub avg_cpu_last_hour: f64,
    pub avg_memory_last_hour: f64,
}

/// Estimated resource impact of one task
#[derive(Debug, Clone, Copy)]
pub struct TaskImpactEstimate {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub duration_minutes: u64,
}

/// Remaining room before the critical thresholds
#[derive(Debug, Clone, Serialize)]
pub struct ResourceHeadroom {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub memory_available_gb: f64,
    pub disk_free_gb: f64,
}

/// Per-metric trend over a window
#[derive(Debug, Clone, Serialize)]
pub struct MetricTrend {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub current: f64,
    pub trend: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceTrends {
    pub period_hours: i64,
    pub data_points: usize,
    pub cpu: MetricTrend,
    pub memory: MetricTrend,
}

struct MonitorState {
    current_status: ResourceStatus,
    last_snapshot: Option<ResourceSnapshot>,
    history: VecDeque<ResourceSnapshot>,
    stats: MonitorStats,
}

pub struct ResourceMonitor {
    limits: ResourceLimits,
    monitor_interval: Duration,
    max_history_size: usize,
    state: Arc<RwLock<MonitorState>>,
    events: EventBus,
    monitor_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    shutdown_tx: Arc<Mutex<Option<mpsc::Sender<()>>>>,
}

impl ResourceMonitor {
    pub fn new(config: &ResourceConfig, events: EventBus) -> Self {
        Self {
            limits: ResourceLimits::from(config),
            monitor_interval: Duration::from_secs(config.monitor_interval_secs),
            max_history_size: config.max_history_size,
            state: Arc::new(RwLock::new(MonitorState {
                current_status: ResourceStatus::Healthy,
                last_snapshot: None,
                history: VecDeque::new(),
                stats: MonitorStats::default(),
            })),
            events,
            monitor_handle: Arc::new(Mutex::new(None)),
            shutdown_tx: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn start_monitoring(&self) -> Result<()> {
        let mut handle_guard = self.monitor_handle.lock().await;
        if handle_guard.is_some() {
            warn!("Resource monitoring already started");
            return Ok(());
        }

        info!(
            "Starting resource monitoring ({}s interval)",
            self.monitor_interval.as_secs()
        );

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        {
            let mut tx_guard = self.shutdown_tx.lock().await;
            *tx_guard = Some(shutdown_tx);
        }

        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let limits = self.limits.clone();
        let max_history = self.max_history_size;
        let interval_duration = self.monitor_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match take_snapshot().await {
                            Ok(snapshot) => {
                                ingest(&state, &events, &limits, max_history, snapshot).await;
                            }
                            Err(e) => error!("Resource sampling failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Resource monitoring shutting down");
                        break;
                    }
                }
            }
        });

        *handle_guard = Some(handle);
        Ok(())
    }

    pub async fn stop_monitoring(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.monitor_handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Resource monitor task join error: {}", e);
            }
        }
    }

    pub async fn current_status(&self) -> ResourceStatus {
        self.state.read().await.current_status
    }

    pub async fn last_snapshot(&self) -> Option<ResourceSnapshot> {
        self.state.read().await.last_snapshot.clone()
    }

    pub async fn stats(&self) -> MonitorStats {
        self.state.read().await.stats.clone()
    }

    /// Sample immediately, outside the monitoring cadence.
    pub async fn force_resource_check(&self) -> Result<ResourceSnapshot> {
        let snapshot = take_snapshot().await?;
        self.ingest_snapshot(snapshot.clone()).await;
        Ok(snapshot)
    }

    /// Feed one snapshot through classification, history, statistics, and
    /// event publication. The monitoring loop and forced checks share this
    /// path.
    pub async fn ingest_snapshot(&self, snapshot: ResourceSnapshot) {
        ingest(
            &self.state,
            &self.events,
            &self.limits,
            self.max_history_size,
            snapshot,
        )
        .await;
    }

    /// False on Critical/Emergency status, near the absolute memory cap,
    /// or within 1.5x of the minimum free-disk margin.
    pub async fn is_safe_to_execute(&self) -> (bool, String) {
        let state = self.state.read().await;

        match state.current_status {
            ResourceStatus::Emergency => {
                return (
                    false,
                    "System in emergency state - resource limits exceeded".to_string(),
                )
            }
            ResourceStatus::Critical => {
                return (
                    false,
                    "System in critical state - resources at dangerous levels".to_string(),
                )
            }
            _ => {}
        }

        let Some(snapshot) = &state.last_snapshot else {
            return (false, "No resource data available".to_string());
        };

        if snapshot.memory_used_gb >= self.limits.memory_absolute_gb * 0.9 {
            return (
                false,
                format!("Memory usage too high: {:.1}GB", snapshot.memory_used_gb),
            );
        }

        if snapshot.disk_free_gb <= self.limits.min_free_disk_gb * 1.5 {
            return (
                false,
                format!("Low disk space: {:.1}GB free", snapshot.disk_free_gb),
            );
        }

        (true, "Resources within safe limits".to_string())
    }

    /// Distance to the critical thresholds, per metric.
    pub async fn resource_headroom(&self) -> Option<ResourceHeadroom> {
        let state = self.state.read().await;
        let snapshot = state.last_snapshot.as_ref()?;
        Some(ResourceHeadroom {
            cpu_percent: (self.limits.cpu_critical_percent - snapshot.cpu_percent).max(0.0),
            memory_percent: (self.limits.memory_critical_percent - snapshot.memory_percent)
                .max(0.0),
            disk_percent: (self.limits.disk_critical_percent - snapshot.disk_percent).max(0.0),
            memory_available_gb: snapshot.memory_available_gb,
            disk_free_gb: snapshot.disk_free_gb,
        })
    }

    /// Compare the estimated impact of a task type against current
    /// headroom.
    pub async fn can_safely_run_task(&self, task_type: &str) -> (bool, String) {
        let (safe, reason) = self.is_safe_to_execute().await;
        if !safe {
            return (false, reason);
        }

        let Some(headroom) = self.resource_headroom().await else {
            return (false, "No resource data available".to_string());
        };

        let estimate = estimate_task_impact(task_type);
        if estimate.cpu_percent > headroom.cpu_percent {
            return (
                false,
                format!(
                    "Insufficient CPU headroom: need {:.0}%, have {:.1}%",
                    estimate.cpu_percent, headroom.cpu_percent
                ),
            );
        }
        if estimate.memory_percent > headroom.memory_percent {
            return (
                false,
                format!(
                    "Insufficient memory headroom: need {:.0}%, have {:.1}%",
                    estimate.memory_percent, headroom.memory_percent
                ),
            );
        }

        (true, "Task can be safely executed".to_string())
    }

    /// Min/max/avg/current/trend per metric over the last `hours`.
    pub async fn get_resource_trends(&self, hours: i64) -> Option<ResourceTrends> {
        let state = self.state.read().await;
        let cutoff = Utc::now() - ChronoDuration::hours(hours);
        let recent: Vec<&ResourceSnapshot> = state
            .history
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .collect();

        if recent.len() < 2 {
            return None;
        }

        let cpu: Vec<f64> = recent.iter().map(|s| s.cpu_percent).collect();
        let memory: Vec<f64> = recent.iter().map(|s| s.memory_percent).collect();

        Some(ResourceTrends {
            period_hours: hours,
            data_points: recent.len(),
            cpu: metric_trend(&cpu),
            memory: metric_trend(&memory),
        })
    }

    pub async fn cleanup_history(&self, keep_hours: i64) {
        let cutoff = Utc::now() - ChronoDuration::hours(keep_hours);
        let mut state = self.state.write().await;
        let before = state.history.len();
        state.history.retain(|s| s.timestamp >= cutoff);
        let removed = before - state.history.len();
        if removed > 0 {
            info!("Cleaned up {} old resource history entries", removed);
        }
    }

    pub async fn history_size(&self) -> usize {
        self.state.read().await.history.len()
    }
}

async fn ingest(
    state: &Arc<RwLock<MonitorState>>,
    events: &EventBus,
    limits: &ResourceLimits,
    max_history: usize,
    snapshot: ResourceSnapshot,
) {
    let new_status = classify_snapshot(&snapshot, limits);
    let mut guard = state.write().await;

    guard.history.push_back(snapshot.clone());
    while guard.history.len() > max_history {
        guard.history.pop_front();
    }

    guard.stats.max_cpu_seen = guard.stats.max_cpu_seen.max(snapshot.cpu_percent);
    guard.stats.max_memory_seen = guard.stats.max_memory_seen.max(snapshot.memory_percent);

    let one_hour_ago = Utc::now() - ChronoDuration::hours(1);
    let recent: Vec<&ResourceSnapshot> = guard
        .history
        .iter()
        .filter(|s| s.timestamp >= one_hour_ago)
        .collect();
    if !recent.is_empty() {
        let avg_cpu = recent.iter().map(|s| s.cpu_percent).sum::<f64>() / recent.len() as f64;
        let avg_memory =
            recent.iter().map(|s| s.memory_percent).sum::<f64>() / recent.len() as f64;
        guard.stats.avg_cpu_last_hour = avg_cpu;
        guard.stats.avg_memory_last_hour = avg_memory;
    }

    let old_status = guard.current_status;
    guard.last_snapshot = Some(snapshot);

    if new_status != old_status {
        guard.current_status = new_status;
        guard.stats.status_changes += 1;
        if new_status == ResourceStatus::Emergency {
            guard.stats.emergency_stops += 1;
        }
        drop(guard);

        info!("Resource status change: {:?} -> {:?}", old_status, new_status);
        events.publish(SystemEvent::ResourceStatusChanged {
            old: old_status,
            new: new_status,
            timestamp: Utc::now(),
        });
    }
}

/// Overall status is the worst of any metric. Thresholds are inclusive,
/// so a metric sitting exactly on Warning reports Warning.
pub fn classify_snapshot(snapshot: &ResourceSnapshot, limits: &ResourceLimits) -> ResourceStatus {
    if snapshot.cpu_percent >= 98.0
        || snapshot.memory_percent >= 98.0
        || snapshot.memory_used_gb >= limits.memory_absolute_gb
        || snapshot.disk_free_gb <= 1.0
    {
        return ResourceStatus::Emergency;
    }

    if snapshot.cpu_percent >= limits.cpu_critical_percent
        || snapshot.memory_percent >= limits.memory_critical_percent
        || snapshot.disk_percent >= limits.disk_critical_percent
        || snapshot.disk_free_gb <= limits.min_free_disk_gb
    {
        return ResourceStatus::Critical;
    }

    if snapshot.cpu_percent >= limits.cpu_warning_percent
        || snapshot.memory_percent >= limits.memory_warning_percent
        || snapshot.disk_percent >= limits.disk_warning_percent
    {
        return ResourceStatus::Warning;
    }

    ResourceStatus::Healthy
}

pub fn estimate_task_impact(task_type: &str) -> TaskImpactEstimate {
    match task_type {
        "analysis" => TaskImpactEstimate {
            cpu_percent: 30.0,
            memory_percent: 15.0,
            duration_minutes: 10,
        },
        "generation" => TaskImpactEstimate {
            cpu_percent: 40.0,
            memory_percent: 20.0,
            duration_minutes: 25,
        },
        "testing" => TaskImpactEstimate {
            cpu_percent: 35.0,
            memory_percent: 12.0,
            duration_minutes: 20,
        },
        _ => TaskImpactEstimate {
            cpu_percent: 20.0,
            memory_percent: 10.0,
            duration_minutes: 15,
        },
    }
}

fn metric_trend(values: &[f64]) -> MetricTrend {
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let avg = values.iter().sum::<f64>() / values.len() as f64;
    let current = *values.last().unwrap_or(&0.0);
    let first = *values.first().unwrap_or(&0.0);

    MetricTrend {
        min,
        max,
        avg,
        current,
        trend: if current > first {
            "rising".to_string()
        } else {
            "falling".to_string()
        },
    }
}

/// Take a live snapshot of the host's resources.
pub async fn take_snapshot() -> Result<ResourceSnapshot> {
    let (memory_percent, memory_used_gb, memory_available_gb) = read_memory();
    let cpu_percent = read_cpu().await;
    let (disk_percent, disk_free_gb) = read_disk();

    Ok(ResourceSnapshot {
        timestamp: Utc::now(),
        cpu_percent,
        memory_percent,
        memory_used_gb,
        memory_available_gb,
        disk_percent,
        disk_free_gb,
        open_files: read_open_files(),
        process_count: read_process_count(),
        load_average: read_load_average(),
    })
}

#[cfg(target_os = "linux")]
fn read_memory() -> (f64, f64, f64) {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        let mut mem_total_kb = 0u64;
        let mut mem_available_kb = 0u64;

        for line in meminfo.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 2 {
                match parts[0] {
                    "MemTotal:" => mem_total_kb = parts[1].parse().unwrap_or(0),
                    "MemAvailable:" => mem_available_kb = parts[1].parse().unwrap_or(0),
                    _ => {}
                }
            }
        }

        if mem_total_kb > 0 {
            let used_kb = mem_total_kb.saturating_sub(mem_available_kb);
            let percent = (used_kb as f64 / mem_total_kb as f64) * 100.0;
            let used_gb = used_kb as f64 / (1024.0 * 1024.0);
            let available_gb = mem_available_kb as f64 / (1024.0 * 1024.0);
            return (percent, used_gb, available_gb);
        }
    }
    (0.0, 0.0, 0.0)
}

#[cfg(not(target_os = "linux"))]
fn read_memory() -> (f64, f64, f64) {
    use std::process::Command;

    // Total via sysctl, free pages via vm_stat
    let total_bytes = Command::new("sysctl")
        .args(["-n", "hw.memsize"])
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .and_then(|s| s.trim().parse::<u64>().ok());

    if let Some(total) = total_bytes {
        if let Ok(output) = Command::new("vm_stat").output() {
            if let Ok(stats) = String::from_utf8(output.stdout) {
                let mut page_size: u64 = 4096;
                let mut pages_free: u64 = 0;
                for line in stats.lines() {
                    if line.contains("page size of") {
                        if let Some(size) = line.split_whitespace().nth(7) {
                            page_size = size.parse().unwrap_or(4096);
                        }
                    } else if line.starts_with("Pages free:") {
                        if let Some(value) = line.split_whitespace().nth(2) {
                            pages_free = value.trim_end_matches('.').parse().unwrap_or(0);
                        }
                    }
                }
                let free = pages_free * page_size;
                let used = total.saturating_sub(free);
                let percent = (used as f64 / total as f64) * 100.0;
                return (
                    percent,
                    used as f64 / 1e9,
                    free as f64 / 1e9,
                );
            }
        }
    }
    (0.0, 0.0, 0.0)
}

#[cfg(target_os = "linux")]
async fn read_cpu() -> f64 {
    fn parse_cpu_line(stat: &str) -> Option<(u64, u64)> {
        let line = stat.lines().next()?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 5 && parts[0] == "cpu" {
            let user: u64 = parts[1].parse().unwrap_or(0);
            let nice: u64 = parts[2].parse().unwrap_or(0);
            let system: u64 = parts[3].parse().unwrap_or(0);
            let idle: u64 = parts[4].parse().unwrap_or(0);
            let busy = user + nice + system;
            Some((busy, busy + idle))
        } else {
            None
        }
    }

    let first = std::fs::read_to_string("/proc/stat").ok();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = std::fs::read_to_string("/proc/stat").ok();

    if let (Some(s1), Some(s2)) = (first, second) {
        if let (Some((busy1, total1)), Some((busy2, total2))) =
            (parse_cpu_line(&s1), parse_cpu_line(&s2))
        {
            let busy_delta = busy2.saturating_sub(busy1);
            let total_delta = total2.saturating_sub(total1);
            if total_delta > 0 {
                return (busy_delta as f64 / total_delta as f64) * 100.0;
            }
        }
    }
    0.0
}

#[cfg(not(target_os = "linux"))]
async fn read_cpu() -> f64 {
    use std::process::Command;

    if let Ok(output) = Command::new("top").args(["-l", "1", "-n", "0"]).output() {
        if let Ok(stats) = String::from_utf8(output.stdout) {
            for line in stats.lines() {
                if line.contains("CPU usage:") {
                    let mut total = 0.0;
                    let parts: Vec<&str> = line.split_whitespace().collect();
                    for (i, part) in parts.iter().enumerate() {
                        if part.ends_with('%') {
                            if let Ok(value) = part.trim_end_matches('%').parse::<f64>() {
                                if i > 0 && matches!(parts[i - 1], "usage:" | "sys,") {
                                    total += value;
                                }
                            }
                        }
                    }
                    return total;
                }
            }
        }
    }
    0.0
}

fn read_disk() -> (f64, f64) {
    use std::process::Command;

    if let Ok(output) = Command::new("df").args(["-k", "/"]).output() {
        if let Ok(stats) = String::from_utf8(output.stdout) {
            if let Some(data_line) = stats.lines().nth(1) {
                let parts: Vec<&str> = data_line.split_whitespace().collect();
                // Filesystem 1K-blocks Used Available Use% Mounted
                if parts.len() >= 5 {
                    let available_kb: f64 = parts[3].parse().unwrap_or(0.0);
                    for part in &parts {
                        if part.ends_with('%') {
                            if let Ok(usage) = part.trim_end_matches('%').parse::<f64>() {
                                return (usage, available_kb / (1024.0 * 1024.0));
                            }
                        }
                    }
                }
            }
        }
    }
    (0.0, f64::MAX)
}

#[cfg(target_os = "linux")]
fn read_open_files() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn read_open_files() -> usize {
    0
}

#[cfg(target_os = "linux")]
fn read_process_count() -> usize {
    std::fs::read_dir("/proc")
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.file_name()
                        .to_string_lossy()
                        .chars()
                        .all(|c| c.is_ascii_digit())
                })
                .count()
        })
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn read_process_count() -> usize {
    0
}

#[cfg(target_os = "linux")]
fn read_load_average() -> Vec<f64> {
    std::fs::read_to_string("/proc/loadavg")
        .map(|content| {
            content
                .split_whitespace()
                .take(3)
                .filter_map(|v| v.parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(not(target_os = "linux"))]
fn read_load_average() -> Vec<f64> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SystemEvent;

    fn limits() -> ResourceLimits {
        ResourceLimits::from(&ResourceConfig::default())
    }

    fn healthy_snapshot() -> ResourceSnapshot {
        ResourceSnapshot {
            timestamp: Utc::now(),
            cpu_percent: 10.0,
            memory_percent: 30.0,
            memory_used_gb: 2.0,
            memory_available_gb: 6.0,
            disk_percent: 40.0,
            disk_free_gb: 100.0,
            open_files: 42,
            process_count: 120,
            load_average: vec![0.5, 0.4, 0.3],
        }
    }

    #[test]
    fn exactly_warning_threshold_is_warning_not_critical() {
        let mut snapshot = healthy_snapshot();
        snapshot.cpu_percent = 70.0;
        assert_eq!(classify_snapshot(&snapshot, &limits()), ResourceStatus::Warning);

        snapshot.cpu_percent = 89.9;
        assert_eq!(classify_snapshot(&snapshot, &limits()), ResourceStatus::Warning);

        snapshot.cpu_percent = 90.0;
        assert_eq!(classify_snapshot(&snapshot, &limits()), ResourceStatus::Critical);
    }

    #[test]
    fn memory_99_percent_is_emergency() {
        let mut snapshot = healthy_snapshot();
        snapshot.memory_percent = 99.0;
        assert_eq!(
            classify_snapshot(&snapshot, &limits()),
            ResourceStatus::Emergency
        );
    }

    #[test]
    fn absolute_memory_cap_is_emergency() {
        let mut snapshot = healthy_snapshot();
        snapshot.memory_used_gb = 8.0;
        assert_eq!(
            classify_snapshot(&snapshot, &limits()),
            ResourceStatus::Emergency
        );
    }

    #[test]
    fn low_disk_escalates() {
        let mut snapshot = healthy_snapshot();
        snapshot.disk_free_gb = 5.0;
        assert_eq!(
            classify_snapshot(&snapshot, &limits()),
            ResourceStatus::Critical
        );

        snapshot.disk_free_gb = 1.0;
        assert_eq!(
            classify_snapshot(&snapshot, &limits()),
            ResourceStatus::Emergency
        );
    }

    #[tokio::test]
    async fn emergency_snapshot_publishes_status_change() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let monitor = ResourceMonitor::new(&ResourceConfig::default(), bus);

        let mut snapshot = healthy_snapshot();
        snapshot.memory_percent = 99.0;
        monitor.ingest_snapshot(snapshot).await;

        assert_eq!(monitor.current_status().await, ResourceStatus::Emergency);
        match rx.recv().await.unwrap() {
            SystemEvent::ResourceStatusChanged { old, new, .. } => {
                assert_eq!(old, ResourceStatus::Healthy);
                assert_eq!(new, ResourceStatus::Emergency);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let stats = monitor.stats().await;
        assert_eq!(stats.emergency_stops, 1);
        assert_eq!(stats.status_changes, 1);
    }

    #[tokio::test]
    async fn safe_to_execute_honors_margins() {
        let monitor = ResourceMonitor::new(&ResourceConfig::default(), EventBus::default());

        // No data yet
        let (safe, reason) = monitor.is_safe_to_execute().await;
        assert!(!safe);
        assert!(reason.contains("No resource data"));

        monitor.ingest_snapshot(healthy_snapshot()).await;
        let (safe, _) = monitor.is_safe_to_execute().await;
        assert!(safe);

        // 1.5x min-free-disk margin: 5GB * 1.5 = 7.5GB
        let mut tight_disk = healthy_snapshot();
        tight_disk.disk_free_gb = 7.0;
        monitor.ingest_snapshot(tight_disk).await;
        let (safe, reason) = monitor.is_safe_to_execute().await;
        assert!(!safe);
        assert!(reason.contains("disk"));
    }

    #[tokio::test]
    async fn task_headroom_check() {
        let monitor = ResourceMonitor::new(&ResourceConfig::default(), EventBus::default());

        let mut snapshot = healthy_snapshot();
        snapshot.cpu_percent = 60.0; // headroom to critical: 30
        monitor.ingest_snapshot(snapshot).await;

        let (ok, _) = monitor.can_safely_run_task("default").await; // needs 20
        assert!(ok);
        let (ok, reason) = monitor.can_safely_run_task("generation").await; // needs 40
        assert!(!ok);
        assert!(reason.contains("CPU headroom"));
    }

    #[tokio::test]
    async fn ring_buffer_caps_history() {
        let config = ResourceConfig {
            max_history_size: 3,
            ..ResourceConfig::default()
        };
        let monitor = ResourceMonitor::new(&config, EventBus::default());

        for _ in 0..5 {
            monitor.ingest_snapshot(healthy_snapshot()).await;
        }
        assert_eq!(monitor.history_size().await, 3);
    }

    #[tokio::test]
    async fn trends_report_min_max_avg() {
        let monitor = ResourceMonitor::new(&ResourceConfig::default(), EventBus::default());

        for cpu in [10.0, 20.0, 30.0] {
            let mut snapshot = healthy_snapshot();
            snapshot.cpu_percent = cpu;
            monitor.ingest_snapshot(snapshot).await;
        }

        let trends = monitor.get_resource_trends(1).await.unwrap();
        assert_eq!(trends.data_points, 3);
        assert!((trends.cpu.min - 10.0).abs() < f64::EPSILON);
        assert!((trends.cpu.max - 30.0).abs() < f64::EPSILON);
        assert!((trends.cpu.avg - 20.0).abs() < f64::EPSILON);
        assert_eq!(trends.cpu.trend, "rising");
    }
}
