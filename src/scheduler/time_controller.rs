//! Execution window control
//!
//! Owns the night window: execution is permitted only while the local
//! clock is inside the configured window and the controller has not been
//! paused or put into maintenance. Active <-> Inactive transitions are
//! automatic on window boundaries; Paused and Maintenance are manual.

use crate::config::SchedulerConfig;
use crate::constants::{TIME_MONITOR_INTERVAL_SECS, WINDOW_SAFETY_MARGIN_SECS};
use crate::events::{EventBus, ExecutionWindow, SystemEvent};
use crate::Result;
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct TimeControllerStats {
    pub window_transitions: u64,
    pub tasks_completed: u64,
    pub tasks_with_changes: u64,
}

pub struct TimeController {
    start_hour: u32,
    end_hour: u32,
    state: Arc<RwLock<ExecutionWindow>>,
    stats: Arc<RwLock<TimeControllerStats>>,
    events: EventBus,
    monitor_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    shutdown_tx: Arc<Mutex<Option<mpsc::Sender<()>>>>,
}

impl TimeController {
    pub fn new(config: &SchedulerConfig, events: EventBus) -> Self {
        let initial = if window_contains(config.night_start_hour, config.night_end_hour, Local::now().hour())
        {
            ExecutionWindow::Active
        } else {
            ExecutionWindow::Inactive
        };

        Self {
            start_hour: config.night_start_hour,
            end_hour: config.night_end_hour,
            state: Arc::new(RwLock::new(initial)),
            stats: Arc::new(RwLock::new(TimeControllerStats::default())),
            events,
            monitor_handle: Arc::new(Mutex::new(None)),
            shutdown_tx: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn current_state(&self) -> ExecutionWindow {
        *self.state.read().await
    }

    /// True iff the local time lies in the night window and the controller
    /// is neither paused nor in maintenance.
    pub async fn is_execution_allowed(&self) -> bool {
        match *self.state.read().await {
            ExecutionWindow::Paused | ExecutionWindow::Maintenance => false,
            _ => window_contains(self.start_hour, self.end_hour, Local::now().hour()),
        }
    }

    /// Check whether a task of the given duration fits in the remaining
    /// window, including the safety margin.
    pub async fn can_start_task(&self, estimated_duration: Duration) -> (bool, String) {
        if !self.is_execution_allowed().await {
            return (false, "Execution not allowed outside night window".to_string());
        }

        let remaining =
            seconds_until_window_end(self.start_hour, self.end_hour, Local::now().naive_local());
        let needed = estimated_duration.as_secs() + WINDOW_SAFETY_MARGIN_SECS;

        if (needed as i64) > remaining {
            (
                false,
                format!(
                    "Remaining window too short: need {needed}s (incl. margin), have {remaining}s"
                ),
            )
        } else {
            (true, "Task fits in remaining window".to_string())
        }
    }

    pub fn time_until_next_window(&self) -> ChronoDuration {
        let now = Local::now().naive_local();
        if window_contains(self.start_hour, self.end_hour, now.hour()) {
            return ChronoDuration::zero();
        }
        ChronoDuration::seconds(seconds_until_window_start(
            self.start_hour,
            self.end_hour,
            now,
        ))
    }

    /// Start the wall-clock sampling loop. Transitions between Active and
    /// Inactive publish `TimeWindowChanged` events.
    pub async fn start_monitoring(&self) -> Result<()> {
        let mut handle_guard = self.monitor_handle.lock().await;
        if handle_guard.is_some() {
            warn!("Time monitoring already started");
            return Ok(());
        }

        info!(
            "Starting time window monitoring ({}:00-{}:00)",
            self.start_hour, self.end_hour
        );

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        {
            let mut tx_guard = self.shutdown_tx.lock().await;
            *tx_guard = Some(shutdown_tx);
        }

        let state = Arc::clone(&self.state);
        let stats = Arc::clone(&self.stats);
        let events = self.events.clone();
        let (start_hour, end_hour) = (self.start_hour, self.end_hour);

        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(TIME_MONITOR_INTERVAL_SECS));

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let in_window = window_contains(start_hour, end_hour, Local::now().hour());
                        let mut current = state.write().await;

                        let next = match (*current, in_window) {
                            (ExecutionWindow::Active, false) => Some(ExecutionWindow::Inactive),
                            (ExecutionWindow::Inactive, true) => Some(ExecutionWindow::Active),
                            _ => None,
                        };

                        if let Some(new_state) = next {
                            let old_state = *current;
                            *current = new_state;
                            drop(current);

                            stats.write().await.window_transitions += 1;
                            info!("Time window changed: {:?} -> {:?}", old_state, new_state);
                            events.publish(SystemEvent::TimeWindowChanged {
                                old: old_state,
                                new: new_state,
                                timestamp: Utc::now(),
                            });
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Time window monitoring shutting down");
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
                warn!("Time monitor task join error: {}", e);
            }
        }
    }

    pub async fn pause(&self, reason: &str) {
        info!("Pausing execution window: {}", reason);
        self.transition(ExecutionWindow::Paused).await;
    }

    pub async fn resume(&self) {
        let resumed = if window_contains(self.start_hour, self.end_hour, Local::now().hour()) {
            ExecutionWindow::Active
        } else {
            ExecutionWindow::Inactive
        };
        info!("Resuming execution window: {:?}", resumed);
        self.transition(resumed).await;
    }

    pub async fn enter_maintenance(&self) {
        info!("Entering maintenance mode");
        self.transition(ExecutionWindow::Maintenance).await;
    }

    pub async fn exit_maintenance(&self) {
        info!("Exiting maintenance mode");
        self.resume().await;
    }

    /// Observer hook for completed tasks; metrics only.
    pub async fn register_task_completion(&self, has_changes: bool) {
        let mut stats = self.stats.write().await;
        stats.tasks_completed += 1;
        if has_changes {
            stats.tasks_with_changes += 1;
        }
    }

    pub async fn stats(&self) -> TimeControllerStats {
        self.stats.read().await.clone()
    }

    async fn transition(&self, new_state: ExecutionWindow) {
        let mut current = self.state.write().await;
        if *current == new_state {
            return;
        }
        let old_state = *current;
        *current = new_state;
        drop(current);

        self.stats.write().await.window_transitions += 1;
        debug!("Window state: {:?} -> {:?}", old_state, new_state);
        self.events.publish(SystemEvent::TimeWindowChanged {
            old: old_state,
            new: new_state,
            timestamp: Utc::now(),
        });
    }
}

/// Inclusive at the start hour, exclusive at the end hour; handles windows
/// that cross midnight (start=22, end=6).
pub fn window_contains(start_hour: u32, end_hour: u32, hour: u32) -> bool {
    if start_hour < end_hour {
        hour >= start_hour && hour < end_hour
    } else {
        hour >= start_hour || hour < end_hour
    }
}

/// Seconds from `now` until the window closes; 0 when outside the window.
pub fn seconds_until_window_end(start_hour: u32, end_hour: u32, now: NaiveDateTime) -> i64 {
    if !window_contains(start_hour, end_hour, now.hour()) {
        return 0;
    }

    let today_end = at_hour(now, end_hour);
    let end = if today_end > now {
        today_end
    } else {
        at_hour(now + ChronoDuration::days(1), end_hour)
    };
    (end - now).num_seconds()
}

/// Seconds from `now` until the window opens; 0 when already inside.
pub fn seconds_until_window_start(start_hour: u32, end_hour: u32, now: NaiveDateTime) -> i64 {
    if window_contains(start_hour, end_hour, now.hour()) {
        return 0;
    }

    let today_start = at_hour(now, start_hour);
    let start = if today_start > now {
        today_start
    } else {
        at_hour(now + ChronoDuration::days(1), start_hour)
    };
    (start - now).num_seconds()
}

fn at_hour(reference: NaiveDateTime, hour: u32) -> NaiveDateTime {
    reference
        .date()
        .and_hms_opt(hour, 0, 0)
        .unwrap_or(reference)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 10)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn midnight_crossing_window_boundaries() {
        // start=22, end=6: inclusive at 22:00, exclusive at 06:00
        assert!(window_contains(22, 6, 22));
        assert!(window_contains(22, 6, 23));
        assert!(window_contains(22, 6, 0));
        assert!(window_contains(22, 6, 5));
        assert!(!window_contains(22, 6, 6));
        assert!(!window_contains(22, 6, 12));
        assert!(!window_contains(22, 6, 21));
    }

    #[test]
    fn same_day_window_boundaries() {
        assert!(window_contains(1, 5, 1));
        assert!(window_contains(1, 5, 4));
        assert!(!window_contains(1, 5, 5));
        assert!(!window_contains(1, 5, 0));
    }

    #[test]
    fn remaining_window_crosses_midnight() {
        // 23:00 with window 22-6: 7 hours remain
        assert_eq!(seconds_until_window_end(22, 6, at(23, 0)), 7 * 3600);
        // 05:30: half an hour remains
        assert_eq!(seconds_until_window_end(22, 6, at(5, 30)), 1800);
        // Outside the window
        assert_eq!(seconds_until_window_end(22, 6, at(12, 0)), 0);
    }

    #[test]
    fn time_until_window_opens() {
        // 12:00 with window 22-6: 10 hours to go
        assert_eq!(seconds_until_window_start(22, 6, at(12, 0)), 10 * 3600);
        // Already inside
        assert_eq!(seconds_until_window_start(22, 6, at(23, 0)), 0);
    }

    #[tokio::test]
    async fn manual_pause_blocks_execution() {
        let config = SchedulerConfig {
            night_start_hour: 0,
            night_end_hour: 23,
        };
        let controller = TimeController::new(&config, EventBus::default());

        controller.pause("test").await;
        assert!(!controller.is_execution_allowed().await);
        assert_eq!(controller.current_state().await, ExecutionWindow::Paused);

        controller.resume().await;
        // The 0-23 window covers any test-run hour except 23:00-23:59,
        // where resume correctly lands on Inactive.
        let state = controller.current_state().await;
        assert!(matches!(
            state,
            ExecutionWindow::Active | ExecutionWindow::Inactive
        ));
    }

    #[tokio::test]
    async fn maintenance_blocks_new_tasks() {
        let config = SchedulerConfig {
            night_start_hour: 0,
            night_end_hour: 23,
        };
        let controller = TimeController::new(&config, EventBus::default());

        controller.enter_maintenance().await;
        assert!(!controller.is_execution_allowed().await);
        let (ok, reason) = controller.can_start_task(Duration::from_secs(60)).await;
        assert!(!ok);
        assert!(reason.contains("not allowed"));
    }

    #[tokio::test]
    async fn completion_hook_tracks_metrics() {
        let config = SchedulerConfig::default();
        let controller = TimeController::new(&config, EventBus::default());

        controller.register_task_completion(true).await;
        controller.register_task_completion(false).await;

        let stats = controller.stats().await;
        assert_eq!(stats.tasks_completed, 2);
        assert_eq!(stats.tasks_with_changes, 1);
    }
}
