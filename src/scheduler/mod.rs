//! Night scheduler - the conductor for autonomous overnight execution
//!
//! The main loop gates on the time window and resource health, pops tasks
//! from the queue, and runs each through the full pipeline: cost
//! optimization, safety pre-check, quality-controlled execution, safety
//! post-check, cost recording, queue completion. Resource emergencies
//! trigger an emergency stop that re-queues running tasks for the next
//! startup.

pub mod resource_monitor;
pub mod task_queue;
pub mod time_controller;

use crate::agents::TaskExecutor;
use crate::constants::{GATED_SLEEP_SECS, IDLE_SLEEP_SECS};
use crate::cost::cost_optimizer::TaskContext;
use crate::cost::CostManager;
use crate::events::{EventBus, ExecutionWindow, ResourceStatus, SystemEvent};
use crate::models::{ExecutionResult, Task, TaskPriority};
use crate::parallel::{ExecutionSession, ParallelExecutor, SessionSummary};
use crate::safety::SafetyCoordinator;
use crate::{NocturnalError, Result};
use chrono::{DateTime, Utc};
use resource_monitor::ResourceMonitor;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use task_queue::{QueuedTask, TaskQueue};
use time_controller::TimeController;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub session_start: Option<DateTime<Utc>>,
    pub tasks_attempted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub safety_blocked: u64,
    pub emergency_stops: u64,
    pub total_execution_time_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub emergency_shutdown: bool,
    pub window_state: ExecutionWindow,
    pub resource_status: ResourceStatus,
    pub can_execute: bool,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub stats: SessionStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct NightReport {
    pub session_summary: SessionStats,
    pub success_rate: f64,
    pub queue: task_queue::QueuePerformance,
    pub parallel_session: Option<SessionSummary>,
    pub safety: crate::safety::SafetySessionReport,
    pub resource_usage: Option<resource_monitor::ResourceTrends>,
    pub recommendations: Vec<String>,
}

pub struct NightScheduler {
    time_controller: Arc<TimeController>,
    task_queue: Arc<TaskQueue>,
    resource_monitor: Arc<ResourceMonitor>,
    parallel_executor: Arc<ParallelExecutor>,
    cost_manager: Arc<CostManager>,
    safety_coordinator: Arc<SafetyCoordinator>,
    agent: Arc<dyn TaskExecutor>,
    events: EventBus,

    running: watch::Sender<bool>,
    emergency_shutdown: Arc<AtomicBool>,
    session: Mutex<Option<ExecutionSession>>,
    last_session_summary: Mutex<Option<SessionSummary>>,
    stats: Mutex<SessionStats>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
}

impl NightScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        time_controller: Arc<TimeController>,
        task_queue: Arc<TaskQueue>,
        resource_monitor: Arc<ResourceMonitor>,
        parallel_executor: Arc<ParallelExecutor>,
        cost_manager: Arc<CostManager>,
        safety_coordinator: Arc<SafetyCoordinator>,
        agent: Arc<dyn TaskExecutor>,
        events: EventBus,
    ) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            time_controller,
            task_queue,
            resource_monitor,
            parallel_executor,
            cost_manager,
            safety_coordinator,
            agent,
            events,
            running,
            emergency_shutdown: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(None),
            last_session_summary: Mutex::new(None),
            stats: Mutex::new(SessionStats::default()),
            loop_handle: Mutex::new(None),
            listener_handle: Mutex::new(None),
        }
    }

    /// Start monitors, the event listener, and the main execution loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if *self.running.borrow() {
            warn!("Night scheduler already running");
            return Ok(());
        }

        info!("Starting night scheduler");
        self.emergency_shutdown.store(false, Ordering::SeqCst);
        self.stats.lock().await.session_start = Some(Utc::now());

        self.safety_coordinator.load().await?;
        self.task_queue.load().await?;
        self.task_queue.resume().await;

        self.safety_coordinator.initialize_safety_session().await?;
        let session = self.parallel_executor.start_parallel_session().await?;
        *self.session.lock().await = Some(session);

        self.time_controller.start_monitoring().await?;
        self.resource_monitor.start_monitoring().await?;

        let _ = self.running.send(true);

        let listener = Arc::clone(self);
        *self.listener_handle.lock().await =
            Some(tokio::spawn(async move { listener.event_loop().await }));

        let runner = Arc::clone(self);
        *self.loop_handle.lock().await =
            Some(tokio::spawn(async move { runner.execution_loop().await }));

        info!("Night scheduler started successfully");
        Ok(())
    }

    /// Graceful stop: the current task finishes, then subsystems shut
    /// down and the session is finalized.
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping night scheduler");
        let _ = self.running.send(false);

        if let Some(handle) = self.loop_handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Execution loop join error: {}", e);
            }
        }
        if let Some(handle) = self.listener_handle.lock().await.take() {
            handle.abort();
        }

        self.time_controller.stop_monitoring().await;
        self.resource_monitor.stop_monitoring().await;

        if let Some(session) = self.session.lock().await.take() {
            match self.parallel_executor.finalize_parallel_session(&session).await {
                Ok(summary) => *self.last_session_summary.lock().await = Some(summary),
                Err(e) => error!("Session finalization failed: {}", e),
            }
        }

        self.task_queue.stop().await;
        info!("Night scheduler stopped");
        Ok(())
    }

    /// Immediate stop; running tasks move back to pending for the next
    /// startup and no partial state reaches night-main.
    pub async fn emergency_stop(&self, reason: &str) -> Result<()> {
        self.initiate_emergency_stop(reason).await;
        self.stop().await
    }

    /// Flag the emergency and halt intake without joining loop tasks;
    /// safe to call from within the event loop itself.
    async fn initiate_emergency_stop(&self, reason: &str) {
        error!("Emergency shutdown triggered: {}", reason);
        self.emergency_shutdown.store(true, Ordering::SeqCst);
        self.stats.lock().await.emergency_stops += 1;
        let _ = self.running.send(false);
        self.task_queue.stop().await;
    }

    pub async fn pause(&self) {
        info!("Pausing night scheduler");
        self.time_controller.pause("Manual pause").await;
        self.task_queue.pause().await;
    }

    pub async fn resume(&self) {
        info!("Resuming night scheduler");
        self.time_controller.resume().await;
        self.task_queue.resume().await;
    }

    pub async fn enter_maintenance(&self) {
        info!("Entering maintenance mode");
        self.time_controller.enter_maintenance().await;
        self.task_queue.drain().await;
    }

    pub async fn exit_maintenance(&self) {
        info!("Exiting maintenance mode");
        self.time_controller.exit_maintenance().await;
        self.task_queue.resume().await;
    }

    pub async fn add_task(&self, task: Task, priority_override: Option<f64>) -> Result<()> {
        self.task_queue
            .add_task(task, priority_override, None, None)
            .await
    }

    pub async fn remove_task(&self, task_id: &str) -> Result<bool> {
        self.task_queue.remove_task(task_id).await
    }

    pub fn is_emergency_shutdown(&self) -> bool {
        self.emergency_shutdown.load(Ordering::SeqCst)
    }

    pub async fn get_status(&self) -> SchedulerStatus {
        let snapshot = self.task_queue.snapshot().await;
        SchedulerStatus {
            running: *self.running.borrow(),
            emergency_shutdown: self.is_emergency_shutdown(),
            window_state: self.time_controller.current_state().await,
            resource_status: self.resource_monitor.current_status().await,
            can_execute: self.can_execute().await,
            pending_tasks: snapshot.pending_tasks,
            running_tasks: snapshot.running_tasks,
            stats: self.stats.lock().await.clone(),
        }
    }

    /// Comprehensive report for the morning review.
    pub async fn generate_night_report(&self) -> NightReport {
        let stats = self.stats.lock().await.clone();
        let success_rate = if stats.tasks_attempted > 0 {
            stats.tasks_completed as f64 / stats.tasks_attempted as f64
        } else {
            0.0
        };

        NightReport {
            recommendations: self.recommendations(&stats).await,
            session_summary: stats,
            success_rate,
            queue: self.task_queue.performance_metrics().await,
            parallel_session: self.last_session_summary.lock().await.clone(),
            safety: self.safety_coordinator.finalize_safety_session().await,
            resource_usage: self.resource_monitor.get_resource_trends(8).await,
        }
    }

    async fn recommendations(&self, stats: &SessionStats) -> Vec<String> {
        let mut recommendations = Vec::new();

        if stats.tasks_attempted > 0 {
            let success_rate = stats.tasks_completed as f64 / stats.tasks_attempted as f64;
            if success_rate < 0.5 {
                recommendations.push(
                    "Low task success rate - review task complexity and quality thresholds"
                        .to_string(),
                );
            }
        }

        if self.resource_monitor.stats().await.emergency_stops > 0 {
            recommendations.push(
                "Resource emergencies occurred - consider adjusting resource limits".to_string(),
            );
        }

        if self.task_queue.pending_count().await > 20 {
            recommendations.push(
                "Large task backlog - consider a longer execution window or smaller tasks"
                    .to_string(),
            );
        }

        recommendations
    }

    async fn execution_loop(self: Arc<Self>) {
        info!("Execution loop started");
        let mut running_rx = self.running.subscribe();

        while *self.running.borrow() && !self.is_emergency_shutdown() {
            if !self.can_execute().await {
                if Self::sleep_or_shutdown(&mut running_rx, GATED_SLEEP_SECS).await {
                    break;
                }
                continue;
            }

            let Some(queued) = self.task_queue.get_next_task().await else {
                if Self::sleep_or_shutdown(&mut running_rx, IDLE_SLEEP_SECS).await {
                    break;
                }
                continue;
            };

            let (can_run, reason) = self.can_execute_task(&queued).await;
            if !can_run {
                warn!("Cannot execute task {}: {}", queued.task.id, reason);
                if let Err(e) = self.task_queue.complete_task(&queued.task.id, false).await {
                    error!("Queue completion failed: {}", e);
                }
                continue;
            }

            if let Err(e) = self.execute_task(queued).await {
                // Any unexpected failure is a one-task failure; the loop
                // continues.
                error!("Error in task execution: {}", e);
            }
        }

        info!("Execution loop finished");
    }

    /// Full pipeline for one task.
    async fn execute_task(&self, queued: QueuedTask) -> Result<()> {
        let task = queued.task.clone();
        info!("Executing task: {}", task.id);

        self.stats.lock().await.tasks_attempted += 1;
        let execution_start = Utc::now();

        // 1. Cost optimization picks the service tier
        let context = TaskContext {
            estimated_tokens: 2000,
            operation_type: "chat_completion".to_string(),
            urgency: matches!(task.priority, TaskPriority::Critical | TaskPriority::High)
                .then(|| "high".to_string()),
            quality_requirement: (task.estimated_quality >= 0.85).then(|| "high".to_string()),
            force_free_only: false,
        };
        let plan = self.cost_manager.optimize_task_execution(&task, context).await;
        debug!(
            "Cost plan for {}: {:?} (${:.4})",
            task.id, plan.selected_service, plan.cost_estimate.estimated_cost
        );

        // 2. Safety pre-check over the planned work
        let planned_text = planned_work_text(&task);
        let pre_check = self
            .safety_coordinator
            .pre_task_safety_check(&task, &planned_text)
            .await;
        if !pre_check.safe_to_execute {
            warn!(
                "Task {} blocked by safety check: {:?}",
                task.id, pre_check.blocking_issues
            );
            self.stats.lock().await.safety_blocked += 1;
            self.task_queue.complete_task(&task.id, false).await?;
            return Ok(());
        }

        // 3. Quality-controlled execution on an isolation branch
        let session = {
            let guard = self.session.lock().await;
            guard.clone().ok_or_else(|| NocturnalError::SessionState {
                message: "no active parallel session".to_string(),
            })?
        };

        self.parallel_executor
            .execute_task_parallel(
                &session,
                task.clone(),
                Arc::clone(&self.agent),
                task.estimated_quality,
            )
            .await?;
        self.parallel_executor
            .wait_for_completion(&session, Some(&task.id), None)
            .await;

        let result = session.result(&task.id).await.unwrap_or_else(|| {
            ExecutionResult::failure(
                &task.id,
                crate::models::AgentType::LocalLlm,
                "no execution result recorded",
            )
        });

        // 4. Safety post-check
        let post_check = self
            .safety_coordinator
            .post_task_safety_check(&task, &result)
            .await;
        if post_check.rollback_recommended {
            debug!("Rollback recommended after task {}", task.id);
        }

        // 5. Cost recording
        if let Err(e) = self.cost_manager.record_task_execution(&task, &result).await {
            error!("Cost recording failed for {}: {}", task.id, e);
        }

        // 6. Queue completion and statistics
        let success = result.success;
        self.task_queue.complete_task(&task.id, success).await?;

        let execution_secs = (Utc::now() - execution_start).num_milliseconds() as f64 / 1000.0;
        {
            let mut stats = self.stats.lock().await;
            stats.total_execution_time_secs += execution_secs;
            if success {
                stats.tasks_completed += 1;
            } else {
                stats.tasks_failed += 1;
            }
        }

        self.time_controller
            .register_task_completion(result.has_changes())
            .await;
        self.events.publish(SystemEvent::TaskCompleted {
            task: task.clone(),
            success,
        });

        if success {
            info!("Task completed successfully: {}", task.id);
        } else {
            warn!("Task failed: {}", task.id);
        }
        Ok(())
    }

    async fn can_execute(&self) -> bool {
        if self.is_emergency_shutdown() {
            return false;
        }
        if !self.time_controller.is_execution_allowed().await {
            return false;
        }
        let (safe, _) = self.resource_monitor.is_safe_to_execute().await;
        safe
    }

    async fn can_execute_task(&self, queued: &QueuedTask) -> (bool, String) {
        let (fits, reason) = self
            .time_controller
            .can_start_task(Duration::from_secs(queued.estimated_duration_secs))
            .await;
        if !fits {
            return (false, reason);
        }

        let (safe, reason) = self.resource_monitor.can_safely_run_task("default").await;
        if !safe {
            return (false, reason);
        }

        (true, "Task can be executed".to_string())
    }

    /// React to subsystem events: pause on critical resources, resume on
    /// recovery, emergency-stop on resource emergency, resume the queue
    /// when the window reopens.
    async fn event_loop(self: Arc<Self>) {
        let mut receiver = self.events.subscribe();

        while let Ok(event) = receiver.recv().await {
            match event {
                SystemEvent::ResourceStatusChanged { old, new, .. } => {
                    info!("Resource status changed: {:?} -> {:?}", old, new);
                    match new {
                        ResourceStatus::Emergency => {
                            self.initiate_emergency_stop("resource emergency").await;
                        }
                        ResourceStatus::Critical => {
                            warn!("Critical resource status - pausing task queue");
                            self.task_queue.pause().await;
                        }
                        ResourceStatus::Healthy
                            if matches!(
                                old,
                                ResourceStatus::Critical | ResourceStatus::Warning
                            ) =>
                        {
                            if self.time_controller.is_execution_allowed().await {
                                info!("Resources recovered - resuming task queue");
                                self.task_queue.resume().await;
                            }
                        }
                        _ => {}
                    }
                }
                SystemEvent::TimeWindowChanged { old, new, .. } => {
                    info!("Time window changed: {:?} -> {:?}", old, new);
                    if new == ExecutionWindow::Active {
                        self.task_queue.resume().await;
                    }
                }
                _ => {}
            }
        }
    }

    /// Sleep for up to `secs`, waking early on shutdown. Returns true
    /// when the scheduler should exit.
    async fn sleep_or_shutdown(running_rx: &mut watch::Receiver<bool>, secs: u64) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(secs)) => false,
            changed = running_rx.changed() => {
                changed.is_err() || !*running_rx.borrow()
            }
        }
    }
}

fn planned_work_text(task: &Task) -> String {
    let mut text = task.description.clone();
    for requirement in &task.requirements {
        text.push('\n');
        text.push_str(requirement);
    }
    for constraint in &task.constraints {
        text.push('\n');
        text.push_str(constraint);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskPriority;

    #[test]
    fn planned_text_includes_requirements_and_constraints() {
        let mut task = Task::new("add endpoint", TaskPriority::Medium);
        task.requirements.push("validate inputs".to_string());
        task.constraints.push("no external calls".to_string());

        let text = planned_work_text(&task);
        assert!(text.contains("add endpoint"));
        assert!(text.contains("validate inputs"));
        assert!(text.contains("no external calls"));
    }
}
