//! Priority task queue with persistent JSON mirror
//!
//! A min-heap ordered by priority score (lower dequeues sooner), FIFO
//! within equal scores. Dependency-blocked tasks are deferred with a
//! slight demotion; failed tasks are re-queued with a promotion until
//! their retries run out, then archived as permanently failed.

use crate::config::QueueConfig;
use crate::constants::{
    AGE_BONUS_PER_HOUR, DEPENDENCY_DEMOTION, MAX_AGE_BONUS, MIN_PRIORITY_SCORE, RETRY_PROMOTION,
};
use crate::models::{Task, TaskStatus};
use crate::storage::JsonStore;
use crate::{NocturnalError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    #[default]
    Active,
    Paused,
    /// Finish running tasks, accept none
    Draining,
    Stopped,
}

/// Task plus scheduling metadata while it lives in the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub task: Task,
    /// Lower score = higher priority; never below `MIN_PRIORITY_SCORE`
    pub priority_score: f64,
    pub queued_at: DateTime<Utc>,
    pub estimated_duration_secs: u64,
    pub dependencies: Vec<String>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority_score == other.priority_score && self.queued_at == other.queued_at
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    /// Reversed so `BinaryHeap` (a max-heap) pops the lowest score first;
    /// earlier queued-at wins among equal scores.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority_score
            .total_cmp(&self.priority_score)
            .then_with(|| other.queued_at.cmp(&self.queued_at))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub tasks_queued: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub average_completion_time_secs: f64,
    pub queue_start_time: DateTime<Utc>,
}

impl Default for QueueStats {
    fn default() -> Self {
        Self {
            tasks_queued: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            average_completion_time_secs: 0.0,
            queue_start_time: Utc::now(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueState {
    status: QueueStatus,
    #[serde(skip)]
    pending: BinaryHeap<QueuedTask>,
    /// Serialized mirror of `pending`, lowest score first
    pending_mirror: Vec<QueuedTask>,
    running: HashMap<String, QueuedTask>,
    completed: Vec<QueuedTask>,
    failed: Vec<QueuedTask>,
    stats: QueueStats,
}

impl QueueState {
    fn status(&self) -> QueueStatus {
        self.status
    }

    fn sync_mirror(&mut self) {
        self.pending_mirror = self.pending.clone().into_sorted_vec();
        // into_sorted_vec yields ascending by Ord, which is descending by
        // score under the reversed comparator; flip to lowest-first.
        self.pending_mirror.reverse();
    }

    fn rebuild_heap(&mut self) {
        self.pending = self.pending_mirror.iter().cloned().collect();
    }

    fn known_ids(&self) -> HashSet<&str> {
        self.pending
            .iter()
            .map(|qt| qt.task.id.as_str())
            .chain(self.running.keys().map(String::as_str))
            .chain(self.completed.iter().map(|qt| qt.task.id.as_str()))
            .chain(self.failed.iter().map(|qt| qt.task.id.as_str()))
            .collect()
    }
}

pub struct TaskQueue {
    max_concurrent_tasks: usize,
    max_queue_size: usize,
    default_max_retries: u32,
    state: Mutex<QueueState>,
    store: JsonStore,
}

impl TaskQueue {
    pub fn new(project_path: &Path, config: &QueueConfig) -> Self {
        let queue_file = project_path.join(".nocturnal/queue/task_queue.json");
        Self {
            max_concurrent_tasks: config.max_concurrent_tasks,
            max_queue_size: config.max_queue_size,
            default_max_retries: config.max_retries,
            state: Mutex::new(QueueState::default()),
            store: JsonStore::new(queue_file),
        }
    }

    /// Restore the persisted queue mirror, if any.
    pub async fn load(&self) -> Result<()> {
        if let Some(mut loaded) = self.store.load::<QueueState>().await? {
            loaded.rebuild_heap();
            let pending = loaded.pending.len();
            *self.state.lock().await = loaded;
            info!("Loaded queue state: {} pending tasks", pending);
        }
        Ok(())
    }

    /// Add a task. Never blocks; rejects when the queue is stopped, full,
    /// or the id is already known.
    pub async fn add_task(
        &self,
        task: Task,
        priority_override: Option<f64>,
        estimated_duration_secs: Option<u64>,
        dependencies: Option<Vec<String>>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;

        if state.status() == QueueStatus::Stopped {
            warn!("Cannot add task - queue is stopped");
            return Err(NocturnalError::Validation(
                "queue is stopped".to_string(),
            ));
        }
        if state.pending.len() >= self.max_queue_size {
            warn!("Cannot add task - queue is full");
            return Err(NocturnalError::QueueFull);
        }
        if state.known_ids().contains(task.id.as_str()) {
            return Err(NocturnalError::Validation(format!(
                "duplicate task id: {}",
                task.id
            )));
        }

        let priority_score =
            priority_override.unwrap_or_else(|| calculate_priority_score(&task));
        let queued = QueuedTask {
            estimated_duration_secs: estimated_duration_secs
                .unwrap_or(task.estimated_duration_secs),
            dependencies: dependencies.unwrap_or_else(|| task.dependencies.clone()),
            task,
            priority_score,
            queued_at: Utc::now(),
            retry_count: 0,
            max_retries: self.default_max_retries,
        };

        info!(
            "Added task to queue: {} (priority: {:.2})",
            queued.task.id, queued.priority_score
        );
        state.pending.push(queued);
        state.stats.tasks_queued += 1;

        self.persist(&mut state).await;
        Ok(())
    }

    /// Pop the next executable task, deferring dependency-blocked
    /// candidates with a slight demotion. Returns None when the queue is
    /// gated, at its concurrency limit, or has no runnable task.
    pub async fn get_next_task(&self) -> Option<QueuedTask> {
        let mut state = self.state.lock().await;

        if !matches!(state.status(), QueueStatus::Active | QueueStatus::Draining) {
            return None;
        }
        if state.running.len() >= self.max_concurrent_tasks {
            return None;
        }

        let completed_ids: HashSet<String> = state
            .completed
            .iter()
            .map(|qt| qt.task.id.clone())
            .collect();
        let running_ids: HashSet<String> = state.running.keys().cloned().collect();

        let mut deferred = Vec::new();
        let mut selected = None;
        let budget = state.pending.len();

        for _ in 0..budget {
            let Some(mut candidate) = state.pending.pop() else {
                break;
            };

            let blocked = candidate
                .dependencies
                .iter()
                .any(|dep| !completed_ids.contains(dep) && !running_ids.contains(dep));

            if blocked {
                candidate.priority_score += DEPENDENCY_DEMOTION;
                deferred.push(candidate);
                continue;
            }

            selected = Some(candidate);
            break;
        }

        for task in deferred {
            state.pending.push(task);
        }

        if let Some(mut next) = selected {
            next.task.start_execution();
            state.running.insert(next.task.id.clone(), next.clone());
            info!("Starting task: {}", next.task.id);
            self.persist(&mut state).await;
            Some(next)
        } else {
            None
        }
    }

    /// Move a running task to completed or failed; failed tasks with
    /// retries left are re-queued with a promoted priority.
    pub async fn complete_task(&self, task_id: &str, success: bool) -> Result<bool> {
        let mut state = self.state.lock().await;

        let Some(mut queued) = state.running.remove(task_id) else {
            warn!("Task {} not found in running tasks", task_id);
            return Ok(false);
        };

        queued.task.complete_execution(success);

        if let (Some(started), Some(completed)) =
            (queued.task.started_at, queued.task.completed_at)
        {
            let secs = (completed - started).num_milliseconds() as f64 / 1000.0;
            update_average(&mut state.stats, secs);
        }

        if success {
            info!("Task completed successfully: {}", task_id);
            state.stats.tasks_completed += 1;
            state.completed.push(queued);
        } else if queued.retry_count < queued.max_retries {
            queued.retry_count += 1;
            queued.priority_score =
                (queued.priority_score - RETRY_PROMOTION).max(MIN_PRIORITY_SCORE);
            queued.task.status = TaskStatus::Pending;
            queued.task.started_at = None;
            queued.task.completed_at = None;
            info!(
                "Task failed, queued for retry ({}/{}): {}",
                queued.retry_count, queued.max_retries, task_id
            );
            state.pending.push(queued);
        } else {
            error!("Task failed permanently: {}", task_id);
            state.stats.tasks_failed += 1;
            state.failed.push(queued);
        }

        self.persist(&mut state).await;
        Ok(true)
    }

    pub async fn pause(&self) {
        info!("Pausing task queue");
        self.set_status(QueueStatus::Paused).await;
    }

    pub async fn resume(&self) {
        info!("Resuming task queue");
        self.set_status(QueueStatus::Active).await;
    }

    pub async fn drain(&self) {
        info!("Draining task queue");
        self.set_status(QueueStatus::Draining).await;
    }

    /// Stop the queue; running tasks move back to pending for the next
    /// startup.
    pub async fn stop(&self) {
        info!("Stopping task queue");
        let mut state = self.state.lock().await;
        state.status = QueueStatus::Stopped;

        let running: Vec<QueuedTask> = state.running.drain().map(|(_, qt)| qt).collect();
        for mut queued in running {
            queued.task.status = TaskStatus::Pending;
            queued.task.started_at = None;
            state.pending.push(queued);
        }
        self.persist(&mut state).await;
    }

    pub async fn status(&self) -> QueueStatus {
        self.state.lock().await.status()
    }

    /// Remove a pending task; running tasks cannot be removed.
    pub async fn remove_task(&self, task_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;

        if state.running.contains_key(task_id) {
            warn!("Cannot remove running task: {}", task_id);
            return Ok(false);
        }

        let before = state.pending.len();
        let retained: BinaryHeap<QueuedTask> = state
            .pending
            .drain()
            .filter(|qt| qt.task.id != task_id)
            .collect();
        state.pending = retained;
        let removed = state.pending.len() < before;

        if removed {
            info!("Removed task from queue: {}", task_id);
            self.persist(&mut state).await;
        }
        Ok(removed)
    }

    /// Zero-based dequeue position, or None when not pending.
    pub async fn task_position(&self, task_id: &str) -> Option<usize> {
        let state = self.state.lock().await;
        let mut ordered = state.pending.clone().into_sorted_vec();
        ordered.reverse();
        ordered.iter().position(|qt| qt.task.id == task_id)
    }

    /// Estimated wait in seconds based on queue position and the rolling
    /// mean completion time.
    pub async fn estimated_wait_secs(&self, task_id: &str) -> Option<f64> {
        let position = self.task_position(task_id).await?;
        let state = self.state.lock().await;
        let avg = if state.stats.average_completion_time_secs > 0.0 {
            state.stats.average_completion_time_secs
        } else {
            900.0
        };
        Some(position as f64 * avg)
    }

    /// Recompute every pending task's priority from current conditions.
    pub async fn optimize(&self) {
        let mut state = self.state.lock().await;
        let mut tasks: Vec<QueuedTask> = state.pending.drain().collect();
        for queued in &mut tasks {
            queued.priority_score = calculate_priority_score(&queued.task);
        }
        let count = tasks.len();
        state.pending.extend(tasks);
        info!("Queue optimized - {} tasks reordered", count);
        self.persist(&mut state).await;
    }

    pub async fn cleanup_archives(&self, keep_count: usize) {
        let mut state = self.state.lock().await;
        if state.completed.len() > keep_count {
            let excess = state.completed.len() - keep_count;
            state.completed.drain(..excess);
            info!("Cleaned up completed tasks, kept {}", keep_count);
        }
        if state.failed.len() > keep_count {
            let excess = state.failed.len() - keep_count;
            state.failed.drain(..excess);
        }
        self.persist(&mut state).await;
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().await;
        let mut next: Vec<QueuedTask> = state.pending.clone().into_sorted_vec();
        next.reverse();
        next.truncate(5);

        QueueSnapshot {
            status: state.status(),
            pending_tasks: state.pending.len(),
            running_tasks: state.running.len(),
            completed_tasks: state.completed.len(),
            failed_tasks: state.failed.len(),
            queue_utilization: state.running.len() as f64 / self.max_concurrent_tasks as f64,
            stats: state.stats.clone(),
            next_tasks: next,
        }
    }

    pub async fn performance_metrics(&self) -> QueuePerformance {
        let state = self.state.lock().await;
        let uptime_secs = (Utc::now() - state.stats.queue_start_time).num_seconds().max(0) as f64;
        let processed = state.stats.tasks_completed + state.stats.tasks_failed;

        QueuePerformance {
            uptime_secs,
            total_processed: processed,
            tasks_per_hour: if uptime_secs > 0.0 {
                processed as f64 / (uptime_secs / 3600.0)
            } else {
                0.0
            },
            success_rate: if processed > 0 {
                state.stats.tasks_completed as f64 / processed as f64
            } else {
                0.0
            },
            average_completion_time_secs: state.stats.average_completion_time_secs,
            max_concurrent: self.max_concurrent_tasks,
            queue_capacity: self.max_queue_size,
            queue_utilization: state.pending.len() as f64 / self.max_queue_size as f64,
        }
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    async fn set_status(&self, status: QueueStatus) {
        let mut state = self.state.lock().await;
        state.status = status;
        self.persist(&mut state).await;
    }

    async fn persist(&self, state: &mut QueueState) {
        state.sync_mirror();
        if let Err(e) = self.store.save(&*state).await {
            error!("Failed to save queue: {}", e);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub status: QueueStatus,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub queue_utilization: f64,
    pub stats: QueueStats,
    pub next_tasks: Vec<QueuedTask>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuePerformance {
    pub uptime_secs: f64,
    pub total_processed: u64,
    pub tasks_per_hour: f64,
    pub success_rate: f64,
    pub average_completion_time_secs: f64,
    pub max_concurrent: usize,
    pub queue_capacity: usize,
    pub queue_utilization: f64,
}

/// Base weight by priority, minus an age bonus (0.1/hour, capped at 1.0),
/// plus a penalty for low estimated quality. Floored at 0.1.
pub fn calculate_priority_score(task: &Task) -> f64 {
    let mut score = task.priority.weight();

    let age_hours = (Utc::now() - task.created_at).num_seconds().max(0) as f64 / 3600.0;
    score -= (age_hours * AGE_BONUS_PER_HOUR).min(MAX_AGE_BONUS);

    if task.estimated_quality > 0.0 {
        score += (1.0 - task.estimated_quality) * 0.5;
    }

    score.max(MIN_PRIORITY_SCORE)
}

fn update_average(stats: &mut QueueStats, new_secs: f64) {
    let completed = stats.tasks_completed + 1;
    if completed <= 1 {
        stats.average_completion_time_secs = new_secs;
    } else {
        let prior = stats.average_completion_time_secs;
        stats.average_completion_time_secs =
            (prior * (completed - 1) as f64 + new_secs) / completed as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskPriority;
    use tempfile::tempdir;

    fn queue_with(max_queue: usize, max_concurrent: usize) -> (tempfile::TempDir, TaskQueue) {
        let dir = tempdir().unwrap();
        let config = QueueConfig {
            max_concurrent_tasks: max_concurrent,
            max_queue_size: max_queue,
            max_retries: 3,
        };
        let queue = TaskQueue::new(dir.path(), &config);
        (dir, queue)
    }

    #[tokio::test]
    async fn dequeue_respects_priority_then_fifo() {
        let (_dir, queue) = queue_with(10, 10);

        let low = Task::new("low", TaskPriority::Low).with_id("low");
        let critical = Task::new("critical", TaskPriority::Critical).with_id("critical");
        let first = Task::new("first", TaskPriority::Medium).with_id("medium-first");
        let second = Task::new("second", TaskPriority::Medium).with_id("medium-second");

        queue.add_task(low, None, None, None).await.unwrap();
        // Pin equal scores to verify the FIFO tie-break
        queue.add_task(first, Some(3.0), None, None).await.unwrap();
        queue.add_task(second, Some(3.0), None, None).await.unwrap();
        queue.add_task(critical, None, None, None).await.unwrap();

        let order: Vec<String> = [
            queue.get_next_task().await.unwrap(),
            queue.get_next_task().await.unwrap(),
            queue.get_next_task().await.unwrap(),
            queue.get_next_task().await.unwrap(),
        ]
        .iter()
        .map(|qt| qt.task.id.clone())
        .collect();

        assert_eq!(order[0], "critical");
        assert_eq!(order[1], "medium-first");
        assert_eq!(order[2], "medium-second");
        assert_eq!(order[3], "low");
    }

    #[tokio::test]
    async fn full_queue_rejects_next_add() {
        let (_dir, queue) = queue_with(2, 1);

        for i in 0..2 {
            let task = Task::new(format!("task {i}"), TaskPriority::Medium);
            queue.add_task(task, None, None, None).await.unwrap();
        }

        let overflow = Task::new("overflow", TaskPriority::Medium);
        let result = queue.add_task(overflow, None, None, None).await;
        assert!(matches!(result, Err(NocturnalError::QueueFull)));
    }

    #[tokio::test]
    async fn duplicate_ids_rejected() {
        let (_dir, queue) = queue_with(10, 1);
        let task = Task::new("one", TaskPriority::Medium).with_id("same-id");
        queue.add_task(task.clone(), None, None, None).await.unwrap();
        assert!(queue.add_task(task, None, None, None).await.is_err());
    }

    #[tokio::test]
    async fn concurrency_limit_gates_dequeue() {
        let (_dir, queue) = queue_with(10, 1);
        queue
            .add_task(Task::new("a", TaskPriority::High), None, None, None)
            .await
            .unwrap();
        queue
            .add_task(Task::new("b", TaskPriority::High), None, None, None)
            .await
            .unwrap();

        assert!(queue.get_next_task().await.is_some());
        // One task running, limit 1: nothing more is handed out
        assert!(queue.get_next_task().await.is_none());
    }

    #[tokio::test]
    async fn dependency_blocked_task_is_deferred() {
        let (_dir, queue) = queue_with(10, 2);

        let dep = Task::new("dependency", TaskPriority::Low).with_id("dep");
        let blocked = Task::new("blocked", TaskPriority::Critical)
            .with_id("blocked")
            .with_dependencies(vec!["dep".to_string()]);

        queue.add_task(blocked, None, None, None).await.unwrap();
        queue.add_task(dep, None, None, None).await.unwrap();

        // Critical task is blocked, so the low-priority dependency runs first
        let first = queue.get_next_task().await.unwrap();
        assert_eq!(first.task.id, "dep");

        queue.complete_task("dep", true).await.unwrap();

        let second = queue.get_next_task().await.unwrap();
        assert_eq!(second.task.id, "blocked");
    }

    #[tokio::test]
    async fn failed_task_retries_with_promotion_then_archives() {
        let dir = tempdir().unwrap();
        let config = QueueConfig {
            max_concurrent_tasks: 1,
            max_queue_size: 10,
            max_retries: 1,
        };
        let queue = TaskQueue::new(dir.path(), &config);

        queue
            .add_task(
                Task::new("flaky", TaskPriority::Medium).with_id("flaky"),
                None,
                None,
                None,
            )
            .await
            .unwrap();

        let attempt1 = queue.get_next_task().await.unwrap();
        let score1 = attempt1.priority_score;
        queue.complete_task("flaky", false).await.unwrap();

        // Re-queued with promoted priority
        let attempt2 = queue.get_next_task().await.unwrap();
        assert_eq!(attempt2.retry_count, 1);
        assert!(attempt2.priority_score < score1);

        // Second failure exhausts retries: permanent failure, not dropped
        queue.complete_task("flaky", false).await.unwrap();
        assert!(queue.get_next_task().await.is_none());

        let snapshot = queue.snapshot().await;
        assert_eq!(snapshot.failed_tasks, 1);
        assert_eq!(snapshot.pending_tasks, 0);
    }

    #[tokio::test]
    async fn stop_moves_running_back_to_pending() {
        let (_dir, queue) = queue_with(10, 2);
        queue
            .add_task(Task::new("a", TaskPriority::High).with_id("a"), None, None, None)
            .await
            .unwrap();

        let running = queue.get_next_task().await.unwrap();
        assert_eq!(running.task.id, "a");
        assert_eq!(queue.running_count().await, 1);

        queue.stop().await;
        assert_eq!(queue.running_count().await, 0);
        assert_eq!(queue.pending_count().await, 1);

        // Stopped queue accepts nothing and hands out nothing
        assert!(queue
            .add_task(Task::new("b", TaskPriority::High), None, None, None)
            .await
            .is_err());
        assert!(queue.get_next_task().await.is_none());

        queue.resume().await;
        assert!(queue.get_next_task().await.is_some());
    }

    #[tokio::test]
    async fn persist_and_reload_preserves_priority_order() {
        let dir = tempdir().unwrap();
        let config = QueueConfig::default();

        {
            let queue = TaskQueue::new(dir.path(), &config);
            queue
                .add_task(
                    Task::new("low", TaskPriority::Low).with_id("low"),
                    None,
                    None,
                    None,
                )
                .await
                .unwrap();
            queue
                .add_task(
                    Task::new("crit", TaskPriority::Critical).with_id("crit"),
                    None,
                    None,
                    None,
                )
                .await
                .unwrap();
            queue
                .add_task(
                    Task::new("med", TaskPriority::Medium).with_id("med"),
                    None,
                    None,
                    None,
                )
                .await
                .unwrap();
        }

        let reloaded = TaskQueue::new(dir.path(), &config);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.pending_count().await, 3);

        let mut order = Vec::new();
        while let Some(qt) = reloaded.get_next_task().await {
            order.push(qt.task.id.clone());
            reloaded.complete_task(&order[order.len() - 1], true).await.unwrap();
        }
        assert_eq!(order, vec!["crit", "med", "low"]);
    }

    #[tokio::test]
    async fn completion_accounting_balances() {
        let (_dir, queue) = queue_with(10, 3);
        for id in ["t1", "t2", "t3"] {
            queue
                .add_task(
                    Task::new(id, TaskPriority::Medium).with_id(id),
                    None,
                    None,
                    None,
                )
                .await
                .unwrap();
        }

        let a = queue.get_next_task().await.unwrap();
        let b = queue.get_next_task().await.unwrap();
        queue.complete_task(&a.task.id, true).await.unwrap();
        queue.complete_task(&b.task.id, true).await.unwrap();

        let snapshot = queue.snapshot().await;
        let total =
            snapshot.completed_tasks + snapshot.failed_tasks + snapshot.pending_tasks;
        assert_eq!(total as u64, snapshot.stats.tasks_queued);
    }
}
