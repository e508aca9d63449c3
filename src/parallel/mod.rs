//! Parallel execution of task attempts under quality control
//!
//! An `ExecutionSession` is an explicit handle threaded through every
//! call; the executor bounds concurrency with a semaphore, routes each
//! task through the quality controller, and serializes all bookkeeping in
//! the session state.

pub mod branch_manager;
pub mod quality_controller;

use crate::agents::TaskExecutor;
use crate::config::ParallelConfig;
use crate::models::{ExecutionResult, Task};
use crate::parallel::branch_manager::{BranchManager, SessionBranchSummary};
use crate::parallel::quality_controller::{
    DecisionAction, QualityController, QualityRecommendation, ReviewResults,
};
use crate::constants::SESSION_FINALIZE_TIMEOUT_SECS;
use crate::{NocturnalError, Result};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct SessionState {
    active: Vec<String>,
    completed: Vec<String>,
    failed: Vec<String>,
    results: HashMap<String, ExecutionResult>,
    total_processed: u64,
    parallel_peak: usize,
}

/// Cloneable handle to one parallel session
#[derive(Clone)]
pub struct ExecutionSession {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub night_main_branch: String,
    state: Arc<Mutex<SessionState>>,
    handles: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    slots: Arc<Semaphore>,
    max_parallel_limit: usize,
}

impl ExecutionSession {
    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    pub async fn completed_count(&self) -> usize {
        self.state.lock().await.completed.len()
    }

    pub async fn failed_count(&self) -> usize {
        self.state.lock().await.failed.len()
    }

    pub async fn total_processed(&self) -> u64 {
        self.state.lock().await.total_processed
    }

    pub async fn parallel_peak(&self) -> usize {
        self.state.lock().await.parallel_peak
    }

    /// Execution result for a finished task, when one was produced.
    pub async fn result(&self, task_id: &str) -> Option<ExecutionResult> {
        self.state.lock().await.results.get(task_id).cloned()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionStatus {
    pub status: String,
    pub completed_count: usize,
    pub failed_count: usize,
    pub pending_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub duration_secs: i64,
    pub total_tasks_processed: u64,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub success_rate: f64,
    pub parallel_peak: usize,
    pub branch_management: SessionBranchSummary,
    pub quality_review: ReviewResults,
    pub recommendations: Vec<QualityRecommendation>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutorStats {
    pub sessions_started: u64,
    pub total_tasks_executed: u64,
    pub parallel_executions_peak: usize,
    pub success_rate: f64,
}

pub struct ParallelExecutor {
    branch_manager: Arc<BranchManager>,
    quality_controller: Arc<QualityController>,
    max_parallel_executions: usize,
    execution_timeout: Duration,
    stats: Mutex<ExecutorStats>,
}

impl ParallelExecutor {
    pub fn new(
        branch_manager: Arc<BranchManager>,
        quality_controller: Arc<QualityController>,
        config: &ParallelConfig,
    ) -> Self {
        Self {
            branch_manager,
            quality_controller,
            max_parallel_executions: config.max_parallel_executions,
            execution_timeout: Duration::from_secs(config.execution_timeout_secs),
            stats: Mutex::new(ExecutorStats::default()),
        }
    }

    /// Initialize the night-main branch and open a new session.
    pub async fn start_parallel_session(&self) -> Result<ExecutionSession> {
        info!("Starting parallel execution session");

        let night_main_branch = self.branch_manager.initialize_night_session().await?;
        let session_id = format!("parallel-{}", Local::now().format("%Y%m%d_%H%M%S"));

        self.stats.lock().await.sessions_started += 1;

        info!("Parallel session started: {}", session_id);
        Ok(ExecutionSession {
            session_id,
            started_at: Utc::now(),
            night_main_branch,
            state: Arc::new(Mutex::new(SessionState::default())),
            handles: Arc::new(Mutex::new(HashMap::new())),
            slots: Arc::new(Semaphore::new(self.max_parallel_executions)),
            max_parallel_limit: self.max_parallel_executions,
        })
    }

    /// Submit one task for concurrent execution. Awaits a free slot when
    /// the session is full; rejected tasks are recorded as failed without
    /// invoking the executor.
    pub async fn execute_task_parallel(
        &self,
        session: &ExecutionSession,
        task: Task,
        executor: Arc<dyn TaskExecutor>,
        estimated_quality: f64,
    ) -> Result<String> {
        debug!("Queueing parallel task: {}", task.id);

        let permit = Arc::clone(&session.slots)
            .acquire_owned()
            .await
            .map_err(|_| NocturnalError::SessionState {
                message: "session slots closed".to_string(),
            })?;

        let decision = self
            .quality_controller
            .evaluate_task_quality(&task, estimated_quality)
            .await;

        if decision.action == DecisionAction::Reject {
            warn!("Task rejected by quality evaluation: {}", task.id);
            let mut state = session.state.lock().await;
            state.results.insert(
                task.id.clone(),
                ExecutionResult::failure(
                    &task.id,
                    crate::models::AgentType::LocalLlm,
                    "rejected by quality evaluation",
                ),
            );
            state.failed.push(task.id.clone());
            state.total_processed += 1;
            return Ok(task.id);
        }

        let task_id = task.id.clone();
        {
            let mut state = session.state.lock().await;
            state.active.push(task_id.clone());
            state.total_processed += 1;
            state.parallel_peak = state.parallel_peak.max(state.active.len());
        }
        {
            let mut stats = self.stats.lock().await;
            stats.total_tasks_executed += 1;
            let active_now = session.state.lock().await.active.len();
            stats.parallel_executions_peak = stats.parallel_executions_peak.max(active_now);
        }

        let controller = Arc::clone(&self.quality_controller);
        let timeout = self.execution_timeout;
        let session_state = Arc::clone(&session.state);
        let spawn_task_id = task_id.clone();

        let handle = tokio::spawn(async move {
            let outcome = controller
                .execute_with_quality_control(&task, &decision, executor, timeout)
                .await;

            let result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    error!("Quality-controlled execution error ({}): {}", task.id, e);
                    crate::models::ExecutionResult::failure(
                        &task.id,
                        crate::models::AgentType::LocalLlm,
                        e.to_string(),
                    )
                }
            };
            let success = result.success;

            let mut state = session_state.lock().await;
            state.active.retain(|id| id != &spawn_task_id);
            state.results.insert(spawn_task_id.clone(), result);
            if success {
                state.completed.push(spawn_task_id.clone());
            } else {
                state.failed.push(spawn_task_id.clone());
            }
            debug!(
                "Parallel task finished: {} ({})",
                spawn_task_id,
                if success { "success" } else { "failure" }
            );
            drop(permit);
        });

        session.handles.lock().await.insert(task_id.clone(), handle);

        debug!(
            "Parallel execution started: {} ({}/{})",
            task_id,
            session.active_count().await,
            session.max_parallel_limit
        );
        Ok(task_id)
    }

    /// Await one task (by id) or every active task. On timeout the counts
    /// reflect whatever finished in time.
    pub async fn wait_for_completion(
        &self,
        session: &ExecutionSession,
        task_id: Option<&str>,
        timeout: Option<Duration>,
    ) -> CompletionStatus {
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut guard = session.handles.lock().await;
            match task_id {
                Some(id) => guard
                    .remove(id)
                    .map(|handle| vec![(id.to_string(), handle)])
                    .unwrap_or_default(),
                None => guard.drain().collect(),
            }
        };

        let wait_all = async {
            for (id, handle) in handles {
                if let Err(e) = handle.await {
                    error!("Task join error ({}): {}", id, e);
                }
            }
        };

        let timed_out = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait_all).await.is_err(),
            None => {
                wait_all.await;
                false
            }
        };

        let state = session.state.lock().await;
        CompletionStatus {
            status: if timed_out {
                "timeout".to_string()
            } else if task_id.is_some() {
                "completed".to_string()
            } else {
                "all_completed".to_string()
            },
            completed_count: state.completed.len(),
            failed_count: state.failed.len(),
            pending_count: state.active.len(),
        }
    }

    /// Drain residual tasks (bounded), run branch and review finalization,
    /// and produce the session summary.
    pub async fn finalize_parallel_session(
        &self,
        session: &ExecutionSession,
    ) -> Result<SessionSummary> {
        info!("Finalizing parallel session: {}", session.session_id);

        if session.active_count().await > 0 {
            info!(
                "Waiting for {} residual tasks",
                session.active_count().await
            );
            let completion = self
                .wait_for_completion(
                    session,
                    None,
                    Some(Duration::from_secs(SESSION_FINALIZE_TIMEOUT_SECS)),
                )
                .await;
            if completion.status == "timeout" {
                warn!("Some tasks did not finish before session finalization");
            }
        }

        let quality_review = self.quality_controller.review_pending_branches().await;
        let branch_management = self.branch_manager.finalize_night_session().await;
        let recommendations = self.quality_controller.get_quality_recommendations().await;

        let state = session.state.lock().await;
        let total = state.total_processed.max(1);
        let summary = SessionSummary {
            session_id: session.session_id.clone(),
            duration_secs: (Utc::now() - session.started_at).num_seconds(),
            total_tasks_processed: state.total_processed,
            completed_tasks: state.completed.len(),
            failed_tasks: state.failed.len(),
            success_rate: state.completed.len() as f64 / total as f64,
            parallel_peak: state.parallel_peak,
            branch_management,
            quality_review,
            recommendations,
        };
        drop(state);

        {
            let mut stats = self.stats.lock().await;
            let sessions = stats.sessions_started.max(1);
            stats.success_rate = if sessions > 1 {
                (stats.success_rate * (sessions - 1) as f64 + summary.success_rate)
                    / sessions as f64
            } else {
                summary.success_rate
            };
        }

        info!(
            "Parallel session finalized: success rate {:.0}%",
            summary.success_rate * 100.0
        );
        Ok(summary)
    }

    pub async fn stats(&self) -> ExecutorStats {
        self.stats.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BranchConfig, QualityConfig};
    use crate::models::{AgentType, ExecutionResult, QualityScore, TaskPriority};
    use crate::vcs::tests::init_repo;

    fn executor_stack(
        git: crate::vcs::GitClient,
        max_parallel: usize,
    ) -> (Arc<BranchManager>, ParallelExecutor) {
        let branches = Arc::new(BranchManager::new(
            git,
            &BranchConfig::default(),
            &QualityConfig::default(),
        ));
        let controller = Arc::new(QualityController::new(
            Arc::clone(&branches),
            &QualityConfig::default(),
            max_parallel,
        ));
        let config = ParallelConfig {
            max_parallel_executions: max_parallel,
            execution_timeout_secs: 30,
        };
        let executor = ParallelExecutor::new(Arc::clone(&branches), controller, &config);
        (branches, executor)
    }

    fn quick_executor(quality: f64) -> Arc<dyn TaskExecutor> {
        Arc::new(move |task: Task| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(ExecutionResult {
                task_id: task.id,
                success: true,
                quality_score: QualityScore {
                    overall: quality,
                    ..QualityScore::from_components(quality, quality, quality, quality, quality)
                },
                generated_code: String::new(),
                files_modified: Vec::new(),
                files_created: Vec::new(),
                errors: Vec::new(),
                execution_time_secs: 0.02,
                agent_used: AgentType::LocalLlm,
                cost_incurred: 0.0,
                metadata: Default::default(),
            })
        })
    }

    #[tokio::test]
    async fn session_runs_tasks_and_reports_summary() {
        let (_dir, git) = init_repo();
        let (_branches, executor) = executor_stack(git, 3);

        let session = executor.start_parallel_session().await.unwrap();
        assert!(session.night_main_branch.contains("night-"));

        for i in 0..3 {
            let task = Task::new(format!("task {i}"), TaskPriority::Medium)
                .with_id(format!("t{i}"));
            executor
                .execute_task_parallel(&session, task, quick_executor(0.8), 0.8)
                .await
                .unwrap();
        }

        let completion = executor.wait_for_completion(&session, None, None).await;
        assert_eq!(completion.status, "all_completed");
        assert_eq!(completion.completed_count, 3);
        assert_eq!(completion.failed_count, 0);

        let summary = executor.finalize_parallel_session(&session).await.unwrap();
        assert_eq!(summary.total_tasks_processed, 3);
        assert!((summary.success_rate - 1.0).abs() < f64::EPSILON);
        assert!(summary.parallel_peak >= 1);
    }

    #[tokio::test]
    async fn rejected_task_never_invokes_executor() {
        let (_dir, git) = init_repo();
        let (_branches, executor) = executor_stack(git, 2);
        let session = executor.start_parallel_session().await.unwrap();

        let invoked = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let invoked_clone = Arc::clone(&invoked);
        let probe: Arc<dyn TaskExecutor> = Arc::new(move |task: Task| {
            let invoked = Arc::clone(&invoked_clone);
            async move {
                invoked.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(ExecutionResult::failure(task.id, AgentType::LocalLlm, "never"))
            }
        });

        // Estimated quality 0.0 classifies as Failed -> reject
        let task = Task::new("doomed", TaskPriority::Low).with_id("doomed");
        executor
            .execute_task_parallel(&session, task, probe, 0.0)
            .await
            .unwrap();

        assert_eq!(session.failed_count().await, 1);
        assert_eq!(session.active_count().await, 0);
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn slot_limit_bounds_concurrency() {
        let (_dir, git) = init_repo();
        let (_branches, executor) = executor_stack(git, 1);
        let session = executor.start_parallel_session().await.unwrap();

        let t0 = Task::new("first", TaskPriority::Medium).with_id("first");
        let t1 = Task::new("second", TaskPriority::Medium).with_id("second");

        executor
            .execute_task_parallel(&session, t0, quick_executor(0.75), 0.75)
            .await
            .unwrap();
        // Second submit must wait for the first slot to free, then run
        executor
            .execute_task_parallel(&session, t1, quick_executor(0.75), 0.75)
            .await
            .unwrap();

        executor.wait_for_completion(&session, None, None).await;
        assert_eq!(session.completed_count().await, 2);
        assert_eq!(session.parallel_peak().await, 1);
    }

    #[tokio::test]
    async fn wait_for_specific_task() {
        let (_dir, git) = init_repo();
        let (_branches, executor) = executor_stack(git, 2);
        let session = executor.start_parallel_session().await.unwrap();

        let task = Task::new("only", TaskPriority::Medium).with_id("only");
        executor
            .execute_task_parallel(&session, task, quick_executor(0.8), 0.8)
            .await
            .unwrap();

        let completion = executor
            .wait_for_completion(&session, Some("only"), Some(Duration::from_secs(10)))
            .await;
        assert_eq!(completion.status, "completed");
        assert_eq!(completion.completed_count, 1);
    }
}
