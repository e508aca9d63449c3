//! Quality-tier routing and post-execution control
//!
//! Classifies each task by estimated or measured quality, decides where
//! its changes land (night-main, a parallel branch, or an experimental
//! branch), runs the executor under the per-task timeout, and applies the
//! post action: auto-merge, queue for review, or leave for manual review.

use crate::agents::TaskExecutor;
use crate::config::QualityConfig;
use crate::models::{AgentType, ExecutionResult, Task};
use crate::parallel::branch_manager::{BranchManager, BranchType};
use crate::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    High,
    Medium,
    Low,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    ImmediateApply,
    ParallelBranch,
    ExperimentalBranch,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PostAction {
    AutoMergeIfSuccessful,
    QueueForReview,
    ManualReviewRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStrategy {
    /// Discard the branch entirely; experimental changes must not taint
    /// the tree
    BranchDeletion,
    RevertCommit,
}

/// Routing decision produced once per task before execution
#[derive(Debug, Clone, Serialize)]
pub struct QualityDecision {
    pub quality_tier: QualityTier,
    pub action: DecisionAction,
    pub branch_name: Option<String>,
    pub requires_review: bool,
    pub auto_merge_eligible: bool,
    pub reasoning: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub task_id: String,
    pub target_branch: String,
    pub expected_quality: f64,
    pub post_execution_action: PostAction,
    pub rollback_strategy: RollbackStrategy,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerStats {
    pub tasks_processed: u64,
    pub high_quality_auto_applied: u64,
    pub medium_quality_parallel: u64,
    pub low_quality_experimental: u64,
    pub failed_tasks: u64,
    pub reviews_completed: u64,
    pub auto_merges_performed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewResults {
    pub branches_reviewed: usize,
    pub approved_for_merge: Vec<String>,
    pub requires_manual_review: Vec<String>,
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityRecommendation {
    pub kind: String,
    pub priority: String,
    pub title: String,
    pub description: String,
}

struct ControllerState {
    pending_reviews: Vec<String>,
    quality_history: Vec<f64>,
    stats: ControllerStats,
}

pub struct QualityController {
    branch_manager: Arc<BranchManager>,
    high_quality_threshold: f64,
    medium_quality_threshold: f64,
    auto_apply_threshold: f64,
    max_parallel_executions: usize,
    state: Mutex<ControllerState>,
}

impl QualityController {
    pub fn new(
        branch_manager: Arc<BranchManager>,
        quality: &QualityConfig,
        max_parallel_executions: usize,
    ) -> Self {
        Self {
            branch_manager,
            high_quality_threshold: quality.high_quality_threshold,
            medium_quality_threshold: quality.medium_quality_threshold,
            auto_apply_threshold: quality.auto_apply_threshold,
            max_parallel_executions,
            state: Mutex::new(ControllerState {
                pending_reviews: Vec::new(),
                quality_history: Vec::new(),
                stats: ControllerStats::default(),
            }),
        }
    }

    /// Decide how a task's changes will be routed, from its estimated
    /// quality.
    pub async fn evaluate_task_quality(
        &self,
        task: &Task,
        estimated_quality: f64,
    ) -> QualityDecision {
        debug!("Evaluating task quality: {}", task.id);

        let tier = self.classify_tier(estimated_quality);
        let confidence = estimated_quality.clamp(0.0, 1.0);

        let decision = match tier {
            QualityTier::High => {
                if estimated_quality >= self.auto_apply_threshold {
                    QualityDecision {
                        quality_tier: tier,
                        action: DecisionAction::ImmediateApply,
                        branch_name: self.branch_manager.night_main_branch().await,
                        requires_review: false,
                        auto_merge_eligible: true,
                        reasoning: format!(
                            "High quality ({estimated_quality:.2}): applying to night-main"
                        ),
                        confidence,
                    }
                } else {
                    QualityDecision {
                        quality_tier: tier,
                        action: DecisionAction::ParallelBranch,
                        branch_name: None,
                        requires_review: false,
                        auto_merge_eligible: true,
                        reasoning: format!(
                            "High quality ({estimated_quality:.2}): parallel branch with auto-merge"
                        ),
                        confidence,
                    }
                }
            }
            QualityTier::Medium => QualityDecision {
                quality_tier: tier,
                action: DecisionAction::ParallelBranch,
                branch_name: None,
                requires_review: true,
                auto_merge_eligible: false,
                reasoning: format!(
                    "Medium quality ({estimated_quality:.2}): parallel verification"
                ),
                confidence,
            },
            QualityTier::Low => QualityDecision {
                quality_tier: tier,
                action: DecisionAction::ExperimentalBranch,
                branch_name: None,
                requires_review: true,
                auto_merge_eligible: false,
                reasoning: format!(
                    "Low quality ({estimated_quality:.2}): isolated on experimental branch"
                ),
                confidence,
            },
            QualityTier::Failed => QualityDecision {
                quality_tier: tier,
                action: DecisionAction::Reject,
                branch_name: None,
                requires_review: true,
                auto_merge_eligible: false,
                reasoning: "Execution expected to fail: rejected".to_string(),
                confidence: 0.0,
            },
        };

        debug!("Quality decision for {}: {:?}", task.id, decision.action);
        decision
    }

    /// Run one task under quality control: prepare the target branch, run
    /// the executor within `timeout`, commit its changes, then apply the
    /// decision's post action. Executor errors and timeouts become a
    /// synthetic failed result and trigger the plan's rollback strategy.
    pub async fn execute_with_quality_control(
        &self,
        task: &Task,
        decision: &QualityDecision,
        executor: Arc<dyn TaskExecutor>,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        info!(
            "Quality-controlled execution: {} ({:?})",
            task.id, decision.action
        );

        // The working tree is shared; hold the lock across branch
        // creation, checkout, execution, commit, and merge.
        let _tree_guard = self.branch_manager.lock_working_tree().await;

        let plan = self.create_execution_plan(task, decision).await?;
        self.branch_manager
            .switch_to_branch(&plan.target_branch)
            .await?;

        let result = match tokio::time::timeout(timeout, executor.execute(task.clone())).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!("Executor failed for {}: {}", task.id, e);
                let result = ExecutionResult::failure(&task.id, AgentType::LocalLlm, e.to_string());
                self.apply_rollback_strategy(&plan).await;
                self.record_outcome(decision.quality_tier, false, 0.0).await;
                return Ok(result);
            }
            Err(_) => {
                warn!("Task execution timed out: {}", task.id);
                let result =
                    ExecutionResult::failure(&task.id, AgentType::LocalLlm, "execution timeout");
                self.apply_rollback_strategy(&plan).await;
                self.record_outcome(decision.quality_tier, false, 0.0).await;
                return Ok(result);
            }
        };

        let overall = result.quality_score.overall;

        if result.success && result.has_changes() {
            let mut files: Vec<String> = result.files_modified.clone();
            files.extend(result.files_created.iter().cloned());
            if let Err(e) = self
                .branch_manager
                .commit_task_result(
                    &task.id,
                    &format!("Night task: {:.60}", task.description),
                    &files,
                )
                .await
            {
                warn!("Commit of task result failed ({}): {}", task.id, e);
            }
        }

        if result.success {
            self.handle_post_execution(&plan, overall).await;
        } else {
            debug!("Task execution reported failure: {}", task.id);
        }

        self.record_outcome(decision.quality_tier, result.success, overall)
            .await;
        Ok(result)
    }

    /// Review every branch in the pending list with the simplified
    /// reviewer: approve when at least one task is associated, reject when
    /// empty; experimental branches always need a human.
    pub async fn review_pending_branches(&self) -> ReviewResults {
        info!("Reviewing pending branches");

        let pending: Vec<String> = {
            let state = self.state.lock().await;
            state.pending_reviews.clone()
        };

        let mut results = ReviewResults {
            branches_reviewed: 0,
            approved_for_merge: Vec::new(),
            requires_manual_review: Vec::new(),
            rejected: Vec::new(),
        };

        for branch_name in &pending {
            let Some(info) = self.branch_manager.branch_info(branch_name).await else {
                results.rejected.push(branch_name.clone());
                continue;
            };

            results.branches_reviewed += 1;

            if info.associated_tasks.is_empty() {
                results.rejected.push(branch_name.clone());
                continue;
            }

            match info.branch_type {
                BranchType::HighQuality => {
                    results.approved_for_merge.push(branch_name.clone());
                    if let Some(night_main) = self.branch_manager.night_main_branch().await {
                        match self
                            .branch_manager
                            .attempt_auto_merge(branch_name, &night_main, self.high_quality_threshold)
                            .await
                        {
                            Ok(outcome) if outcome.success => {
                                self.state.lock().await.stats.auto_merges_performed += 1;
                            }
                            Ok(_) => debug!("Review merge declined for {}", branch_name),
                            Err(e) => warn!("Review merge failed ({}): {}", branch_name, e),
                        }
                    }
                }
                BranchType::MediumQuality => {
                    results.approved_for_merge.push(branch_name.clone());
                }
                _ => {
                    results.requires_manual_review.push(branch_name.clone());
                }
            }
        }

        let mut state = self.state.lock().await;
        state.stats.reviews_completed += results.branches_reviewed as u64;
        state.pending_reviews.retain(|branch| {
            !results.approved_for_merge.contains(branch) && !results.rejected.contains(branch)
        });

        info!("Review complete: {} branches processed", results.branches_reviewed);
        results
    }

    /// Advisories derived from recent history and branch pressure.
    pub async fn get_quality_recommendations(&self) -> Vec<QualityRecommendation> {
        let mut recommendations = Vec::new();
        let state = self.state.lock().await;

        if state.quality_history.len() >= 5 {
            let recent: Vec<f64> = state
                .quality_history
                .iter()
                .rev()
                .take(10)
                .cloned()
                .collect();
            let avg = recent.iter().sum::<f64>() / recent.len() as f64;
            if avg < self.medium_quality_threshold {
                recommendations.push(QualityRecommendation {
                    kind: "quality_improvement".to_string(),
                    priority: "high".to_string(),
                    title: "Quality scores need improvement".to_string(),
                    description: format!("Recent average quality: {avg:.2}"),
                });
            }
        }

        let total = state.stats.tasks_processed;
        if total > 0 {
            let high_rate = state.stats.high_quality_auto_applied as f64 / total as f64;
            if high_rate < 0.3 {
                recommendations.push(QualityRecommendation {
                    kind: "execution_strategy".to_string(),
                    priority: "medium".to_string(),
                    title: "High-quality task ratio is low".to_string(),
                    description: format!("Auto-apply rate: {:.0}%", high_rate * 100.0),
                });
            }
        }
        drop(state);

        let active = self.branch_manager.active_branch_count().await;
        if active as f64 > self.max_parallel_executions as f64 * 1.5 {
            recommendations.push(QualityRecommendation {
                kind: "branch_management".to_string(),
                priority: "medium".to_string(),
                title: "Too many active branches".to_string(),
                description: format!("Currently {active} active branches"),
            });
        }

        recommendations
    }

    pub async fn pending_reviews(&self) -> Vec<String> {
        self.state.lock().await.pending_reviews.clone()
    }

    pub async fn stats(&self) -> ControllerStats {
        self.state.lock().await.stats.clone()
    }

    pub async fn recent_quality_average(&self) -> Option<f64> {
        let state = self.state.lock().await;
        if state.quality_history.is_empty() {
            return None;
        }
        let recent: Vec<f64> = state
            .quality_history
            .iter()
            .rev()
            .take(10)
            .cloned()
            .collect();
        Some(recent.iter().sum::<f64>() / recent.len() as f64)
    }

    fn classify_tier(&self, quality: f64) -> QualityTier {
        if quality >= self.high_quality_threshold {
            QualityTier::High
        } else if quality >= self.medium_quality_threshold {
            QualityTier::Medium
        } else if quality > 0.0 {
            QualityTier::Low
        } else {
            QualityTier::Failed
        }
    }

    async fn create_execution_plan(
        &self,
        task: &Task,
        decision: &QualityDecision,
    ) -> Result<ExecutionPlan> {
        let target_branch = if decision.action == DecisionAction::ImmediateApply {
            self.branch_manager.night_main_branch().await.ok_or_else(|| {
                crate::NocturnalError::SessionState {
                    message: "night session not initialized".to_string(),
                }
            })?
        } else {
            self.branch_manager
                .create_quality_branch(decision.confidence, &task.id, &task.description)
                .await?
        };

        let post_execution_action = match decision.quality_tier {
            QualityTier::High => PostAction::AutoMergeIfSuccessful,
            QualityTier::Medium => PostAction::QueueForReview,
            _ => PostAction::ManualReviewRequired,
        };

        let rollback_strategy = if decision.quality_tier == QualityTier::Low {
            RollbackStrategy::BranchDeletion
        } else {
            RollbackStrategy::RevertCommit
        };

        Ok(ExecutionPlan {
            task_id: task.id.clone(),
            target_branch,
            expected_quality: decision.confidence,
            post_execution_action,
            rollback_strategy,
        })
    }

    async fn handle_post_execution(&self, plan: &ExecutionPlan, overall: f64) {
        match plan.post_execution_action {
            PostAction::AutoMergeIfSuccessful => {
                let Some(night_main) = self.branch_manager.night_main_branch().await else {
                    return;
                };
                if overall >= self.high_quality_threshold {
                    if plan.target_branch == night_main {
                        // Immediate-apply work is already on night-main
                        return;
                    }
                    match self
                        .branch_manager
                        .attempt_auto_merge(&plan.target_branch, &night_main, overall)
                        .await
                    {
                        Ok(outcome) if outcome.success => {
                            self.state.lock().await.stats.auto_merges_performed += 1;
                        }
                        _ => {
                            // Merge declined or failed: leave it for review
                            self.queue_for_review(&plan.target_branch).await;
                        }
                    }
                } else {
                    self.queue_for_review(&plan.target_branch).await;
                }
            }
            PostAction::QueueForReview | PostAction::ManualReviewRequired => {
                self.queue_for_review(&plan.target_branch).await;
            }
        }
    }

    async fn queue_for_review(&self, branch_name: &str) {
        let mut state = self.state.lock().await;
        if !state.pending_reviews.iter().any(|b| b == branch_name) {
            state.pending_reviews.push(branch_name.to_string());
            debug!("Queued for review: {}", branch_name);
        }
    }

    async fn apply_rollback_strategy(&self, plan: &ExecutionPlan) {
        match plan.rollback_strategy {
            RollbackStrategy::BranchDeletion => {
                if let Err(e) = self.branch_manager.discard_branch(&plan.target_branch).await {
                    error!("Branch deletion failed ({}): {}", plan.target_branch, e);
                }
            }
            RollbackStrategy::RevertCommit => {
                // Nothing was merged; abandoning the branch is the revert
                self.branch_manager.mark_abandoned(&plan.target_branch).await;
            }
        }
    }

    async fn record_outcome(&self, tier: QualityTier, success: bool, overall: f64) {
        let mut state = self.state.lock().await;
        state.stats.tasks_processed += 1;

        if success {
            state.quality_history.push(overall);
            let excess = state.quality_history.len().saturating_sub(100);
            if excess > 0 {
                state.quality_history.drain(..excess);
            }
            match tier {
                QualityTier::High => state.stats.high_quality_auto_applied += 1,
                QualityTier::Medium => state.stats.medium_quality_parallel += 1,
                QualityTier::Low => state.stats.low_quality_experimental += 1,
                QualityTier::Failed => {}
            }
        } else {
            state.stats.failed_tasks += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BranchConfig;
    use crate::models::{QualityScore, TaskPriority};
    use crate::vcs::tests::init_repo;

    fn controller(git: crate::vcs::GitClient) -> (Arc<BranchManager>, QualityController) {
        let branches = Arc::new(BranchManager::new(
            git,
            &BranchConfig::default(),
            &QualityConfig::default(),
        ));
        let controller = QualityController::new(Arc::clone(&branches), &QualityConfig::default(), 3);
        (branches, controller)
    }

    fn echo_executor(quality: f64, file: &'static str) -> Arc<dyn TaskExecutor> {
        Arc::new(move |task: Task| async move {
            let score = QualityScore::from_components(quality, quality, quality, quality, quality);
            Ok(ExecutionResult {
                task_id: task.id.clone(),
                success: true,
                quality_score: QualityScore {
                    overall: quality,
                    ..score
                },
                generated_code: String::new(),
                files_modified: Vec::new(),
                files_created: vec![file.to_string()],
                errors: Vec::new(),
                execution_time_secs: 0.1,
                agent_used: AgentType::LocalLlm,
                cost_incurred: 0.0,
                metadata: Default::default(),
            })
        })
    }

    #[tokio::test]
    async fn tier_classification_matches_thresholds() {
        let (_dir, git) = init_repo();
        let (_branches, controller) = controller(git);
        let task = Task::new("t", TaskPriority::Medium);

        let d = controller.evaluate_task_quality(&task, 0.92).await;
        assert_eq!(d.quality_tier, QualityTier::High);
        assert_eq!(d.action, DecisionAction::ImmediateApply);
        assert!(d.auto_merge_eligible);
        assert!(!d.requires_review);

        let d = controller.evaluate_task_quality(&task, 0.86).await;
        assert_eq!(d.quality_tier, QualityTier::High);
        assert_eq!(d.action, DecisionAction::ParallelBranch);

        let d = controller.evaluate_task_quality(&task, 0.72).await;
        assert_eq!(d.quality_tier, QualityTier::Medium);
        assert_eq!(d.action, DecisionAction::ParallelBranch);
        assert!(d.requires_review);
        assert!(!d.auto_merge_eligible);

        let d = controller.evaluate_task_quality(&task, 0.3).await;
        assert_eq!(d.quality_tier, QualityTier::Low);
        assert_eq!(d.action, DecisionAction::ExperimentalBranch);
        assert!(d.requires_review);

        let d = controller.evaluate_task_quality(&task, 0.0).await;
        assert_eq!(d.quality_tier, QualityTier::Failed);
        assert_eq!(d.action, DecisionAction::Reject);
    }

    #[tokio::test]
    async fn high_quality_execution_auto_merges_to_night_main() {
        let (dir, git) = init_repo();
        let (branches, controller) = controller(git.clone());
        let night_main = branches.initialize_night_session().await.unwrap();

        let task = Task::new("implement feature", TaskPriority::High).with_id("T1");
        let decision = controller.evaluate_task_quality(&task, 0.92).await;

        // Executor writes a file on the prepared branch
        let project = dir.path().to_path_buf();
        let executor: Arc<dyn TaskExecutor> = Arc::new(move |task: Task| {
            let project = project.clone();
            async move {
                std::fs::write(project.join("generated.rs"), "pub fn generated() {}\n")?;
                Ok(ExecutionResult {
                    task_id: task.id,
                    success: true,
                    quality_score: QualityScore {
                        overall: 0.92,
                        ..QualityScore::from_components(0.9, 0.95, 0.9, 0.9, 0.9)
                    },
                    generated_code: "pub fn generated() {}".to_string(),
                    files_modified: Vec::new(),
                    files_created: vec!["generated.rs".to_string()],
                    errors: Vec::new(),
                    execution_time_secs: 0.1,
                    agent_used: AgentType::LocalLlm,
                    cost_incurred: 0.0,
                    metadata: Default::default(),
                })
            }
        });

        let result = controller
            .execute_with_quality_control(&task, &decision, executor, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(result.success);

        // Immediate-apply commits directly on night-main
        git.checkout(&night_main).unwrap();
        assert!(dir.path().join("generated.rs").exists());

        let stats = controller.stats().await;
        assert_eq!(stats.tasks_processed, 1);
        assert_eq!(stats.high_quality_auto_applied, 1);
        assert_eq!(stats.failed_tasks, 0);
    }

    #[tokio::test]
    async fn medium_quality_branch_queues_for_review() {
        let (_dir, git) = init_repo();
        let (branches, controller) = controller(git);
        let night_main = branches.initialize_night_session().await.unwrap();

        let task = Task::new("tweak", TaskPriority::Medium).with_id("T2");
        let decision = controller.evaluate_task_quality(&task, 0.72).await;

        let result = controller
            .execute_with_quality_control(
                &task,
                &decision,
                echo_executor(0.72, "medium.rs"),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert!(result.success);

        let pending = controller.pending_reviews().await;
        assert_eq!(pending.len(), 1);
        assert!(pending[0].contains("medium_quality-T2"));
        assert_ne!(pending[0], night_main);
    }

    #[tokio::test]
    async fn executor_timeout_produces_synthetic_failure_and_rolls_back() {
        let (_dir, git) = init_repo();
        let (branches, controller) = controller(git);
        branches.initialize_night_session().await.unwrap();

        let task = Task::new("slow", TaskPriority::Low).with_id("T3");
        let decision = controller.evaluate_task_quality(&task, 0.4).await;
        assert_eq!(decision.quality_tier, QualityTier::Low);

        let executor: Arc<dyn TaskExecutor> = Arc::new(|task: Task| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ExecutionResult::failure(task.id, AgentType::LocalLlm, "unreachable"))
        });

        let result = controller
            .execute_with_quality_control(&task, &decision, executor, Duration::from_millis(50))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.errors.iter().any(|e| e.contains("timeout")));
        assert!((result.quality_score.overall - 0.0).abs() < f64::EPSILON);

        // Experimental rollback strategy deletes the branch
        let stats = branches.stats().await;
        assert_eq!(stats.branches_created, 2); // night-main + experimental
        assert_eq!(branches.active_branch_count().await, 1); // only night-main left

        let cstats = controller.stats().await;
        assert_eq!(cstats.failed_tasks, 1);
    }

    #[tokio::test]
    async fn review_approves_task_bearing_branches() {
        let (_dir, git) = init_repo();
        let (branches, controller) = controller(git);
        branches.initialize_night_session().await.unwrap();

        let task = Task::new("tweak", TaskPriority::Medium).with_id("T4");
        let decision = controller.evaluate_task_quality(&task, 0.72).await;
        controller
            .execute_with_quality_control(
                &task,
                &decision,
                echo_executor(0.72, "review_me.rs"),
                Duration::from_secs(30),
            )
            .await
            .unwrap();

        let results = controller.review_pending_branches().await;
        assert_eq!(results.branches_reviewed, 1);
        assert_eq!(results.approved_for_merge.len(), 1);

        // Reviewed entries leave the pending list
        assert!(controller.pending_reviews().await.is_empty());
    }

    #[tokio::test]
    async fn recommendations_flag_low_quality_history() {
        let (_dir, git) = init_repo();
        let (_branches, controller) = controller(git);

        for _ in 0..6 {
            controller.record_outcome(QualityTier::Low, true, 0.4).await;
        }

        let recommendations = controller.get_quality_recommendations().await;
        assert!(recommendations
            .iter()
            .any(|r| r.kind == "quality_improvement"));
        assert!(recommendations
            .iter()
            .any(|r| r.kind == "execution_strategy"));
    }
}
