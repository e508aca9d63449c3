//! Cost management facade
//!
//! Combines the usage tracker and the cost optimizer, and owns the budget
//! emergency mode: activated when utilization reaches 98%, deactivated
//! once it falls back under 95%. While active, every optimization is
//! forced onto free services. A budget emergency never stops the
//! scheduler.

pub mod cost_optimizer;
pub mod usage_tracker;

use crate::config::CostConfig;
use crate::constants::{BUDGET_EMERGENCY_OFF, BUDGET_EMERGENCY_ON};
use crate::events::{EventBus, SystemEvent};
use crate::models::{ExecutionResult, Task};
use crate::Result;
use cost_optimizer::{CostOptimizer, OptimizationPlan, TaskContext};
use serde::Serialize;
use std::path::Path;
use tokio::sync::Mutex;
use usage_tracker::{BudgetStatus, ServiceType, UsageTracker};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CostManagerStats {
    pub tasks_optimized: u64,
    pub emergency_activations: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostReport {
    pub budget_status: BudgetStatus,
    pub emergency_mode: bool,
    pub optimizer_stats: cost_optimizer::OptimizerStats,
    pub manager_stats: CostManagerStats,
}

pub struct CostManager {
    tracker: UsageTracker,
    optimizer: CostOptimizer,
    events: EventBus,
    emergency_mode: Mutex<bool>,
    stats: Mutex<CostManagerStats>,
}

impl CostManager {
    pub fn new(project_path: &Path, config: &CostConfig, events: EventBus) -> Self {
        let storage_path = if config.storage_path.is_absolute() {
            config.storage_path.clone()
        } else {
            project_path.join(&config.storage_path)
        };

        Self {
            tracker: UsageTracker::new(
                storage_path,
                config.monthly_budget,
                config.alert_thresholds.clone(),
                events.clone(),
            ),
            optimizer: CostOptimizer::new(config.free_tool_target_rate),
            events,
            emergency_mode: Mutex::new(false),
            stats: Mutex::new(CostManagerStats::default()),
        }
    }

    /// Pick a service plan for the task. In emergency mode the context is
    /// forced to free-only before the rules run; on tracker failure the
    /// plan falls back to the local LLM.
    pub async fn optimize_task_execution(
        &self,
        task: &Task,
        mut context: TaskContext,
    ) -> OptimizationPlan {
        debug!("Cost optimization for task: {}", task.id);

        if *self.emergency_mode.lock().await {
            context.force_free_only = true;
        }

        let budget_status = match self.tracker.get_budget_status().await {
            Ok(status) => status,
            Err(e) => {
                error!("Budget status unavailable, falling back to free plan: {}", e);
                return fallback_plan(&context);
            }
        };

        let plan = self
            .optimizer
            .optimize_task_execution(task, &context, &budget_status);
        self.stats.lock().await.tasks_optimized += 1;
        plan
    }

    /// Record the cost of a finished execution and re-evaluate emergency
    /// mode.
    pub async fn record_task_execution(
        &self,
        task: &Task,
        result: &ExecutionResult,
    ) -> Result<()> {
        let service = ServiceType::for_agent(result.agent_used);
        let tokens = result
            .metadata
            .get("tokens_used")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        self.tracker
            .record_usage(
                service,
                "task_execution",
                result.cost_incurred,
                tokens,
                Some(task.id.clone()),
            )
            .await?;

        self.check_emergency_mode().await?;
        Ok(())
    }

    /// Record non-task usage (analysis passes, knowledge lookups).
    pub async fn record_usage(
        &self,
        service: ServiceType,
        operation: &str,
        cost: f64,
        tokens: u64,
    ) -> Result<()> {
        self.tracker
            .record_usage(service, operation, cost, tokens, None)
            .await?;
        self.check_emergency_mode().await?;
        Ok(())
    }

    pub async fn emergency_mode_active(&self) -> bool {
        *self.emergency_mode.lock().await
    }

    pub async fn get_budget_status(&self) -> Result<BudgetStatus> {
        self.tracker.get_budget_status().await
    }

    pub async fn get_cost_report(&self) -> Result<CostReport> {
        Ok(CostReport {
            budget_status: self.tracker.get_budget_status().await?,
            emergency_mode: *self.emergency_mode.lock().await,
            optimizer_stats: self.optimizer.stats(),
            manager_stats: self.stats.lock().await.clone(),
        })
    }

    pub fn tracker(&self) -> &UsageTracker {
        &self.tracker
    }

    async fn check_emergency_mode(&self) -> Result<()> {
        let status = self.tracker.get_budget_status().await?;
        let mut emergency = self.emergency_mode.lock().await;

        if status.budget_utilization >= BUDGET_EMERGENCY_ON && !*emergency {
            *emergency = true;
            self.stats.lock().await.emergency_activations += 1;
            warn!(
                "Budget emergency mode ACTIVATED at {:.1}% utilization",
                status.budget_utilization * 100.0
            );
            self.events.publish(SystemEvent::BudgetAlert {
                threshold: BUDGET_EMERGENCY_ON,
                utilization: status.budget_utilization,
                emergency: true,
            });
        } else if status.budget_utilization < BUDGET_EMERGENCY_OFF && *emergency {
            *emergency = false;
            info!(
                "Budget emergency mode deactivated at {:.1}% utilization",
                status.budget_utilization * 100.0
            );
        }
        Ok(())
    }
}

fn fallback_plan(context: &TaskContext) -> OptimizationPlan {
    OptimizationPlan {
        selected_service: ServiceType::LocalLlm,
        selected_agent: crate::models::AgentType::LocalLlm,
        cost_estimate: cost_optimizer::CostEstimate {
            estimated_cost: 0.0,
            confidence: 0.0,
            token_estimate: context.estimated_tokens,
        },
        priority_level: cost_optimizer::PriorityLevel::FreeOnly,
        rules_applied: Vec::new(),
        recommendations: vec!["Cost data unavailable: using free local execution".to_string()],
    }
}
