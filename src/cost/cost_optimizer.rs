//! Free-first cost optimization
//!
//! Picks a service per task from the budget posture and task context. A
//! small rule engine runs in priority order; each rule may mutate the
//! decision state. Free services always exist as an option, so a
//! restricted selection can never come up empty.

use crate::cost::usage_tracker::{BudgetStatus, ServiceType};
use crate::models::{AgentType, Task};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityLevel {
    FreeOnly,
    FreePreferred,
    Balanced,
    Performance,
    Unlimited,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceOption {
    pub service: ServiceType,
    pub agent_type: AgentType,
    pub cost_estimate: f64,
    pub performance_score: f64,
    pub availability_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostEstimate {
    pub estimated_cost: f64,
    pub confidence: f64,
    pub token_estimate: u64,
}

/// Context the caller knows about the upcoming execution
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    pub estimated_tokens: u64,
    pub operation_type: String,
    pub urgency: Option<String>,
    pub quality_requirement: Option<String>,
    /// Set by the cost manager while emergency mode is active
    pub force_free_only: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationPlan {
    pub selected_service: ServiceType,
    pub selected_agent: AgentType,
    pub cost_estimate: CostEstimate,
    pub priority_level: PriorityLevel,
    pub rules_applied: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Mutable state the rules operate on
struct DecisionState {
    priority_level: PriorityLevel,
    options: Vec<ServiceOption>,
    selected: Option<ServiceOption>,
    budget_utilization: f64,
    free_tool_usage_rate: f64,
    rules_applied: Vec<String>,
}

type RuleCondition = Box<dyn Fn(&DecisionState) -> bool + Send + Sync>;
type RuleAction = Box<dyn Fn(&mut DecisionState) + Send + Sync>;

struct OptimizationRule {
    rule_id: &'static str,
    priority: i32,
    enabled: bool,
    condition: RuleCondition,
    action: RuleAction,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OptimizerStats {
    pub optimizations_performed: u64,
    pub free_tool_selections: u64,
    pub paid_tool_selections: u64,
    pub rules_applied: HashMap<String, u64>,
}

pub struct CostOptimizer {
    free_tool_target_rate: f64,
    /// Per-1k-token rates by (service, operation)
    service_rates: HashMap<(ServiceType, String), f64>,
    rules: Vec<OptimizationRule>,
    stats: std::sync::Mutex<OptimizerStats>,
}

impl CostOptimizer {
    pub fn new(free_tool_target_rate: f64) -> Self {
        let mut service_rates = HashMap::new();
        service_rates.insert(
            (ServiceType::OpenAiApi, "chat_completion".to_string()),
            0.002,
        );
        service_rates.insert((ServiceType::OpenAiApi, "embedding".to_string()), 0.0001);
        service_rates.insert(
            (ServiceType::ClaudeApi, "chat_completion".to_string()),
            0.003,
        );
        service_rates.insert((ServiceType::ClaudeApi, "analysis".to_string()), 0.003);
        service_rates.insert((ServiceType::LocalLlm, "chat_completion".to_string()), 0.0);
        service_rates.insert((ServiceType::GithubApi, "api_request".to_string()), 0.0);

        Self {
            free_tool_target_rate,
            service_rates,
            rules: Self::default_rules(free_tool_target_rate),
            stats: std::sync::Mutex::new(OptimizerStats::default()),
        }
    }

    /// Choose a service for the task given the current budget posture.
    pub fn optimize_task_execution(
        &self,
        task: &Task,
        context: &TaskContext,
        budget_status: &BudgetStatus,
    ) -> OptimizationPlan {
        debug!("Optimizing execution for task: {}", task.id);

        let priority_level = if context.force_free_only {
            PriorityLevel::FreeOnly
        } else {
            self.determine_priority_level(budget_status, context)
        };

        let options = self.evaluate_service_options(context, priority_level);

        let mut state = DecisionState {
            priority_level,
            options,
            selected: None,
            budget_utilization: budget_status.budget_utilization,
            free_tool_usage_rate: budget_status.free_tool_usage_rate,
            rules_applied: Vec::new(),
        };

        for rule in &self.rules {
            if !rule.enabled {
                continue;
            }
            if (rule.condition)(&state) {
                debug!("Applying optimization rule: {}", rule.rule_id);
                (rule.action)(&mut state);
                state.rules_applied.push(rule.rule_id.to_string());
            }
        }

        // Fallback selection when no rule decided
        if state.selected.is_none() {
            state.selected = match state.priority_level {
                PriorityLevel::FreeOnly | PriorityLevel::FreePreferred => state
                    .options
                    .iter()
                    .find(|o| o.cost_estimate == 0.0)
                    .or(state.options.first())
                    .cloned(),
                PriorityLevel::Performance | PriorityLevel::Unlimited => state
                    .options
                    .iter()
                    .max_by(|a, b| a.performance_score.total_cmp(&b.performance_score))
                    .cloned(),
                PriorityLevel::Balanced => state
                    .options
                    .iter()
                    .max_by(|a, b| {
                        balanced_score(a).total_cmp(&balanced_score(b))
                    })
                    .cloned(),
            };
        }

        let selected = state.selected.unwrap_or_else(|| local_llm_option());

        {
            let mut stats = self
                .stats
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            stats.optimizations_performed += 1;
            if selected.cost_estimate == 0.0 {
                stats.free_tool_selections += 1;
            } else {
                stats.paid_tool_selections += 1;
            }
            for rule in &state.rules_applied {
                *stats.rules_applied.entry(rule.clone()).or_insert(0) += 1;
            }
        }

        let recommendations =
            self.generate_recommendations(budget_status, state.free_tool_usage_rate);

        OptimizationPlan {
            selected_agent: selected.agent_type,
            cost_estimate: CostEstimate {
                estimated_cost: selected.cost_estimate,
                confidence: 0.8,
                token_estimate: context.estimated_tokens,
            },
            selected_service: selected.service,
            priority_level: state.priority_level,
            rules_applied: state.rules_applied,
            recommendations,
        }
    }

    pub fn stats(&self) -> OptimizerStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn determine_priority_level(
        &self,
        budget_status: &BudgetStatus,
        context: &TaskContext,
    ) -> PriorityLevel {
        if budget_status.budget_utilization >= 0.95 {
            return PriorityLevel::FreeOnly;
        }
        if budget_status.budget_utilization >= 0.8 {
            return PriorityLevel::FreePreferred;
        }
        if budget_status.free_tool_usage_rate < self.free_tool_target_rate - 0.1 {
            return PriorityLevel::FreePreferred;
        }
        if context.urgency.as_deref() == Some("high")
            || context.quality_requirement.as_deref() == Some("high")
        {
            return PriorityLevel::Performance;
        }
        PriorityLevel::Balanced
    }

    fn evaluate_service_options(
        &self,
        context: &TaskContext,
        priority_level: PriorityLevel,
    ) -> Vec<ServiceOption> {
        let mut options = vec![local_llm_option()];

        if priority_level != PriorityLevel::FreeOnly {
            options.push(ServiceOption {
                service: ServiceType::ClaudeApi,
                agent_type: AgentType::ClaudeCode,
                cost_estimate: self.estimate_api_cost(ServiceType::ClaudeApi, context),
                performance_score: 0.95,
                availability_score: 0.95,
            });
            options.push(ServiceOption {
                service: ServiceType::OpenAiApi,
                agent_type: AgentType::OpenAiCodex,
                cost_estimate: self.estimate_api_cost(ServiceType::OpenAiApi, context),
                performance_score: 0.92,
                availability_score: 0.98,
            });
        }

        if priority_level == PriorityLevel::FreePreferred {
            options.sort_by(|a, b| {
                (a.cost_estimate > 0.0)
                    .cmp(&(b.cost_estimate > 0.0))
                    .then(a.cost_estimate.total_cmp(&b.cost_estimate))
            });
        }

        options
    }

    /// `(tokens / 1000) x per-1k rate` for the context's operation.
    fn estimate_api_cost(&self, service: ServiceType, context: &TaskContext) -> f64 {
        let tokens = if context.estimated_tokens > 0 {
            context.estimated_tokens
        } else {
            1000
        };
        let operation = if context.operation_type.is_empty() {
            "chat_completion"
        } else {
            context.operation_type.as_str()
        };
        let rate = self
            .service_rates
            .get(&(service, operation.to_string()))
            .copied()
            .unwrap_or(0.002);
        (tokens as f64 / 1000.0) * rate
    }

    fn generate_recommendations(
        &self,
        budget_status: &BudgetStatus,
        free_rate: f64,
    ) -> Vec<String> {
        let mut recommendations = Vec::new();
        if budget_status.budget_utilization > 0.8 {
            recommendations
                .push("Budget utilization above 80%: prefer free tools".to_string());
        }
        if free_rate < self.free_tool_target_rate {
            recommendations.push(format!(
                "Free-tool usage rate {:.0}% below target {:.0}%",
                free_rate * 100.0,
                self.free_tool_target_rate * 100.0
            ));
        }
        recommendations
    }

    fn default_rules(free_tool_target_rate: f64) -> Vec<OptimizationRule> {
        let mut rules = vec![
            // Budget limit: at >=95% utilization only free options remain
            OptimizationRule {
                rule_id: "budget_limit_free_only",
                priority: 100,
                enabled: true,
                condition: Box::new(|state| state.budget_utilization >= 0.95),
                action: Box::new(|state| {
                    state.options.retain(|o| o.cost_estimate == 0.0);
                    state.selected = state.options.first().cloned();
                }),
            },
            // Performance priority: pick the highest performance score
            OptimizationRule {
                rule_id: "performance_priority",
                priority: 90,
                enabled: true,
                condition: Box::new(|state| {
                    state.priority_level == PriorityLevel::Performance
                }),
                action: Box::new(|state| {
                    state.selected = state
                        .options
                        .iter()
                        .max_by(|a, b| a.performance_score.total_cmp(&b.performance_score))
                        .cloned();
                }),
            },
            // Free-rate improvement: prefer free while under target
            OptimizationRule {
                rule_id: "free_rate_improvement",
                priority: 80,
                enabled: true,
                condition: Box::new(move |state| {
                    state.free_tool_usage_rate < free_tool_target_rate
                        && state.priority_level != PriorityLevel::Performance
                        && state.selected.is_none()
                }),
                action: Box::new(|state| {
                    state.selected = state
                        .options
                        .iter()
                        .find(|o| o.cost_estimate == 0.0)
                        .cloned();
                }),
            },
        ];

        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        rules
    }
}

fn local_llm_option() -> ServiceOption {
    ServiceOption {
        service: ServiceType::LocalLlm,
        agent_type: AgentType::LocalLlm,
        cost_estimate: 0.0,
        performance_score: 0.7,
        availability_score: 0.9,
    }
}

fn balanced_score(option: &ServiceOption) -> f64 {
    // Cheap and performant both count; cost dominates near the budget
    option.performance_score * 0.6 + option.availability_score * 0.2
        - option.cost_estimate * 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskPriority;

    fn budget(utilization: f64, free_rate: f64) -> BudgetStatus {
        BudgetStatus {
            monthly_budget: 10.0,
            current_spend: utilization * 10.0,
            remaining_budget: 10.0 - utilization * 10.0,
            budget_utilization: utilization,
            days_remaining: 10,
            daily_budget_remaining: 0.5,
            free_tool_usage_rate: free_rate,
            on_track: true,
            alert_status: "normal".to_string(),
        }
    }

    fn context(tokens: u64) -> TaskContext {
        TaskContext {
            estimated_tokens: tokens,
            operation_type: "chat_completion".to_string(),
            ..TaskContext::default()
        }
    }

    #[test]
    fn budget_at_95_percent_forces_free_service() {
        let optimizer = CostOptimizer::new(0.9);
        let task = Task::new("anything", TaskPriority::Medium);

        let plan =
            optimizer.optimize_task_execution(&task, &context(2000), &budget(0.95, 0.9));
        assert_eq!(plan.selected_service, ServiceType::LocalLlm);
        assert!((plan.cost_estimate.estimated_cost - 0.0).abs() < f64::EPSILON);
        assert_eq!(plan.priority_level, PriorityLevel::FreeOnly);
        assert!(plan
            .rules_applied
            .contains(&"budget_limit_free_only".to_string()));
    }

    #[test]
    fn performance_context_selects_best_performer() {
        let optimizer = CostOptimizer::new(0.9);
        let task = Task::new("urgent", TaskPriority::Critical);
        let ctx = TaskContext {
            urgency: Some("high".to_string()),
            ..context(1000)
        };

        let plan = optimizer.optimize_task_execution(&task, &ctx, &budget(0.2, 0.95));
        assert_eq!(plan.priority_level, PriorityLevel::Performance);
        assert_eq!(plan.selected_service, ServiceType::ClaudeApi);
        assert!(plan.cost_estimate.estimated_cost > 0.0);
    }

    #[test]
    fn low_free_rate_prefers_free() {
        let optimizer = CostOptimizer::new(0.9);
        let task = Task::new("routine", TaskPriority::Medium);

        // Free rate well under target - 0.1
        let plan = optimizer.optimize_task_execution(&task, &context(1000), &budget(0.2, 0.5));
        assert_eq!(plan.priority_level, PriorityLevel::FreePreferred);
        assert_eq!(plan.selected_service, ServiceType::LocalLlm);
    }

    #[test]
    fn forced_free_only_overrides_context() {
        let optimizer = CostOptimizer::new(0.9);
        let task = Task::new("urgent but broke", TaskPriority::Critical);
        let ctx = TaskContext {
            urgency: Some("high".to_string()),
            force_free_only: true,
            ..context(2000)
        };

        let plan = optimizer.optimize_task_execution(&task, &ctx, &budget(0.99, 0.9));
        assert_eq!(plan.selected_service, ServiceType::LocalLlm);
        assert!((plan.cost_estimate.estimated_cost - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cost_estimate_scales_with_tokens() {
        let optimizer = CostOptimizer::new(0.9);
        let ctx = context(2000);
        let cost = optimizer.estimate_api_cost(ServiceType::OpenAiApi, &ctx);
        assert!((cost - 0.004).abs() < 1e-9); // 2 x 0.002

        let cost = optimizer.estimate_api_cost(ServiceType::ClaudeApi, &ctx);
        assert!((cost - 0.006).abs() < 1e-9); // 2 x 0.003
    }

    #[test]
    fn stats_track_selections() {
        let optimizer = CostOptimizer::new(0.9);
        let task = Task::new("t", TaskPriority::Medium);

        optimizer.optimize_task_execution(&task, &context(1000), &budget(0.95, 0.9));
        optimizer.optimize_task_execution(&task, &context(1000), &budget(0.2, 0.95));

        let stats = optimizer.stats();
        assert_eq!(stats.optimizations_performed, 2);
        assert!(stats.free_tool_selections >= 1);
    }
}
